//! Stream adapter for server-push transports

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{ChannelSnapshot, Subscription, SyncEvent};

/// One frame of a channel stream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SyncFrame {
    Snapshot(ChannelSnapshot),
    Event(SyncEvent),
}

impl SyncFrame {
    /// Name used for the SSE `event:` field
    pub fn kind(&self) -> &'static str {
        match self {
            SyncFrame::Snapshot(_) => "snapshot",
            SyncFrame::Event(_) => "update",
        }
    }
}

/// Current snapshot first, then every event published afterwards
pub struct SyncStream {
    snapshot: Option<ChannelSnapshot>,
    frames: UnboundedReceiverStream<SyncFrame>,
    subscription: Subscription,
}

impl SyncStream {
    pub(super) fn new(
        snapshot: ChannelSnapshot,
        rx: UnboundedReceiver<SyncFrame>,
        subscription: Subscription,
    ) -> Self {
        Self {
            snapshot: Some(snapshot),
            frames: UnboundedReceiverStream::new(rx),
            subscription,
        }
    }

    pub fn channel(&self) -> &str {
        self.subscription.channel()
    }
}

impl Stream for SyncStream {
    type Item = SyncFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(snapshot) = self.snapshot.take() {
            return Poll::Ready(Some(SyncFrame::Snapshot(snapshot)));
        }
        Pin::new(&mut self.frames).poll_next(cx)
    }
}

impl std::fmt::Debug for SyncStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStream")
            .field("channel", &self.channel())
            .finish()
    }
}
