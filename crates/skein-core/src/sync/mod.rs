//! Per-channel state synchronization
//!
//! Every channel carries a current snapshot, a strictly increasing sequence
//! number and a bounded ring of past events. Consumers resume with
//! [`StateSyncService::get_events_since`] as long as their cursor is still
//! inside the retained window; otherwise they fall back to the snapshot.

mod stream;

pub use stream::{SyncFrame, SyncStream};

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{StateSyncConfig, EVENTS_PER_CHANNEL_CAP};

pub const DEFAULT_STATUS: &str = "idle";

/// One published state change. Serialized as the wire frame
/// `{channel, seq, version, type, status, timestamp, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub channel: String,
    pub seq: u64,
    pub version: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// Current state of a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub channel: String,
    pub seq: u64,
    pub version: u64,
    pub status: String,
    pub updated_at: DateTime<Utc>,
    pub payload: Value,
}

impl ChannelSnapshot {
    fn empty(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            seq: 0,
            version: 0,
            status: DEFAULT_STATUS.to_string(),
            updated_at: Utc::now(),
            payload: Value::Object(Default::default()),
        }
    }
}

pub type SyncListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct Channel {
    snapshot: ChannelSnapshot,
    history: VecDeque<SyncEvent>,
}

impl Channel {
    fn new(name: &str) -> Self {
        Self {
            snapshot: ChannelSnapshot::empty(name),
            history: VecDeque::new(),
        }
    }
}

struct Inner {
    channels: Mutex<HashMap<String, Channel>>,
    listeners: RwLock<HashMap<String, Vec<(u64, SyncListener)>>>,
    // Held across state update and listener delivery so every listener
    // observes a channel's events in seq order. Reentrant so a listener may publish.
    delivery: ReentrantMutex<()>,
    next_listener: AtomicU64,
    max_events: usize,
}

impl Inner {
    fn remove_listener(&self, channel: &str, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let Some(bucket) = listeners.get_mut(channel) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|(existing, _)| *existing != id);
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            listeners.remove(channel);
        }
        removed
    }
}

/// Shared handle to all channels. Cloning is cheap.
#[derive(Clone)]
pub struct StateSyncService {
    inner: Arc<Inner>,
}

impl Default for StateSyncService {
    fn default() -> Self {
        Self::new(StateSyncConfig::default().max_events_per_channel)
    }
}

impl std::fmt::Debug for StateSyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSyncService")
            .field("channels", &self.inner.channels.lock().len())
            .field("max_events", &self.inner.max_events)
            .finish()
    }
}

impl StateSyncService {
    /// `max_events` caps the retained history per channel
    pub fn new(max_events: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: Mutex::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                delivery: ReentrantMutex::new(()),
                next_listener: AtomicU64::new(1),
                max_events: max_events.clamp(1, EVENTS_PER_CHANNEL_CAP),
            }),
        }
    }

    pub fn from_config(config: &StateSyncConfig) -> Self {
        Self::new(config.max_events_per_channel)
    }

    pub fn max_events(&self) -> usize {
        self.inner.max_events
    }

    /// Record a new event on `channel` and deliver it to every listener.
    ///
    /// `status` of `None` keeps the channel's current status.
    pub fn publish(
        &self,
        channel: &str,
        event_type: &str,
        payload: Value,
        status: Option<&str>,
    ) -> SyncEvent {
        let _delivery = self.inner.delivery.lock();

        let event = {
            let mut channels = self.inner.channels.lock();
            let state = channels
                .entry(channel.to_string())
                .or_insert_with(|| Channel::new(channel));

            let now = Utc::now();
            let snapshot = &mut state.snapshot;
            snapshot.seq += 1;
            snapshot.version += 1;
            if let Some(status) = status {
                snapshot.status = status.to_string();
            }
            snapshot.updated_at = now;
            snapshot.payload = payload.clone();

            let event = SyncEvent {
                channel: channel.to_string(),
                seq: snapshot.seq,
                version: snapshot.version,
                event_type: event_type.to_string(),
                status: snapshot.status.clone(),
                timestamp: now,
                payload,
            };
            state.history.push_back(event.clone());
            while state.history.len() > self.inner.max_events {
                state.history.pop_front();
            }
            event
        };

        let listeners: Vec<SyncListener> = self
            .inner
            .listeners
            .read()
            .get(channel)
            .map(|bucket| bucket.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in listeners {
            // A panicking listener must not stop delivery to the rest.
            let _ = std::panic::catch_unwind(AssertUnwindSafe(|| listener(&event)));
        }

        event
    }

    /// Current snapshot, creating the channel at `seq = 0` if unseen
    pub fn get_snapshot(&self, channel: &str) -> ChannelSnapshot {
        self.inner
            .channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| Channel::new(channel))
            .snapshot
            .clone()
    }

    /// Retained events with `since < seq <= since + limit`, ascending.
    ///
    /// Events evicted from the ring are not replaced by later ones, so a
    /// cursor that fell out of the window gets a short or empty page.
    pub fn get_events_since(&self, channel: &str, since: u64, limit: usize) -> Vec<SyncEvent> {
        let channels = self.inner.channels.lock();
        let Some(state) = channels.get(channel) else {
            return Vec::new();
        };
        // History is ordered by seq, so skip straight past the cursor.
        let start = state.history.partition_point(|event| event.seq <= since);
        let end = since.saturating_add(limit as u64);
        state
            .history
            .iter()
            .skip(start)
            .take_while(|event| event.seq <= end)
            .cloned()
            .collect()
    }

    /// Lowest seq still retained for `channel`, if any history is left
    pub fn earliest_retained_seq(&self, channel: &str) -> Option<u64> {
        self.inner
            .channels
            .lock()
            .get(channel)
            .and_then(|state| state.history.front().map(|event| event.seq))
    }

    /// Register `listener` for every future event on `channel`
    pub fn subscribe<F>(&self, channel: &str, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .entry(channel.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            channel: channel.to_string(),
            id,
            active: AtomicBool::new(true),
        }
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.inner.listeners.read().get(channel).map_or(0, Vec::len)
    }

    /// Snapshots of every known channel, ordered by name
    pub fn list_channels(&self) -> Vec<ChannelSnapshot> {
        let mut channels: Vec<ChannelSnapshot> = self
            .inner
            .channels
            .lock()
            .values()
            .map(|state| state.snapshot.clone())
            .collect();
        channels.sort_by(|a, b| a.channel.cmp(&b.channel));
        channels
    }

    /// Forget one channel's state and history, or every channel's.
    /// Listeners stay subscribed; the next reference restarts at `seq = 0`.
    pub fn clear(&self, channel: Option<&str>) {
        let _delivery = self.inner.delivery.lock();
        let mut channels = self.inner.channels.lock();
        match channel {
            Some(channel) => {
                channels.remove(channel);
            }
            None => channels.clear(),
        }
    }

    /// Snapshot followed by every later event, as a stream.
    /// Dropping the stream unsubscribes.
    pub fn stream(&self, channel: &str) -> SyncStream {
        // No publish can slip in between the snapshot and the subscription.
        let _delivery = self.inner.delivery.lock();
        let snapshot = self.get_snapshot(channel);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = self.subscribe(channel, move |event| {
            let _ = tx.send(SyncFrame::Event(event.clone()));
        });
        SyncStream::new(snapshot, rx, subscription)
    }
}

/// Handle returned by [`StateSyncService::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    inner: Weak<Inner>,
    channel: String,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Remove the listener. Only the first call has effect.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.remove_listener(&self.channel, self.id))
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seqs(events: &[SyncEvent]) -> Vec<u64> {
        events.iter().map(|e| e.seq).collect()
    }

    #[test]
    fn publish_numbers_events_without_gaps() {
        let sync = StateSyncService::new(300);
        for i in 0..5 {
            let event = sync.publish("chat", "message", json!({ "i": i }), Some("running"));
            assert_eq!(event.seq, i + 1);
            assert_eq!(event.version, i + 1);
        }

        let snapshot = sync.get_snapshot("chat");
        assert_eq!(snapshot.seq, 5);
        assert_eq!(snapshot.status, "running");
        assert_eq!(snapshot.payload, json!({ "i": 4 }));
    }

    #[test]
    fn status_is_sticky_when_not_given() {
        let sync = StateSyncService::default();
        sync.publish("c", "start", json!({}), Some("running"));
        let event = sync.publish("c", "progress", json!({}), None);
        assert_eq!(event.status, "running");
        assert_eq!(sync.get_snapshot("fresh").status, DEFAULT_STATUS);
    }

    #[test]
    fn events_since_is_ascending_and_bounded() {
        let sync = StateSyncService::new(300);
        for _ in 0..10 {
            sync.publish("c", "tick", json!({}), None);
        }
        assert_eq!(seqs(&sync.get_events_since("c", 3, 4)), vec![4, 5, 6, 7]);
        assert_eq!(seqs(&sync.get_events_since("c", 8, 100)), vec![9, 10]);
        assert!(sync.get_events_since("c", 10, 5).is_empty());
        assert!(sync.get_events_since("c", 3, 0).is_empty());
        assert!(sync.get_events_since("unknown", 0, 5).is_empty());
    }

    #[test]
    fn ring_drops_oldest_beyond_cap() {
        let sync = StateSyncService::new(3);
        for _ in 0..7 {
            sync.publish("c", "tick", json!({}), None);
        }
        assert_eq!(sync.earliest_retained_seq("c"), Some(5));
        assert_eq!(seqs(&sync.get_events_since("c", 0, 100)), vec![5, 6, 7]);
        assert_eq!(seqs(&sync.get_events_since("c", 5, 100)), vec![6, 7]);
        assert_eq!(seqs(&sync.get_events_since("c", 2, 4)), vec![5, 6]);
        assert!(sync.get_events_since("c", 0, 3).is_empty());
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let sync = StateSyncService::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _bad = sync.subscribe("c", |_| panic!("listener bug"));
        let sink = Arc::clone(&seen);
        let _good = sync.subscribe("c", move |event| sink.lock().push(event.seq));
        let _other = sync.subscribe("other", |_| panic!("wrong channel"));

        sync.publish("c", "a", json!({}), None);
        sync.publish("c", "b", json!({}), None);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_drop_unsubscribes() {
        let sync = StateSyncService::default();
        let first = sync.subscribe("c", |_| {});
        {
            let _second = sync.subscribe("c", |_| {});
            assert_eq!(sync.listener_count("c"), 2);
        }
        assert_eq!(sync.listener_count("c"), 1);
        assert!(first.unsubscribe());
        assert!(!first.unsubscribe());
        assert_eq!(sync.listener_count("c"), 0);
    }

    #[test]
    fn clear_resets_sequence_but_keeps_listeners() {
        let sync = StateSyncService::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = sync.subscribe("a", move |event| sink.lock().push(event.seq));

        sync.publish("a", "x", json!({}), None);
        sync.publish("a", "x", json!({}), None);
        sync.publish("b", "x", json!({}), None);

        sync.clear(Some("a"));
        let names: Vec<String> = sync.list_channels().into_iter().map(|c| c.channel).collect();
        assert_eq!(names, vec!["b".to_string()]);

        sync.publish("a", "x", json!({}), None);
        assert_eq!(*seen.lock(), vec![1, 2, 1]);

        sync.clear(None);
        assert!(sync.list_channels().is_empty());
    }

    #[test]
    fn event_serializes_as_wire_frame() {
        let sync = StateSyncService::default();
        let event = sync.publish("c", "update", json!({ "k": "v" }), Some("ok"));
        let value = serde_json::to_value(&event).expect("serialize");
        for field in ["channel", "seq", "version", "type", "status", "timestamp", "payload"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert_eq!(value["type"], "update");
    }
}
