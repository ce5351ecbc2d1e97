//! Secret redaction as a hook consumer
//!
//! - `SecretMasker` - Masks known secrets and credential-shaped text
//! - `SecretResolver` - Resolves `{{secret:NAME}}` placeholders
//! - `SecretRedactionHook` - Wires both into the lifecycle hook pipeline

mod mask;
mod resolve;

pub use mask::{SecretMasker, REDACTED};
pub use resolve::{ResolveOutcome, SecretResolver, UNKNOWN_SECRET};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::hooks::{HookEvent, HookHandler, HookName, HookRegistration, HookRegistry, RegisterOptions};

/// Priority of placeholder resolution, ahead of every default handler
pub const RESOLVE_PRIORITY: i32 = -100;
/// Priority of output masking, after instrumentation and before publishing
pub const MASK_PRIORITY: i32 = 100;

/// Hooks whose payload leaves the process and must be masked
pub const MASKED_HOOKS: &[HookName] = &[
    HookName::AfterPrompt,
    HookName::AfterTool,
    HookName::StreamChunk,
    HookName::FormatError,
    HookName::RunEnd,
];

/// Resolves placeholders in tool arguments just before execution and masks
/// every outbound string afterwards.
#[derive(Debug, Clone, Default)]
pub struct SecretRedactionHook {
    masker: SecretMasker,
    resolver: SecretResolver,
}

impl SecretRedactionHook {
    /// Build from a provider id to secret value mapping
    pub fn new(secrets: &HashMap<String, String>) -> Self {
        Self {
            masker: SecretMasker::new(secrets.values()),
            resolver: SecretResolver::new(secrets.iter().map(|(k, v)| (k, v.clone()))),
        }
    }

    pub fn masker(&self) -> &SecretMasker {
        &self.masker
    }

    pub fn resolver(&self) -> &SecretResolver {
        &self.resolver
    }

    /// Register on `BeforeTool` for resolution and on every masked hook
    pub fn install(self: Arc<Self>, registry: &HookRegistry) -> Vec<HookRegistration> {
        let mut registrations = vec![registry.register(
            HookName::BeforeTool,
            Arc::clone(&self) as Arc<dyn HookHandler>,
            RegisterOptions::priority(RESOLVE_PRIORITY).with_id("secrets.resolve"),
        )];
        registrations.extend(registry.register_many(
            MASKED_HOOKS,
            self,
            RegisterOptions::priority(MASK_PRIORITY).with_id("secrets.mask"),
        ));
        registrations
    }
}

#[async_trait]
impl HookHandler for SecretRedactionHook {
    async fn handle(&self, event: &mut HookEvent) -> anyhow::Result<()> {
        match event {
            HookEvent::BeforeTool(tool) => {
                let outcome = self.resolver.resolve_value(&mut tool.arguments);
                if !outcome.missing.is_empty() {
                    tracing::warn!(
                        tool = %tool.tool_id,
                        missing = ?outcome.missing,
                        "Unknown secret placeholders in tool arguments"
                    );
                }
            }
            HookEvent::BeforePrompt(_) => {}
            other => other.for_each_outbound_text(|text| {
                self.masker.mask_in_place(text);
            }),
        }
        Ok(())
    }
}
