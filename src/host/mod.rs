//! Boundary to the external content-editing host.
//!
//! Handlers never talk to a host directly; they go through [`HostAdapter`],
//! which reports unreachability and domain failures as distinct
//! [`HostError`] variants.

pub mod command;
pub mod local;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use crate::error::HostError;
pub use command::CommandHost;
pub use local::LocalHost;

use crate::settings::HostAdapterConfig;

#[async_trait]
pub trait HostAdapter: Send + Sync {
    /// Short adapter name reported by `system.version`.
    fn name(&self) -> &'static str;

    /// Run one named host operation against an optional project file.
    async fn invoke(
        &self,
        operation: &str,
        project: Option<&Path>,
        params: Value,
    ) -> Result<Value, HostError>;
}

/// Build the adapter selected in settings.
pub fn build_host(config: &HostAdapterConfig) -> Arc<dyn HostAdapter> {
    match config {
        HostAdapterConfig::Local => Arc::new(LocalHost::new()),
        HostAdapterConfig::Command {
            program,
            args,
            timeout_ms,
        } => Arc::new(CommandHost::new(
            program.clone(),
            args.clone(),
            std::time::Duration::from_millis(*timeout_ms),
        )),
    }
}
