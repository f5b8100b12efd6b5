//! The surface the host consumes from the embedding gateway.
//!
//! While a plugin handles an event it may call back into the gateway's
//! PDK; the host forwards those calls through [`Pdk::call_pdk_method`].
//! For the detached `log` phase the gateway also supplies a snapshot of
//! the per-request state the plugin may later read, captured before the
//! response is released.

use async_trait::async_trait;
use rmpv::Value;
use thiserror::Error;

/// A PDK method raised inside the gateway. The message is forwarded to
/// the plugin in a `StepError` continuation; the plugin decides what to
/// do with it.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct PdkError(pub String);

/// Dispatcher for the gateway callbacks a plugin may invoke mid-event.
#[async_trait]
pub trait Pdk: Send + Sync {
    /// Invoke the named PDK method with the argument list the plugin sent.
    async fn call_pdk_method(&self, method: &str, args: Value) -> Result<Value, PdkError>;

    /// Per-request state for the deferred `log` phase: the serialized log
    /// record plus the request-local and shared context maps.
    fn log_snapshot(&self) -> LogSnapshot {
        LogSnapshot::default()
    }
}

/// Request state frozen at `log`-phase scheduling time, readable by PDK
/// methods that run after the response has been sent.
#[derive(Debug, Clone, Default)]
pub struct LogSnapshot {
    pub serialized: serde_json::Value,
    pub ctx: serde_json::Value,
    pub shared_ctx: serde_json::Value,
}
