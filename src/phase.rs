//! Gateway-facing phase entrypoints.
//!
//! `load_plugin` hands the gateway a [`PluginFacade`] with one callable
//! per phase in the plugin's descriptor. Non-log phases run inline. The
//! `log` phase must let the gateway answer the client first, so it is
//! detached onto its own task carrying a snapshot of the request state;
//! the snapshot is bound to the task identity so PDK dispatch can find it
//! after the request is gone.

use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::task;
use tracing::{error, warn};

use crate::bridge;
use crate::descriptor::PluginDescriptor;
use crate::error::HostError;
use crate::gateway::{LogSnapshot, Pdk};
use crate::registry::InstanceRegistry;

/// Stages of the request pipeline an external plugin may attend.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumString,
    AsRefStr,
    Display,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Certificate,
    Rewrite,
    Access,
    HeaderFilter,
    BodyFilter,
    Log,
}

/// Log-phase snapshots keyed by the deferred task that owns them. Entries
/// live exactly as long as their task's conversation.
static LOG_SNAPSHOTS: LazyLock<DashMap<task::Id, LogSnapshot>> = LazyLock::new(DashMap::new);

/// The snapshot bound to the current task, if any. The gateway's PDK
/// dispatcher calls this when servicing callbacks from a deferred log
/// conversation.
pub fn current_log_snapshot() -> Option<LogSnapshot> {
    task::try_id().and_then(|id| LOG_SNAPSHOTS.get(&id).map(|entry| entry.clone()))
}

/// Unbinds the snapshot on every exit path, panics included.
struct SnapshotGuard(task::Id);

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        LOG_SNAPSHOTS.remove(&self.0);
    }
}

fn bind_snapshot(snapshot: LogSnapshot) -> SnapshotGuard {
    let id = task::id();
    LOG_SNAPSHOTS.insert(id, snapshot);
    SnapshotGuard(id)
}

/// What `load_plugin` returns: the per-phase surface for one plugin.
#[derive(Clone)]
pub struct PluginFacade {
    desc: Arc<PluginDescriptor>,
    registry: Arc<InstanceRegistry>,
}

impl PluginFacade {
    pub(crate) fn new(desc: Arc<PluginDescriptor>, registry: Arc<InstanceRegistry>) -> Self {
        Self { desc, registry }
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    /// Ordering hint for the gateway's plugin iterator.
    pub fn priority(&self) -> i32 {
        self.desc.priority
    }

    pub fn version(&self) -> &str {
        &self.desc.version
    }

    pub fn phases(&self) -> &[Phase] {
        &self.desc.phases
    }

    pub async fn certificate(&self, pdk: Arc<dyn Pdk>, conf: &JsonValue) -> Result<(), HostError> {
        self.invoke(Phase::Certificate, pdk, conf).await
    }

    pub async fn rewrite(&self, pdk: Arc<dyn Pdk>, conf: &JsonValue) -> Result<(), HostError> {
        self.invoke(Phase::Rewrite, pdk, conf).await
    }

    pub async fn access(&self, pdk: Arc<dyn Pdk>, conf: &JsonValue) -> Result<(), HostError> {
        self.invoke(Phase::Access, pdk, conf).await
    }

    pub async fn header_filter(&self, pdk: Arc<dyn Pdk>, conf: &JsonValue) -> Result<(), HostError> {
        self.invoke(Phase::HeaderFilter, pdk, conf).await
    }

    pub async fn body_filter(&self, pdk: Arc<dyn Pdk>, conf: &JsonValue) -> Result<(), HostError> {
        self.invoke(Phase::BodyFilter, pdk, conf).await
    }

    pub async fn log(&self, pdk: Arc<dyn Pdk>, conf: &JsonValue) -> Result<(), HostError> {
        self.invoke(Phase::Log, pdk, conf).await
    }

    /// Run one phase. Non-log phases complete inline; `log` returns as
    /// soon as the deferred conversation is scheduled.
    pub async fn invoke(
        &self,
        phase: Phase,
        pdk: Arc<dyn Pdk>,
        conf: &JsonValue,
    ) -> Result<(), HostError> {
        if !self.desc.phases.contains(&phase) {
            return Err(HostError::PhaseNotSupported {
                plugin: self.desc.name.clone(),
                phase,
            });
        }
        if phase == Phase::Log {
            self.schedule_log(pdk, conf.clone());
            return Ok(());
        }
        self.run_conversation(phase, pdk.as_ref(), conf).await
    }

    /// One conversation, with the evict-and-retry-once policy for the
    /// "No plugin instance" sentinel. A second occurrence propagates.
    async fn run_conversation(
        &self,
        phase: Phase,
        pdk: &dyn Pdk,
        conf: &JsonValue,
    ) -> Result<(), HostError> {
        match self.converse(phase, pdk, conf).await {
            Err(e) if e.is_no_instance() => {
                warn!(plugin = %self.desc.name, %phase, "server dropped our instance; starting a fresh one");
                self.registry.reset_instance(&self.desc.name, conf);
                self.converse(phase, pdk, conf).await
            }
            other => other,
        }
    }

    async fn converse(&self, phase: Phase, pdk: &dyn Pdk, conf: &JsonValue) -> Result<(), HostError> {
        let instance_id = self.registry.get_instance_id(&self.desc, conf).await?;
        let client = self.desc.server.client()?;
        bridge::handle_event(&client, pdk, &instance_id, phase).await
    }

    /// The gateway must answer the client before the log pipeline runs:
    /// snapshot the request state, then drive the conversation from a
    /// detached task. Failures have nowhere to go but the log.
    fn schedule_log(&self, pdk: Arc<dyn Pdk>, conf: JsonValue) {
        let snapshot = pdk.log_snapshot();
        let facade = self.clone();
        tokio::spawn(async move {
            let _bound = bind_snapshot(snapshot);
            if let Err(e) = facade.run_conversation(Phase::Log, pdk.as_ref(), &conf).await {
                error!(plugin = %facade.desc.name, error = %e, "log phase failed");
            }
        });
    }
}

impl std::fmt::Debug for PluginFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginFacade")
            .field("plugin", &self.desc.name)
            .field("phases", &self.desc.phases)
            .finish()
    }
}
