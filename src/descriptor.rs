//! Plugin descriptors and the process-wide plugin table.
//!
//! The table is filled once at startup by the info loader and read-only
//! afterwards; nothing else in the host mutates it.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::error::HostError;
use crate::phase::Phase;
use crate::supervisor::ServerState;

/// One plugin as advertised by its owning server.
#[derive(Debug)]
pub struct PluginDescriptor {
    pub name: String,
    pub priority: i32,
    pub version: String,
    /// Opaque to the host; the gateway's validator consumes it.
    pub schema: JsonValue,
    pub phases: Vec<Phase>,
    pub server: Arc<ServerState>,
}

/// Raw info-command record. `phases` arrive as strings and are validated
/// during registration; unknown phase names are logged and dropped.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub schema: JsonValue,
    #[serde(default)]
    pub phases: Vec<String>,
}

#[derive(Default)]
pub struct PluginTable {
    plugins: DashMap<String, Arc<PluginDescriptor>>,
}

impl PluginTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one advertised plugin. Names are globally unique across
    /// servers; the first registration wins.
    pub fn register_plugin_info(
        &self,
        server: &Arc<ServerState>,
        info: PluginInfo,
    ) -> Result<(), HostError> {
        let phases = info
            .phases
            .iter()
            .filter_map(|raw| match raw.parse::<Phase>() {
                Ok(phase) => Some(phase),
                Err(_) => {
                    warn!(plugin = %info.name, phase = %raw, "ignoring unknown phase");
                    None
                }
            })
            .collect();

        let descriptor = Arc::new(PluginDescriptor {
            name: info.name.clone(),
            priority: info.priority,
            version: info.version,
            schema: info.schema,
            phases,
            server: server.clone(),
        });

        use dashmap::mapref::entry::Entry;
        match self.plugins.entry(info.name.clone()) {
            Entry::Occupied(_) => Err(HostError::DuplicatePlugin(info.name)),
            Entry::Vacant(slot) => {
                slot.insert(descriptor);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginDescriptor>> {
        self.plugins.get(name).map(|entry| entry.value().clone())
    }

    /// The advertised schema, for the gateway's config validator.
    pub fn schema(&self, name: &str) -> Option<JsonValue> {
        self.plugins.get(name).map(|entry| entry.schema.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
