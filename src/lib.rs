//! Host for plugins that run as long-lived out-of-process servers.
//!
//! The gateway hands this crate a list of plugin server definitions; the
//! host discovers the plugins each server advertises, supervises the
//! server processes, and routes phase callbacks to the right remote
//! instance over MessagePack-RPC — including the nested "PDK" calls a
//! plugin makes back into the gateway while it handles an event.
//!
//! Typical embedding:
//! ```ignore
//! let host = PluginHost::from_config_file(Some(path))?;
//! host.load_all_infos().await;            // once, at startup
//! let handles = host.manage_servers();    // once, on the supervisor worker
//!
//! // per configured plugin, per request:
//! let plugin = host.load_plugin("my-plugin")?;
//! plugin.access(pdk.clone(), &conf).await?;
//! ```

pub mod bridge;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod gateway;
pub mod info;
pub mod phase;
pub mod registry;
pub mod rpc;
pub mod supervisor;

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use config::PluginServerConf;
pub use descriptor::{PluginDescriptor, PluginInfo, PluginTable};
pub use error::{HostError, RpcError};
pub use gateway::{LogSnapshot, Pdk, PdkError};
pub use phase::{current_log_snapshot, Phase, PluginFacade};
pub use registry::InstanceRegistry;
pub use rpc::RpcClient;
pub use supervisor::ServerState;

/// The host facade the gateway embeds. Fully ephemeral: all authoritative
/// state lives in the configuration file and the plugin servers.
pub struct PluginHost {
    servers: Vec<Arc<ServerState>>,
    table: PluginTable,
    registry: Arc<InstanceRegistry>,
    cancel: CancellationToken,
}

impl PluginHost {
    /// Load the server definitions and build an idle host. `None` means
    /// no external plugins are configured and yields an empty host.
    pub fn from_config_file(path: Option<&Path>) -> Result<Self, HostError> {
        let servers = config::load_server_defs(path)?
            .into_iter()
            .map(ServerState::new)
            .collect();
        Ok(Self {
            servers,
            table: PluginTable::new(),
            registry: Arc::new(InstanceRegistry::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn servers(&self) -> &[Arc<ServerState>] {
        &self.servers
    }

    pub fn plugin_table(&self) -> &PluginTable {
        &self.table
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Run every server's info command and register the advertised
    /// plugins. Call once at startup, before any phase runs.
    pub async fn load_all_infos(&self) {
        info::load_all_infos(&self.servers, &self.table).await;
    }

    /// The advertised schema for one plugin, for the gateway's validator.
    pub fn load_schema(&self, plugin_name: &str) -> Option<serde_json::Value> {
        self.table.schema(plugin_name)
    }

    /// The phase-callable facade for one registered plugin.
    pub fn load_plugin(&self, plugin_name: &str) -> Result<PluginFacade, HostError> {
        let desc = self
            .table
            .get(plugin_name)
            .ok_or_else(|| HostError::UnknownPlugin(plugin_name.to_owned()))?;
        Ok(PluginFacade::new(desc, self.registry.clone()))
    }

    /// Start supervising the configured servers. Call exactly once, on
    /// the worker that owns the children; everything else stays a pure
    /// client of the sockets.
    pub fn manage_servers(&self) -> Vec<JoinHandle<()>> {
        supervisor::manage_servers(&self.servers, self.registry.clone(), &self.cancel)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop supervising. Children are killed, clients closed; in-flight
    /// conversations finish with `TransportClosed`.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for server in &self.servers {
            if let Ok(client) = server.client() {
                client.close();
            }
        }
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("servers", &self.servers.len())
            .field("plugins", &self.table.len())
            .field("instances", &self.registry.len())
            .finish()
    }
}
