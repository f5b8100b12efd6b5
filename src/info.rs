//! Startup discovery of the plugins each server advertises.
//!
//! A server's `info_cmd` prints a document whose top level is a sequence
//! of plugin records. The document is parsed as YAML, which also accepts
//! the JSON some servers emit. Exit status is not inspected.

use std::sync::Arc;

use tokio::process::Command;
use tracing::{error, info};

use crate::descriptor::{PluginInfo, PluginTable};
use crate::error::HostError;
use crate::supervisor::ServerState;

/// Run every server's info command and fill the descriptor table. Called
/// exactly once at startup; failures skip that server's plugins and
/// duplicate names keep the first registration.
pub async fn load_all_infos(servers: &[Arc<ServerState>], table: &PluginTable) {
    for server in servers {
        let Some(cmd) = server.conf().info_cmd.as_deref() else {
            info!(server = server.name(), "server advertises no plugins (no info_cmd)");
            continue;
        };
        match query_plugin_info(server.name(), cmd).await {
            Ok(infos) => {
                for plugin in infos {
                    let name = plugin.name.clone();
                    match table.register_plugin_info(server, plugin) {
                        Ok(()) => {
                            info!(server = server.name(), plugin = %name, "registered external plugin")
                        }
                        Err(e) => {
                            error!(server = server.name(), plugin = %name, error = %e, "plugin registration rejected")
                        }
                    }
                }
            }
            Err(e) => error!(server = server.name(), error = %e, "skipping this server's plugins"),
        }
    }
}

async fn query_plugin_info(server: &str, cmd: &str) -> Result<Vec<PluginInfo>, HostError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
        .map_err(|e| HostError::InfoCmd {
            server: server.to_owned(),
            reason: e.to_string(),
        })?;
    if output.stdout.iter().all(u8::is_ascii_whitespace) {
        return Err(HostError::InfoCmd {
            server: server.to_owned(),
            reason: "info command printed nothing".into(),
        });
    }
    serde_yaml::from_slice(&output.stdout).map_err(|e| HostError::InfoCmd {
        server: server.to_owned(),
        reason: format!("unparseable plugin info: {e}"),
    })
}
