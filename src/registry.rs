//! The plugin instance cache.
//!
//! Remote instances are started lazily, one per configuration identity,
//! and cached until the configuration changes, the server forgets them,
//! or the server process is replaced. A placeholder entry (no id yet)
//! marks a start in flight and doubles as the at-most-one-start gate:
//! whoever installs it performs the only `StartInstance` for that key,
//! everyone else waits and reads the committed id.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Mutex;

use rmpv::Value;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::descriptor::PluginDescriptor;
use crate::error::HostError;
use crate::rpc::{message, RpcClient};

/// Identity under which an instance is cached: the configuration's stable
/// key when the gateway supplies one, otherwise the plugin name.
fn instance_key(plugin_name: &str, conf: &JsonValue) -> String {
    conf.get("__key__")
        .and_then(JsonValue::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| plugin_name.to_owned())
}

/// The gateway bumps this whenever the configuration value changes for
/// the same key; a mismatch means the cached instance is stale.
fn conf_seq(conf: &JsonValue) -> i64 {
    conf.get("__seq__").and_then(JsonValue::as_i64).unwrap_or(0)
}

struct Entry {
    seq: i64,
    #[allow(dead_code)]
    conf: JsonValue,
    /// `None` while a start is in flight.
    id: Option<String>,
    /// Attached at commit; placeholders carry no client, which keeps them
    /// out of pid-change eviction while their start completes.
    client: Option<RpcClient>,
}

#[derive(Default)]
pub struct InstanceRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    changed: Notify,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the remote instance id for `(plugin, conf)`, starting one
    /// on the owning server if the cache has no fresh entry.
    pub async fn get_instance_id(
        &self,
        desc: &PluginDescriptor,
        conf: &JsonValue,
    ) -> Result<String, HostError> {
        let key = instance_key(&desc.name, conf);
        let seq = conf_seq(conf);

        // Wait out any start in flight for this key, then either return
        // the cached id or claim the key with a placeholder.
        let old_id = loop {
            let mut wait = pin!(self.changed.notified());
            {
                let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
                match entries.get_mut(&key) {
                    Some(entry) if entry.id.is_none() => {
                        // listen before unlocking so the committing task
                        // cannot slip its wakeup past us
                        wait.as_mut().enable();
                    }
                    Some(entry) if entry.seq == seq => {
                        return Ok(entry.id.clone().unwrap_or_default());
                    }
                    Some(entry) => {
                        // stale seq: clear in place, gating other starters
                        let old = entry.id.take();
                        entry.seq = seq;
                        entry.conf = conf.clone();
                        entry.client = None;
                        break old;
                    }
                    None => {
                        entries.insert(
                            key.clone(),
                            Entry {
                                seq,
                                conf: conf.clone(),
                                id: None,
                                client: None,
                            },
                        );
                        break None;
                    }
                }
            }
            wait.await;
        };

        match self.start_remote(desc, conf, &key, seq).await {
            Ok((id, client)) => {
                if let Some(old_id) = old_id {
                    close_instance(client, &desc.name, old_id);
                }
                Ok(id)
            }
            Err(e) => {
                // let the next caller retry with a fresh placeholder
                self.abort_start(&key);
                Err(e)
            }
        }
    }

    /// The remote start. Runs with the lock dropped; everyone else for
    /// this key queues on the placeholder meanwhile.
    async fn start_remote(
        &self,
        desc: &PluginDescriptor,
        conf: &JsonValue,
        key: &str,
        seq: i64,
    ) -> Result<(String, RpcClient), HostError> {
        let client = desc.server.client()?;
        let conf_text = serde_json::to_string(conf)
            .map_err(|e| HostError::Protocol(format!("unserializable plugin config: {e}")))?;

        let response = client
            .call(
                "plugin.StartInstance",
                vec![message::map(vec![
                    ("Name", Value::from(desc.name.as_str())),
                    ("Config", Value::from(conf_text)),
                ])],
            )
            .await
            .map_err(|source| HostError::StartFailed {
                plugin: desc.name.clone(),
                source,
            })?;

        let id = message::field(&response, "Id")
            .and_then(message::id_text)
            .ok_or_else(|| {
                HostError::Protocol(format!("StartInstance response without an Id: {response}"))
            })?;

        debug!(plugin = %desc.name, key, seq, id = %id, "started plugin instance");
        self.commit(key.to_owned(), seq, conf.clone(), id.clone(), client.clone());
        Ok((id, client))
    }

    fn commit(&self, key: String, seq: i64, conf: JsonValue, id: String, client: RpcClient) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            Entry {
                seq,
                conf,
                id: Some(id),
                client: Some(client),
            },
        );
        drop(entries);
        self.changed.notify_waiters();
    }

    fn abort_start(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        drop(entries);
        self.changed.notify_waiters();
    }

    /// Drop the cached instance for `(plugin, conf)`; used when the
    /// server reports the remote instance is gone.
    pub fn reset_instance(&self, plugin_name: &str, conf: &JsonValue) {
        let key = instance_key(plugin_name, conf);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.remove(&key).is_some() {
            debug!(plugin = plugin_name, key, "dropped plugin instance");
            drop(entries);
            self.changed.notify_waiters();
        }
    }

    /// `serverPid` notification hook. The first observation only records
    /// the pid; a change means the server process was replaced, so every
    /// instance started on that client is gone.
    pub fn on_server_pid(&self, client: &RpcClient, pid: i64) {
        if let Some(previous) = client.last_server_pid() {
            if previous != pid {
                let evicted = self.evict_client(client.id());
                info!(
                    peer = client.peer(),
                    previous, pid, evicted, "plugin server changed pid; dropped its instances"
                );
            }
        }
        client.record_server_pid(pid);
    }

    fn evict_client(&self, client_id: u64) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| match &entry.client {
            Some(client) => client.id() != client_id,
            None => true,
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

/// Best-effort close of a superseded instance; the result is ignored.
fn close_instance(client: RpcClient, plugin: &str, old_id: String) {
    let plugin = plugin.to_owned();
    tokio::spawn(async move {
        debug!(plugin = %plugin, id = %old_id, "closing superseded instance");
        if let Err(e) = client
            .call("plugin.CloseInstance", vec![Value::from(old_id)])
            .await
        {
            debug!(plugin = %plugin, error = %e, "CloseInstance failed; ignored");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_prefers_the_stable_config_identity() {
        let with_key = json!({"__key__": "route-7:p", "__seq__": 3});
        assert_eq!(instance_key("p", &with_key), "route-7:p");
        assert_eq!(conf_seq(&with_key), 3);

        let bare = json!({"timeout": 5});
        assert_eq!(instance_key("p", &bare), "p");
        assert_eq!(conf_seq(&bare), 0);
    }

    #[test]
    fn eviction_only_touches_committed_entries() {
        let registry = InstanceRegistry::new();
        {
            let mut entries = registry.entries.lock().unwrap();
            entries.insert(
                "in-flight".into(),
                Entry {
                    seq: 1,
                    conf: json!({}),
                    id: None,
                    client: None,
                },
            );
        }
        // no committed entry carries client id 9; the placeholder survives
        assert_eq!(registry.evict_client(9), 0);
        assert_eq!(registry.len(), 1);
    }
}
