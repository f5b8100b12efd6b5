//! Plugin server process supervision.
//!
//! Each configured server with an `exec` gets one long-lived task that
//! spawns the child, connects the RPC client once the socket appears,
//! forwards the child's stdout/stderr to the gateway log, awaits the
//! exit, and respawns with bounded exponential backoff. Servers without
//! `exec` are managed externally; for those the task only maintains the
//! client connection.
//!
//! `manage_servers` must be called exactly once, by the worker designated
//! to own the children. Everything else in the host is a pure client of
//! the sockets.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PluginServerConf;
use crate::error::HostError;
use crate::registry::InstanceRegistry;
use crate::rpc::RpcClient;

const CONNECT_RETRY: Duration = Duration::from_millis(200);
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);
const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(5);
const HEALTHY_RUN: Duration = Duration::from_secs(10);

/// A configured server plus its live connection. The process handle stays
/// inside the supervisor task; everyone else goes through the client.
pub struct ServerState {
    conf: PluginServerConf,
    client: RwLock<Option<RpcClient>>,
}

impl ServerState {
    pub fn new(conf: PluginServerConf) -> Arc<Self> {
        Arc::new(Self {
            conf,
            client: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.conf.name
    }

    pub fn conf(&self) -> &PluginServerConf {
        &self.conf
    }

    /// The current RPC client, or `NotConnected` while the server is down.
    pub fn client(&self) -> Result<RpcClient, HostError> {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| HostError::NotConnected(self.conf.name.clone()))
    }

    fn set_client(&self, client: RpcClient) {
        *self.client.write().unwrap_or_else(|e| e.into_inner()) = Some(client);
    }

    fn clear_client(&self) {
        *self.client.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("name", &self.conf.name)
            .field("socket", &self.conf.socket)
            .field("connected", &self.client().is_ok())
            .finish()
    }
}

/// Spawn one supervision task per server. Returns the task handles so the
/// embedding gateway can await them on shutdown.
pub fn manage_servers(
    servers: &[Arc<ServerState>],
    registry: Arc<InstanceRegistry>,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    servers
        .iter()
        .map(|server| {
            let server = server.clone();
            let registry = registry.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                if server.conf().exec.is_some() {
                    supervise(server, registry, cancel).await;
                } else {
                    maintain_connection(server, registry, cancel).await;
                }
            })
        })
        .collect()
}

async fn supervise(server: Arc<ServerState>, registry: Arc<InstanceRegistry>, cancel: CancellationToken) {
    let mut backoff = Backoff::new();
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let started = Instant::now();
        let mut child = match spawn_child(server.conf()) {
            Ok(child) => child,
            Err(e) => {
                // other servers keep running; this one is done for good
                error!(server = server.name(), error = %e, "giving up on plugin server");
                return;
            }
        };
        drain_child_logs(server.name(), &mut child);

        let connected = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return;
            }
            connected = connect_with_deadline(&server.conf().socket) => connected,
        };

        match connected {
            Ok(client) => {
                wire_notifications(&client, &registry);
                server.set_client(client.clone());
                info!(server = server.name(), socket = %server.conf().socket.display(), "plugin server up");

                tokio::select! {
                    _ = cancel.cancelled() => {
                        server.clear_client();
                        client.close();
                        let _ = child.kill().await;
                        return;
                    }
                    status = child.wait() => match status {
                        Ok(status) => info!(server = server.name(), %status, "plugin server exited"),
                        Err(e) => warn!(server = server.name(), error = %e, "plugin server reaping failed"),
                    }
                }
                server.clear_client();
                client.close();
            }
            Err(e) => {
                warn!(server = server.name(), error = %e, "plugin server socket never came up");
                let _ = child.kill().await;
            }
        }

        if started.elapsed() >= HEALTHY_RUN {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        info!(server = server.name(), ?delay, "respawning plugin server");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }
}

/// Connection keeper for servers started outside the host.
async fn maintain_connection(
    server: Arc<ServerState>,
    registry: Arc<InstanceRegistry>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new();
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            connected = connect_with_deadline(&server.conf().socket) => connected,
        };
        match connected {
            Ok(client) => {
                backoff.reset();
                wire_notifications(&client, &registry);
                server.set_client(client.clone());
                info!(server = server.name(), "connected to externally managed plugin server");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        server.clear_client();
                        client.close();
                        return;
                    }
                    _ = client.wait_closed() => {}
                }
                server.clear_client();
                warn!(server = server.name(), "lost connection to externally managed plugin server");
            }
            Err(e) => {
                warn!(server = server.name(), error = %e, "cannot reach externally managed plugin server");
            }
        }
        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }
}

fn spawn_child(conf: &PluginServerConf) -> Result<Child, HostError> {
    let exec = conf.exec.as_ref().ok_or_else(|| HostError::Spawn {
        server: conf.name.clone(),
        source: std::io::Error::other("server has no exec"),
    })?;
    Command::new(exec)
        .args(&conf.args)
        .envs(&conf.environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| HostError::Spawn {
            server: conf.name.clone(),
            source,
        })
}

/// Forward the child's output to the gateway log, one line at a time,
/// tagged with the server name.
fn drain_child_logs(name: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        spawn_log_drain(name.to_owned(), stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_log_drain(name.to_owned(), stderr);
    }
}

fn spawn_log_drain(name: String, pipe: impl AsyncRead + Unpin + Send + 'static) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                info!("[{name}] {line}");
            }
        }
    });
}

async fn connect_with_deadline(socket: &Path) -> std::io::Result<RpcClient> {
    let deadline = Instant::now() + CONNECT_DEADLINE;
    loop {
        match RpcClient::connect(socket).await {
            Ok(client) => return Ok(client),
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(e);
                }
                sleep(CONNECT_RETRY).await;
            }
        }
    }
}

/// Route the `serverPid` notification into the instance registry, which
/// turns an unnoticed server restart into a cache-wide invalidation.
fn wire_notifications(client: &RpcClient, registry: &Arc<InstanceRegistry>) {
    let registry = registry.clone();
    client.on_notification("serverPid", move |client, params| {
        let pid = params
            .as_array()
            .and_then(|a| a.first())
            .and_then(|v| v.as_i64());
        match pid {
            Some(pid) => registry.on_server_pid(&client, pid),
            None => warn!(peer = client.peer(), "serverPid notification without a pid"),
        }
    });
}

struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self { next: BACKOFF_BASE }
    }

    fn reset(&mut self) {
        self.next = BACKOFF_BASE;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(BACKOFF_CAP);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::net::UnixListener;
    use tokio::time::timeout;

    fn conf(name: &str, socket: std::path::PathBuf, exec: Option<&str>) -> PluginServerConf {
        PluginServerConf {
            name: name.into(),
            socket,
            exec: exec.map(Into::into),
            args: Vec::new(),
            environment: HashMap::new(),
            info_cmd: None,
        }
    }

    #[test]
    fn backoff_doubles_caps_and_resets() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), BACKOFF_CAP);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn spawn_failure_ends_that_supervisor_only() {
        let dir = tempfile::tempdir().unwrap();
        let server = ServerState::new(conf(
            "broken",
            dir.path().join("never.sock"),
            Some("/nonexistent/plugin-server"),
        ));
        let registry = Arc::new(InstanceRegistry::new());
        let cancel = CancellationToken::new();

        let handles = manage_servers(&[server.clone()], registry, &cancel);
        for handle in handles {
            timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        }
        assert!(matches!(server.client(), Err(HostError::NotConnected(_))));
    }

    #[tokio::test]
    async fn supervised_child_connects_and_dies_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("srv.sock");
        // the test plays the plugin server end of the socket; the child
        // only has to exist long enough to be killed
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            let _keep = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut def = conf("sleeper", socket, Some("sh"));
        def.args = vec!["-c".into(), "sleep 30".into()];
        let server = ServerState::new(def);
        let registry = Arc::new(InstanceRegistry::new());
        let cancel = CancellationToken::new();

        let handles = manage_servers(&[server.clone()], registry, &cancel);

        // wait for the supervisor to connect
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.client().is_err() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(server.client().is_ok());

        cancel.cancel();
        for handle in handles {
            timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        }
        assert!(server.client().is_err());
    }

    #[tokio::test]
    async fn cancelled_before_start_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let server = ServerState::new(conf(
            "idle",
            dir.path().join("idle.sock"),
            Some("/bin/true"),
        ));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let handles = manage_servers(&[server.clone()], Arc::new(InstanceRegistry::new()), &cancel);
        for handle in handles {
            timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        }
        assert!(server.client().is_err());
    }
}
