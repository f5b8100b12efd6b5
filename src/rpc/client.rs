//! Connection-oriented MessagePack-RPC client.
//!
//! One client owns one UNIX stream socket. Any number of tasks may issue
//! [`RpcClient::call`]s concurrently: each request is tagged with a unique
//! msgid and matched to its response by a reader task, so calls interleave
//! freely on the wire. Server→client notifications are dispatched to
//! registered handlers in arrival order, with the client handle as first
//! argument so handlers can keep per-client state (the last-observed
//! server pid lives here for exactly that reason).
//!
//! There is no automatic reconnect: the supervisor builds a fresh client
//! after every respawn.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::rpc::message::{self, Frame};

/// Invoked for each inbound notification registered under its name.
pub type NotificationHandler = Arc<dyn Fn(RpcClient, Value) + Send + Sync>;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: u64,
    peer: String,
    next_msgid: AtomicU32,
    closed: AtomicBool,
    inflight: DashMap<u32, oneshot::Sender<Result<Value, RpcError>>>,
    handlers: DashMap<String, NotificationHandler>,
    out_tx: mpsc::Sender<Vec<u8>>,
    server_pid: Mutex<Option<i64>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl RpcClient {
    /// Connect to a plugin server socket and start the reader/writer tasks.
    pub async fn connect(path: impl AsRef<Path>) -> std::io::Result<RpcClient> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read, mut write) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
        let shutdown = CancellationToken::new();

        let client = RpcClient {
            inner: Arc::new(ClientInner {
                id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
                peer: path.as_ref().display().to_string(),
                next_msgid: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                inflight: DashMap::new(),
                handlers: DashMap::new(),
                out_tx,
                server_pid: Mutex::new(None),
                shutdown: shutdown.clone(),
            }),
        };

        // writer: serialize queued frames onto the socket
        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    frame = out_rx.recv() => match frame {
                        Some(buf) => {
                            if write.write_all(&buf).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = write.shutdown().await;
        });

        // reader: match responses to callers, fan out notifications
        let reader_client = client.clone();
        tokio::spawn(async move {
            reader_client.read_loop(read).await;
            reader_client.finish();
        });

        Ok(client)
    }

    /// Process-unique identity, used by the instance registry to tie cached
    /// instances to the client they were started on.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Issue a request and suspend until the matching response arrives.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::TransportClosed);
        }

        let msgid = self.inner.next_msgid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.inflight.insert(msgid, tx);

        let frame = match message::encode_request(msgid, method, params) {
            Ok(frame) => frame,
            Err(e) => {
                self.inner.inflight.remove(&msgid);
                return Err(e);
            }
        };
        if self.inner.out_tx.send(frame).await.is_err() {
            self.inner.inflight.remove(&msgid);
            return Err(RpcError::TransportClosed);
        }
        // the reader may have drained in-flight calls between the insert and
        // the send; re-check so this call cannot hang
        if self.inner.closed.load(Ordering::Acquire) {
            if self.inner.inflight.remove(&msgid).is_some() {
                return Err(RpcError::TransportClosed);
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::TransportClosed),
        }
    }

    /// Register a handler for a named server→client notification.
    pub fn on_notification<F>(&self, name: &str, handler: F)
    where
        F: Fn(RpcClient, Value) + Send + Sync + 'static,
    {
        self.inner.handlers.insert(name.to_owned(), Arc::new(handler));
    }

    /// Last pid the server reported over the `serverPid` notification.
    pub fn last_server_pid(&self) -> Option<i64> {
        *self.inner.server_pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_server_pid(&self, pid: i64) {
        *self
            .inner
            .server_pid
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(pid);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection is torn down, whether by
    /// [`RpcClient::close`] or by the peer going away.
    pub async fn wait_closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// Tear the connection down. All in-flight calls complete with
    /// [`RpcError::TransportClosed`]. Safe to call more than once.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.finish();
    }

    fn finish(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        let pending: Vec<u32> = self.inner.inflight.iter().map(|e| *e.key()).collect();
        for msgid in pending {
            if let Some((_, tx)) = self.inner.inflight.remove(&msgid) {
                let _ = tx.send(Err(RpcError::TransportClosed));
            }
        }
    }

    async fn read_loop(&self, mut read: impl AsyncRead + Unpin) {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            let value = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                value = read_frame(&mut read, &mut buf) => value,
            };
            let value = match value {
                Ok(value) => value,
                Err(RpcError::TransportClosed) => break,
                Err(e) => {
                    warn!(peer = %self.inner.peer, error = %e, "dropping plugin server connection");
                    break;
                }
            };
            match message::parse_frame(value) {
                Ok(Frame::Response {
                    msgid,
                    error,
                    result,
                }) => {
                    if let Some((_, tx)) = self.inner.inflight.remove(&msgid) {
                        let outcome = if error.is_nil() {
                            Ok(result)
                        } else {
                            Err(RpcError::Remote(error))
                        };
                        let _ = tx.send(outcome);
                    } else {
                        debug!(peer = %self.inner.peer, msgid, "response without a waiting call");
                    }
                }
                Ok(Frame::Notification { method, params }) => {
                    let handler = self.inner.handlers.get(&method).map(|h| h.value().clone());
                    match handler {
                        Some(handler) => handler(self.clone(), params),
                        None => {
                            debug!(peer = %self.inner.peer, method, "unhandled notification")
                        }
                    }
                }
                Ok(Frame::Request { method, .. }) => {
                    warn!(peer = %self.inner.peer, method, "plugin server sent a request; ignoring");
                }
                Err(e) => {
                    warn!(peer = %self.inner.peer, error = %e, "dropping plugin server connection");
                    break;
                }
            }
        }
    }
}

/// Read one complete MessagePack value off the stream, buffering partial
/// frames until enough bytes arrive.
async fn read_frame(
    read: &mut (impl AsyncRead + Unpin),
    buf: &mut BytesMut,
) -> Result<Value, RpcError> {
    loop {
        if !buf.is_empty() {
            let mut cursor = std::io::Cursor::new(&buf[..]);
            match rmpv::decode::read_value(&mut cursor) {
                Ok(value) => {
                    let consumed = cursor.position() as usize;
                    buf.advance(consumed);
                    return Ok(value);
                }
                Err(e) if is_incomplete(&e) => {}
                Err(e) => return Err(RpcError::Decode(e.to_string())),
            }
        }
        let n = read
            .read_buf(buf)
            .await
            .map_err(|_| RpcError::TransportClosed)?;
        if n == 0 {
            return Err(RpcError::TransportClosed);
        }
    }
}

fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    use rmpv::decode::Error;
    match err {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) => {
            e.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}
