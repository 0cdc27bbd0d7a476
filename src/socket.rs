//! Per-session sample sockets.
//!
//! Clients receive their sample stream over a Unix stream socket bound at a
//! fixed, world-accessible path. A connecting client writes the session
//! identifier it obtained from the manager (little-endian `i32`) and waits
//! for a single ack byte; afterwards the socket only ever carries sample
//! payloads, with no framing above the payload itself.
//!
//! The manager talks to the handler through the [`SessionSocket`] trait so
//! the arbiter and reaper can be tested without touching the filesystem.
//! Client-initiated disconnects surface on the lost-session feed, which the
//! control loop routes to the liveness reaper; sessions the manager removes
//! itself are closed silently.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::lock;
use crate::session::{SessionId, INVALID_SESSION};

/// Byte sent to the client once its handshake is accepted.
const HANDSHAKE_ACK: u8 = 1;

/// Sample-socket operations the manager depends on.
pub trait SessionSocket: Send + Sync {
    /// Forwards one sample payload to the session's stream. False when the
    /// session has no connected socket or the stream is gone.
    fn write(&self, session: SessionId, payload: &[u8]) -> bool;

    /// Drops the session's socket. Safe to call for sessions that never
    /// connected.
    fn remove_session(&self, session: SessionId);

    /// Peer process id of the session's socket, for the status dump.
    fn peer_pid(&self, session: SessionId) -> Option<i32>;
}

struct SessionHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pid: Option<i32>,
}

struct SocketInner {
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    lost_tx: mpsc::UnboundedSender<SessionId>,
}

/// Unix-socket implementation of [`SessionSocket`].
pub struct UnixSocketHandler {
    inner: Arc<SocketInner>,
}

impl UnixSocketHandler {
    /// Binds the sample socket at `path`, makes it world-accessible, and
    /// starts accepting clients. The returned receiver carries the session
    /// ids of client-initiated disconnects.
    pub fn listen(
        path: &Path,
    ) -> anyhow::Result<(Arc<Self>, mpsc::UnboundedReceiver<SessionId>)> {
        if path.exists() {
            fs::remove_file(path)
                .with_context(|| format!("removing stale socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("binding sample socket {}", path.display()))?;
        if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o777)) {
            warn!(path = %path.display(), %err, "failed to set sample socket permissions");
        }
        info!(path = %path.display(), "sample socket listening");

        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SocketInner {
            sessions: Mutex::new(HashMap::new()),
            lost_tx,
        });
        tokio::spawn(accept_loop(listener, Arc::clone(&inner)));

        Ok((Arc::new(Self { inner }), lost_rx))
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        lock(&self.inner.sessions).len()
    }
}

impl SessionSocket for UnixSocketHandler {
    fn write(&self, session: SessionId, payload: &[u8]) -> bool {
        let tx = match lock(&self.inner.sessions).get(&session) {
            Some(handle) => handle.tx.clone(),
            None => return false,
        };
        tx.send(payload.to_vec()).is_ok()
    }

    fn remove_session(&self, session: SessionId) {
        if lock(&self.inner.sessions).remove(&session).is_some() {
            debug!(session, "session socket removed");
        }
    }

    fn peer_pid(&self, session: SessionId) -> Option<i32> {
        lock(&self.inner.sessions).get(&session).and_then(|h| h.pid)
    }
}

async fn accept_loop(listener: UnixListener, inner: Arc<SocketInner>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(serve_connection(stream, Arc::clone(&inner)));
            }
            Err(err) => warn!(%err, "sample socket accept failed"),
        }
    }
}

fn peer_pid_of(stream: &UnixStream) -> Option<i32> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        return stream.peer_cred().ok().and_then(|cred| cred.pid());
    }
    #[allow(unreachable_code)]
    None
}

async fn serve_connection(mut stream: UnixStream, inner: Arc<SocketInner>) {
    let pid = peer_pid_of(&stream);

    let mut id_buf = [0u8; 4];
    if let Err(err) = stream.read_exact(&mut id_buf).await {
        warn!(%err, "client hung up during session handshake");
        return;
    }
    let session = SessionId::from_le_bytes(id_buf);
    if session <= INVALID_SESSION {
        warn!(session, "rejecting handshake with invalid session id");
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    {
        let mut sessions = lock(&inner.sessions);
        if sessions.contains_key(&session) {
            warn!(session, "rejecting duplicate socket for session");
            return;
        }
        sessions.insert(session, SessionHandle { tx, pid });
    }

    if let Err(err) = stream.write_all(&[HANDSHAKE_ACK]).await {
        warn!(session, %err, "failed to ack session handshake");
        lock(&inner.sessions).remove(&session);
        return;
    }
    debug!(session, ?pid, "session socket connected");

    let (mut read_half, mut write_half) = stream.into_split();
    let mut scratch = [0u8; 64];
    loop {
        tokio::select! {
            queued = rx.recv() => match queued {
                Some(payload) => {
                    if write_half.write_all(&payload).await.is_err() {
                        break;
                    }
                }
                // The manager dropped the session; close without a lost
                // notification.
                None => return,
            },
            read = read_half.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break,
                // Clients do not speak after the handshake.
                Ok(_) => {}
            },
        }
    }

    // Client-initiated disconnect: hand the session to the reaper.
    if lock(&inner.sessions).remove(&session).is_some() {
        debug!(session, "session socket lost");
        let _ = inner.lost_tx.send(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn connect(path: &Path, session: SessionId) -> UnixStream {
        let mut stream = UnixStream::connect(path).await.expect("connect");
        stream
            .write_all(&session.to_le_bytes())
            .await
            .expect("handshake");
        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack).await.expect("ack");
        assert_eq!(ack[0], HANDSHAKE_ACK);
        stream
    }

    #[tokio::test]
    async fn samples_reach_the_connected_session() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sensord.sock");
        let (handler, _lost) = UnixSocketHandler::listen(&path).expect("listen");

        let mut client = connect(&path, 5).await;
        assert_eq!(handler.peer_pid(5), Some(std::process::id() as i32));

        let payload: Vec<u8> = (0..128).collect();
        assert!(handler.write(5, &payload));

        let mut received = vec![0u8; payload.len()];
        client.read_exact(&mut received).await.expect("read");
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn write_to_unknown_session_fails() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sensord.sock");
        let (handler, _lost) = UnixSocketHandler::listen(&path).expect("listen");
        assert!(!handler.write(42, b"sample"));
    }

    #[tokio::test]
    async fn client_disconnect_is_reported_lost() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sensord.sock");
        let (handler, mut lost) = UnixSocketHandler::listen(&path).expect("listen");

        let client = connect(&path, 7).await;
        drop(client);

        assert_eq!(lost.recv().await, Some(7));
        assert_eq!(handler.session_count(), 0);
    }

    #[tokio::test]
    async fn removed_session_closes_silently() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sensord.sock");
        let (handler, mut lost) = UnixSocketHandler::listen(&path).expect("listen");

        let mut client = connect(&path, 9).await;
        handler.remove_session(9);

        // The server side closes; the client observes EOF.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.expect("eof"), 0);

        // No lost notification for a manager-initiated removal.
        assert!(lost.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_handshake_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sensord.sock");
        let (handler, _lost) = UnixSocketHandler::listen(&path).expect("listen");

        let mut stream = UnixStream::connect(&path).await.expect("connect");
        stream
            .write_all(&INVALID_SESSION.to_le_bytes())
            .await
            .expect("handshake");
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.expect("eof"), 0);
        assert_eq!(handler.session_count(), 0);
    }
}
