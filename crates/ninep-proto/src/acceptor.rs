//! Listener lifecycle: accept loop, connection-count limiting, and the
//! cancellation token tree rooted at the server.
//!
//! The acceptor owns one [`tokio_util::sync::CancellationToken`]; every
//! accepted connection is handed a child of it, so cancelling the acceptor's
//! token drains every connection without the acceptor needing to track them
//! individually for teardown. It *does* track them for [`Acceptor::has_connections`]
//! via a `WaitGroup`-style counter gated on a terminal event.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{error, info};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;

use crate::error;
use crate::io_err;
use crate::srv::{Filesystem, dispatch};
use crate::utils::{self, Result};

/// Hard cap on concurrent connections, matching the share list's declared
/// maximum.
pub const MAX_CONNECTIONS: usize = 4096;

struct Inner {
    token: Mutex<CancellationToken>,
    live_connections: AtomicUsize,
}

/// Tracks listener lifecycle for a single bound address: accepting new
/// connections, pausing (cancel + drain) and resuming, and reporting whether
/// any connection (other than the one that might be asking) is still live.
pub struct Acceptor {
    inner: Arc<Inner>,
}

impl Acceptor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: Mutex::new(CancellationToken::new()),
                live_connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Cancel the acceptor's token; every connection descended from it
    /// observes cancellation at its next suspension point and tears down.
    pub fn pause(&self) {
        self.inner.token.lock().unwrap().cancel();
    }

    /// Replace the token with a fresh one, so a subsequent `run_tcp`/`run_unix`
    /// call on this same `Acceptor` accepts connections again. Connections
    /// spawned before the pause keep the cancelled token they were handed and
    /// still tear down; only the acceptor's own accept loop resumes.
    pub fn resume(&self) {
        *self.inner.token.lock().unwrap() = CancellationToken::new();
    }

    pub fn has_connections(&self) -> bool {
        self.inner.live_connections.load(Ordering::SeqCst) > 0
    }

    pub async fn run_tcp<Fs>(&self, filesystem: Fs, addr: &str) -> Result<()>
    where
        Fs: 'static + Filesystem + Send + Sync + Clone,
    {
        let listener = TcpListener::bind(addr).await?;
        let token = self.inner.token.lock().unwrap().clone();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("acceptor cancelled, stopping tcp accept loop on {addr}");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    if self.inner.live_connections.load(Ordering::SeqCst) >= MAX_CONNECTIONS {
                        error!("rejecting {peer:?}: at connection limit ({MAX_CONNECTIONS})");
                        drop(stream);
                        continue;
                    }
                    info!("accepted: {peer:?}");
                    self.spawn_connection(filesystem.clone(), stream, token.child_token());
                }
            }
        }
    }

    pub async fn run_unix<Fs>(&self, filesystem: Fs, addr: impl AsRef<std::path::Path>) -> Result<()>
    where
        Fs: 'static + Filesystem + Send + Sync + Clone,
    {
        let listener = UnixListener::bind(addr.as_ref())?;
        let token = self.inner.token.lock().unwrap().clone();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("acceptor cancelled, stopping unix accept loop");
                    let _ = std::fs::remove_file(addr.as_ref());
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted?;
                    if self.inner.live_connections.load(Ordering::SeqCst) >= MAX_CONNECTIONS {
                        error!("rejecting new connection: at connection limit ({MAX_CONNECTIONS})");
                        drop(stream);
                        continue;
                    }
                    info!("accepted unix connection");
                    self.spawn_connection(filesystem.clone(), stream, token.child_token());
                }
            }
        }
    }

    fn spawn_connection<Fs, S>(&self, filesystem: Fs, stream: S, conn_token: CancellationToken)
    where
        Fs: 'static + Filesystem + Send + Sync + Clone,
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let inner = self.inner.clone();
        inner.live_connections.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let (readhalf, writehalf) = tokio::io::split(stream);
            let res = dispatch(filesystem, readhalf, writehalf, conn_token).await;
            if let Err(e) = res {
                error!("connection error: {e}: {e:?}");
            }
            inner.live_connections.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

impl Default for Acceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct NoopFs;

    impl Filesystem for NoopFs {
        type FId = ();
    }

    #[tokio::test]
    async fn resume_allows_a_fresh_accept_loop_after_pause() {
        let acceptor = Arc::new(Acceptor::new());

        let a = acceptor.clone();
        let run = tokio::spawn(async move { a.run_tcp(NoopFs, "127.0.0.1:0").await });
        tokio::task::yield_now().await;
        acceptor.pause();
        run.await.unwrap().unwrap();

        // Without resume(), the acceptor's token stays cancelled and a second
        // run_tcp would return immediately instead of accepting.
        acceptor.resume();
        let a = acceptor.clone();
        let run = tokio::spawn(async move { a.run_tcp(NoopFs, "127.0.0.1:0").await });
        tokio::task::yield_now().await;
        assert!(!run.is_finished());
        acceptor.pause();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn has_connections_tracks_live_connection_count() {
        let acceptor = Acceptor::new();
        assert!(!acceptor.has_connections());
    }
}

/// Parse `proto!address!port` and run the matching accept loop forever.
pub async fn srv_async<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let (proto, host, port) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    let acceptor = Acceptor::new();
    match proto {
        "tcp" => acceptor.run_tcp(filesystem, &format!("{host}:{port}")).await,
        "unix" => acceptor.run_unix(filesystem, host).await,
        _ => Err(error::Error::Io(io_err!(InvalidInput, "Protocol not supported"))),
    }
}
