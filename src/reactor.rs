//! The reactor (§4.6): a single-threaded event loop that owns a TCP
//! listener and drives a [`Session`] per connection to completion.
//!
//! Every session on a reactor lives on the same OS thread — there is no
//! intra-process multithreading here, matching §4.6/§5's "suspension
//! points: I/O readiness only", the same posture as driving one
//! `async_global_executor` task per connection rather than a thread pool.
//! Horizontal scale is achieved by running independent reactors in
//! separate processes, not by adding worker threads to this one.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use netsync_core::{DeltaStore, NetsyncError, Role};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::LocalSet;

use crate::config::{Config, BUFFER_SIZE};
use crate::keystore::Keystore;
use crate::policy::Policy;
use crate::session::{Disposition, Session, SessionState};
use crate::transfer::{NoRevisionIndex, RevisionIndex};

/// A peer to dial as a client. Grounded on
/// `network/connection_info.cc`'s `sync:host:port` address
/// form with an include/exclude glob suffix; the full URI grammar (the
/// `sync:` scheme, percent-encoding, etc.) is a CLI front-end concern
/// and out of scope (§1).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerAddress {
    /// Hostname or IP literal to dial.
    pub host: String,
    /// TCP port to dial.
    pub port: u16,
    /// Include glob to present in the `Anonymous`/`Auth` request.
    pub include: String,
    /// Exclude glob to present in the `Anonymous`/`Auth` request.
    pub exclude: String,
}

impl PeerAddress {
    /// Parse `host:port`, `host:port,include` or `host:port,include,exclude`.
    pub fn parse(addr: &str) -> Result<Self, NetsyncError> {
        let mut fields = addr.split(',');
        let host_port = fields
            .next()
            .ok_or_else(|| NetsyncError::BadEncoding("empty peer address".into()))?;
        let (host, port) = host_port.rsplit_once(':').ok_or_else(|| {
            NetsyncError::BadEncoding(format!("peer address {:?} is missing a port", addr))
        })?;
        let port: u16 = port
            .parse()
            .map_err(|_| NetsyncError::BadEncoding(format!("bad port in {:?}", addr)))?;
        let include = fields.next().unwrap_or("*").to_string();
        let exclude = fields.next().unwrap_or("").to_string();
        Ok(Self {
            host: host.to_string(),
            port,
            include,
            exclude,
        })
    }

    fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Owns the collaborators a reactor hands every session it drives, and
/// the event loop itself.
pub struct Reactor<S: DeltaStore> {
    cfg: Config,
    keystore: Rc<dyn Keystore>,
    policy: Rc<dyn Policy>,
    store: Rc<RefCell<S>>,
    revision_index: Rc<dyn RevisionIndex>,
}

impl<S: DeltaStore + 'static> Reactor<S> {
    /// Build a reactor around a single store shared by every session it
    /// drives (§5: "one store per reactor, shared read/write across
    /// sessions via the same collaborator instance").
    pub fn new(
        cfg: Config,
        keystore: Rc<dyn Keystore>,
        policy: Rc<dyn Policy>,
        store: Rc<RefCell<S>>,
    ) -> Self {
        Self {
            cfg,
            keystore,
            policy,
            store,
            revision_index: Rc::new(NoRevisionIndex),
        }
    }

    /// Attach a [`RevisionIndex`] used by every session this reactor
    /// drives from here on.
    pub fn with_revision_index(mut self, index: Rc<dyn RevisionIndex>) -> Self {
        self.revision_index = index;
        self
    }

    /// Run the accept loop on `listener` until it errors. Each accepted
    /// connection becomes a server-voice session spawned onto the same
    /// `LocalSet` (§4.6: no cross-thread spawning).
    pub async fn serve(&self, listener: TcpListener, local: &LocalSet) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::info!(%peer, "accepted connection");
            let session = Session::server(
                self.cfg.clone(),
                self.keystore.clone(),
                self.policy.clone(),
                self.store.clone(),
                Instant::now(),
            )?
            .with_revision_index(self.revision_index.clone());
            let idle_timeout = self.cfg.idle_timeout;
            local.spawn_local(async move {
                if let Err(err) = drive_session(session, stream, idle_timeout).await {
                    tracing::warn!(%peer, error = %err, "session ended with an error");
                }
            });
        }
    }

    /// Dial `addr` and run a client-voice session to completion on the
    /// calling task (§6.1: the client side of a connection).
    pub async fn connect(
        &self,
        addr: &PeerAddress,
        role: Role,
    ) -> anyhow::Result<()> {
        let stream = TcpStream::connect(addr.socket_addr()).await?;
        let session = Session::client(
            self.cfg.clone(),
            self.keystore.clone(),
            self.policy.clone(),
            self.store.clone(),
            role,
            addr.include.clone(),
            addr.exclude.clone(),
            Instant::now(),
        )
        .with_revision_index(self.revision_index.clone());
        drive_session(session, stream, self.cfg.idle_timeout).await
    }
}

/// Pump bytes between `stream` and `session` until the session closes or
/// goes idle (§4.6's loop: flush output, read more input, repeat;
/// §5's idle-eviction tick). This is the only place in the crate that
/// touches a live byte stream — `Session` itself is pure state and
/// buffers. Generic over the stream type (not just `TcpStream`) so tests
/// can drive a real `Session`/`Reactor` pairing over an in-process
/// `tokio::io::duplex` pipe instead of a real socket.
pub async fn drive_session<S: DeltaStore, T: AsyncRead + AsyncWrite + Unpin>(
    mut session: Session<S>,
    mut stream: T,
    idle_timeout: Duration,
) -> anyhow::Result<()> {
    let mut read_buf = vec![0u8; BUFFER_SIZE as usize];
    let mut idle_tick = tokio::time::interval(idle_timeout.min(Duration::from_secs(30)).max(Duration::from_millis(100)));
    idle_tick.tick().await; // the first tick fires immediately; consume it

    loop {
        // Drain whatever the session wants to send right now. This isn't
        // purely reactive to inbound frames: a side may still have queued
        // file/manifest content (or be waiting to reply `Bye(1)` once its
        // own queue empties, §4.2) with no further bytes due from the
        // peer, so `pump_sends` is re-polled here until it stops producing
        // output rather than only after a read (§4.6 steps 4-5).
        loop {
            session.pump_sends();
            while !session.outbound().is_empty() {
                let n = stream.write(session.outbound()).await?;
                if n == 0 {
                    anyhow::bail!("peer closed the connection while a write was pending");
                }
                session.note_flushed(n, Instant::now());
            }
            if !session.has_pending_sends() {
                break;
            }
        }
        if matches!(session.state(), SessionState::Confirmed | SessionState::ErrorFlush) {
            break;
        }

        tokio::select! {
            read = stream.read(&mut read_buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                session.feed(&read_buf[..n], Instant::now());
                if session.poll()? == Disposition::Close && session.outbound().is_empty() {
                    break;
                }
            }
            _ = idle_tick.tick() => {
                if session.is_idle(Instant::now()) {
                    tracing::debug!("evicting idle session");
                    session.disconnect_silently();
                }
            }
        }
    }
    let _ = stream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_address_parses_host_port() {
        let addr = PeerAddress::parse("example.org:4691").unwrap();
        assert_eq!(addr.host, "example.org");
        assert_eq!(addr.port, 4691);
        assert_eq!(addr.include, "*");
        assert_eq!(addr.exclude, "");
    }

    #[test]
    fn peer_address_parses_globs() {
        let addr = PeerAddress::parse("10.0.0.1:4691,net.example.*,net.example.private").unwrap();
        assert_eq!(addr.include, "net.example.*");
        assert_eq!(addr.exclude, "net.example.private");
    }

    #[test]
    fn peer_address_rejects_missing_port() {
        assert!(PeerAddress::parse("example.org").is_err());
    }
}
