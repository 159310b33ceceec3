//! Pool of idle backend connections.
//!
//! Entries keep their wire channel together with the server-side protocol
//! view (greeting, authenticated user, sent attributes, schema). A reused
//! entry therefore re-enters preparation with its identity known, which is
//! what lets the connector pick session reset over a full re-handshake.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::backend::context::ServerView;
use crate::config::PoolConfig;
use crate::protocol::{Packet, PacketCodec, SEQ_NO_PRIOR_PACKET};

/// A framed wire channel to one backend
pub struct BackendChannel {
    framed: Framed<TcpStream, PacketCodec>,
    addr: String,
    created_at: Instant,
}

impl BackendChannel {
    pub fn new(stream: TcpStream, addr: String) -> Self {
        Self {
            framed: Framed::new(stream, PacketCodec),
            addr,
            created_at: Instant::now(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.created_at.elapsed() > max_age
    }

    pub async fn send(&mut self, packet: Packet) -> std::io::Result<()> {
        self.framed.send(packet).await
    }

    pub async fn recv(&mut self) -> std::io::Result<Packet> {
        match self.framed.next().await {
            Some(result) => result,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed the connection",
            )),
        }
    }
}

/// One pooled backend: the channel plus the session identity it carries
pub struct PooledBackend {
    pub channel: BackendChannel,
    pub view: ServerView,
    pooled_at: Instant,
}

impl PooledBackend {
    pub fn new(channel: BackendChannel, mut view: ServerView) -> Self {
        // a pooled channel has no packet in flight
        view.seq_id = SEQ_NO_PRIOR_PACKET;
        view.open = false;

        Self {
            channel,
            view,
            pooled_at: Instant::now(),
        }
    }
}

/// Shared pool of idle backends, keyed by backend address
pub struct BackendPool {
    max_idle: usize,
    max_age: Duration,
    max_idle_time: Duration,
    idle: Mutex<HashMap<String, VecDeque<PooledBackend>>>,
}

impl BackendPool {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            max_idle: config.max_idle,
            max_age: Duration::from_secs(config.max_age_secs),
            max_idle_time: Duration::from_secs(config.max_idle_time_secs),
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Take an idle backend for `addr`, discarding stale entries
    pub async fn get(&self, addr: &str) -> Option<PooledBackend> {
        let mut idle = self.idle.lock().await;
        let queue = idle.get_mut(addr)?;

        while let Some(pooled) = queue.pop_front() {
            if pooled.channel.is_expired(self.max_age) {
                debug!(addr = addr, "Pooled backend expired, discarding");
                continue;
            }

            if pooled.pooled_at.elapsed() > self.max_idle_time {
                debug!(addr = addr, "Pooled backend idle too long, discarding");
                continue;
            }

            debug!(addr = addr, "Reusing pooled backend");
            return Some(pooled);
        }

        None
    }

    /// Offer a backend to the pool. Returns it back when there is no room,
    /// so the caller can close it gracefully.
    pub async fn put(&self, pooled: PooledBackend) -> Option<PooledBackend> {
        if pooled.channel.is_expired(self.max_age) {
            debug!("Backend expired, refusing to pool");
            return Some(pooled);
        }

        let mut idle = self.idle.lock().await;
        let queue = idle
            .entry(pooled.channel.addr().to_string())
            .or_default();

        if queue.len() >= self.max_idle {
            debug!(
                addr = pooled.channel.addr(),
                "Pool full, refusing backend"
            );
            return Some(pooled);
        }

        queue.push_back(pooled);
        None
    }
}
