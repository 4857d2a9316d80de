//! Udp "nat": one real datagram socket per device side udp flow.
//!
//! The table is touched by three threads - the send worker inserts entries,
//! the receive worker reads from them and drops broken ones, the reaper evicts
//! idle ones. Every mutation holds the table's write lock; lookups on the send
//! path only take the read lock. Closing an entry's socket always happens
//! together with removing the entry, under the write lock, and only once.

use crate::packet::FlowKey;
use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct UdpTunnel {
    pub key: FlowKey,
    // Device side endpoint, responses are addressed here
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    token: Token,
    idle_timeout: Duration,
    // None once the entry is closed
    channel: Mutex<Option<UdpSocket>>,
    last_time: Mutex<Instant>,
    pack_id: AtomicU16,
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "udp tunnel closed")
}

impl UdpTunnel {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self.channel.lock().as_ref() {
            Some(sock) => sock.send(buf),
            None => Err(closed()),
        }
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.channel.lock().as_ref() {
            Some(sock) => sock.recv(buf),
            None => Err(closed()),
        }
    }

    pub fn touch(&self, now: Instant) {
        let mut last = self.last_time.lock();
        if now > *last {
            *last = now;
        }
    }

    pub fn last_time(&self) -> Instant {
        *self.last_time.lock()
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_time()) > self.idle_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.channel.lock().is_none()
    }

    pub fn next_id(&self) -> u16 {
        self.pack_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    // Registers the channel for read readiness. Called only from the thread
    // owning the poller `registry` belongs to. A tunnel closed before it got
    // here is skipped.
    pub fn register(&self, registry: &Registry) -> io::Result<bool> {
        match self.channel.lock().as_mut() {
            Some(sock) => {
                registry.register(sock, self.token, Interest::READABLE)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // Drops the socket. Returns false if it was already closed.
    fn close(&self, registry: &Registry) -> bool {
        match self.channel.lock().take() {
            Some(mut sock) => {
                registry.deregister(&mut sock).ok();
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct NatInner {
    tunnels: HashMap<FlowKey, Arc<UdpTunnel>>,
    tokens: HashMap<Token, FlowKey>,
    next_token: usize,
}

pub struct UdpNatTable {
    inner: RwLock<NatInner>,
    // Registry of the receive worker's poller, used to deregister on close
    registry: Registry,
}

impl UdpNatTable {
    pub fn new(registry: Registry) -> Self {
        UdpNatTable {
            inner: RwLock::new(NatInner::default()),
            registry,
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<UdpTunnel>> {
        self.inner.read().tunnels.get(key).cloned()
    }

    pub fn by_token(&self, token: Token) -> Option<Arc<UdpTunnel>> {
        let inner = self.inner.read();
        inner
            .tokens
            .get(&token)
            .and_then(|k| inner.tunnels.get(k))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Adds an entry for `key` around an already connected channel. An older
    // entry for the same key is closed and replaced.
    pub fn insert(
        &self,
        key: FlowKey,
        local: SocketAddrV4,
        channel: UdpSocket,
        idle_timeout: Duration,
    ) -> Arc<UdpTunnel> {
        let mut inner = self.inner.write();
        let token = Token(inner.next_token);
        inner.next_token = inner.next_token.wrapping_add(1);
        let tunnel = Arc::new(UdpTunnel {
            key,
            local,
            remote: key.dst,
            token,
            idle_timeout,
            channel: Mutex::new(Some(channel)),
            last_time: Mutex::new(Instant::now()),
            pack_id: AtomicU16::new(0),
        });
        if let Some(old) = inner.tunnels.insert(key, tunnel.clone()) {
            inner.tokens.remove(&old.token);
            old.close(&self.registry);
        }
        inner.tokens.insert(token, key);
        tunnel
    }

    // Removes and closes `tunnel` if it is still the entry for its key
    pub fn remove(&self, tunnel: &Arc<UdpTunnel>) -> bool {
        let mut inner = self.inner.write();
        let current = match inner.tunnels.get(&tunnel.key) {
            Some(t) => Arc::ptr_eq(t, tunnel),
            None => false,
        };
        if current {
            inner.tunnels.remove(&tunnel.key);
            inner.tokens.remove(&tunnel.token);
        }
        tunnel.close(&self.registry);
        current
    }

    // Evicts and closes every entry idle at `now`, returns how many went
    pub fn evict_idle(&self, now: Instant) -> usize {
        let mut inner = self.inner.write();
        let idle: Vec<FlowKey> = inner
            .tunnels
            .iter()
            .filter(|(_, t)| t.is_idle(now))
            .map(|(k, _)| *k)
            .collect();
        for k in idle.iter() {
            if let Some(t) = inner.tunnels.remove(k) {
                inner.tokens.remove(&t.token);
                t.close(&self.registry);
            }
        }
        if !idle.is_empty() {
            inner.tunnels.shrink_to_fit();
            inner.tokens.shrink_to_fit();
        }
        idle.len()
    }

    pub fn close_all(&self) -> usize {
        let mut inner = self.inner.write();
        let n = inner.tunnels.len();
        for (_, t) in inner.tunnels.drain() {
            t.close(&self.registry);
        }
        inner.tokens.clear();
        n
    }
}
