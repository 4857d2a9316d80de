//! The three threads behind the udp nat table: outbound datagrams from the
//! device, inbound datagrams from the real sockets, and the idle reaper.

use crate::config::EngineConfig;
use crate::dialer::Dialer;
use crate::error::Result;
use crate::ip_util::PacketBuilder;
use crate::packet::{Packet, IPV4_HEADER_LEN, UDP_HEADER_LEN};
use crate::stats::Stats;
use crate::udp_nat::{UdpNatTable, UdpTunnel};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, info, trace};
use mio::{Events, Poll};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const MAX_EVENTS: usize = 256;
// Largest udp payload an ipv4 datagram can carry
const MAX_DATAGRAM: usize = 65507;

// Device -> network. Finds or opens the nat entry for every datagram and
// sends its payload on the entry's socket.
pub struct UdpSendWorker {
    ingress: Receiver<Packet>,
    table: Arc<UdpNatTable>,
    // New entries are handed to the receive worker which owns the poller
    register: Sender<Arc<UdpTunnel>>,
    dialer: Arc<dyn Dialer>,
    config: EngineConfig,
    stats: Arc<Stats>,
}

impl UdpSendWorker {
    pub fn new(
        ingress: Receiver<Packet>,
        table: Arc<UdpNatTable>,
        register: Sender<Arc<UdpTunnel>>,
        dialer: Arc<dyn Dialer>,
        config: EngineConfig,
        stats: Arc<Stats>,
    ) -> Self {
        UdpSendWorker {
            ingress,
            table,
            register,
            dialer,
            config,
            stats,
        }
    }

    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        info!("udp send worker started");
        while !shutdown.load(Ordering::Relaxed) {
            match self.ingress.recv_timeout(self.config.device_poll_timeout) {
                Ok(pkt) => self.handle_packet(pkt),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("udp send worker stopped");
        Ok(())
    }

    pub fn handle_packet(&mut self, pkt: Packet) {
        let (key, local) = match (pkt.flow_key(), pkt.source()) {
            (Some(k), Some(s)) => (k, s),
            _ => return,
        };
        let payload = pkt.payload();

        if let Some(tunnel) = self.table.get(&key) {
            match tunnel.send(payload) {
                Ok(_) => {
                    tunnel.touch(Instant::now());
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!("udp {} socket full, dropped", key);
                    Stats::bump(&self.stats.dropped);
                    return;
                }
                Err(e) => {
                    // Broken or closed under us, start over with a fresh socket
                    debug!("udp {} send failed: {}", key, e);
                    self.table.remove(&tunnel);
                }
            }
        }

        let channel = match self.dialer.open_udp(key.dst) {
            Ok(c) => c,
            Err(e) => {
                debug!("udp {} open failed: {}, dropped", key, e);
                Stats::bump(&self.stats.dropped);
                return;
            }
        };
        let tunnel = self.table.insert(
            key,
            local,
            channel,
            self.config.udp_timeout_for(key.dst.port()),
        );
        debug!("udp {} new entry from {}", key, local);
        Stats::set(&self.stats.udp_flows, self.table.len());
        if self.register.send(tunnel.clone()).is_err() {
            // Receive side is gone, we are shutting down
            self.table.remove(&tunnel);
            return;
        }
        match tunnel.send(payload) {
            Ok(_) => tunnel.touch(Instant::now()),
            Err(e) => {
                debug!("udp {} send failed: {}, dropped", key, e);
                Stats::bump(&self.stats.dropped);
            }
        }
    }
}

// Network -> device. Owns the poller all nat sockets are registered with,
// wraps every datagram received into an ip/udp packet for the device.
pub struct UdpReceiveWorker {
    poll: Poll,
    events: Events,
    scratch: Vec<u8>,
    table: Arc<UdpNatTable>,
    register: Receiver<Arc<UdpTunnel>>,
    egress: Sender<Vec<u8>>,
    config: EngineConfig,
    stats: Arc<Stats>,
}

impl UdpReceiveWorker {
    // `poll` must be the poller whose registry `table` was created with
    pub fn new(
        poll: Poll,
        table: Arc<UdpNatTable>,
        register: Receiver<Arc<UdpTunnel>>,
        egress: Sender<Vec<u8>>,
        config: EngineConfig,
        stats: Arc<Stats>,
    ) -> Self {
        UdpReceiveWorker {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            scratch: vec![0u8; MAX_DATAGRAM],
            table,
            register,
            egress,
            config,
            stats,
        }
    }

    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        info!("udp receive worker started");
        let mut ret = Ok(());
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.poll_once(Some(self.config.tick)) {
                ret = Err(e.into());
                break;
            }
        }
        let n = self.table.close_all();
        Stats::set(&self.stats.udp_flows, 0);
        info!("udp receive worker stopped, closed {} entries", n);
        ret
    }

    // Registers pending entries, then services one round of readiness events.
    // Returns the number of datagrams forwarded to the device.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.register_pending();
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(e);
        }
        let tokens: Vec<_> = self.events.iter().map(|e| e.token()).collect();
        let mut forwarded = 0;
        for token in tokens {
            if let Some(tunnel) = self.table.by_token(token) {
                forwarded += self.drain(&tunnel);
            }
        }
        Ok(forwarded)
    }

    fn register_pending(&mut self) {
        loop {
            let tunnel = match self.register.try_recv() {
                Ok(t) => t,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            };
            match tunnel.register(self.poll.registry()) {
                Ok(true) => {}
                Ok(false) => trace!("udp {} closed before registration", tunnel.key),
                Err(e) => {
                    debug!("udp {} register failed: {}", tunnel.key, e);
                    self.table.remove(&tunnel);
                }
            }
        }
    }

    // Reads until the socket has nothing more, the poller is edge triggered
    fn drain(&mut self, tunnel: &Arc<UdpTunnel>) -> usize {
        let max = self.config.mtu - IPV4_HEADER_LEN - UDP_HEADER_LEN;
        let mut forwarded = 0;
        loop {
            match tunnel.recv(&mut self.scratch) {
                Ok(n) if n > max => {
                    // Would not fit the device mtu, and a cut down copy is corrupt
                    debug!("udp {} {} byte datagram over mtu, dropped", tunnel.key, n);
                    tunnel.touch(Instant::now());
                    Stats::bump(&self.stats.dropped);
                }
                Ok(n) => {
                    let mut builder =
                        PacketBuilder::udp(tunnel.remote, tunnel.local, tunnel.next_id(), n);
                    builder.payload_mut().copy_from_slice(&self.scratch[..n]);
                    tunnel.touch(Instant::now());
                    if self.egress.send(builder.finish()).is_err() {
                        return forwarded;
                    }
                    forwarded += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return forwarded,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Refused, unreachable or closed. The next datagram from the
                    // device opens a new entry
                    debug!("udp {} recv failed: {}", tunnel.key, e);
                    self.table.remove(tunnel);
                    Stats::set(&self.stats.udp_flows, self.table.len());
                    return forwarded;
                }
            }
        }
    }
}

pub struct UdpSocketCleanWorker {
    table: Arc<UdpNatTable>,
    config: EngineConfig,
    stats: Arc<Stats>,
}

impl UdpSocketCleanWorker {
    pub fn new(table: Arc<UdpNatTable>, config: EngineConfig, stats: Arc<Stats>) -> Self {
        UdpSocketCleanWorker {
            table,
            config,
            stats,
        }
    }

    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        info!("udp clean worker started");
        let mut last = Instant::now();
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(self.config.device_poll_timeout.min(self.config.udp_clean_interval));
            let now = Instant::now();
            if now.duration_since(last) >= self.config.udp_clean_interval {
                self.clean(now);
                last = now;
            }
        }
        info!("udp clean worker stopped");
        Ok(())
    }

    pub fn clean(&self, now: Instant) -> usize {
        let n = self.table.evict_idle(now);
        if n > 0 {
            debug!("udp evicted {} idle entries", n);
            Stats::set(&self.stats.udp_flows, self.table.len());
        }
        n
    }
}
