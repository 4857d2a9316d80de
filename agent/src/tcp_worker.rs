//! The tcp engine. Every device originated tcp connection is answered here as
//! if we were the remote host, while a real socket to the remote host is opened
//! on the side. Payload is relayed between the two and our own sequence space
//! towards the device is kept consistent with exactly what we queued to it.
//!
//! One thread runs this: each tick drains the device->network queue (flow
//! lookup/creation and the SYN/RST/FIN/ACK handlers) and then services the
//! readiness events of all the real sockets.

use crate::config::EngineConfig;
use crate::dialer::Dialer;
use crate::error::Result;
use crate::ip_util::PacketBuilder;
use crate::packet::{
    FlowKey, Packet, TcpHeader, IPV4_HEADER_LEN, TCP_ACK, TCP_FIN, TCP_HEADER_LEN, TCP_PSH,
    TCP_RST, TCP_SYN,
};
use crate::stats::Stats;
use crate::tcp_pipe::{seq_gt, FlowTable, TcbStatus, TcpPipe, INITIAL_SEQ};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, info, warn};
use mio::event::Event;
use mio::{Events, Interest, Poll, Registry, Token};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// How many device packets we process before giving the sockets a turn
const MAX_DRAIN: usize = 256;
const MAX_EVENTS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Connect,
    Read,
    Write,
    Invalid,
}

#[derive(Debug, Clone, Copy, Default)]
struct EventFlags {
    readable: bool,
    writable: bool,
    error: bool,
    read_closed: bool,
    write_closed: bool,
}

impl EventFlags {
    fn from_event(e: &Event) -> Self {
        EventFlags {
            readable: e.is_readable(),
            writable: e.is_writable(),
            error: e.is_error(),
            read_closed: e.is_read_closed(),
            write_closed: e.is_write_closed(),
        }
    }
}

fn readiness(f: EventFlags, connected: bool) -> Vec<Readiness> {
    let mut ops = Vec::with_capacity(2);
    if f.error {
        ops.push(Readiness::Invalid);
        return ops;
    }
    if !connected {
        if f.writable || f.write_closed || f.readable {
            ops.push(Readiness::Connect);
        }
        if f.readable || f.read_closed {
            ops.push(Readiness::Read);
        }
    } else {
        if f.readable || f.read_closed {
            ops.push(Readiness::Read);
        }
        if f.writable {
            ops.push(Readiness::Write);
        }
    }
    if ops.is_empty() {
        ops.push(Readiness::Invalid);
    }
    ops
}

pub struct TcpWorker {
    ingress: Receiver<Packet>,
    egress: Sender<Vec<u8>>,
    poll: Poll,
    events: Events,
    table: FlowTable,
    dialer: Arc<dyn Dialer>,
    config: EngineConfig,
    stats: Arc<Stats>,
}

impl TcpWorker {
    pub fn new(
        ingress: Receiver<Packet>,
        egress: Sender<Vec<u8>>,
        dialer: Arc<dyn Dialer>,
        config: EngineConfig,
        stats: Arc<Stats>,
    ) -> io::Result<Self> {
        Ok(TcpWorker {
            ingress,
            egress,
            poll: Poll::new()?,
            events: Events::with_capacity(MAX_EVENTS),
            table: FlowTable::new(),
            dialer,
            config,
            stats,
        })
    }

    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        info!("tcp worker started");
        let mut ret = Ok(());
        while !shutdown.load(Ordering::Relaxed) {
            let drained = self.drain_device();
            let timeout = if drained > 0 {
                Duration::from_millis(0)
            } else {
                self.config.tick
            };
            if let Err(e) = self.poll_remote(Some(timeout)) {
                ret = Err(e.into());
                break;
            }
        }
        let n = self.table.clean_all(self.poll.registry());
        Stats::set(&self.stats.tcp_flows, 0);
        info!("tcp worker stopped, closed {} flows", n);
        ret
    }

    pub fn pipe(&self, key: &FlowKey) -> Option<&TcpPipe> {
        self.table.get(key)
    }

    pub fn flow_count(&self) -> usize {
        self.table.len()
    }

    fn drain_device(&mut self) -> usize {
        let mut n = 0;
        while n < MAX_DRAIN {
            match self.ingress.try_recv() {
                Ok(pkt) => {
                    self.handle_packet(pkt);
                    n += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        n
    }

    pub fn handle_packet(&mut self, pkt: Packet) {
        let (tcp, key, source) = match (pkt.tcp(), pkt.flow_key(), pkt.source()) {
            (Some(t), Some(k), Some(s)) => (*t, k, s),
            _ => return,
        };

        if !self.table.contains(&key) {
            if tcp.is_syn() && !tcp.is_ack() && !tcp.is_rst() {
                if !self.open_pipe(key, source, &tcp) {
                    return;
                }
            } else {
                debug!("tcp {} no flow for flags {:#04x}, dropped", key, tcp.flags);
                return;
            }
        }

        if tcp.is_rst() {
            debug!("tcp {} rst from device", key);
            self.close_rst(&key);
        } else if tcp.is_syn() {
            self.on_syn(&key, &tcp);
        } else if tcp.is_fin() {
            self.on_fin(&key, &tcp, pkt.payload());
        } else if tcp.is_ack() {
            self.on_ack(&key, &tcp, pkt.payload());
        }
    }

    // First syn of a flow, get a real socket going towards the destination. If
    // we cant even start the connect, tell the device right away with an rst
    fn open_pipe(&mut self, key: FlowKey, source: SocketAddrV4, tcp: &TcpHeader) -> bool {
        let token = self.table.next_token();
        let mut stream = match self.dialer.dial_tcp(key.dst) {
            Ok(s) => s,
            Err(e) => {
                debug!("tcp {} connect failed: {}", key, e);
                refuse(&self.egress, key.dst, source, tcp.seq, self.config.window);
                return false;
            }
        };
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::WRITABLE)
        {
            warn!("tcp {} register failed: {}", key, e);
            refuse(&self.egress, key.dst, source, tcp.seq, self.config.window);
            return false;
        }
        debug!("tcp {} new flow from {}", key, source);
        self.table.insert(TcpPipe::new(key, source, stream, token));
        Stats::set(&self.stats.tcp_flows, self.table.len());
        true
    }

    fn on_syn(&mut self, key: &FlowKey, tcp: &TcpHeader) {
        let window = self.config.window;
        let pipe = match self.table.get_mut(key) {
            Some(p) => p,
            None => return,
        };
        if pipe.tcb_status == TcbStatus::SynSent {
            pipe.tcb_status = TcbStatus::SynReceived;
            pipe.their_seq = tcp.seq;
            pipe.my_ack = tcp.seq.wrapping_add(1);
            if pipe.syn_count == 0 {
                pipe.my_seq = INITIAL_SEQ;
                send_segment(pipe, &self.egress, TCP_SYN | TCP_ACK, window);
            }
        } else if pipe.tcb_status == TcbStatus::SynReceived {
            // Retransmitted syn, the syn-ack is already queued
            pipe.my_ack = tcp.seq.wrapping_add(1);
        }
        pipe.syn_count += 1;
    }

    fn on_ack(&mut self, key: &FlowKey, tcp: &TcpHeader, payload: &[u8]) {
        let window = self.config.window;
        let registry = self.poll.registry();
        let pipe = match self.table.get_mut(key) {
            Some(p) => p,
            None => return,
        };
        pipe.their_ack = tcp.ack;
        if pipe.tcb_status == TcbStatus::SynReceived {
            pipe.tcb_status = TcbStatus::Established;
            debug!("tcp {} established", key);
        }
        if payload.is_empty() || pipe.tcb_status != TcbStatus::Established {
            return;
        }
        match stage(pipe, tcp.seq, payload) {
            Staged::Stale => {}
            Staged::Gap => send_segment(pipe, &self.egress, TCP_ACK, window),
            Staged::Added => match flush(pipe, registry) {
                Ok(()) => send_segment(pipe, &self.egress, TCP_ACK, window),
                Err(e) => {
                    debug!("tcp {} write to remote failed: {}", key, e);
                    self.close_rst(key);
                }
            },
        }
    }

    fn on_fin(&mut self, key: &FlowKey, tcp: &TcpHeader, payload: &[u8]) {
        let window = self.config.window;
        let registry = self.poll.registry();
        let pipe = match self.table.get_mut(key) {
            Some(p) => p,
            None => return,
        };
        if pipe.tcb_status == TcbStatus::SynReceived && tcp.is_ack() {
            pipe.tcb_status = TcbStatus::Established;
        }
        if seq_gt(tcp.seq, pipe.my_ack) {
            // Something before the fin is missing, wait for the device to resend it
            send_segment(pipe, &self.egress, TCP_ACK, window);
            return;
        }
        if !payload.is_empty() && pipe.tcb_status == TcbStatus::Established {
            if let Staged::Added = stage(pipe, tcp.seq, payload) {
                if let Err(e) = flush(pipe, registry) {
                    debug!("tcp {} write to remote failed: {}", key, e);
                    self.close_rst(key);
                    return;
                }
            }
        }
        let fin_seq = tcp.seq.wrapping_add(payload.len() as u32);
        if fin_seq != pipe.my_ack {
            // Retransmitted fin we already acked
            send_segment(pipe, &self.egress, TCP_ACK, window);
            return;
        }
        pipe.my_ack = fin_seq.wrapping_add(1);
        pipe.their_ack = tcp.ack;
        send_segment(pipe, &self.egress, TCP_ACK, window);
        pipe.tcb_status = TcbStatus::CloseWait;
        debug!("tcp {} fin from device", key);
        if close_up_stream(pipe) {
            self.release(key);
        }
    }

    // Tears the flow down hard: both halves dead, socket released, the device
    // gets an rst
    fn close_rst(&mut self, key: &FlowKey) {
        let window = self.config.window;
        if let Some(mut pipe) = self.table.clean(key, self.poll.registry()) {
            send_segment(&mut pipe, &self.egress, TCP_RST | TCP_ACK, window);
            pipe.tcb_status = TcbStatus::CloseWait;
            debug!("tcp {} reset", key);
        }
        Stats::set(&self.stats.tcp_flows, self.table.len());
    }

    fn release(&mut self, key: &FlowKey) {
        if self.table.clean(key, self.poll.registry()).is_some() {
            debug!("tcp {} closed", key);
        }
        Stats::set(&self.stats.tcp_flows, self.table.len());
    }

    // Waits up to `timeout` for real socket readiness and services it.
    // Returns the number of events handled.
    pub fn poll_remote(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(e);
        }
        let ready: Vec<(Token, EventFlags)> = self
            .events
            .iter()
            .map(|e| (e.token(), EventFlags::from_event(e)))
            .collect();
        for (token, flags) in ready.iter() {
            if let Some(key) = self.table.key_for(*token) {
                self.on_ready(&key, *flags);
            }
        }
        Ok(ready.len())
    }

    fn on_ready(&mut self, key: &FlowKey, flags: EventFlags) {
        let ops = match self.table.get(key) {
            Some(p) => readiness(flags, p.connected),
            None => return,
        };
        let chunk = self.config.mtu - IPV4_HEADER_LEN - TCP_HEADER_LEN;
        let window = self.config.window;
        for op in ops {
            let registry = self.poll.registry();
            let pipe = match self.table.get_mut(key) {
                Some(p) => p,
                None => return,
            };
            let mut done = false;
            let res = match op {
                Readiness::Connect => do_connect(pipe, registry),
                Readiness::Read => match do_read(pipe, &self.egress, chunk, window) {
                    Ok(true) => {
                        done = close_down_stream(pipe, &self.egress, window);
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    Err(e) => Err(e),
                },
                Readiness::Write => flush(pipe, registry),
                Readiness::Invalid => Err(pipe.remote.take_error().ok().flatten().unwrap_or_else(
                    || io::Error::new(io::ErrorKind::Other, "unexpected readiness"),
                )),
            };
            if let Err(e) = res {
                debug!("tcp {} remote socket error: {}", key, e);
                self.close_rst(key);
                return;
            }
            if done {
                self.release(key);
                return;
            }
        }
    }
}

enum Staged {
    // Everything in the segment was already received
    Stale,
    // The segment starts beyond what we expect next
    Gap,
    // New bytes were appended to remote_out
    Added,
}

fn stage(pipe: &mut TcpPipe, seq: u32, payload: &[u8]) -> Staged {
    let end = seq.wrapping_add(payload.len() as u32);
    if !seq_gt(end, pipe.my_ack) {
        return Staged::Stale;
    }
    if seq_gt(seq, pipe.my_ack) {
        return Staged::Gap;
    }
    let skip = pipe.my_ack.wrapping_sub(seq) as usize;
    pipe.remote_out.extend_from_slice(&payload[skip..]);
    pipe.their_seq = seq;
    pipe.my_ack = end;
    Staged::Added
}

// Queues a payload-less segment to the device and accounts for it in my_seq
fn send_segment(pipe: &mut TcpPipe, egress: &Sender<Vec<u8>>, flags: u8, window: u16) {
    let pkt = pipe.segment(flags, window, 0).finish();
    if egress.send(pkt).is_ok() {
        pipe.advance(flags, 0);
    }
}

// Rst for a syn we could not even start connecting for, there is no pipe
fn refuse(egress: &Sender<Vec<u8>>, from: SocketAddrV4, to: SocketAddrV4, isn: u32, window: u16) {
    let pkt = PacketBuilder::tcp(
        from,
        to,
        0,
        0,
        isn.wrapping_add(1),
        TCP_RST | TCP_ACK,
        window,
        0,
    )
    .finish();
    egress.send(pkt).ok();
}

// Pushes as much of remote_out to the remote socket as it takes. Write
// interest stays armed only while something is left over.
fn flush(pipe: &mut TcpPipe, registry: &Registry) -> io::Result<()> {
    if !pipe.connected {
        return Ok(());
    }
    while !pipe.remote_out.is_empty() {
        match pipe.remote.write(&pipe.remote_out) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                pipe.remote_out.drain(..n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    if pipe.remote_out.is_empty() {
        pipe.remote_out.shrink_to_fit();
        if pipe.shutdown_pending {
            pipe.shutdown_pending = false;
            pipe.remote.shutdown(Shutdown::Write)?;
        }
        pipe.set_interest(registry, Interest::READABLE)
    } else {
        pipe.set_interest(registry, Interest::READABLE | Interest::WRITABLE)
    }
}

// The real socket finished connecting (or failed to). Anything the device sent
// meanwhile is sitting in remote_out, so arm read and write and flush it.
fn do_connect(pipe: &mut TcpPipe, registry: &Registry) -> io::Result<()> {
    if let Some(e) = pipe.remote.take_error()? {
        return Err(e);
    }
    match pipe.remote.peer_addr() {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
        Err(e) => return Err(e),
    }
    pipe.connected = true;
    debug!("tcp {} remote connected", pipe.tunnel_key);
    pipe.set_interest(registry, Interest::READABLE | Interest::WRITABLE)?;
    flush(pipe, registry)
}

// Reads everything the remote has for us and queues it to the device as
// data segments, reading straight into the outgoing packet. Returns true once
// the remote has closed its side.
fn do_read(
    pipe: &mut TcpPipe,
    egress: &Sender<Vec<u8>>,
    chunk: usize,
    window: u16,
) -> io::Result<bool> {
    if !pipe.connected || !pipe.down_active {
        return Ok(false);
    }
    loop {
        let mut seg = pipe.segment(TCP_ACK | TCP_PSH, window, chunk);
        match pipe.remote.read(seg.payload_mut()) {
            Ok(0) => return Ok(true),
            Ok(n) => {
                seg.set_payload_len(n);
                if egress.send(seg.finish()).is_ok() {
                    pipe.advance(TCP_ACK, n);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

// Device is done sending. Returns true when the other half is gone too and
// the pipe can be released.
fn close_up_stream(pipe: &mut TcpPipe) -> bool {
    pipe.up_active = false;
    if pipe.connected && pipe.remote_out.is_empty() {
        pipe.remote.shutdown(Shutdown::Write).ok();
    } else {
        pipe.shutdown_pending = true;
    }
    !pipe.down_active
}

// Remote is done sending, pass the fin on. Returns true when the other half
// is gone too and the pipe can be released.
fn close_down_stream(pipe: &mut TcpPipe, egress: &Sender<Vec<u8>>, window: u16) -> bool {
    pipe.down_active = false;
    send_segment(pipe, egress, TCP_FIN | TCP_ACK, window);
    if !pipe.up_active {
        pipe.tcb_status = TcbStatus::LastAck;
        return true;
    }
    false
}
