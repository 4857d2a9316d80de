use crate::ip_util::PacketBuilder;
use crate::packet::{FlowKey, TCP_FIN, TCP_SYN};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddrV4};

// The sequence number we start our side of every spliced connection with
pub const INITIAL_SEQ: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcbStatus {
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    LastAck,
    Closed,
}

// a > b in sequence space
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Per flow state. The device talks tcp to this struct as if it was the remote
/// host, and the struct owns a genuine socket to the remote host. Bytes are
/// relayed between the two and the sequence numbers translated.
#[derive(Debug)]
pub struct TcpPipe {
    pub tunnel_key: FlowKey,
    pub source: SocketAddrV4,
    // Remote endpoint, also the address we pretend to be towards the device
    pub destination: SocketAddrV4,
    pub tcb_status: TcbStatus,
    // Next sequence number of ours the device has not seen yet
    pub my_seq: u32,
    // Next byte we expect from the device
    pub my_ack: u32,
    pub their_seq: u32,
    pub their_ack: u32,
    pub pack_id: u16,
    pub syn_count: u32,
    // device -> remote half is open
    pub up_active: bool,
    // remote -> device half is open
    pub down_active: bool,
    pub(crate) remote: TcpStream,
    pub(crate) token: Token,
    pub(crate) interest: Interest,
    pub(crate) connected: bool,
    // Bytes from the device not yet accepted by the remote socket
    pub(crate) remote_out: Vec<u8>,
    // Upstream was closed while remote_out still had data, shut the remote
    // write side once it drains
    pub(crate) shutdown_pending: bool,
}

impl TcpPipe {
    pub fn new(
        tunnel_key: FlowKey,
        source: SocketAddrV4,
        remote: TcpStream,
        token: Token,
    ) -> TcpPipe {
        TcpPipe {
            tunnel_key,
            source,
            destination: tunnel_key.dst,
            tcb_status: TcbStatus::SynSent,
            my_seq: 0,
            my_ack: 0,
            their_seq: 0,
            their_ack: 0,
            pack_id: 0,
            syn_count: 0,
            up_active: true,
            down_active: true,
            remote,
            token,
            interest: Interest::WRITABLE,
            connected: false,
            remote_out: Vec::new(),
            shutdown_pending: false,
        }
    }

    pub fn pending_out(&self) -> usize {
        self.remote_out.len()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn next_id(&mut self) -> u16 {
        self.pack_id = self.pack_id.wrapping_add(1);
        self.pack_id
    }

    // Lays out a segment from the remote towards the device carrying our
    // current seq/ack, with `payload_len` bytes reserved for data
    pub fn segment(&mut self, flags: u8, window: u16, payload_len: usize) -> PacketBuilder {
        let id = self.next_id();
        PacketBuilder::tcp(
            self.destination,
            self.source,
            id,
            self.my_seq,
            self.my_ack,
            flags,
            window,
            payload_len,
        )
    }

    // Moves my_seq past a segment that has been queued to the device
    pub fn advance(&mut self, flags: u8, payload_len: usize) {
        let mut n = payload_len as u32;
        if flags & (TCP_SYN | TCP_FIN) != 0 {
            n += 1;
        }
        self.my_seq = self.my_seq.wrapping_add(n);
    }

    pub(crate) fn set_interest(
        &mut self,
        registry: &Registry,
        interest: Interest,
    ) -> io::Result<()> {
        if self.interest != interest {
            registry.reregister(&mut self.remote, self.token, interest)?;
            self.interest = interest;
        }
        Ok(())
    }
}

/// All live tcp flows. Owned by the tcp worker thread only, so there is no
/// locking here. A pipe is in the table exactly as long as its socket is open:
/// `clean` removes the entry and shuts the socket in one go.
#[derive(Debug, Default)]
pub struct FlowTable {
    pipes: HashMap<FlowKey, TcpPipe>,
    tokens: HashMap<Token, FlowKey>,
    next_token: usize,
}

impl FlowTable {
    pub fn new() -> Self {
        FlowTable::default()
    }

    pub fn next_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token = self.next_token.wrapping_add(1);
        t
    }

    pub fn insert(&mut self, pipe: TcpPipe) {
        self.tokens.insert(pipe.token, pipe.tunnel_key);
        self.pipes.insert(pipe.tunnel_key, pipe);
    }

    pub fn get(&self, key: &FlowKey) -> Option<&TcpPipe> {
        self.pipes.get(key)
    }

    pub fn get_mut(&mut self, key: &FlowKey) -> Option<&mut TcpPipe> {
        self.pipes.get_mut(key)
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.pipes.contains_key(key)
    }

    pub fn key_for(&self, token: Token) -> Option<FlowKey> {
        self.tokens.get(&token).copied()
    }

    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }

    // Removes the flow, deregisters and shuts down its socket. The returned
    // pipe only carries the final sequence state, its socket is dead.
    pub fn clean(&mut self, key: &FlowKey, registry: &Registry) -> Option<TcpPipe> {
        let mut pipe = self.pipes.remove(key)?;
        self.tokens.remove(&pipe.token);
        registry.deregister(&mut pipe.remote).ok();
        pipe.remote.shutdown(Shutdown::Both).ok();
        pipe.up_active = false;
        pipe.down_active = false;
        pipe.remote_out.clear();
        pipe.tcb_status = TcbStatus::Closed;
        Some(pipe)
    }

    pub fn clean_all(&mut self, registry: &Registry) -> usize {
        let keys: Vec<FlowKey> = self.pipes.keys().copied().collect();
        for k in keys.iter() {
            self.clean(k, registry);
        }
        self.pipes.shrink_to_fit();
        self.tokens.shrink_to_fit();
        keys.len()
    }
}
