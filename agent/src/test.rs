use super::*;
use crate::ip_util::{transport_checksum, PacketBuilder};
use crate::packet::{FlowKey, Packet, Protocol, TCP_ACK, TCP_FIN, TCP_PSH, TCP_RST, TCP_SYN};
use crate::stats::Stats;
use crate::tcp_pipe::TcbStatus;
use crate::tcp_worker::TcpWorker;
use crate::udp_nat::UdpNatTable;
use crate::udp_worker::{UdpReceiveWorker, UdpSendWorker, UdpSocketCleanWorker};
use crossbeam_channel::{unbounded, Receiver};
use mio::Poll;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Sends every flow to local test servers whatever the destination
struct Loopback {
    tcp: SocketAddr,
    udp: SocketAddr,
}

impl Dialer for Loopback {
    fn dial_tcp(&self, _dst: SocketAddrV4) -> io::Result<mio::net::TcpStream> {
        mio::net::TcpStream::connect(self.tcp)
    }

    fn open_udp(&self, _dst: SocketAddrV4) -> io::Result<mio::net::UdpSocket> {
        let sock = mio::net::UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
        sock.connect(self.udp)?;
        Ok(sock)
    }
}

struct Refusing;

impl Dialer for Refusing {
    fn dial_tcp(&self, _dst: SocketAddrV4) -> io::Result<mio::net::TcpStream> {
        Err(io::ErrorKind::ConnectionRefused.into())
    }

    fn open_udp(&self, _dst: SocketAddrV4) -> io::Result<mio::net::UdpSocket> {
        Err(io::ErrorKind::ConnectionRefused.into())
    }
}

fn client() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 5000)
}

fn server() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80)
}

fn flow() -> FlowKey {
    FlowKey::new(server(), client().port())
}

fn tcp_seg(seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Packet {
    let mut b = PacketBuilder::tcp(client(), server(), 1, seq, ack, flags, 65535, payload.len());
    b.payload_mut().copy_from_slice(payload);
    Packet::parse(b.finish()).unwrap()
}

fn udp_dgram(from_port: u16, to: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), from_port);
    let mut b = PacketBuilder::udp(src, to, 1, payload.len());
    b.payload_mut().copy_from_slice(payload);
    b.finish()
}

fn next_packet(egress: &Receiver<Vec<u8>>) -> Packet {
    let bytes = egress.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(transport_checksum(&bytes, Packet::parse(bytes.clone()).unwrap().protocol()), 0);
    Packet::parse(bytes).unwrap()
}

fn tcp_worker(dialer: Arc<dyn Dialer>) -> (TcpWorker, Receiver<Vec<u8>>) {
    let (_tx, ingress) = unbounded();
    let (egress_tx, egress) = unbounded();
    let w = TcpWorker::new(
        ingress,
        egress_tx,
        dialer,
        EngineConfig::default(),
        Arc::new(Stats::default()),
    )
    .unwrap();
    (w, egress)
}

fn loopback(tcp: SocketAddr) -> Arc<dyn Dialer> {
    Arc::new(Loopback {
        tcp,
        udp: SocketAddr::from((Ipv4Addr::LOCALHOST, 9)),
    })
}

fn pump_until<F: Fn(&TcpWorker) -> bool>(w: &mut TcpWorker, cond: F) {
    for _ in 0..300 {
        if cond(w) {
            return;
        }
        w.poll_remote(Some(Duration::from_millis(10))).unwrap();
    }
    panic!("tcp worker never reached the expected state");
}

fn connected(w: &TcpWorker) -> bool {
    w.pipe(&flow()).map_or(false, |p| p.is_connected())
}

// Syn, syn-ack and the final ack, returns the accepted server side
fn handshake(
    w: &mut TcpWorker,
    egress: &Receiver<Vec<u8>>,
    listener: &TcpListener,
) -> std::net::TcpStream {
    w.handle_packet(tcp_seg(100, 0, TCP_SYN, b""));
    let synack = next_packet(egress);
    let t = synack.tcp().unwrap();
    assert_eq!(t.flags, TCP_SYN | TCP_ACK);
    assert_eq!((t.seq, t.ack), (1, 101));
    assert_eq!(synack.source(), Some(server()));
    assert_eq!(synack.destination(), Some(client()));

    let (conn, _) = listener.accept().unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    pump_until(w, connected);

    w.handle_packet(tcp_seg(101, 2, TCP_ACK, b""));
    assert_eq!(w.pipe(&flow()).unwrap().tcb_status, TcbStatus::Established);
    conn
}

#[test]
fn tcp_relays_both_directions() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut w, egress) = tcp_worker(loopback(listener.local_addr().unwrap()));
    let mut conn = handshake(&mut w, &egress, &listener);

    let data = [7u8; 50];
    w.handle_packet(tcp_seg(101, 2, TCP_ACK | TCP_PSH, &data));
    let ack = next_packet(&egress);
    assert_eq!(ack.tcp().unwrap().flags, TCP_ACK);
    assert_eq!(ack.tcp().unwrap().ack, 151);
    assert!(ack.payload().is_empty());
    let mut got = [0u8; 50];
    conn.read_exact(&mut got).unwrap();
    assert_eq!(got, data);

    let reply: Vec<u8> = (0..200).map(|i| i as u8).collect();
    conn.write_all(&reply).unwrap();
    let mut relayed = vec![];
    for _ in 0..300 {
        if relayed.len() >= reply.len() {
            break;
        }
        w.poll_remote(Some(Duration::from_millis(10))).unwrap();
        while let Ok(bytes) = egress.try_recv() {
            let p = Packet::parse(bytes).unwrap();
            let t = p.tcp().unwrap();
            assert_eq!(t.seq, 2 + relayed.len() as u32);
            assert_eq!(t.ack, 151);
            relayed.extend_from_slice(p.payload());
        }
    }
    assert_eq!(relayed, reply);
    assert_eq!(w.pipe(&flow()).unwrap().my_seq, 202);
}

#[test]
fn repeated_syn_keeps_one_pipe() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut w, egress) = tcp_worker(loopback(listener.local_addr().unwrap()));

    w.handle_packet(tcp_seg(100, 0, TCP_SYN, b""));
    w.handle_packet(tcp_seg(100, 0, TCP_SYN, b""));
    assert_eq!(w.flow_count(), 1);
    let synack = next_packet(&egress);
    assert_eq!(synack.tcp().unwrap().flags, TCP_SYN | TCP_ACK);
    assert!(egress.try_recv().is_err());

    let pipe = w.pipe(&flow()).unwrap();
    assert_eq!(pipe.syn_count, 2);
    assert_eq!(pipe.my_ack, 101);
    assert_eq!(pipe.tcb_status, TcbStatus::SynReceived);
}

#[test]
fn rst_from_device_tears_flow_down() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut w, egress) = tcp_worker(loopback(listener.local_addr().unwrap()));
    w.handle_packet(tcp_seg(100, 0, TCP_SYN, b""));
    next_packet(&egress);

    w.handle_packet(tcp_seg(101, 2, TCP_RST, b""));
    assert_eq!(w.flow_count(), 0);
    let rst = next_packet(&egress);
    assert_ne!(rst.tcp().unwrap().flags & TCP_RST, 0);

    // Late segments of the dead flow are ignored
    w.handle_packet(tcp_seg(101, 2, TCP_ACK, b"late"));
    assert_eq!(w.flow_count(), 0);
    assert!(egress.try_recv().is_err());
}

#[test]
fn failed_dial_is_refused_with_rst() {
    let (mut w, egress) = tcp_worker(Arc::new(Refusing));
    w.handle_packet(tcp_seg(100, 0, TCP_SYN, b""));
    assert_eq!(w.flow_count(), 0);
    let rst = next_packet(&egress);
    assert_eq!(rst.tcp().unwrap().flags, TCP_RST | TCP_ACK);
    assert_eq!(rst.tcp().unwrap().ack, 101);
}

#[test]
fn out_of_order_segment_is_reacked() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut w, egress) = tcp_worker(loopback(listener.local_addr().unwrap()));
    let _conn = handshake(&mut w, &egress, &listener);

    w.handle_packet(tcp_seg(120, 2, TCP_ACK, b"ahead of time"));
    let ack = next_packet(&egress);
    assert_eq!(ack.tcp().unwrap().ack, 101);
    let pipe = w.pipe(&flow()).unwrap();
    assert_eq!(pipe.my_ack, 101);
    assert_eq!(pipe.pending_out(), 0);
}

#[test]
fn fin_both_ways_releases_pipe() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut w, egress) = tcp_worker(loopback(listener.local_addr().unwrap()));
    let mut conn = handshake(&mut w, &egress, &listener);

    w.handle_packet(tcp_seg(101, 2, TCP_FIN | TCP_ACK, b"bye"));
    let ack = next_packet(&egress);
    assert_eq!(ack.tcp().unwrap().ack, 105);
    assert_eq!(w.pipe(&flow()).unwrap().tcb_status, TcbStatus::CloseWait);
    assert!(!w.pipe(&flow()).unwrap().up_active);

    let mut got = vec![];
    conn.read_to_end(&mut got).unwrap();
    assert_eq!(got, b"bye");
    drop(conn);

    pump_until(&mut w, |w| w.pipe(&flow()).is_none());
    let fin = next_packet(&egress);
    let t = fin.tcp().unwrap();
    assert_eq!(t.flags, TCP_FIN | TCP_ACK);
    assert_eq!(t.seq, 2);
}

#[test]
fn rst_on_established_flow_allows_a_new_one() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut w, egress) = tcp_worker(loopback(listener.local_addr().unwrap()));
    let _conn = handshake(&mut w, &egress, &listener);

    w.handle_packet(tcp_seg(101, 2, TCP_RST, b""));
    assert_eq!(w.flow_count(), 0);
    let rst = next_packet(&egress);
    assert_ne!(rst.tcp().unwrap().flags & TCP_RST, 0);

    // Same 4-tuple, new connection
    w.handle_packet(tcp_seg(500, 0, TCP_SYN, b""));
    assert_eq!(w.flow_count(), 1);
    let synack = next_packet(&egress);
    let t = synack.tcp().unwrap();
    assert_eq!(t.flags, TCP_SYN | TCP_ACK);
    assert_eq!((t.seq, t.ack), (1, 501));
    let pipe = w.pipe(&flow()).unwrap();
    assert_eq!(pipe.tcb_status, TcbStatus::SynReceived);
    assert_eq!(pipe.syn_count, 1);
}

fn reset_on_drop(conn: &std::net::TcpStream) {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let ret = unsafe {
        libc::setsockopt(
            conn.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const libc::linger as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(ret, 0);
}

#[test]
fn remote_reset_is_passed_to_device() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut w, egress) = tcp_worker(loopback(listener.local_addr().unwrap()));
    let conn = handshake(&mut w, &egress, &listener);
    reset_on_drop(&conn);
    drop(conn);

    pump_until(&mut w, |w| w.pipe(&flow()).is_none());
    assert_eq!(w.flow_count(), 0);
    let mut saw_rst = false;
    while let Ok(bytes) = egress.try_recv() {
        let p = Packet::parse(bytes).unwrap();
        let t = p.tcp().unwrap();
        if t.flags & TCP_RST != 0 {
            assert_eq!(t.flags, TCP_RST | TCP_ACK);
            assert_eq!(t.ack, 101);
            saw_rst = true;
        }
    }
    assert!(saw_rst);

    w.handle_packet(tcp_seg(700, 0, TCP_SYN, b""));
    assert_eq!(w.flow_count(), 1);
}

#[test]
fn retransmitted_payload_is_written_once() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut w, egress) = tcp_worker(loopback(listener.local_addr().unwrap()));
    let mut conn = handshake(&mut w, &egress, &listener);

    w.handle_packet(tcp_seg(101, 2, TCP_ACK | TCP_PSH, b"hello"));
    assert_eq!(next_packet(&egress).tcp().unwrap().ack, 106);

    // Fully covered already, nothing goes anywhere
    w.handle_packet(tcp_seg(101, 2, TCP_ACK | TCP_PSH, b"hello"));
    assert!(egress.try_recv().is_err());
    assert_eq!(w.pipe(&flow()).unwrap().my_ack, 106);

    // Overlaps the last two bytes, only the tail is new
    w.handle_packet(tcp_seg(104, 2, TCP_ACK | TCP_PSH, b"lo world"));
    assert_eq!(next_packet(&egress).tcp().unwrap().ack, 112);

    let mut got = [0u8; 11];
    conn.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"hello world");
    conn.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let mut extra = [0u8; 16];
    assert!(conn.read(&mut extra).is_err());
}

struct UdpHarness {
    send: UdpSendWorker,
    recv: UdpReceiveWorker,
    table: Arc<UdpNatTable>,
    egress: Receiver<Vec<u8>>,
    stats: Arc<Stats>,
}

fn udp_harness(dialer: Arc<dyn Dialer>) -> UdpHarness {
    let poll = Poll::new().unwrap();
    let table = Arc::new(UdpNatTable::new(poll.registry().try_clone().unwrap()));
    let (_tx, ingress) = unbounded();
    let (register_tx, register_rx) = unbounded();
    let (egress_tx, egress) = unbounded();
    let stats = Arc::new(Stats::default());
    let config = EngineConfig::default();
    UdpHarness {
        send: UdpSendWorker::new(
            ingress,
            table.clone(),
            register_tx,
            dialer,
            config.clone(),
            stats.clone(),
        ),
        recv: UdpReceiveWorker::new(
            poll,
            table.clone(),
            register_rx,
            egress_tx,
            config,
            stats.clone(),
        ),
        table,
        egress,
        stats,
    }
}

#[test]
fn udp_round_trip_through_nat() {
    let echo = UdpSocket::bind("127.0.0.1:0").unwrap();
    echo.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut h = udp_harness(Arc::new(Loopback {
        tcp: SocketAddr::from((Ipv4Addr::LOCALHOST, 9)),
        udp: echo.local_addr().unwrap(),
    }));
    let dns = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);

    h.send.handle_packet(Packet::parse(udp_dgram(5000, dns, b"query")).unwrap());
    assert_eq!(h.table.len(), 1);
    let mut buf = [0u8; 64];
    let (n, from) = echo.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"query");

    echo.send_to(b"answer", from).unwrap();
    let mut reply = None;
    for _ in 0..300 {
        h.recv.poll_once(Some(Duration::from_millis(10))).unwrap();
        if let Ok(bytes) = h.egress.try_recv() {
            reply = Some(bytes);
            break;
        }
    }
    let bytes = reply.unwrap();
    assert_eq!(transport_checksum(&bytes, Protocol::Udp), 0);
    let pkt = Packet::parse(bytes).unwrap();
    assert_eq!(pkt.source(), Some(dns));
    assert_eq!(pkt.destination(), Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 5000)));
    assert_eq!(pkt.payload(), b"answer");

    // Same flow, same socket
    h.send.handle_packet(Packet::parse(udp_dgram(5000, dns, b"again")).unwrap());
    assert_eq!(h.table.len(), 1);
    let (n, from_again) = echo.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"again");
    assert_eq!(from_again, from);
}

#[test]
fn udp_reply_larger_than_mtu_is_dropped() {
    let echo = UdpSocket::bind("127.0.0.1:0").unwrap();
    echo.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut h = udp_harness(Arc::new(Loopback {
        tcp: SocketAddr::from((Ipv4Addr::LOCALHOST, 9)),
        udp: echo.local_addr().unwrap(),
    }));
    let dst = SocketAddrV4::new(Ipv4Addr::new(8, 8, 4, 4), 5353);
    h.send.handle_packet(Packet::parse(udp_dgram(5002, dst, b"big please")).unwrap());
    let mut buf = [0u8; 64];
    let (_, from) = echo.recv_from(&mut buf).unwrap();

    echo.send_to(&[0xab; 3000], from).unwrap();
    for _ in 0..300 {
        if h.stats.snapshot().dropped == 1 {
            break;
        }
        h.recv.poll_once(Some(Duration::from_millis(10))).unwrap();
        assert!(h.egress.try_recv().is_err());
    }
    assert_eq!(h.stats.snapshot().dropped, 1);
    assert_eq!(h.table.len(), 1);

    // The flow keeps working for datagrams that fit
    echo.send_to(b"small", from).unwrap();
    let mut reply = None;
    for _ in 0..300 {
        h.recv.poll_once(Some(Duration::from_millis(10))).unwrap();
        if let Ok(bytes) = h.egress.try_recv() {
            reply = Some(bytes);
            break;
        }
    }
    let pkt = Packet::parse(reply.unwrap()).unwrap();
    assert_eq!(pkt.source(), Some(dst));
    assert_eq!(pkt.payload(), b"small");
}

#[test]
fn udp_send_on_dead_socket_opens_fresh_entry() {
    // Nothing listens here, the first datagram draws a port unreachable
    let gone = UdpSocket::bind("127.0.0.1:0").unwrap();
    let target = gone.local_addr().unwrap();
    drop(gone);
    let mut h = udp_harness(Arc::new(Loopback {
        tcp: SocketAddr::from((Ipv4Addr::LOCALHOST, 9)),
        udp: target,
    }));
    let dst = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);
    let key = FlowKey::new(dst, 5003);

    h.send.handle_packet(Packet::parse(udp_dgram(5003, dst, b"one")).unwrap());
    let first = h.table.get(&key).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    h.send.handle_packet(Packet::parse(udp_dgram(5003, dst, b"two")).unwrap());
    assert_eq!(h.table.len(), 1);
    let second = h.table.get(&key).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(h.stats.snapshot().dropped, 0);
}

#[test]
fn udp_open_failure_drops_datagram() {
    let mut h = udp_harness(Arc::new(Refusing));
    let dst = SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 443);
    h.send.handle_packet(Packet::parse(udp_dgram(5001, dst, b"x")).unwrap());
    assert!(h.table.is_empty());
    assert_eq!(h.stats.snapshot().dropped, 1);
}

#[test]
fn udp_reaper_uses_per_port_timeouts() {
    let echo = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut h = udp_harness(Arc::new(Loopback {
        tcp: SocketAddr::from((Ipv4Addr::LOCALHOST, 9)),
        udp: echo.local_addr().unwrap(),
    }));
    let dns = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);
    let other = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 9999);
    h.send.handle_packet(Packet::parse(udp_dgram(6000, dns, b"q")).unwrap());
    h.send.handle_packet(Packet::parse(udp_dgram(6001, other, b"q")).unwrap());
    assert_eq!(h.table.len(), 2);

    let cleaner =
        UdpSocketCleanWorker::new(h.table.clone(), EngineConfig::default(), h.stats.clone());
    assert_eq!(cleaner.clean(Instant::now() + Duration::from_secs(11)), 1);
    assert!(h.table.get(&FlowKey::new(dns, 6000)).is_none());
    assert!(h.table.get(&FlowKey::new(other, 6001)).is_some());
    assert_eq!(h.stats.snapshot().udp_flows, 1);

    assert_eq!(cleaner.clean(Instant::now() + Duration::from_secs(5 * 60)), 1);
    assert!(h.table.is_empty());
}

fn tun_pair() -> (File, UnixStream) {
    let mut fds = [0; 2];
    let ret = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0, fds.as_mut_ptr())
    };
    assert_eq!(ret, 0);
    let peer = unsafe { UnixStream::from_raw_fd(fds[1]) };
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    unsafe { (File::from_raw_fd(fds[0]), peer) }
}

#[test]
fn engine_relays_udp_and_stops_cleanly() {
    let echo = UdpSocket::bind("127.0.0.1:0").unwrap();
    echo.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let (dev, mut peer) = tun_pair();
    let dialer = Arc::new(Loopback {
        tcp: SocketAddr::from((Ipv4Addr::LOCALHOST, 9)),
        udp: echo.local_addr().unwrap(),
    });
    let engine =
        Engine::start_with_dialer(dev.as_raw_fd(), EngineConfig::default(), dialer).unwrap();
    assert!(engine.is_running());

    let dst = SocketAddrV4::new(Ipv4Addr::new(9, 9, 9, 9), 7);
    peer.write_all(&udp_dgram(7000, dst, b"ping")).unwrap();
    let mut buf = [0u8; 1500];
    let (n, from) = echo.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
    echo.send_to(b"pong", from).unwrap();

    let n = peer.read(&mut buf).unwrap();
    let pkt = Packet::parse(buf[..n].to_vec()).unwrap();
    assert_eq!(pkt.source(), Some(dst));
    assert_eq!(pkt.payload(), b"pong");

    let stats = engine.stats();
    assert_eq!(stats.device_rx, 1);
    assert_eq!(stats.udp_flows, 1);
    engine.stop().unwrap();
}

#[test]
fn device_close_ends_the_session() {
    let (dev, peer) = tun_pair();
    let engine = Engine::start(dev.as_raw_fd(), EngineConfig::default()).unwrap();
    drop(peer);
    for _ in 0..200 {
        if !engine.is_running() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!engine.is_running());
    match engine.stop() {
        Err(Error::DeviceClosed) => {}
        other => panic!("unexpected {:?}", other),
    }
}

fn is_nonblocking(fd: std::os::unix::io::RawFd) -> bool {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    assert!(flags >= 0);
    flags & libc::O_NONBLOCK != 0
}

#[test]
fn stop_restores_device_blocking_mode() {
    let (dev, _peer) = tun_pair();
    assert!(!is_nonblocking(dev.as_raw_fd()));
    let engine = Engine::start(dev.as_raw_fd(), EngineConfig::default()).unwrap();
    assert!(is_nonblocking(dev.as_raw_fd()));
    engine.stop().unwrap();
    assert!(!is_nonblocking(dev.as_raw_fd()));
}

#[test]
fn invalid_config_is_rejected() {
    let (dev, _peer) = tun_pair();
    let config = EngineConfig {
        mtu: 100,
        ..Default::default()
    };
    match Engine::start(dev.as_raw_fd(), config) {
        Err(Error::Config(_)) => {}
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("engine started with a bad mtu"),
    }
}

#[test]
fn c_api_allows_one_session() {
    let (dev, _peer) = tun_pair();
    assert_eq!(tunrelay_stop(), -1);
    assert_eq!(tunrelay_start(dev.as_raw_fd(), 1400), 0);
    assert_eq!(tunrelay_start(dev.as_raw_fd(), 1400), -1);

    let mut stats = TunRelayStats::default();
    unsafe { tunrelay_stats(&mut stats) };
    assert_eq!(stats.tcp_flows, 0);
    assert_eq!(tunrelay_stop(), 0);
    assert_eq!(tunrelay_stop(), -1);
}
