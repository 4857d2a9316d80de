//! The tunnel device end of the engine. The reader takes whole ip packets off
//! the device and routes them to the tcp or udp queue, the writer drains the
//! single egress queue all workers push their synthesized packets to.

use crate::error::{Error, Result};
use crate::packet::{Packet, Protocol};
use crate::stats::Stats;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, trace};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::os::raw::c_int;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEVICE: Token = Token(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Tcp,
    Udp,
    Dropped,
}

pub struct PacketRouter {
    tcp: Sender<Packet>,
    udp: Sender<Packet>,
    stats: Arc<Stats>,
}

impl PacketRouter {
    pub fn new(tcp: Sender<Packet>, udp: Sender<Packet>, stats: Arc<Stats>) -> Self {
        PacketRouter { tcp, udp, stats }
    }

    pub fn route(&self, bytes: &[u8]) -> Route {
        Stats::bump(&self.stats.device_rx);
        let pkt = match Packet::parse(bytes.to_vec()) {
            Ok(p) => p,
            Err(e) => {
                debug!("device packet dropped: {}", e);
                Stats::bump(&self.stats.dropped);
                return Route::Dropped;
            }
        };
        let (queue, route) = match pkt.protocol() {
            Protocol::Tcp => (&self.tcp, Route::Tcp),
            Protocol::Udp => (&self.udp, Route::Udp),
            Protocol::Other(p) => {
                trace!("device packet with protocol {} dropped", p);
                Stats::bump(&self.stats.dropped);
                return Route::Dropped;
            }
        };
        if queue.send(pkt).is_err() {
            Stats::bump(&self.stats.dropped);
            return Route::Dropped;
        }
        route
    }
}

// Returns the flags the descriptor had before
pub fn set_nonblocking(fd: RawFd) -> io::Result<c_int> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(flags)
    }
}

pub fn restore_flags(fd: RawFd, flags: c_int) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// Reads packets off the device. The device must be non-blocking, each read
// returns exactly one ip packet.
pub struct DeviceReader<D> {
    device: D,
    router: PacketRouter,
    mtu: usize,
    poll_timeout: Duration,
}

impl<D: Read + AsRawFd> DeviceReader<D> {
    pub fn new(device: D, router: PacketRouter, mtu: usize, poll_timeout: Duration) -> Self {
        DeviceReader {
            device,
            router,
            mtu,
            poll_timeout,
        }
    }

    // Runs until `shutdown` is set. The device closing or failing ends the
    // session, so it comes back as an error.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(4);
        let fd = self.device.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), DEVICE, Interest::READABLE)?;
        let mut buf = vec![0u8; self.mtu];
        info!("device reader started, mtu {}", self.mtu);

        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = poll.poll(&mut events, Some(self.poll_timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    return Err(e.into());
                }
            }
            // Read even on a timeout, a missed edge must not stall the device
            loop {
                match self.device.read(&mut buf) {
                    Ok(0) => {
                        error!("device read returned eof");
                        return Err(Error::DeviceClosed);
                    }
                    Ok(n) => {
                        self.router.route(&buf[..n]);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!("device read failed: {}", e);
                        return Err(e.into());
                    }
                }
            }
        }
        info!("device reader stopped");
        Ok(())
    }
}

// Writes all of `buf`, calling `wait` whenever the writer would block
pub fn write_fully<W, F>(w: &mut W, mut buf: &[u8], mut wait: F) -> io::Result<()>
where
    W: Write,
    F: FnMut() -> io::Result<()>,
{
    while !buf.is_empty() {
        match w.write(buf) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => wait()?,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// Drains the egress queue onto the device, in queue order
pub struct DeviceWriter<D> {
    device: D,
    egress: Receiver<Vec<u8>>,
    stats: Arc<Stats>,
    poll_timeout: Duration,
}

impl<D: Write + AsRawFd> DeviceWriter<D> {
    pub fn new(
        device: D,
        egress: Receiver<Vec<u8>>,
        stats: Arc<Stats>,
        poll_timeout: Duration,
    ) -> Self {
        DeviceWriter {
            device,
            egress,
            stats,
            poll_timeout,
        }
    }

    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(4);
        let fd = self.device.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), DEVICE, Interest::WRITABLE)?;
        info!("device writer started");

        let DeviceWriter {
            device,
            egress,
            stats,
            poll_timeout,
        } = self;
        let timeout = *poll_timeout;
        while !shutdown.load(Ordering::Relaxed) {
            let buf = match egress.recv_timeout(timeout) {
                Ok(b) => b,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let wait = || {
                if shutdown.load(Ordering::Relaxed) {
                    return Err(io::Error::new(io::ErrorKind::Other, "stopping"));
                }
                match poll.poll(&mut events, Some(timeout)) {
                    Err(e) if e.kind() != io::ErrorKind::Interrupted => Err(e),
                    _ => Ok(()),
                }
            };
            if let Err(e) = write_fully(&mut *device, &buf, wait) {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                error!("device write failed: {}", e);
                return Err(e.into());
            }
            Stats::bump(&stats.device_tx);
        }
        info!("device writer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip_util::PacketBuilder;
    use crossbeam_channel::unbounded;
    use std::fs::File;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::os::unix::io::FromRawFd;
    use std::thread;

    // Packet boundaries are preserved like on a tun device
    fn seqpacket_pair() -> (File, File) {
        let mut fds = [0; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) }
    }

    fn udp_packet(payload: &[u8]) -> Vec<u8> {
        let mut b = PacketBuilder::udp(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 5000),
            SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53),
            1,
            payload.len(),
        );
        b.payload_mut().copy_from_slice(payload);
        b.finish()
    }

    fn icmp_packet() -> Vec<u8> {
        let mut p = udp_packet(b"ping");
        p[9] = 1;
        p
    }

    struct Chunky {
        out: Vec<u8>,
        calls: usize,
    }

    impl Write for Chunky {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            match self.calls % 3 {
                1 => Err(io::Error::from(io::ErrorKind::WouldBlock)),
                2 => Err(io::Error::from(io::ErrorKind::Interrupted)),
                _ => {
                    let n = buf.len().min(3);
                    self.out.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn partial_writes_are_completed() {
        let mut w = Chunky {
            out: vec![],
            calls: 0,
        };
        let mut waits = 0;
        write_fully(&mut w, b"0123456789", || {
            waits += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(w.out, b"0123456789");
        assert_eq!(waits, 4);
    }

    #[test]
    fn router_drops_unknown_protocols() {
        let (tcp_tx, tcp_rx) = unbounded();
        let (udp_tx, udp_rx) = unbounded();
        let stats = Arc::new(Stats::default());
        let router = PacketRouter::new(tcp_tx, udp_tx, stats.clone());

        assert_eq!(router.route(&icmp_packet()), Route::Dropped);
        assert_eq!(router.route(&[0x45, 0, 0]), Route::Dropped);
        assert_eq!(router.route(&udp_packet(b"query")), Route::Udp);

        assert!(tcp_rx.try_recv().is_err());
        assert_eq!(udp_rx.try_recv().unwrap().payload(), b"query");
        let s = stats.snapshot();
        assert_eq!(s.device_rx, 3);
        assert_eq!(s.dropped, 2);
    }

    #[test]
    fn reader_routes_packets_until_device_closes() {
        let (dev, mut peer) = seqpacket_pair();
        set_nonblocking(dev.as_raw_fd()).unwrap();
        let (tcp_tx, _tcp_rx) = unbounded();
        let (udp_tx, udp_rx) = unbounded();
        let stats = Arc::new(Stats::default());
        let router = PacketRouter::new(tcp_tx, udp_tx, stats.clone());
        let mut reader = DeviceReader::new(dev, router, 1500, Duration::from_millis(20));

        peer.write_all(&icmp_packet()).unwrap();
        peer.write_all(&udp_packet(b"one")).unwrap();
        peer.write_all(&udp_packet(b"two")).unwrap();
        drop(peer);

        let stop = AtomicBool::new(false);
        match reader.run(&stop) {
            Err(Error::DeviceClosed) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(udp_rx.try_recv().unwrap().payload(), b"one");
        assert_eq!(udp_rx.try_recv().unwrap().payload(), b"two");
        assert_eq!(stats.snapshot().dropped, 1);
    }

    #[test]
    fn writer_preserves_queue_order() {
        let (dev, mut peer) = seqpacket_pair();
        set_nonblocking(dev.as_raw_fd()).unwrap();
        let (tx, rx) = unbounded();
        let stats = Arc::new(Stats::default());
        let mut writer = DeviceWriter::new(dev, rx, stats.clone(), Duration::from_millis(20));

        let packets = vec![udp_packet(b"P1"), udp_packet(b"P2"), udp_packet(b"P3")];
        for p in packets.iter() {
            tx.send(p.clone()).unwrap();
        }
        drop(tx);
        let stop = Arc::new(AtomicBool::new(false));
        let s = stop.clone();
        let handle = thread::spawn(move || writer.run(&s));
        handle.join().unwrap().unwrap();

        let mut buf = [0u8; 1500];
        for p in packets.iter() {
            let n = peer.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], &p[..]);
        }
        assert_eq!(stats.snapshot().device_tx, 3);
    }
}
