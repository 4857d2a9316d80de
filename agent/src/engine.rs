//! One tunnel session: the device reader/writer, the tcp worker and the three
//! udp workers, each on its own thread, all sharing one stop flag.

use crate::config::EngineConfig;
use crate::device::{restore_flags, set_nonblocking, DeviceReader, DeviceWriter, PacketRouter};
use crate::dialer::{DirectDialer, Dialer};
use crate::error::{Error, Result};
use crate::stats::{Stats, StatsSnapshot};
use crate::tcp_worker::TcpWorker;
use crate::udp_nat::UdpNatTable;
use crate::udp_worker::{UdpReceiveWorker, UdpSendWorker, UdpSocketCleanWorker};
use crossbeam_channel::unbounded;
use log::{error, info};
use mio::Poll;
use std::fs::File;
use std::io;
use std::os::raw::c_int;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub struct Engine {
    shutdown: Arc<AtomicBool>,
    workers: Vec<(&'static str, JoinHandle<Result<()>>)>,
    udp_table: Arc<UdpNatTable>,
    stats: Arc<Stats>,
    // Non-blocking mode is shared with the caller's fd, put theirs back on stop
    device: File,
    device_flags: c_int,
}

// Our own handle on the device, the caller keeps (and eventually closes) theirs
fn dup_device(fd: RawFd) -> io::Result<File> {
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(dup) })
}

impl Engine {
    // Starts a session on the tun device `fd`, flows go straight out to
    // their destinations
    pub fn start(fd: RawFd, config: EngineConfig) -> Result<Engine> {
        Engine::start_with_dialer(fd, config, Arc::new(DirectDialer))
    }

    pub fn start_with_dialer(
        fd: RawFd,
        config: EngineConfig,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Engine> {
        crate::init_logging();
        config.validate()?;
        let device = dup_device(fd)?;
        let device_flags = set_nonblocking(device.as_raw_fd())?;
        let reader_device = device.try_clone()?;
        let writer_device = device.try_clone()?;

        let stats = Arc::new(Stats::default());
        let (tcp_tx, tcp_rx) = unbounded();
        let (udp_tx, udp_rx) = unbounded();
        let (egress_tx, egress_rx) = unbounded();
        let (register_tx, register_rx) = unbounded();

        let udp_poll = Poll::new()?;
        let udp_table = Arc::new(UdpNatTable::new(udp_poll.registry().try_clone()?));

        let router = PacketRouter::new(tcp_tx, udp_tx, stats.clone());
        let mut reader =
            DeviceReader::new(reader_device, router, config.mtu, config.device_poll_timeout);
        let mut writer =
            DeviceWriter::new(writer_device, egress_rx, stats.clone(), config.device_poll_timeout);
        let mut tcp = TcpWorker::new(
            tcp_rx,
            egress_tx.clone(),
            dialer.clone(),
            config.clone(),
            stats.clone(),
        )?;
        let mut udp_send = UdpSendWorker::new(
            udp_rx,
            udp_table.clone(),
            register_tx,
            dialer,
            config.clone(),
            stats.clone(),
        );
        let mut udp_recv = UdpReceiveWorker::new(
            udp_poll,
            udp_table.clone(),
            register_rx,
            egress_tx,
            config.clone(),
            stats.clone(),
        );
        let mut udp_clean =
            UdpSocketCleanWorker::new(udp_table.clone(), config.clone(), stats.clone());

        let mut engine = Engine {
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Vec::with_capacity(6),
            udp_table,
            stats,
            device,
            device_flags,
        };
        // A failed spawn drops engine, which stops whatever already started
        engine.spawn("tcp-worker", move |stop| tcp.run(stop))?;
        engine.spawn("udp-send", move |stop| udp_send.run(stop))?;
        engine.spawn("udp-receive", move |stop| udp_recv.run(stop))?;
        engine.spawn("udp-clean", move |stop| udp_clean.run(stop))?;
        engine.spawn("device-writer", move |stop| writer.run(stop))?;
        engine.spawn("device-reader", move |stop| reader.run(stop))?;
        info!("engine started on fd {}, mtu {}", fd, config.mtu);
        Ok(engine)
    }

    fn spawn<F>(&mut self, name: &'static str, f: F) -> Result<()>
    where
        F: FnOnce(&AtomicBool) -> Result<()> + Send + 'static,
    {
        let stop = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let ret = f(&stop);
                if let Err(ref e) = ret {
                    error!("{} exited: {}", name, e);
                    // Fatal for the whole session
                    stop.store(true, Ordering::Relaxed);
                }
                ret
            })?;
        self.workers.push((name, handle));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stops every worker, waits for them and releases all sockets. Returns the
    /// error that ended the session, if one did.
    pub fn stop(mut self) -> Result<()> {
        self.halt()
    }

    fn halt(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        let mut first: Option<Error> = None;
        for (name, handle) in self.workers.drain(..) {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first.get_or_insert(e);
                }
                Err(_) => {
                    error!("{} panicked", name);
                    first.get_or_insert(Error::WorkerPanicked(name));
                }
            }
        }
        let n = self.udp_table.close_all();
        if let Err(e) = restore_flags(self.device.as_raw_fd(), self.device_flags) {
            error!("restoring device flags failed: {}", e);
        }
        info!("engine stopped, {} udp entries left to close", n);
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.halt().ok();
        }
    }
}
