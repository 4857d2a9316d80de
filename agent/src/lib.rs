#[cfg(target_os = "android")]
use android_logger::Config;
#[cfg(target_os = "android")]
use log::Level;
#[cfg(target_vendor = "apple")]
use log::LevelFilter;
use log::error;
#[cfg(target_vendor = "apple")]
use oslog::OsLogger;
use parking_lot::Mutex;
use std::os::raw::c_int;

pub mod config;
pub mod device;
pub mod dialer;
pub mod engine;
pub mod error;
pub mod ip_util;
pub mod packet;
pub mod stats;
pub mod tcp_pipe;
pub mod tcp_worker;
pub mod udp_nat;
pub mod udp_worker;

#[cfg(test)]
mod test;

pub use config::EngineConfig;
pub use dialer::{Dialer, DirectDialer};
pub use engine::Engine;
pub use error::{Error, ParseError, Result};
pub use stats::StatsSnapshot;

// Note: "device" everywhere in this crate is the tun interface the OS hands us,
// the android VpnService or the ios packetTunnel. Every packet the device reads
// is ours to relay, everything we write to it looks to the OS as if it came
// from the remote hosts.

// The session driven through the C api, at most one at a time
static SESSION: Mutex<Option<Engine>> = parking_lot::const_mutex(None);

#[derive(Default, Debug)]
#[repr(C)]
pub struct TunRelayStats {
    pub device_rx: c_int,
    pub device_tx: c_int,
    pub dropped: c_int,
    pub tcp_flows: c_int,
    pub udp_flows: c_int,
}

// Sets up the platform logger. Safe to call more than once.
pub fn init_logging() {
    #[cfg(target_os = "android")]
    android_logger::init_once(
        Config::default()
            .with_min_level(Level::Info)
            .with_tag("TunRelay"),
    );

    #[cfg(target_vendor = "apple")]
    OsLogger::new("com.tunrelay.engine")
        .level_filter(LevelFilter::Debug)
        .init()
        .ok();
}

/// Starts relaying on the tun `fd`. A non-positive `mtu` keeps the default.
/// Returns 0 on success, -1 if a session is already running or could not be
/// started. The fd stays owned by the caller.
#[no_mangle]
pub extern "C" fn tunrelay_start(fd: c_int, mtu: c_int) -> c_int {
    init_logging();
    let mut session = SESSION.lock();
    if let Some(running) = session.as_ref() {
        if running.is_running() {
            error!("tunrelay start on fd {}: {}", fd, Error::AlreadyRunning);
            return -1;
        }
    }
    // A session that ended by itself is reaped before the new one
    if let Some(old) = session.take() {
        if let Err(e) = old.stop() {
            error!("previous session ended with: {}", e);
        }
    }
    let mut config = EngineConfig::default();
    if mtu > 0 {
        config.mtu = mtu as usize;
    }
    match Engine::start(fd, config) {
        Ok(engine) => {
            *session = Some(engine);
            0
        }
        Err(e) => {
            error!("tunrelay start on fd {} failed: {}", fd, e);
            -1
        }
    }
}

/// Stops the running session and waits for it. Returns 0 on a clean stop, -1
/// if nothing was running or the session had failed.
#[no_mangle]
pub extern "C" fn tunrelay_stop() -> c_int {
    let engine = match SESSION.lock().take() {
        Some(e) => e,
        None => {
            error!("tunrelay stop: {}", Error::NotRunning);
            return -1;
        }
    };
    match engine.stop() {
        Ok(()) => 0,
        Err(e) => {
            error!("tunrelay session ended with: {}", e);
            -1
        }
    }
}

/// # Safety
/// `stats` must be null or point to a writable `TunRelayStats`
#[no_mangle]
pub unsafe extern "C" fn tunrelay_stats(stats: *mut TunRelayStats) {
    if stats.is_null() {
        return;
    }
    let snap = SESSION
        .lock()
        .as_ref()
        .map(|e| e.stats())
        .unwrap_or_default();
    (*stats).device_rx = snap.device_rx as c_int;
    (*stats).device_tx = snap.device_tx as c_int;
    (*stats).dropped = snap.dropped as c_int;
    (*stats).tcp_flows = snap.tcp_flows as c_int;
    (*stats).udp_flows = snap.udp_flows as c_int;
}
