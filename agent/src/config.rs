use crate::error::{Error, Result};
use std::time::Duration;

const DEFAULT_MTU: usize = 1500;
const DEFAULT_TICK: u64 = 10; // milliseconds
const DEFAULT_DEVICE_POLL: u64 = 100; // milliseconds
const CLEANUP_UDP_IDLE: u64 = 4 * 60; // 4 minutes
const CLEANUP_UDP_DNS: u64 = 10; // 10 seconds
const MONITOR_UDP_IDLE: u64 = 5; // 5 seconds
const MIN_MTU: usize = 576;
const MAX_MTU: usize = 65535;

// Knobs for one tunnel session. The defaults are what the mobile platforms
// run with, the linux launcher overrides some of them from the command line.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Size of a device read and the largest packet we synthesize
    pub mtu: usize,
    // How long the tcp engine sleeps in its select when there was no work
    pub tick: Duration,
    // Upper bound on any blocking wait before the stop flag is checked again
    pub device_poll_timeout: Duration,
    // A udp nat entry unused for longer than this is evicted
    pub udp_idle_timeout: Duration,
    // Same as udp_idle_timeout but for entries going to port 53
    pub udp_dns_idle_timeout: Duration,
    pub udp_clean_interval: Duration,
    pub window: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            mtu: DEFAULT_MTU,
            tick: Duration::from_millis(DEFAULT_TICK),
            device_poll_timeout: Duration::from_millis(DEFAULT_DEVICE_POLL),
            udp_idle_timeout: Duration::from_secs(CLEANUP_UDP_IDLE),
            udp_dns_idle_timeout: Duration::from_secs(CLEANUP_UDP_DNS),
            udp_clean_interval: Duration::from_secs(MONITOR_UDP_IDLE),
            window: u16::MAX,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mtu < MIN_MTU || self.mtu > MAX_MTU {
            return Err(Error::Config(format!(
                "mtu {} outside {}..={}",
                self.mtu, MIN_MTU, MAX_MTU
            )));
        }
        let durations = [
            ("tick", self.tick),
            ("device_poll_timeout", self.device_poll_timeout),
            ("udp_idle_timeout", self.udp_idle_timeout),
            ("udp_dns_idle_timeout", self.udp_dns_idle_timeout),
            ("udp_clean_interval", self.udp_clean_interval),
        ];
        for (name, d) in durations.iter() {
            if d.as_nanos() == 0 {
                return Err(Error::Config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }

    // Idle timeout for a udp entry given its destination port
    pub fn udp_timeout_for(&self, dport: u16) -> Duration {
        if dport == 53 {
            self.udp_dns_idle_timeout
        } else {
            self.udp_idle_timeout
        }
    }
}
