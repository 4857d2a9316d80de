use clap::{App, Arg};
use log::{error, info};
use std::ffi::CString;
use std::io;
use std::os::raw::c_int;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tunrelay::{Engine, EngineConfig};

const TUNSETIFF: u64 = 1074025674;

fn cmd(cmd: &str) {
    let mut shell = Command::new("bash");
    match shell.arg("-c").arg(cmd).output() {
        Ok(out) if !out.status.success() => error!("{} failed: {:?}", cmd, out.status),
        Ok(_) => {}
        Err(e) => error!("{} failed: {}", cmd, e),
    }
}

fn config_tun(name: &str, address: &str) {
    cmd(&format!("ip link set {} up", name));
    cmd(&format!("ip addr add {} dev {}", address, name));
}

fn create_tun(name: &str) -> io::Result<c_int> {
    let flags: u16 = (libc::IFF_TUN | libc::IFF_NO_PI) as u16;
    let mut ifr: [u8; libc::IFNAMSIZ + 64] = [0 as u8; libc::IFNAMSIZ + 64];
    let bytes = name.as_bytes();
    if bytes.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface name {} too long", name),
        ));
    }
    ifr[..bytes.len()].copy_from_slice(bytes);
    ifr[libc::IFNAMSIZ] = (flags & 0xFF) as u8;
    ifr[libc::IFNAMSIZ + 1] = ((flags & 0xFF00) >> 8) as u8;
    let path = CString::new("/dev/net/tun")?;
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_RDWR);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::ioctl(fd, TUNSETIFF as _, ifr.as_mut_ptr()) < 0 {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(e);
        }
        Ok(fd)
    }
}

fn secs(matches: &clap::ArgMatches, name: &str, default: Duration) -> Duration {
    match matches.value_of(name).map(|v| v.parse::<u64>()) {
        Some(Ok(s)) => Duration::from_secs(s),
        Some(Err(e)) => {
            error!("bad --{}: {}, using {:?}", name, e, default);
            default
        }
        None => default,
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = App::new("tunrelay")
        .about("Relays the tcp/udp traffic of a tun interface over regular sockets")
        .arg(
            Arg::with_name("tun")
                .long("tun")
                .takes_value(true)
                .default_value("tun0")
                .help("tun interface to create"),
        )
        .arg(
            Arg::with_name("mtu")
                .long("mtu")
                .takes_value(true)
                .help("mtu of the tun interface"),
        )
        .arg(
            Arg::with_name("udp-idle")
                .long("udp-idle")
                .takes_value(true)
                .help("seconds before an idle udp flow is dropped"),
        )
        .arg(
            Arg::with_name("address")
                .long("address")
                .takes_value(true)
                .help("address/prefix to configure on the interface, eg 169.254.2.1/24"),
        )
        .get_matches();

    let name = matches.value_of("tun").unwrap_or("tun0");
    let mut config = EngineConfig::default();
    if let Some(mtu) = matches.value_of("mtu") {
        match mtu.parse() {
            Ok(m) => config.mtu = m,
            Err(e) => {
                error!("bad --mtu {}: {}", mtu, e);
                std::process::exit(1);
            }
        }
    }
    config.udp_idle_timeout = secs(&matches, "udp-idle", config.udp_idle_timeout);

    let fd = match create_tun(name) {
        Ok(fd) => fd,
        Err(e) => {
            error!("cannot create {}: {}", name, e);
            std::process::exit(1);
        }
    };
    if let Some(address) = matches.value_of("address") {
        config_tun(name, address);
    }

    let term = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM].iter() {
        if let Err(e) = signal_hook::flag::register(*sig, Arc::clone(&term)) {
            error!("cannot register signal {}: {}", sig, e);
        }
    }

    let engine = match Engine::start(fd, config) {
        Ok(e) => e,
        Err(e) => {
            error!("engine start failed: {}", e);
            std::process::exit(1);
        }
    };
    info!("relaying {} (fd {})", name, fd);

    while !term.load(Ordering::Relaxed) && engine.is_running() {
        thread::sleep(Duration::from_millis(200));
    }
    let stats = engine.stats();
    let ret = engine.stop();
    unsafe {
        libc::close(fd);
    }
    info!("stopped, {:?}", stats);
    if let Err(e) = ret {
        error!("session ended with: {}", e);
        std::process::exit(1);
    }
}
