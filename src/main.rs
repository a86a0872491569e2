// # Things-Shell Node
//
// Binary driver for the runtime: a current-thread tokio loop multiplexing
// the control socket, the NTP client socket, the scheduler timer and
// shutdown. The core stays synchronous; every event locks the node,
// dispatches, and sends whatever came back.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::RngCore;
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use things_shell::config::{self, NodeConfig};
use things_shell::platform::{Clock, Dns, Flash, Rng, Timer, UdpSend};
use things_shell::{Node, Platform, VERSION};

// -- host platform implementations -------------------------------------------

struct StdClock {
    boot: Instant,
    unix_base: u32,
}

impl StdClock {
    fn new() -> Self {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as u32;
        Self { boot: Instant::now(), unix_base: now }
    }
}

impl Clock for StdClock {
    fn ctime(&self) -> u32 {
        self.boot.elapsed().as_secs() as u32
    }

    fn time_at(&self, ctime: u32) -> u32 {
        self.unix_base.wrapping_add(ctime)
    }

    fn adjust(&mut self, unix_now: u32) {
        self.unix_base = unix_now.wrapping_sub(self.ctime());
    }
}

struct OsRng;

impl Rng for OsRng {
    fn fill(&mut self, dst: &mut [u8]) {
        rand::rng().fill_bytes(dst);
    }
}

// Flash emulation over one backing file, loaded whole and written back on
// change. Sector-sized erases keep the device model.
struct FileFlash {
    path: PathBuf,
    data: Vec<u8>,
}

impl FileFlash {
    const SECTOR: usize = 4096;

    fn open(path: PathBuf, size: usize) -> Self {
        let data = match std::fs::read(&path) {
            Ok(d) if d.len() == size => d,
            _ => vec![0xFF; size],
        };
        Self { path, data }
    }

    fn sync(&self) {
        if let Err(e) = std::fs::write(&self.path, &self.data) {
            warn!(error = %e, "flash sync failed");
        }
    }
}

impl Flash for FileFlash {
    fn read(&self, addr: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.data[addr..addr + buf.len()]);
    }

    fn write(&mut self, addr: usize, data: &[u8]) {
        self.data[addr..addr + data.len()].copy_from_slice(data);
        self.sync();
    }

    fn erase_sector(&mut self, index: usize) {
        let start = index * Self::SECTOR;
        self.data[start..start + Self::SECTOR].fill(0xFF);
    }

    fn sector_size(&self) -> usize {
        Self::SECTOR
    }

    fn size(&self) -> usize {
        self.data.len()
    }
}

struct StdDns;

impl Dns for StdDns {
    fn resolve(&mut self, host: &str) -> Option<Ipv4Addr> {
        use std::net::ToSocketAddrs;
        (host, 0)
            .to_socket_addrs()
            .ok()?
            .find_map(|sa| match sa.ip() {
                std::net::IpAddr::V4(v4) => Some(v4),
                _ => None,
            })
    }
}

// Outbound NTP datagrams through a shared std socket.
struct NtpUdpSend {
    socket: Arc<std::net::UdpSocket>,
}

impl UdpSend for NtpUdpSend {
    fn sendto(&mut self, addr: Ipv4Addr, port: u16, data: &[u8]) {
        if let Err(e) = self.socket.send_to(data, (addr, port)) {
            warn!(error = %e, "ntp send failed");
        }
    }
}

// Timer whose armed deadline the driver loop polls.
#[derive(Clone, Default)]
struct WallTimer {
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl Timer for WallTimer {
    fn arm(&mut self, msec: u64, _repeating: bool) {
        *self.deadline.lock() = Some(Instant::now() + Duration::from_millis(msec));
    }

    fn disarm(&mut self) {
        *self.deadline.lock() = None;
    }

    fn armed(&self) -> Option<u64> {
        (*self.deadline.lock()).map(|d| d.saturating_duration_since(Instant::now()).as_millis() as u64)
    }
}

impl WallTimer {
    fn expired(&self) -> bool {
        (*self.deadline.lock()).map(|d| d <= Instant::now()).unwrap_or(false)
    }
}

fn node_config() -> NodeConfig {
    let mut cfg = NodeConfig::default();
    if let Ok(port) = std::env::var("TSH_UDPCTL_PORT") {
        if let Ok(p) = port.parse() {
            cfg.udpctl_port = p;
        }
    }
    if let Ok(secret) = std::env::var("TSH_SECRET") {
        cfg.udpctl_secret = secret.into_bytes();
    }
    cfg
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt().with_target(false).with_level(true).init();

    info!("things-shell node v{VERSION}");
    let cfg = node_config();

    let data_dir = std::env::current_dir()?.join("data");
    let _ = std::fs::create_dir_all(&data_dir);
    let flash = FileFlash::open(data_dir.join("flash.bin"), cfg.flash_size);

    let ntp_std_socket = Arc::new(std::net::UdpSocket::bind("0.0.0.0:0")?);
    ntp_std_socket.set_nonblocking(true)?;
    let ntp_socket = UdpSocket::from_std(std::net::UdpSocket::try_clone(&ntp_std_socket)?)?;

    let sched_timer = WallTimer::default();
    let platform = Platform {
        clock: Box::new(StdClock::new()),
        rng: Box::new(OsRng),
        flash: Some(Box::new(flash)),
        dns: Box::new(StdDns),
        ntp_udp: Box::new(NtpUdpSend { socket: ntp_std_socket }),
        sched_timer: Box::new(sched_timer.clone()),
    };

    let node = match Node::start(&cfg, platform) {
        Ok(n) => Arc::new(Mutex::new(n)),
        Err(e) => {
            error!(error = %e, "node start failed");
            return Ok(());
        }
    };

    let ctl_socket = UdpSocket::bind(("0.0.0.0", cfg.udpctl_port)).await?;
    info!(port = cfg.udpctl_port, "control channel listening");

    let mut ctl_buf = vec![0u8; config::UDPCTL_MESSAGE_SIZE];
    let mut ctl_out = vec![0u8; config::UDPCTL_MESSAGE_SIZE];
    let mut ntp_buf = vec![0u8; 128];
    let mut ntp_poll = tokio::time::interval(Duration::from_secs(config::NTP_REQUEST_TIMEOUT_SECS as u64));
    let mut sched_tick = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            res = ctl_socket.recv_from(&mut ctl_buf) => {
                let (len, peer) = res?;
                let std::net::IpAddr::V4(addr) = peer.ip() else { continue };
                let n = node.lock().on_datagram(addr, peer.port(), &ctl_buf[..len], &mut ctl_out);
                if n > 0 {
                    if let Err(e) = ctl_socket.send_to(&ctl_out[..n], peer).await {
                        warn!(%peer, error = %e, "send failed");
                    }
                }
            }

            res = ntp_socket.recv_from(&mut ntp_buf) => {
                if let Ok((len, _)) = res {
                    node.lock().on_ntp_packet(&ntp_buf[..len]);
                }
            }

            _ = ntp_poll.tick() => {
                node.lock().on_ntp_poll();
            }

            _ = sched_tick.tick() => {
                if sched_timer.expired() {
                    sched_timer.clone().disarm();
                    node.lock().on_sched_timer();
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}
