// Compiled-in defaults for the node runtime.
//
// The numbers follow the reference deployment profile: 1 KiB storage
// blocks, UDP control on 3901, NTP against the pool with a 20 minute
// cadence.

/// Storage block size in bytes.
pub const IMDB_BLOCK_SIZE_DEFAULT: u16 = 1024;
/// Smallest accepted block size; requested sizes are clamped up to this.
pub const IMDB_BLOCK_SIZE_MIN: u16 = 512;

/// UDP control channel defaults.
pub const UDPCTL_DEFAULT_PORT: u16 = 3901;
pub const UDPCTL_DEFAULT_IDLE_TX: u32 = 60;
pub const UDPCTL_DEFAULT_AUTH_TX: u32 = 10;
pub const UDPCTL_DEFAULT_RECYCLE_TX: u32 = 60;
pub const UDPCTL_CLIENTS_MAX: usize = 4;
/// Upper bound for one control datagram; kept under a typical MTU.
pub const UDPCTL_MESSAGE_SIZE: usize = 1440;

/// NTP client defaults.
pub const NTP_DEFAULT_PEERS: [&str; 2] = ["0.pool.ntp.org", "1.pool.ntp.org"];
pub const NTP_DEFAULT_POLL_SECS: u32 = 20 * 60;
/// Minimum absolute offset (milliseconds) before the clock is stepped.
pub const NTP_MIN_STEP_MSEC: u32 = 50;
pub const NTP_REQUESTS_PER_PEER: u8 = 5;
pub const NTP_REQUEST_TIMEOUT_SECS: u32 = 10;

/// Node-level configuration assembled by the binary.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub block_size: u16,
    pub udpctl_port: u16,
    pub udpctl_secret: Vec<u8>,
    pub flash_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            block_size: IMDB_BLOCK_SIZE_DEFAULT,
            udpctl_port: UDPCTL_DEFAULT_PORT,
            udpctl_secret: Vec::new(),
            flash_size: 64 * 1024,
        }
    }
}
