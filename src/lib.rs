// Things-Shell runtime
// Core library module

pub mod config;
pub mod dtlv;
pub mod error;
pub mod idxhash;
pub mod imdb;
pub mod lsh;
pub mod node;
pub mod ntp;
pub mod platform;
pub mod sched;
pub mod svcs;
pub mod udpctl;

pub use config::NodeConfig;
pub use error::{DtlvError, IdxError, ImdbError, NtpError, SchedError, ShError, SvcsError, UdpctlError};
pub use node::{Node, Platform};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
