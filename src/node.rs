// Node assembly.
//
// Wires the storage instance, the file-backed mirror, the controller and
// the standard service set together, and gives the driver (binary or
// test harness) one object with event entry points: inbound control
// datagrams, scheduler timer expiry, NTP poll/packet events and the
// deferred-broadcast drain.

use std::net::Ipv4Addr;

use tracing::info;

use crate::config::NodeConfig;
use crate::dtlv::codes::svc_id;
use crate::dtlv::DtlvEnc;
use crate::error::SvcsError;
use crate::imdb::media::FileDb;
use crate::imdb::{Imdb, ImdbDef};
use crate::ntp::{ntp_msgtype, NtpConf, NtpService};
use crate::platform::{Clock, Dns, Flash, Rng, Timer, UdpSend};
use crate::sched::SchedService;
use crate::svcs::{Runtime, ServiceController};
use crate::udpctl::{self, UdpctlConf, UdpctlService};

/// Platform collaborators handed to the node at start.
pub struct Platform {
    pub clock: Box<dyn Clock>,
    pub rng: Box<dyn Rng>,
    pub flash: Option<Box<dyn Flash>>,
    pub dns: Box<dyn Dns>,
    pub ntp_udp: Box<dyn UdpSend>,
    pub sched_timer: Box<dyn Timer>,
}

pub struct Node {
    pub rt: Runtime,
    pub ctl: ServiceController,
}

impl Node {
    /// Bring the runtime up and install the standard services: shell,
    /// scheduler, NTP and the control channel.
    pub fn start(cfg: &NodeConfig, mut platform: Platform) -> Result<Node, SvcsError> {
        let imdb = Imdb::init(ImdbDef { block_size: cfg.block_size });
        let mut rt = Runtime::new(imdb, platform.clock, platform.rng);

        if let Some(flash) = platform.flash.as_mut() {
            rt.fdb = Some(FileDb::open(flash.as_mut(), ImdbDef { block_size: cfg.block_size }));
        }
        rt.flash = platform.flash;

        let mut ctl = ServiceController::start(&mut rt)?;

        ctl.install(&mut rt, svc_id::LSH, crate::lsh::SERVICE_NAME, true, Box::new(crate::lsh::LshService))?;
        ctl.install(
            &mut rt,
            svc_id::SCHED,
            crate::sched::SERVICE_NAME,
            true,
            Box::new(SchedService::new(platform.sched_timer)),
        )?;
        ctl.install(
            &mut rt,
            svc_id::NTP,
            crate::ntp::SERVICE_NAME,
            true,
            Box::new(NtpService::new(NtpConf::default(), platform.dns, platform.ntp_udp)),
        )?;
        ctl.install(
            &mut rt,
            svc_id::UDPCTL,
            crate::udpctl::SERVICE_NAME,
            true,
            Box::new(UdpctlService::new(UdpctlConf {
                port: cfg.udpctl_port,
                secret: cfg.udpctl_secret.clone(),
                ..Default::default()
            })),
        )?;

        info!("node started");
        Ok(Node { rt, ctl })
    }

    /// One inbound control datagram; returns the response bytes written
    /// into `out`.
    pub fn on_datagram(&mut self, addr: Ipv4Addr, port: u16, data: &[u8], out: &mut [u8]) -> usize {
        let n = udpctl::process_datagram(&mut self.rt, &mut self.ctl, addr, port, data, out);
        self.drain_broadcasts();
        n
    }

    /// Scheduler timer expiry.
    pub fn on_sched_timer(&mut self) {
        if let Some(mut core) = self.rt.sched.take() {
            core.on_timer(&mut self.rt);
            self.rt.sched = Some(core);
        }
        self.drain_broadcasts();
    }

    /// NTP poll/retry tick.
    pub fn on_ntp_poll(&mut self) {
        let mut scratch = [0u8; 64];
        let mut enc = DtlvEnc::new(&mut scratch);
        let _ = self
            .ctl
            .service_message(&mut self.rt, 0, svc_id::NTP, ntp_msgtype::POLL, None, &mut enc);
        self.drain_broadcasts();
    }

    /// An NTP server answer.
    pub fn on_ntp_packet(&mut self, data: &[u8]) {
        let mut scratch = [0u8; 64];
        let mut enc = DtlvEnc::new(&mut scratch);
        let _ = self
            .ctl
            .service_message(&mut self.rt, 0, svc_id::NTP, ntp_msgtype::PACKET, Some(data), &mut enc);
        self.drain_broadcasts();
    }

    /// Deliver broadcasts queued by handlers during the last dispatch.
    pub fn drain_broadcasts(&mut self) {
        while !self.rt.pending_broadcasts.is_empty() {
            let queued: Vec<u16> = std::mem::take(&mut self.rt.pending_broadcasts);
            for mt in queued {
                let mut scratch = [0u8; 256];
                let mut enc = DtlvEnc::new(&mut scratch);
                let _ = self.ctl.service_message(&mut self.rt, 0, 0, mt, None, &mut enc);
            }
        }
    }

    /// Milliseconds until the scheduler wants its timer event, if armed.
    pub fn sched_deadline_ms(&self) -> Option<u64> {
        self.rt.sched.as_ref().and_then(|c| c.armed_deadline())
    }
}
