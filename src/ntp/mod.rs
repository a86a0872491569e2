// SNTP client service.
//
// Polls the configured peers on a fixed cadence: resolve, fire up to five
// mode-3 requests, take the first sane mode-4 answer, and step the wall
// clock when the computed offset is at least the minimum step. A step
// queues an ADJTIME broadcast so the scheduler re-derives its deadlines
// against the corrected clock.
//
// The driver feeds this service with two internal message types: POLL on
// the poll/retry timer and PACKET for datagrams arriving on the client
// socket. Neither carries DTLV.

use std::net::Ipv4Addr;

use tracing::{debug, info, warn};

use crate::config;
use crate::dtlv::codes::{ntp as avp, svc_id};
use crate::dtlv::{DtlvDec, DtlvEnc, DtlvType};
use crate::error::SvcsError;
use crate::platform::{Dns, UdpSend};
use crate::svcs::{msgtype, Runtime, Service};

pub const SERVICE_NAME: &str = "ntp";
pub const NTP_PORT: u16 = 123;

/// Internal driver message types.
pub mod ntp_msgtype {
    pub const POLL: u16 = 10;
    pub const PACKET: u16 = 11;
}

const PACKET_BYTES: usize = 48;
/// Seconds between the NTP era and the Unix epoch.
const ERA_OFFSET: u32 = 2_208_988_800;
// LI 0, version 4, mode 3 (client)
const MODE_CLIENT: u8 = 0x23;

#[derive(Debug, Clone)]
pub struct NtpConf {
    pub peers: Vec<String>,
    pub poll_secs: u32,
    pub min_step_msec: u32,
    pub requests_per_peer: u8,
    pub timeout_secs: u32,
}

impl Default for NtpConf {
    fn default() -> Self {
        Self {
            peers: config::NTP_DEFAULT_PEERS.iter().map(|s| s.to_string()).collect(),
            poll_secs: config::NTP_DEFAULT_POLL_SECS,
            min_step_msec: config::NTP_MIN_STEP_MSEC,
            requests_per_peer: config::NTP_REQUESTS_PER_PEER,
            timeout_secs: config::NTP_REQUEST_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundState {
    Idle,
    Waiting,
}

pub struct NtpService {
    conf: NtpConf,
    dns: Box<dyn Dns>,
    udp: Box<dyn UdpSend>,
    state: RoundState,
    peer_idx: usize,
    peer_addr: Option<Ipv4Addr>,
    requests_left: u8,
    next_round_ctime: u32,
    tx_time: u32,
    last_offset_msec: i32,
    last_adjust_time: u32,
}

impl NtpService {
    pub fn new(conf: NtpConf, dns: Box<dyn Dns>, udp: Box<dyn UdpSend>) -> Self {
        Self {
            conf,
            dns,
            udp,
            state: RoundState::Idle,
            peer_idx: 0,
            peer_addr: None,
            requests_left: 0,
            next_round_ctime: 0,
            tx_time: 0,
            last_offset_msec: 0,
            last_adjust_time: 0,
        }
    }

    fn send_request(&mut self, rt: &mut Runtime) {
        let Some(addr) = self.peer_addr else { return };
        let mut pkt = [0u8; PACKET_BYTES];
        pkt[0] = MODE_CLIENT;
        self.tx_time = rt.clock.time();
        let ntp_secs = self.tx_time.wrapping_add(ERA_OFFSET);
        pkt[40..44].copy_from_slice(&ntp_secs.to_be_bytes());
        self.state = RoundState::Waiting;
        debug!(%addr, left = self.requests_left, "ntp request");
        self.udp.sendto(addr, NTP_PORT, &pkt);
    }

    // Start (or continue) a poll round: resolve the peer and fire a
    // request, rotating peers when resolution fails.
    fn poll(&mut self, rt: &mut Runtime) {
        if self.state == RoundState::Waiting {
            // Previous request timed out.
            if self.requests_left > 0 {
                self.requests_left -= 1;
                self.send_request(rt);
                return;
            }
            warn!("ntp round exhausted");
            self.state = RoundState::Idle;
            self.peer_idx = (self.peer_idx + 1) % self.conf.peers.len().max(1);
            return;
        }

        // The driver's poll tick doubles as the retry timer, so rounds are
        // gated to the configured cadence here.
        let now = rt.clock.ctime();
        if now < self.next_round_ctime {
            return;
        }
        self.next_round_ctime = now.wrapping_add(self.conf.poll_secs);

        for _ in 0..self.conf.peers.len().max(1) {
            let host = match self.conf.peers.get(self.peer_idx) {
                Some(h) => h.clone(),
                None => return,
            };
            match self.dns.resolve(&host) {
                Some(addr) => {
                    self.peer_addr = Some(addr);
                    self.requests_left = self.conf.requests_per_peer.saturating_sub(1);
                    self.send_request(rt);
                    return;
                }
                None => {
                    warn!(host = %host, "ntp resolve failed");
                    self.peer_idx = (self.peer_idx + 1) % self.conf.peers.len();
                }
            }
        }
    }

    // A server answer: validate, compute the offset, step if needed.
    fn on_packet(&mut self, rt: &mut Runtime, data: &[u8]) {
        if self.state != RoundState::Waiting || data.len() < PACKET_BYTES {
            return;
        }
        let mode = data[0] & 0x7;
        let stratum = data[1];
        if (mode != 4 && mode != 5) || stratum == 0 {
            warn!(mode, stratum, "ntp invalid packet");
            return;
        }

        let t4 = rt.clock.time();
        let rx_secs = u32::from_be_bytes(data[32..36].try_into().unwrap());
        let rx_frac = u32::from_be_bytes(data[36..40].try_into().unwrap());
        let tx_secs = u32::from_be_bytes(data[40..44].try_into().unwrap());
        let tx_frac = u32::from_be_bytes(data[44..48].try_into().unwrap());
        if tx_secs == 0 {
            return;
        }

        let to_msec = |secs: u32, frac: u32| -> i64 {
            (secs.wrapping_sub(ERA_OFFSET) as i64) * 1000 + ((frac as u64 * 1000) >> 32) as i64
        };
        let t1 = self.tx_time as i64 * 1000;
        let t2 = to_msec(rx_secs, rx_frac);
        let t3 = to_msec(tx_secs, tx_frac);
        let t4 = t4 as i64 * 1000;

        let offset = ((t2 - t1) + (t3 - t4)) / 2;
        self.state = RoundState::Idle;
        self.last_offset_msec = offset.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        debug!(offset_msec = offset, "ntp answer");

        if offset.unsigned_abs() >= self.conf.min_step_msec as u64 {
            let new_unix = ((t4 + offset) / 1000) as u32;
            rt.clock.adjust(new_unix);
            self.last_adjust_time = new_unix;
            info!(offset_msec = offset, new_unix, "clock stepped");
            rt.post_broadcast(msgtype::ADJTIME);
        }
    }

    fn encode_info(&self, msg_out: &mut DtlvEnc) -> std::result::Result<(), SvcsError> {
        let list = msg_out.encode_list(0, avp::PEER, DtlvType::Char)?;
        for host in &self.conf.peers {
            msg_out.encode_char(avp::PEER, host)?;
        }
        msg_out.group_done(list)?;
        msg_out.encode_u32(avp::POLL_INTERVAL, self.conf.poll_secs)?;
        msg_out.encode_u8(avp::PEER_STATE, (self.state == RoundState::Waiting) as u8)?;
        msg_out.encode_u32(avp::LAST_OFFSET, self.last_offset_msec as u32)?;
        if self.last_adjust_time != 0 {
            msg_out.encode_u32(avp::LAST_ADJUST_TIME, self.last_adjust_time)?;
        }
        Ok(())
    }

    fn apply_conf(&mut self, body: &[u8]) {
        let mut dec = DtlvDec::new(body);
        let mut peers = Vec::new();
        while let Ok(a) = dec.decode() {
            if a.hdr.ns != 0 && a.hdr.ns as u16 != svc_id::NTP {
                continue;
            }
            match a.hdr.code {
                avp::PEER => {
                    if let Ok(h) = dec.get_char(&a) {
                        peers.push(h.to_string());
                    }
                }
                avp::POLL_INTERVAL => {
                    if let Ok(v) = dec.get_uint(&a) {
                        self.conf.poll_secs = v;
                    }
                }
                _ => {}
            }
        }
        if !peers.is_empty() {
            self.conf.peers = peers;
            self.peer_idx = 0;
        }
    }

    /// Retry/poll cadence for the driver: request timeout while a round is
    /// open, the poll interval otherwise.
    pub fn next_poll_secs(&self) -> u32 {
        match self.state {
            RoundState::Waiting => self.conf.timeout_secs,
            RoundState::Idle => self.conf.poll_secs,
        }
    }
}

impl Service for NtpService {
    fn on_start(&mut self, _rt: &mut Runtime, conf: Option<&[u8]>) -> std::result::Result<(), SvcsError> {
        if let Some(body) = conf {
            self.apply_conf(body);
        }
        info!(peers = ?self.conf.peers, poll = self.conf.poll_secs, "ntp started");
        Ok(())
    }

    fn on_stop(&mut self, _rt: &mut Runtime) -> std::result::Result<(), SvcsError> {
        self.state = RoundState::Idle;
        Ok(())
    }

    fn on_message(
        &mut self,
        rt: &mut Runtime,
        _orig: u16,
        mt: u16,
        msg_in: Option<&[u8]>,
        msg_out: &mut DtlvEnc,
    ) -> std::result::Result<(), SvcsError> {
        match mt {
            msgtype::INFO => self.encode_info(msg_out),
            msgtype::NETWORK => {
                // Network came up: open a round right away.
                self.poll(rt);
                Ok(())
            }
            ntp_msgtype::POLL => {
                self.poll(rt);
                Ok(())
            }
            ntp_msgtype::PACKET => {
                self.on_packet(rt, msg_in.ok_or(SvcsError::InvalidMessage)?);
                Ok(())
            }
            _ => Err(SvcsError::MsgTypeInvalid),
        }
    }

    fn on_cfgupd(&mut self, _rt: &mut Runtime, conf: &[u8]) -> std::result::Result<(), SvcsError> {
        self.apply_conf(conf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imdb::{Imdb, ImdbDef};
    use crate::platform::sim::{SimClock, SimDns, SimRng, SimUdp};
    use parking_lot::Mutex;
    use std::sync::Arc;

    // Shared-capture UDP sink.
    #[derive(Clone, Default)]
    struct SharedUdp(Arc<Mutex<SimUdp>>);

    impl UdpSend for SharedUdp {
        fn sendto(&mut self, addr: Ipv4Addr, port: u16, data: &[u8]) {
            self.0.lock().sendto(addr, port, data);
        }
    }

    fn runtime() -> Runtime {
        Runtime::new(
            Imdb::init(ImdbDef { block_size: 1024 }),
            Box::new(SimClock::new(1_700_000_000)),
            Box::new(SimRng::new(5)),
        )
    }

    fn service(sink: SharedUdp) -> NtpService {
        let dns = SimDns::default().with("0.pool.ntp.org", Ipv4Addr::new(192, 0, 2, 1));
        NtpService::new(NtpConf::default(), Box::new(dns), Box::new(sink))
    }

    fn reply_for(request_unix: u32, server_unix: u32) -> Vec<u8> {
        let mut pkt = vec![0u8; PACKET_BYTES];
        pkt[0] = 0x24; // v4, server
        pkt[1] = 2; // stratum
        let secs = server_unix.wrapping_add(ERA_OFFSET);
        pkt[32..36].copy_from_slice(&secs.to_be_bytes());
        pkt[40..44].copy_from_slice(&secs.to_be_bytes());
        let _ = request_unix;
        pkt
    }

    #[test]
    fn test_poll_sends_mode3_request() {
        let mut rt = runtime();
        let sink = SharedUdp::default();
        let mut svc = service(sink.clone());
        svc.poll(&mut rt);

        let sent = sink.0.lock().sent.clone();
        assert_eq!(sent.len(), 1);
        let (addr, port, data) = &sent[0];
        assert_eq!(*addr, Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(*port, NTP_PORT);
        assert_eq!(data[0], MODE_CLIENT);
        assert_eq!(data.len(), PACKET_BYTES);
        assert_eq!(svc.next_poll_secs(), config::NTP_REQUEST_TIMEOUT_SECS);
    }

    #[test]
    fn test_large_offset_steps_clock_and_broadcasts() {
        let mut rt = runtime();
        let sink = SharedUdp::default();
        let mut svc = service(sink);
        svc.poll(&mut rt);

        let now = rt.clock.time();
        let reply = reply_for(now, now + 120); // two minutes ahead
        svc.on_packet(&mut rt, &reply);

        assert!((rt.clock.time() as i64 - (now as i64 + 120)).abs() <= 1);
        assert_eq!(rt.pending_broadcasts, vec![msgtype::ADJTIME]);
        assert_eq!(svc.next_poll_secs(), config::NTP_DEFAULT_POLL_SECS);
    }

    #[test]
    fn test_small_offset_is_ignored() {
        let mut rt = runtime();
        let sink = SharedUdp::default();
        let mut svc = service(sink);
        svc.poll(&mut rt);

        let now = rt.clock.time();
        let reply = reply_for(now, now); // same second: below the step floor
        svc.on_packet(&mut rt, &reply);

        assert_eq!(rt.clock.time(), now);
        assert!(rt.pending_broadcasts.is_empty());
    }

    #[test]
    fn test_invalid_packets_rejected() {
        let mut rt = runtime();
        let sink = SharedUdp::default();
        let mut svc = service(sink);
        svc.poll(&mut rt);

        let now = rt.clock.time();
        let mut bad = reply_for(now, now + 500);
        bad[1] = 0; // kiss-of-death stratum
        svc.on_packet(&mut rt, &bad);
        assert_eq!(rt.clock.time(), now);

        let mut short = reply_for(now, now + 500);
        short.truncate(20);
        svc.on_packet(&mut rt, &short);
        assert_eq!(rt.clock.time(), now);
    }

    #[test]
    fn test_round_retries_then_gives_up() {
        let mut rt = runtime();
        let sink = SharedUdp::default();
        let mut svc = service(sink.clone());
        svc.poll(&mut rt); // first request
        for _ in 0..config::NTP_REQUESTS_PER_PEER {
            svc.poll(&mut rt); // timeouts
        }
        assert_eq!(sink.0.lock().sent.len(), config::NTP_REQUESTS_PER_PEER as usize);
        assert_eq!(svc.next_poll_secs(), config::NTP_DEFAULT_POLL_SECS);
    }
}
