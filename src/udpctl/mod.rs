// UDP control protocol.
//
//      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//     |          Service-Id           |             Length            |
//     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//     |R S E x x x x x|    Cmd Code   |          Identifier           |
//     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//     |      Message Digest (256 bits, present iff SECURED) ...       |
//     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//     |     Authenticator (256 bits, present iff Cmd == AUTH) ...     |
//     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//     |                     DTLV Body ...                             |
//     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
// Message digests chain: each packet's digest is an HMAC over the whole
// datagram with the digest field replaced by the previous packet's digest
// (zeroes for the first AUTH request). Verification HMACs both the
// computed and the received digest once more, so neither side compares a
// transmittable pre-image. The response digest becomes the next chaining
// key.

use std::net::Ipv4Addr;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::config;
use crate::dtlv::codes::{common, svc_id, udpctl as avp};
use crate::dtlv::{DtlvDec, DtlvEnc, DtlvType, NsCode};
use crate::error::{SvcsError, UdpctlError};
use crate::svcs::{msgtype, Runtime, Service, ServiceController};

pub type Result<T> = std::result::Result<T, UdpctlError>;

pub const SERVICE_NAME: &str = "udpctl";
pub const PROTOCOL_VERSION: u16 = 0x0100;

pub const HDR_BYTES: usize = 8;
pub const SEC_HDR_BYTES: usize = 40;
pub const AUTH_HDR_BYTES: usize = 72;
pub const DIGEST_BYTES: usize = 32;

pub const FLAG_REQUEST: u8 = 0x80;
pub const FLAG_SECURED: u8 = 0x40;
pub const FLAG_ERROR: u8 = 0x20;

pub const CMD_AUTH: u8 = 1;
pub const CMD_TERMINATE: u8 = 2;
pub const CMD_SRVMSG: u8 = 3;

/// Result-Code AVP values.
pub mod result_code {
    pub const SUCCESS: u8 = 1;
    pub const COMMAND_ERROR: u8 = 2;
    pub const SERVICE_ERROR: u8 = 3;
    pub const PROTOCOL_ERROR: u8 = 4;
    pub const INTERNAL_ERROR: u8 = 5;
}

/// Client slot lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    #[default]
    None,
    Fail,
    Timeout,
    Auth,
    Open,
}

#[derive(Debug, Clone, Default)]
pub struct Client {
    pub state: ClientState,
    pub remote_ip: Option<Ipv4Addr>,
    pub remote_port: u16,
    pub auth: [u8; DIGEST_BYTES],
    pub first_time: u32,
    pub last_time: u32,
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct UdpctlConf {
    pub port: u16,
    pub secret: Vec<u8>,
    pub clients_limit: usize,
    pub auth_tx: u32,
    pub idle_tx: u32,
    pub recycle_tx: u32,
}

impl Default for UdpctlConf {
    fn default() -> Self {
        Self {
            port: config::UDPCTL_DEFAULT_PORT,
            secret: Vec::new(),
            clients_limit: config::UDPCTL_CLIENTS_MAX,
            auth_tx: config::UDPCTL_DEFAULT_AUTH_TX,
            idle_tx: config::UDPCTL_DEFAULT_IDLE_TX,
            recycle_tx: config::UDPCTL_DEFAULT_RECYCLE_TX,
        }
    }
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; DIGEST_BYTES] {
    let mut mac = <Hmac<Sha256>>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

// Header field accessors (big-endian).
fn rd_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes(buf[off..off + 2].try_into().unwrap())
}

fn wr_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

/// The protocol engine: client table plus packet processing.
pub struct UdpctlCore {
    pub conf: UdpctlConf,
    clients: Vec<Client>,
}

impl UdpctlCore {
    pub fn new(conf: UdpctlConf) -> Self {
        let clients = vec![Client::default(); config::UDPCTL_CLIENTS_MAX];
        Self { conf, clients }
    }

    pub fn clients(&self) -> &[Client] {
        &self.clients
    }

    // Expiry bookkeeping; a slot checked past its timeout degrades to
    // TIMEOUT and then frees on the next touch.
    fn check_state(&mut self, i: usize, now: u32) -> bool {
        let cli = &mut self.clients[i];
        let timeout = match cli.state {
            ClientState::Auth => self.conf.auth_tx,
            ClientState::Open => self.conf.idle_tx,
            ClientState::None => return false,
            _ => self.conf.recycle_tx,
        };
        if now.wrapping_sub(cli.last_time) > timeout {
            if cli.state == ClientState::Timeout {
                cli.state = ClientState::None;
                return false;
            }
            cli.state = ClientState::Timeout;
        }
        true
    }

    /// Find or create the slot for a remote endpoint. An AUTH request
    /// recycles an existing slot.
    pub fn client_slot(&mut self, ip: Ipv4Addr, port: u16, reuse: bool, now: u32) -> Result<usize> {
        let limit = self.conf.clients_limit.min(config::UDPCTL_CLIENTS_MAX);
        let mut empty: Option<usize> = None;
        let mut target: Option<usize> = None;

        for i in 0..limit {
            if !self.check_state(i, now) {
                let keep = matches!(empty, Some(e) if self.clients[e].state == ClientState::None);
                if !keep {
                    empty = Some(i);
                }
                continue;
            }
            let cli = &self.clients[i];
            if cli.remote_ip == Some(ip) && cli.remote_port == port {
                target = Some(i);
            }
        }

        if target.is_some() && reuse {
            empty = target.take();
        }

        if let Some(t) = target {
            self.clients[t].last_time = now;
            Ok(t)
        } else if let Some(e) = empty {
            self.clients[e] = Client {
                state: ClientState::None,
                remote_ip: Some(ip),
                remote_port: port,
                auth: [0; DIGEST_BYTES],
                first_time: now,
                last_time: now,
            };
            Ok(e)
        } else {
            Err(UdpctlError::ClientsLimitExceeded)
        }
    }

    // Verify a SECURED packet against the stored chaining key. Both sides
    // compare one extra HMAC of the digest, never the digest itself.
    fn check_digest(&self, cli: usize, packet: &[u8]) -> Result<()> {
        let mut probe = packet.to_vec();
        let digest_in: [u8; DIGEST_BYTES] = packet[HDR_BYTES..SEC_HDR_BYTES].try_into().unwrap();
        probe[HDR_BYTES..SEC_HDR_BYTES].copy_from_slice(&self.clients[cli].auth);

        let computed = hmac_sha256(&self.conf.secret, &probe);
        let cmp_a = hmac_sha256(&self.conf.secret, &computed);
        let cmp_b = hmac_sha256(&self.conf.secret, &digest_in);
        if cmp_a == cmp_b {
            Ok(())
        } else {
            Err(UdpctlError::InvalidDigest)
        }
    }

    // Finalize a SECURED response: fresh authenticator for AUTH answers,
    // digest chained from the request's digest field.
    fn answer_digest(&mut self, rt: &mut Runtime, cli: usize, out: &mut [u8], req_digest: &[u8]) {
        if out[4] & FLAG_SECURED == 0 {
            return;
        }
        if out[5] == CMD_AUTH {
            let mut initial = [0u8; DIGEST_BYTES];
            rt.rng.fill(&mut initial);
            let auth = hmac_sha256(&self.conf.secret, &initial);
            out[SEC_HDR_BYTES..AUTH_HDR_BYTES].copy_from_slice(&auth);
        }

        out[HDR_BYTES..SEC_HDR_BYTES].copy_from_slice(&req_digest[..DIGEST_BYTES]);
        let digest = hmac_sha256(&self.conf.secret, out);
        out[HDR_BYTES..SEC_HDR_BYTES].copy_from_slice(&digest);

        if self.clients[cli].state != ClientState::Fail {
            self.clients[cli].auth = digest;
        }
    }

    /// Process one request datagram; returns the response length.
    pub fn process(
        &mut self,
        rt: &mut Runtime,
        ctl: &mut ServiceController,
        addr: Ipv4Addr,
        port: u16,
        data_in: &[u8],
        data_out: &mut [u8],
    ) -> usize {
        let now = rt.clock.ctime();
        let unix_now = rt.clock.time();
        let secured = !self.conf.secret.is_empty();

        // Fallback header for undecodable requests.
        data_out[..HDR_BYTES].fill(0);

        if data_in.len() < HDR_BYTES {
            return self.answer_err(
                rt,
                None,
                data_out,
                HDR_BYTES,
                &[],
                result_code::PROTOCOL_ERROR,
                UdpctlError::InvalidLength,
                "minimum header",
                addr,
                port,
                unix_now,
            );
        }

        let in_service = rd_u16(data_in, 0);
        let in_length = rd_u16(data_in, 2);
        let in_flags = data_in[4];
        let in_code = data_in[5];
        let in_ident = rd_u16(data_in, 6);

        let hdrlen = if !secured {
            HDR_BYTES
        } else if in_code == CMD_AUTH {
            AUTH_HDR_BYTES
        } else {
            SEC_HDR_BYTES
        };

        data_out[..hdrlen].fill(0);
        wr_u16(data_out, 0, in_service);
        data_out[4] = if secured { FLAG_SECURED } else { 0 };
        data_out[5] = in_code;
        wr_u16(data_out, 6, in_ident);

        let req_digest: Vec<u8> = if data_in.len() >= SEC_HDR_BYTES {
            data_in[HDR_BYTES..SEC_HDR_BYTES].to_vec()
        } else {
            vec![0; DIGEST_BYTES]
        };

        let cli = match self.client_slot(addr, port, in_code == CMD_AUTH, now) {
            Ok(c) => c,
            Err(e) => {
                return self.answer_err(
                    rt, None, data_out, hdrlen, &req_digest,
                    result_code::PROTOCOL_ERROR, e, "", addr, port, unix_now,
                );
            }
        };

        macro_rules! bail {
            ($rescode:expr, $err:expr, $detail:expr) => {
                return self.answer_err(
                    rt, Some(cli), data_out, hdrlen, &req_digest,
                    $rescode, $err, $detail, addr, port, unix_now,
                )
            };
        }

        if data_in.len() < hdrlen {
            bail!(result_code::PROTOCOL_ERROR, UdpctlError::InvalidLength, "less than header");
        }
        if in_flags & FLAG_REQUEST == 0 {
            bail!(result_code::COMMAND_ERROR, UdpctlError::InvalidFlags, "REQ flag absent");
        }
        if in_length as usize != data_in.len() {
            bail!(result_code::PROTOCOL_ERROR, UdpctlError::InvalidLength, "message length");
        }
        if !secured && in_flags & FLAG_SECURED != 0 {
            bail!(result_code::PROTOCOL_ERROR, UdpctlError::ServerNotSecured, "");
        }
        if secured {
            if in_flags & FLAG_SECURED == 0 {
                bail!(result_code::PROTOCOL_ERROR, UdpctlError::ServerSecured, "");
            }
            if self.check_digest(cli, data_in).is_err() {
                bail!(result_code::PROTOCOL_ERROR, UdpctlError::InvalidDigest, "");
            }
        }

        if in_code != CMD_AUTH {
            match self.clients[cli].state {
                ClientState::Auth => self.clients[cli].state = ClientState::Open,
                ClientState::Open => {}
                _ => bail!(result_code::PROTOCOL_ERROR, UdpctlError::ClientNoAuth, ""),
            }
        }

        let body_in = &data_in[hdrlen..];
        let (head, body_out) = data_out.split_at_mut(hdrlen);
        let mut enc = DtlvEnc::new(body_out);
        let _ = enc.encode_u32(common::EVENT_TIMESTAMP, unix_now);

        let mut failed: Option<(u8, UdpctlError, &'static str)> = None;
        match in_code {
            CMD_SRVMSG => {
                match self.dispatch_srvmsg(rt, ctl, in_service, body_in, &mut enc) {
                    Ok(()) => {}
                    Err(e) => failed = Some((result_code::COMMAND_ERROR, e.0, e.1)),
                }
            }
            CMD_AUTH if in_service == svc_id::CONTROLLER && self.clients[cli].state == ClientState::None => {
                self.clients[cli].state = ClientState::Auth;
                let _ = enc.encode_u16(avp::PROTOCOL, PROTOCOL_VERSION);
                let _ = enc.encode_u8(common::RESULT_CODE, result_code::SUCCESS);
                let _ = enc.encode_u16(avp::IDLE_TIMEOUT, self.conf.idle_tx as u16);
                debug!(client = cli, %addr, port, "client authenticated");
            }
            _ => failed = Some((result_code::COMMAND_ERROR, UdpctlError::UnsupportedCommand, "")),
        }
        let body_len = enc.datalen();
        drop(enc);
        let _ = head;

        if let Some((rescode, err, detail)) = failed {
            return self.answer_err(
                rt, Some(cli), data_out, hdrlen, &req_digest, rescode, err, detail, addr, port, unix_now,
            );
        }

        self.finish(rt, cli, data_out, hdrlen, body_len, &req_digest)
    }

    // SRVMSG: unwrap the nested service message and route it.
    fn dispatch_srvmsg(
        &mut self,
        rt: &mut Runtime,
        ctl: &mut ServiceController,
        serv_id: u16,
        body_in: &[u8],
        enc: &mut DtlvEnc,
    ) -> std::result::Result<(), (UdpctlError, &'static str)> {
        let mut dec = DtlvDec::new(body_in);
        let path = [NsCode::new(serv_id as u8, common::SVC_MESSAGE)];
        let (found, total) = dec
            .decode_bypath(&path, 1)
            .map_err(|_| (UdpctlError::DecodingError, "message decode"))?;
        if total != 1 {
            return Err((UdpctlError::InvalidCommand, "AVP Message is absent"));
        }
        let inner_bytes = dec.data(&found[0]);

        let mut inner = DtlvDec::new(inner_bytes);
        let mt_avp = inner
            .decode()
            .map_err(|_| (UdpctlError::InvalidCommand, "AVP Message-Type must be first"))?;
        if mt_avp.hdr.code != common::SVC_MESSAGE_TYPE {
            return Err((UdpctlError::InvalidCommand, "AVP Message-Type must be first"));
        }
        let mt = inner
            .get_u16(&mt_avp)
            .map_err(|_| (UdpctlError::InvalidCommand, "AVP Message-Type is invalid"))?;
        let rest = &inner_bytes[crate::dtlv::align4(mt_avp.hdr.length as usize)..];

        let g = enc
            .avp_encode(serv_id as u8, common::SVC_MESSAGE, DtlvType::Object, 0, false)
            .map_err(|_| (UdpctlError::Internal, ""))?;

        let ret = if serv_id == svc_id::UDPCTL && mt == msgtype::INFO {
            // The engine answers for itself; its runtime slot is vacant
            // while a datagram is in flight.
            self.encode_info(rt, enc).map_err(|_| SvcsError::Internal)
        } else {
            ctl.service_message(rt, svc_id::UDPCTL, serv_id, mt, Some(rest), enc)
        };

        enc.group_done(g).map_err(|_| (UdpctlError::Internal, ""))?;

        match ret {
            Ok(()) => {
                let _ = enc.encode_u8(common::RESULT_CODE, result_code::SUCCESS);
            }
            Err(e) => {
                let _ = enc.encode_u8(common::RESULT_CODE, result_code::SERVICE_ERROR);
                let _ = enc.encode_u8(common::RESULT_EXT_CODE, e as u8);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn answer_err(
        &mut self,
        rt: &mut Runtime,
        cli: Option<usize>,
        data_out: &mut [u8],
        hdrlen: usize,
        req_digest: &[u8],
        rescode: u8,
        err: UdpctlError,
        detail: &str,
        addr: Ipv4Addr,
        port: u16,
        unix_now: u32,
    ) -> usize {
        if let Some(c) = cli {
            self.clients[c].state = ClientState::Fail;
        }
        data_out[4] |= FLAG_ERROR;

        let errmsg = if detail.is_empty() { format!("{err}") } else { format!("{err}: {detail}") };
        warn!(%addr, port, "{errmsg}");

        let (_, body_out) = data_out.split_at_mut(hdrlen);
        let mut enc = DtlvEnc::new(body_out);
        let _ = enc.encode_u32(common::EVENT_TIMESTAMP, unix_now);
        let _ = enc.encode_u16(avp::PROTOCOL, PROTOCOL_VERSION);
        let _ = enc.encode_u8(common::RESULT_CODE, rescode);
        let _ = enc.encode_char(common::RESULT_MESSAGE, &errmsg);
        let _ = enc.encode_u8(common::RESULT_EXT_CODE, err as u8);
        let body_len = enc.datalen();

        match cli {
            Some(c) => self.finish(rt, c, data_out, hdrlen, body_len, req_digest),
            None => {
                // No slot: answer unsecured, no digest chain to maintain.
                data_out[4] &= !FLAG_SECURED;
                let len = HDR_BYTES + body_len;
                if hdrlen != HDR_BYTES {
                    data_out.copy_within(hdrlen..hdrlen + body_len, HDR_BYTES);
                }
                wr_u16(data_out, 2, len as u16);
                len
            }
        }
    }

    fn finish(
        &mut self,
        rt: &mut Runtime,
        cli: usize,
        data_out: &mut [u8],
        hdrlen: usize,
        body_len: usize,
        req_digest: &[u8],
    ) -> usize {
        let out_hdrlen = if data_out[4] & FLAG_SECURED != 0 {
            if data_out[5] == CMD_AUTH {
                AUTH_HDR_BYTES
            } else {
                SEC_HDR_BYTES
            }
        } else {
            HDR_BYTES
        };
        debug_assert_eq!(out_hdrlen, hdrlen);
        let len = out_hdrlen + body_len;
        wr_u16(data_out, 2, len as u16);
        self.answer_digest(rt, cli, &mut data_out[..len], req_digest);
        len
    }

    /// Client table snapshot for INFO answers.
    pub fn encode_info(&self, rt: &Runtime, msg_out: &mut DtlvEnc) -> std::result::Result<(), crate::error::DtlvError> {
        let list = msg_out.encode_list(0, avp::CLIENT, DtlvType::Object)?;
        for cli in self.clients.iter().take(self.conf.clients_limit) {
            if cli.state == ClientState::None {
                continue;
            }
            let g = msg_out.encode_group(0, avp::CLIENT)?;
            if let Some(ip) = cli.remote_ip {
                msg_out.encode_octets(common::IPV4_ADDRESS, &ip.octets())?;
            }
            msg_out.encode_u16(common::IP_PORT, cli.remote_port)?;
            msg_out.encode_u8(avp::CLIENT_STATE, cli.state as u8)?;
            msg_out.encode_u32(avp::CLIENT_FIRST_TIME, rt.clock.time_at(cli.first_time))?;
            msg_out.encode_u32(avp::CLIENT_LAST_TIME, rt.clock.time_at(cli.last_time))?;
            msg_out.group_done(g)?;
        }
        msg_out.group_done(list)?;
        Ok(())
    }
}

/// Process one inbound datagram against the node. Returns the number of
/// response bytes written into `data_out` (0 when the channel is down).
pub fn process_datagram(
    rt: &mut Runtime,
    ctl: &mut ServiceController,
    addr: Ipv4Addr,
    port: u16,
    data_in: &[u8],
    data_out: &mut [u8],
) -> usize {
    let Some(mut core) = rt.udpctl.take() else {
        warn!("udpctl not started");
        return 0;
    };
    let len = core.process(rt, ctl, addr, port, data_in, data_out);
    rt.udpctl = Some(core);
    len
}

/// Service adapter owning installation and configuration.
pub struct UdpctlService {
    initial: UdpctlConf,
}

impl UdpctlService {
    pub fn new(initial: UdpctlConf) -> Self {
        Self { initial }
    }

    fn apply_conf(conf: &mut UdpctlConf, body: &[u8]) {
        let mut dec = DtlvDec::new(body);
        while let Ok(a) = dec.decode() {
            if a.hdr.ns != 0 && a.hdr.ns as u16 != svc_id::UDPCTL {
                continue;
            }
            match a.hdr.code {
                avp::SECRET => conf.secret = dec.data(&a).to_vec(),
                common::IP_PORT => {
                    if let Ok(p) = dec.get_u16(&a) {
                        conf.port = p;
                    }
                }
                avp::IDLE_TIMEOUT => {
                    if let Ok(v) = dec.get_uint(&a) {
                        conf.idle_tx = v;
                    }
                }
                avp::AUTH_TIMEOUT => {
                    if let Ok(v) = dec.get_uint(&a) {
                        conf.auth_tx = v;
                    }
                }
                avp::RECYCLE_TIMEOUT => {
                    if let Ok(v) = dec.get_uint(&a) {
                        conf.recycle_tx = v;
                    }
                }
                _ => {}
            }
        }
    }
}

impl Service for UdpctlService {
    fn on_start(&mut self, rt: &mut Runtime, conf: Option<&[u8]>) -> std::result::Result<(), SvcsError> {
        if rt.udpctl.is_some() {
            return Err(SvcsError::ServiceError);
        }
        let mut c = self.initial.clone();
        if let Some(body) = conf {
            Self::apply_conf(&mut c, body);
        }
        info!(port = c.port, secret_len = c.secret.len(), "listen");
        rt.udpctl = Some(UdpctlCore::new(c));
        Ok(())
    }

    fn on_stop(&mut self, rt: &mut Runtime) -> std::result::Result<(), SvcsError> {
        rt.udpctl.take().ok_or(SvcsError::NotRun)?;
        Ok(())
    }

    fn on_message(
        &mut self,
        rt: &mut Runtime,
        _orig: u16,
        mt: u16,
        _msg_in: Option<&[u8]>,
        msg_out: &mut DtlvEnc,
    ) -> std::result::Result<(), SvcsError> {
        match mt {
            msgtype::INFO => {
                let core = rt.udpctl.take().ok_or(SvcsError::NotRun)?;
                let res = core.encode_info(rt, msg_out);
                rt.udpctl = Some(core);
                res.map_err(SvcsError::from)
            }
            _ => Err(SvcsError::MsgTypeInvalid),
        }
    }

    fn on_cfgupd(&mut self, rt: &mut Runtime, conf: &[u8]) -> std::result::Result<(), SvcsError> {
        let core = rt.udpctl.as_mut().ok_or(SvcsError::NotRun)?;
        Self::apply_conf(&mut core.conf, conf);
        info!(port = core.conf.port, "udpctl reconfigured");
        Ok(())
    }
}
