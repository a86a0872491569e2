// Authenticated handshake over the control channel.

use std::net::Ipv4Addr;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use things_shell::config;
use things_shell::dtlv::codes::{common, udpctl as avp};
use things_shell::dtlv::DtlvDec;
use things_shell::imdb::{Imdb, ImdbDef};
use things_shell::platform::sim::{SimClock, SimRng};
use things_shell::svcs::{Runtime, ServiceController};
use things_shell::udpctl::{
    result_code, UdpctlConf, UdpctlCore, AUTH_HDR_BYTES, CMD_AUTH, CMD_SRVMSG, DIGEST_BYTES, FLAG_ERROR,
    FLAG_REQUEST, FLAG_SECURED, HDR_BYTES, SEC_HDR_BYTES,
};

fn hmac256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256>>::new_from_slice(key).unwrap();
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

fn runtime() -> Runtime {
    Runtime::new(
        Imdb::init(ImdbDef { block_size: 1024 }),
        Box::new(SimClock::new(1_700_000_000)),
        Box::new(SimRng::new(11)),
    )
}

// Build a client-side AUTH request: digest over the packet with the digest
// field zeroed (no prior chaining key).
fn build_auth_request(secret: &[u8], identifier: u16, authenticator: &[u8; 32]) -> Vec<u8> {
    let mut pkt = vec![0u8; AUTH_HDR_BYTES];
    pkt[0..2].copy_from_slice(&1u16.to_be_bytes()); // controller service
    let pkt_len = pkt.len() as u16;
    pkt[2..4].copy_from_slice(&pkt_len.to_be_bytes());
    pkt[4] = FLAG_REQUEST | FLAG_SECURED;
    pkt[5] = CMD_AUTH;
    pkt[6..8].copy_from_slice(&identifier.to_be_bytes());
    pkt[SEC_HDR_BYTES..AUTH_HDR_BYTES].copy_from_slice(authenticator);
    let digest = hmac256(secret, &pkt);
    pkt[HDR_BYTES..SEC_HDR_BYTES].copy_from_slice(&digest);
    pkt
}

#[test]
fn test_secured_auth_handshake() {
    let secret = b"s";
    let mut rt = runtime();
    let mut ctl = ServiceController::start(&mut rt).unwrap();
    let mut core = UdpctlCore::new(UdpctlConf { secret: secret.to_vec(), ..Default::default() });

    let authenticator = [0xA5u8; DIGEST_BYTES];
    let req = build_auth_request(secret, 1, &authenticator);
    let req_digest: [u8; 32] = req[HDR_BYTES..SEC_HDR_BYTES].try_into().unwrap();

    let mut out = vec![0u8; config::UDPCTL_MESSAGE_SIZE];
    let n = core.process(&mut rt, &mut ctl, Ipv4Addr::new(10, 0, 0, 9), 4000, &req, &mut out);
    assert!(n > AUTH_HDR_BYTES);
    let resp = &out[..n];

    // REQUEST=0, SECURED=1, ERROR=0; identifier echoed.
    assert_eq!(resp[4] & FLAG_REQUEST, 0);
    assert_ne!(resp[4] & FLAG_SECURED, 0);
    assert_eq!(resp[4] & FLAG_ERROR, 0);
    assert_eq!(u16::from_be_bytes(resp[6..8].try_into().unwrap()), 1);
    assert_eq!(u16::from_be_bytes(resp[2..4].try_into().unwrap()) as usize, n);

    // Body acknowledges protocol 0x0100 and SUCCESS plus the idle timeout.
    let mut seen_proto = None;
    let mut seen_result = None;
    let mut seen_idle = None;
    let mut dec = DtlvDec::new(&resp[AUTH_HDR_BYTES..]);
    while let Ok(a) = dec.decode() {
        match a.hdr.code {
            avp::PROTOCOL => seen_proto = dec.get_u16(&a).ok(),
            common::RESULT_CODE => seen_result = dec.get_u8(&a).ok(),
            avp::IDLE_TIMEOUT => seen_idle = dec.get_u16(&a).ok(),
            _ => {}
        }
    }
    assert_eq!(seen_proto, Some(0x0100));
    assert_eq!(seen_result, Some(result_code::SUCCESS));
    assert_eq!(seen_idle, Some(config::UDPCTL_DEFAULT_IDLE_TX as u16));

    // Response digest chains from the request digest: HMAC over the
    // response with its digest field replaced by the request's digest.
    let resp_digest: [u8; 32] = resp[HDR_BYTES..SEC_HDR_BYTES].try_into().unwrap();
    let mut probe = resp.to_vec();
    probe[HDR_BYTES..SEC_HDR_BYTES].copy_from_slice(&req_digest);
    assert_eq!(hmac256(secret, &probe), resp_digest);
}

#[test]
fn test_chained_srvmsg_after_auth() {
    let secret = b"shared-secret";
    let mut rt = runtime();
    let mut ctl = ServiceController::start(&mut rt).unwrap();
    let mut core = UdpctlCore::new(UdpctlConf { secret: secret.to_vec(), ..Default::default() });
    let addr = Ipv4Addr::new(10, 0, 0, 9);

    let req = build_auth_request(secret, 7, &[1u8; DIGEST_BYTES]);
    let mut out = vec![0u8; config::UDPCTL_MESSAGE_SIZE];
    let n = core.process(&mut rt, &mut ctl, addr, 4000, &req, &mut out);
    assert_eq!(out[4] & FLAG_ERROR, 0);
    let chain: [u8; 32] = out[HDR_BYTES..SEC_HDR_BYTES].try_into().unwrap();
    let _ = n;

    // Next packet: SRVMSG to the controller (INFO), digest computed with
    // the previous response digest in the digest field.
    let mut body = vec![0u8; 64];
    let body_len = {
        use things_shell::dtlv::{DtlvEnc, DtlvType};
        let mut enc = DtlvEnc::new(&mut body);
        let g = enc.avp_encode(1, common::SVC_MESSAGE, DtlvType::Object, 0, false).unwrap();
        enc.encode_u16(common::SVC_MESSAGE_TYPE, 1).unwrap(); // INFO
        enc.group_done(g).unwrap();
        enc.datalen()
    };

    let mut pkt = vec![0u8; SEC_HDR_BYTES + body_len];
    pkt[0..2].copy_from_slice(&1u16.to_be_bytes());
    let pkt_len = pkt.len() as u16;
    pkt[2..4].copy_from_slice(&pkt_len.to_be_bytes());
    pkt[4] = FLAG_REQUEST | FLAG_SECURED;
    pkt[5] = CMD_SRVMSG;
    pkt[6..8].copy_from_slice(&8u16.to_be_bytes());
    pkt[SEC_HDR_BYTES..].copy_from_slice(&body[..body_len]);
    pkt[HDR_BYTES..SEC_HDR_BYTES].copy_from_slice(&chain);
    let digest = hmac256(secret, &pkt);
    pkt[HDR_BYTES..SEC_HDR_BYTES].copy_from_slice(&digest);

    let n = core.process(&mut rt, &mut ctl, addr, 4000, &pkt, &mut out);
    assert!(n > 0);
    assert_eq!(out[4] & FLAG_ERROR, 0, "srvmsg accepted on chained digest");

    // A replay with the stale chain digest must now fail.
    let n = core.process(&mut rt, &mut ctl, addr, 4000, &pkt, &mut out);
    assert!(n > 0);
    assert_ne!(out[4] & FLAG_ERROR, 0, "stale digest rejected");
}

#[test]
fn test_auth_rejected_without_secured_flag() {
    let secret = b"s";
    let mut rt = runtime();
    let mut ctl = ServiceController::start(&mut rt).unwrap();
    let mut core = UdpctlCore::new(UdpctlConf { secret: secret.to_vec(), ..Default::default() });

    let mut pkt = vec![0u8; HDR_BYTES];
    pkt[0..2].copy_from_slice(&1u16.to_be_bytes());
    let pkt_len = pkt.len() as u16;
    pkt[2..4].copy_from_slice(&pkt_len.to_be_bytes());
    pkt[4] = FLAG_REQUEST;
    pkt[5] = CMD_AUTH;

    let mut out = vec![0u8; config::UDPCTL_MESSAGE_SIZE];
    let n = core.process(&mut rt, &mut ctl, Ipv4Addr::new(10, 0, 0, 1), 1, &pkt, &mut out);
    assert!(n > 0);
    assert_ne!(out[4] & FLAG_ERROR, 0);
}

#[test]
fn test_srvmsg_requires_auth() {
    let mut rt = runtime();
    let mut ctl = ServiceController::start(&mut rt).unwrap();
    let mut core = UdpctlCore::new(UdpctlConf::default()); // unsecured

    let mut pkt = vec![0u8; HDR_BYTES];
    pkt[0..2].copy_from_slice(&1u16.to_be_bytes());
    let pkt_len = pkt.len() as u16;
    pkt[2..4].copy_from_slice(&pkt_len.to_be_bytes());
    pkt[4] = FLAG_REQUEST;
    pkt[5] = CMD_SRVMSG;

    let mut out = vec![0u8; config::UDPCTL_MESSAGE_SIZE];
    let n = core.process(&mut rt, &mut ctl, Ipv4Addr::new(10, 0, 0, 2), 2, &pkt, &mut out);
    assert!(n > 0);
    assert_ne!(out[4] & FLAG_ERROR, 0, "client must authenticate first");
}
