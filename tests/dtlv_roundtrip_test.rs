// Wire-level round trips for the TLV codec.

use things_shell::dtlv::codes::{common, svcs};
use things_shell::dtlv::{DtlvDec, DtlvEnc, DtlvType, ForallAvp, NsCode};
use things_shell::DtlvError;

#[test]
fn test_product_and_service_group_wire_shape() {
    // {APP_PRODUCT="abc", SERVICE{SERVICE_ID=7u16, SERVICE_NAME="svc"}}
    let mut buf = [0u8; 128];
    let mut enc = DtlvEnc::new(&mut buf);
    enc.encode_char(common::APP_PRODUCT, "abc").unwrap();
    let g = enc.encode_group(0, svcs::SERVICE).unwrap();
    enc.encode_u16(svcs::SERVICE_ID, 7).unwrap();
    enc.encode_char(common::SERVICE_NAME, "svc").unwrap();
    enc.group_done(g).unwrap();

    // 4+4 (product) + 4 (group hdr) + 8 (u16) + 4+4 (name) = 28 bytes.
    assert_eq!(enc.datalen(), 28);
    let len = enc.datalen();

    let mut dec = DtlvDec::new(&buf[..len]);
    let json = dec.decode_to_json().unwrap();
    assert_eq!(json, r#"{"1":"abc","100":{"101":7,"15":"svc"}}"#);
}

#[test]
fn test_primitive_roundtrip_all_alignments() {
    // Odd-length payloads land on every alignment class.
    for pad in 0..4usize {
        let text: String = "x".repeat(pad + 1);
        let octets: Vec<u8> = (0..pad + 5).map(|i| i as u8).collect();

        let mut buf = [0u8; 256];
        let mut enc = DtlvEnc::new(&mut buf);
        enc.encode_u8(1, 0x5A).unwrap();
        enc.encode_char(2, &text).unwrap();
        enc.encode_octets(3, &octets).unwrap();
        enc.encode_u32(4, 0x01020304).unwrap();
        let len = enc.datalen();
        assert_eq!(len % 4, 0);

        let mut dec = DtlvDec::new(&buf[..len]);
        let a = dec.decode().unwrap();
        assert_eq!(dec.get_u8(&a).unwrap(), 0x5A);
        let b = dec.decode().unwrap();
        assert_eq!(dec.get_char(&b).unwrap(), text);
        let c = dec.decode().unwrap();
        assert_eq!(dec.data(&c), &octets[..]);
        let d = dec.decode().unwrap();
        assert_eq!(dec.get_u32(&d).unwrap(), 0x01020304);
        assert!(matches!(dec.decode(), Err(DtlvError::EndOfData)));
    }
}

#[test]
fn test_forall_visits_encoder_output_in_order() {
    let mut buf = [0u8; 256];
    let mut enc = DtlvEnc::new(&mut buf);
    enc.encode_u8(1, 1).unwrap();
    let outer = enc.encode_group(2, 20).unwrap();
    enc.encode_u8(21, 2).unwrap();
    let inner = enc.encode_group(2, 22).unwrap();
    enc.encode_u8(23, 3).unwrap();
    enc.group_done(inner).unwrap();
    enc.group_done(outer).unwrap();
    enc.encode_u8(5, 4).unwrap();
    let len = enc.datalen();

    let mut visited = Vec::new();
    let mut exits = 0;
    let mut dec = DtlvDec::new(&buf[..len]);
    dec.decode_forall(&[], &mut |avp, _, frame, group_exit| {
        if group_exit {
            exits += 1;
        } else {
            visited.push((avp.hdr.code, frame.depth));
        }
        Ok(ForallAvp::Continue)
    })
    .unwrap();

    assert_eq!(visited, vec![(1, 1), (20, 1), (21, 2), (22, 2), (23, 3), (5, 1)]);
    assert_eq!(exits, 2);
}

#[test]
fn test_bypath_namespace_zero_matches_any() {
    let mut buf = [0u8; 256];
    let mut enc = DtlvEnc::new(&mut buf);
    let g = enc.encode_group(8, 100).unwrap();
    enc.encode_u16(104, 7).unwrap();
    enc.group_done(g).unwrap();
    let len = enc.datalen();

    // Wildcard namespace on both steps.
    let mut dec = DtlvDec::new(&buf[..len]);
    let (found, total) = dec.decode_bypath(&[NsCode::new(0, 100), NsCode::new(0, 104)], 4).unwrap();
    assert_eq!(total, 1);
    assert_eq!(dec.get_u16(&found[0]).unwrap(), 7);

    // Mismatching explicit namespace finds nothing.
    let mut dec = DtlvDec::new(&buf[..len]);
    let (_, total) = dec.decode_bypath(&[NsCode::new(5, 100)], 4).unwrap();
    assert_eq!(total, 0);
}

#[test]
fn test_overflow_keeps_datalen_untouched() {
    let mut buf = [0u8; 10];
    let mut enc = DtlvEnc::new(&mut buf);
    enc.encode_u8(1, 1).unwrap();
    let before = enc.datalen();
    assert_eq!(enc.encode_octets(2, &[0; 16]), Err(DtlvError::BufferOverflow));
    assert_eq!(enc.datalen(), before);
}

#[test]
fn test_list_roundtrip() {
    let mut buf = [0u8; 256];
    let mut enc = DtlvEnc::new(&mut buf);
    let l = enc.encode_list(0, 40, DtlvType::Integer).unwrap();
    for v in [10u8, 20, 30] {
        enc.encode_u8(40, v).unwrap();
    }
    enc.group_done(l).unwrap();
    let len = enc.datalen();

    let mut dec = DtlvDec::new(&buf[..len]);
    let json = dec.decode_to_json().unwrap();
    assert_eq!(json, r#"{"40":[10,20,30]}"#);
}
