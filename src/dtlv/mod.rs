// Nested TLV (Diameter-style) wire codec.
//
//      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//     |D D L|       AVP Length        |   NS-Id   |      AVP Code     |
//     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//     |                             Data                              |
//     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
// The 32-bit header travels big-endian; the declared length includes the
// header. Payloads are padded to the next 4-byte boundary with 0xFF.
// Groups (OBJECT) and lists nest; a list additionally pins its children to
// one (namespace, code, type) triple, validated against the open-group
// path stack on encode.

pub mod codes;

use crate::error::DtlvError;

pub type Result<T> = std::result::Result<T, DtlvError>;

/// Open-group stack depth limit.
pub const MAX_PATH_LENGTH: usize = 16;

/// AVP header size on the wire.
pub const AVP_HDR_BYTES: usize = 4;

const LENGTH_MASK: u16 = 0x1FFF;
const FLAG_LIST: u16 = 0x2000;
const NSID_SHIFT: u16 = 10;
const CODE_MASK: u16 = 0x03FF;

pub fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Payload bytes available for a declared AVP length.
pub fn data_length(avp_length: u16) -> usize {
    avp_length as usize - AVP_HDR_BYTES
}

/// Declared AVP length for a payload size.
pub fn full_length(data_len: usize) -> u16 {
    (data_len + AVP_HDR_BYTES) as u16
}

/// AVP data type tag (2 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DtlvType {
    #[default]
    Octets = 0,
    Object = 1,
    Integer = 2,
    Char = 3,
}

impl DtlvType {
    fn from_bits(v: u16) -> Self {
        match v & 0x3 {
            1 => DtlvType::Object,
            2 => DtlvType::Integer,
            3 => DtlvType::Char,
            _ => DtlvType::Octets,
        }
    }
}

/// Namespace + code pair, used in walk paths. Namespace 0 matches any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NsCode {
    pub ns: u8,
    pub code: u16,
}

impl NsCode {
    pub const fn new(ns: u8, code: u16) -> Self {
        Self { ns, code }
    }
}

/// Decoded AVP header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AvpHdr {
    pub datatype: DtlvType,
    pub is_list: bool,
    /// Declared length, header included.
    pub length: u16,
    pub ns: u8,
    pub code: u16,
}

impl AvpHdr {
    fn nscode(&self) -> u16 {
        ((self.ns as u16) << NSID_SHIFT) | self.code
    }

    fn encode_to(&self, buf: &mut [u8]) {
        let w1 = ((self.datatype as u16) << 14)
            | (if self.is_list { FLAG_LIST } else { 0 })
            | (self.length & LENGTH_MASK);
        let w2 = self.nscode();
        buf[0..2].copy_from_slice(&w1.to_be_bytes());
        buf[2..4].copy_from_slice(&w2.to_be_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        let w1 = u16::from_be_bytes(buf[0..2].try_into().unwrap());
        let w2 = u16::from_be_bytes(buf[2..4].try_into().unwrap());
        Self {
            datatype: DtlvType::from_bits(w1 >> 14),
            is_list: w1 & FLAG_LIST != 0,
            length: w1 & LENGTH_MASK,
            ns: (w2 >> NSID_SHIFT) as u8,
            code: w2 & CODE_MASK,
        }
    }

    fn is_container(&self) -> bool {
        self.is_list || self.datatype == DtlvType::Object
    }
}

/// Handle to an encoded AVP, for group fix-up and payload access.
#[derive(Debug, Clone, Copy)]
pub struct Avp {
    pub off: usize,
}

// -- encoder -----------------------------------------------------------------

/// Encoder over a caller-provided buffer.
pub struct DtlvEnc<'a> {
    buf: &'a mut [u8],
    datalen: usize,
    depth: usize,
    path: [AvpHdr; MAX_PATH_LENGTH],
}

impl<'a> DtlvEnc<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, datalen: 0, depth: 1, path: Default::default() }
    }

    /// Bytes written so far.
    pub fn datalen(&self) -> usize {
        self.datalen
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.datalen
    }

    /// Drop everything written and close all open groups.
    pub fn reset(&mut self) {
        self.datalen = 0;
        self.depth = 1;
        self.path = Default::default();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.datalen]
    }

    /// Reserve an AVP. The payload area is returned zeroed; pad bytes are
    /// written as 0xFF.
    pub fn avp_encode(
        &mut self,
        ns: u8,
        code: u16,
        datatype: DtlvType,
        data_len: usize,
        is_list: bool,
    ) -> Result<Avp> {
        let length = full_length(data_len);
        let aligned = align4(length as usize);
        if self.datalen + aligned > self.buf.len() {
            return Err(DtlvError::BufferOverflow);
        }

        let hdr = AvpHdr { datatype, is_list, length, ns, code };

        // A list constrains every child to its own (ns, code, type).
        if self.depth >= 2 {
            let parent = &self.path[self.depth - 2];
            if parent.is_list && (parent.nscode() != hdr.nscode() || parent.datatype != hdr.datatype) {
                return Err(DtlvError::PathError);
            }
        }

        if hdr.is_container() {
            if self.depth >= MAX_PATH_LENGTH - 1 {
                return Err(DtlvError::PathError);
            }
            self.path[self.depth - 1] = hdr;
            self.depth += 1;
        }

        let off = self.datalen;
        hdr.encode_to(&mut self.buf[off..]);
        self.buf[off + AVP_HDR_BYTES..off + length as usize].fill(0);
        if aligned > length as usize {
            self.buf[off + length as usize..off + aligned].fill(0xFF);
        }
        self.datalen += aligned;
        Ok(Avp { off })
    }

    /// Close a group/list and fix its length up to the current position.
    pub fn group_done(&mut self, avp: Avp) -> Result<()> {
        let mut hdr = AvpHdr::decode_from(&self.buf[avp.off..]);
        if self.depth < 2 {
            return Err(DtlvError::PathError);
        }
        if !hdr.is_container() {
            return Err(DtlvError::AvpNotGrouping);
        }

        let length = self.datalen - avp.off;
        if length < AVP_HDR_BYTES {
            return Err(DtlvError::AvpInvalidLen);
        }
        hdr.length = length as u16;

        self.depth -= 1;
        self.path[self.depth - 1] = AvpHdr::default();

        hdr.encode_to(&mut self.buf[avp.off..]);
        Ok(())
    }

    pub fn encode_group(&mut self, ns: u8, code: u16) -> Result<Avp> {
        self.avp_encode(ns, code, DtlvType::Object, 0, false)
    }

    pub fn encode_list(&mut self, ns: u8, code: u16, datatype: DtlvType) -> Result<Avp> {
        self.avp_encode(ns, code, datatype, 0, true)
    }

    pub fn encode_u8(&mut self, code: u16, v: u8) -> Result<()> {
        let avp = self.avp_encode(0, code, DtlvType::Integer, 1, false)?;
        self.buf[avp.off + AVP_HDR_BYTES] = v;
        Ok(())
    }

    pub fn encode_u16(&mut self, code: u16, v: u16) -> Result<()> {
        let avp = self.avp_encode(0, code, DtlvType::Integer, 2, false)?;
        self.buf[avp.off + AVP_HDR_BYTES..avp.off + AVP_HDR_BYTES + 2].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn encode_u32(&mut self, code: u16, v: u32) -> Result<()> {
        let avp = self.avp_encode(0, code, DtlvType::Integer, 4, false)?;
        self.buf[avp.off + AVP_HDR_BYTES..avp.off + AVP_HDR_BYTES + 4].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn encode_octets(&mut self, code: u16, data: &[u8]) -> Result<()> {
        let avp = self.avp_encode(0, code, DtlvType::Octets, data.len(), false)?;
        self.buf[avp.off + AVP_HDR_BYTES..avp.off + AVP_HDR_BYTES + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// NUL-terminated character payload.
    pub fn encode_char(&mut self, code: u16, s: &str) -> Result<()> {
        let b = s.as_bytes();
        let avp = self.avp_encode(0, code, DtlvType::Char, b.len() + 1, false)?;
        self.buf[avp.off + AVP_HDR_BYTES..avp.off + AVP_HDR_BYTES + b.len()].copy_from_slice(b);
        self.buf[avp.off + AVP_HDR_BYTES + b.len()] = 0;
        Ok(())
    }

    /// Truncating character payload.
    pub fn encode_nchar(&mut self, code: u16, maxlen: usize, s: &str) -> Result<()> {
        let b = &s.as_bytes()[..s.len().min(maxlen)];
        let avp = self.avp_encode(0, code, DtlvType::Char, b.len() + 1, false)?;
        self.buf[avp.off + AVP_HDR_BYTES..avp.off + AVP_HDR_BYTES + b.len()].copy_from_slice(b);
        self.buf[avp.off + AVP_HDR_BYTES + b.len()] = 0;
        Ok(())
    }

    /// Object AVP carrying an opaque payload image.
    pub fn encode_object_bytes(&mut self, ns: u8, code: u16, data: &[u8]) -> Result<()> {
        let avp = self.avp_encode(ns, code, DtlvType::Object, data.len(), false)?;
        self.buf[avp.off + AVP_HDR_BYTES..avp.off + AVP_HDR_BYTES + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Splice raw pre-encoded AVP bytes.
    pub fn raw_encode(&mut self, data: &[u8]) -> Result<()> {
        if self.datalen + data.len() > self.buf.len() {
            return Err(DtlvError::BufferOverflow);
        }
        self.buf[self.datalen..self.datalen + data.len()].copy_from_slice(data);
        self.datalen += data.len();
        Ok(())
    }
}

// -- decoder -----------------------------------------------------------------

/// Decoded AVP: its header plus the offset of the encoded record.
#[derive(Debug, Clone, Copy)]
pub struct DAvp {
    pub hdr: AvpHdr,
    pub off: usize,
}

/// Walk verdict for `decode_forall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForallAvp {
    Continue,
    /// Do not recurse into this container.
    StepOver,
    /// Stop the whole traversal.
    Break,
}

/// Context passed to walk callbacks.
#[derive(Debug, Clone, Copy)]
pub struct WalkFrame {
    pub depth: usize,
    pub parent: Option<AvpHdr>,
}

enum WalkOutcome {
    Done,
    Stop,
}

/// Decoder view over a byte buffer.
pub struct DtlvDec<'a> {
    buf: &'a [u8],
    datalen: usize,
    position: usize,
    depth: usize,
    path: [AvpHdr; MAX_PATH_LENGTH],
}

impl<'a> DtlvDec<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        let datalen = buf.len();
        Self { buf, datalen, position: 0, depth: 1, path: Default::default() }
    }

    pub fn reset(&mut self) {
        self.position = 0;
        self.depth = 1;
        self.path = Default::default();
        self.datalen = self.buf.len();
    }

    /// Decode the next AVP at the current position.
    pub fn decode(&mut self) -> Result<DAvp> {
        if self.position == self.datalen {
            return Err(DtlvError::EndOfData);
        }
        if self.position + AVP_HDR_BYTES > self.datalen {
            return Err(DtlvError::AvpOutOfBounds);
        }

        let off = self.position;
        let hdr = AvpHdr::decode_from(&self.buf[off..]);
        if (hdr.length as usize) < AVP_HDR_BYTES {
            return Err(DtlvError::AvpInvalidLen);
        }
        if off + hdr.length as usize > self.datalen {
            return Err(DtlvError::AvpOutOfBounds);
        }

        self.position += align4(hdr.length as usize);
        Ok(DAvp { hdr, off })
    }

    /// Payload bytes of a decoded AVP.
    pub fn data(&self, avp: &DAvp) -> &'a [u8] {
        &self.buf[avp.off + AVP_HDR_BYTES..avp.off + avp.hdr.length as usize]
    }

    pub fn get_u8(&self, avp: &DAvp) -> Result<u8> {
        if avp.hdr.length != full_length(1) {
            return Err(DtlvError::AvpInvalidLen);
        }
        Ok(self.data(avp)[0])
    }

    pub fn get_u16(&self, avp: &DAvp) -> Result<u16> {
        if avp.hdr.length != full_length(2) {
            return Err(DtlvError::AvpInvalidLen);
        }
        Ok(u16::from_be_bytes(self.data(avp).try_into().unwrap()))
    }

    pub fn get_u32(&self, avp: &DAvp) -> Result<u32> {
        if avp.hdr.length != full_length(4) {
            return Err(DtlvError::AvpInvalidLen);
        }
        Ok(u32::from_be_bytes(self.data(avp).try_into().unwrap()))
    }

    /// Integer of 1, 2 or 4 payload bytes.
    pub fn get_uint(&self, avp: &DAvp) -> Result<u32> {
        let d = self.data(avp);
        match d.len() {
            1 => Ok(d[0] as u32),
            2 => Ok(u16::from_be_bytes(d.try_into().unwrap()) as u32),
            4 => Ok(u32::from_be_bytes(d.try_into().unwrap())),
            _ => Err(DtlvError::AvpInvalidLen),
        }
    }

    /// Character payload up to its NUL terminator.
    pub fn get_char(&self, avp: &DAvp) -> Result<&'a str> {
        if avp.hdr.datatype != DtlvType::Char {
            return Err(DtlvError::AvpInvType);
        }
        let d = self.data(avp);
        let end = d.iter().position(|&b| b == 0).unwrap_or(d.len());
        std::str::from_utf8(&d[..end]).map_err(|_| DtlvError::AvpInvType)
    }

    /// Pre-order walk, filtered by a (ns, code) path prefix. The callback
    /// sees each matching AVP once on entry and, for containers, once more
    /// with `group_exit = true` after its children.
    pub fn decode_forall<F>(&mut self, path: &[NsCode], f: &mut F) -> Result<()>
    where
        F: FnMut(&DAvp, &[u8], &WalkFrame, bool) -> Result<ForallAvp>,
    {
        self.forall_inner(path, f).map(|_| ())
    }

    fn forall_inner<F>(&mut self, path: &[NsCode], f: &mut F) -> Result<WalkOutcome>
    where
        F: FnMut(&DAvp, &[u8], &WalkFrame, bool) -> Result<ForallAvp>,
    {
        let (head, tail) = match path.split_first() {
            Some((h, t)) => (Some(*h), t),
            None => (None, &[] as &[NsCode]),
        };

        loop {
            let davp = match self.decode() {
                Ok(d) => d,
                Err(DtlvError::EndOfData) => return Ok(WalkOutcome::Done),
                Err(e) => return Err(e),
            };

            if let Some(h) = head {
                let exact = h.ns == davp.hdr.ns && h.code == davp.hdr.code;
                let wild = h.ns == 0 && h.code == davp.hdr.code;
                if !exact && !wild {
                    continue;
                }
            }

            let frame = WalkFrame {
                depth: self.depth,
                parent: if self.depth >= 2 { Some(self.path[self.depth - 2]) } else { None },
            };

            let mut verdict = ForallAvp::Continue;
            let at_leaf_of_path = tail.is_empty();
            if at_leaf_of_path {
                let payload = &self.buf[davp.off + AVP_HDR_BYTES..davp.off + davp.hdr.length as usize];
                verdict = match f(&davp, payload, &frame, false)? {
                    ForallAvp::Break => return Ok(WalkOutcome::Stop),
                    v => v,
                };
            }

            if davp.hdr.is_container()
                && verdict != ForallAvp::StepOver
                && davp.hdr.length as usize > AVP_HDR_BYTES
            {
                let saved_datalen = self.datalen;
                let saved_pos = self.position;

                self.path[self.depth - 1] = davp.hdr;
                self.depth += 1;
                self.position = davp.off + AVP_HDR_BYTES;
                self.datalen = davp.off + davp.hdr.length as usize;

                let child_path = if at_leaf_of_path { &[] as &[NsCode] } else { tail };
                let sub = self.forall_inner(child_path, f)?;

                self.depth -= 1;
                self.path[self.depth - 1] = AvpHdr::default();
                self.datalen = saved_datalen;
                self.position = saved_pos;

                if matches!(sub, WalkOutcome::Stop) {
                    return Ok(WalkOutcome::Stop);
                }

                if at_leaf_of_path {
                    let frame = WalkFrame {
                        depth: self.depth,
                        parent: if self.depth >= 2 { Some(self.path[self.depth - 2]) } else { None },
                    };
                    let payload = &self.buf[davp.off + AVP_HDR_BYTES..davp.off + davp.hdr.length as usize];
                    match f(&davp, payload, &frame, true)? {
                        ForallAvp::Break => return Ok(WalkOutcome::Stop),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Collect the AVPs matching a path, up to `limit` (0 = no limit).
    pub fn decode_bypath(&mut self, path: &[NsCode], limit: usize) -> Result<(Vec<DAvp>, usize)> {
        let mut found = Vec::new();
        let mut total = 0usize;
        self.decode_forall(path, &mut |avp, _, _, group_exit| {
            if group_exit {
                return Ok(ForallAvp::Continue);
            }
            total += 1;
            if limit == 0 || found.len() < limit {
                found.push(*avp);
            }
            if limit != 0 && total == limit {
                return Ok(ForallAvp::Break);
            }
            Ok(ForallAvp::StepOver)
        })?;
        Ok((found, total))
    }

    /// Sub-decoder over one container AVP's payload.
    pub fn nested(&self, avp: &DAvp) -> DtlvDec<'a> {
        DtlvDec::new(self.data(avp))
    }

    /// Render the buffer as a JSON fragment: keys are `"ns.code"` (or just
    /// `"code"` in the common namespace), integers decimal, chars quoted,
    /// octets lowercase hex.
    pub fn decode_to_json(&mut self) -> Result<String> {
        let mut out = String::from("{");
        let mut separate = false;
        self.decode_forall(&[], &mut |avp, payload, frame, group_exit| {
            if group_exit {
                out.push(if avp.hdr.is_list { ']' } else { '}' });
                separate = true;
                return Ok(ForallAvp::Continue);
            }
            if separate {
                out.push(',');
            } else {
                separate = true;
            }

            let parent_is_list = frame.parent.map(|p| p.is_list).unwrap_or(false);
            if !parent_is_list {
                if avp.hdr.ns != 0 {
                    out.push_str(&format!("\"{}.{}\":", avp.hdr.ns, avp.hdr.code));
                } else {
                    out.push_str(&format!("\"{}\":", avp.hdr.code));
                }
            }

            if avp.hdr.is_container() {
                out.push(if avp.hdr.is_list { '[' } else { '{' });
                if payload.is_empty() {
                    out.push(if avp.hdr.is_list { ']' } else { '}' });
                } else {
                    separate = false;
                }
            } else if !payload.is_empty() {
                match avp.hdr.datatype {
                    DtlvType::Integer => {
                        let v = match payload.len() {
                            1 => payload[0] as u32,
                            2 => u16::from_be_bytes(payload.try_into().unwrap()) as u32,
                            4 => u32::from_be_bytes(payload.try_into().unwrap()),
                            _ => return Err(DtlvError::AvpInvalidLen),
                        };
                        out.push_str(&v.to_string());
                    }
                    DtlvType::Char => {
                        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                        out.push('"');
                        out.push_str(&String::from_utf8_lossy(&payload[..end]));
                        out.push('"');
                    }
                    DtlvType::Octets => {
                        out.push('"');
                        out.push_str(&hex::encode(payload));
                        out.push('"');
                    }
                    DtlvType::Object => out.push_str("null"),
                }
            } else {
                out.push_str("null");
            }
            Ok(ForallAvp::Continue)
        })?;
        out.push('}');
        Ok(out)
    }
}
