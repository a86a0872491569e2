// Statement parser and bytecode emitter.
//
// Two-structure shunting-yard: a stack of open operator frames plus one
// pending operand. Lower-precedence frames serialize to bytecode as
// operators arrive; a serialized frame collapses into a local-pointer
// operand referencing its record. Control operators emit their condition
// header eagerly and patch the jump target when the frame closes; ELSE
// re-reads the preceding conditional's condition cell and inverts it at
// evaluation.
//
// Emission-time rewrites: an argument list directly under a call folds
// into the call's own argument area, a pure parenthesised expression and
// a bare block vanish entirely.

use super::bc::{self, BcArgKind, BcOper, BC_BUFFER_MAX};
use super::globals::{GlobalKind, GlobalTable, GLOBAL_BASE};
use super::ops::{desc, parse_optype, Op, OperandPos, OPER_ARG_COUNT_MAX};
use crate::error::ShError;
use crate::idxhash;

const VARIDX_BUFFER_SIZE: usize = 1024;

type PResult<T> = std::result::Result<T, ShError>;

/// Parsed operand.
#[derive(Debug, Clone)]
enum PArg {
    Int(u32),
    /// Literal text, NUL-terminated.
    Char(Vec<u8>),
    /// Identifier, resolved against the statement's variable map.
    Token(Vec<u8>),
    /// Function name, interned globally.
    Func(Vec<u8>),
    /// Bytecode offset of a producing operator record.
    Pointer(u16),
}

struct Frame {
    op: Op,
    term: u8,
    left: Option<PArg>,
    args: Vec<PArg>,
}

impl Frame {
    fn operand_count(&self, pending: bool) -> usize {
        self.left.is_some() as usize + self.args.len() + pending as usize
    }
}

pub struct Parser<'g> {
    src: Vec<u8>,
    pos: usize,
    bc: Vec<u8>,
    varmap: Vec<u8>,
    globals: &'g mut GlobalTable,
    pub errmsg: String,
}

impl<'g> Parser<'g> {
    pub fn new(src: &str, globals: &'g mut GlobalTable) -> Self {
        let mut varmap = vec![0u8; VARIDX_BUFFER_SIZE];
        idxhash::init(&mut varmap, 16, 0, 2).expect("varmap buffer");
        Self { src: src.as_bytes().to_vec(), pos: 0, bc: Vec::new(), varmap, globals, errmsg: String::new() }
    }

    fn fail<T>(&mut self, err: ShError, msg: String) -> PResult<T> {
        self.errmsg = format!("{msg} at {}", self.pos);
        Err(err)
    }

    fn skip_space(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    // -- bytecode emission ---------------------------------------------------

    fn bc_alloc(&mut self, bytes: usize) -> PResult<usize> {
        if self.bc.len() + bytes > BC_BUFFER_MAX {
            return self.fail(ShError::ParseOutOfBuffer, format!("out of bytecode buffer, requested {bytes}"));
        }
        let off = self.bc.len();
        self.bc.resize(off + bytes, 0);
        Ok(off)
    }

    fn emit_header(&mut self, op: Op, arg_count: u8) -> PResult<(usize, u8)> {
        let d = desc(op);
        let mut len = 4;
        let bitpos = if d.result {
            len += 4;
            1
        } else {
            0
        };
        let off = self.bc_alloc(len)?;
        bc::write_oper(&mut self.bc, off, BcOper { op, arg_count, bitmask: 0 });
        Ok((off, bitpos))
    }

    fn set_mask(&mut self, oper_off: usize, mask: u16) {
        let mut h = bc::read_oper(&self.bc, oper_off);
        h.bitmask = mask;
        bc::write_oper(&mut self.bc, oper_off, h);
    }

    fn emit_arg(&mut self, oper_off: usize, bitpos: &mut u8, arg: &PArg) -> PResult<()> {
        let mut mask = bc::read_oper(&self.bc, oper_off).bitmask;
        match arg {
            PArg::Int(v) => {
                let cell = self.bc_alloc(4)?;
                bc::set_cell(&mut self.bc, cell, *v);
                bc::push_arg_kind(&mut mask, bitpos, BcArgKind::Int);
            }
            PArg::Char(data) => {
                let cell = self.bc_alloc(4)?;
                bc::set_cell(&mut self.bc, cell, data.len() as u32);
                let doff = self.bc_alloc(bc::align4(data.len()))?;
                self.bc[doff..doff + data.len()].copy_from_slice(data);
                bc::push_arg_kind(&mut mask, bitpos, BcArgKind::Char);
            }
            PArg::Token(name) => {
                let target = match idxhash::search(&self.varmap, name) {
                    Ok(voff) => {
                        u16::from_le_bytes(self.varmap[voff as usize..voff as usize + 2].try_into().unwrap())
                    }
                    Err(_) => {
                        let n = String::from_utf8_lossy(name).into_owned();
                        return self.fail(ShError::VariableUndefined, format!("unknown variable \"{n}\""));
                    }
                };
                let cell = self.bc_alloc(4)?;
                bc::set_cell(&mut self.bc, cell, target as u32);
                bc::push_arg_kind(&mut mask, bitpos, BcArgKind::Ptr);
            }
            PArg::Func(name) => {
                let goff = self.globals.add(name, GlobalKind::Func)?;
                let cell = self.bc_alloc(4)?;
                bc::set_cell(&mut self.bc, cell, GLOBAL_BASE + goff);
                bc::push_arg_kind(&mut mask, bitpos, BcArgKind::Ptr);
            }
            PArg::Pointer(off) => {
                let cell = self.bc_alloc(4)?;
                bc::set_cell(&mut self.bc, cell, *off as u32);
                bc::push_arg_kind(&mut mask, bitpos, BcArgKind::Ptr);
            }
        }
        self.set_mask(oper_off, mask);
        Ok(())
    }

    // Emit a control operator's condition header: [cond][jump placeholder].
    fn emit_ctl(&mut self, op: Op, cond: PArg) -> PResult<usize> {
        let (off, mut bitpos) = self.emit_header(op, 2)?;

        let cond = if op == Op::Else {
            // Re-point at the preceding conditional's condition cell.
            let PArg::Pointer(if_off) = cond else {
                return self.fail(ShError::Internal, "else without conditional".to_string());
            };
            let v = bc::get_cell(&self.bc, if_off as usize + 4);
            PArg::Pointer(v as u16)
        } else {
            cond
        };
        self.emit_arg(off, &mut bitpos, &cond)?;

        // Jump target cell, patched when the frame closes.
        let mut mask = bc::read_oper(&self.bc, off).bitmask;
        bc::push_arg_kind(&mut mask, &mut bitpos, BcArgKind::Ptr);
        self.set_mask(off, mask);
        let cell = self.bc_alloc(4)?;
        bc::set_cell(&mut self.bc, cell, 0);
        Ok(off)
    }

    fn emit_var(&mut self, frame: &Frame) -> PResult<usize> {
        let (off, _bitpos) = self.emit_header(frame.op, 1)?;

        let Some(PArg::Token(name)) = frame.args.first() else {
            return self.fail(ShError::ParseTokenInvalid, "variable name expected".to_string());
        };
        let name = name.clone();

        match idxhash::add(&mut self.varmap, &name, 0) {
            Ok(voff) => {
                self.varmap[voff as usize..voff as usize + 2].copy_from_slice(&(off as u16).to_le_bytes());
            }
            Err(crate::error::IdxError::EntryExists) => {
                let n = String::from_utf8_lossy(&name).into_owned();
                return self.fail(ShError::VariableExists, format!("duplicate variable \"{n}\""));
            }
            Err(_) => return self.fail(ShError::Internal, "variable map".to_string()),
        }

        let cell = self.bc_alloc(4)?;
        if frame.op == Op::GVar {
            let goff = self.globals.add(&name, GlobalKind::Int)?;
            bc::set_cell(&mut self.bc, cell, GLOBAL_BASE + goff);
            self.set_mask(off, 0x3);
        } else {
            bc::set_cell(&mut self.bc, cell, 0);
        }
        Ok(off)
    }

    fn emit_foper(&mut self, frame: &Frame) -> PResult<usize> {
        let count = frame.operand_count(false) as u8;
        let (off, mut bitpos) = self.emit_header(frame.op, count)?;
        if let Some(left) = frame.left.clone() {
            self.emit_arg(off, &mut bitpos, &left)?;
        }
        for arg in frame.args.clone() {
            self.emit_arg(off, &mut bitpos, &arg)?;
        }
        Ok(off)
    }

    // -- frame management ----------------------------------------------------

    fn close_top(&mut self, stack: &mut Vec<Frame>, pending: &mut Option<PArg>) -> PResult<()> {
        let mut frame = stack.pop().expect("frame to close");
        if let Some(arg) = pending.take() {
            frame.args.push(arg);
        }

        // Argument list under a call folds into the call frame.
        if frame.op == Op::ArgList {
            if let Some(parent) = stack.last_mut() {
                if parent.op == Op::Func {
                    if let Some(left) = frame.left.take() {
                        parent.args.push(left);
                    }
                    parent.args.append(&mut frame.args);
                    return Ok(());
                }
            }
        }

        // A pure parenthesised expression is its inner operand.
        if frame.op == Op::Func && frame.left.is_none() && frame.operand_count(false) == 1 {
            *pending = frame.args.pop();
            return Ok(());
        }

        // A bare block leaves only its statements behind.
        if frame.op == Op::Block {
            *pending = frame.args.pop().or(Some(PArg::Int(0)));
            return Ok(());
        }

        let off = if desc(frame.op).control {
            // Patch the jump target past the body.
            let Some(PArg::Pointer(hdr)) = frame.left else {
                return self.fail(ShError::ParseOperandMissing, "left operand missing".to_string());
            };
            let end = self.bc.len() as u32;
            bc::set_cell(&mut self.bc, hdr as usize + 8, end);
            hdr as usize
        } else if matches!(frame.op, Op::Var | Op::GVar) {
            self.emit_var(&frame)?
        } else {
            self.emit_foper(&frame)?
        };

        *pending = Some(PArg::Pointer(off as u16));
        Ok(())
    }

    fn handle_oper(&mut self, op: Op, stack: &mut Vec<Frame>, pending: &mut Option<PArg>) -> PResult<()> {
        let d = desc(op);

        loop {
            let Some(top) = stack.last() else { break };
            let d2 = desc(top.op);

            if !d2.term.is_empty() || (d2.control && !d.control) {
                break; // explicit terminator or control boundary
            }
            if top.op != op || !d.concat {
                if d2.precedence > d.precedence {
                    break;
                }
                self.close_top(stack, pending)?;
                continue;
            }
            if top.operand_count(pending.is_some()) < OPER_ARG_COUNT_MAX as usize {
                // Same concat-capable operator folds in place.
                if let Some(arg) = pending.take() {
                    stack.last_mut().expect("top frame").args.push(arg);
                }
                return Ok(());
            }
            self.close_top(stack, pending)?;
        }

        if pending.is_none() {
            if d.opd_left == OperandPos::Mand {
                return self.fail(ShError::ParseOperandMissing, format!("left operand missing for \"{}\"", d.token));
            }
        } else if d.opd_left == OperandPos::None {
            return self.fail(ShError::ParseOperandUnexpected, format!("unexpected left operand for \"{}\"", d.token));
        }

        let mut left = pending.take();
        if d.control {
            if let Some(cond) = left.take() {
                let hdr = self.emit_ctl(op, cond)?;
                left = Some(PArg::Pointer(hdr as u16));
            }
        }
        if op == Op::Func {
            if let Some(PArg::Token(name)) = left {
                left = Some(PArg::Func(name));
            }
        }

        stack.push(Frame {
            op,
            term: d.term.as_bytes().first().copied().unwrap_or(0),
            left,
            args: Vec::new(),
        });
        Ok(())
    }

    // -- operand scanning ----------------------------------------------------

    fn parse_arg(&mut self) -> PResult<PArg> {
        let b = self.src[self.pos];
        if b.is_ascii_digit() {
            let start = self.pos;
            let mut v: u64 = 0;
            while self.pos < self.src.len() && self.src[self.pos].is_ascii_digit() {
                v = v * 10 + (self.src[self.pos] - b'0') as u64;
                if v > u32::MAX as u64 {
                    return self.fail(ShError::ParseNumInvalid, format!("invalid number at {start}"));
                }
                self.pos += 1;
            }
            return Ok(PArg::Int(v as u32));
        }

        if b == b'"' || b == b'\'' {
            let quote = b;
            self.pos += 1;
            let mut data = Vec::new();
            loop {
                if self.pos >= self.src.len() {
                    return self.fail(ShError::ParseStrInvalid, "unterminated string".to_string());
                }
                let c = self.src[self.pos];
                self.pos += 1;
                if c == quote {
                    break;
                }
                if c == b'\\' {
                    if self.pos >= self.src.len() {
                        return self.fail(ShError::ParseStrInvalid, "invalid escape".to_string());
                    }
                    let e = self.src[self.pos];
                    self.pos += 1;
                    data.push(match e {
                        b'r' => b'\r',
                        b't' => b'\t',
                        b'n' => b'\n',
                        b'\\' => b'\\',
                        b'"' => b'"',
                        b'\'' => b'\'',
                        _ => return self.fail(ShError::ParseStrInvalid, "invalid escape".to_string()),
                    });
                } else {
                    data.push(c);
                }
            }
            data.push(0);
            return Ok(PArg::Char(data));
        }

        if b.is_ascii_alphabetic() || b == b'_' {
            let start = self.pos;
            while self.pos < self.src.len()
                && (self.src[self.pos].is_ascii_alphanumeric() || self.src[self.pos] == b'_')
            {
                self.pos += 1;
            }
            return Ok(PArg::Token(self.src[start..self.pos].to_vec()));
        }

        self.fail(ShError::ParseTokenInvalid, format!("invalid token '{}'", b as char))
    }

    // -- driver --------------------------------------------------------------

    /// Parse the source into a fresh bytecode image.
    pub fn run(mut self) -> std::result::Result<Vec<u8>, (ShError, String)> {
        let mut stack: Vec<Frame> = Vec::new();
        let mut pending: Option<PArg> = None;

        let res = (|| -> PResult<()> {
            self.skip_space();
            while self.pos < self.src.len() {
                self.skip_space();
                if self.pos >= self.src.len() {
                    break;
                }

                // Closing terminator of the innermost bracketed frame.
                if let Some(term_idx) = stack.iter().rposition(|f| f.term != 0) {
                    if self.src[self.pos] == stack[term_idx].term {
                        self.pos += 1;
                        while stack.len() > term_idx {
                            self.close_top(&mut stack, &mut pending)?;
                        }
                        continue;
                    }
                }

                if self.src[self.pos] == b';' {
                    self.pos += 1;
                    while stack.last().map(|f| f.op != Op::Block).unwrap_or(false) {
                        self.close_top(&mut stack, &mut pending)?;
                    }
                    pending = None;
                    continue;
                }

                let start = self.pos;
                let op = parse_optype(&self.src, &mut self.pos);
                if op != Op::None {
                    self.handle_oper(op, &mut stack, &mut pending)?;
                    continue;
                }

                pending = Some(self.parse_arg()?);
                self.skip_space();
                if self.pos == start {
                    return self.fail(ShError::ParseTokenInvalid, "no progress".to_string());
                }
            }

            while !stack.is_empty() {
                self.close_top(&mut stack, &mut pending)?;
            }
            Ok(())
        })();

        match res {
            Ok(()) => Ok(self.bc),
            Err(e) => Err((e, self.errmsg)),
        }
    }
}

/// Parse a statement text against a global table.
pub fn parse_text(src: &str, globals: &mut GlobalTable) -> std::result::Result<Vec<u8>, (ShError, String)> {
    Parser::new(src, globals).run()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops_of(bc: &[u8]) -> Vec<Op> {
        let mut ops = Vec::new();
        let mut off = 0usize;
        while off < bc.len() {
            let h = bc::read_oper(bc, off);
            ops.push(h.op);
            off += 4;
            let mut mask = h.bitmask;
            let count = h.arg_count + desc(h.op).result as u8;
            for _ in 0..count {
                let kind = bc::pop_arg_kind(&mut mask);
                let cell = bc::get_cell(bc, off);
                off += 4;
                if kind == BcArgKind::Char {
                    off += bc::align4(cell as usize);
                }
            }
        }
        ops
    }

    #[test]
    fn test_assignment_with_precedence() {
        let mut gt = GlobalTable::new();
        let bc = parse_text("# x := 3 + 4 * 2; print(x);", &mut gt).unwrap();
        // Operands emit before their consumers.
        assert_eq!(
            ops_of(&bc),
            vec![Op::Var, Op::Multiply, Op::Plus, Op::Assign, Op::Func]
        );
    }

    #[test]
    fn test_concat_folds_same_operator() {
        let mut gt = GlobalTable::new();
        let bc = parse_text("# x := 1 + 2 + 3 + 4;", &mut gt).unwrap();
        let ops = ops_of(&bc);
        // One PLUS record for the whole chain.
        assert_eq!(ops.iter().filter(|&&o| o == Op::Plus).count(), 1);
        let plus_off = {
            let mut off = 0;
            loop {
                let h = bc::read_oper(&bc, off);
                if h.op == Op::Plus {
                    break off;
                }
                off += 8; // VAR record is header + one cell
            }
        };
        assert_eq!(bc::read_oper(&bc, plus_off).arg_count, 4);
    }

    #[test]
    fn test_undeclared_variable_rejected() {
        let mut gt = GlobalTable::new();
        let err = parse_text("# x := y;", &mut gt).unwrap_err();
        assert_eq!(err.0, ShError::VariableUndefined);
    }

    #[test]
    fn test_duplicate_variable_rejected() {
        let mut gt = GlobalTable::new();
        let err = parse_text("# x; # x;", &mut gt).unwrap_err();
        assert_eq!(err.0, ShError::VariableExists);
    }

    #[test]
    fn test_operand_position_errors() {
        let mut gt = GlobalTable::new();
        assert_eq!(parse_text("* 3;", &mut gt).unwrap_err().0, ShError::ParseOperandMissing);
        assert_eq!(parse_text("3 ! 4;", &mut gt).unwrap_err().0, ShError::ParseOperandUnexpected);
    }

    #[test]
    fn test_string_escapes() {
        let mut gt = GlobalTable::new();
        let bc = parse_text(r#"print("a\tb\n");"#, &mut gt).unwrap();
        assert!(ops_of(&bc).contains(&Op::Func));
        let needle = b"a\tb\n\0";
        assert!(bc.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_global_var_declaration() {
        let mut gt = GlobalTable::new();
        let bc = parse_text("## shared; shared := 5;", &mut gt).unwrap();
        assert_eq!(ops_of(&bc), vec![Op::GVar, Op::Assign]);
        assert!(gt.lookup(b"shared").is_some());
    }

    #[test]
    fn test_parenthesised_expression_elided() {
        let mut gt = GlobalTable::new();
        let bc = parse_text("# x := (3);", &mut gt).unwrap();
        // No FUNC record: the parens collapse into the inner operand.
        assert_eq!(ops_of(&bc), vec![Op::Var, Op::Assign]);
    }

    #[test]
    fn test_if_else_jump_targets() {
        let mut gt = GlobalTable::new();
        let bc = parse_text("# x; x = 1 ?? { x := 2; } : { x := 3; };", &mut gt).unwrap();
        let ops = ops_of(&bc);
        assert!(ops.contains(&Op::IfRet));
        assert!(ops.contains(&Op::Else));
        // The IFRET jump cell points at the ELSE header.
        let mut off = 0;
        let mut ifret_off = None;
        let mut else_off = None;
        while off < bc.len() {
            let h = bc::read_oper(&bc, off);
            if h.op == Op::IfRet {
                ifret_off = Some(off);
            }
            if h.op == Op::Else {
                else_off = Some(off);
            }
            off += 4;
            let mut mask = h.bitmask;
            for _ in 0..h.arg_count + desc(h.op).result as u8 {
                let kind = bc::pop_arg_kind(&mut mask);
                let cell = bc::get_cell(&bc, off);
                off += 4;
                if kind == BcArgKind::Char {
                    off += bc::align4(cell as usize);
                }
            }
        }
        let jump = bc::get_cell(&bc, ifret_off.unwrap() + 8);
        assert_eq!(jump as usize, else_off.unwrap());
    }
}
