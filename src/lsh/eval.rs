// Bytecode evaluator.
//
// Linear walk over one statement's bytecode. Operand cells resolve
// through the argument mask: immediates read in place, inline strings
// advance past their padding, pointer cells resolve to either the result
// cell of an earlier operator in the same buffer or a global table slot.
// Result cells are written back into the buffer, so locals keep their
// value for later operators of the same run.

use tracing::info;

use super::bc::{self, BcArgKind};
use super::globals::{GlobalKind, GlobalTable, GLOBAL_BASE};
use super::ops::{desc, Op};
use crate::error::ShError;
use crate::platform::Clock;

pub type Result<T> = std::result::Result<T, ShError>;

/// Resolved operand value handed to registered functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShArgVal {
    Int(u32),
    Str(Vec<u8>),
}

/// Ambient context for built-in and service functions.
pub struct FuncCtx<'a> {
    pub clock: &'a dyn Clock,
}

pub type ShFunc = Box<dyn FnMut(&mut FuncCtx, &[ShArgVal]) -> Result<u32> + Send>;

/// Registered function entry.
pub struct FuncEntry {
    pub service_id: u16,
    pub name: String,
    pub func: ShFunc,
}

// Where an operand's value lives.
#[derive(Debug, Clone, Copy)]
enum Loc {
    Bc(usize),
    Global(u32),
    Str { off: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValKind {
    Int,
    Char,
    Func,
}

fn get_val(bc_buf: &[u8], globals: &GlobalTable, loc: Loc) -> u32 {
    match loc {
        Loc::Bc(off) => bc::get_cell(bc_buf, off),
        Loc::Global(goff) => globals.value(goff),
        Loc::Str { .. } => 0,
    }
}

fn set_val(bc_buf: &mut [u8], globals: &mut GlobalTable, loc: Loc, v: u32) {
    match loc {
        Loc::Bc(off) => bc::set_cell(bc_buf, off, v),
        Loc::Global(goff) => globals.set_value(goff, v),
        Loc::Str { .. } => {}
    }
}

// Pop one operand off the instruction stream.
fn popvar(
    bc_buf: &[u8],
    globals: &mut GlobalTable,
    funcs: &[FuncEntry],
    pc: &mut usize,
    mask: &mut u16,
) -> Result<(Loc, ValKind)> {
    let cell_off = *pc;
    *pc += 4;
    if *pc > bc_buf.len() {
        return Err(ShError::Internal);
    }

    match bc::pop_arg_kind(mask) {
        BcArgKind::Int => Ok((Loc::Bc(cell_off), ValKind::Int)),
        BcArgKind::Char => {
            let len = bc::get_cell(bc_buf, cell_off) as usize;
            let data_off = *pc;
            *pc += bc::align4(len);
            if *pc > bc_buf.len() {
                return Err(ShError::Internal);
            }
            Ok((Loc::Str { off: data_off, len }, ValKind::Char))
        }
        BcArgKind::Ptr => {
            let v = bc::get_cell(bc_buf, cell_off);
            if v >= GLOBAL_BASE {
                let goff = v - GLOBAL_BASE;
                let kind = match globals.kind(goff) {
                    GlobalKind::Func => {
                        if globals.value(goff) == 0 {
                            // Resolve lazily by name and cache the index.
                            let name = globals.name_of(goff).to_vec();
                            let idx = funcs
                                .iter()
                                .position(|f| f.name.as_bytes() == &name[..])
                                .ok_or(ShError::FuncNotExists)?;
                            globals.set_value(goff, idx as u32 + 1);
                        }
                        ValKind::Func
                    }
                    _ => ValKind::Int,
                };
                Ok((Loc::Global(goff), kind))
            } else {
                // Local pointer into the same bytecode buffer.
                let target = v as usize;
                if target + 8 > bc_buf.len() {
                    return Err(ShError::Internal);
                }
                let op = Op::from_u8(bc_buf[target]);
                let d = desc(op);
                if d.result || op == Op::Var || d.control {
                    Ok((Loc::Bc(target + 4), ValKind::Int))
                } else if op == Op::GVar {
                    let handle = bc::get_cell(bc_buf, target + 4);
                    if handle < GLOBAL_BASE {
                        return Err(ShError::Internal);
                    }
                    Ok((Loc::Global(handle - GLOBAL_BASE), ValKind::Int))
                } else {
                    Err(ShError::Internal)
                }
            }
        }
    }
}

/// Evaluate one statement's bytecode in place.
pub fn eval(
    bc_buf: &mut [u8],
    globals: &mut GlobalTable,
    funcs: &mut [FuncEntry],
    clock: &dyn Clock,
) -> Result<()> {
    let mut pc = 0usize;
    let end = bc_buf.len();

    while pc < end {
        if pc + 4 > end {
            return Err(ShError::Internal);
        }
        let hdr = bc::read_oper(bc_buf, pc);
        let d = desc(hdr.op);
        pc += 4;
        let mut mask = hdr.bitmask;

        match hdr.op {
            Op::Var | Op::GVar | Op::ArgList => {
                // Declarations and stray argument lists only advance.
                let count = hdr.arg_count + d.result as u8;
                for _ in 0..count {
                    popvar(bc_buf, globals, funcs, &mut pc, &mut mask)?;
                }
            }

            Op::Assign => {
                if hdr.arg_count != 2 {
                    return Err(ShError::Internal);
                }
                let (res, _) = popvar(bc_buf, globals, funcs, &mut pc, &mut mask)?;
                let (src, _) = popvar(bc_buf, globals, funcs, &mut pc, &mut mask)?;
                let v = get_val(bc_buf, globals, src);
                set_val(bc_buf, globals, res, v);
            }

            Op::Func => {
                let (res, _) = popvar(bc_buf, globals, funcs, &mut pc, &mut mask)?;
                let (floc, fkind) = popvar(bc_buf, globals, funcs, &mut pc, &mut mask)?;
                if fkind != ValKind::Func {
                    return Err(ShError::EvalInvalidFunc);
                }
                let idx = match floc {
                    Loc::Global(goff) => globals.value(goff) as usize - 1,
                    _ => return Err(ShError::EvalInvalidFunc),
                };

                let argc = hdr.arg_count.saturating_sub(1);
                let mut args = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    let (loc, kind) = popvar(bc_buf, globals, funcs, &mut pc, &mut mask)?;
                    args.push(match kind {
                        ValKind::Char => {
                            let Loc::Str { off, len } = loc else { return Err(ShError::EvalInvalidArgType) };
                            let data = &bc_buf[off..off + len];
                            let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                            ShArgVal::Str(data[..end].to_vec())
                        }
                        _ => ShArgVal::Int(get_val(bc_buf, globals, loc)),
                    });
                }

                let entry = funcs.get_mut(idx).ok_or(ShError::EvalInvalidFunc)?;
                let mut ctx = FuncCtx { clock };
                let ret = (entry.func)(&mut ctx, &args).map_err(|_| ShError::FuncError)?;
                set_val(bc_buf, globals, res, ret);
            }

            Op::If | Op::IfRet | Op::Else => {
                let (cond, _) = popvar(bc_buf, globals, funcs, &mut pc, &mut mask)?;
                let value = get_val(bc_buf, globals, cond) != 0;
                bc::pop_arg_kind(&mut mask);
                let jump = bc::get_cell(bc_buf, pc) as usize;
                pc += 4;

                let run_body = if hdr.op == Op::Else { !value } else { value };
                if !run_body {
                    if jump > end {
                        return Err(ShError::Internal);
                    }
                    pc = jump;
                }
            }

            Op::Foreach => {
                // Reserved: parse rule without an evaluator.
                return Err(ShError::Internal);
            }

            Op::Block | Op::None => {}

            _ if d.concat => {
                let (res, _) = popvar(bc_buf, globals, funcs, &mut pc, &mut mask)?;
                let mut acc: u32 = 0;
                for idx in 0..hdr.arg_count {
                    let (loc, kind) = popvar(bc_buf, globals, funcs, &mut pc, &mut mask)?;
                    if kind != ValKind::Int {
                        return Err(ShError::EvalInvalidArgType);
                    }
                    let v = get_val(bc_buf, globals, loc);
                    if idx == 0 {
                        acc = v;
                        continue;
                    }
                    acc = match hdr.op {
                        Op::Plus => acc.wrapping_add(v),
                        Op::Minus => acc.wrapping_sub(v),
                        Op::Multiply => acc.wrapping_mul(v),
                        Op::Div => acc.checked_div(v).ok_or(ShError::Internal)?,
                        Op::Mod => acc.checked_rem(v).ok_or(ShError::Internal)?,
                        Op::BitAnd => acc & v,
                        Op::BitShr => acc.wrapping_shr(v),
                        Op::BitShl => acc.wrapping_shl(v),
                        Op::BitOr => acc | v,
                        Op::BitXor => acc ^ v,
                        Op::And => (acc != 0 && v != 0) as u32,
                        Op::Or => (acc != 0 || v != 0) as u32,
                        _ => return Err(ShError::Internal),
                    };
                }
                set_val(bc_buf, globals, res, acc);
            }

            _ => {
                if hdr.arg_count != 1 && hdr.arg_count != 2 {
                    return Err(ShError::Internal);
                }
                let (res, _) = popvar(bc_buf, globals, funcs, &mut pc, &mut mask)?;
                let (l, lk) = popvar(bc_buf, globals, funcs, &mut pc, &mut mask)?;
                if lk != ValKind::Int {
                    return Err(ShError::Internal);
                }
                let lv = get_val(bc_buf, globals, l);
                let rv = if hdr.arg_count == 2 {
                    let (r, rk) = popvar(bc_buf, globals, funcs, &mut pc, &mut mask)?;
                    if rk != ValKind::Int {
                        return Err(ShError::Internal);
                    }
                    get_val(bc_buf, globals, r)
                } else {
                    0
                };

                let out = match hdr.op {
                    Op::Not => (lv == 0) as u32,
                    Op::BitNot => !lv,
                    Op::Lt => (lv < rv) as u32,
                    Op::Gt => (lv > rv) as u32,
                    Op::LtEq => (lv <= rv) as u32,
                    Op::GtEq => (lv >= rv) as u32,
                    Op::Eq => (lv == rv) as u32,
                    Op::NotEq => (lv != rv) as u32,
                    _ => return Err(ShError::Internal),
                };
                set_val(bc_buf, globals, res, out);
            }
        }
    }

    Ok(())
}

/// Built-in function set: wall clock, monotonic clock, one-line print.
pub fn builtin_funcs(service_id: u16) -> Vec<FuncEntry> {
    vec![
        FuncEntry {
            service_id,
            name: "sysdate".to_string(),
            func: Box::new(|ctx, _args| Ok(ctx.clock.time())),
        },
        FuncEntry {
            service_id,
            name: "sysctime".to_string(),
            func: Box::new(|ctx, _args| Ok(ctx.clock.ctime())),
        },
        FuncEntry {
            service_id,
            name: "print".to_string(),
            func: Box::new(|_ctx, args| {
                let mut line = String::new();
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        line.push_str(", ");
                    }
                    match a {
                        ShArgVal::Int(v) => line.push_str(&v.to_string()),
                        ShArgVal::Str(s) => {
                            line.push('"');
                            line.push_str(&String::from_utf8_lossy(s));
                            line.push('"');
                        }
                    }
                }
                info!(target: "lwsh", "out: {line}");
                Ok(0)
            }),
        },
    ]
}

/// Render bytecode to its canonical text listing.
pub fn dump_bytecode(bc_buf: &[u8], globals: Option<&GlobalTable>) -> String {
    let mut out = String::new();
    let mut pc = 0usize;

    while pc + 4 <= bc_buf.len() {
        let hdr = bc::read_oper(bc_buf, pc);
        let d = desc(hdr.op);
        out.push_str(&format!("\t{:04x}:\t{}{}\t", pc, d.token, d.term));
        pc += 4;

        let mut mask = hdr.bitmask;
        let count = hdr.arg_count + d.result as u8;
        for idx in 0..count {
            if pc + 4 > bc_buf.len() {
                return out;
            }
            if idx > 0 {
                out.push_str(", ");
            }
            let cell = bc::get_cell(bc_buf, pc);
            match bc::pop_arg_kind(&mut mask) {
                BcArgKind::Int => {
                    out.push_str(&cell.to_string());
                    pc += 4;
                }
                BcArgKind::Char => {
                    pc += 4;
                    let len = cell as usize;
                    let data = &bc_buf[pc..(pc + len).min(bc_buf.len())];
                    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                    out.push_str(&format!("\"{}\"", String::from_utf8_lossy(&data[..end])));
                    pc += bc::align4(len);
                }
                BcArgKind::Ptr => {
                    pc += 4;
                    if cell >= GLOBAL_BASE {
                        let goff = cell - GLOBAL_BASE;
                        match globals {
                            Some(gt) => {
                                let name = String::from_utf8_lossy(gt.name_of(goff)).into_owned();
                                match gt.kind(goff) {
                                    GlobalKind::Int => out.push_str(&format!("<{}: {}>", name, gt.value(goff))),
                                    GlobalKind::Char => out.push_str(&format!("<{}: \"{}\">", name, gt.value(goff))),
                                    GlobalKind::Func => out.push_str(&format!("<{}>", name)),
                                }
                            }
                            None => out.push_str(&format!("ptr=0x{:x}", cell)),
                        }
                    } else {
                        out.push_str(&format!("vptr+0x{:x}", cell));
                    }
                }
            }
        }
        out.push('\n');
    }
    out.push_str(&format!("\t{:04x}:\tret", pc));
    out
}

#[cfg(test)]
mod tests {
    use super::super::parse::parse_text;
    use super::*;
    use crate::platform::sim::SimClock;
    use std::sync::{Arc, Mutex};

    fn run(src: &str) -> (Vec<u8>, GlobalTable, Arc<Mutex<Vec<Vec<ShArgVal>>>>) {
        let mut gt = GlobalTable::new();
        let mut bc = parse_text(src, &mut gt).unwrap();
        let calls: Arc<Mutex<Vec<Vec<ShArgVal>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let mut funcs = builtin_funcs(5);
        funcs.push(FuncEntry {
            service_id: 0,
            name: "probe".to_string(),
            func: Box::new(move |_ctx, args| {
                sink.lock().unwrap().push(args.to_vec());
                Ok(100)
            }),
        });
        let clock = SimClock::new(1_700_000_000);
        eval(&mut bc, &mut gt, &mut funcs, &clock).unwrap();
        (bc, gt, calls)
    }

    #[test]
    fn test_arithmetic_precedence() {
        let (_, _, calls) = run("# x := 3 + 4 * 2; probe(x);");
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![ShArgVal::Int(11)]);
    }

    #[test]
    fn test_concat_fold_left_to_right() {
        let (_, _, calls) = run("probe(20 - 5 - 3 - 2);");
        assert_eq!(calls.lock().unwrap()[0], vec![ShArgVal::Int(10)]);
    }

    #[test]
    fn test_division_and_modulo() {
        let (_, _, calls) = run("probe(17 / 3, 17 % 3);");
        assert_eq!(calls.lock().unwrap()[0], vec![ShArgVal::Int(5), ShArgVal::Int(2)]);
    }

    #[test]
    fn test_relational_and_logic() {
        let (_, _, calls) = run("probe(3 < 4, 3 >= 4, 1 && 0, 1 || 0, !0);");
        assert_eq!(
            calls.lock().unwrap()[0],
            vec![ShArgVal::Int(1), ShArgVal::Int(0), ShArgVal::Int(0), ShArgVal::Int(1), ShArgVal::Int(1)]
        );
    }

    #[test]
    fn test_string_argument() {
        let (_, _, calls) = run(r#"probe("hello");"#);
        assert_eq!(calls.lock().unwrap()[0], vec![ShArgVal::Str(b"hello".to_vec())]);
    }

    #[test]
    fn test_conditional_true_branch() {
        let (_, _, calls) = run("# x := 5; x = 5 ?? { probe(1); };");
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_conditional_false_skips_body() {
        let (_, _, calls) = run("# x := 5; x = 6 ?? { probe(1); };");
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_if_else_branches() {
        let (_, _, calls) = run("# x := 1; x = 2 ?? { probe(10); } : { probe(20); };");
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![ShArgVal::Int(20)]);
    }

    #[test]
    fn test_global_variable_persists_across_statements() {
        let mut gt = GlobalTable::new();
        let clock = SimClock::new(0);
        let mut funcs = builtin_funcs(5);

        let mut bc1 = parse_text("## counter; counter := 41;", &mut gt).unwrap();
        eval(&mut bc1, &mut gt, &mut funcs, &clock).unwrap();

        let goff = gt.lookup(b"counter").unwrap();
        assert_eq!(gt.value(goff), 41);

        let mut bc2 = parse_text("## counter; counter := counter + 1;", &mut gt).unwrap();
        eval(&mut bc2, &mut gt, &mut funcs, &clock).unwrap();
        assert_eq!(gt.value(goff), 42);
    }

    #[test]
    fn test_sysdate_uses_clock() {
        let (_, gt, calls) = {
            let mut gt = GlobalTable::new();
            let mut bc = parse_text("# t := sysdate(); probe(t);", &mut gt).unwrap();
            let calls: Arc<Mutex<Vec<Vec<ShArgVal>>>> = Arc::new(Mutex::new(Vec::new()));
            let sink = calls.clone();
            let mut funcs = builtin_funcs(5);
            funcs.push(FuncEntry {
                service_id: 0,
                name: "probe".to_string(),
                func: Box::new(move |_ctx, args| {
                    sink.lock().unwrap().push(args.to_vec());
                    Ok(0)
                }),
            });
            let clock = SimClock::new(1_234_567);
            eval(&mut bc, &mut gt, &mut funcs, &clock).unwrap();
            (bc, gt, calls)
        };
        let _ = gt;
        assert_eq!(calls.lock().unwrap()[0], vec![ShArgVal::Int(1_234_567)]);
    }

    #[test]
    fn test_unknown_function_fails() {
        let mut gt = GlobalTable::new();
        let mut bc = parse_text("nosuch();", &mut gt).unwrap();
        let clock = SimClock::new(0);
        let mut funcs = builtin_funcs(5);
        assert_eq!(eval(&mut bc, &mut gt, &mut funcs, &clock), Err(ShError::FuncNotExists));
    }

    #[test]
    fn test_foreach_rejected_at_eval() {
        let mut gt = GlobalTable::new();
        let mut bc = parse_text("# x := 1; x @ { probe(1); };", &mut gt).unwrap();
        let clock = SimClock::new(0);
        let mut funcs = builtin_funcs(5);
        assert_eq!(eval(&mut bc, &mut gt, &mut funcs, &clock), Err(ShError::Internal));
    }

    #[test]
    fn test_dump_lists_operators() {
        let mut gt = GlobalTable::new();
        let bc = parse_text("# x := 3 + 4 * 2; print(x);", &mut gt).unwrap();
        let text = dump_bytecode(&bc, Some(&gt));
        let tokens: Vec<&str> = text
            .lines()
            .filter_map(|l| l.split('\t').nth(2))
            .collect();
        assert_eq!(tokens, vec!["#", "*", "+", ":=", "()", "ret"]);
        assert!(text.contains("<print>"));
        assert!(text.ends_with("ret"));
    }

    #[test]
    fn test_dump_reparse_stability() {
        // Dumping does not disturb the bytecode; a re-parse of the same
        // source yields a byte-identical image.
        let mut gt = GlobalTable::new();
        let bc1 = parse_text("# x := 1 + 2; print(x);", &mut gt).unwrap();
        let _ = dump_bytecode(&bc1, Some(&gt));
        let mut gt2 = GlobalTable::new();
        let bc2 = parse_text("# x := 1 + 2; print(x);", &mut gt2).unwrap();
        assert_eq!(bc1, bc2);
    }
}
