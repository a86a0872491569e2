// Light-weight shell service.
//
// Statement lifecycle over the storage-backed statement class, the
// function registry, and the service adapter translating control-channel
// messages (add/remove/run/dump) into engine calls. The engine itself
// (`Shell`) lives in the runtime so that other services, notably the
// scheduler, can evaluate statements without going through messaging.

pub mod bc;
pub mod eval;
pub mod globals;
pub mod ops;
pub mod parse;

use tracing::{info, warn};

use crate::dtlv::codes::{sh, svc_id};
use crate::dtlv::{DtlvDec, DtlvEnc, DtlvType};
use crate::error::{ShError, SvcsError};
use crate::imdb::{ClassDef, ClassId, ForallCtl, Imdb, RowRef};
use crate::platform::Clock;
use crate::svcs::{encode_service_result_ext, msgtype, Runtime, Service};

pub use eval::{FuncCtx, FuncEntry, ShArgVal, ShFunc};
pub use globals::GlobalTable;

pub type Result<T> = std::result::Result<T, ShError>;

pub const SERVICE_NAME: &str = "lwsh";
pub const STMT_NAME_LEN: usize = 30;
pub const FUNC_NAME_LEN: usize = 12;

const CLS_FUNC: &str = "lsh$func";
const CLS_STMT: &str = "lsh$stmt";

const FUNC_REC_BYTES: u16 = 16;
const STMT_HDR_BYTES: usize = 36;

/// Shell message types.
pub mod sh_msgtype {
    pub const STMT_ADD: u16 = 10;
    pub const STMT_REMOVE: u16 = 11;
    pub const STMT_RUN: u16 = 12;
    pub const STMT_DUMP: u16 = 13;
}

/// Statement descriptor.
#[derive(Debug, Clone)]
pub struct StmtInfo {
    pub name: String,
    pub parse_time: u32,
    pub length: u16,
}

/// The shell engine: statement storage, globals, function registry.
pub struct Shell {
    hfunc: ClassId,
    hstmt: ClassId,
    pub globals: GlobalTable,
    funcs: Vec<FuncEntry>,
    pub last_errmsg: String,
}

impl Shell {
    /// Create the backing classes and register the built-in functions.
    pub fn start(imdb: &mut Imdb) -> Result<Self> {
        let hfunc = imdb.class_create(ClassDef::fixed(CLS_FUNC, 1, 1, FUNC_REC_BYTES))?;
        let hstmt = imdb.class_create(ClassDef::variable(CLS_STMT, 2, 4))?;
        let mut shell = Self {
            hfunc,
            hstmt,
            globals: GlobalTable::new(),
            funcs: Vec::new(),
            last_errmsg: String::new(),
        };
        for entry in eval::builtin_funcs(svc_id::LSH) {
            shell.func_register(imdb, entry)?;
        }
        Ok(shell)
    }

    /// Destroy the backing classes.
    pub fn stop(self, imdb: &mut Imdb) -> Result<()> {
        imdb.class_destroy(self.hfunc)?;
        imdb.class_destroy(self.hstmt)?;
        Ok(())
    }

    /// Register an external function. Duplicate names are rejected.
    pub fn func_register(&mut self, imdb: &mut Imdb, entry: FuncEntry) -> Result<()> {
        if self.funcs.iter().any(|f| f.name == entry.name) {
            warn!(name = %entry.name, "function exists");
            return Err(ShError::FuncExists);
        }
        let row = imdb.insert(self.hfunc, 0)?;
        let buf = imdb.obj_mut(row)?;
        buf[0..2].copy_from_slice(&entry.service_id.to_le_bytes());
        buf[2..4].fill(0);
        buf[4..16].fill(0);
        let n = entry.name.len().min(FUNC_NAME_LEN);
        buf[4..4 + n].copy_from_slice(&entry.name.as_bytes()[..n]);
        self.funcs.push(entry);
        Ok(())
    }

    pub fn func_names(&self) -> Vec<String> {
        self.funcs.iter().map(|f| f.name.clone()).collect()
    }

    /// Look a registered function up by name.
    pub fn func_get(&self, name: &str) -> Result<&FuncEntry> {
        self.funcs.iter().find(|f| f.name == name).ok_or(ShError::FuncNotExists)
    }

    /// Parse a statement and store its bytecode under `name`.
    pub fn stmt_parse(&mut self, imdb: &mut Imdb, clock: &dyn Clock, text: &str, name: &str) -> Result<RowRef> {
        let bc = match parse::parse_text(text, &mut self.globals) {
            Ok(bc) => bc,
            Err((err, msg)) => {
                warn!(code = ?err, msg = %msg, "parse error");
                self.last_errmsg = msg;
                return Err(err);
            }
        };

        let row = imdb.insert(self.hstmt, STMT_HDR_BYTES + bc.len())?;
        let buf = imdb.obj_mut(row)?;
        buf[..STMT_HDR_BYTES].fill(0);
        let n = name.len().min(STMT_NAME_LEN);
        buf[..n].copy_from_slice(&name.as_bytes()[..n]);
        buf[30..32].copy_from_slice(&(bc.len() as u16).to_le_bytes());
        buf[32..36].copy_from_slice(&clock.ctime().to_le_bytes());
        buf[STMT_HDR_BYTES..STMT_HDR_BYTES + bc.len()].copy_from_slice(&bc);
        Ok(row)
    }

    /// Find a stored statement by name.
    pub fn stmt_get(&self, imdb: &mut Imdb, name: &str) -> Result<RowRef> {
        let mut found = None;
        imdb.class_forall(self.hstmt, |db, row| {
            let buf = db.obj(row)?;
            let end = buf[..STMT_NAME_LEN].iter().position(|&b| b == 0).unwrap_or(STMT_NAME_LEN);
            if &buf[..end] == name.as_bytes() {
                found = Some(row);
                return Ok(ForallCtl::Break);
            }
            Ok(ForallCtl::Continue)
        })?;
        found.ok_or(ShError::StmtNotExists)
    }

    pub fn stmt_info(&self, imdb: &Imdb, row: RowRef) -> Result<StmtInfo> {
        let buf = imdb.obj(row)?;
        let end = buf[..STMT_NAME_LEN].iter().position(|&b| b == 0).unwrap_or(STMT_NAME_LEN);
        Ok(StmtInfo {
            name: String::from_utf8_lossy(&buf[..end]).into_owned(),
            length: u16::from_le_bytes(buf[30..32].try_into().unwrap()),
            parse_time: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
        })
    }

    /// Evaluate a stored statement in place.
    pub fn stmt_eval(&mut self, imdb: &mut Imdb, clock: &dyn Clock, row: RowRef) -> Result<()> {
        let len = self.stmt_info(imdb, row)?.length as usize;
        let Shell { globals, funcs, .. } = self;
        let buf = imdb.obj_mut(row)?;
        if STMT_HDR_BYTES + len > buf.len() {
            return Err(ShError::InvalidHandler);
        }
        eval::eval(&mut buf[STMT_HDR_BYTES..STMT_HDR_BYTES + len], globals, funcs, clock)
    }

    /// Text listing of a stored statement's bytecode.
    pub fn stmt_dump(&self, imdb: &Imdb, row: RowRef, resolve_globals: bool) -> Result<String> {
        let len = self.stmt_info(imdb, row)?.length as usize;
        let buf = imdb.obj(row)?;
        let gt = if resolve_globals { Some(&self.globals) } else { None };
        Ok(eval::dump_bytecode(&buf[STMT_HDR_BYTES..STMT_HDR_BYTES + len], gt))
    }

    /// Delete a stored statement.
    pub fn stmt_free(&mut self, imdb: &mut Imdb, row: RowRef) -> Result<()> {
        imdb.delete(row)?;
        Ok(())
    }

    fn stmt_list(&self, imdb: &mut Imdb) -> Result<Vec<StmtInfo>> {
        let mut out = Vec::new();
        imdb.class_forall(self.hstmt, |db, row| {
            let buf = db.obj(row)?;
            let end = buf[..STMT_NAME_LEN].iter().position(|&b| b == 0).unwrap_or(STMT_NAME_LEN);
            out.push(StmtInfo {
                name: String::from_utf8_lossy(&buf[..end]).into_owned(),
                length: u16::from_le_bytes(buf[30..32].try_into().unwrap()),
                parse_time: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            });
            Ok(ForallCtl::Continue)
        })?;
        Ok(out)
    }
}

// Sequence-decode the name/text AVPs the shell messages carry.
fn decode_stmt_fields(body: &[u8]) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut text = None;
    let mut dec = DtlvDec::new(body);
    while let Ok(avp) = dec.decode() {
        if avp.hdr.ns != 0 && avp.hdr.ns as u16 != svc_id::LSH {
            continue;
        }
        match avp.hdr.code {
            sh::STMT_NAME => name = dec.get_char(&avp).ok().map(str::to_string),
            sh::STMT_TEXT => text = dec.get_char(&avp).ok().map(str::to_string),
            _ => {}
        }
    }
    (name, text)
}

/// Service adapter installing the shell engine into the runtime.
pub struct LshService;

impl LshService {
    fn with_shell<R>(
        rt: &mut Runtime,
        f: impl FnOnce(&mut Shell, &mut Runtime) -> std::result::Result<R, SvcsError>,
    ) -> std::result::Result<R, SvcsError> {
        let mut shell = rt.shell.take().ok_or(SvcsError::NotRun)?;
        let res = f(&mut shell, rt);
        rt.shell = Some(shell);
        res
    }

    fn on_msg_stmt_add(rt: &mut Runtime, body: &[u8], msg_out: &mut DtlvEnc) -> std::result::Result<(), SvcsError> {
        let (name, text) = decode_stmt_fields(body);
        let (Some(name), Some(text)) = (name, text) else {
            return Err(SvcsError::InvalidMessage);
        };

        let res = Self::with_shell(rt, |shell, rt| {
            if shell.stmt_get(&mut rt.imdb, &name).is_ok() {
                warn!(name = %name, "statement exists");
                return Ok(Ok(()));
            }
            Ok(shell
                .stmt_parse(&mut rt.imdb, rt.clock.as_ref(), &text, &name)
                .map(|_| ()))
        })?;

        match res {
            Ok(()) => {
                info!(name = %name, "statement added");
                Ok(())
            }
            Err(e) => {
                let msg = rt
                    .shell
                    .as_ref()
                    .map(|s| s.last_errmsg.clone())
                    .unwrap_or_default();
                rt.set_last_error(msg);
                encode_service_result_ext(rt, msg_out, e as u8)
            }
        }
    }

    fn on_msg_stmt_named(
        rt: &mut Runtime,
        body: &[u8],
        msg_out: &mut DtlvEnc,
        mt: u16,
    ) -> std::result::Result<(), SvcsError> {
        let (name, _) = decode_stmt_fields(body);
        let Some(name) = name else {
            return Err(SvcsError::InvalidMessage);
        };
        rt.reset_last_error();

        let res: std::result::Result<Option<String>, ShError> = Self::with_shell(rt, |shell, rt| {
            let row = match shell.stmt_get(&mut rt.imdb, &name) {
                Ok(r) => r,
                Err(e) => return Ok(Err(e)),
            };
            Ok(match mt {
                sh_msgtype::STMT_REMOVE => {
                    info!(name = %name, "statement removed");
                    shell.stmt_free(&mut rt.imdb, row).map(|_| None)
                }
                sh_msgtype::STMT_RUN => shell.stmt_eval(&mut rt.imdb, rt.clock.as_ref(), row).map(|_| None),
                sh_msgtype::STMT_DUMP => shell.stmt_dump(&rt.imdb, row, true).map(Some),
                _ => Err(ShError::Internal),
            })
        })?;

        match res {
            Ok(Some(dump)) => {
                msg_out.encode_char(sh::STMT_CODE, &dump)?;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                if e == ShError::StmtNotExists {
                    warn!(name = %name, "statement not exists");
                }
                encode_service_result_ext(rt, msg_out, e as u8)
            }
        }
    }

    fn on_msg_info(rt: &mut Runtime, msg_out: &mut DtlvEnc) -> std::result::Result<(), SvcsError> {
        Self::with_shell(rt, |shell, rt| {
            let list = msg_out.encode_list(0, sh::STATEMENT, DtlvType::Object)?;
            for st in shell.stmt_list(&mut rt.imdb).map_err(|_| SvcsError::Internal)? {
                let g = msg_out.encode_group(0, sh::STATEMENT)?;
                msg_out.encode_nchar(sh::STMT_NAME, STMT_NAME_LEN, &st.name)?;
                msg_out.encode_u16(sh::STMT_OBJSIZE, st.length)?;
                msg_out.encode_u32(sh::STMT_PARSE_TIME, rt.clock.time_at(st.parse_time))?;
                msg_out.group_done(g)?;
            }
            msg_out.group_done(list)?;

            let flist = msg_out.encode_list(0, sh::FUNCTION_NAME, DtlvType::Char)?;
            for name in shell.func_names() {
                msg_out.encode_nchar(sh::FUNCTION_NAME, FUNC_NAME_LEN, &name)?;
            }
            msg_out.group_done(flist)?;
            Ok(())
        })
    }
}

impl Service for LshService {
    fn on_start(&mut self, rt: &mut Runtime, _conf: Option<&[u8]>) -> std::result::Result<(), SvcsError> {
        if rt.shell.is_some() {
            return Err(SvcsError::ServiceError);
        }
        let shell = Shell::start(&mut rt.imdb).map_err(|_| SvcsError::ServiceError)?;
        rt.shell = Some(shell);
        Ok(())
    }

    fn on_stop(&mut self, rt: &mut Runtime) -> std::result::Result<(), SvcsError> {
        let shell = rt.shell.take().ok_or(SvcsError::NotRun)?;
        shell.stop(&mut rt.imdb).map_err(|_| SvcsError::Internal)?;
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
            msgtype::INFO => Self::on_msg_info(rt, msg_out),
            sh_msgtype::STMT_ADD => {
                Self::on_msg_stmt_add(rt, msg_in.ok_or(SvcsError::InvalidMessage)?, msg_out)
            }
            sh_msgtype::STMT_REMOVE | sh_msgtype::STMT_RUN | sh_msgtype::STMT_DUMP => {
                Self::on_msg_stmt_named(rt, msg_in.ok_or(SvcsError::InvalidMessage)?, msg_out, mt)
            }
            _ => Err(SvcsError::MsgTypeInvalid),
        }
    }
}
