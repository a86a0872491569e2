// Cron-like scheduler service.
//
// Entries bind a schedule mask to a named shell statement. The core keeps
// the entry table in storage, computes each entry's next fire instant on
// the monotonic clock, and arms one timer for the earliest of them (capped
// at an hour; re-armed on tick and on ADJTIME). A persistent entry keeps a
// textual twin in the file-backed store and is re-parsed on service start.

pub mod timemask;

use tracing::{info, warn};

use crate::dtlv::codes::{common, sched as avp, svc_id};
use crate::dtlv::{DtlvDec, DtlvEnc, DtlvType};
use crate::error::{SchedError, ShError, SvcsError};
use crate::imdb::{ClassDef, ClassId, ForallCtl, RowRef};
use crate::platform::Timer;
use crate::svcs::{encode_service_result_ext, msgtype, Runtime, Service};
use timemask::{next_fire, parse_schedule, TsMask, NEXT_CTIME_NONE};

pub type Result<T> = std::result::Result<T, SchedError>;

pub const SERVICE_NAME: &str = "sched";
pub const ENTRY_NAME_LEN: usize = 30;
pub const STMT_NAME_LEN: usize = 30;

const CLS_ENTRY: &str = "sched$entry";
const CLS_ENTRY_SRC: &str = "sched$src";

const ENTRY_HDR_BYTES: usize = 100;
const SRC_HDR_BYTES: usize = 36;

const MAX_TIMEOUT_SEC: u32 = 3600;

/// Scheduler message types.
pub mod sched_msgtype {
    pub const ENTRY_ADD: u16 = 10;
    pub const ENTRY_REMOVE: u16 = 11;
    pub const ENTRY_RUN: u16 = 12;
    pub const ENTRY_SOURCE: u16 = 13;
    pub const ENTRY_LIST: u16 = 14;
}

/// Entry run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    None = 0,
    Running = 1,
    Queue = 2,
    Failed = 3,
}

impl EntryState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => EntryState::Running,
            2 => EntryState::Queue,
            3 => EntryState::Failed,
            _ => EntryState::None,
        }
    }
}

// Fixed header of an entry record; the DTLV vardata blob follows.
#[derive(Debug, Clone)]
struct EntryRec {
    name: String,
    stmt_name: String,
    last_ctime: u32,
    next_ctime: u32,
    run_count: u16,
    fail_count: u16,
    state: EntryState,
    varlen: u16,
    mask: TsMask,
}

fn get_name(buf: &[u8], off: usize, len: usize) -> String {
    let end = buf[off..off + len].iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&buf[off..off + end]).into_owned()
}

fn put_name(buf: &mut [u8], off: usize, len: usize, s: &str) {
    buf[off..off + len].fill(0);
    let n = s.len().min(len);
    buf[off..off + n].copy_from_slice(&s.as_bytes()[..n]);
}

impl EntryRec {
    fn decode(buf: &[u8]) -> Self {
        Self {
            name: get_name(buf, 0, ENTRY_NAME_LEN),
            stmt_name: get_name(buf, 30, STMT_NAME_LEN),
            last_ctime: u32::from_le_bytes(buf[60..64].try_into().unwrap()),
            next_ctime: u32::from_le_bytes(buf[64..68].try_into().unwrap()),
            run_count: u16::from_le_bytes(buf[68..70].try_into().unwrap()),
            fail_count: u16::from_le_bytes(buf[70..72].try_into().unwrap()),
            state: EntryState::from_u8(buf[72]),
            varlen: u16::from_le_bytes(buf[74..76].try_into().unwrap()),
            mask: TsMask {
                minpart: buf[76],
                dow: buf[77],
                minute: u64::from_le_bytes(buf[80..88].try_into().unwrap()),
                hour: u32::from_le_bytes(buf[88..92].try_into().unwrap()),
                dom: u32::from_le_bytes(buf[92..96].try_into().unwrap()),
                mcast: u32::from_le_bytes(buf[96..100].try_into().unwrap()),
            },
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        put_name(buf, 0, ENTRY_NAME_LEN, &self.name);
        put_name(buf, 30, STMT_NAME_LEN, &self.stmt_name);
        buf[60..64].copy_from_slice(&self.last_ctime.to_le_bytes());
        buf[64..68].copy_from_slice(&self.next_ctime.to_le_bytes());
        buf[68..70].copy_from_slice(&self.run_count.to_le_bytes());
        buf[70..72].copy_from_slice(&self.fail_count.to_le_bytes());
        buf[72] = self.state as u8;
        buf[73] = 0;
        buf[74..76].copy_from_slice(&self.varlen.to_le_bytes());
        buf[76] = self.mask.minpart;
        buf[77] = self.mask.dow;
        buf[78..80].fill(0);
        buf[80..88].copy_from_slice(&self.mask.minute.to_le_bytes());
        buf[88..92].copy_from_slice(&self.mask.hour.to_le_bytes());
        buf[92..96].copy_from_slice(&self.mask.dom.to_le_bytes());
        buf[96..100].copy_from_slice(&self.mask.mcast.to_le_bytes());
    }
}

/// The scheduler engine.
pub struct SchedCore {
    hentry: ClassId,
    hentry_src: Option<ClassId>,
    next_ctime: u32,
    timer: Box<dyn Timer>,
}

impl SchedCore {
    /// Create the entry table, attach the persisted source table and
    /// reload surviving entries. The timer stays unarmed until the first
    /// add or ADJTIME, when wall time is trustworthy.
    pub fn start(rt: &mut Runtime, timer: Box<dyn Timer>) -> Result<Self> {
        let hentry = rt.imdb.class_create(ClassDef::variable(CLS_ENTRY, 1, 2))?;

        let hentry_src = match rt.fdb.as_mut() {
            Some(fdb) => Some(match fdb.class_find(CLS_ENTRY_SRC) {
                Some(c) => c,
                None => fdb.class_create(ClassDef::variable(CLS_ENTRY_SRC, 1, 2))?,
            }),
            None => None,
        };

        let mut core = Self { hentry, hentry_src, next_ctime: NEXT_CTIME_NONE, timer };
        core.load_sources(rt);
        Ok(core)
    }

    pub fn stop(self, rt: &mut Runtime) -> Result<()> {
        let mut timer = self.timer;
        timer.disarm();
        rt.imdb.class_destroy(self.hentry)?;
        Ok(())
    }

    // Re-parse every persisted source record.
    fn load_sources(&mut self, rt: &mut Runtime) {
        let Some(hsrc) = self.hentry_src else { return };
        let mut sources = Vec::new();
        if let Some(fdb) = rt.fdb.as_mut() {
            let _ = fdb.class_forall(hsrc, |db, row| {
                sources.push(db.obj(row)?.to_vec());
                Ok(ForallCtl::Continue)
            });
        }

        for src in sources {
            let name = get_name(&src, 0, ENTRY_NAME_LEN);
            let varlen = u16::from_le_bytes(src[34..36].try_into().unwrap()) as usize;
            let body = &src[SRC_HDR_BYTES..SRC_HDR_BYTES + varlen.min(src.len() - SRC_HDR_BYTES)];

            let mut schedule = None;
            let mut stmt_name = None;
            let mut args: Vec<u8> = Vec::new();
            let mut dec = DtlvDec::new(body);
            while let Ok(a) = dec.decode() {
                match a.hdr.code {
                    avp::SCHEDULE_STRING => schedule = dec.get_char(&a).ok().map(str::to_string),
                    avp::STMT_NAME => stmt_name = dec.get_char(&a).ok().map(str::to_string),
                    avp::STMT_ARGUMENTS => args = dec.data(&a).to_vec(),
                    _ => {}
                }
            }

            match (schedule, stmt_name) {
                (Some(sched), Some(stmt)) if !sched.is_empty() && !stmt.is_empty() => {
                    if let Err(e) = self.internal_entry_add(rt, &name, &sched, &stmt, &args) {
                        warn!(name = %name, error = %e, "load failed");
                    }
                }
                _ => warn!(name = %name, "load failed: invalid source"),
            }
        }
    }

    /// Find an entry row by name.
    pub fn entry_get(&self, rt: &mut Runtime, name: &str) -> Result<RowRef> {
        let mut found = None;
        rt.imdb.class_forall(self.hentry, |db, row| {
            if get_name(db.obj(row)?, 0, ENTRY_NAME_LEN) == name {
                found = Some(row);
                return Ok(ForallCtl::Break);
            }
            Ok(ForallCtl::Continue)
        })?;
        found.ok_or(SchedError::EntryNotExists)
    }

    /// Find a persisted source row by entry name.
    pub fn src_get(&self, rt: &mut Runtime, name: &str) -> Option<RowRef> {
        let hsrc = self.hentry_src?;
        let fdb = rt.fdb.as_mut()?;
        let mut found = None;
        let _ = fdb.class_forall(hsrc, |db, row| {
            if get_name(db.obj(row)?, 0, ENTRY_NAME_LEN) == name {
                found = Some(row);
                return Ok(ForallCtl::Break);
            }
            Ok(ForallCtl::Continue)
        });
        found
    }

    fn internal_entry_add(
        &mut self,
        rt: &mut Runtime,
        name: &str,
        schedule: &str,
        stmt_name: &str,
        args: &[u8],
    ) -> Result<RowRef> {
        if self.entry_get(rt, name).is_ok() {
            warn!(name, "entry exists");
            return Err(SchedError::EntryExists);
        }
        let mask = parse_schedule(schedule)?;

        // Vardata: schedule text first, then the raw argument object.
        let mut vd = vec![0u8; crate::dtlv::align4(4 + schedule.len() + 1) + crate::dtlv::align4(4 + args.len())];
        let vd_len = {
            let mut enc = DtlvEnc::new(&mut vd);
            enc.encode_char(avp::SCHEDULE_STRING, schedule)?;
            if !args.is_empty() {
                enc.encode_object_bytes(0, avp::STMT_ARGUMENTS, args)?;
            }
            enc.datalen()
        };

        let row = rt.imdb.insert(self.hentry, ENTRY_HDR_BYTES + vd_len)?;
        let rec = EntryRec {
            name: name.to_string(),
            stmt_name: stmt_name.to_string(),
            last_ctime: 0,
            next_ctime: NEXT_CTIME_NONE,
            run_count: 0,
            fail_count: 0,
            state: EntryState::None,
            varlen: vd_len as u16,
            mask,
        };
        let buf = rt.imdb.obj_mut(row)?;
        rec.encode(buf);
        buf[ENTRY_HDR_BYTES..ENTRY_HDR_BYTES + vd_len].copy_from_slice(&vd[..vd_len]);
        Ok(row)
    }

    /// Add an entry; persistent entries also land in the file-backed store.
    pub fn entry_add(
        &mut self,
        rt: &mut Runtime,
        name: &str,
        persistent: bool,
        schedule: &str,
        stmt_name: &str,
        args: &[u8],
    ) -> Result<()> {
        let row = self.internal_entry_add(rt, name, schedule, stmt_name, args)?;

        let next = next_fire(&EntryRec::decode(rt.imdb.obj(row)?).mask, rt.clock.as_ref());
        {
            let buf = rt.imdb.obj_mut(row)?;
            buf[64..68].copy_from_slice(&next.to_le_bytes());
        }
        info!(name, next, "entry added");

        if self.next_ctime > next {
            let now = rt.clock.ctime();
            self.arm_next(now, Some(next));
        }

        if persistent {
            self.persist_source(rt, name, schedule, stmt_name, args);
        }
        Ok(())
    }

    fn persist_source(&mut self, rt: &mut Runtime, name: &str, schedule: &str, stmt_name: &str, args: &[u8]) {
        let Some(hsrc) = self.hentry_src else {
            warn!(name, "no media, source not persisted");
            return;
        };

        if let Some(old) = self.src_get(rt, name) {
            warn!(name, "source replaced");
            if let Some(fdb) = rt.fdb.as_mut() {
                let _ = fdb.delete(old);
            }
        }

        let utime = rt.clock.time();
        let Some(fdb) = rt.fdb.as_mut() else { return };
        let mut vd = vec![
            0u8;
            crate::dtlv::align4(4 + schedule.len() + 1)
                + crate::dtlv::align4(4 + stmt_name.len() + 1)
                + crate::dtlv::align4(4 + args.len())
        ];
        let vd_len = {
            let mut enc = DtlvEnc::new(&mut vd);
            let ok = enc
                .encode_char(avp::SCHEDULE_STRING, schedule)
                .and_then(|_| enc.encode_nchar(avp::STMT_NAME, STMT_NAME_LEN, stmt_name))
                .and_then(|_| if args.is_empty() { Ok(()) } else { enc.encode_octets(avp::STMT_ARGUMENTS, args) });
            if ok.is_err() {
                warn!(name, "source encode failed");
                return;
            }
            enc.datalen()
        };

        match fdb.insert(hsrc, SRC_HDR_BYTES + vd_len) {
            Ok(row) => {
                let buf = fdb.obj_mut(row).expect("fresh row");
                put_name(buf, 0, ENTRY_NAME_LEN, name);
                buf[30..34].copy_from_slice(&utime.to_le_bytes());
                buf[34..36].copy_from_slice(&(vd_len as u16).to_le_bytes());
                buf[SRC_HDR_BYTES..SRC_HDR_BYTES + vd_len].copy_from_slice(&vd[..vd_len]);
            }
            Err(e) => {
                warn!(name, error = %e, "source store failed");
                return;
            }
        }

        if let (Some(fdb), Some(flash)) = (rt.fdb.as_mut(), rt.flash.as_mut()) {
            if let Err(e) = fdb.flush(flash.as_mut()) {
                warn!(error = %e, "media flush failed");
            }
        }
    }

    /// Remove an entry and its persisted source.
    pub fn entry_remove(&mut self, rt: &mut Runtime, name: &str) -> Result<()> {
        let res = match self.entry_get(rt, name) {
            Ok(row) => {
                info!(name, "entry removed");
                rt.imdb.delete(row)?;
                self.set_all_next_time(rt, false);
                Ok(())
            }
            Err(e) => {
                warn!(name, "entry not exists");
                Err(e)
            }
        };

        if let Some(src) = self.src_get(rt, name) {
            if let Some(fdb) = rt.fdb.as_mut() {
                let _ = fdb.delete(src);
            }
            if let (Some(fdb), Some(flash)) = (rt.fdb.as_mut(), rt.flash.as_mut()) {
                let _ = fdb.flush(flash.as_mut());
            }
        }
        res
    }

    /// Run an entry immediately.
    pub fn entry_run(&mut self, rt: &mut Runtime, name: &str) -> Result<()> {
        let row = self.entry_get(rt, name)?;
        self.run_row(rt, row)
    }

    // Execute the bound statement, updating the run accounting.
    fn run_row(&mut self, rt: &mut Runtime, row: RowRef) -> Result<()> {
        let mut rec = EntryRec::decode(rt.imdb.obj(row)?);
        rec.state = EntryState::Running;
        rec.last_ctime = rt.clock.ctime();
        rec.run_count += 1;
        rec.encode(rt.imdb.obj_mut(row)?);

        let mut shell = match rt.shell.take() {
            Some(s) => s,
            None => {
                rec.state = EntryState::Failed;
                rec.fail_count += 1;
                rec.encode(rt.imdb.obj_mut(row)?);
                return Err(SchedError::StmtError);
            }
        };

        let res = match shell.stmt_get(&mut rt.imdb, &rec.stmt_name) {
            Ok(stmt) => shell.stmt_eval(&mut rt.imdb, rt.clock.as_ref(), stmt),
            Err(e) => Err(e),
        };
        rt.shell = Some(shell);

        let out = match res {
            Ok(()) => {
                rec.state = EntryState::None;
                Ok(())
            }
            Err(ShError::StmtNotExists) => {
                warn!(entry = %rec.name, stmt = %rec.stmt_name, "statement not exists");
                rec.state = EntryState::Failed;
                rec.fail_count += 1;
                Err(SchedError::StmtNotExists)
            }
            Err(e) => {
                warn!(entry = %rec.name, stmt = %rec.stmt_name, error = %e, "statement error");
                rec.state = EntryState::Failed;
                rec.fail_count += 1;
                Err(SchedError::StmtError)
            }
        };
        rec.encode(rt.imdb.obj_mut(row)?);
        out
    }

    fn arm_next(&mut self, now: u32, next: Option<u32>) {
        self.timer.disarm();
        let Some(nc) = next else {
            self.next_ctime = NEXT_CTIME_NONE;
            return;
        };
        self.next_ctime = nc;
        if nc != NEXT_CTIME_NONE && nc < now.wrapping_add(MAX_TIMEOUT_SEC) {
            let msec = if nc > now { (nc - now) as u64 * 1000 } else { 100 };
            self.timer.arm(msec, false);
        } else {
            self.timer.arm(MAX_TIMEOUT_SEC as u64 * 1000, false);
        }
    }

    /// Recompute fire times (all of them when `frenew`) and re-arm for the
    /// earliest entry.
    pub fn set_all_next_time(&mut self, rt: &mut Runtime, frenew: bool) {
        let now = rt.clock.ctime();
        let mut rows = Vec::new();
        let _ = rt.imdb.class_forall(self.hentry, |db, row| {
            rows.push((row, EntryRec::decode(db.obj(row)?)));
            Ok(ForallCtl::Continue)
        });

        let mut earliest: Option<u32> = None;
        for (row, mut rec) in rows {
            if frenew
                || rec.next_ctime == NEXT_CTIME_NONE
                || (now > rec.next_ctime && rec.next_ctime <= rec.last_ctime)
            {
                rec.next_ctime = next_fire(&rec.mask, rt.clock.as_ref());
                if let Ok(buf) = rt.imdb.obj_mut(row) {
                    rec.encode(buf);
                }
            }
            if earliest.map(|e| rec.next_ctime < e).unwrap_or(true) {
                earliest = Some(rec.next_ctime);
            }
        }
        self.arm_next(now, earliest);
    }

    /// Deliver a timer expiry: run every due entry, then re-arm.
    pub fn on_timer(&mut self, rt: &mut Runtime) {
        self.next_ctime = NEXT_CTIME_NONE;
        let now = rt.clock.ctime();

        let mut due = Vec::new();
        let _ = rt.imdb.class_forall(self.hentry, |db, row| {
            let rec = EntryRec::decode(db.obj(row)?);
            if rec.next_ctime != NEXT_CTIME_NONE && rec.next_ctime <= now {
                due.push(row);
            }
            Ok(ForallCtl::Continue)
        });

        for row in due {
            if let Ok(buf) = rt.imdb.obj_mut(row) {
                buf[64..68].copy_from_slice(&NEXT_CTIME_NONE.to_le_bytes());
            }
            let _ = self.run_row(rt, row);
        }
        self.set_all_next_time(rt, false);
    }

    /// Run entries subscribed to a multicast signal.
    pub fn mcast_signal(&mut self, rt: &mut Runtime, mt: u16) {
        if !(msgtype::MULTICAST_MIN..=msgtype::MULTICAST_MAX).contains(&mt) {
            return;
        }
        let signal = (mt - msgtype::MULTICAST_MIN) as u32;
        let mut hit = Vec::new();
        let _ = rt.imdb.class_forall(self.hentry, |db, row| {
            let rec = EntryRec::decode(db.obj(row)?);
            if rec.mask.mcast & (1 << signal) != 0 {
                hit.push(row);
            }
            Ok(ForallCtl::Continue)
        });
        for row in hit {
            let _ = self.run_row(rt, row);
        }
    }

    /// Earliest armed deadline in milliseconds, as seen by the driver.
    pub fn armed_deadline(&self) -> Option<u64> {
        self.timer.armed()
    }

    pub fn next_ctime(&self) -> u32 {
        self.next_ctime
    }

    fn encode_info(&self, rt: &mut Runtime, msg_out: &mut DtlvEnc) -> std::result::Result<(), SvcsError> {
        if self.next_ctime != NEXT_CTIME_NONE {
            msg_out.encode_u32(avp::NEXT_RUN_TIME, rt.clock.time_at(self.next_ctime))?;
        }
        let list = msg_out.encode_list(0, avp::ENTRY, DtlvType::Object)?;

        let mut recs = Vec::new();
        rt.imdb
            .class_forall(self.hentry, |db, row| {
                let buf = db.obj(row)?;
                let rec = EntryRec::decode(buf);
                let vd = buf[ENTRY_HDR_BYTES..ENTRY_HDR_BYTES + rec.varlen as usize].to_vec();
                recs.push((rec, vd));
                Ok(ForallCtl::Continue)
            })
            .map_err(|_| SvcsError::Internal)?;

        for (rec, vd) in recs {
            let g = msg_out.encode_group(0, avp::ENTRY)?;
            msg_out.encode_nchar(avp::ENTRY_NAME, ENTRY_NAME_LEN, &rec.name)?;
            msg_out.encode_nchar(avp::STMT_NAME, STMT_NAME_LEN, &rec.stmt_name)?;
            msg_out.raw_encode(&vd)?;
            msg_out.encode_u8(avp::ENTRY_STATE, rec.state as u8)?;
            if rec.last_ctime != 0 {
                msg_out.encode_u32(avp::LAST_RUN_TIME, rt.clock.time_at(rec.last_ctime))?;
            }
            if rec.next_ctime != NEXT_CTIME_NONE {
                msg_out.encode_u32(avp::NEXT_RUN_TIME, rt.clock.time_at(rec.next_ctime))?;
            }
            msg_out.encode_u16(avp::RUN_COUNT, rec.run_count)?;
            msg_out.encode_u16(avp::FAIL_COUNT, rec.fail_count)?;
            msg_out.group_done(g)?;
        }
        msg_out.group_done(list)?;
        Ok(())
    }
}

// Decode the AVPs of an entry-control message.
#[derive(Default)]
struct EntryMsg {
    name: Option<String>,
    stmt_name: Option<String>,
    schedule: Option<String>,
    args: Vec<u8>,
    persistent: bool,
}

fn decode_entry_msg(body: &[u8]) -> EntryMsg {
    let mut out = EntryMsg::default();
    let mut dec = DtlvDec::new(body);
    while let Ok(a) = dec.decode() {
        if a.hdr.ns != 0 && a.hdr.ns as u16 != svc_id::SCHED {
            continue;
        }
        match a.hdr.code {
            avp::PERSISTENT => out.persistent = dec.get_u8(&a).unwrap_or(0) != 0,
            avp::ENTRY_NAME => out.name = dec.get_char(&a).ok().map(str::to_string),
            avp::STMT_NAME => out.stmt_name = dec.get_char(&a).ok().map(str::to_string),
            avp::SCHEDULE_STRING => out.schedule = dec.get_char(&a).ok().map(str::to_string),
            avp::STMT_ARGUMENTS => out.args = dec.data(&a).to_vec(),
            _ => {}
        }
    }
    out
}

/// Service adapter installing the scheduler core into the runtime.
pub struct SchedService {
    timer: Option<Box<dyn Timer>>,
}

impl SchedService {
    pub fn new(timer: Box<dyn Timer>) -> Self {
        Self { timer: Some(timer) }
    }

    fn with_core<R>(
        rt: &mut Runtime,
        f: impl FnOnce(&mut SchedCore, &mut Runtime) -> std::result::Result<R, SvcsError>,
    ) -> std::result::Result<R, SvcsError> {
        let mut core = rt.sched.take().ok_or(SvcsError::NotRun)?;
        let res = f(&mut core, rt);
        rt.sched = Some(core);
        res
    }
}

impl Service for SchedService {
    fn on_start(&mut self, rt: &mut Runtime, _conf: Option<&[u8]>) -> std::result::Result<(), SvcsError> {
        if rt.sched.is_some() {
            return Err(SvcsError::ServiceError);
        }
        let timer = self.timer.take().ok_or(SvcsError::ServiceError)?;
        let core = SchedCore::start(rt, timer).map_err(|_| SvcsError::ServiceError)?;
        rt.sched = Some(core);
        Ok(())
    }

    fn on_stop(&mut self, rt: &mut Runtime) -> std::result::Result<(), SvcsError> {
        let core = rt.sched.take().ok_or(SvcsError::NotRun)?;
        core.stop(rt).map_err(|_| SvcsError::Internal)?;
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
            msgtype::INFO => Self::with_core(rt, |core, rt| core.encode_info(rt, msg_out)),

            msgtype::ADJTIME => Self::with_core(rt, |core, rt| {
                core.set_all_next_time(rt, true);
                Ok(())
            }),

            sched_msgtype::ENTRY_ADD => {
                let m = decode_entry_msg(msg_in.ok_or(SvcsError::InvalidMessage)?);
                let (Some(name), Some(stmt), Some(sched)) = (m.name, m.stmt_name, m.schedule) else {
                    return Err(SvcsError::InvalidMessage);
                };
                if name.is_empty() || stmt.is_empty() || sched.is_empty() {
                    return Err(SvcsError::InvalidMessage);
                }
                rt.reset_last_error();
                let res = Self::with_core(rt, |core, rt| {
                    Ok(core.entry_add(rt, &name, m.persistent, &sched, &stmt, &m.args))
                })?;
                if let Err(e) = res {
                    encode_service_result_ext(rt, msg_out, e as u8)?;
                }
                Ok(())
            }

            sched_msgtype::ENTRY_REMOVE | sched_msgtype::ENTRY_RUN | sched_msgtype::ENTRY_SOURCE => {
                let m = decode_entry_msg(msg_in.ok_or(SvcsError::InvalidMessage)?);
                let Some(name) = m.name else {
                    return Err(SvcsError::InvalidMessage);
                };
                rt.reset_last_error();
                let res = Self::with_core(rt, |core, rt| {
                    Ok(match mt {
                        sched_msgtype::ENTRY_REMOVE => core.entry_remove(rt, &name),
                        sched_msgtype::ENTRY_RUN => core.entry_run(rt, &name),
                        sched_msgtype::ENTRY_SOURCE => {
                            let src = core.src_get(rt, &name).and_then(|row| {
                                let fdb = rt.fdb.as_mut()?;
                                let buf = fdb.obj(row).ok()?;
                                let utime = u32::from_le_bytes(buf[30..34].try_into().unwrap());
                                let varlen = u16::from_le_bytes(buf[34..36].try_into().unwrap()) as usize;
                                Some((utime, buf[SRC_HDR_BYTES..SRC_HDR_BYTES + varlen].to_vec()))
                            });
                            match src {
                                Some((utime, vd)) => {
                                    let enc = msg_out
                                        .raw_encode(&vd)
                                        .and_then(|_| msg_out.encode_u32(common::UPDATE_TIMESTAMP, utime));
                                    enc.map_err(|_| SchedError::Internal)
                                }
                                None => Err(SchedError::EntrySrcNotExists),
                            }
                        }
                        _ => Err(SchedError::Internal),
                    })
                })?;
                if let Err(e) = res {
                    encode_service_result_ext(rt, msg_out, e as u8)?;
                }
                Ok(())
            }

            sched_msgtype::ENTRY_LIST => Self::with_core(rt, |core, rt| {
                let Some(hsrc) = core.hentry_src else {
                    let list = msg_out.encode_list(0, avp::ENTRY_SOURCE, DtlvType::Object)?;
                    msg_out.group_done(list)?;
                    return Ok(());
                };
                let mut rows = Vec::new();
                if let Some(fdb) = rt.fdb.as_mut() {
                    fdb.class_forall(hsrc, |db, row| {
                        let buf = db.obj(row)?;
                        rows.push((
                            get_name(buf, 0, ENTRY_NAME_LEN),
                            u32::from_le_bytes(buf[30..34].try_into().unwrap()),
                            u16::from_le_bytes(buf[34..36].try_into().unwrap()),
                        ));
                        Ok(ForallCtl::Continue)
                    })
                    .map_err(|_| SvcsError::Internal)?;
                }
                let list = msg_out.encode_list(0, avp::ENTRY_SOURCE, DtlvType::Object)?;
                for (name, utime, varlen) in rows {
                    let g = msg_out.encode_group(0, avp::ENTRY_SOURCE)?;
                    msg_out.encode_nchar(avp::ENTRY_NAME, ENTRY_NAME_LEN, &name)?;
                    msg_out.encode_u16(common::OBJECT_SIZE, varlen)?;
                    msg_out.encode_u32(common::UPDATE_TIMESTAMP, utime)?;
                    msg_out.group_done(g)?;
                }
                msg_out.group_done(list)?;
                Ok(())
            }),

            _ if (msgtype::MULTICAST_MIN..=msgtype::MULTICAST_MAX).contains(&mt) => {
                Self::with_core(rt, |core, rt| {
                    core.mcast_signal(rt, mt);
                    Ok(())
                })
            }

            _ => Err(SvcsError::MsgTypeInvalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imdb::{Imdb, ImdbDef};
    use crate::lsh::Shell;
    use crate::platform::sim::{SimClock, SimRng, SimTimer};

    fn runtime() -> Runtime {
        let mut rt = Runtime::new(
            Imdb::init(ImdbDef { block_size: 1024 }),
            Box::new(SimClock::new(1_700_000_000)),
            Box::new(SimRng::new(3)),
        );
        let shell = Shell::start(&mut rt.imdb).unwrap();
        rt.shell = Some(shell);
        rt
    }

    fn add_stmt(rt: &mut Runtime, name: &str, text: &str) {
        let mut shell = rt.shell.take().unwrap();
        shell.stmt_parse(&mut rt.imdb, rt.clock.as_ref(), text, name).unwrap();
        rt.shell = Some(shell);
    }

    fn tick_clock(rt: &mut Runtime, secs: u32) {
        // The runtime clock is a SimClock in these tests; rebuild with an
        // advanced base by adjusting through the trait surface.
        let now = rt.clock.ctime();
        let mut clk = SimClock::new(rt.clock.time_at(0));
        clk.tick(now + secs);
        rt.clock = Box::new(clk);
    }

    #[test]
    fn test_entry_add_and_duplicate() {
        let mut rt = runtime();
        let timer = SimTimer::new();
        let mut core = SchedCore::start(&mut rt, Box::new(timer.clone())).unwrap();
        add_stmt(&mut rt, "tick_stmt", "## ticks; ticks := ticks + 1;");

        core.entry_add(&mut rt, "tick", false, "0 */1 * * *", "tick_stmt", &[]).unwrap();
        assert!(timer.armed().is_some());
        assert_eq!(
            core.entry_add(&mut rt, "tick", false, "0 */1 * * *", "tick_stmt", &[]),
            Err(SchedError::EntryExists)
        );
    }

    #[test]
    fn test_bad_schedule_rejected() {
        let mut rt = runtime();
        let mut core = SchedCore::start(&mut rt, Box::new(SimTimer::new())).unwrap();
        assert_eq!(
            core.entry_add(&mut rt, "x", false, "not a schedule", "s", &[]),
            Err(SchedError::ParseError)
        );
    }

    #[test]
    fn test_missing_statement_reported_at_fire_time() {
        let mut rt = runtime();
        let mut core = SchedCore::start(&mut rt, Box::new(SimTimer::new())).unwrap();
        // Add-time accepts a dangling statement name.
        core.entry_add(&mut rt, "ghost", false, "* * * * *", "nope", &[]).unwrap();
        assert_eq!(core.entry_run(&mut rt, "ghost"), Err(SchedError::StmtNotExists));

        let row = core.entry_get(&mut rt, "ghost").unwrap();
        let rec = EntryRec::decode(rt.imdb.obj(row).unwrap());
        assert_eq!(rec.state, EntryState::Failed);
        assert_eq!(rec.fail_count, 1);
    }

    #[test]
    fn test_timer_fire_runs_statement() {
        let mut rt = runtime();
        let timer = SimTimer::new();
        let mut core = SchedCore::start(&mut rt, Box::new(timer.clone())).unwrap();
        add_stmt(&mut rt, "tick_stmt", "## ticks; ticks := ticks + 1;");
        core.entry_add(&mut rt, "tick", false, "0 */1 * * *", "tick_stmt", &[]).unwrap();

        let wait_ms = timer.armed().expect("armed");
        tick_clock(&mut rt, (wait_ms / 1000) as u32);
        core.on_timer(&mut rt);

        let shell = rt.shell.as_ref().unwrap();
        let goff = shell.globals.lookup(b"ticks").unwrap();
        assert_eq!(shell.globals.value(goff), 1);

        let row = core.entry_get(&mut rt, "tick").unwrap();
        let rec = EntryRec::decode(rt.imdb.obj(row).unwrap());
        assert_eq!(rec.run_count, 1);
        assert_eq!(rec.state, EntryState::None);
        // Re-armed for the next minute.
        assert_ne!(rec.next_ctime, NEXT_CTIME_NONE);
    }

    #[test]
    fn test_entry_remove() {
        let mut rt = runtime();
        let mut core = SchedCore::start(&mut rt, Box::new(SimTimer::new())).unwrap();
        add_stmt(&mut rt, "s", "print(1);");
        core.entry_add(&mut rt, "e", false, "* * * * *", "s", &[]).unwrap();
        core.entry_remove(&mut rt, "e").unwrap();
        assert_eq!(core.entry_run(&mut rt, "e"), Err(SchedError::EntryNotExists));
        assert_eq!(core.entry_remove(&mut rt, "e"), Err(SchedError::EntryNotExists));
    }

    #[test]
    fn test_mcast_signal_runs_entry() {
        let mut rt = runtime();
        let mut core = SchedCore::start(&mut rt, Box::new(SimTimer::new())).unwrap();
        add_stmt(&mut rt, "sig_stmt", "## sigs; sigs := sigs + 1;");
        core.entry_add(&mut rt, "onsig", false, "@2 * * * * *", "sig_stmt", &[]).unwrap();

        core.mcast_signal(&mut rt, msgtype::MULTICAST_MIN + 2);
        core.mcast_signal(&mut rt, msgtype::MULTICAST_MIN + 3); // different signal

        let shell = rt.shell.as_ref().unwrap();
        let goff = shell.globals.lookup(b"sigs").unwrap();
        assert_eq!(shell.globals.value(goff), 1);
    }
}
