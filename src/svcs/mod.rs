// Service catalog and control.
//
// Provides the common API for background services: installation, start and
// stop transitions, configuration blobs, and synchronous message routing
// (direct, broadcast, and the controller's own INFO/CONTROL surface).
//
// Registry rows live in a dedicated storage class so the control channel
// can enumerate them; the handler half of each service is a trait object
// held next to the registry. Cross-cutting engine state (shell, udpctl
// core, scheduler core) lives in `Runtime`, which is threaded through
// every entry point instead of module statics.

use tracing::{error, info, warn};

use crate::dtlv::codes::{common, svc_id, svcs};
use crate::dtlv::{DtlvDec, DtlvEnc, DtlvType, NsCode};
use crate::error::SvcsError;
use crate::imdb::media::FileDb;
use crate::imdb::{ClassDef, ClassId, ForallCtl, Imdb, RowRef};
use crate::platform::{Clock, Flash, Rng};

pub type Result<T> = std::result::Result<T, SvcsError>;

pub const SERVICE_NAME_LEN: usize = 16;

const CLS_DATA: &str = "svcs$data";
const CLS_SERVICE: &str = "svcs$service";
const CLS_CONFIG: &str = "svcs$conf";

const SVC_REC_BYTES: u16 = 28;

/// Service lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcState {
    Stopped = 0,
    Running = 1,
    Failed = 2,
    Stopping = 3,
    Starting = 4,
}

impl SvcState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SvcState::Running,
            2 => SvcState::Failed,
            3 => SvcState::Stopping,
            4 => SvcState::Starting,
            _ => SvcState::Stopped,
        }
    }
}

/// System message types. Services define their own types from 10 up;
/// the multicast window is routed to schedule signal masks.
pub mod msgtype {
    pub const INFO: u16 = 1;
    pub const CONTROL: u16 = 2;
    pub const CONFIG_GET: u16 = 3;
    pub const CONFIG_SET: u16 = 4;
    pub const NETWORK: u16 = 5;
    pub const ADJTIME: u16 = 6;
    pub const SYSTEM_START: u16 = 7;
    pub const SYSTEM_STOP: u16 = 8;

    pub const MULTICAST_MIN: u16 = 100;
    pub const MULTICAST_MAX: u16 = 131;
}

/// Shared node state threaded through every service entry point.
pub struct Runtime {
    pub imdb: Imdb,
    pub fdb: Option<FileDb>,
    pub flash: Option<Box<dyn Flash>>,
    pub clock: Box<dyn Clock>,
    pub rng: Box<dyn Rng>,
    /// Installed by the shell service on start.
    pub shell: Option<crate::lsh::Shell>,
    /// Installed by the udpctl service on start.
    pub udpctl: Option<crate::udpctl::UdpctlCore>,
    /// Installed by the scheduler service on start.
    pub sched: Option<crate::sched::SchedCore>,
    /// Broadcasts queued by handlers that cannot reach the controller
    /// mid-dispatch; the driver drains them after each event.
    pub pending_broadcasts: Vec<u16>,
    last_error: String,
}

impl Runtime {
    pub fn new(imdb: Imdb, clock: Box<dyn Clock>, rng: Box<dyn Rng>) -> Self {
        Self {
            imdb,
            fdb: None,
            flash: None,
            clock,
            rng,
            shell: None,
            udpctl: None,
            sched: None,
            pending_broadcasts: Vec::new(),
            last_error: String::new(),
        }
    }

    /// Queue a broadcast for the driver to deliver after this dispatch.
    pub fn post_broadcast(&mut self, mt: u16) {
        self.pending_broadcasts.push(mt);
    }

    pub fn set_last_error(&mut self, msg: String) {
        self.last_error = msg;
        self.last_error.truncate(84);
    }

    pub fn reset_last_error(&mut self) {
        self.last_error.clear();
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }
}

/// Handler half of a service.
pub trait Service {
    fn on_start(&mut self, rt: &mut Runtime, conf: Option<&[u8]>) -> Result<()>;

    fn on_stop(&mut self, rt: &mut Runtime) -> Result<()>;

    fn on_message(
        &mut self,
        rt: &mut Runtime,
        orig: u16,
        msgtype: u16,
        msg_in: Option<&[u8]>,
        msg_out: &mut DtlvEnc,
    ) -> Result<()>;

    fn on_cfgupd(&mut self, _rt: &mut Runtime, _conf: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Registry row snapshot.
#[derive(Debug, Clone)]
pub struct SvcInfo {
    pub service_id: u16,
    pub name: String,
    pub enabled: bool,
    pub state: SvcState,
    pub errcode: u8,
    pub state_time: u32,
}

impl SvcInfo {
    fn decode(buf: &[u8]) -> Self {
        let name_end = buf[12..28].iter().position(|&b| b == 0).unwrap_or(16);
        Self {
            service_id: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            enabled: buf[2] != 0,
            state: SvcState::from_u8(buf[3]),
            errcode: buf[4],
            state_time: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            name: String::from_utf8_lossy(&buf[12..12 + name_end]).into_owned(),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.service_id.to_le_bytes());
        buf[2] = self.enabled as u8;
        buf[3] = self.state as u8;
        buf[4] = self.errcode;
        buf[5..8].fill(0);
        buf[8..12].copy_from_slice(&self.state_time.to_le_bytes());
        buf[12..28].fill(0);
        let n = self.name.len().min(SERVICE_NAME_LEN);
        buf[12..12 + n].copy_from_slice(&self.name.as_bytes()[..n]);
    }
}

struct SvcSlot {
    service_id: u16,
    handler: Option<Box<dyn Service>>,
}

/// The controller: registry, lifecycle and message routing.
pub struct ServiceController {
    pub hdata: ClassId,
    hsvcs: ClassId,
    hconf: ClassId,
    handlers: Vec<SvcSlot>,
}

impl ServiceController {
    /// Create the backing classes and start the controller.
    pub fn start(rt: &mut Runtime) -> Result<Self> {
        info!("svcs starting");
        if rt.imdb.class_find(CLS_SERVICE).is_some() {
            warn!("svcs already run");
            return Err(SvcsError::AlreadyRun);
        }
        let hdata = rt.imdb.class_create(ClassDef::variable(CLS_DATA, 1, 2))?;
        let hsvcs = rt.imdb.class_create(ClassDef::fixed(CLS_SERVICE, 1, 1, SVC_REC_BYTES))?;
        let hconf = rt.imdb.class_create(ClassDef::variable(CLS_CONFIG, 8, 4))?;
        info!("svcs started");
        Ok(Self { hdata, hsvcs, hconf, handlers: Vec::new() })
    }

    /// Stop every running service and destroy the backing classes.
    pub fn stop(mut self, rt: &mut Runtime) -> Result<()> {
        info!("svcs stopping");
        let rows = self.find_rows(rt, |_| true)?;
        for row in rows {
            let inf = SvcInfo::decode(rt.imdb.obj(row)?);
            if inf.state == SvcState::Running {
                let _ = self.svc_stop_row(rt, row);
            }
        }
        rt.imdb.class_destroy(self.hsvcs)?;
        rt.imdb.class_destroy(self.hconf)?;
        rt.imdb.class_destroy(self.hdata)?;
        info!("svcs stopped");
        Ok(())
    }

    fn find_rows<F>(&self, rt: &mut Runtime, mut pred: F) -> Result<Vec<RowRef>>
    where
        F: FnMut(&SvcInfo) -> bool,
    {
        let mut rows = Vec::new();
        rt.imdb
            .class_forall(self.hsvcs, |db, row| {
                let inf = SvcInfo::decode(db.obj(row)?);
                if pred(&inf) {
                    rows.push(row);
                }
                Ok(ForallCtl::Continue)
            })
            .map_err(SvcsError::from)?;
        Ok(rows)
    }

    fn find_one(&self, rt: &mut Runtime, service_id: u16, name: Option<&str>) -> Result<RowRef> {
        let rows = self.find_rows(rt, |inf| {
            (service_id == 0 || inf.service_id == service_id)
                && name.map(|n| inf.name == n).unwrap_or(true)
        })?;
        rows.into_iter().next().ok_or(SvcsError::NotExists)
    }

    fn conf_bytes(&self, rt: &mut Runtime, service_id: u16) -> Result<Option<Vec<u8>>> {
        let mut found = None;
        rt.imdb
            .class_forall(self.hconf, |db, row| {
                let data = db.obj(row)?;
                if data.len() >= 2 && u16::from_le_bytes(data[0..2].try_into().unwrap()) == service_id {
                    found = Some(data[4..].to_vec());
                    return Ok(ForallCtl::Break);
                }
                Ok(ForallCtl::Continue)
            })
            .map_err(SvcsError::from)?;
        Ok(found)
    }

    /// Install a service. An enabled service starts immediately.
    pub fn install(
        &mut self,
        rt: &mut Runtime,
        service_id: u16,
        name: &str,
        enabled: bool,
        handler: Box<dyn Service>,
    ) -> Result<()> {
        info!(name, service_id, "service installing");
        if self.find_one(rt, 0, Some(name)).is_ok() || self.find_one(rt, service_id, None).is_ok() {
            warn!(name, service_id, "already installed");
            return Err(SvcsError::AlreadyExists);
        }

        let row = rt.imdb.insert(self.hsvcs, 0)?;
        let inf = SvcInfo {
            service_id,
            name: name.to_string(),
            enabled,
            state: SvcState::Stopped,
            errcode: 0,
            state_time: rt.clock.ctime(),
        };
        inf.encode(rt.imdb.obj_mut(row)?);
        self.handlers.push(SvcSlot { service_id, handler: Some(handler) });

        if enabled {
            self.svc_start_row(rt, row)?;
        }
        Ok(())
    }

    /// Uninstall by name, stopping the service first if needed.
    pub fn uninstall(&mut self, rt: &mut Runtime, name: &str) -> Result<()> {
        let row = match self.find_one(rt, 0, Some(name)) {
            Ok(r) => r,
            Err(SvcsError::NotExists) => {
                warn!(name, "not installed");
                return Err(SvcsError::NotExists);
            }
            Err(e) => return Err(e),
        };
        let inf = SvcInfo::decode(rt.imdb.obj(row)?);
        if inf.state == SvcState::Running {
            self.svc_stop_row(rt, row)?;
        }
        rt.imdb.delete(row)?;
        self.handlers.retain(|s| s.service_id != inf.service_id);
        info!(name, "service uninstalled");
        Ok(())
    }

    fn take_handler(&mut self, service_id: u16) -> Option<Box<dyn Service>> {
        self.handlers
            .iter_mut()
            .find(|s| s.service_id == service_id)
            .and_then(|s| s.handler.take())
    }

    fn put_handler(&mut self, service_id: u16, handler: Box<dyn Service>) {
        if let Some(slot) = self.handlers.iter_mut().find(|s| s.service_id == service_id) {
            slot.handler = Some(handler);
        }
    }

    fn svc_start_row(&mut self, rt: &mut Runtime, row: RowRef) -> Result<()> {
        let mut inf = SvcInfo::decode(rt.imdb.obj(row)?);
        match inf.state {
            SvcState::Stopped | SvcState::Failed => {}
            SvcState::Running => return Err(SvcsError::AlreadyRun),
            _ => return Err(SvcsError::ServiceError),
        }

        let conf = self.conf_bytes(rt, inf.service_id)?;
        inf.state = SvcState::Starting;
        inf.encode(rt.imdb.obj_mut(row)?);

        let mut handler = self.take_handler(inf.service_id).ok_or(SvcsError::Internal)?;
        let res = handler.on_start(rt, conf.as_deref());
        self.put_handler(inf.service_id, handler);

        inf.errcode = res.as_ref().err().map(|e| *e as u8).unwrap_or(0);
        inf.state = if res.is_ok() { SvcState::Running } else { SvcState::Failed };
        inf.state_time = rt.clock.ctime();
        inf.encode(rt.imdb.obj_mut(row)?);
        if res.is_ok() {
            info!(name = %inf.name, "service started");
        } else {
            error!(name = %inf.name, "service failed to run");
        }
        res
    }

    fn svc_stop_row(&mut self, rt: &mut Runtime, row: RowRef) -> Result<()> {
        let mut inf = SvcInfo::decode(rt.imdb.obj(row)?);
        match inf.state {
            SvcState::Stopped | SvcState::Failed => return Err(SvcsError::NotRun),
            SvcState::Running => {}
            _ => return Err(SvcsError::ServiceError),
        }

        inf.state = SvcState::Stopping;
        inf.encode(rt.imdb.obj_mut(row)?);

        let mut handler = self.take_handler(inf.service_id).ok_or(SvcsError::Internal)?;
        let res = handler.on_stop(rt);
        self.put_handler(inf.service_id, handler);

        inf.errcode = res.as_ref().err().map(|e| *e as u8).unwrap_or(0);
        inf.state = if res.is_ok() { SvcState::Stopped } else { SvcState::Failed };
        inf.state_time = rt.clock.ctime();
        inf.encode(rt.imdb.obj_mut(row)?);
        if res.is_ok() {
            info!(name = %inf.name, "service stopped");
        } else {
            error!(name = %inf.name, "service failed to stop");
        }
        res
    }

    /// Start by id or name; idempotent errors per state.
    pub fn service_start(&mut self, rt: &mut Runtime, service_id: u16, name: Option<&str>) -> Result<()> {
        let row = self.find_one(rt, service_id, name)?;
        self.svc_start_row(rt, row)
    }

    /// Stop by id or name.
    pub fn service_stop(&mut self, rt: &mut Runtime, service_id: u16, name: Option<&str>) -> Result<()> {
        let row = self.find_one(rt, service_id, name)?;
        self.svc_stop_row(rt, row)
    }

    /// Registry snapshot in registration order.
    pub fn info(&self, rt: &mut Runtime) -> Result<Vec<SvcInfo>> {
        let rows = self.find_rows(rt, |_| true)?;
        rows.into_iter()
            .map(|row| Ok(SvcInfo::decode(rt.imdb.obj(row)?)))
            .collect()
    }

    /// Store a configuration blob and push it to a running service.
    pub fn conf_set(&mut self, rt: &mut Runtime, service_id: u16, conf: &[u8]) -> Result<()> {
        let mut old = None;
        rt.imdb
            .class_forall(self.hconf, |db, row| {
                let data = db.obj(row)?;
                if data.len() >= 2 && u16::from_le_bytes(data[0..2].try_into().unwrap()) == service_id {
                    old = Some(row);
                    return Ok(ForallCtl::Break);
                }
                Ok(ForallCtl::Continue)
            })
            .map_err(SvcsError::from)?;
        if let Some(row) = old {
            rt.imdb.delete(row)?;
        }

        let row = rt.imdb.insert(self.hconf, 4 + conf.len())?;
        let buf = rt.imdb.obj_mut(row)?;
        buf[0..2].copy_from_slice(&service_id.to_le_bytes());
        buf[2..4].fill(0);
        buf[4..4 + conf.len()].copy_from_slice(conf);

        if let Ok(row) = self.find_one(rt, service_id, None) {
            let inf = SvcInfo::decode(rt.imdb.obj(row)?);
            if inf.state == SvcState::Running {
                let mut handler = self.take_handler(service_id).ok_or(SvcsError::Internal)?;
                let res = handler.on_cfgupd(rt, conf);
                self.put_handler(service_id, handler);
                res?;
            }
        }
        Ok(())
    }

    /// Stored configuration blob for a service.
    pub fn conf_get(&self, rt: &mut Runtime, service_id: u16) -> Result<Vec<u8>> {
        self.conf_bytes(rt, service_id)?.ok_or(SvcsError::NotExists)
    }

    /// Route a message: the controller itself (dest 1), broadcast (dest 0)
    /// or a single running service.
    pub fn service_message(
        &mut self,
        rt: &mut Runtime,
        orig: u16,
        dest: u16,
        msgtype: u16,
        msg_in: Option<&[u8]>,
        msg_out: &mut DtlvEnc,
    ) -> Result<()> {
        if dest == svc_id::CONTROLLER {
            return self.on_own_message(rt, orig, msgtype, msg_in, msg_out);
        }

        if dest == 0 {
            info!(msgtype, "broadcast message");
            let rows = self.find_rows(rt, |inf| inf.state == SvcState::Running)?;
            for row in rows {
                let inf = SvcInfo::decode(rt.imdb.obj(row)?);
                let Some(mut handler) = self.take_handler(inf.service_id) else { continue };
                let res = handler.on_message(rt, orig, msgtype, msg_in, msg_out);
                self.put_handler(inf.service_id, handler);
                match res {
                    Ok(()) | Err(SvcsError::MsgTypeInvalid) => {}
                    Err(e) => warn!(service_id = inf.service_id, error = %e, "message error"),
                }
            }
            return Ok(());
        }

        let row = self.find_one(rt, dest, None)?;
        let inf = SvcInfo::decode(rt.imdb.obj(row)?);
        if inf.state != SvcState::Running {
            return Err(SvcsError::NotRun);
        }
        let mut handler = self.take_handler(dest).ok_or(SvcsError::Internal)?;
        let res = handler.on_message(rt, orig, msgtype, msg_in, msg_out);
        self.put_handler(dest, handler);
        if let Err(e) = &res {
            if *e != SvcsError::MsgTypeInvalid {
                warn!(service_id = dest, error = %e, "message error");
            }
        }
        res
    }

    fn on_own_message(
        &mut self,
        rt: &mut Runtime,
        _orig: u16,
        msgtype: u16,
        msg_in: Option<&[u8]>,
        msg_out: &mut DtlvEnc,
    ) -> Result<()> {
        match msgtype {
            msgtype::INFO => self.on_msg_info(rt, msg_out),
            msgtype::CONTROL => self.on_msg_control(rt, msg_in, msg_out),
            _ => Err(SvcsError::MsgTypeInvalid),
        }
    }

    fn on_msg_info(&mut self, rt: &mut Runtime, msg_out: &mut DtlvEnc) -> Result<()> {
        let list = msg_out.encode_list(0, svcs::SERVICE, DtlvType::Object)?;
        for inf in self.info(rt)? {
            let g = msg_out.encode_group(0, svcs::SERVICE)?;
            msg_out.encode_u16(svcs::SERVICE_ID, inf.service_id)?;
            msg_out.encode_nchar(common::SERVICE_NAME, SERVICE_NAME_LEN, &inf.name)?;
            msg_out.encode_u8(svcs::SERVICE_ENABLED, inf.enabled as u8)?;
            msg_out.encode_u8(svcs::SERVICE_STATE, inf.state as u8)?;
            msg_out.group_done(g)?;
        }
        msg_out.group_done(list)?;
        Ok(())
    }

    fn on_msg_control(&mut self, rt: &mut Runtime, msg_in: Option<&[u8]>, msg_out: &mut DtlvEnc) -> Result<()> {
        let body = msg_in.ok_or(SvcsError::InvalidMessage)?;
        let mut dec = DtlvDec::new(body);
        let (groups, total) = dec
            .decode_bypath(&[NsCode::new(0, svcs::SERVICE)], 20)
            .map_err(|_| SvcsError::ServiceError)?;

        for gr in groups.iter().take(total) {
            let mut inner = dec.nested(gr);
            let g = msg_out.encode_group(0, svcs::SERVICE)?;

            let mut service_id: u16 = 0;
            let mut enabled: Option<u8> = None;
            while let Ok(avp) = inner.decode() {
                match avp.hdr.code {
                    svcs::SERVICE_ID => {
                        service_id = inner.get_u16(&avp).unwrap_or(0);
                        msg_out.encode_u16(svcs::SERVICE_ID, service_id)?;
                    }
                    common::SERVICE_NAME => {
                        if let Ok(name) = inner.get_char(&avp) {
                            msg_out.encode_char(common::SERVICE_NAME, name)?;
                        }
                    }
                    svcs::SERVICE_ENABLED => {
                        enabled = inner.get_u8(&avp).ok();
                    }
                    _ => {}
                }
            }

            if let (Some(en), true) = (enabled, service_id != 0) {
                let res = if en != 0 {
                    self.service_start(rt, service_id, None)
                } else {
                    self.service_stop(rt, service_id, None)
                };
                let code = res.err().map(|e| e as u8).unwrap_or(0);
                msg_out.encode_u8(common::RESULT_CODE, code)?;
                // Enable/disable sticks in the registry row.
                if let Ok(row) = self.find_one(rt, service_id, None) {
                    let mut inf = SvcInfo::decode(rt.imdb.obj(row)?);
                    inf.enabled = en != 0;
                    inf.encode(rt.imdb.obj_mut(row)?);
                }
            }
            msg_out.group_done(g)?;
        }
        Ok(())
    }
}

/// Append a Result-Ext-Code AVP and the stored last-error text.
pub fn encode_service_result_ext(rt: &Runtime, msg_out: &mut DtlvEnc, ext_code: u8) -> Result<()> {
    msg_out.encode_u8(common::RESULT_EXT_CODE, ext_code)?;
    if !rt.last_error().is_empty() {
        let msg = rt.last_error().to_string();
        msg_out.encode_char(common::RESULT_MESSAGE, &msg)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imdb::ImdbDef;
    use crate::platform::sim::{SimClock, SimRng};

    fn test_runtime() -> Runtime {
        Runtime::new(
            Imdb::init(ImdbDef { block_size: 1024 }),
            Box::new(SimClock::new(1_700_000_000)),
            Box::new(SimRng::new(7)),
        )
    }

    struct Probe {
        started: bool,
        messages: Vec<u16>,
    }

    impl Probe {
        fn new() -> Self {
            Self { started: false, messages: Vec::new() }
        }
    }

    impl Service for Probe {
        fn on_start(&mut self, _rt: &mut Runtime, _conf: Option<&[u8]>) -> Result<()> {
            self.started = true;
            Ok(())
        }

        fn on_stop(&mut self, _rt: &mut Runtime) -> Result<()> {
            self.started = false;
            Ok(())
        }

        fn on_message(
            &mut self,
            _rt: &mut Runtime,
            _orig: u16,
            msgtype: u16,
            _msg_in: Option<&[u8]>,
            _msg_out: &mut DtlvEnc,
        ) -> Result<()> {
            self.messages.push(msgtype);
            Ok(())
        }
    }

    #[test]
    fn test_install_starts_enabled_services() {
        let mut rt = test_runtime();
        let mut ctl = ServiceController::start(&mut rt).unwrap();
        ctl.install(&mut rt, 21, "alpha", true, Box::new(Probe::new())).unwrap();
        ctl.install(&mut rt, 22, "beta", false, Box::new(Probe::new())).unwrap();

        let info = ctl.info(&mut rt).unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].state, SvcState::Running);
        assert_eq!(info[1].state, SvcState::Stopped);
    }

    #[test]
    fn test_duplicate_install_rejected() {
        let mut rt = test_runtime();
        let mut ctl = ServiceController::start(&mut rt).unwrap();
        ctl.install(&mut rt, 21, "alpha", false, Box::new(Probe::new())).unwrap();
        assert_eq!(
            ctl.install(&mut rt, 21, "other", false, Box::new(Probe::new())),
            Err(SvcsError::AlreadyExists)
        );
        assert_eq!(
            ctl.install(&mut rt, 33, "alpha", false, Box::new(Probe::new())),
            Err(SvcsError::AlreadyExists)
        );
    }

    #[test]
    fn test_state_transitions() {
        let mut rt = test_runtime();
        let mut ctl = ServiceController::start(&mut rt).unwrap();
        ctl.install(&mut rt, 21, "alpha", false, Box::new(Probe::new())).unwrap();

        assert_eq!(ctl.service_stop(&mut rt, 21, None), Err(SvcsError::NotRun));
        ctl.service_start(&mut rt, 21, None).unwrap();
        assert_eq!(ctl.service_start(&mut rt, 21, None), Err(SvcsError::AlreadyRun));
        ctl.service_stop(&mut rt, 21, None).unwrap();
        assert_eq!(ctl.service_stop(&mut rt, 21, None), Err(SvcsError::NotRun));
    }

    #[test]
    fn test_direct_message_requires_running() {
        let mut rt = test_runtime();
        let mut ctl = ServiceController::start(&mut rt).unwrap();
        ctl.install(&mut rt, 21, "alpha", false, Box::new(Probe::new())).unwrap();

        let mut out = [0u8; 256];
        let mut enc = DtlvEnc::new(&mut out);
        assert_eq!(
            ctl.service_message(&mut rt, 0, 21, msgtype::INFO, None, &mut enc),
            Err(SvcsError::NotRun)
        );
        ctl.service_start(&mut rt, 21, None).unwrap();
        ctl.service_message(&mut rt, 0, 21, msgtype::INFO, None, &mut enc).unwrap();
    }

    #[test]
    fn test_broadcast_reaches_running_only() {
        let mut rt = test_runtime();
        let mut ctl = ServiceController::start(&mut rt).unwrap();
        ctl.install(&mut rt, 21, "alpha", true, Box::new(Probe::new())).unwrap();
        ctl.install(&mut rt, 22, "beta", false, Box::new(Probe::new())).unwrap();

        let mut out = [0u8; 256];
        let mut enc = DtlvEnc::new(&mut out);
        ctl.service_message(&mut rt, 0, 0, msgtype::ADJTIME, None, &mut enc).unwrap();
        // Only the running service took the broadcast; verified through INFO
        // encoding (beta still stopped, alpha running).
        let info = ctl.info(&mut rt).unwrap();
        assert_eq!(info[0].state, SvcState::Running);
        assert_eq!(info[1].state, SvcState::Stopped);
    }

    #[test]
    fn test_control_message_toggles_service() {
        let mut rt = test_runtime();
        let mut ctl = ServiceController::start(&mut rt).unwrap();
        ctl.install(&mut rt, 21, "alpha", true, Box::new(Probe::new())).unwrap();
        ctl.install(&mut rt, 22, "beta", false, Box::new(Probe::new())).unwrap();

        // CONTROL: enable beta.
        let mut body = [0u8; 128];
        let mut enc = DtlvEnc::new(&mut body);
        let g = enc.encode_group(0, svcs::SERVICE).unwrap();
        enc.encode_u16(svcs::SERVICE_ID, 22).unwrap();
        enc.encode_u8(svcs::SERVICE_ENABLED, 1).unwrap();
        enc.group_done(g).unwrap();
        let len = enc.datalen();

        let mut out = [0u8; 512];
        let mut out_enc = DtlvEnc::new(&mut out);
        ctl.service_message(&mut rt, 0, svc_id::CONTROLLER, msgtype::CONTROL, Some(&body[..len]), &mut out_enc)
            .unwrap();
        let info = ctl.info(&mut rt).unwrap();
        assert_eq!(info.iter().find(|i| i.service_id == 22).unwrap().state, SvcState::Running);

        // CONTROL: disable alpha.
        let mut body = [0u8; 128];
        let mut enc = DtlvEnc::new(&mut body);
        let g = enc.encode_group(0, svcs::SERVICE).unwrap();
        enc.encode_u16(svcs::SERVICE_ID, 21).unwrap();
        enc.encode_u8(svcs::SERVICE_ENABLED, 0).unwrap();
        enc.group_done(g).unwrap();
        let len = enc.datalen();

        let mut out = [0u8; 512];
        let mut out_enc = DtlvEnc::new(&mut out);
        ctl.service_message(&mut rt, 0, svc_id::CONTROLLER, msgtype::CONTROL, Some(&body[..len]), &mut out_enc)
            .unwrap();
        let info = ctl.info(&mut rt).unwrap();
        assert_eq!(info.iter().find(|i| i.service_id == 21).unwrap().state, SvcState::Stopped);
    }

    #[test]
    fn test_conf_roundtrip() {
        let mut rt = test_runtime();
        let mut ctl = ServiceController::start(&mut rt).unwrap();
        ctl.install(&mut rt, 21, "alpha", false, Box::new(Probe::new())).unwrap();
        assert_eq!(ctl.conf_get(&mut rt, 21), Err(SvcsError::NotExists));
        ctl.conf_set(&mut rt, 21, b"blob").unwrap();
        assert_eq!(ctl.conf_get(&mut rt, 21).unwrap(), b"blob");
        ctl.conf_set(&mut rt, 21, b"other").unwrap();
        assert_eq!(ctl.conf_get(&mut rt, 21).unwrap(), b"other");
    }

    #[test]
    fn test_uninstall_stops_running() {
        let mut rt = test_runtime();
        let mut ctl = ServiceController::start(&mut rt).unwrap();
        ctl.install(&mut rt, 21, "alpha", true, Box::new(Probe::new())).unwrap();
        ctl.uninstall(&mut rt, "alpha").unwrap();
        assert!(ctl.info(&mut rt).unwrap().is_empty());
        assert_eq!(ctl.uninstall(&mut rt, "alpha"), Err(SvcsError::NotExists));
    }
}
