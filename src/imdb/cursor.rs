// Cursor scans over class storage.
//
// Cursor state is itself a record in the instance's internal cursor class,
// so open cursors show up in allocation statistics. A fetch decodes the
// state, advances through the pages, and writes the state back.

use super::layout::*;
use super::{ClassId, DsType, Imdb, Result, RowRef, PAGE_NONE};
use crate::error::ImdbError;

/// Cursor record size inside the internal class.
pub(crate) const CURSOR_REC_BYTES: usize = 24;

const FETCH_BULK: usize = 10;

/// Scan strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPath {
    /// Pick FULL_SCAN or RECYCLE_SCAN_REW from the class options.
    None,
    FullScan,
    /// Forward recycle order; declared but not served.
    RecycleScan,
    /// Newest-first over a recycling class.
    RecycleScanRew,
}

/// Open cursor handle; the row address of its state record.
#[derive(Debug, Clone, Copy)]
pub struct CursorHandle(pub(crate) RowRef);

/// Callback verdict for `class_forall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForallCtl {
    Continue,
    Break,
}

#[derive(Debug, Clone, Copy)]
struct CursorState {
    class: ClassId,
    path: AccessPath,
    page: u32,
    block: u16,
    slot_offset: u16,
    fetch_recs: u32,
    otime: u32,
}

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

impl CursorState {
    fn decode(buf: &[u8]) -> Self {
        Self {
            class: ClassId(get_u32(buf, 0)),
            path: match buf[4] {
                1 => AccessPath::FullScan,
                2 => AccessPath::RecycleScan,
                3 => AccessPath::RecycleScanRew,
                _ => AccessPath::None,
            },
            block: get_u16(buf, 6),
            page: get_u32(buf, 8),
            slot_offset: get_u16(buf, 12),
            fetch_recs: get_u32(buf, 16),
            otime: get_u32(buf, 20),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.class.0.to_le_bytes());
        buf[4] = match self.path {
            AccessPath::None => 0,
            AccessPath::FullScan => 1,
            AccessPath::RecycleScan => 2,
            AccessPath::RecycleScanRew => 3,
        };
        buf[5] = 0;
        buf[6..8].copy_from_slice(&self.block.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page.to_le_bytes());
        buf[12..14].copy_from_slice(&self.slot_offset.to_le_bytes());
        buf[14..16].fill(0);
        buf[16..20].copy_from_slice(&self.fetch_recs.to_le_bytes());
        buf[20..24].copy_from_slice(&self.otime.to_le_bytes());
    }
}

// Lowest data offset in a block, in units.
fn lower_limit(block: &[u8]) -> u16 {
    bptr(block_header_bytes(block_btype(block)))
}

// One step of the forward typed slot walker. Returns the data slot start
// (None over a free slot) and the advanced offset.
fn slot_step(ds_type: DsType, obj_min: u16, block: &[u8], offset: u16) -> (Option<u16>, u16) {
    match ds_type {
        DsType::Data1 => (Some(offset), offset + obj_min),
        DsType::Data2 => {
            let hdr = slot_read(block, offset);
            if hdr.flags == SLOT_FLAG_DATA {
                (Some(offset), offset + obj_min + 1)
            } else {
                (None, offset + hdr.len)
            }
        }
        DsType::Data3 | DsType::Data4 => {
            let hdr = slot_read(block, offset);
            if hdr.flags == SLOT_FLAG_DATA {
                (Some(offset), offset + hdr.len)
            } else {
                (None, offset + hdr.len)
            }
        }
    }
}

// End boundary of the last slot in a fully-written block.
fn slot_last_boundary(ds_type: DsType, obj_min: u16, bs: usize, block: &[u8]) -> u16 {
    let upper = bptr(bs) - block_footer_offset(block);
    if ds_type.has_footer() {
        let f = footer_read(block, upper - 1);
        if f.flags == SLOT_FLAG_FREE {
            upper - f.len
        } else {
            upper
        }
    } else {
        let lower = lower_limit(block);
        upper - (upper - lower) % obj_min
    }
}

// One step of the backward walker (recycle layouts only).
fn slot_step_back(ds_type: DsType, obj_min: u16, block: &[u8], offset: u16) -> u16 {
    match ds_type {
        DsType::Data1 => offset - obj_min,
        DsType::Data3 => {
            let f = footer_read(block, offset - 1);
            debug_assert_eq!(f.flags, SLOT_FLAG_DATA);
            offset - f.len
        }
        _ => unreachable!("backward walk on non-recycle layout"),
    }
}

impl Imdb {
    /// Open a cursor over a class.
    pub fn query(&mut self, class: ClassId, path: AccessPath) -> Result<CursorHandle> {
        let hcurs = self.hcurs();
        let row = self.insert(hcurs, 0)?;

        let resolved = match path {
            AccessPath::None => {
                if self.class(class)?.cdef.opt_recycle {
                    AccessPath::RecycleScanRew
                } else {
                    AccessPath::FullScan
                }
            }
            p => p,
        };

        let state = match resolved {
            AccessPath::FullScan => CursorState {
                class,
                path: resolved,
                page: 0,
                block: 1,
                slot_offset: 0,
                fetch_recs: 0,
                otime: 0,
            },
            AccessPath::RecycleScanRew => {
                let cls = self.class(class)?;
                let bs = self.block_size() as usize;
                let page = cls.page_fl_first;
                if page == PAGE_NONE {
                    self.delete(row)?;
                    return Err(ImdbError::CursorInvalidPath);
                }
                let block = cls.pages[page as usize].block_fl_first;
                let slot_offset = block_free_offset(cls.pages[page as usize].block(block, bs));
                CursorState { class, path: resolved, page, block, slot_offset, fetch_recs: 0, otime: 0 }
            }
            AccessPath::RecycleScan | AccessPath::None => {
                self.delete(row)?;
                return Err(ImdbError::CursorInvalidPath);
            }
        };

        state.encode(self.obj_mut(row)?);
        Ok(CursorHandle(row))
    }

    /// Close a cursor and release its state record.
    pub fn cursor_close(&mut self, cur: CursorHandle) -> Result<()> {
        self.delete(cur.0)
    }

    /// Fetch up to `limit` rows. Returns `CursorNoDataFound` once the scan
    /// is exhausted and nothing was collected.
    pub fn fetch(&mut self, cur: &CursorHandle, limit: usize) -> Result<Vec<RowRef>> {
        let mut state = CursorState::decode(self.obj(cur.0)?);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let result = match state.path {
            AccessPath::FullScan => self.fetch_full_scan(&mut state, limit),
            AccessPath::RecycleScanRew => self.fetch_recycle_rew(&mut state, limit),
            _ => return Err(ImdbError::CursorInvalidPath),
        };

        state.fetch_recs += result.as_ref().map(|r| r.len()).unwrap_or(0) as u32;
        state.encode(self.obj_mut(cur.0)?);
        result
    }

    fn fetch_full_scan(&self, state: &mut CursorState, limit: usize) -> Result<Vec<RowRef>> {
        let bs = self.block_size() as usize;
        let cls = self.class(state.class)?;
        let mut rows = Vec::new();

        if state.page == PAGE_NONE {
            return Err(ImdbError::CursorNoDataFound);
        }

        loop {
            let page = &cls.pages[state.page as usize];
            while state.block <= page.alloc_hwm {
                let block = page.block(state.block, bs);
                if state.slot_offset == 0 {
                    state.slot_offset = lower_limit(block);
                }
                let upper = bptr(bs) - block_footer_offset(block);
                while state.slot_offset < upper {
                    let (data, next) = slot_step(cls.ds_type, cls.obj_bsize_min, block, state.slot_offset);
                    state.slot_offset = next;
                    if let Some(slot) = data {
                        rows.push(RowRef { class: state.class, page: state.page, block: state.block, slot });
                        if rows.len() == limit {
                            return Ok(rows);
                        }
                    }
                }
                state.block += 1;
                state.slot_offset = 0;
            }
            if state.page as usize + 1 >= cls.pages.len() {
                state.page = PAGE_NONE;
                return if rows.is_empty() { Err(ImdbError::CursorNoDataFound) } else { Ok(rows) };
            }
            state.page += 1;
            state.block = 1;
            state.slot_offset = 0;
        }
    }

    fn fetch_recycle_rew(&self, state: &mut CursorState, limit: usize) -> Result<Vec<RowRef>> {
        let bs = self.block_size() as usize;
        let cls = self.class(state.class)?;
        let mut rows = Vec::new();

        if state.page == PAGE_NONE {
            return Err(ImdbError::CursorNoDataFound);
        }

        loop {
            while state.block > 0 {
                let page = &cls.pages[state.page as usize];
                if state.block > page.alloc_hwm {
                    // Unformatted tail of a page that has not filled yet.
                    state.block -= 1;
                    state.slot_offset = 0;
                    continue;
                }
                let block = page.block(state.block, bs);
                if state.slot_offset == 0 {
                    if block_free_offset(block) != 0 {
                        // Ring storage fills whole blocks; a block with free
                        // space marks the end of the completed cycle.
                        state.page = PAGE_NONE;
                        return if rows.is_empty() { Err(ImdbError::CursorNoDataFound) } else { Ok(rows) };
                    }
                    state.slot_offset = slot_last_boundary(cls.ds_type, cls.obj_bsize_min, bs, block);
                }
                let lower = lower_limit(block);
                while state.slot_offset > lower {
                    state.slot_offset = slot_step_back(cls.ds_type, cls.obj_bsize_min, block, state.slot_offset);
                    rows.push(RowRef {
                        class: state.class,
                        page: state.page,
                        block: state.block,
                        slot: state.slot_offset,
                    });
                    if rows.len() == limit {
                        return Ok(rows);
                    }
                }
                state.block -= 1;
                state.slot_offset = 0;
            }
            state.page = if state.page == 0 { cls.pages.len() as u32 - 1 } else { state.page - 1 };
            state.block = cls.pages[state.page as usize].alloc_hwm;
            state.slot_offset = 0;
        }
    }

    /// Query + bulk fetch + close, feeding each row to the callback.
    pub fn class_forall<F>(&mut self, class: ClassId, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Imdb, RowRef) -> Result<ForallCtl>,
    {
        let cur = self.query(class, AccessPath::None)?;
        let res = self.forall_inner(&cur, &mut f);
        let close_res = self.cursor_close(cur);
        res?;
        close_res
    }

    fn forall_inner<F>(&mut self, cur: &CursorHandle, f: &mut F) -> Result<()>
    where
        F: FnMut(&mut Imdb, RowRef) -> Result<ForallCtl>,
    {
        loop {
            let rows = match self.fetch(cur, FETCH_BULK) {
                Ok(rows) => rows,
                Err(ImdbError::CursorNoDataFound) => return Ok(()),
                Err(e) => return Err(e),
            };
            let exhausted = rows.len() < FETCH_BULK;
            for row in rows {
                match f(self, row) {
                    Ok(ForallCtl::Continue) => {}
                    Ok(ForallCtl::Break) => return Ok(()),
                    Err(_) => return Err(ImdbError::CursorForallFunc),
                }
            }
            if exhausted {
                return Ok(());
            }
        }
    }

    /// Row count convenience over a full scan.
    pub fn class_count(&mut self, class: ClassId) -> Result<u32> {
        let mut n = 0u32;
        self.class_forall(class, |_, _| {
            n += 1;
            Ok(ForallCtl::Continue)
        })?;
        Ok(n)
    }
}
