// Paged slotted object store.
//
// A storage instance owns a set of classes; each class owns a chain of
// pages; each page is one contiguous byte buffer of `blocks * block_size`
// bytes. Block and slot headers live inside the page buffers (see
// `layout`), page/class bookkeeping lives out-of-band in arena-indexed
// structs, so rowids are `(class, page, block, slot)` tuples rather than
// raw pointers.
//
// Free space is managed by three LIFO free lists: class -> pages with free
// blocks -> blocks with free slots -> slot chain inside the block. There
// is no coalescing of adjacent free slots on delete.
//
// Recycling classes never fail an insert: when the free list drains, the
// allocator wraps to the next block by index (next page, block #1 wraps
// across pages) and reformats it wholesale; the wrap order defines the
// ring and a newest-first cursor can walk it backwards.

pub mod cursor;
pub mod layout;
pub mod media;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ImdbError;
use layout::*;

pub use cursor::{AccessPath, CursorHandle, ForallCtl};

pub type Result<T> = std::result::Result<T, ImdbError>;

pub const CLASS_NAME_LEN: usize = 16;
const PCT_FREE_MAX: u8 = 30;
const FIRST_PAGE_BLOCKS_MIN: u16 = 1;
const FIRST_PAGE_BLOCKS_DIV: u32 = 2;
const CURSOR_PAGE_BLOCKS: u16 = 2;
const SLOT_SKIP_COUNT_MAX: u8 = 16;

const CLS_CURSOR: &str = "imdb$cursors";

/// Arena sentinel for "no page".
pub(crate) const PAGE_NONE: u32 = u32::MAX;

/// Handle to a class inside one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassId(pub(crate) u32);

/// Storage address of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRef {
    pub class: ClassId,
    pub page: u32,
    pub block: u16,
    /// Slot start offset inside the block, in 4-byte units.
    pub slot: u16,
}

/// Physical slot layout, derived from the class options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DsType {
    Data1,
    Data2,
    Data3,
    Data4,
}

impl DsType {
    fn derive(cdef: &ClassDef) -> DsType {
        if !cdef.opt_variable {
            if cdef.opt_tx_control || !cdef.opt_recycle {
                DsType::Data2
            } else {
                DsType::Data1
            }
        } else if cdef.opt_tx_control || !cdef.opt_recycle {
            DsType::Data4
        } else {
            DsType::Data3
        }
    }

    /// Slot header + footer overhead in 4-byte units.
    fn extra_units(self) -> u16 {
        match self {
            DsType::Data1 => 0,
            DsType::Data2 => 1,
            DsType::Data3 | DsType::Data4 => 2,
        }
    }

    pub(crate) fn has_footer(self) -> bool {
        matches!(self, DsType::Data3 | DsType::Data4)
    }

    /// Payload offset from slot start, in units.
    pub(crate) fn payload_units(self) -> u16 {
        match self {
            DsType::Data1 => 0,
            _ => 1,
        }
    }
}

/// Class storage definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    pub opt_recycle: bool,
    pub opt_variable: bool,
    pub opt_tx_control: bool,
    /// Block free threshold, 0..=30.
    pub pct_free: u8,
    pub pages_max: u32,
    pub init_blocks: u16,
    pub page_blocks: u16,
    /// Fixed object size in bytes; 0 iff variable.
    pub obj_size: u16,
}

impl ClassDef {
    pub fn fixed(name: &str, pages_max: u32, page_blocks: u16, obj_size: u16) -> Self {
        Self {
            name: name.to_string(),
            opt_recycle: false,
            opt_variable: false,
            opt_tx_control: false,
            pct_free: 0,
            pages_max,
            init_blocks: 0,
            page_blocks,
            obj_size,
        }
    }

    pub fn variable(name: &str, pages_max: u32, page_blocks: u16) -> Self {
        Self {
            name: name.to_string(),
            opt_recycle: false,
            opt_variable: true,
            opt_tx_control: false,
            pct_free: 0,
            pages_max,
            init_blocks: 0,
            page_blocks,
            obj_size: 0,
        }
    }

    pub fn with_recycle(mut self) -> Self {
        self.opt_recycle = true;
        self
    }

    pub fn with_init_blocks(mut self, blocks: u16) -> Self {
        self.init_blocks = blocks;
        self
    }

    pub fn with_tx_control(mut self) -> Self {
        self.opt_tx_control = true;
        self
    }
}

/// Instance definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImdbDef {
    pub block_size: u16,
}

impl Default for ImdbDef {
    fn default() -> Self {
        Self { block_size: crate::config::IMDB_BLOCK_SIZE_DEFAULT }
    }
}

/// Allocation counters. Split/coalesce/skip statistics feed capacity
/// diagnostics over the control channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImdbStat {
    pub mem_alloc: usize,
    pub mem_free: usize,
    pub page_alloc: u32,
    pub page_free: u32,
    pub block_alloc: u32,
    pub block_init: u32,
    pub block_recycle: u32,
    pub slot_free: u32,
    pub slot_data: u32,
    pub slot_split: u32,
    pub slot_coalesce: u32,
    pub slot_skipscan: u32,
}

/// Instance-level info snapshot.
#[derive(Debug, Clone)]
pub struct ImdbInfo {
    pub def: ImdbDef,
    pub stat: ImdbStat,
    pub class_count: u32,
    pub size_class: usize,
    pub size_page: usize,
    pub size_block: usize,
    pub size_cursor: usize,
}

/// Per-class info snapshot.
#[derive(Debug, Clone, Default)]
pub struct ClassInfo {
    pub name: String,
    pub pages: u32,
    pub blocks: u32,
    pub blocks_free: u32,
    pub slots_free: u32,
    pub slots_free_size: usize,
    pub fl_skip_count: u32,
}

pub(crate) struct Page {
    pub(crate) buf: Box<[u8]>,
    pub(crate) blocks: u16,
    pub(crate) alloc_hwm: u16,
    /// First block with free space, 1-based; 0 = none.
    pub(crate) block_fl_first: u16,
    /// Next page with free blocks in the class free list.
    pub(crate) fl_next: u32,
}

impl Page {
    pub(crate) fn block(&self, idx: u16, bs: usize) -> &[u8] {
        let start = (idx as usize - 1) * bs;
        &self.buf[start..start + bs]
    }

    pub(crate) fn block_mut(&mut self, idx: u16, bs: usize) -> &mut [u8] {
        let start = (idx as usize - 1) * bs;
        &mut self.buf[start..start + bs]
    }
}

pub(crate) struct Class {
    pub(crate) cdef: ClassDef,
    pub(crate) ds_type: DsType,
    /// Fixed object size in units.
    pub(crate) obj_bsize_min: u16,
    pub(crate) pages: Vec<Page>,
    pub(crate) page_fl_first: u32,
    pub(crate) lock: u8,
}

#[derive(Default)]
struct FindCtx {
    page: u32,
    page_fl_prev: u32,
    block: u16,
    block_fl_prev: u16,
    slot: u16,
    slot_prev: u16,
}

/// One storage instance.
pub struct Imdb {
    def: ImdbDef,
    /// Largest slot payload, in units (block minus class header).
    obj_bsize_max: u16,
    stat: ImdbStat,
    classes: Vec<Option<Class>>,
    hcurs: Option<ClassId>,
}

impl Imdb {
    /// Create an instance. The block size is aligned up and clamped to the
    /// minimum; an internal class is provisioned for cursor records.
    pub fn init(mut def: ImdbDef) -> Self {
        if def.block_size == 0 {
            def.block_size = crate::config::IMDB_BLOCK_SIZE_DEFAULT;
        } else {
            def.block_size = align4(def.block_size as usize).max(crate::config::IMDB_BLOCK_SIZE_MIN as usize) as u16;
        }
        let obj_bsize_max = bptr(def.block_size as usize - CLASS_HDR_BYTES);
        debug!(block_size = def.block_size, "imdb instance init");

        let mut imdb = Self { def, obj_bsize_max, stat: ImdbStat::default(), classes: Vec::new(), hcurs: None };
        let cdef = ClassDef::fixed(CLS_CURSOR, 0, CURSOR_PAGE_BLOCKS, cursor::CURSOR_REC_BYTES as u16)
            .with_init_blocks(1);
        let hcurs = imdb.class_create(cdef).expect("cursor class");
        imdb.hcurs = Some(hcurs);
        imdb
    }

    pub fn block_size(&self) -> u16 {
        self.def.block_size
    }

    pub fn stat(&self) -> &ImdbStat {
        &self.stat
    }

    pub(crate) fn hcurs(&self) -> ClassId {
        self.hcurs.expect("instance initialised")
    }

    pub(crate) fn class(&self, id: ClassId) -> Result<&Class> {
        self.classes
            .get(id.0 as usize)
            .and_then(|c| c.as_ref())
            .ok_or(ImdbError::InvalidHandler)
    }

    fn class_mut2(classes: &mut [Option<Class>], id: ClassId) -> Result<&mut Class> {
        classes
            .get_mut(id.0 as usize)
            .and_then(|c| c.as_mut())
            .ok_or(ImdbError::InvalidHandler)
    }

    /// Create a class storage and allocate its first page.
    pub fn class_create(&mut self, mut cdef: ClassDef) -> Result<ClassId> {
        cdef.name.truncate(CLASS_NAME_LEN);
        cdef.page_blocks = cdef.page_blocks.max(FIRST_PAGE_BLOCKS_MIN);
        cdef.obj_size = align4(cdef.obj_size as usize) as u16;

        let obj_bsize_min = bptr(cdef.obj_size as usize);
        if obj_bsize_min > self.obj_bsize_max || (obj_bsize_min == 0 && !cdef.opt_variable) {
            return Err(ImdbError::InvalidObjSize);
        }

        if cdef.init_blocks == 0 {
            cdef.init_blocks = cdef.page_blocks >> FIRST_PAGE_BLOCKS_DIV;
        }
        cdef.init_blocks = cdef.init_blocks.max(FIRST_PAGE_BLOCKS_MIN);
        if cdef.opt_recycle && cdef.init_blocks <= 2 {
            return Err(ImdbError::InvalidRecycleStorage);
        }
        if cdef.pct_free > PCT_FREE_MAX {
            cdef.pct_free = PCT_FREE_MAX;
        }

        let bs = self.def.block_size as usize;
        let ds_type = DsType::derive(&cdef);

        let psize = cdef.init_blocks as usize * bs;
        self.stat.mem_alloc += psize;
        self.stat.block_alloc += cdef.init_blocks as u32;
        self.stat.page_alloc += 1;
        self.stat.block_init += 1;

        let mut cls = Class {
            ds_type,
            obj_bsize_min,
            pages: Vec::new(),
            page_fl_first: PAGE_NONE,
            lock: 3,
            cdef,
        };

        let mut buf = vec![0u8; psize].into_boxed_slice();
        block_init(&mut buf[..bs], 1, BlockType::Class);
        cls.pages.push(Page {
            buf,
            blocks: cls.cdef.init_blocks,
            alloc_hwm: 1,
            block_fl_first: 0,
            fl_next: PAGE_NONE,
        });
        block_slot_init(&mut cls, &mut self.stat, bs, 0, 1);
        fl_insert_block(&mut cls, bs, 0, 1);
        fl_insert_page(&mut cls, 0);
        cls.lock = 0;

        let id = ClassId(self.classes.len() as u32);
        info!(name = %cls.cdef.name, id = id.0, ds_type = ?cls.ds_type,
              page_blocks = cls.cdef.page_blocks, obj_size = cls.cdef.obj_size, "class created");
        self.classes.push(Some(cls));
        Ok(id)
    }

    /// Destroy a class and release every owned page.
    pub fn class_destroy(&mut self, id: ClassId) -> Result<()> {
        let cls = Self::class_mut2(&mut self.classes, id)?;
        if cls.lock != 0 {
            return Err(ImdbError::InvalidOperation);
        }
        let name = cls.cdef.name.clone();
        let mut pcnt = 0u32;
        let mut bcnt = 0u32;
        for p in &cls.pages {
            pcnt += 1;
            bcnt += p.blocks as u32;
            self.stat.page_free += 1;
            self.stat.mem_free += p.buf.len();
        }
        self.classes[id.0 as usize] = None;
        info!(name = %name, pages = pcnt, blocks = bcnt, "class destroyed");
        Ok(())
    }

    /// Definitions of every live class, in creation order.
    pub fn class_defs(&self) -> Vec<(ClassId, ClassDef)> {
        self.classes
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (ClassId(i as u32), c.cdef.clone())))
            .collect()
    }

    /// Find a class by name.
    pub fn class_find(&self, name: &str) -> Option<ClassId> {
        self.classes.iter().enumerate().find_map(|(i, c)| {
            c.as_ref()
                .filter(|c| c.cdef.name == name)
                .map(|_| ClassId(i as u32))
        })
    }

    /// Insert an object; `length` is ignored for fixed classes. Returns the
    /// storage address of the new slot, whose payload is zeroed.
    pub fn insert(&mut self, id: ClassId, length: usize) -> Result<RowRef> {
        let bs = self.def.block_size as usize;
        let obj_bsize_max = self.obj_bsize_max;
        let stat = &mut self.stat;
        let cls = Self::class_mut2(&mut self.classes, id)?;

        let extra = cls.ds_type.extra_units();
        let user_units = if cls.cdef.opt_variable {
            let u = bptr_align(length);
            if u > obj_bsize_max {
                return Err(ImdbError::InvalidObjSize);
            }
            u
        } else {
            cls.obj_bsize_min
        };
        let total = user_units + extra;

        let ctx = if cls.cdef.opt_recycle {
            slot_free_get_or_recycle(cls, stat, bs, total)
        } else {
            match slot_free_find(cls, stat, bs, total) {
                Some(ctx) => ctx,
                None => return Err(ImdbError::AllocPagesMax),
            }
        };

        let ctx = slot_free_extract(cls, stat, bs, ctx, total, extra);

        // Initialise the data slot for its layout type.
        let slot = ctx.slot;
        let block = cls.pages[ctx.page as usize].block_mut(ctx.block, bs);
        match cls.ds_type {
            DsType::Data1 => {
                block[bsize(slot)..bsize(slot + total)].fill(0);
            }
            DsType::Data2 => {
                slot_write(block, slot, SlotHdr { lock: 0, mid: slot, flags: SLOT_FLAG_DATA, len: 0 });
                block[bsize(slot + 1)..bsize(slot + total)].fill(0);
            }
            DsType::Data3 | DsType::Data4 => {
                slot_write(block, slot, SlotHdr { lock: 0, mid: slot, flags: SLOT_FLAG_DATA, len: total });
                block[bsize(slot + 1)..bsize(slot + total - 1)].fill(0);
                footer_write(block, slot + total - 1,
                             SlotFooter { tx_slot: 0, skip_count: 0, flags: SLOT_FLAG_DATA, len: total });
            }
        }

        Ok(RowRef { class: id, page: ctx.page, block: ctx.block, slot })
    }

    /// Delete an object. Recycle-only layouts (types 1 and 3) reject this.
    pub fn delete(&mut self, r: RowRef) -> Result<()> {
        let bs = self.def.block_size as usize;
        let stat = &mut self.stat;
        let cls = Self::class_mut2(&mut self.classes, r.class)?;

        let slen = match cls.ds_type {
            DsType::Data1 | DsType::Data3 => return Err(ImdbError::InvalidOperation),
            DsType::Data2 => cls.obj_bsize_min + 1,
            DsType::Data4 => {
                let block = cls.pages[r.page as usize].block(r.block, bs);
                let hdr = slot_read(block, r.slot);
                if hdr.flags != SLOT_FLAG_DATA {
                    return Err(ImdbError::InvalidOperation);
                }
                hdr.len
            }
        };

        {
            let block = cls.pages[r.page as usize].block(r.block, bs);
            if slot_read(block, r.slot).flags != SLOT_FLAG_DATA {
                return Err(ImdbError::InvalidOperation);
            }
        }

        stat.slot_free += 1;
        debug!(class = %cls.cdef.name, page = r.page, block = r.block, slot = r.slot, len = slen, "slot freed");

        let block = cls.pages[r.page as usize].block_mut(r.block, bs);
        let was_empty = {
            let prev = block_free_offset(block);
            slot_write(block, r.slot, SlotHdr { lock: 0, mid: prev, flags: SLOT_FLAG_FREE, len: slen });
            block_set_free_offset(block, r.slot);
            prev == 0
        };
        if cls.ds_type == DsType::Data4 {
            footer_write(block, r.slot + slen - 1,
                         SlotFooter { tx_slot: 0, skip_count: 0, flags: SLOT_FLAG_FREE, len: slen });
        }

        if was_empty && fl_insert_block(cls, bs, r.page, r.block) {
            fl_insert_page(cls, r.page);
        }

        // Adjacent free slots stay separate; the split counter's dual would
        // live here. TODO: coalesce neighbours to cut variable-class
        // fragmentation on long-lived stores.
        Ok(())
    }

    /// Payload length of an object.
    pub fn obj_len(&self, r: RowRef) -> Result<usize> {
        let bs = self.def.block_size as usize;
        let cls = self.class(r.class)?;
        if cls.cdef.opt_variable {
            let block = cls.pages[r.page as usize].block(r.block, bs);
            let hdr = slot_read(block, r.slot);
            if hdr.flags != SLOT_FLAG_DATA {
                return Err(ImdbError::InvalidOperation);
            }
            Ok(bsize(hdr.len - cls.ds_type.extra_units()))
        } else {
            Ok(cls.cdef.obj_size as usize)
        }
    }

    /// Borrow an object's payload.
    pub fn obj(&self, r: RowRef) -> Result<&[u8]> {
        let len = self.obj_len(r)?;
        let bs = self.def.block_size as usize;
        let cls = self.class(r.class)?;
        let pay = r.slot + cls.ds_type.payload_units();
        let block = cls.pages[r.page as usize].block(r.block, bs);
        Ok(&block[bsize(pay)..bsize(pay) + len])
    }

    /// Borrow an object's payload mutably.
    pub fn obj_mut(&mut self, r: RowRef) -> Result<&mut [u8]> {
        let len = self.obj_len(r)?;
        let bs = self.def.block_size as usize;
        let cls = Self::class_mut2(&mut self.classes, r.class)?;
        let pay = r.slot + cls.ds_type.payload_units();
        let block = cls.pages[r.page as usize].block_mut(r.block, bs);
        Ok(&mut block[bsize(pay)..bsize(pay) + len])
    }

    /// Instance statistics and structure sizes.
    pub fn info(&self) -> ImdbInfo {
        ImdbInfo {
            def: self.def.clone(),
            stat: self.stat,
            class_count: self.classes.iter().filter(|c| c.is_some()).count() as u32,
            size_class: CLASS_HDR_BYTES,
            size_page: PAGE_HDR_BYTES,
            size_block: BLOCK_HDR_BYTES,
            size_cursor: cursor::CURSOR_REC_BYTES,
        }
    }

    /// Free-space accounting for one class.
    pub fn class_info(&self, id: ClassId) -> Result<ClassInfo> {
        let bs = self.def.block_size as usize;
        let cls = self.class(id)?;
        let mut info = ClassInfo { name: cls.cdef.name.clone(), ..Default::default() };

        let mut page_idx = cls.page_fl_first;
        while page_idx != PAGE_NONE {
            let page = &cls.pages[page_idx as usize];
            info.blocks_free += (page.blocks - page.alloc_hwm) as u32;
            let mut bidx = page.block_fl_first;
            while bidx != 0 {
                let block = page.block(bidx, bs);
                let mut soff = block_free_offset(block);
                while soff != 0 {
                    let hdr = slot_read(block, soff);
                    info.slots_free += 1;
                    info.slots_free_size += bsize(hdr.len);
                    if cls.ds_type.has_footer() {
                        info.fl_skip_count += footer_read(block, soff + hdr.len - 1).skip_count as u32;
                    }
                    soff = hdr.mid;
                }
                bidx = block_fl_next(block);
            }
            page_idx = page.fl_next;
        }

        for page in &cls.pages {
            info.pages += 1;
            info.blocks += page.blocks as u32;
        }
        Ok(info)
    }

    /// Per-class info for every live class.
    pub fn class_info_all(&self) -> Vec<ClassInfo> {
        (0..self.classes.len() as u32)
            .filter_map(|i| self.class_info(ClassId(i)).ok())
            .collect()
    }
}

// -- free list primitives ----------------------------------------------------

fn fl_insert_page(cls: &mut Class, page_idx: u32) -> bool {
    let prev = cls.page_fl_first;
    cls.pages[page_idx as usize].fl_next = prev;
    cls.page_fl_first = page_idx;
    prev == PAGE_NONE
}

fn fl_insert_block(cls: &mut Class, bs: usize, page_idx: u32, block_idx: u16) -> bool {
    let page = &mut cls.pages[page_idx as usize];
    let prev = page.block_fl_first;
    block_set_fl_next(page.block_mut(block_idx, bs), prev);
    page.block_fl_first = block_idx;
    prev == 0
}

fn fl_insert_slot(block: &mut [u8], slot_off: u16) -> bool {
    let prev = block_free_offset(block);
    let mut hdr = slot_read(block, slot_off);
    hdr.mid = prev;
    slot_write(block, slot_off, hdr);
    block_set_free_offset(block, slot_off);
    prev == 0
}

// Format a block as one whole free slot.
fn block_slot_init(cls: &mut Class, stat: &mut ImdbStat, bs: usize, page_idx: u32, block_idx: u16) {
    stat.slot_free += 1;
    let has_footer = cls.ds_type.has_footer();
    let block = cls.pages[page_idx as usize].block_mut(block_idx, bs);

    let lower = bptr(block_header_bytes(block_btype(block)));
    block_set_footer_offset(block, 0);
    let upper = bptr(bs) - block_footer_offset(block);
    let len = upper - lower;

    slot_write(block, lower, SlotHdr { lock: 0, mid: 0, flags: SLOT_FLAG_FREE, len });
    if has_footer {
        footer_write(block, lower + len - 1, SlotFooter { tx_slot: 0, skip_count: 0, flags: SLOT_FLAG_FREE, len });
    }
    fl_insert_slot(block, lower);
}

// Format the next unformatted block in a page; returns its index.
fn page_block_alloc(cls: &mut Class, stat: &mut ImdbStat, bs: usize, page_idx: u32) -> u16 {
    stat.block_init += 1;
    let page = &mut cls.pages[page_idx as usize];
    page.alloc_hwm += 1;
    let bidx = page.alloc_hwm;
    block_init(page.block_mut(bidx, bs), bidx, BlockType::None);
    debug!(page = page_idx, block = bidx, "block formatted");
    block_slot_init(cls, stat, bs, page_idx, bidx);
    fl_insert_block(cls, bs, page_idx, bidx);
    bidx
}

// Allocate and format a fresh page (block #1 becomes the page header block).
fn page_alloc(cls: &mut Class, stat: &mut ImdbStat, bs: usize) -> u32 {
    let psize = cls.cdef.page_blocks as usize * bs;
    stat.mem_alloc += psize;
    stat.block_alloc += cls.cdef.page_blocks as u32;
    stat.page_alloc += 1;

    let mut buf = vec![0u8; psize].into_boxed_slice();
    block_init(&mut buf[..bs], 1, BlockType::Page);
    let page_idx = cls.pages.len() as u32;
    cls.pages.push(Page {
        buf,
        blocks: cls.cdef.page_blocks,
        alloc_hwm: 1,
        block_fl_first: 0,
        fl_next: PAGE_NONE,
    });
    debug!(class = %cls.cdef.name, page = page_idx, size = psize, "page allocated");
    block_slot_init(cls, stat, bs, page_idx, 1);
    fl_insert_block(cls, bs, page_idx, 1);
    fl_insert_page(cls, page_idx);
    page_idx
}

// Recycle the block after (page, block) in ring order and reformat it.
fn page_block_recycle(cls: &mut Class, stat: &mut ImdbStat, bs: usize, page_idx: u32, block_idx: u16) -> (u32, u16) {
    debug_assert_eq!(cls.page_fl_first, PAGE_NONE);

    let (targ_page, targ_block) = if block_idx < cls.pages[page_idx as usize].blocks {
        (page_idx, block_idx + 1)
    } else if (page_idx as usize) + 1 < cls.pages.len() {
        (page_idx + 1, 1)
    } else {
        (0, 1)
    };

    debug_assert_eq!(block_crc(cls.pages[targ_page as usize].block(targ_block, bs)), BLOCK_CRC_NONE);
    debug!(class = %cls.cdef.name, page = targ_page, block = targ_block, "block recycled");
    stat.block_recycle += 1;

    {
        let block = cls.pages[page_idx as usize].block_mut(block_idx, bs);
        block_set_fl_next(block, 0);
        block_set_free_offset(block, 0);
    }

    block_slot_init(cls, stat, bs, targ_page, targ_block);
    fl_insert_block(cls, bs, targ_page, targ_block);
    fl_insert_page(cls, targ_page);
    (targ_page, targ_block)
}

// Walk the class free lists for a slot of at least `total` units. Skipped
// variable slots age via their footer skip count and fall off the list once
// they have been passed over too often.
fn slot_free_find(cls: &mut Class, stat: &mut ImdbStat, bs: usize, total: u16) -> Option<FindCtx> {
    let mut skipscan: u32 = 0;
    let mut ctx = FindCtx { page_fl_prev: PAGE_NONE, ..Default::default() };
    let ds_type = cls.ds_type;

    let mut page_idx = cls.page_fl_first;
    while page_idx != PAGE_NONE {
        let mut bidx = cls.pages[page_idx as usize].block_fl_first;
        ctx.block_fl_prev = 0;
        while bidx != 0 {
            let found = {
                let block = cls.pages[page_idx as usize].block_mut(bidx, bs);
                let mut soff = block_free_offset(block);
                let mut sprev = 0u16;
                let mut hit = None;
                while soff != 0 {
                    let hdr = slot_read(block, soff);
                    debug_assert_eq!(hdr.flags, SLOT_FLAG_FREE);
                    if total <= hdr.len {
                        hit = Some((soff, sprev));
                        break;
                    }
                    skipscan += 1;
                    if ds_type == DsType::Data4 {
                        let mut f = footer_read(block, soff + hdr.len - 1);
                        f.skip_count = f.skip_count.saturating_add(1);
                        footer_write(block, soff + hdr.len - 1, f);
                        if f.skip_count >= SLOT_SKIP_COUNT_MAX {
                            // Worn out: unlink from the chain, keep as plain
                            // free space until the block comes around again.
                            if sprev == 0 {
                                block_set_free_offset(block, hdr.mid);
                            } else {
                                let mut ph = slot_read(block, sprev);
                                ph.mid = hdr.mid;
                                slot_write(block, sprev, ph);
                            }
                            soff = hdr.mid;
                            continue;
                        }
                    }
                    sprev = soff;
                    soff = hdr.mid;
                }
                hit
            };

            if let Some((soff, sprev)) = found {
                ctx.page = page_idx;
                ctx.block = bidx;
                ctx.slot = soff;
                ctx.slot_prev = sprev;
                stat.slot_data += 1;
                stat.slot_skipscan += skipscan;
                return Some(ctx);
            }

            ctx.block_fl_prev = bidx;
            bidx = block_fl_next(cls.pages[page_idx as usize].block(bidx, bs));
        }
        ctx.slot_prev = 0;

        // No fitting slot in formatted blocks; grow within the page.
        if cls.pages[page_idx as usize].alloc_hwm < cls.pages[page_idx as usize].blocks {
            let bidx = page_block_alloc(cls, stat, bs, page_idx);
            let block = cls.pages[page_idx as usize].block(bidx, bs);
            ctx.page = page_idx;
            ctx.block = bidx;
            ctx.block_fl_prev = 0;
            ctx.slot = block_free_offset(block);
            ctx.slot_prev = 0;
            stat.slot_data += 1;
            stat.slot_skipscan += skipscan;
            return Some(ctx);
        }

        ctx.page_fl_prev = page_idx;
        page_idx = cls.pages[page_idx as usize].fl_next;
    }

    // Grow the class with a fresh page.
    if (cls.pages.len() as u32) < cls.cdef.pages_max {
        let page_idx = page_alloc(cls, stat, bs);
        let block = cls.pages[page_idx as usize].block(1, bs);
        stat.slot_data += 1;
        stat.slot_skipscan += skipscan;
        return Some(FindCtx {
            page: page_idx,
            page_fl_prev: PAGE_NONE,
            block: 1,
            block_fl_prev: 0,
            slot: block_free_offset(block),
            slot_prev: 0,
        });
    }

    None
}

// Recycling variant: consult the head of the free list, never fail.
fn slot_free_get_or_recycle(cls: &mut Class, stat: &mut ImdbStat, bs: usize, total: u16) -> FindCtx {
    debug_assert_ne!(cls.page_fl_first, PAGE_NONE);
    let mut page_idx = cls.page_fl_first;
    let mut bidx = cls.pages[page_idx as usize].block_fl_first;
    debug_assert!(bidx > 0);

    {
        let block = cls.pages[page_idx as usize].block(bidx, bs);
        let soff = block_free_offset(block);
        let hdr = slot_read(block, soff);
        debug_assert_eq!(hdr.flags, SLOT_FLAG_FREE);
        if total <= hdr.len {
            stat.slot_data += 1;
            return FindCtx { page: page_idx, page_fl_prev: PAGE_NONE, block: bidx, block_fl_prev: 0, slot: soff, slot_prev: 0 };
        }
    }

    // Head block exhausted for this request: drop it from the lists and
    // advance the ring.
    {
        let page = &mut cls.pages[page_idx as usize];
        block_set_free_offset(page.block_mut(bidx, bs), 0);
        page.block_fl_first = 0;
    }

    if (cls.pages.len() as u32) < cls.cdef.pages_max {
        page_idx = page_alloc(cls, stat, bs);
        bidx = cls.pages[page_idx as usize].block_fl_first;
    } else if cls.pages[page_idx as usize].alloc_hwm < cls.pages[page_idx as usize].blocks {
        // The page stays at the head of the class free list.
        bidx = page_block_alloc(cls, stat, bs, page_idx);
    } else {
        cls.page_fl_first = PAGE_NONE;
        let (p, b) = page_block_recycle(cls, stat, bs, page_idx, bidx);
        page_idx = p;
        bidx = b;
    }

    let block = cls.pages[page_idx as usize].block(bidx, bs);
    stat.slot_data += 1;
    FindCtx { page: page_idx, page_fl_prev: PAGE_NONE, block: bidx, block_fl_prev: 0, slot: block_free_offset(block), slot_prev: 0 }
}

// Carve a data slot out of the found free slot; split off the remainder or
// unlink the slot, maintaining the three free-list levels.
fn slot_free_extract(cls: &mut Class, stat: &mut ImdbStat, bs: usize, ctx: FindCtx, total: u16, extra: u16) -> FindCtx {
    let has_footer = cls.ds_type.has_footer();
    let obj_min = cls.obj_bsize_min;

    let next_head: u16 = {
        let block = cls.pages[ctx.page as usize].block_mut(ctx.block, bs);
        let fs = slot_read(block, ctx.slot);
        debug_assert_eq!(fs.flags, SLOT_FLAG_FREE);

        if fs.len > total && fs.len >= total + extra {
            stat.slot_split += 1;
            let rem_off = ctx.slot + total;
            let rem_len = fs.len - total;
            slot_write(block, rem_off, SlotHdr { lock: 0, mid: 0, flags: SLOT_FLAG_FREE, len: rem_len });
            if has_footer {
                footer_write(block, ctx.slot + fs.len - 1,
                             SlotFooter { tx_slot: 0, skip_count: 0, flags: SLOT_FLAG_FREE, len: rem_len });
            }
            if rem_len >= obj_min + extra {
                let mut rh = slot_read(block, rem_off);
                rh.mid = fs.mid;
                slot_write(block, rem_off, rh);
                rem_off
            } else {
                // Too small to serve anything: leave it off the chain.
                fs.mid
            }
        } else {
            fs.mid
        }
    };

    if next_head != 0 {
        let block = cls.pages[ctx.page as usize].block_mut(ctx.block, bs);
        if ctx.slot_prev != 0 {
            let mut ph = slot_read(block, ctx.slot_prev);
            ph.mid = next_head;
            slot_write(block, ctx.slot_prev, ph);
        } else {
            block_set_free_offset(block, next_head);
        }
    } else {
        // Block exhausted: unlink it, then possibly the page, then recycle.
        let block_fl_next_v = {
            let block = cls.pages[ctx.page as usize].block_mut(ctx.block, bs);
            block_set_free_offset(block, 0);
            block_fl_next(block)
        };

        if ctx.block_fl_prev == 0 {
            if block_fl_next_v == 0 {
                cls.pages[ctx.page as usize].block_fl_first = 0;
                let page = &cls.pages[ctx.page as usize];
                if page.alloc_hwm < page.blocks {
                    page_block_alloc(cls, stat, bs, ctx.page);
                }
            } else {
                cls.pages[ctx.page as usize].block_fl_first = block_fl_next_v;
            }
        } else {
            let block = cls.pages[ctx.page as usize].block_mut(ctx.block_fl_prev, bs);
            block_set_fl_next(block, block_fl_next_v);
        }

        if cls.pages[ctx.page as usize].block_fl_first == 0 {
            let page_fl_next = cls.pages[ctx.page as usize].fl_next;
            if ctx.page_fl_prev != PAGE_NONE {
                cls.pages[ctx.page_fl_prev as usize].fl_next = page_fl_next;
            } else {
                cls.page_fl_first = page_fl_next;
                if cls.page_fl_first == PAGE_NONE && cls.cdef.opt_recycle {
                    page_block_recycle(cls, stat, bs, ctx.page, ctx.block);
                }
            }
        }
    }

    let block = cls.pages[ctx.page as usize].block_mut(ctx.block, bs);
    let mut h = slot_read(block, ctx.slot);
    h.flags = SLOT_FLAG_DATA;
    slot_write(block, ctx.slot, h);
    ctx
}
