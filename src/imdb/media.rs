// Flash-backed storage mirror.
//
// The first flash sector holds a fixed header; the rest of the area is
// split into two mirrored halves. `flush` bumps the change number and
// writes a full snapshot of the instance into the half selected by
// `scn % 2`, so a crash mid-write always leaves the previous half intact.
// `open` re-initialises the area when the header CRC does not verify.
//
// This is a simple mirrored append area, not a recovery log: the snapshot
// is the whole catalog plus record images, serialized with bincode.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::cursor::ForallCtl;
use super::{ClassDef, ClassId, Imdb, ImdbDef, Result};
use crate::error::ImdbError;
use crate::platform::{crc16, Flash};

const FILE_HEADER_VERSION: u16 = 0x0101;
const FILE_HEADER_BYTES: usize = 20;
/// Header area reservation at the start of the user partition.
const FILE_HEADER_AREA: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileHeader {
    version: u16,
    crc16: u16,
    scn: u32,
    block_size: u16,
    class_count: u16,
    file_size: u32,
    file_hwm: u32,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_BYTES] {
        let mut buf = [0u8; FILE_HEADER_BYTES];
        buf[0..2].copy_from_slice(&self.version.to_le_bytes());
        buf[2..4].copy_from_slice(&self.crc16.to_le_bytes());
        buf[4..8].copy_from_slice(&self.scn.to_le_bytes());
        buf[8..10].copy_from_slice(&self.block_size.to_le_bytes());
        buf[10..12].copy_from_slice(&self.class_count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.file_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.file_hwm.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            version: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            crc16: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
            scn: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            block_size: u16::from_le_bytes(buf[8..10].try_into().unwrap()),
            class_count: u16::from_le_bytes(buf[10..12].try_into().unwrap()),
            file_size: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            file_hwm: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        }
    }

    fn checksum(&self) -> u16 {
        let mut probe = *self;
        probe.crc16 = 0;
        crc16(&probe.encode())
    }
}

#[derive(Serialize, Deserialize)]
struct SnapClass {
    def: ClassDef,
    records: Vec<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Default)]
struct Snapshot {
    classes: Vec<SnapClass>,
}

/// A storage instance whose content survives reboot through a flash mirror.
pub struct FileDb {
    imdb: Imdb,
    scn: u32,
    /// Usable bytes per mirror half.
    half_size: usize,
}

impl FileDb {
    /// Open (or re-initialise) the flash area and load the latest snapshot.
    pub fn open(flash: &mut dyn Flash, def: ImdbDef) -> Self {
        let mut imdb = Imdb::init(def);
        // Halves stay sector-aligned so erasing one never clips the other.
        let half_size = ((flash.size() - FILE_HEADER_AREA) / 2) & !(flash.sector_size() - 1);

        let mut raw = [0u8; FILE_HEADER_BYTES];
        flash.read(0, &mut raw);
        let hdr = FileHeader::decode(&raw);

        if hdr.checksum() != hdr.crc16
            || hdr.version != FILE_HEADER_VERSION
            || hdr.file_size as usize > half_size
        {
            warn!(size = half_size, "media header crc error, re-initialising");
            let db = Self { imdb, scn: 1, half_size };
            db.write_header(flash, 0);
            return db;
        }

        info!(scn = hdr.scn, size = hdr.file_size, "media read");
        if hdr.file_hwm > 0 {
            let mut body = vec![0u8; hdr.file_hwm as usize];
            flash.read(Self::half_base(hdr.scn, half_size), &mut body);
            match bincode::serde::decode_from_slice::<Snapshot, _>(&body, bincode::config::standard()) {
                Ok((snap, _)) => {
                    for sc in snap.classes {
                        let opt_variable = sc.def.opt_variable;
                        match imdb.class_create(sc.def) {
                            Ok(cls) => {
                                for rec in sc.records {
                                    let len = if opt_variable { rec.len() } else { 0 };
                                    if let Ok(row) = imdb.insert(cls, len) {
                                        let dst = imdb.obj_mut(row).expect("fresh row");
                                        let n = dst.len().min(rec.len());
                                        dst[..n].copy_from_slice(&rec[..n]);
                                    }
                                }
                            }
                            Err(e) => warn!(error = %e, "media class restore failed"),
                        }
                    }
                }
                Err(e) => warn!(error = %e, "media snapshot decode failed"),
            }
        }
        Self { imdb, scn: hdr.scn, half_size }
    }

    fn half_base(scn: u32, half_size: usize) -> usize {
        FILE_HEADER_AREA + (scn % 2) as usize * half_size
    }

    fn write_header(&self, flash: &mut dyn Flash, file_hwm: u32) {
        let mut hdr = FileHeader {
            version: FILE_HEADER_VERSION,
            crc16: 0,
            scn: self.scn,
            block_size: self.imdb.block_size(),
            class_count: self.user_classes().len() as u16,
            file_size: self.half_size as u32,
            file_hwm,
        };
        hdr.crc16 = hdr.checksum();
        flash.erase_sector(0);
        flash.write(0, &hdr.encode());
    }

    fn user_classes(&self) -> Vec<(ClassId, ClassDef)> {
        self.imdb
            .class_defs()
            .into_iter()
            .filter(|(_, def)| !def.name.starts_with("imdb$"))
            .collect()
    }

    /// Serialise the whole instance into the next mirror half.
    pub fn flush(&mut self, flash: &mut dyn Flash) -> Result<()> {
        let mut snap = Snapshot::default();
        for (cls, def) in self.user_classes() {
            let mut records = Vec::new();
            self.imdb.class_forall(cls, |db, row| {
                records.push(db.obj(row)?.to_vec());
                Ok(ForallCtl::Continue)
            })?;
            snap.classes.push(SnapClass { def, records });
        }

        let body = bincode::serde::encode_to_vec(&snap, bincode::config::standard())
            .map_err(|_| ImdbError::Internal)?;
        if body.len() > self.half_size {
            return Err(ImdbError::AllocPagesMax);
        }

        self.scn += 1;
        let base = Self::half_base(self.scn, self.half_size);
        let sector = flash.sector_size();
        let first = base / sector;
        let last = (base + body.len().max(1) - 1) / sector;
        for s in first..=last {
            flash.erase_sector(s);
        }
        flash.write(base, &body);
        self.write_header(flash, body.len() as u32);
        info!(scn = self.scn, bytes = body.len(), "media flushed");
        Ok(())
    }

    pub fn scn(&self) -> u32 {
        self.scn
    }
}

impl std::ops::Deref for FileDb {
    type Target = Imdb;

    fn deref(&self) -> &Imdb {
        &self.imdb
    }
}

impl std::ops::DerefMut for FileDb {
    fn deref_mut(&mut self) -> &mut Imdb {
        &mut self.imdb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::MemFlash;

    fn open_db(flash: &mut MemFlash) -> FileDb {
        FileDb::open(flash, ImdbDef { block_size: 512 })
    }

    #[test]
    fn test_fresh_open_initialises_header() {
        let mut flash = MemFlash::new(64 * 1024, 4096);
        let db = open_db(&mut flash);
        assert_eq!(db.scn(), 1);
        // Second open parses the header it just wrote.
        let db2 = open_db(&mut flash);
        assert_eq!(db2.scn(), 1);
    }

    #[test]
    fn test_flush_and_reload_records() {
        let mut flash = MemFlash::new(64 * 1024, 4096);
        let mut db = open_db(&mut flash);
        let cls = db.class_create(ClassDef::variable("sched$src", 2, 2)).unwrap();
        let row = db.insert(cls, 12).unwrap();
        db.obj_mut(row).unwrap()[..5].copy_from_slice(b"entry");
        db.flush(&mut flash).unwrap();
        assert_eq!(db.scn(), 2);

        let mut db2 = open_db(&mut flash);
        assert_eq!(db2.scn(), 2);
        let cls2 = db2.class_find("sched$src").expect("class restored");
        let mut found = Vec::new();
        db2.class_forall(cls2, |db, row| {
            found.push(db.obj(row)?.to_vec());
            Ok(ForallCtl::Continue)
        })
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(&found[0][..5], b"entry");
    }

    #[test]
    fn test_mirror_alternates_halves() {
        let mut flash = MemFlash::new(64 * 1024, 4096);
        let mut db = open_db(&mut flash);
        db.class_create(ClassDef::variable("lsh$src", 2, 2)).unwrap();
        db.flush(&mut flash).unwrap();
        let scn_a = db.scn();
        db.flush(&mut flash).unwrap();
        assert_eq!(db.scn(), scn_a + 1);
        // Reload still sees a consistent copy.
        let db2 = open_db(&mut flash);
        assert_eq!(db2.scn(), scn_a + 1);
        assert!(db2.class_find("lsh$src").is_some());
    }

    #[test]
    fn test_corrupt_header_reinitialises() {
        let mut flash = MemFlash::new(64 * 1024, 4096);
        let mut db = open_db(&mut flash);
        db.class_create(ClassDef::variable("x$y", 2, 2)).unwrap();
        db.flush(&mut flash).unwrap();
        flash.write(2, &[0xAB, 0xCD]); // clobber the stored crc
        let db2 = open_db(&mut flash);
        assert_eq!(db2.scn(), 1);
        assert!(db2.class_find("x$y").is_none());
    }
}
