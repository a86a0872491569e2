// Ring-storage scenarios over the in-memory store.

use things_shell::imdb::{AccessPath, ClassDef, ForallCtl, Imdb, ImdbDef};
use things_shell::ImdbError;

fn ring_db() -> (Imdb, things_shell::imdb::ClassId) {
    let mut db = Imdb::init(ImdbDef { block_size: 1024 });
    let cls = db
        .class_create(ClassDef::fixed("evt$ring", 1, 4, 16).with_recycle().with_init_blocks(4))
        .unwrap();
    (db, cls)
}

#[test]
fn test_ring_class_absorbs_1024_inserts() {
    let (mut db, cls) = ring_db();

    for i in 0..1024u32 {
        let row = db.insert(cls, 0).expect("ring insert never fails");
        db.obj_mut(row).unwrap()[..4].copy_from_slice(&i.to_le_bytes());
    }

    // Ring capacity is one page of four 1 KiB blocks; most inserts recycled.
    let info = db.class_info(cls).unwrap();
    assert_eq!(info.pages, 1);
    assert_eq!(info.blocks, 4);
    let capacity = (1024 - 96) / 16 + 3 * ((1024 - 12) / 16);
    assert!(db.stat().block_recycle as usize >= (1024 - capacity) / ((1024 - 12) / 16));
    assert!(db.stat().slot_data >= 1024);
}

#[test]
fn test_ring_rewind_scan_is_reverse_insertion_order() {
    let (mut db, cls) = ring_db();
    for i in 0..1024u32 {
        let row = db.insert(cls, 0).unwrap();
        db.obj_mut(row).unwrap()[..4].copy_from_slice(&i.to_le_bytes());
    }

    let cur = db.query(cls, AccessPath::RecycleScanRew).unwrap();
    let mut values = Vec::new();
    loop {
        match db.fetch(&cur, 16) {
            Ok(rows) => {
                for r in &rows {
                    values.push(u32::from_le_bytes(db.obj(*r).unwrap()[..4].try_into().unwrap()));
                }
                if rows.len() < 16 {
                    break;
                }
            }
            Err(ImdbError::CursorNoDataFound) => break,
            Err(e) => panic!("{e}"),
        }
    }
    db.cursor_close(cur).unwrap();

    assert_eq!(values[0], 1023);
    for w in values.windows(2) {
        assert_eq!(w[0], w[1] + 1, "strictly newest-first");
    }
    // The scan covers the most recent complete cycle: all live records.
    assert!(values.len() > 100);
}

#[test]
fn test_free_space_accounting_invariant() {
    // After every operation the per-class free accounting matches what a
    // fresh scan of the free lists reports.
    let mut db = Imdb::init(ImdbDef { block_size: 512 });
    let cls = db.class_create(ClassDef::variable("acct$var", 4, 2)).unwrap();

    let mut live = Vec::new();
    for i in 0..24usize {
        let row = db.insert(cls, 16 + (i % 5) * 8).unwrap();
        live.push(row);
    }
    for i in (0..24).step_by(3) {
        db.delete(live[i]).unwrap();
    }

    let info = db.class_info(cls).unwrap();
    assert!(info.slots_free >= 8);
    assert!(info.slots_free_size > 0);

    // Every remaining pointer stays readable.
    for (i, row) in live.iter().enumerate() {
        if i % 3 != 0 {
            assert!(db.obj(*row).is_ok());
        }
    }

    // And a full scan sees exactly the survivors.
    let mut n = 0;
    db.class_forall(cls, |_, _| {
        n += 1;
        Ok(ForallCtl::Continue)
    })
    .unwrap();
    assert_eq!(n, 24 - 8);
}

#[test]
fn test_fixed_class_max_object_boundary() {
    let mut db = Imdb::init(ImdbDef { block_size: 512 });
    // One byte over the cap is rejected at class creation.
    assert_eq!(
        db.class_create(ClassDef::fixed("too$big", 2, 2, 512 - 96 + 4)),
        Err(ImdbError::InvalidObjSize)
    );
    let cls = db.class_create(ClassDef::fixed("max$fit", 2, 2, 512 - 96)).unwrap();
    let row = db.insert(cls, 0).unwrap();
    assert_eq!(db.obj(row).unwrap().len(), 512 - 96);
}
