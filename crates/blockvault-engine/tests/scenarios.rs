//! End-to-end engine scenarios: write/sync/restart round-trips, overlay
//! reads, rollback, delete, sync ordering, and space accounting.

use blockvault_engine::{
    Engine, EngineConfig, ListParams, ObjectId, ObjectVersion, Operation,
};
use bytes::Bytes;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

const BLOCK: u32 = 131072;

fn test_config(dir: &Path) -> EngineConfig {
    let mut cfg = EngineConfig::with_devices(
        dir.join("data.bin"),
        dir.join("meta.bin"),
        dir.join("journal.bin"),
    );
    cfg.data.size = 64 * u64::from(BLOCK); // 64 blocks
    cfg.meta.size = 16 * 4096;
    cfg.journal.size = 1 << 20;
    cfg.direct_io = false; // tempdirs may sit on tmpfs
    cfg.flusher_count = 2;
    cfg.journal_sector_buffer_count = 8;
    cfg.ring_depth = 64;
    cfg
}

fn fresh_engine(dir: &Path) -> Engine {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let cfg = test_config(dir);
    Engine::format(&cfg).unwrap();
    Engine::open(cfg).unwrap()
}

fn reopen(dir: &Path) -> Engine {
    Engine::open(test_config(dir)).unwrap()
}

fn do_write(engine: &mut Engine, oid: ObjectId, offset: u32, fill: u8, len: u32) -> i64 {
    let result = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&result);
    engine.enqueue(Operation::write(
        oid,
        0,
        offset,
        Bytes::from(vec![fill; len as usize]),
        move |op| *captured.borrow_mut() = Some(op.retval),
    ));
    engine.run();
    result.take().expect("write completed")
}

fn do_sync(engine: &mut Engine) -> i64 {
    let result = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&result);
    engine.enqueue(Operation::sync(move |op| {
        *captured.borrow_mut() = Some(op.retval)
    }));
    engine.run();
    result.take().expect("sync completed")
}

fn do_read(engine: &mut Engine, oid: ObjectId, offset: u32, len: u32) -> (i64, Vec<u8>) {
    let result = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&result);
    engine.enqueue(Operation::read(oid, offset, len, move |op| {
        *captured.borrow_mut() = Some((op.retval, std::mem::take(&mut op.data)))
    }));
    engine.run();
    result.take().expect("read completed")
}

fn do_delete(engine: &mut Engine, oid: ObjectId) -> i64 {
    let result = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&result);
    engine.enqueue(Operation::delete(oid, 0, move |op| {
        *captured.borrow_mut() = Some(op.retval)
    }));
    engine.run();
    result.take().expect("delete completed")
}

fn do_stable(engine: &mut Engine, versions: Vec<ObjectVersion>) -> i64 {
    let result = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&result);
    engine.enqueue(Operation::stable(versions, move |op| {
        *captured.borrow_mut() = Some(op.retval)
    }));
    engine.run();
    result.take().expect("stable completed")
}

fn do_rollback(engine: &mut Engine, versions: Vec<ObjectVersion>) -> i64 {
    let result = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&result);
    engine.enqueue(Operation::rollback(versions, move |op| {
        *captured.borrow_mut() = Some(op.retval)
    }));
    engine.run();
    result.take().expect("rollback completed")
}

fn do_list(engine: &mut Engine) -> (i64, u64, Vec<ObjectVersion>) {
    let result = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&result);
    let params = ListParams {
        pg_index: 0,
        pg_count: 0,
        pg_stripe_size: 0,
        min_inode: 0,
        max_inode: 0,
    };
    engine.enqueue(Operation::list(params, move |op| {
        *captured.borrow_mut() = Some((op.retval, op.version, std::mem::take(&mut op.list)))
    }));
    engine.run();
    result.take().expect("list completed")
}

#[test]
fn s1_big_write_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let oid = ObjectId::new(1, 0);

    let mut engine = fresh_engine(dir.path());
    assert_eq!(do_write(&mut engine, oid, 0, 0xAB, BLOCK), i64::from(BLOCK));
    assert_eq!(do_sync(&mut engine), 0);
    drop(engine);

    let mut engine = reopen(dir.path());
    let (retval, data) = do_read(&mut engine, oid, 0, BLOCK);
    assert_eq!(retval, i64::from(BLOCK));
    assert!(data.iter().all(|&b| b == 0xAB));
}

#[test]
fn s2_small_overlay_on_big_write() {
    let dir = tempfile::tempdir().unwrap();
    let oid = ObjectId::new(1, 0);

    let mut engine = fresh_engine(dir.path());
    assert_eq!(do_write(&mut engine, oid, 0, 0xAB, BLOCK), i64::from(BLOCK));
    assert_eq!(do_sync(&mut engine), 0);
    assert_eq!(do_write(&mut engine, oid, 4096, 0xCD, 4096), 4096);
    assert_eq!(do_sync(&mut engine), 0);
    drop(engine);

    let mut engine = reopen(dir.path());
    let (retval, data) = do_read(&mut engine, oid, 0, BLOCK);
    assert_eq!(retval, i64::from(BLOCK));
    assert!(data[..4096].iter().all(|&b| b == 0xAB));
    assert!(data[4096..8192].iter().all(|&b| b == 0xCD));
    assert!(data[8192..].iter().all(|&b| b == 0xAB));
}

#[test]
fn s3_unsynced_write_is_lost_whole() {
    let dir = tempfile::tempdir().unwrap();
    let oid = ObjectId::new(1, 0);

    let mut engine = fresh_engine(dir.path());
    // Written but never synced: no journal record reaches the disk.
    assert_eq!(do_write(&mut engine, oid, 0, 0x11, BLOCK), i64::from(BLOCK));
    drop(engine);

    let mut engine = reopen(dir.path());
    let (retval, data) = do_read(&mut engine, oid, 0, BLOCK);
    assert_eq!(retval, i64::from(BLOCK));
    // Pre-write contents in full (zeros), never a torn mix.
    assert!(data.iter().all(|&b| b == 0));
}

#[test]
fn s4_rollback_discards_small_write() {
    let dir = tempfile::tempdir().unwrap();
    let oid = ObjectId::new(1, 0);

    let mut engine = fresh_engine(dir.path());
    assert_eq!(do_write(&mut engine, oid, 0, 0xAB, BLOCK), i64::from(BLOCK));
    assert_eq!(do_sync(&mut engine), 0);
    let free_before = engine.free_block_count();

    assert_eq!(do_write(&mut engine, oid, 4096, 0xEE, 4096), 4096);
    assert_eq!(do_rollback(&mut engine, vec![ObjectVersion::new(oid, 2)]), 0);
    assert_eq!(do_sync(&mut engine), 0);

    let (_, data) = do_read(&mut engine, oid, 0, BLOCK);
    assert!(data.iter().all(|&b| b == 0xAB));
    assert_eq!(engine.free_block_count(), free_before);
}

#[test]
fn s5_delete_clears_object() {
    let dir = tempfile::tempdir().unwrap();
    let oid = ObjectId::new(1, 0);

    let mut engine = fresh_engine(dir.path());
    assert_eq!(do_write(&mut engine, oid, 0, 0xAB, BLOCK), i64::from(BLOCK));
    assert_eq!(do_sync(&mut engine), 0);
    assert_eq!(do_stable(&mut engine, vec![ObjectVersion::new(oid, 1)]), 0);
    engine.run(); // drive the flusher

    assert_eq!(do_delete(&mut engine, oid), 0);
    assert_eq!(do_sync(&mut engine), 0);
    engine.run(); // flush the tombstone

    let (retval, data) = do_read(&mut engine, oid, 0, BLOCK);
    assert_eq!(retval, i64::from(BLOCK));
    assert!(data.iter().all(|&b| b == 0));

    // The clean entry is gone after the flush; all blocks are free again.
    assert_eq!(engine.free_block_count(), engine.block_count());
    let (count, _, _) = do_list(&mut engine);
    assert_eq!(count, 0);

    drop(engine);
    let mut engine = reopen(dir.path());
    let (_, data) = do_read(&mut engine, oid, 0, BLOCK);
    assert!(data.iter().all(|&b| b == 0));
}

#[test]
fn s6_concurrent_syncs_acknowledge_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = fresh_engine(dir.path());
    let order = Rc::new(RefCell::new(Vec::new()));

    let w_order = Rc::clone(&order);
    engine.enqueue(Operation::write(
        ObjectId::new(1, 0),
        0,
        0,
        Bytes::from(vec![0x01; BLOCK as usize]),
        move |op| {
            assert!(op.retval >= 0);
            w_order.borrow_mut().push("w1");
        },
    ));
    let a_order = Rc::clone(&order);
    engine.enqueue(Operation::sync(move |op| {
        assert_eq!(op.retval, 0);
        a_order.borrow_mut().push("sync_a");
    }));
    let w2_order = Rc::clone(&order);
    engine.enqueue(Operation::write(
        ObjectId::new(1, u64::from(BLOCK)),
        0,
        4096,
        Bytes::from(vec![0x02; 4096]),
        move |op| {
            assert!(op.retval >= 0);
            w2_order.borrow_mut().push("w2");
        },
    ));
    let b_order = Rc::clone(&order);
    engine.enqueue(Operation::sync(move |op| {
        assert_eq!(op.retval, 0);
        b_order.borrow_mut().push("sync_b");
    }));
    engine.run();

    let order = order.borrow();
    let pos = |name: &str| order.iter().position(|&x| x == name).unwrap();
    // Writes acknowledge before their syncs, and sync A strictly before
    // sync B.
    assert!(pos("w1") < pos("sync_a"));
    assert!(pos("w2") < pos("sync_b"));
    assert!(pos("sync_a") < pos("sync_b"));
}

#[test]
fn version_preconditions() {
    let dir = tempfile::tempdir().unwrap();
    let oid = ObjectId::new(1, 0);
    let mut engine = fresh_engine(dir.path());

    // A caller-supplied version must be exactly latest + 1.
    let result = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&result);
    engine.enqueue(Operation::write(
        oid,
        5,
        0,
        Bytes::from(vec![0u8; 4096]),
        move |op| *captured.borrow_mut() = Some(op.retval),
    ));
    engine.run();
    assert_eq!(result.take().unwrap(), -i64::from(libc::EEXIST));

    assert_eq!(do_write(&mut engine, oid, 0, 0x33, 4096), 4096);

    // Reusing the just-assigned version is a conflict too.
    let result = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&result);
    engine.enqueue(Operation::write(
        oid,
        1,
        0,
        Bytes::from(vec![0u8; 4096]),
        move |op| *captured.borrow_mut() = Some(op.retval),
    ));
    engine.run();
    assert_eq!(result.take().unwrap(), -i64::from(libc::EEXIST));
}

#[test]
fn stable_of_unknown_version_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = fresh_engine(dir.path());
    assert_eq!(
        do_stable(&mut engine, vec![ObjectVersion::new(ObjectId::new(9, 0), 4)]),
        -i64::from(libc::ENOENT)
    );
}

#[test]
fn unaligned_arguments_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = fresh_engine(dir.path());
    let result = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&result);
    engine.enqueue(Operation::write(
        ObjectId::new(1, 0),
        0,
        100, // not disk_alignment-aligned
        Bytes::from(vec![0u8; 512]),
        move |op| *captured.borrow_mut() = Some(op.retval),
    ));
    assert_eq!(result.take().unwrap(), -i64::from(libc::EINVAL));
}

#[test]
fn list_partitions_stable_then_unstable() {
    let dir = tempfile::tempdir().unwrap();
    let stable_oid = ObjectId::new(1, 0);
    let unstable_oid = ObjectId::new(1, u64::from(BLOCK));
    let mut engine = fresh_engine(dir.path());

    assert_eq!(
        do_write(&mut engine, stable_oid, 0, 0xAA, BLOCK),
        i64::from(BLOCK)
    );
    assert_eq!(do_sync(&mut engine), 0);
    assert_eq!(
        do_stable(&mut engine, vec![ObjectVersion::new(stable_oid, 1)]),
        0
    );
    engine.run();

    assert_eq!(do_write(&mut engine, unstable_oid, 0, 0xBB, 4096), 4096);

    let (total, split, list) = do_list(&mut engine);
    assert_eq!(total, 2);
    assert_eq!(split, 1);
    assert_eq!(list[0], ObjectVersion::new(stable_oid, 1));
    assert_eq!(list[1], ObjectVersion::new(unstable_oid, 1));
}

#[test]
fn space_is_conserved_across_flush() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = fresh_engine(dir.path());
    let total = engine.block_count();
    assert_eq!(engine.free_block_count(), total);

    // Three objects: one flushed, one dirty big, one dirty small.
    for (stripe, fill) in [(0u64, 0x01u8), (1, 0x02), (2, 0x03)] {
        let oid = ObjectId::new(1, stripe * u64::from(BLOCK));
        assert_eq!(do_write(&mut engine, oid, 0, fill, BLOCK), i64::from(BLOCK));
    }
    assert_eq!(do_sync(&mut engine), 0);
    assert_eq!(engine.free_block_count(), total - 3);

    assert_eq!(
        do_stable(&mut engine, vec![ObjectVersion::new(ObjectId::new(1, 0), 1)]),
        0
    );
    engine.run();
    // Flushing moves a block from dirty to clean without consuming more.
    assert_eq!(engine.free_block_count(), total - 3);

    // Overwriting the flushed object supersedes its clean block.
    assert_eq!(
        do_write(&mut engine, ObjectId::new(1, 0), 0, 0x04, BLOCK),
        i64::from(BLOCK)
    );
    assert_eq!(do_sync(&mut engine), 0);
    assert_eq!(engine.free_block_count(), total - 4);
    assert_eq!(
        do_stable(&mut engine, vec![ObjectVersion::new(ObjectId::new(1, 0), 2)]),
        0
    );
    engine.run();
    // The superseded clean block is freed by the flusher.
    assert_eq!(engine.free_block_count(), total - 3);
}

#[test]
fn restart_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let oid = ObjectId::new(1, 0);

    let mut engine = fresh_engine(dir.path());
    assert_eq!(do_write(&mut engine, oid, 0, 0x5A, BLOCK), i64::from(BLOCK));
    assert_eq!(do_write(&mut engine, oid, 8192, 0x6B, 8192), 8192);
    assert_eq!(do_sync(&mut engine), 0);
    drop(engine);

    // Two restarts in a row resolve to the same state.
    for _ in 0..2 {
        let mut engine = reopen(dir.path());
        let (retval, data) = do_read(&mut engine, oid, 0, BLOCK);
        assert_eq!(retval, i64::from(BLOCK));
        assert!(data[..8192].iter().all(|&b| b == 0x5A));
        assert!(data[8192..16384].iter().all(|&b| b == 0x6B));
        assert!(data[16384..].iter().all(|&b| b == 0x5A));
        drop(engine);
    }
}

#[test]
fn journal_pressure_parks_and_cancel_restores() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    // A tiny ring with small blocks: one journaled write nearly fills it.
    cfg.block_size = 4096;
    cfg.bitmap_granularity = 4096;
    cfg.data.size = 64 * 4096;
    cfg.journal.size = 16 * 512;
    Engine::format(&cfg).unwrap();
    let mut engine = Engine::open(cfg).unwrap();

    let first = ObjectId::new(1, 0);
    let second = ObjectId::new(1, 4096);
    assert_eq!(do_write(&mut engine, first, 0, 0x77, 3584), 3584);

    // The second journaled write cannot fit while the first is unstable;
    // the op parks on journal space and the engine reports a stall.
    let parked = engine.enqueue(Operation::write(
        second,
        0,
        0,
        Bytes::from(vec![0x88; 3584]),
        |_| panic!("parked write must not complete"),
    ));
    engine.run();
    assert!(engine.is_stalled());

    // Dropping the parked op restores its reservations and the queue.
    let cancelled = engine.cancel(parked);
    assert!(cancelled.is_some());
    engine.run();
    assert!(!engine.is_stalled());

    // The first write is still intact.
    let (_, data) = do_read(&mut engine, first, 0, 3584);
    assert!(data.iter().all(|&b| b == 0x77));
}

#[test]
fn sync_stab_all_promotes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let oid = ObjectId::new(1, 0);
    let mut engine = fresh_engine(dir.path());

    assert_eq!(do_write(&mut engine, oid, 0, 0x42, BLOCK), i64::from(BLOCK));

    let result = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&result);
    engine.enqueue(Operation::sync_stab_all(move |op| {
        *captured.borrow_mut() = Some(op.retval)
    }));
    engine.run();
    assert_eq!(result.take().unwrap(), 0);

    // Everything is stable: the flusher materializes it into metadata,
    // and a restart serves the data from the clean state.
    engine.run();
    let (total, split, list) = do_list(&mut engine);
    assert_eq!(total, 1);
    assert_eq!(split, 1);
    assert_eq!(list[0], ObjectVersion::new(oid, 1));

    drop(engine);
    let mut engine = reopen(dir.path());
    let (_, data) = do_read(&mut engine, oid, 0, BLOCK);
    assert!(data.iter().all(|&b| b == 0x42));
}
