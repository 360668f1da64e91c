//! Crash and rollback recovery on file-backed images
//!
//! Nothing reaches the image before a transaction commits, so dropping the
//! allocator at any point before commit must leave the on-disk bitmap as it
//! was.

use bfs_allocator::{
    format_volume, AllocatorConfig, BlockAllocator, BlockDevice, BlockRun, CheckControl,
    FileDevice, FormatOptions, MemoryTransaction, NodeKind, NodeRecord, Superblock,
};
use tempfile::TempDir;

const BLOCK_SIZE: usize = 1024;

fn create_image(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("volume.img");
    let dev = FileDevice::create(&path, BLOCK_SIZE, 32 * 1024).unwrap();
    format_volume(&dev, &FormatOptions::with_block_size(BLOCK_SIZE as u32)).unwrap();
    path
}

fn mount(path: &std::path::Path) -> (FileDevice, BlockAllocator) {
    let dev = FileDevice::open(path, BLOCK_SIZE).unwrap();
    let alloc = BlockAllocator::mount(&dev, AllocatorConfig::default()).unwrap();
    (dev, alloc)
}

#[test]
fn test_committed_allocations_survive_remount() {
    let dir = TempDir::new().unwrap();
    let path = create_image(&dir);

    let runs = {
        let (dev, alloc) = mount(&path);
        let mut txn = MemoryTransaction::new();
        let mut sb = Superblock::read(&dev).unwrap();
        let node = NodeRecord::new(NodeKind::File, BlockRun::new(1, 0, 1));
        let runs: Vec<_> = (0..20)
            .map(|_| alloc.allocate(&mut txn, &node, 50, 50).unwrap())
            .collect();
        alloc.stage_superblock(&mut txn, &mut sb).unwrap();
        txn.commit(&dev).unwrap();
        runs
    };

    let (dev, alloc) = mount(&path);
    for run in &runs {
        assert!(alloc.is_run_allocated(run).unwrap());
    }
    assert_eq!(Superblock::read(&dev).unwrap().used_blocks, alloc.used_blocks());
}

#[test]
fn test_crash_before_commit_loses_nothing() {
    let dir = TempDir::new().unwrap();
    let path = create_image(&dir);
    let baseline = mount(&path).1.used_blocks();

    {
        let (_dev, alloc) = mount(&path);
        let mut txn = MemoryTransaction::new();
        let node = NodeRecord::new(NodeKind::File, BlockRun::new(2, 0, 1));
        alloc.allocate(&mut txn, &node, 500, 500).unwrap();
        // dropped without commit
    }

    let (_dev, alloc) = mount(&path);
    assert_eq!(alloc.used_blocks(), baseline);

    let mut control = CheckControl::default();
    alloc.start_checking(&mut control).unwrap();
    assert!(alloc.stop_checking(&mut control).unwrap().is_clean());
}

#[test]
fn test_rollback_then_revert() {
    let dir = TempDir::new().unwrap();
    let path = create_image(&dir);
    let (dev, alloc) = mount(&path);

    let node = NodeRecord::new(NodeKind::File, BlockRun::new(0, 0, 1));
    let mut committed = MemoryTransaction::new();
    let kept = alloc.allocate(&mut committed, &node, 30, 30).unwrap();
    committed.commit(&dev).unwrap();
    let used = alloc.used_blocks();

    let mut txn = MemoryTransaction::new();
    let lost = alloc.allocate(&mut txn, &node, 30, 30).unwrap();
    alloc.free(&mut txn, kept).unwrap();
    assert_eq!(alloc.used_blocks(), used);

    let touched = alloc.revert(txn.rollback()).unwrap();
    assert_eq!(touched.len(), 1);
    assert!(alloc.is_run_allocated(&kept).unwrap());
    assert!(!alloc.is_run_allocated(&lost).unwrap());
    assert_eq!(alloc.used_blocks(), used);

    drop(alloc);
    let (_dev, alloc) = mount(&path);
    assert!(alloc.is_run_allocated(&kept).unwrap());
    assert_eq!(alloc.used_blocks(), used);
}

#[test]
fn test_rollback_spares_concurrent_transaction() {
    let dir = TempDir::new().unwrap();
    let path = create_image(&dir);
    let (dev, alloc) = mount(&path);
    let baseline = alloc.used_blocks();

    let node = NodeRecord::new(NodeKind::File, BlockRun::new(1, 0, 1));
    let mut a = MemoryTransaction::new();
    let mut b = MemoryTransaction::new();
    let ra = alloc.allocate(&mut a, &node, 10, 10).unwrap();
    let rb = alloc.allocate(&mut b, &node, 10, 10).unwrap();
    assert_eq!(ra.group, rb.group);

    let touched = alloc.revert(a.rollback()).unwrap();
    alloc.restage_bitmap_blocks(&mut b, &touched).unwrap();
    b.commit(&dev).unwrap();
    assert!(alloc.is_run_allocated(&rb).unwrap());

    // a later allocation must not be handed b's blocks
    let mut c = MemoryTransaction::new();
    let rc = alloc.allocate(&mut c, &node, 20, 20).unwrap();
    assert!(!rc.overlaps(&rb));
    c.commit(&dev).unwrap();
    drop(alloc);

    let (_dev, alloc) = mount(&path);
    assert!(alloc.is_run_allocated(&rb).unwrap());
    assert!(alloc.is_run_allocated(&rc).unwrap());
    assert_eq!(alloc.used_blocks(), baseline + 30);

    let mut control = CheckControl::default();
    alloc.start_checking(&mut control).unwrap();
    for run in [rb, rc] {
        let owner = NodeRecord::new(NodeKind::File, run);
        alloc.check_next_node(&mut control, &owner).unwrap();
    }
    assert!(alloc.stop_checking(&mut control).unwrap().is_clean());
}

#[test]
fn test_torn_commit_with_stale_superblock_counter() {
    let dir = TempDir::new().unwrap();
    let path = create_image(&dir);
    let (dev, alloc) = mount(&path);
    let before = Superblock::read(&dev).unwrap();

    let mut txn = MemoryTransaction::new();
    let mut sb = before;
    let node = NodeRecord::new(NodeKind::File, BlockRun::new(3, 0, 1));
    let run = alloc.allocate(&mut txn, &node, 64, 64).unwrap();
    alloc.stage_superblock(&mut txn, &mut sb).unwrap();

    // only the bitmap block made it to disk
    let bitmap_block = alloc.geometry().first_bitmap_block(3);
    dev.write_block(bitmap_block, txn.staged(bitmap_block).unwrap())
        .unwrap();
    dev.sync().unwrap();
    drop(alloc);

    // the bitmap is authoritative; the stale counter only triggers a warning
    let (dev, alloc) = mount(&path);
    assert!(alloc.is_run_allocated(&run).unwrap());
    assert_eq!(alloc.used_blocks(), before.used_blocks + 64);
    assert_eq!(Superblock::read(&dev).unwrap().used_blocks, before.used_blocks);
}
