use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use slotdb_storage::{
    BufferPool, Catalog, DbFile, FieldType, FileId, HeapFile, PageId, Permission, Record, Schema,
    StorageConfig, StorageError, TransactionId, Value,
};
use tempfile::{tempdir, TempDir};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> StorageConfig {
    StorageConfig::default()
        .with_page_size(128)
        .with_pool_capacity(16)
        .with_lock_timeout(Duration::from_millis(300))
}

fn schema() -> Arc<Schema> {
    Arc::new(
        Schema::with_names(vec![(FieldType::Int, "id"), (FieldType::Text(8), "name")]).unwrap(),
    )
}

fn row(id: i32, name: &str) -> Record {
    Record::new(vec![Value::Int(id), Value::Text(name.to_string())])
}

/// Opens (or reopens) the table in `dir` behind a fresh pool.
fn open(dir: &Path, config: &StorageConfig) -> anyhow::Result<(BufferPool, FileId)> {
    let catalog = Arc::new(Catalog::new());
    let file = HeapFile::open(&dir.join("people.dat"), schema(), config)?;
    let id = file.id();
    catalog.add_table(Arc::new(file), "people", Some("id"));
    Ok((BufferPool::new(catalog, config)?, id))
}

fn setup() -> anyhow::Result<(TempDir, BufferPool, FileId)> {
    init_logging();
    let dir = tempdir()?;
    let (pool, table) = open(dir.path(), &config())?;
    Ok((dir, pool, table))
}

fn ids(records: &[Record]) -> Vec<i32> {
    records
        .iter()
        .map(|r| match r.field(0) {
            Some(Value::Int(i)) => *i,
            other => panic!("unexpected field {:?}", other),
        })
        .collect()
}

#[test]
fn committed_inserts_survive_reopen() -> anyhow::Result<()> {
    let (dir, pool, table) = setup()?;
    let tid = TransactionId::new();
    // 128 * 8 / (16 * 8 + 1) = 7 slots per page
    for i in 0..20 {
        pool.insert_record(tid, table, &mut row(i, "x"))?;
    }
    pool.commit(tid)?;
    assert_eq!(pool.catalog().file(table)?.page_count()?, 3);

    let (fresh, table) = open(dir.path(), &config())?;
    let tid = TransactionId::new();
    assert_eq!(ids(&fresh.scan(tid, table)?), (0..20).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn commit_writes_last_in_memory_image() -> anyhow::Result<()> {
    let (_dir, pool, table) = setup()?;
    let tid = TransactionId::new();
    let mut a = row(1, "ann");
    let mut b = row(2, "bob");
    pool.insert_record(tid, table, &mut a)?;
    pool.insert_record(tid, table, &mut b)?;
    pool.delete_record(tid, &a)?;

    let pid = b.rid().unwrap().page_id;
    let page = pool.get_page(tid, pid, Permission::Read)?;
    pool.commit(tid)?;

    let on_disk = pool.catalog().file(table)?.read_page(pid.page_number)?;
    assert_eq!(on_disk, page.read().encode());
    assert!(!pool.holds_lock(tid, pid));
    Ok(())
}

#[test]
fn abort_restores_pre_transaction_bytes() -> anyhow::Result<()> {
    let (dir, pool, table) = setup()?;
    let setup_tid = TransactionId::new();
    let mut kept = Vec::new();
    for i in 0..5 {
        let mut r = row(i, "keep");
        pool.insert_record(setup_tid, table, &mut r)?;
        kept.push(r);
    }
    pool.commit(setup_tid)?;
    let file = pool.catalog().file(table)?;
    let before = file.read_page(0)?;

    let tid = TransactionId::new();
    pool.delete_record(tid, &kept[1])?;
    pool.insert_record(tid, table, &mut row(50, "gone"))?;
    let page = pool.get_page(tid, PageId::new(table, 0), Permission::Read)?;
    assert_ne!(page.read().encode(), before);
    pool.abort(tid)?;

    assert_eq!(page.read().encode(), before);
    assert_eq!(file.read_page(0)?, before);
    assert!(!pool.holds_lock(tid, PageId::new(table, 0)));

    let (fresh, table) = open(dir.path(), &config())?;
    assert_eq!(ids(&fresh.scan(TransactionId::new(), table)?), vec![0, 1, 2, 3, 4]);
    Ok(())
}

#[test]
fn aborted_insert_into_new_page_leaves_it_empty() -> anyhow::Result<()> {
    let (_dir, pool, table) = setup()?;
    let tid = TransactionId::new();
    pool.insert_record(tid, table, &mut row(1, "tmp"))?;
    pool.abort(tid)?;

    let tid = TransactionId::new();
    assert!(pool.scan(tid, table)?.is_empty());
    Ok(())
}

#[test]
fn schema_mismatch_is_rejected() -> anyhow::Result<()> {
    let (_dir, pool, table) = setup()?;
    let tid = TransactionId::new();
    let err = pool
        .insert_record(tid, table, &mut Record::new(vec![Value::Int(1)]))
        .unwrap_err();
    assert!(matches!(err, StorageError::SchemaMismatch(_)));

    let err = pool
        .insert_record(tid, table, &mut row(1, "much too long"))
        .unwrap_err();
    assert!(matches!(err, StorageError::SchemaMismatch(_)));
    assert_eq!(pool.catalog().file(table)?.page_count()?, 0);
    Ok(())
}

#[test]
fn deleting_unknown_records_fails() -> anyhow::Result<()> {
    let (_dir, pool, table) = setup()?;
    let tid = TransactionId::new();

    let unsaved = row(1, "a");
    assert!(matches!(
        pool.delete_record(tid, &unsaved),
        Err(StorageError::RecordNotFound(_))
    ));

    let mut saved = row(2, "b");
    pool.insert_record(tid, table, &mut saved)?;
    pool.delete_record(tid, &saved)?;
    assert!(matches!(
        pool.delete_record(tid, &saved),
        Err(StorageError::RecordNotFound(_))
    ));

    let mut far = row(3, "c");
    far.set_rid(Some(slotdb_storage::RecordId::new(PageId::new(table, 40), 0)));
    assert!(pool.delete_record(tid, &far).is_err());
    Ok(())
}

#[test]
fn scan_is_restartable_and_ordered() -> anyhow::Result<()> {
    let (_dir, pool, table) = setup()?;
    let tid = TransactionId::new();
    for i in 0..10 {
        pool.insert_record(tid, table, &mut row(i, "s"))?;
    }
    let first = pool.scan(tid, table)?;
    let second = pool.scan(tid, table)?;
    assert_eq!(first, second);
    assert_eq!(ids(&first), (0..10).collect::<Vec<_>>());

    let pages: Vec<_> = first.iter().map(|r| r.rid().unwrap().page_id.page_number).collect();
    let mut sorted = pages.clone();
    sorted.sort();
    assert_eq!(pages, sorted);
    Ok(())
}

#[test]
fn full_pool_of_dirty_pages_refuses_new_pages() -> anyhow::Result<()> {
    init_logging();
    let dir = tempdir()?;
    let small = config().with_pool_capacity(2);
    let (pool, table) = open(dir.path(), &small)?;

    // three full pages on disk
    for i in 0..21 {
        // one transaction per record keeps dirty pages from piling up
        let tid = TransactionId::new();
        pool.insert_record(tid, table, &mut row(i, "f"))?;
        pool.commit(tid)?;
    }

    let tid = TransactionId::new();
    let records = pool.scan(tid, table)?;
    pool.commit(tid)?;

    let writer = TransactionId::new();
    pool.delete_record(writer, &records[0])?;
    pool.delete_record(writer, &records[7])?;
    let err = pool
        .get_page(writer, PageId::new(table, 2), Permission::Read)
        .unwrap_err();
    assert!(matches!(err, StorageError::BufferPoolFull(2)));

    // both dirty pages are still resident and intact
    let p0 = pool.get_page(writer, PageId::new(table, 0), Permission::Read)?;
    let p1 = pool.get_page(writer, PageId::new(table, 1), Permission::Read)?;
    assert_eq!(p0.read().is_dirty(), Some(writer));
    assert_eq!(p1.read().is_dirty(), Some(writer));
    Ok(())
}

#[test]
fn exclusive_holder_excludes_everyone_else() -> anyhow::Result<()> {
    let (_dir, pool, table) = setup()?;
    let tid = TransactionId::new();
    pool.insert_record(tid, table, &mut row(1, "a"))?;
    pool.commit(tid)?;

    let pid = PageId::new(table, 0);
    let (a, b, c) = (TransactionId::new(), TransactionId::new(), TransactionId::new());
    pool.get_page(a, pid, Permission::Read)?;
    pool.get_page(b, pid, Permission::Read)?;
    // two sharers: nobody may write
    assert!(pool.get_page(c, pid, Permission::Write).unwrap_err().is_abort());
    assert!(pool.get_page(a, pid, Permission::Write).unwrap_err().is_abort());
    pool.abort(c)?;

    pool.commit(b)?;
    // a is now the sole sharer and upgrades in place
    pool.get_page(a, pid, Permission::Write)?;
    assert!(pool.get_page(c, pid, Permission::Read).unwrap_err().is_abort());
    pool.commit(a)?;
    Ok(())
}

#[test]
fn concurrent_inserters_all_commit() -> anyhow::Result<()> {
    let (_dir, pool, table) = setup()?;
    let pool = Arc::new(pool);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let pool = pool.clone();
            thread::spawn(move || -> slotdb_storage::Result<()> {
                for i in 0..5 {
                    // retry the whole transaction when it is picked as a victim
                    loop {
                        let tid = TransactionId::new();
                        match pool.insert_record(tid, table, &mut row(t * 100 + i, "c")) {
                            Ok(()) => {
                                pool.commit(tid)?;
                                break;
                            }
                            Err(e) if e.is_abort() => pool.abort(tid)?,
                            Err(e) => return Err(e),
                        }
                    }
                }
                Ok(())
            })
        })
        .collect();
    for h in handles {
        h.join().expect("inserter panicked")?;
    }

    let mut got = ids(&pool.scan(TransactionId::new(), table)?);
    got.sort();
    let mut want: Vec<i32> = (0..4).flat_map(|t| (0..5).map(move |i| t * 100 + i)).collect();
    want.sort();
    assert_eq!(got, want);
    Ok(())
}

#[test]
fn crossed_upgrades_do_not_hang() -> anyhow::Result<()> {
    let (_dir, pool, table) = setup()?;
    let tid = TransactionId::new();
    for i in 0..14 {
        pool.insert_record(tid, table, &mut row(i, "d"))?;
    }
    pool.commit(tid)?;
    let pool = Arc::new(pool);
    let barrier = Arc::new(Barrier::new(2));

    let spawn = |mine: u32, theirs: u32| {
        let pool = pool.clone();
        let barrier = barrier.clone();
        thread::spawn(move || -> slotdb_storage::Result<bool> {
            let tid = TransactionId::new();
            pool.get_page(tid, PageId::new(table, mine), Permission::Read)?;
            barrier.wait();
            match pool.get_page(tid, PageId::new(table, theirs), Permission::Write) {
                Ok(_) => {
                    pool.commit(tid)?;
                    Ok(false)
                }
                Err(e) if e.is_abort() => {
                    pool.abort(tid)?;
                    Ok(true)
                }
                Err(e) => Err(e),
            }
        })
    };

    let a = spawn(0, 1);
    let b = spawn(1, 0);
    let aborted_a = a.join().expect("thread a panicked")?;
    let aborted_b = b.join().expect("thread b panicked")?;
    assert!(aborted_a || aborted_b);
    Ok(())
}
