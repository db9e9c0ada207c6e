//! Table growth tests: inserts crossing resize boundaries must keep every
//! key retrievable and preserve the structural invariants.

use hopstore::{Hopstore, Status, StoreConfig};

#[test]
fn test_thousand_keys_across_resizes() {
    let dir = tempfile::tempdir().unwrap();
    let store = Hopstore::default();
    let pool = store.create_pool(dir.path(), "grow", 16 << 20, 0).unwrap();

    for i in 0..1024u32 {
        let key = format!("k{i}");
        let value = format!("{i}");
        assert_eq!(store.put(pool, key.as_bytes(), value.as_bytes()), Status::Ok);
    }
    assert_eq!(store.count(pool).unwrap(), 1024);

    for i in 0..1024u32 {
        let key = format!("k{i}");
        assert_eq!(
            store.get(pool, key.as_bytes()).unwrap(),
            format!("{i}").as_bytes(),
            "key {key} lost across resize"
        );
    }
    store.check_pool(pool).unwrap();
}

#[test]
fn test_small_table_resizes_repeatedly() {
    let dir = tempfile::tempdir().unwrap();
    // A tiny base segment forces several doublings.
    let store = Hopstore::new(StoreConfig {
        base_buckets: 64,
        ..StoreConfig::default()
    });
    let pool = store.create_pool(dir.path(), "grow", 16 << 20, 0).unwrap();

    for i in 0..2000u32 {
        assert_eq!(
            store.put(pool, format!("key-{i}").as_bytes(), format!("v{i}").as_bytes()),
            Status::Ok
        );
    }
    for i in 0..2000u32 {
        assert_eq!(
            store.get(pool, format!("key-{i}").as_bytes()).unwrap(),
            format!("v{i}").as_bytes()
        );
    }
    store.check_pool(pool).unwrap();
}

#[test]
fn test_mixed_workload_with_growth() {
    let dir = tempfile::tempdir().unwrap();
    let store = Hopstore::new(StoreConfig {
        base_buckets: 64,
        ..StoreConfig::default()
    });
    let pool = store.create_pool(dir.path(), "grow", 16 << 20, 0).unwrap();

    for i in 0..1200u32 {
        assert_eq!(
            store.put(pool, format!("key-{i}").as_bytes(), format!("v{i}").as_bytes()),
            Status::Ok
        );
        // Erase every third key as we go.
        if i % 3 == 0 {
            assert_eq!(store.erase(pool, format!("key-{i}").as_bytes()), Status::Ok);
        }
        // Overwrite every fifth key with a larger value.
        if i % 5 == 0 && i % 3 != 0 {
            let value = format!("replacement-value-for-{i}-{}", "x".repeat(40));
            assert_eq!(store.put(pool, format!("key-{i}").as_bytes(), value.as_bytes()), Status::Ok);
        }
    }

    for i in 0..1200u32 {
        let key = format!("key-{i}");
        let got = store.get(pool, key.as_bytes());
        if i % 3 == 0 {
            assert_eq!(got, Err(Status::KeyNotFound), "{key} should be erased");
        } else if i % 5 == 0 {
            let value = format!("replacement-value-for-{i}-{}", "x".repeat(40));
            assert_eq!(got.unwrap(), value.as_bytes());
        } else {
            assert_eq!(got.unwrap(), format!("v{i}").as_bytes());
        }
    }
    store.check_pool(pool).unwrap();
}

#[test]
fn test_growth_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store = Hopstore::new(StoreConfig {
        base_buckets: 64,
        ..StoreConfig::default()
    });
    let pool = store.create_pool(dir.path(), "grow", 16 << 20, 0).unwrap();
    for i in 0..800u32 {
        assert_eq!(
            store.put(pool, format!("key-{i}").as_bytes(), format!("v{i}").as_bytes()),
            Status::Ok
        );
    }
    assert_eq!(store.close_pool(pool), Status::Ok);

    let pool = store.open_pool(dir.path(), "grow", 0).unwrap();
    assert_eq!(store.count(pool).unwrap(), 800);
    for i in 0..800u32 {
        assert_eq!(
            store.get(pool, format!("key-{i}").as_bytes()).unwrap(),
            format!("v{i}").as_bytes()
        );
    }
    store.check_pool(pool).unwrap();
}

#[test]
fn test_concurrent_writers_during_growth() {
    use std::sync::Arc;
    use std::thread;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Hopstore::new(StoreConfig {
        base_buckets: 64,
        ..StoreConfig::default()
    }));
    let pool = store.create_pool(dir.path(), "grow", 32 << 20, 0).unwrap();

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for i in 0..400u32 {
                let key = format!("t{t}-key-{i}");
                assert_eq!(store.put(pool, key.as_bytes(), b"payload"), Status::Ok);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.count(pool).unwrap(), 1600);
    for t in 0..4u32 {
        for i in 0..400u32 {
            let key = format!("t{t}-key-{i}");
            assert_eq!(store.get(pool, key.as_bytes()).unwrap(), b"payload");
        }
    }
    store.check_pool(pool).unwrap();
}
