use std::{fs, sync::Arc};

use ddcio_common::{OperationClass, Status};
use ddcio_core::{
    dsa::{CacheError, CachedRecord, StatsCache},
    CoreOptions, DeviceStore, DsaGeneration, RetryEngine, RetryOptions,
};

#[test]
fn save_restore_then_tampered_version() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempfile::tempdir().unwrap();
    let cache = StatsCache::new(dir.path().join("stats"));
    let saved = vec![CachedRecord {
        busno: 3,
        step: 2,
        ewma_attempts: 1.4,
        ewma_greatest: 1.0,
        timestamp: 1_760_000_000,
        edid_check_byte: None,
    }];
    cache.save(DsaGeneration::Dsa2, &saved).unwrap();

    let store = DeviceStore::new(&CoreOptions::default());
    let restored = cache.restore(DsaGeneration::Dsa2).unwrap();
    assert_eq!(restored, saved);
    assert_eq!(store.load_cached(&restored), 1);
    assert_eq!(store.dsa_records(), saved);

    let text = fs::read_to_string(cache.path()).unwrap();
    fs::write(cache.path(), text.replacen("VERSION 1", "VERSION 99", 1)).unwrap();

    let err = cache.restore(DsaGeneration::Dsa2).unwrap_err();
    assert!(matches!(err, CacheError::Version { found: 99, .. }));
    assert_eq!(err.status(), Status::BadData);

    let fresh = DeviceStore::new(&CoreOptions::default());
    let restored = cache.restore(DsaGeneration::Dsa2).unwrap();
    assert_eq!(fresh.load_cached(&restored), 0);
    assert!(fresh.is_empty());
}

#[test]
fn live_state_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let cache = StatsCache::new(dir.path().join("stats"));

    let store = Arc::new(DeviceStore::new(&CoreOptions::default()));
    let engine = RetryEngine::new(Arc::clone(&store), RetryOptions::default())
        .with_stats(Box::leak(Box::default()));
    for busno in [4, 1, 9] {
        let device = store.get_or_create(busno);
        for n in 0..busno {
            let mut failures = n % 3;
            let _ = engine.try_op(OperationClass::WriteRead, &device, || {
                if failures > 0 {
                    failures -= 1;
                    Err(Status::Timeout)
                } else {
                    Ok(())
                }
            });
        }
        device.verify_edid(busno as u8);
    }

    let before = store.dsa_records();
    assert_eq!(before.iter().map(|r| r.busno).collect::<Vec<_>>(), [1, 4, 9]);
    cache.save(DsaGeneration::Dsa2, &before).unwrap();

    let next = DeviceStore::new(&CoreOptions::default());
    next.load_cached(&cache.restore(DsaGeneration::Dsa2).unwrap());
    assert_eq!(next.dsa_records(), before);

    let entry = next.get(4).unwrap();
    assert!(!entry.is_defined());
    assert!(entry.inspect_dsa(|d| d.as_results_table().map(|t| t.is_from_cache())).unwrap());
}

#[test]
fn other_generation_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let cache = StatsCache::new(dir.path().join("stats"));
    let record = CachedRecord {
        busno: 3,
        step: 4,
        ewma_attempts: 1.0,
        ewma_greatest: 1.0,
        timestamp: 0,
        edid_check_byte: Some(0x42),
    };
    cache.save(DsaGeneration::Dsa2, &[record]).unwrap();

    assert!(matches!(
        cache.restore(DsaGeneration::Legacy),
        Err(CacheError::Generation { found: 2, expected: 1 })
    ));
    assert!(cache.restore(DsaGeneration::Dsa2).unwrap().is_empty());
}
