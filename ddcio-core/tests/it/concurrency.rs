use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use ddcio_common::{OperationClass, Status};
use ddcio_core::{CoreOptions, DeviceStore, RetryEngine, RetryOptions};
use rand::{rngs::StdRng, Rng, SeedableRng};

const CLASS: OperationClass = OperationClass::WriteRead;

#[test]
fn visitor_runs_alongside_workers() {
    let _ = tracing_subscriber::fmt::try_init();

    let store = Arc::new(DeviceStore::new(&CoreOptions::default()));
    let engine = Arc::new(
        RetryEngine::new(Arc::clone(&store), RetryOptions::default())
            .with_stats(Box::leak(Box::default())),
    );
    let buses = [3u32, 5];
    let started: Arc<[AtomicU32; 2]> = Arc::new([AtomicU32::new(0), AtomicU32::new(0)]);
    for busno in buses {
        store.get_or_create(busno);
    }

    let workers: Vec<_> = buses
        .into_iter()
        .enumerate()
        .map(|(i, busno)| {
            let engine = Arc::clone(&engine);
            let started = Arc::clone(&started);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(busno as u64);
                let device = engine.store().get_or_create(busno);
                for _ in 0..300 {
                    started[i].fetch_add(1, Ordering::SeqCst);
                    let _ = engine.try_op(CLASS, &device, || {
                        if rng.gen_bool(0.3) {
                            Err(Status::IoError)
                        } else {
                            Ok(())
                        }
                    });
                }
            })
        })
        .collect();

    let visitor = {
        let store = Arc::clone(&store);
        let started = Arc::clone(&started);
        thread::spawn(move || {
            for _ in 0..200 {
                let mut seen = Vec::new();
                store.apply_all_sorted(|entry| {
                    let i = if entry.busno() == 3 { 0 } else { 1 };
                    let total = entry.try_stats(CLASS).total();
                    let calls = started[i].load(Ordering::SeqCst);
                    assert!(total <= calls && calls - total <= 1, "bus {}", entry.busno());
                    seen.push(entry.busno());
                });
                assert_eq!(seen, buses);
            }
        })
    };

    for worker in workers {
        worker.join().unwrap();
    }
    visitor.join().unwrap();

    for (i, busno) in buses.into_iter().enumerate() {
        let total = store.get(busno).unwrap().try_stats(CLASS).total();
        assert_eq!(total, started[i].load(Ordering::SeqCst));
    }
    assert_eq!(store.token().counts(), (0, 0));
}

#[test]
fn token_holder_may_use_entries() {
    let store = DeviceStore::new(&CoreOptions::default());
    let device = store.get_or_create(3);

    let _guard = store.token().exclusive();
    assert_eq!(device.set_maxtries(CLASS, 5), 5);
    store.apply_all(|entry| {
        entry.set_description("nested");
    });
    assert_eq!(store.get_or_create(3).description(), "nested");
}

#[test]
fn other_threads_wait_for_token() {
    let store = Arc::new(DeviceStore::new(&CoreOptions::default()));
    let device = store.get_or_create(3);
    let done = Arc::new(AtomicBool::new(false));

    let guard = store.token().exclusive();
    let handle = {
        let done = Arc::clone(&done);
        thread::spawn(move || {
            device.set_maxtries(CLASS, 7);
            done.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst));
    assert_eq!(store.get_or_create(3).maxtries(CLASS), 10);

    drop(guard);
    handle.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(store.get_or_create(3).maxtries(CLASS), 7);
}
