use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use ddcio_common::{stats::IoStats, IoMode, OperationClass, SleepEvent, Status};
use ddcio_core::{
    CoreOptions, DeviceEntry, DeviceStore, DsaGeneration, DsaOptions, Pacer, PacingOptions,
    RetryEngine, RetryOptions, SleepOverride,
};

fn engine(retry: RetryOptions) -> RetryEngine {
    let store = DeviceStore::new(&CoreOptions::default().with_retry(retry.clone()));
    RetryEngine::new(Arc::new(store), retry).with_stats(Box::leak(Box::default()))
}

fn scripted(
    replies: impl IntoIterator<Item = Result<(), Status>>,
) -> (impl FnMut() -> Result<(), Status>, Arc<parking_lot::Mutex<usize>>) {
    let calls = Arc::new(parking_lot::Mutex::new(0));
    let mut replies: VecDeque<_> = replies.into_iter().collect();
    let counter = Arc::clone(&calls);
    let op = move || {
        *counter.lock() += 1;
        replies.pop_front().unwrap_or(Ok(()))
    };
    (op, calls)
}

fn step(device: &DeviceEntry) -> usize {
    device.inspect_dsa(|d| d.as_results_table().map(|t| t.step())).unwrap()
}

#[test]
fn recovers_on_third_attempt() {
    let _ = tracing_subscriber::fmt::try_init();

    let engine = engine(RetryOptions::default().with_maxtries(OperationClass::WriteRead, 4));
    let device = engine.store().get_or_create(3);
    let (op, calls) = scripted([Err(Status::IoError), Err(Status::IoError), Ok(())]);

    engine.try_op(OperationClass::WriteRead, &device, op).unwrap();

    assert_eq!(*calls.lock(), 3);
    let hist = device.try_stats(OperationClass::WriteRead);
    assert_eq!(hist.slot(4), 1);
    assert_eq!(hist.total(), 1);
    let ewma = device.inspect_dsa(|d| d.as_results_table().map(|t| t.ewma_attempts())).unwrap();
    assert!(ewma > 1.0);
}

#[test]
fn exhaustion_raises_step() {
    let engine = engine(RetryOptions::default().with_maxtries(OperationClass::WriteRead, 3));
    let device = engine.store().get_or_create(3);
    let before = step(&device);
    let (op, calls) = scripted([Err(Status::IoError); 3]);

    let err = engine.try_op(OperationClass::WriteRead, &device, op).unwrap_err();

    assert_eq!(*calls.lock(), 3);
    assert_eq!(err.status(), Status::RetriesExhausted);
    assert_eq!(err.cause_statuses(), [Status::IoError; 3]);
    assert_eq!(device.try_stats(OperationClass::WriteRead).exhausted(), 1);
    assert_eq!(step(&device), before + 1);
}

#[test]
fn device_gone_is_fatal_at_once() {
    let engine = engine(RetryOptions::default().with_maxtries(OperationClass::WriteOnly, 4));
    let device = engine.store().get_or_create(3);
    let before = (step(&device), device.adjusted_multiplier());
    let (op, calls) = scripted([Err(Status::DeviceGone(libc::ENODEV))]);

    let err = engine.try_op(OperationClass::WriteOnly, &device, op).unwrap_err();

    assert_eq!(*calls.lock(), 1);
    assert_eq!(err.status(), Status::DeviceGone(libc::ENODEV));
    assert_eq!(err.cause_statuses(), [Status::DeviceGone(libc::ENODEV)]);
    assert_eq!(device.try_stats(OperationClass::WriteOnly).fatal(), 1);
    assert_eq!((step(&device), device.adjusted_multiplier()), before);
}

#[test]
fn save_settings_sleep_is_scaled() {
    let opts = CoreOptions::default()
        .with_pacing(PacingOptions::default().with_sleep_multiplier(1.5).unwrap())
        .with_dsa(DsaOptions::default().with_generation(DsaGeneration::Disabled));
    let store = DeviceStore::new(&opts);
    let device = store.get_or_create(1);
    assert_eq!(device.multiplier_ct(), 1);

    let stats: &'static IoStats = Box::leak(Box::default());
    let pacer = Pacer::new(opts.pacing.clone()).with_stats(stats);

    let start = Instant::now();
    let millis = pacer.sleep_now(
        &device,
        IoMode::I2c,
        SleepEvent::PostSaveSettings,
        SleepOverride::UseDefault,
    );
    let elapsed = start.elapsed();

    assert_eq!(millis, 300);
    let requested = Duration::from_millis(millis as u64);
    assert!(elapsed >= requested);
    assert!(elapsed < requested * 11 / 10, "slept {elapsed:?}");
    assert_eq!(stats.sleep_event_count(SleepEvent::PostSaveSettings), 1);
}
