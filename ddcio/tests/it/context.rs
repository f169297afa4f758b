use std::sync::Arc;

use ddcio::{
    dsa::{CachedRecord, StatsCache},
    Context, DsaGeneration, DsaOptions, InitError, IoStrategy, OperationClass, PacingOptions,
    Status,
};
use ddcio_sim::{sim_fd, Reply, ScriptedIo, DEFAULT_RESPONSE};

use crate::{fast_options, sim_dispatcher};

#[test]
fn invalid_multiplier_is_rejected() {
    let _ = tracing_subscriber::fmt::try_init();

    let io = Arc::new(ScriptedIo::always_ok());
    let mut opts = fast_options();
    opts.pacing = PacingOptions { sleep_multiplier: 0.0, ..opts.pacing };

    let err = Context::init_with(opts, sim_dispatcher(&io)).unwrap_err();
    assert!(matches!(err, InitError::Options(_)));
}

#[test]
fn strategy_is_locked_after_first_io() {
    let io = Arc::new(ScriptedIo::always_ok());
    let dispatcher = sim_dispatcher(&io);
    let ctx = Context::init_with(fast_options(), dispatcher).unwrap();

    let fd = sim_fd().unwrap();
    ctx.channel_for(&fd, 2).write_only(&[0x51]).unwrap();

    let opts = fast_options().with_strategy(IoStrategy::Ioctl);
    assert!(matches!(Context::init_with(opts, dispatcher), Err(InitError::Strategy(_))));
    assert!(Context::init_with(fast_options(), dispatcher).is_ok());
}

#[test]
fn exchanges_through_context() {
    let io = Arc::new(ScriptedIo::new([Reply::Fail(Status::IoError)]));
    let ctx = Context::init_with(fast_options(), sim_dispatcher(&io)).unwrap();
    let fd = sim_fd().unwrap();

    let mut channel = ctx.channel_for(&fd, 6);
    let mut response = [0u8; 4];
    channel.write_read(&[0x51, 0x82, 0x01, 0x10], &mut response, false).unwrap();
    drop(channel);

    assert_eq!(response, DEFAULT_RESPONSE);
    let report = ctx.report();
    assert_eq!(report.devices.len(), 1);
    assert_eq!(report.devices[0].busno, 6);
    assert_eq!(report.devices[0].try_stats[OperationClass::WriteRead.index()].succeeded_on(2), 1);
}

#[test]
fn learned_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let dsa = DsaOptions::default().with_persist(true).with_cache_path(dir.path().join("stats"));
    let opts = fast_options().with_dsa(dsa);

    let io = Arc::new(ScriptedIo::new(vec![Reply::Fail(Status::Timeout); 20]));
    let ctx = Context::init_with(opts.clone(), sim_dispatcher(&io)).unwrap();
    let fd = sim_fd().unwrap();
    {
        let mut channel = ctx.channel_for(&fd, 3);
        for _ in 0..10 {
            let _ = channel.write_only(&[0x51]);
        }
    }
    let before = ctx.store().dsa_records();
    assert_eq!(before.len(), 1);
    assert_eq!(ctx.save_stats().unwrap(), 1);
    ctx.shutdown().unwrap();

    let io = Arc::new(ScriptedIo::always_ok());
    let ctx = Context::init_with(opts, sim_dispatcher(&io)).unwrap();
    assert_eq!(ctx.store().dsa_records(), before);
    assert!(!ctx.store().get(3).unwrap().is_defined());
}

#[test]
fn corrupt_cache_does_not_fail_init() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats");
    std::fs::write(&path, "garbage\n").unwrap();

    let dsa = DsaOptions::default().with_persist(true).with_cache_path(&path);
    let io = Arc::new(ScriptedIo::always_ok());
    let ctx = Context::init_with(fast_options().with_dsa(dsa), sim_dispatcher(&io)).unwrap();

    assert!(ctx.store().is_empty());
    assert!(!path.exists());
}

#[test]
fn cache_untouched_when_not_persisting() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats");
    let record = CachedRecord {
        busno: 9,
        step: 4,
        ewma_attempts: 1.2,
        ewma_greatest: 1.0,
        timestamp: 1_760_000_000,
        edid_check_byte: None,
    };
    StatsCache::new(&path).save(DsaGeneration::Dsa2, &[record]).unwrap();
    let before = std::fs::read_to_string(&path).unwrap();

    let dsa = DsaOptions::default().with_persist(false).with_cache_path(&path);
    let io = Arc::new(ScriptedIo::always_ok());
    let ctx = Context::init_with(fast_options().with_dsa(dsa), sim_dispatcher(&io)).unwrap();
    assert!(ctx.store().is_empty());

    ctx.store().get_or_create(1);
    assert_eq!(ctx.save_stats().unwrap(), 0);
    ctx.shutdown().unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
}

#[test]
fn nothing_saved_without_persistence() {
    let io = Arc::new(ScriptedIo::always_ok());
    let dsa = DsaOptions::default().with_generation(DsaGeneration::Legacy).with_persist(true);
    let ctx = Context::init_with(fast_options().with_dsa(dsa), sim_dispatcher(&io)).unwrap();

    ctx.store().get_or_create(1);
    assert_eq!(ctx.save_stats().unwrap(), 0);
}
