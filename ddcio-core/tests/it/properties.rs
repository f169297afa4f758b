use std::sync::Arc;

use ddcio_common::{constants::MaxMaxTries, IoMode, OperationClass, SleepEvent, Status};
use ddcio_core::{
    dsa::{step_to_multiplier, ResultsTable, STEP_LAST},
    CoreOptions, DeviceStore, DsaOptions, Outcome, Pacer, PacingOptions, RetryEngine,
    RetryOptions, SleepController, SleepOverride, TryOutcome,
};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

const RETRYABLE: [Status; 4] =
    [Status::IoError, Status::Timeout, Status::DeviceBusy, Status::BadByteCount];

#[test]
fn attempts_never_exceed_maxtries() {
    let mut rng = StdRng::seed_from_u64(0xDDC);
    let store = Arc::new(DeviceStore::new(&CoreOptions::default()));
    let engine = RetryEngine::new(Arc::clone(&store), RetryOptions::default())
        .with_stats(Box::leak(Box::default()));

    for round in 0..200u32 {
        let class = *OperationClass::ALL.choose(&mut rng).unwrap();
        let device = store.get_or_create(round % 4);
        let maxtries = device.set_maxtries(class, rng.gen_range(1..=MaxMaxTries));
        let before = device.try_stats(class);
        let failure_rate = rng.gen_range(0.0..=1.0);

        let mut calls = 0u16;
        let result = engine.try_op(class, &device, || {
            calls += 1;
            if rng.gen_bool(failure_rate) {
                Err(*RETRYABLE.choose(&mut rng).unwrap())
            } else {
                Ok(())
            }
        });

        assert!(calls <= maxtries);
        let after = device.try_stats(class);
        assert_eq!(after.total(), before.total() + 1);

        let slot = match &result {
            Ok(()) => TryOutcome::Succeeded(calls).slot(),
            Err(e) => {
                assert_eq!(e.status(), Status::RetriesExhausted);
                assert_eq!(calls, maxtries);
                assert_eq!(e.causes().len(), maxtries as usize);
                1
            }
        };
        assert_eq!(after.slot(slot), before.slot(slot) + 1);
    }
}

#[test]
fn step_moves_at_most_one_per_loop() {
    let mut rng = StdRng::seed_from_u64(7);
    let opts = DsaOptions::default().with_step_floor(2);
    let mut table = ResultsTable::new(1, &opts, 5);

    for _ in 0..2_000 {
        let before = table.step();
        let maxtries: u16 = rng.gen_range(1..=10);
        let failures = if rng.gen_bool(0.2) { maxtries } else { rng.gen_range(0..maxtries) };

        for attempt in 1..=failures {
            table.note_retryable_failure(Status::IoError, maxtries - attempt);
            let loop_step = table.loop_step();
            assert!((table.step()..=STEP_LAST).contains(&loop_step));
        }

        let outcome = if failures == maxtries {
            Outcome::Exhausted
        } else if rng.gen_bool(0.05) {
            Outcome::Fatal
        } else {
            Outcome::Succeeded
        };
        let attempts = if outcome == Outcome::Succeeded { failures + 1 } else { failures };
        table.record_final(outcome, attempts, false);

        let after = table.step();
        assert!(before.abs_diff(after) <= 1, "{before} -> {after}");
        assert!((2..=STEP_LAST).contains(&after));
        if outcome == Outcome::Fatal {
            assert_eq!(before, after);
        }
        assert_eq!(table.adjusted_sleep_multiplier(), step_to_multiplier(after));
    }
}

#[test]
fn pacing_matches_formula() {
    let mut rng = StdRng::seed_from_u64(11);
    let pacer = Pacer::new(PacingOptions::default());

    for _ in 0..500 {
        let event = SleepEvent::ALL[rng.gen_range(0..SleepEvent::COUNT)];
        let ct: u16 = rng.gen_range(0..=10);
        let multiplier: f32 = rng.gen_range(0.0..=2.0);
        let base = pacer.options().default_millis(IoMode::I2c, event) as f32;

        let millis = pacer
            .effective_millis(IoMode::I2c, event, ct, multiplier, SleepOverride::UseDefault)
            .unwrap();
        let expected = base * ct.max(1) as f32 * multiplier;
        assert!((millis as f32 - expected).abs() <= 0.5 + f32::EPSILON * expected);
    }
}
