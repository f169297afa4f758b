use ddcio_common::{IoEvent, OperationClass, SleepEvent, Status};
use ddcio_core::{CoreOptions, RetryOptions, SleepOverride};
use ddcio_sim::{Reply, ScriptedIo, DEFAULT_RESPONSE, NULL_MESSAGE};

use crate::{fast_pacing, Rig};

fn rig(script: Vec<Reply>) -> Rig {
    Rig::new(ScriptedIo::new(script), CoreOptions::default().with_pacing(fast_pacing()))
}

#[test]
fn write_read_fills_response() {
    let _ = tracing_subscriber::fmt::try_init();

    let rig = rig(vec![]);
    let mut channel = rig.channel(4);

    let mut response = [0u8; 4];
    channel.write_read(&[0x51, 0x82, 0x01, 0x10], &mut response, false).unwrap();

    assert_eq!(response, DEFAULT_RESPONSE);
    assert_eq!(rig.io.writes(), vec![vec![0x51, 0x82, 0x01, 0x10]]);
    assert_eq!(channel.device().try_stats(OperationClass::WriteRead).succeeded_on(1), 1);
    assert_eq!(rig.stats.sleep_event_count(SleepEvent::WriteToRead), 1);
    assert_eq!(rig.stats.sleep_event_count(SleepEvent::PostRead), 1);
    assert_eq!(rig.stats.io_event(IoEvent::WriteRead).calls(), 1);
}

#[test]
fn failed_write_skips_read() {
    let rig = rig(vec![Reply::Fail(Status::IoError)]);
    let mut channel = rig.channel(4);

    let mut response = [0u8; 4];
    channel.write_read(&[0x51], &mut response, false).unwrap();

    // Failed write, then a write and a read on the second attempt.
    assert_eq!(rig.io.calls(), 3);
    assert_eq!(channel.device().try_stats(OperationClass::WriteRead).succeeded_on(2), 1);
    assert_eq!(rig.stats.io_event(IoEvent::WriteRead).calls(), 2);
    assert_eq!(rig.stats.status_count(Status::IoError), 0);
    assert_eq!(rig.stats.sleep_event_count(SleepEvent::WriteToRead), 1);
}

#[test]
fn null_response_is_retried_with_extra_sleep() {
    let rig = rig(vec![Reply::Ok, Reply::Data(NULL_MESSAGE.to_vec())]);
    let mut channel = rig.channel(4);

    let mut response = [0u8; 6];
    channel.write_read(&[0x51], &mut response, false).unwrap();

    assert_eq!(rig.stats.sleep_event_count(SleepEvent::NullResponse), 1);
    assert_eq!(channel.device().try_stats(OperationClass::WriteRead).succeeded_on(2), 1);
}

#[test]
fn null_response_means_unsupported() {
    let rig = Rig::new(
        ScriptedIo::new([Reply::Ok, Reply::Data(NULL_MESSAGE.to_vec())]),
        CoreOptions::default()
            .with_pacing(fast_pacing())
            .with_retry(RetryOptions::default().with_null_msg_means_unsupported(true)),
    );
    let mut channel = rig.channel(4);

    let mut response = [0u8; 6];
    let err = channel.write_read(&[0x51], &mut response, false).unwrap_err();

    assert_eq!(err.status(), Status::DeterminedUnsupported);
    assert_eq!(rig.io.calls(), 2);
}

#[test]
fn all_zero_reads_end_in_all_tries_zero() {
    let script: Vec<_> = (0..3).flat_map(|_| [Reply::Ok, Reply::Data(vec![0])]).collect();
    let rig = Rig::new(
        ScriptedIo::new(script),
        CoreOptions::default()
            .with_pacing(fast_pacing())
            .with_retry(RetryOptions::default().with_maxtries(OperationClass::WriteRead, 3)),
    );
    let mut channel = rig.channel(4);

    let mut response = [0xFFu8; 8];
    let err = channel.write_read(&[0x51], &mut response, false).unwrap_err();

    assert_eq!(err.status(), Status::AllTriesZero);
    assert_eq!(err.cause_statuses(), [Status::ReadAllZero; 3]);
}

#[test]
fn fatal_read_stops_the_loop() {
    let rig = rig(vec![Reply::Ok, Reply::Fail(Status::DeviceGone(libc::ENXIO))]);
    let mut channel = rig.channel(4);

    let mut response = [0u8; 4];
    let err = channel.write_read(&[0x51], &mut response, false).unwrap_err();

    assert_eq!(err.summary(), "ENXIO(ENXIO)");
    assert_eq!(rig.io.calls(), 2);
    assert_eq!(channel.device().try_stats(OperationClass::WriteRead).fatal(), 1);
}

#[test]
fn save_settings_uses_its_own_delay() {
    let rig = rig(vec![]);
    let mut channel = rig.channel(4);

    channel.save_settings(&[0x51, 0x81, 0x0C]).unwrap();

    assert_eq!(rig.stats.sleep_event_count(SleepEvent::PostSaveSettings), 1);
    assert_eq!(rig.stats.sleep_event_count(SleepEvent::PostWrite), 0);
    assert_eq!(rig.io.writes(), vec![vec![0x51, 0x81, 0x0C]]);
}

#[test]
fn multi_part_read_under_one_loop() {
    let rig = rig(vec![Reply::Ok, Reply::Ok, Reply::Ok, Reply::Fail(Status::Timeout)]);
    let mut channel = rig.channel(4);

    let mut fragments = Vec::new();
    channel
        .with_retry(OperationClass::MultiPartRead, |ch| {
            fragments.clear();
            for offset in [0u8, 32] {
                let mut fragment = [0u8; 4];
                ch.write_read_once(&[0x51, 0x83, 0xF3, 0x00, offset], &mut fragment, false)?;
                fragments.push(fragment);
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(fragments.len(), 2);
    let hist = channel.device().try_stats(OperationClass::MultiPartRead);
    assert_eq!(hist.succeeded_on(2), 1);
}

#[test]
fn write_once_honours_override() {
    let rig = rig(vec![]);
    let mut channel = rig.channel(4);

    channel.write_once(&[0x51], SleepOverride::None).unwrap();
    assert_eq!(rig.stats.sleep_event_count(SleepEvent::PostWrite), 0);

    channel.write_once(&[0x51], SleepOverride::UseDefault).unwrap();
    assert_eq!(rig.stats.sleep_event_count(SleepEvent::PostWrite), 1);
}
