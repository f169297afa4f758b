use std::{os::fd::AsFd, sync::Arc};

use ddcio_common::Status;
use ddcio_sim::{sim_fd, RandomIo, ScriptedIo};
use ddcio_transport::{Dispatcher, IoStrategy};

fn nvidia(_: u32) -> Option<String> {
    Some("nvidia".to_string())
}

fn i915(_: u32) -> Option<String> {
    Some("i915".to_string())
}

#[test]
fn nvidia_einval_forces_fileio() {
    let _ = tracing_subscriber::fmt::try_init();

    let fd = sim_fd().unwrap();
    let file_io = Arc::new(ScriptedIo::always_ok());
    let ioctl_io = Arc::new(ScriptedIo::new([Err(Status::Errno(libc::EINVAL))]));
    let dispatcher =
        Dispatcher::with_strategies(file_io.clone(), ioctl_io.clone()).with_driver_probe(nvidia);
    dispatcher.set_strategy(IoStrategy::Ioctl).unwrap();

    dispatcher.write(fd.as_fd(), 4, 0x37, &[0x51]).unwrap();

    assert!(dispatcher.nvidia_fallback_taken());
    assert_eq!(dispatcher.strategy(), IoStrategy::FileIo);
    assert_eq!(ioctl_io.calls(), 1);
    assert_eq!(file_io.calls(), 1);
    assert_eq!(file_io.writes(), vec![vec![0x51]]);
    assert_eq!(file_io.binds(), [0x37]);
    assert!(ioctl_io.binds().is_empty());
}

#[test]
fn fallback_read_binds_before_retrying() {
    let fd = sim_fd().unwrap();
    let file_io = Arc::new(ScriptedIo::always_ok());
    let ioctl_io = Arc::new(ScriptedIo::new([Err(Status::Errno(libc::EINVAL))]));
    let dispatcher =
        Dispatcher::with_strategies(file_io.clone(), ioctl_io).with_driver_probe(nvidia);
    dispatcher.set_strategy(IoStrategy::Ioctl).unwrap();

    let mut buf = [0u8; 4];
    dispatcher.read(fd.as_fd(), 4, 0x50, false, &mut buf).unwrap();

    assert_eq!(file_io.binds(), [0x50]);
    assert_eq!(file_io.calls(), 1);
}

#[test]
fn einval_on_other_driver_is_surfaced() {
    let _ = tracing_subscriber::fmt::try_init();

    let fd = sim_fd().unwrap();
    let ioctl_io = Arc::new(ScriptedIo::new([Err(Status::Errno(libc::EINVAL))]));
    let dispatcher = Dispatcher::with_strategies(Arc::new(ScriptedIo::always_ok()), ioctl_io)
        .with_driver_probe(i915);
    dispatcher.set_strategy(IoStrategy::Ioctl).unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(
        dispatcher.read(fd.as_fd(), 4, 0x37, false, &mut buf),
        Err(Status::Errno(libc::EINVAL))
    );
    assert!(!dispatcher.nvidia_fallback_taken());
    assert_eq!(dispatcher.strategy(), IoStrategy::Ioctl);
}

#[test]
fn threads_share_one_dispatcher() {
    let fd = Arc::new(sim_fd().unwrap());
    let io = Arc::new(RandomIo::new(0.2, 7));
    let dispatcher = Arc::new(Dispatcher::with_strategies(io.clone(), io.clone()));

    let handles: Vec<_> = (0..4)
        .map(|busno| {
            let dispatcher = Arc::clone(&dispatcher);
            let fd = Arc::clone(&fd);
            std::thread::spawn(move || {
                let mut failures = 0;
                for _ in 0..50 {
                    if dispatcher.write(fd.as_fd(), busno, 0x37, &[0x51]).is_err() {
                        failures += 1;
                    }
                }
                failures
            })
        })
        .collect();

    let failures: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(io.calls(), 200);
    assert_eq!(io.failures(), failures);
}
