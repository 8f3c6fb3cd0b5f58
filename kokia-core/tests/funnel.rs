//! 操作ファネルのテスト

mod support;

use kokia_core::{OperationChannel, ProcessError, Startup};
use kokia_target::{Errno, LaunchInfo};
use std::sync::Arc;
use std::thread;
use support::{Call, Script};

#[test]
fn test_operations_run_in_order_on_the_tracer_thread() {
    let script = Script::new(&[100]);
    let (channel, tids) = OperationChannel::start(
        Arc::clone(&script.backend),
        Startup::Launch(LaunchInfo::new("/bin/demo")),
    )
    .unwrap();
    assert_eq!(tids, vec![100]);

    channel.set_options(100).unwrap();
    assert_eq!(script.backend.options_set(), vec![100]);

    for tid in 1..=5 {
        channel.resume(tid, None).unwrap();
    }
    channel.read_registers(100).unwrap();

    for tid in 1..=5 {
        assert_eq!(script.next_call(), Call::Resume { tid, signal: None });
    }

    // 起動も含めて全てファネルスレッドで実行されている
    let names = script.backend.executing_threads();
    assert_eq!(names.len(), 8);
    assert!(names.iter().all(|name| name.as_deref() == Some("kokia-funnel")));
}

#[test]
fn test_concurrent_submitters_each_get_their_own_result() {
    let script = Script::new(&[100]);
    let (channel, _) =
        OperationChannel::start(Arc::clone(&script.backend), Startup::Attach(100)).unwrap();
    let channel = Arc::new(channel);

    let workers: Vec<_> = (0..4u8)
        .map(|n| {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                let addr = 0x1000 * (n as u64 + 1);
                for round in 0..25u8 {
                    let data = [n, round, n ^ round];
                    channel.write_memory(100, addr, &data).unwrap();
                    assert_eq!(channel.read_memory(100, addr, 3).unwrap(), data);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_startup_failure_is_reported() {
    let script = Script::new(&[100]);
    let result = OperationChannel::start(
        Arc::clone(&script.backend),
        Startup::Launch(LaunchInfo::new("")),
    );
    assert!(matches!(result, Err(ProcessError::Launch(_))));

    let result = OperationChannel::start(Arc::clone(&script.backend), Startup::Attach(7));
    assert!(matches!(result, Err(ProcessError::Attach(_))));
}

#[test]
fn test_submit_after_shutdown_fails() {
    let script = Script::new(&[100]);
    let (channel, _) =
        OperationChannel::start(Arc::clone(&script.backend), Startup::Attach(100)).unwrap();

    channel.shutdown();
    channel.shutdown();

    let err = channel.resume(100, None).unwrap_err();
    assert_eq!(err.errno(), Errno::ESRCH);
    script.assert_quiet();
}
