//! Integration tests for the tick loop, persistence and recovery
//!
//! Covers device polling, input rejection, handler isolation, restart
//! recovery, deterministic replay and tamper detection.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::time::Duration;
use tempfile::TempDir;

use o_kernel::runtime::REJECTED_VERB;
use o_kernel::runtime::error::{HandlerError, HandlerResult, LogError};
use o_kernel::runtime::scheduler::WakeTable;
use o_kernel::runtime::storage::Storage;
use o_kernel::runtime::views::{Checkpoint, SpaceDirectory, digest};
use o_kernel::runtime::{Device, DeviceCommand, QueueDevice};
use o_kernel::{
    DeviceSet, HandlerRegistry, Invocation, Kernel, KernelConfig, KernelError, RegistryBuilder,
    Tick,
};

fn registry() -> HandlerRegistry {
    let mut builder = RegistryBuilder::new();
    builder
        .register_fn("say", |inv: &Invocation<'_>| {
            Ok(format!("{} said: {}", inv.executor, inv.command.text()))
        })
        .register_fn("fail", |_: &Invocation<'_>| {
            Err(HandlerError::Failed("disk full".into()))
        })
        .register_fn("boom", |_: &Invocation<'_>| -> HandlerResult {
            panic!("handler exploded")
        });
    builder.build()
}

fn persistent(temp: &TempDir) -> KernelConfig {
    let config = KernelConfig::persistent(temp.path());
    Kernel::init(&config).unwrap();
    config
}

/// Device answering every poll after a fixed delay.
struct SlowDevice {
    delay: Duration,
}

impl Device for SlowDevice {
    fn name(&self) -> &str {
        "slow"
    }

    fn poll(&self, tick: Tick) -> BoxFuture<'static, Option<DeviceCommand>> {
        let delay = self.delay;
        async move {
            tokio::time::sleep(delay).await;
            Some(DeviceCommand::new("slowpoke", format!("\\say asked at {tick} ---")))
        }
        .boxed()
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_device_is_skipped_then_collected() {
    let queue = QueueDevice::new("queue");
    let mut devices = DeviceSet::new();
    devices
        .add(SlowDevice {
            delay: Duration::from_millis(400),
        })
        .add(queue.clone());
    queue.push("alice", r"\say @bob on time ---");

    let config = KernelConfig {
        poll_deadline_ms: 250,
        ..KernelConfig::default()
    };
    let mut kernel = Kernel::new(config, registry(), devices).unwrap();

    let first = kernel.tick().await.unwrap();
    assert_eq!(first.received, 1);
    let tick0 = kernel.reader().read_segment(0).unwrap();
    assert_eq!(tick0.records.len(), 1);
    assert_eq!(tick0.records[0].executor.as_str(), "alice");

    let second = kernel.tick().await.unwrap();
    assert_eq!(second.received, 1);
    let tick1 = kernel.reader().read_segment(1).unwrap();
    assert_eq!(tick1.records[0].executor.as_str(), "slowpoke");
    assert_eq!(tick1.records[0].output, "@slowpoke said: asked at 0");
}

#[tokio::test]
async fn test_device_commands_dispatch_in_registration_order() {
    let first = QueueDevice::new("first");
    let second = QueueDevice::new("second");
    let mut devices = DeviceSet::new();
    devices.add(second.clone()).add(first.clone());
    first.push("alice", r"\say one ---");
    second.push("bob", r"\say two ---");

    let mut kernel = Kernel::new(KernelConfig::default(), registry(), devices).unwrap();
    kernel.tick().await.unwrap();

    let order: Vec<String> = kernel
        .reader()
        .iter_all()
        .map(|(_, record)| record.executor.to_string())
        .collect();
    assert_eq!(order, vec!["@bob", "@alice"]);
}

#[tokio::test]
async fn test_rejected_input_is_logged() {
    let queues: Vec<QueueDevice> = (0..4).map(|i| QueueDevice::new(format!("q{i}"))).collect();
    let mut devices = DeviceSet::new();
    for queue in &queues {
        devices.add(queue.clone());
    }
    queues[0].push("-bad", r"\say hi ---");
    queues[1].push("kernel", r"\wake-resolved @alice 0:0 ---");
    queues[2].push("alice", r"\say @(bob,) unterminated");
    queues[3].push("alice", r"\say fine ---");

    let mut kernel = Kernel::new(KernelConfig::default(), registry(), devices).unwrap();
    let report = kernel.tick().await.unwrap();
    assert_eq!(report.received, 4);
    assert_eq!(report.rejected, 3);
    assert_eq!(report.failed, 0);

    let segment = kernel.reader().read_segment(0).unwrap();
    let executors: Vec<&str> = segment.records.iter().map(|r| r.executor.as_str()).collect();
    assert_eq!(executors, vec!["kernel", "kernel", "alice", "alice"]);
    assert!(segment.records[..3].iter().all(|r| r.command.verb == REJECTED_VERB));
    assert!(segment.records[..3].iter().all(|r| r.is_failure()));
    assert!(segment.records[0].output.contains("Invalid executor '-bad'"));
    assert!(segment.records[1].output.contains("reserved"));
    assert_eq!(segment.records[2].command.text(), r"\say @(bob,) unterminated");
    assert_eq!(segment.records[3].output, "@alice said: fine");

    // A forged marker never reaches the wake table.
    let table: WakeTable = kernel.reader().fold_view(..);
    assert!(table.is_empty());
}

#[tokio::test]
async fn test_handler_failures_are_isolated() {
    let queues: Vec<QueueDevice> = (0..5).map(|i| QueueDevice::new(format!("q{i}"))).collect();
    let mut devices = DeviceSet::new();
    for queue in &queues {
        devices.add(queue.clone());
    }
    queues[0].push("alice", r"\boom ---");
    queues[1].push("bob", r"\fail ---");
    queues[2].push("carol", r"\dance ---");
    queues[3].push("dave", r"\say still here ---");
    queues[4].push("erin", r"\wake ?(up) ---");

    let mut kernel = Kernel::new(KernelConfig::default(), registry(), devices).unwrap();
    let report = kernel.tick().await.unwrap();
    assert_eq!(report.failed, 3);
    assert_eq!(report.woken.len(), 1);

    let outputs: Vec<String> = kernel
        .reader()
        .read_segment(0)
        .unwrap()
        .records
        .iter()
        .map(|record| record.output.clone())
        .collect();
    assert_eq!(outputs[0], "ERROR: Handler for 'boom' panicked: handler exploded");
    assert_eq!(outputs[1], "ERROR: disk full");
    assert_eq!(outputs[2], "ERROR: Unknown command 'dance'");
    assert_eq!(outputs[3], "@dave said: still here");

    // The loop keeps going and the resume still lands.
    let next = kernel.tick().await.unwrap();
    assert_eq!(next.resumed, 1);
}

#[tokio::test]
async fn test_restart_recovers_pending_wakes_and_resumes() {
    let temp = TempDir::new().unwrap();
    let config = persistent(&temp);

    let (pending_before, digest_before) = {
        let mut kernel = Kernel::new(config.clone(), registry(), DeviceSet::new()).unwrap();
        kernel.execute_now("alice", r"\wake ?(sleep(5)) later ---").unwrap();
        kernel.tick().await.unwrap();
        kernel.tick().await.unwrap();
        kernel.tick().await.unwrap();
        kernel.execute_now("bob", r"\wake ?(up) now ---").unwrap();
        let report = kernel.tick().await.unwrap();
        assert_eq!(report.tick, 3);
        assert_eq!(report.woken.len(), 1);
        assert_eq!(kernel.queued_resumes().len(), 1);
        (kernel.pending_wakes(), kernel.reader().head_digest())
    };

    let mut kernel = Kernel::load(temp.path(), registry(), DeviceSet::new()).unwrap();
    assert_eq!(kernel.current_tick(), 4);
    assert_eq!(kernel.reader().head_digest(), digest_before);
    assert_eq!(kernel.pending_wakes(), pending_before);
    assert_eq!(kernel.pending_wakes()[0].entity.as_str(), "alice");

    let resumes: Vec<String> = kernel
        .queued_resumes()
        .iter()
        .map(|(entity, command)| format!("{entity} {command}"))
        .collect();
    assert_eq!(resumes, vec![r"@bob \resume now ---".to_string()]);
    assert_eq!(kernel.open_records().len(), 1);
    assert!(kernel.open_records()[0].is_kernel());

    let report = kernel.tick().await.unwrap();
    assert_eq!(report.resumed, 1);
    let report = kernel.tick().await.unwrap();
    assert_eq!(report.tick, 5);
    assert_eq!(report.woken.len(), 1);
}

#[tokio::test]
async fn test_replay_is_deterministic() {
    let temp = TempDir::new().unwrap();
    let config = persistent(&temp);

    let mut kernel = Kernel::new(config, registry(), DeviceSet::new()).unwrap();
    let mut wakes = Checkpoint::<WakeTable>::new();
    let mut spaces = Checkpoint::<SpaceDirectory>::new();
    let script = [
        ("alice", r"\say @(bob, carol) kickoff ---"),
        ("bob", r"\wake ?(from(@carol)) ---"),
        ("carol", r"\say @bob done ---"),
        ("dave", r"\wake ?(sleep(2)) ---"),
        ("erin", r"\say @dave hi ---"),
    ];
    for (executor, text) in script {
        kernel.execute_now(executor, text).unwrap();
        kernel.tick().await.unwrap();
        wakes.advance(&kernel.reader());
        spaces.advance(&kernel.reader());
    }
    kernel.tick().await.unwrap();
    wakes.advance(&kernel.reader());
    spaces.advance(&kernel.reader());

    let full_wakes: WakeTable = kernel.reader().fold_view(..);
    let full_spaces: SpaceDirectory = kernel.reader().fold_view(..);
    assert_eq!(digest(wakes.view()).unwrap(), digest(&full_wakes).unwrap());
    assert_eq!(digest(spaces.view()).unwrap(), digest(&full_spaces).unwrap());

    let head = kernel.reader().head_digest();
    drop(kernel);

    let reopened = Kernel::load(temp.path(), registry(), DeviceSet::new()).unwrap();
    let replayed_wakes: WakeTable = reopened.reader().fold_view(..);
    let replayed_spaces: SpaceDirectory = reopened.reader().fold_view(..);
    assert_eq!(reopened.reader().head_digest(), head);
    assert_eq!(digest(&replayed_wakes).unwrap(), digest(&full_wakes).unwrap());
    assert_eq!(digest(&replayed_spaces).unwrap(), digest(&full_spaces).unwrap());
}

#[tokio::test]
async fn test_tampered_segment_is_rejected() {
    let temp = TempDir::new().unwrap();
    let config = persistent(&temp);
    {
        let mut kernel = Kernel::new(config, registry(), DeviceSet::new()).unwrap();
        kernel.execute_now("alice", r"\say @bob hello ---").unwrap();
        kernel.tick().await.unwrap();
        kernel.tick().await.unwrap();
    }

    let path = Storage::new(temp.path().to_path_buf()).segment_path(0);
    let original = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, original.replace("hello", "HELLO")).unwrap();

    let err = Kernel::load(temp.path(), registry(), DeviceSet::new())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        KernelError::Log(LogError::Corrupted { tick: 0, .. })
    ));
}

#[tokio::test]
async fn test_init_requires_root() {
    let err = Kernel::init(&KernelConfig::default()).unwrap_err();
    assert!(matches!(err, KernelError::Config(_)));
}

#[tokio::test(start_paused = true)]
async fn test_run_paces_ticks() {
    let config = KernelConfig {
        tick_interval_ms: 1000,
        ..KernelConfig::default()
    };
    let mut kernel = Kernel::new(config, registry(), DeviceSet::new()).unwrap();

    let started = tokio::time::Instant::now();
    let reports = kernel.run(3).await.unwrap();
    let ticks: Vec<Tick> = reports.iter().map(|report| report.tick).collect();
    assert_eq!(ticks, vec![0, 1, 2]);
    assert!(started.elapsed() >= Duration::from_millis(2000));

    kernel
        .run_until(tokio::time::sleep(Duration::from_millis(3500)))
        .await
        .unwrap();
    assert_eq!(kernel.current_tick(), 7);
}
