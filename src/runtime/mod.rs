//! Kernel orchestrator and public API
//!
//! [`Kernel`] owns the execution log, the handler registry, the devices and
//! the wake scheduler, and drives them one tick at a time:
//!
//! 1. dispatch resume commands queued by the previous tick
//! 2. poll devices until the tick deadline
//! 3. parse and dispatch polled commands in device order
//! 4. seal the tick
//! 5. evaluate pending wake conditions against the sealed log

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

pub mod condition;
pub mod device;
pub mod error;
pub mod handlers;
pub mod journal;
pub mod record;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod views;

use crate::grammar::{self, Command, Node};
use device::DeviceSet;
use error::{KernelError, KernelResult};
use journal::{ExecutionLog, LogReader};
use record::{ERROR_PREFIX, EntityId, ExecutionRecord, RecordPosition, SegmentHeader, Tick};
use registry::{HandlerRegistry, Invocation, Outcome};
use scheduler::{WakeId, WakeRegistration, WakeScheduler, WakeState};
use storage::Storage;

/// Verb of records logged for input that never reached a handler.
pub const REJECTED_VERB: &str = "rejected";

/// Configuration for the kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Persistence directory; `None` keeps the log in memory
    pub root: Option<PathBuf>,

    /// Pacing of [`Kernel::run`] in milliseconds
    pub tick_interval_ms: u64,

    /// How long device polling may take per tick, in milliseconds
    pub poll_deadline_ms: u64,

    /// Verbs that count as writing to a public stream
    pub public_verbs: Vec<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            root: None,
            tick_interval_ms: 1000,
            poll_deadline_ms: 250,
            public_verbs: vec!["publish".to_string()],
        }
    }
}

impl KernelConfig {
    /// Default configuration persisted under `root`.
    pub fn persistent(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }
}

/// What happened during one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// The sealed tick
    pub tick: Tick,
    /// Resume commands dispatched at the start of the tick
    pub resumed: usize,
    /// Commands received from devices
    pub received: usize,
    /// Device input rejected before dispatch
    pub rejected: usize,
    /// Dispatches that ended in an `ERROR:` output
    pub failed: usize,
    /// Registrations satisfied by this tick, resumed next tick
    pub woken: Vec<WakeId>,
    /// Registrations whose condition could not be evaluated
    pub failed_wakes: Vec<WakeId>,
    /// Seal header of the tick
    pub header: SegmentHeader,
}

/// The tick-driven execution kernel.
pub struct Kernel {
    config: KernelConfig,
    log: ExecutionLog,
    registry: HandlerRegistry,
    devices: DeviceSet,
    scheduler: WakeScheduler,
    resumes: VecDeque<(EntityId, Command)>,
}

impl Kernel {
    /// Create a kernel, recovering log and wake state if `config.root` holds any.
    pub fn new(
        config: KernelConfig,
        registry: HandlerRegistry,
        devices: DeviceSet,
    ) -> KernelResult<Self> {
        let log = match &config.root {
            Some(root) => ExecutionLog::open(Storage::new(root.clone()))?,
            None => ExecutionLog::in_memory(),
        };
        let scheduler = WakeScheduler::new(config.public_verbs.clone());

        let mut kernel = Self {
            config,
            log,
            registry,
            devices,
            scheduler,
            resumes: VecDeque::new(),
        };
        kernel.recover()?;
        Ok(kernel)
    }

    /// Initialize storage directories and write the configuration.
    pub fn init(config: &KernelConfig) -> KernelResult<()> {
        let root = config
            .root
            .as_ref()
            .ok_or_else(|| KernelError::Config("init requires a root directory".into()))?;
        storage::init_storage(root)?;
        storage::write_config(root, config)?;
        Ok(())
    }

    /// Load a kernel from a root previously set up with [`Kernel::init`].
    pub fn load(
        root: impl Into<PathBuf>,
        registry: HandlerRegistry,
        devices: DeviceSet,
    ) -> KernelResult<Self> {
        let root = root.into();
        let mut config = storage::load_config(&root)?;
        config.root = Some(root);
        Self::new(config, registry, devices)
    }

    /// Rebuild scheduler state from the sealed log.
    ///
    /// Markers and resumes produced by evaluating the last sealed tick live
    /// only in the open tick, so that evaluation is simply repeated.
    fn recover(&mut self) -> KernelResult<()> {
        let reader = self.log.reader();
        self.scheduler.catch_up(&reader);

        if let Some(head) = reader.sealed_head() {
            let (woken, failed) = self.evaluate_wakes()?;
            tracing::info!(
                head,
                pending = self.scheduler.pending().count(),
                requeued = woken.len(),
                failed = failed.len(),
                "Recovered kernel state"
            );
        }
        Ok(())
    }

    /// Current configuration
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Tick currently open for appends
    pub fn current_tick(&self) -> Tick {
        self.log.open_tick()
    }

    /// Reader over sealed ticks
    pub fn reader(&self) -> LogReader {
        self.log.reader()
    }

    /// Registrations still waiting, in registration order
    pub fn pending_wakes(&self) -> Vec<WakeRegistration> {
        self.scheduler.pending().cloned().collect()
    }

    /// Resume commands waiting for the next tick
    pub fn queued_resumes(&self) -> Vec<(EntityId, Command)> {
        self.resumes.iter().cloned().collect()
    }

    /// Records appended to the open tick so far
    pub fn open_records(&self) -> &[ExecutionRecord] {
        self.log.pending()
    }

    /// Parse, dispatch and append a command into the open tick right away.
    pub fn execute_now(&mut self, executor: &str, text: &str) -> KernelResult<ExecutionRecord> {
        let (position, _) = self.submit(executor, text)?;
        self.log
            .pending()
            .get(position.index)
            .cloned()
            .ok_or_else(|| KernelError::Storage(format!("record {position} vanished from the open tick")))
    }

    /// Run one full tick.
    pub async fn tick(&mut self) -> KernelResult<TickReport> {
        let tick = self.log.open_tick();
        tracing::debug!(tick, "Tick started");

        let mut failed = 0;

        let resumes: Vec<_> = self.resumes.drain(..).collect();
        let resumed = resumes.len();
        for (entity, command) in resumes {
            if self.dispatch_and_append(entity, command)?.1 != Outcome::Completed {
                failed += 1;
            }
        }

        let deadline = Duration::from_millis(self.config.poll_deadline_ms);
        let commands = self.devices.poll(tick, deadline).await;
        let received = commands.len();

        let mut rejected = 0;
        for command in commands {
            match self.submit(&command.executor, &command.text)?.1 {
                None => rejected += 1,
                Some(Outcome::Completed) => {}
                Some(_) => failed += 1,
            }
        }

        let header = self.log.seal_tick(Utc::now())?;
        let (woken, failed_wakes) = self.evaluate_wakes()?;

        tracing::info!(
            tick,
            records = header.records,
            resumed,
            received,
            rejected,
            failed,
            woken = woken.len(),
            "Tick sealed"
        );

        Ok(TickReport {
            tick,
            resumed,
            received,
            rejected,
            failed,
            woken,
            failed_wakes,
            header,
        })
    }

    /// Run `ticks` ticks paced by `tick_interval_ms`.
    pub async fn run(&mut self, ticks: u64) -> KernelResult<Vec<TickReport>> {
        let mut interval = self.interval();
        let mut reports = Vec::new();
        for _ in 0..ticks {
            interval.tick().await;
            reports.push(self.tick().await?);
        }
        Ok(reports)
    }

    /// Run ticks until `shutdown` completes. A tick in progress is finished first.
    pub async fn run_until<F>(&mut self, shutdown: F) -> KernelResult<()>
    where
        F: Future<Output = ()>,
    {
        let mut interval = self.interval();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!(tick = self.log.open_tick(), "Kernel shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }
            self.tick().await?;
        }
    }

    fn interval(&self) -> tokio::time::Interval {
        let period = Duration::from_millis(self.config.tick_interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    /// Validate, parse, dispatch and append one piece of raw input.
    ///
    /// The outcome is `None` when the input was rejected before dispatch.
    fn submit(&mut self, executor: &str, text: &str) -> KernelResult<(RecordPosition, Option<Outcome>)> {
        let Some(entity) = EntityId::parse(executor) else {
            let reason = format!("{ERROR_PREFIX} Invalid executor '{executor}'");
            return self.reject(EntityId::kernel(), text, reason);
        };
        if entity.is_kernel() {
            let reason = format!("{ERROR_PREFIX} Executor '{executor}' is reserved");
            return self.reject(EntityId::kernel(), text, reason);
        }

        match grammar::parse(text) {
            Ok(command) => {
                let (position, outcome) = self.dispatch_and_append(entity, command)?;
                Ok((position, Some(outcome)))
            }
            Err(err) => {
                tracing::debug!(executor = %entity, error = %err, "Rejected unparseable command");
                let reason = format!("{ERROR_PREFIX} {err}");
                self.reject(entity, text, reason)
            }
        }
    }

    fn reject(
        &mut self,
        executor: EntityId,
        text: &str,
        reason: String,
    ) -> KernelResult<(RecordPosition, Option<Outcome>)> {
        let nodes = if text.is_empty() {
            Vec::new()
        } else {
            vec![Node::Text(text.to_string())]
        };
        let tick = self.log.open_tick();
        let command = Command::new(REJECTED_VERB, nodes);
        let position = self.log.append(tick, executor, command, reason, Utc::now())?;
        Ok((position, None))
    }

    fn dispatch_and_append(
        &mut self,
        executor: EntityId,
        command: Command,
    ) -> KernelResult<(RecordPosition, Outcome)> {
        let tick = self.log.open_tick();
        let reader = self.log.reader();
        let dispatched = self.registry.dispatch(&Invocation {
            command: &command,
            executor: &executor,
            tick,
            log: &reader,
        });
        let position = self
            .log
            .append(tick, executor, command, dispatched.output, Utc::now())?;
        Ok((position, dispatched.outcome))
    }

    /// Evaluate wakes against the last sealed tick and stage the results in
    /// the open tick.
    fn evaluate_wakes(&mut self) -> KernelResult<(Vec<WakeId>, Vec<WakeId>)> {
        let reader = self.log.reader();
        let resolutions = self.scheduler.evaluate(&reader)?;

        let mut woken = Vec::new();
        let mut failed = Vec::new();
        let tick = self.log.open_tick();

        for resolution in resolutions {
            let id = resolution.registration.id;
            if let Some((entity, resume)) = resolution.resume() {
                self.resumes.push_back((entity.clone(), resume.clone()));
            }
            match resolution.registration.state {
                WakeState::Failed(_) => failed.push(id),
                _ => woken.push(id),
            }
            self.log.append(
                tick,
                EntityId::kernel(),
                resolution.marker,
                resolution.output,
                Utc::now(),
            )?;
        }

        Ok((woken, failed))
    }
}

// Re-export commonly used types
pub use device::{Device, DeviceCommand, LineDevice, QueueDevice};
pub use error::{ConditionError, HandlerError, HandlerResult, LogError};
pub use handlers::{ResumeHandler, WakeHandler, WakeRequest};
pub use registry::{Dispatched, Handler, RegistryBuilder};
pub use views::{Checkpoint, LogView, SpaceDirectory};
pub use scheduler::WakeTable;
