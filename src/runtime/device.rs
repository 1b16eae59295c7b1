//! External command sources polled once per tick
//!
//! Polling is the only concurrent phase of a tick. [`DeviceSet`] spawns one
//! poll per device, waits until a shared deadline, and hands back whatever
//! arrived in device registration order. A poll that misses the deadline
//! stays in flight; its answer is collected on a later tick and the device
//! is not polled again until then.

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};

use super::record::Tick;

/// Raw command text attributed to an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommand {
    /// Claimed executor name (validated by the kernel)
    pub executor: String,
    /// Unparsed command text
    pub text: String,
}

impl DeviceCommand {
    /// Create a command.
    pub fn new(executor: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            executor: executor.into(),
            text: text.into(),
        }
    }
}

/// A source of commands.
pub trait Device: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Produce at most one command for `tick`.
    ///
    /// The future may take as long as it likes; the kernel stops waiting at
    /// the tick deadline and picks the answer up later.
    fn poll(&self, tick: Tick) -> BoxFuture<'static, Option<DeviceCommand>>;
}

struct Slot {
    device: Arc<dyn Device>,
    in_flight: Option<JoinHandle<Option<DeviceCommand>>>,
}

/// Registered devices in polling order.
#[derive(Default)]
pub struct DeviceSet {
    slots: Vec<Slot>,
}

impl DeviceSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device; registration order is dispatch order.
    pub fn add(&mut self, device: impl Device + 'static) -> &mut Self {
        self.add_shared(Arc::new(device))
    }

    /// Register a shared device handle.
    pub fn add_shared(&mut self, device: Arc<dyn Device>) -> &mut Self {
        self.slots.push(Slot {
            device,
            in_flight: None,
        });
        self
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no devices are registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Devices whose previous poll is still running.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.in_flight.is_some())
            .count()
    }

    /// Poll every idle device and collect answers until `deadline` elapses.
    pub async fn poll(&mut self, tick: Tick, deadline: Duration) -> Vec<DeviceCommand> {
        for slot in &mut self.slots {
            if slot.in_flight.is_none() {
                slot.in_flight = Some(tokio::spawn(slot.device.poll(tick)));
            }
        }

        let deadline = Instant::now() + deadline;
        let mut commands = Vec::new();

        for slot in &mut self.slots {
            let Some(handle) = slot.in_flight.as_mut() else {
                continue;
            };
            match timeout_at(deadline, handle).await {
                Ok(Ok(answer)) => {
                    slot.in_flight = None;
                    commands.extend(answer);
                }
                Ok(Err(err)) => {
                    slot.in_flight = None;
                    tracing::warn!(tick, device = slot.device.name(), error = %err, "Device poll failed");
                }
                Err(_) => {
                    tracing::debug!(tick, device = slot.device.name(), "Device missed tick deadline");
                }
            }
        }

        commands
    }
}

impl Drop for DeviceSet {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Some(handle) = slot.in_flight.take() {
                handle.abort();
            }
        }
    }
}

/// In-memory queue handing out one command per poll.
///
/// Clones share the queue, so one handle can feed the kernel while another
/// is registered as a device.
#[derive(Clone, Default)]
pub struct QueueDevice {
    name: String,
    queue: Arc<Mutex<VecDeque<DeviceCommand>>>,
}

impl QueueDevice {
    /// Create an empty queue device.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Arc::default(),
        }
    }

    /// Queue a command.
    pub fn push(&self, executor: impl Into<String>, text: impl Into<String>) {
        self.queue
            .lock()
            .push_back(DeviceCommand::new(executor, text));
    }

    /// Commands still queued.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the queue is drained.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Device for QueueDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&self, _tick: Tick) -> BoxFuture<'static, Option<DeviceCommand>> {
        let next = self.queue.lock().pop_front();
        futures::future::ready(next).boxed()
    }
}

/// Line-oriented command source over any async reader.
pub struct LineDevice<R> {
    name: String,
    executor: Option<String>,
    lines: Arc<tokio::sync::Mutex<Lines<R>>>,
}

impl<R> LineDevice<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    /// Read `@executor \command ---` lines.
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            executor: None,
            lines: Arc::new(tokio::sync::Mutex::new(reader.lines())),
        }
    }

    /// Read bare command lines, all attributed to `executor`.
    pub fn for_entity(executor: impl Into<String>, reader: R) -> Self {
        let executor = executor.into();
        let executor = executor.strip_prefix('@').unwrap_or(&executor).to_string();
        Self {
            name: format!("@{executor}"),
            executor: Some(executor),
            lines: Arc::new(tokio::sync::Mutex::new(reader.lines())),
        }
    }
}

/// Split `@executor rest` into its parts.
pub fn split_addressed_line(line: &str) -> Option<DeviceCommand> {
    let line = line.trim();
    let rest = line.strip_prefix('@')?;
    let (executor, text) = rest.split_once(char::is_whitespace)?;
    Some(DeviceCommand::new(executor, text.trim()))
}

impl<R> Device for LineDevice<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&self, _tick: Tick) -> BoxFuture<'static, Option<DeviceCommand>> {
        let lines = Arc::clone(&self.lines);
        let executor = self.executor.clone();
        let name = self.name.clone();

        async move {
            let mut lines = lines.lock().await;
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => return None,
                    Err(err) => {
                        tracing::warn!(device = %name, error = %err, "Line device read failed");
                        return None;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match &executor {
                    Some(executor) => return Some(DeviceCommand::new(executor.clone(), line.trim())),
                    None => match split_addressed_line(&line) {
                        Some(command) => return Some(command),
                        None => {
                            // Keep the line so the rejection is visible in the log.
                            return Some(DeviceCommand::new(String::new(), line.trim()));
                        }
                    },
                }
            }
        }
        .boxed()
    }
}
