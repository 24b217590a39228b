//! Shard threads
//!
//! Each shard runs on its own OS thread, optionally pinned to a core. The
//! body's outcome, including a panic, is delivered through a flume channel so
//! the epoch learns about the first failure without joining every thread.

use crate::error::{Error, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Index of a shard within its epoch
pub type ShardId = usize;

/// What a shard thread sends back when its body finishes
pub type ShardOutcome<T> = (ShardId, Result<T>);

/// Shard thread configuration
#[derive(Debug, Clone, Default)]
pub struct ShardConfig {
    /// Thread name (for debugging/monitoring)
    pub name: Option<String>,

    /// CPU core to pin the shard thread to (None = no pinning)
    pub cpu_affinity: Option<usize>,
}

impl ShardConfig {
    /// Create a new shard configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set CPU affinity
    pub fn with_cpu_affinity(mut self, cpu: usize) -> Self {
        self.cpu_affinity = Some(cpu);
        self
    }
}

/// Pin the calling thread to OS core `core`
///
/// Returns whether pinning succeeded; failure is logged and otherwise
/// ignored.
pub fn pin_current_thread(core: usize) -> bool {
    let pinned = core_affinity::set_for_current(core_affinity::CoreId { id: core });
    if !pinned {
        warn!(core, "failed to pin thread");
    }
    pinned
}

/// Handle of a running shard thread
#[derive(Debug)]
pub struct ShardHandle {
    id: ShardId,
    name: String,
    thread: Option<JoinHandle<()>>,
}

impl ShardHandle {
    /// Shard index
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to exit
    ///
    /// The body's result has already been sent on the outcome channel; this
    /// only reaps the thread.
    pub fn join(mut self) -> Result<()> {
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|payload| Error::ShardPanicked(panic_message(payload.as_ref())))?;
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Spawn shard `id` running `body`
///
/// The outcome is sent on `outcomes` exactly once. A panicking body is
/// reported as [`Error::ShardPanicked`].
pub fn spawn<T, F>(
    id: ShardId,
    config: ShardConfig,
    outcomes: flume::Sender<ShardOutcome<T>>,
    body: F,
) -> Result<ShardHandle>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let name = config
        .name
        .clone()
        .unwrap_or_else(|| format!("shard-{id}"));

    let builder = thread::Builder::new().name(name.clone());

    let cpu = config.cpu_affinity;
    let thread = builder.spawn(move || {
        if let Some(core) = cpu {
            pin_current_thread(core);
        }
        let result = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
            Err(Error::ShardPanicked(format!(
                "shard {id}: {}",
                panic_message(payload.as_ref())
            )))
        });
        if outcomes.send((id, result)).is_err() {
            debug!(shard = id, "epoch stopped listening before shard finished");
        }
    })?;

    Ok(ShardHandle {
        id,
        name,
        thread: Some(thread),
    })
}
