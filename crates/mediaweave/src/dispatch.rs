//! Worker pools for asynchronous delivery.
//!
//! Event callbacks and session commands run on the shared worker pool; clock
//! timers run on their own pool so a slow callback never delays a timer.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;
use weaveconf::DispatchConfig;

use crate::error::{MediaError, MediaResult};

/// A tokio runtime used as a work queue.
pub struct Dispatcher {
    runtime: Runtime,
    name: String,
}

static WORKERS: OnceLock<Arc<Dispatcher>> = OnceLock::new();
static TIMERS: OnceLock<Arc<Dispatcher>> = OnceLock::new();

impl Dispatcher {
    /// Build a pool with `threads` workers.
    pub fn new(name: &str, threads: usize) -> MediaResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name(name)
            .enable_time()
            .build()
            .map_err(|e| MediaError::SourceFailed(format!("dispatcher {name}: {e}")))?;
        debug!("dispatcher {} started with {} threads", name, threads.max(1));

        Ok(Self {
            runtime,
            name: name.to_string(),
        })
    }

    /// Pool for event callbacks and session commands.
    pub fn workers(config: &DispatchConfig) -> MediaResult<Self> {
        Self::new(&format!("{}-worker", config.thread_name), config.worker_threads)
    }

    /// Pool for clock timers.
    pub fn timers(config: &DispatchConfig) -> MediaResult<Self> {
        Self::new(&format!("{}-timer", config.thread_name), config.timer_threads)
    }

    /// Process-wide worker pool built from the default configuration.
    pub fn shared_workers() -> MediaResult<Arc<Dispatcher>> {
        shared(&WORKERS, || Self::workers(&DispatchConfig::default()))
    }

    /// Process-wide timer pool built from the default configuration.
    pub fn shared_timers() -> MediaResult<Arc<Dispatcher>> {
        shared(&TIMERS, || Self::timers(&DispatchConfig::default()))
    }

    /// Size the process-wide pools from configuration. Must run before the
    /// first object that dispatches is created; returns false if the pools
    /// already exist.
    pub fn configure_shared(config: &DispatchConfig) -> MediaResult<bool> {
        if WORKERS.get().is_some() || TIMERS.get().is_some() {
            return Ok(false);
        }
        shared(&WORKERS, || Self::workers(config))?;
        shared(&TIMERS, || Self::timers(config))?;
        Ok(true)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    /// Run a synchronous work item on the pool. Work items may block.
    pub fn put_work_item<F>(&self, work: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.runtime.spawn_blocking(work)
    }

    /// Run a future on the pool.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("name", &self.name).finish()
    }
}

fn shared(
    slot: &'static OnceLock<Arc<Dispatcher>>,
    build: impl FnOnce() -> MediaResult<Dispatcher>,
) -> MediaResult<Arc<Dispatcher>> {
    if let Some(dispatcher) = slot.get() {
        return Ok(Arc::clone(dispatcher));
    }
    let built = Arc::new(build()?);
    // A racing initializer may have won; its pool is the one everybody uses.
    Ok(Arc::clone(slot.get_or_init(|| built)))
}
