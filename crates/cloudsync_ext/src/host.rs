//! The extension host: function table, sync worker and handle table.

use crate::error::{BridgeError, BridgeResult};
use crate::registry::FunctionRegistry;
use crate::value::{arg, HostValue};
use cloudsync_engine::{CycleControl, SyncEngine, SyncError, SyncState, SyncTransport, TriggerPolicy};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};

/// Library version reported by `cloudsync_version()`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Finished cycles kept queryable after they end.
const RETAINED_HANDLES: usize = 64;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Identifies one triggered sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncHandle(pub i64);

struct HandleTable {
    next: i64,
    cycles: BTreeMap<i64, Arc<CycleControl>>,
    running: Option<i64>,
    follow_up: bool,
}

impl HandleTable {
    fn issue(&mut self) -> (i64, Arc<CycleControl>) {
        if self.cycles.len() >= RETAINED_HANDLES {
            let oldest_finished = self
                .cycles
                .iter()
                .find(|(_, control)| control.is_finished())
                .map(|(id, _)| *id);
            if let Some(id) = oldest_finished {
                self.cycles.remove(&id);
            }
        }

        let id = self.next;
        self.next += 1;
        let control = Arc::new(CycleControl::new());
        self.cycles.insert(id, Arc::clone(&control));
        (id, control)
    }
}

struct Core<T: SyncTransport> {
    engine: Arc<SyncEngine<T>>,
    table: Mutex<HandleTable>,
    policy: TriggerPolicy,
    runtime: Handle,
}

impl<T: SyncTransport + 'static> Core<T> {
    fn trigger(self: &Arc<Self>) -> BridgeResult<SyncHandle> {
        let mut table = self.table.lock();
        if let Some(running) = table.running {
            return match self.policy {
                TriggerPolicy::Reject => {
                    debug!(running, "trigger rejected, cycle already running");
                    Err(SyncError::SyncAlreadyRunning.into())
                }
                TriggerPolicy::Coalesce => {
                    table.follow_up = true;
                    debug!(running, "trigger coalesced into follow-up cycle");
                    Ok(SyncHandle(running))
                }
            };
        }

        let (id, control) = table.issue();
        table.running = Some(id);
        drop(table);

        info!(handle = id, "sync triggered");
        let core = Arc::clone(self);
        drop(self.runtime.spawn_blocking(move || core.work(id, control)));
        Ok(SyncHandle(id))
    }

    /// Runs cycles until no follow-up is pending.
    fn work(&self, mut id: i64, mut control: Arc<CycleControl>) {
        loop {
            if let Err(e) = self.engine.run_cycle(&control) {
                debug!(handle = id, error = %e, "cycle ended without completing");
            }

            let mut table = self.table.lock();
            if !table.follow_up {
                table.running = None;
                return;
            }
            table.follow_up = false;
            let (next_id, next_control) = table.issue();
            table.running = Some(next_id);
            debug!(handle = next_id, "starting follow-up cycle");
            id = next_id;
            control = next_control;
        }
    }

    fn control(&self, handle: SyncHandle) -> BridgeResult<Arc<CycleControl>> {
        self.table
            .lock()
            .cycles
            .get(&handle.0)
            .cloned()
            .ok_or(BridgeError::InvalidHandle(handle.0))
    }

    fn is_running(&self) -> bool {
        self.table.lock().running.is_some()
    }
}

/// Hosts one sync engine behind a table of named functions.
///
/// Cycles run on a dedicated worker runtime; host threads only ever
/// enqueue work and read status. At most one cycle is in flight.
pub struct ExtensionHost<T: SyncTransport + 'static> {
    core: Arc<Core<T>>,
    registry: FunctionRegistry,
    runtime: Option<Runtime>,
}

impl<T: SyncTransport + 'static> ExtensionHost<T> {
    /// Creates a host for `engine`, using the engine's trigger policy.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Runtime`] if the worker cannot be started.
    pub fn new(engine: SyncEngine<T>) -> BridgeResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .thread_name("cloudsync-sync")
            .enable_all()
            .build()
            .map_err(|e| BridgeError::Runtime(e.to_string()))?;

        let policy = engine.config().trigger_policy;
        let core = Arc::new(Core {
            engine: Arc::new(engine),
            table: Mutex::new(HandleTable {
                next: 1,
                cycles: BTreeMap::new(),
                running: None,
                follow_up: false,
            }),
            policy,
            runtime: runtime.handle().clone(),
        });

        let mut registry = FunctionRegistry::new();
        register_functions(&mut registry, &core);

        Ok(Self {
            core,
            registry,
            runtime: Some(runtime),
        })
    }

    /// Calls a registered function by name.
    ///
    /// # Errors
    ///
    /// See [`FunctionRegistry::call`].
    pub fn call(&self, name: &str, args: &[HostValue]) -> BridgeResult<HostValue> {
        self.registry.call(name, args)
    }

    /// The function table.
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// The hosted engine.
    pub fn engine(&self) -> &Arc<SyncEngine<T>> {
        &self.core.engine
    }

    /// Starts a cycle, or applies the trigger policy if one is running.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SyncAlreadyRunning`] under
    /// [`TriggerPolicy::Reject`] while a cycle runs.
    pub fn trigger_sync(&self) -> BridgeResult<SyncHandle> {
        self.core.trigger()
    }

    /// Phase of the cycle behind `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidHandle`] for handles never issued or
    /// long since retired.
    pub fn get_status(&self, handle: SyncHandle) -> BridgeResult<SyncState> {
        Ok(self.core.control(handle)?.state())
    }

    /// Requests cancellation of the cycle behind `handle`.
    ///
    /// Returns false once the cycle reached `Applying` or finished. A
    /// follow-up cycle already scheduled still runs.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidHandle`] for unknown handles.
    pub fn cancel_sync(&self, handle: SyncHandle) -> BridgeResult<bool> {
        Ok(self.core.control(handle)?.cancel())
    }

    /// Blocks until the cycle behind `handle` ends or `timeout` passes.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidHandle`] for unknown handles.
    pub fn wait(&self, handle: SyncHandle, timeout: Duration) -> BridgeResult<SyncState> {
        let control = self.core.control(handle)?;
        let deadline = Instant::now() + timeout;
        while !control.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        Ok(control.state())
    }

    /// Blocks until no cycle is running or scheduled, or `timeout` passes.
    /// Returns true if the worker went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.core.is_running() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
        true
    }
}

impl<T: SyncTransport + 'static> Drop for ExtensionHost<T> {
    fn drop(&mut self) {
        let running = self.core.table.lock().running;
        if let Some(id) = running {
            if let Ok(control) = self.core.control(SyncHandle(id)) {
                control.cancel();
            }
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
        }
    }
}

fn version_value(version: cloudsync_protocol::Version) -> HostValue {
    HostValue::Integer(i64::try_from(version.0).unwrap_or(i64::MAX))
}

fn register_functions<T: SyncTransport + 'static>(
    registry: &mut FunctionRegistry,
    core: &Arc<Core<T>>,
) {
    registry.register("cloudsync_version", 0, |_| Ok(VERSION.into()));

    let c = Arc::clone(core);
    registry.register("cloudsync_siteid", 0, move |_| {
        Ok(HostValue::Blob(c.engine.replica().id().as_bytes().to_vec()))
    });

    let c = Arc::clone(core);
    registry.register("cloudsync_trigger_sync", 0, move |_| {
        c.trigger().map(|handle| HostValue::Integer(handle.0))
    });

    let c = Arc::clone(core);
    registry.register("cloudsync_get_status", 1, move |args| {
        let handle = SyncHandle(arg("cloudsync_get_status", args, 0)?);
        Ok(c.control(handle)?.state().to_string().into())
    });

    let c = Arc::clone(core);
    registry.register("cloudsync_cancel_sync", 1, move |args| {
        let handle = SyncHandle(arg("cloudsync_cancel_sync", args, 0)?);
        Ok(c.control(handle)?.cancel().into())
    });

    let c = Arc::clone(core);
    registry.register("cloudsync_set_token", 1, move |args| {
        let token: Vec<u8> = arg("cloudsync_set_token", args, 0)?;
        c.engine.set_token(token);
        Ok(HostValue::Null)
    });

    let c = Arc::clone(core);
    registry.register("cloudsync_reset_fault", 0, move |_| {
        c.engine.reset_fault();
        Ok(HostValue::Null)
    });

    let c = Arc::clone(core);
    registry.register("cloudsync_put", 2, move |args| {
        let key: Vec<u8> = arg("cloudsync_put", args, 0)?;
        let value: Vec<u8> = arg("cloudsync_put", args, 1)?;
        let version = c.engine.replica().put(key, value)?;
        Ok(version_value(version))
    });

    let c = Arc::clone(core);
    registry.register("cloudsync_delete", 1, move |args| {
        let key: Vec<u8> = arg("cloudsync_delete", args, 0)?;
        Ok(c.engine
            .replica()
            .delete(key)?
            .map_or(HostValue::Null, version_value))
    });

    let c = Arc::clone(core);
    registry.register("cloudsync_get", 1, move |args| {
        let key: Vec<u8> = arg("cloudsync_get", args, 0)?;
        Ok(c.engine.replica().get(key).into())
    });

    let c = Arc::clone(core);
    registry.register("cloudsync_pending", 0, move |_| {
        let pending = c.engine.replica().pending_count();
        Ok(HostValue::Integer(i64::try_from(pending).unwrap_or(i64::MAX)))
    });
}
