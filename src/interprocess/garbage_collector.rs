//! Heartbeat-based reclamation of orphaned shared memory segments.
//!
//! Every process that owns segments keeps a timestamp per segment (and one for
//! itself) in a registry segment shared by all processes on the machine. A
//! background thread refreshes those timestamps every second. Entries whose
//! timestamp is older than the delete threshold belong to a process that is
//! gone, and their OS objects are deleted by whichever collector notices
//! first.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use super::shared_memory::{AccessMode, SharedMemory};
use crate::error::Result;

const RUNNING_INSTANCES_KEY: &str = "running_instances";
const MEMORY_TIMESTAMPS_KEY: &str = "memory_to_timestamps";

/// Granularity of shutdown checks while the collector thread sleeps.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

type Timestamps = BTreeMap<String, DateTime<Utc>>;

/// Registry name for the current architecture, e.g. `grbg_cllctr_64`.
pub fn default_registry_name() -> String {
    format!("grbg_cllctr_{}", usize::BITS)
}

/// Tunables of the garbage collector.
#[derive(Debug, Clone)]
pub struct GarbageCollectorConfig {
    pub registry_name: String,
    pub registry_size: usize,
    pub update_interval: Duration,
    pub delete_threshold: Duration,
}

impl Default for GarbageCollectorConfig {
    fn default() -> Self {
        Self {
            registry_name: default_registry_name(),
            registry_size: 65536,
            update_interval: Duration::from_secs(1),
            delete_threshold: Duration::from_secs(10),
        }
    }
}

impl GarbageCollectorConfig {
    pub fn with_registry_name(mut self, name: impl Into<String>) -> Self {
        self.registry_name = name.into();
        self
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_delete_threshold(mut self, threshold: Duration) -> Self {
        self.delete_threshold = threshold;
        self
    }
}

#[derive(Debug, Default)]
struct Registrations {
    current: BTreeSet<String>,
    removed: BTreeSet<String>,
}

struct CollectorState {
    config: GarbageCollectorConfig,
    registry: SharedMemory,
    instance_uuid: Mutex<Option<String>>,
    registrations: Mutex<Registrations>,
}

impl CollectorState {
    fn threshold(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.delete_threshold).unwrap_or(TimeDelta::MAX)
    }

    /// One registry pass. Returns the number of segments deleted.
    fn update(&self) -> Result<usize> {
        let now = Utc::now();
        let threshold = self.threshold();
        let instance = self.instance_uuid.lock().unwrap().clone();

        let mut access = self.registry.access()?;
        if access.free_memory_size() * 2 < access.memory_size() {
            let size = access.memory_size();
            access.grow_memory(size)?;
        }

        let mut instances: Timestamps = access.value_or_default(RUNNING_INSTANCES_KEY)?;
        if let Some(uuid) = instance {
            instances.insert(uuid, now);
        }

        let mut memories: Timestamps = access.value_or_default(MEMORY_TIMESTAMPS_KEY)?;
        {
            let mut registrations = self.registrations.lock().unwrap();
            for name in std::mem::take(&mut registrations.removed) {
                memories.remove(&name);
            }
            for name in &registrations.current {
                memories.insert(name.clone(), now);
            }
        }

        let mut deleted = 0;
        memories.retain(|name, stamp| {
            if now - *stamp <= threshold {
                return true;
            }
            match SharedMemory::delete_shared_memory(name) {
                Ok(_) => {
                    info!(segment = %name, last_seen = %stamp, "Deleted orphaned shared memory");
                    deleted += 1;
                }
                Err(e) => warn!(segment = %name, error = %e, "Failed to delete orphaned shared memory"),
            }
            false
        });
        instances.retain(|_, stamp| now - *stamp <= threshold);

        access.set_value(RUNNING_INSTANCES_KEY, &instances)?;
        access.set_value(MEMORY_TIMESTAMPS_KEY, &memories)?;
        access.commit()?;
        Ok(deleted)
    }

    /// Drop this instance's heartbeat; delete the registry if nobody else is alive.
    fn remove_instance(&self) -> Result<()> {
        let Some(uuid) = self.instance_uuid.lock().unwrap().take() else {
            return Ok(());
        };

        let now = Utc::now();
        let threshold = self.threshold();
        let others_alive = {
            let mut access = self.registry.access()?;
            let mut instances: Timestamps = access.value_or_default(RUNNING_INSTANCES_KEY)?;
            instances.remove(&uuid);
            let alive = instances.values().any(|stamp| now - *stamp <= threshold);
            access.set_value(RUNNING_INSTANCES_KEY, &instances)?;
            access.commit()?;
            alive
        };

        if !others_alive {
            SharedMemory::delete_shared_memory(self.registry.name())?;
            debug!(registry = %self.registry.name(), "Deleted garbage collector registry");
        }
        Ok(())
    }
}

/// Per-process garbage collector.
///
/// Constructed once per process and handed to every [`SharedMemory`] the
/// process owns. Dropping the collector stops it.
pub struct GarbageCollector {
    state: Arc<CollectorState>,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl GarbageCollector {
    /// Open (or create) the registry. The collector stays idle until [`run`](Self::run).
    pub fn new(config: GarbageCollectorConfig) -> Result<Self> {
        let registry = SharedMemory::new(
            &config.registry_name,
            config.registry_size,
            AccessMode::OpenOrCreate,
            None,
        )?;

        Ok(Self {
            state: Arc::new(CollectorState {
                config,
                registry,
                instance_uuid: Mutex::new(None),
                registrations: Mutex::new(Registrations::default()),
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    pub fn registry_name(&self) -> &str {
        self.state.registry.name()
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().unwrap().is_some()
    }

    /// Start heartbeating as `instance_uuid` on a background thread.
    pub fn run(&self, instance_uuid: &str) -> Result<()> {
        let mut slot = self.thread.lock().unwrap();
        if slot.is_some() {
            return Ok(());
        }

        *self.state.instance_uuid.lock().unwrap() = Some(instance_uuid.to_string());
        self.shutdown.store(false, Ordering::Relaxed);

        let state = Arc::clone(&self.state);
        let shutdown = Arc::clone(&self.shutdown);
        let handle = thread::Builder::new()
            .name("shm-gc".to_string())
            .spawn(move || collector_loop(state, shutdown))?;
        *slot = Some(handle);

        info!(
            registry = %self.state.registry.name(),
            instance = instance_uuid,
            "Started shared memory garbage collector"
        );
        Ok(())
    }

    /// Stop the background thread and withdraw all of this process's entries.
    pub fn stop(&self) {
        let handle = self.thread.lock().unwrap().take();
        let Some(handle) = handle else {
            return;
        };

        self.shutdown.store(true, Ordering::Relaxed);
        let _ = handle.join();

        {
            let mut registrations = self.state.registrations.lock().unwrap();
            let current = std::mem::take(&mut registrations.current);
            registrations.removed.extend(current);
        }

        if let Err(e) = self.state.update() {
            warn!(error = %e, "Final garbage collector update failed");
        }
        if let Err(e) = self.state.remove_instance() {
            warn!(error = %e, "Failed to remove garbage collector instance");
        }
        debug!(registry = %self.state.registry.name(), "Stopped shared memory garbage collector");
    }

    /// Run one registry pass now. Returns the number of segments deleted.
    pub fn collect(&self) -> Result<usize> {
        self.state.update()
    }

    /// Start refreshing the timestamp of segment `name`.
    pub fn register_shared_memory(&self, name: &str) {
        {
            let mut registrations = self.state.registrations.lock().unwrap();
            registrations.removed.remove(name);
            registrations.current.insert(name.to_string());
        }
        if let Err(e) = self.state.update() {
            warn!(segment = name, error = %e, "Failed to register shared memory");
        }
    }

    /// Stop refreshing segment `name` and drop its registry entry.
    pub fn unregister_shared_memory(&self, name: &str) {
        {
            let mut registrations = self.state.registrations.lock().unwrap();
            if !registrations.current.remove(name) {
                return;
            }
            registrations.removed.insert(name.to_string());
        }
        if let Err(e) = self.state.update() {
            warn!(segment = name, error = %e, "Failed to unregister shared memory");
        }
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn collector_loop(state: Arc<CollectorState>, shutdown: Arc<AtomicBool>) {
    debug!("Garbage collector thread started");

    while !shutdown.load(Ordering::Relaxed) {
        match state.update() {
            Ok(0) => {}
            Ok(deleted) => debug!(deleted, "Garbage collector pass reclaimed segments"),
            Err(e) => warn!(error = %e, "Garbage collector pass failed"),
        }

        let mut slept = Duration::ZERO;
        while slept < state.config.update_interval && !shutdown.load(Ordering::Relaxed) {
            let step = SHUTDOWN_POLL.min(state.config.update_interval - slept);
            thread::sleep(step);
            slept += step;
        }
    }

    debug!("Garbage collector thread stopped");
}
