//! Process memory sampling and the advisory pressure monitor.

use chrono::Utc;
use ctxguard_core::{EngineEvent, EventBus};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Source of the process's current memory use.
pub trait MemoryProbe: Send + Sync {
    /// Resident bytes, `None` when unavailable.
    fn used_bytes(&self) -> Option<u64>;
}

/// Reads the current process's resident memory through `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn used_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = system.refresh_process(pid);
        system.process(pid).map(|p| p.memory())
    }
}

/// Always reports the same figure.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub u64);

impl MemoryProbe for FixedProbe {
    fn used_bytes(&self) -> Option<u64> {
        Some(self.0)
    }
}

/// `used / budget`, `None` when the probe has nothing or the budget is zero.
pub fn memory_ratio(probe: &dyn MemoryProbe, budget_bytes: u64) -> Option<(u64, f64)> {
    if budget_bytes == 0 {
        return None;
    }
    probe
        .used_bytes()
        .map(|used| (used, used as f64 / budget_bytes as f64))
}

#[derive(Clone)]
pub struct MonitorSettings {
    pub budget_bytes: u64,
    pub pressure_ratio: f64,
    pub interval: Duration,
}

/// Take one sample and publish `MemoryPressure` if it is over the ratio.
pub fn sample(probe: &dyn MemoryProbe, bus: &EventBus, settings: &MonitorSettings) -> bool {
    let Some((used, ratio)) = memory_ratio(probe, settings.budget_bytes) else {
        return false;
    };
    if ratio <= settings.pressure_ratio {
        return false;
    }
    warn!(used_bytes = used, ratio, "memory pressure");
    bus.publish(EngineEvent::MemoryPressure {
        used_bytes: used,
        budget_bytes: settings.budget_bytes,
        ratio,
        timestamp: Utc::now(),
    });
    true
}

/// Handle to the background sampling task. Dropping it stops the task.
pub struct MemoryMonitor {
    handle: JoinHandle<()>,
}

impl MemoryMonitor {
    /// Spawn on the current tokio runtime. `None` outside a runtime.
    pub fn spawn(probe: Arc<dyn MemoryProbe>, bus: EventBus, settings: MonitorSettings) -> Option<Self> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(settings.interval);
            loop {
                ticker.tick().await;
                sample(probe.as_ref(), &bus, &settings);
            }
        });
        debug!("memory monitor started");
        Some(Self { handle })
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
