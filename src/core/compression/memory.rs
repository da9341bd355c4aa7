//! System memory and load readings for adaptive chunking

/// Snapshot of the resources adaptive chunking reacts to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    pub available_memory: u64,
    pub total_memory: u64,
    /// One-minute load average divided by CPU count
    pub load_per_cpu: f64,
}

impl ResourceSnapshot {
    /// Under pressure: less than 10% memory free or load above 1.5 per CPU
    pub fn under_pressure(&self) -> bool {
        let low_memory =
            self.total_memory > 0 && self.available_memory * 10 < self.total_memory;
        low_memory || self.load_per_cpu > 1.5
    }
}

pub trait ResourceMonitor: Send + Sync {
    fn snapshot(&self) -> ResourceSnapshot;
}

/// Reads `sysinfo(2)` on Linux; other platforms report a fixed budget
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMonitor;

const FALLBACK_MEMORY: u64 = 1024 * 1024 * 1024;

impl ResourceMonitor for SystemMonitor {
    #[cfg(target_os = "linux")]
    fn snapshot(&self) -> ResourceSnapshot {
        // SAFETY: sysinfo only writes into the zeroed struct we own
        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::sysinfo(&mut info) };
        if rc != 0 {
            return fallback_snapshot();
        }
        let unit = info.mem_unit.max(1) as u64;
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        // loads[] is fixed point with 16 fractional bits
        let load = info.loads[0] as f64 / 65536.0;
        ResourceSnapshot {
            available_memory: (info.freeram as u64 + info.bufferram as u64) * unit,
            total_memory: info.totalram as u64 * unit,
            load_per_cpu: load / cpus,
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn snapshot(&self) -> ResourceSnapshot {
        fallback_snapshot()
    }
}

fn fallback_snapshot() -> ResourceSnapshot {
    ResourceSnapshot {
        available_memory: FALLBACK_MEMORY,
        total_memory: FALLBACK_MEMORY,
        load_per_cpu: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_thresholds() {
        let calm = ResourceSnapshot {
            available_memory: 4 << 30,
            total_memory: 8 << 30,
            load_per_cpu: 0.3,
        };
        assert!(!calm.under_pressure());

        let low_mem = ResourceSnapshot {
            available_memory: 100 << 20,
            ..calm
        };
        assert!(low_mem.under_pressure());

        let busy = ResourceSnapshot {
            load_per_cpu: 2.0,
            ..calm
        };
        assert!(busy.under_pressure());
    }

    #[test]
    fn test_system_monitor_reports_memory() {
        let snap = SystemMonitor.snapshot();
        assert!(snap.total_memory > 0);
        assert!(snap.available_memory <= snap.total_memory);
    }
}
