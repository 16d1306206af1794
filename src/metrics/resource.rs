//! Process resource sampling for the `resource.*` gauges

/// `/proc/self/stat` reports CPU time in USER_HZ ticks, fixed at 100 on Linux
const TICKS_PER_SECOND: f64 = 100.0;

/// Resource usage of this process at one instant
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceUsage {
    /// User plus system CPU time since the process started
    pub cpu_seconds: f64,
    pub memory_rss_mb: f64,
    pub memory_vms_mb: f64,
    pub threads: u64,
    pub open_files: u64,
}

impl ResourceUsage {
    /// Reads the current usage from procfs
    ///
    /// Returns `None` on platforms without `/proc/self`.
    pub fn sample() -> Option<Self> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        let open_files = std::fs::read_dir("/proc/self/fd").ok()?.count() as u64;
        Some(Self::parse(&status, &stat, open_files))
    }

    fn parse(status: &str, stat: &str, open_files: u64) -> Self {
        Self {
            cpu_seconds: cpu_seconds(stat).unwrap_or(0.0),
            memory_rss_mb: status_value(status, "VmRSS").unwrap_or(0.0) / 1024.0,
            memory_vms_mb: status_value(status, "VmSize").unwrap_or(0.0) / 1024.0,
            threads: status_value(status, "Threads").unwrap_or(0.0) as u64,
            open_files,
        }
    }

    /// Gauge names and values, as published by the registry
    pub fn gauges(&self) -> [(&'static str, f64); 5] {
        [
            ("resource.cpu_seconds", self.cpu_seconds),
            ("resource.memory_rss_mb", self.memory_rss_mb),
            ("resource.memory_vms_mb", self.memory_vms_mb),
            ("resource.threads", self.threads as f64),
            ("resource.open_files", self.open_files as f64),
        ]
    }
}

/// First number on a `Name:   value [kB]` line of `/proc/self/status`
fn status_value(status: &str, name: &str) -> Option<f64> {
    status.lines().find_map(|line| {
        let value = line.strip_prefix(name)?.strip_prefix(':')?;
        value.split_whitespace().next()?.parse().ok()
    })
}

fn cpu_seconds(stat: &str) -> Option<f64> {
    // The command name is parenthesized and may contain spaces; count after it.
    // Index 0 is the state field, so utime and stime sit at 11 and 12.
    let fields: Vec<&str> = stat.rsplit_once(')')?.1.split_whitespace().collect();
    let utime: f64 = fields.get(11)?.parse().ok()?;
    let stime: f64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) / TICKS_PER_SECOND)
}
