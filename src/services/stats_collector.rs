use crate::models::stats::{CpuInfo, DiskInfo, MemoryInfo, NetInfo};
use crate::models::SystemInfo;
use std::path::Path;
use std::sync::Mutex;
use sysinfo::{Disks, Networks, System, MINIMUM_CPU_UPDATE_INTERVAL};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub struct StatsCollector {
    system: Mutex<System>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// 采集一次主机快照；CPU 使用率需要两次刷新之间的间隔
    pub fn collect(&self) -> SystemInfo {
        let mut sys = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        sys.refresh_cpu_all();
        std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_all();
        sys.refresh_memory();

        let cpu = CpuInfo {
            model_name: sys
                .cpus()
                .first()
                .map(|c| c.brand().trim().to_string())
                .unwrap_or_default(),
            cores: sys.cpus().len(),
            usage_percent: sys.global_cpu_usage(),
        };

        let total = sys.total_memory();
        let used = sys.used_memory();
        let memory = MemoryInfo {
            total,
            used,
            free: sys.available_memory(),
            usage_percent: if total > 0 {
                used as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        };
        drop(sys);

        let network = collect_networks();
        let mac_address = network
            .iter()
            .map(|n| n.mac_address.clone())
            .find(|m| !m.is_empty())
            .unwrap_or_default();

        let uptime = System::uptime();
        SystemInfo {
            timestamp: now_rfc3339(),
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            platform: System::name().unwrap_or_default(),
            platform_version: System::os_version().unwrap_or_default(),
            arch: std::env::consts::ARCH.to_string(),
            uptime,
            uptime_formatted: format_uptime(uptime),
            cpu,
            memory,
            disk: collect_root_disk(),
            network,
            mac_address,
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// 根分区（Windows 上为 C:\）的容量
fn collect_root_disk() -> DiskInfo {
    let disks = Disks::new_with_refreshed_list();
    let root = if cfg!(windows) { Path::new("C:\\") } else { Path::new("/") };

    disks
        .list()
        .iter()
        .find(|d| d.mount_point() == root)
        .or_else(|| disks.list().first())
        .map(|d| {
            let total = d.total_space();
            let free = d.available_space();
            DiskInfo {
                total,
                used: total.saturating_sub(free),
                free,
            }
        })
        .unwrap_or_default()
}

fn collect_networks() -> Vec<NetInfo> {
    let networks = Networks::new_with_refreshed_list();
    let mut list: Vec<NetInfo> = networks
        .iter()
        .map(|(name, data)| {
            let mac = data.mac_address();
            NetInfo {
                name: name.clone(),
                bytes_sent: data.total_transmitted(),
                bytes_recv: data.total_received(),
                mac_address: if mac.is_unspecified() {
                    String::new()
                } else {
                    mac.to_string()
                },
            }
        })
        .collect();
    list.sort_by(|a, b| a.name.cmp(&b.name));
    list
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

/// 开机时长转为可读文本，最多保留三个最高单位
pub fn format_uptime(seconds: u64) -> String {
    if seconds == 0 {
        return "0 seconds".to_string();
    }

    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    let unit = |n: u64, name: &str| {
        if n == 1 {
            format!("1 {}", name)
        } else {
            format!("{} {}s", n, name)
        }
    };

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(unit(days, "day"));
    }
    if hours > 0 {
        parts.push(unit(hours, "hour"));
    }
    if minutes > 0 {
        parts.push(unit(minutes, "minute"));
    }
    if parts.is_empty() || secs > 0 {
        parts.push(unit(secs, "second"));
    }

    parts.truncate(3);
    parts.join(" ")
}
