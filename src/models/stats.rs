use serde::Serialize;

/// 主机遥测快照
#[derive(Debug, Clone, Serialize, Default)]
pub struct SystemInfo {
    /// 采集时间 (RFC 3339)
    pub timestamp: String,
    pub hostname: String,
    pub os: String,
    pub platform: String,
    pub platform_version: String,
    pub arch: String,

    /// 开机时长（秒）
    pub uptime: u64,
    pub uptime_formatted: String,

    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub disk: DiskInfo,
    pub network: Vec<NetInfo>,

    /// 第一个非零 MAC 地址
    pub mac_address: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct CpuInfo {
    pub model_name: String,
    pub cores: usize,
    /// CPU 使用率 (百分比，0-100)
    pub usage_percent: f32,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct MemoryInfo {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    /// 内存使用率 (百分比，0-100)
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DiskInfo {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct NetInfo {
    pub name: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub mac_address: String,
}

/// 心跳上报内容
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    pub device_id: String,
    pub version: String,
    pub timestamp: String,
    pub alive: bool,
    pub system_info: SystemInfo,
}
