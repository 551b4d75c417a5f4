use serde::Serialize;
use std::fmt;

/// 单次发现过程中得到的 agent 进程记录
///
/// PID 会被操作系统复用，所以记录只在一次 "发现 + 处理" 序列内有效，不做持久化。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    /// 进程 ID
    pub pid: u32,
    /// 进程命令行（Windows 上可能只是映像名或窗口标题）
    pub command_line: String,
    /// 解析出的版本号，无法解析时为 "unknown"
    pub version: String,
    /// 运行状态
    pub status: ProcessStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessStatus {
    Running,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Running => write!(f, "Running"),
        }
    }
}

/// agent 的身份标识：产品名 + 版本
///
/// 锁名和 "这个进程是不是我" 的判断都从这里派生。
/// 不同版本使用不同的锁名，新旧二进制可以短暂共存直到旧实例被清理。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub product: String,
    pub version: String,
}

impl AgentIdentity {
    pub fn new(product: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            version: version.into(),
        }
    }

    pub fn lock_name(&self) -> String {
        format!("{}-{}", self.product, self.version)
    }

    /// 进程列表中用于匹配的可执行文件名
    pub fn executable_token(&self) -> String {
        if cfg!(windows) {
            format!("{}.exe", self.product)
        } else {
            self.product.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_name_includes_version() {
        let id = AgentIdentity::new("sentinel-agent", "v1.4.0");
        assert_eq!(id.lock_name(), "sentinel-agent-v1.4.0");
    }

    #[test]
    fn different_versions_do_not_share_lock() {
        let old = AgentIdentity::new("sentinel-agent", "v1.4.0");
        let new = AgentIdentity::new("sentinel-agent", "v1.5.0");
        assert_ne!(old.lock_name(), new.lock_name());
    }
}
