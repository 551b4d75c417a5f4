//! 平台相关操作
//!
//! 进程列举、信号、二进制替换与重启在三类平台上做法不同。
//! 启动时通过 [`detect`] 选定一次实现，之后各组件只依赖 [`PlatformOps`]。

#[cfg(unix)]
pub mod darwin;
#[cfg(unix)]
pub mod posix;
pub mod windows;

use anyhow::{bail, Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

/// 进程列表命令的输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingFormat {
    /// `ps aux`
    Ps,
    /// `tasklist /fo csv /v /nh`
    TasklistCsv,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceMethod {
    /// 同文件系统内原子 rename
    Renamed,
    /// 先卸载了服务管理器中的任务，再 rename
    ServiceUnloaded,
    /// 运行中的可执行文件不能覆盖，改为写重启脚本
    Scripted(PathBuf),
}

/// 替换阶段的结果，交给 restart 使用
#[derive(Debug, Clone)]
pub struct Replacement {
    pub live: PathBuf,
    pub method: ReplaceMethod,
    /// 直接启动新二进制时使用的参数
    pub args: Vec<String>,
}

impl Replacement {
    pub fn arg_refs(&self) -> Vec<&str> {
        self.args.iter().map(String::as_str).collect()
    }
}

/// 服务注册信息
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub executable: PathBuf,
    pub arguments: Vec<String>,
}

pub trait PlatformOps: Send + Sync {
    fn listing_format(&self) -> ListingFormat;

    /// 执行原生进程列表命令并返回原始文本
    fn list_processes(&self, token: &str) -> io::Result<String>;

    /// 优雅终止
    fn terminate(&self, pid: u32) -> Result<()>;

    /// 强制终止
    fn kill(&self, pid: u32) -> Result<()>;

    /// `args` 是新进程的启动参数，写入 [`Replacement`] 或重启脚本
    fn replace(&self, staged: &Path, live: &Path, args: &[String]) -> Result<Replacement>;

    fn restart(&self, replacement: &Replacement) -> Result<()>;

    fn install_service(&self, spec: &ServiceSpec) -> Result<()>;

    fn uninstall_service(&self, spec: &ServiceSpec) -> Result<()>;
}

/// 根据编译目标选择平台实现
pub fn detect(service_name: &str) -> Arc<dyn PlatformOps> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(darwin::LaunchdOps::new(service_name))
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        Arc::new(posix::PosixOps::new(service_name))
    }
    #[cfg(windows)]
    {
        Arc::new(windows::WindowsOps::new(service_name))
    }
}

/// 发送空信号探测进程是否存在
///
/// PID 被复用时会误报存活，这是已知限制。
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // 进程存在但不属于当前用户
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_running(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    if pid == 0 {
        return false;
    }
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}

/// 运行命令，非零退出码视为失败
pub(crate) fn run_checked(cmd: &mut Command, what: &str) -> Result<String> {
    let output = cmd
        .output()
        .with_context(|| format!("failed to execute {}", what))?;
    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            what,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// 以脱离当前进程的方式启动新进程，不等待
pub(crate) fn spawn_detached(program: &Path, args: &[&str]) -> Result<u32> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", program.display()))?;
    Ok(child.id())
}

/// 发布资源命名用的操作系统名（Go 风格）
pub fn os_label(os: &str) -> &str {
    match os {
        "macos" => "darwin",
        other => other,
    }
}

/// 发布资源命名用的 CPU 架构名（Go 风格）
pub fn arch_label(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "arm" => "arm",
        other => other,
    }
}

pub fn executable_suffix(os: &str) -> &'static str {
    if os == "windows" {
        ".exe"
    } else {
        ""
    }
}
