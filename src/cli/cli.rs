use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Sentinel Agent - 自更新主机 agent（心跳上报 + 每日自动更新）
#[derive(Parser, Debug)]
#[command(author, about, long_about = None, disable_version_flag = true)]
pub struct CommandArgs {
    /// 配置文件路径
    #[arg(short, long, global = true, env = "SENTINEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// 本地状态接口端口（仅监听 127.0.0.1），覆盖配置文件
    #[arg(long, global = true, env = "SENTINEL_STATUS_PORT")]
    pub status_port: Option<u16>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 前台运行 agent（默认）
    Run,
    /// 列出本机运行中的 agent 实例
    Status,
    /// 优雅停止所有其他 agent 实例
    Stop,
    /// 立即执行一次更新检查
    Update,
    /// 注册为系统服务
    Install,
    /// 移除系统服务
    Uninstall,
    /// 打印版本
    Version,
    /// 在配置中开启自动更新
    EnableAutoUpdate,
}

impl CommandArgs {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

/// 其他实例用 `<binary> -version` 探测版本，这里单独识别这种老式写法
pub fn is_version_probe<I, S>(args: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let args: Vec<S> = args.into_iter().skip(1).collect();
    args.len() == 1 && matches!(args[0].as_ref(), "-version" | "--version" | "-V")
}
