use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::config::AgentConfig;
use crate::metrics::METRICS;
use crate::models::{ReleaseAsset, ReleaseDescriptor};
use crate::platform::{self, PlatformOps};
use crate::services::process_registry::{DiscoveryError, ProcessRegistry};
use crate::services::release_client::ReleaseSource;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("fetch latest release: {0:#}")]
    Fetch(anyhow::Error),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("no matching asset {pattern} in release {tag}")]
    NoMatchingAsset { tag: String, pattern: String },

    #[error("download {url} to {path}: {source:#}")]
    Download {
        url: String,
        path: PathBuf,
        source: anyhow::Error,
    },

    #[error("replace {path}: {source:#}")]
    Replace { path: PathBuf, source: anyhow::Error },

    #[error("save config after update to {tag}: {source:#}")]
    Persist { tag: String, source: anyhow::Error },

    #[error("restart {path}: {source:#}")]
    Restart { path: PathBuf, source: anyhow::Error },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate { version: String },
    Updated { from: String, to: String, restarted: bool },
}

/// 清理旧实例的等待时间
#[derive(Debug, Clone, Copy)]
pub struct DrainPolicy {
    /// 优雅终止后的等待
    pub grace: Duration,
    /// 强制终止后的等待
    pub force_wait: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3),
            force_wait: Duration::from_secs(2),
        }
    }
}

/// 一次清理的结果；failures 非空时只记录日志，不中断更新
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub terminated: Vec<u32>,
    pub killed: Vec<u32>,
    pub failures: Vec<(u32, String)>,
    pub remaining: Vec<u32>,
}

/// 运行平台，决定资源名
#[derive(Debug, Clone)]
pub struct Target {
    pub os: String,
    pub arch: String,
}

impl Target {
    pub fn current() -> Self {
        Self {
            os: platform::os_label(std::env::consts::OS).to_string(),
            arch: platform::arch_label(std::env::consts::ARCH).to_string(),
        }
    }

    pub fn asset_pattern(&self, product: &str) -> String {
        format!(
            "{}-{}-{}{}",
            product,
            self.os,
            self.arch,
            platform::executable_suffix(&self.os)
        )
    }
}

/// 只接受名字完全相等的资源
pub fn select_asset<'a>(release: &'a ReleaseDescriptor, pattern: &str) -> Option<&'a ReleaseAsset> {
    release.assets.iter().find(|a| a.name == pattern)
}

/// `<binary>.new`
pub fn staged_path(live: &Path) -> PathBuf {
    let mut name = live.as_os_str().to_os_string();
    name.push(".new");
    PathBuf::from(name)
}

/// 新进程的启动参数，沿用当前配置文件
pub fn relaunch_args(cfg: &AgentConfig) -> Vec<String> {
    vec![
        "run".to_string(),
        "--config".to_string(),
        cfg.path.display().to_string(),
    ]
}

/// 更新流程：CHECK → DRAIN → DOWNLOAD → REPLACE_AND_RECONCILE → RESTART
///
/// 单次调用走完一遍，中途不可取消。
pub struct Updater {
    product: String,
    platform: Arc<dyn PlatformOps>,
    registry: Arc<ProcessRegistry>,
    releases: Box<dyn ReleaseSource>,
    drain: DrainPolicy,
    target: Target,
    live: PathBuf,
}

impl Updater {
    pub fn new(
        product: impl Into<String>,
        platform: Arc<dyn PlatformOps>,
        registry: Arc<ProcessRegistry>,
        releases: Box<dyn ReleaseSource>,
        live: PathBuf,
    ) -> Self {
        Self {
            product: product.into(),
            platform,
            registry,
            releases,
            drain: DrainPolicy::default(),
            target: Target::current(),
            live,
        }
    }

    pub fn with_drain_policy(mut self, drain: DrainPolicy) -> Self {
        self.drain = drain;
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn check_and_apply(&self, cfg: &mut AgentConfig) -> Result<UpdateOutcome, UpdateError> {
        // CHECK
        let latest = self
            .releases
            .fetch_latest(&cfg.github_owner, &cfg.github_repo)
            .map_err(UpdateError::Fetch)?;

        // 只比较字符串是否相等，不做语义版本排序
        if latest.tag == cfg.current_version {
            info!("Already up to date: {}", latest.tag);
            return Ok(UpdateOutcome::UpToDate {
                version: latest.tag,
            });
        }

        let pattern = self.target.asset_pattern(&self.product);
        info!("Looking for asset: {}", pattern);
        info!("Available assets: {:?}", latest.asset_names());
        let asset = select_asset(&latest, &pattern).ok_or_else(|| UpdateError::NoMatchingAsset {
            tag: latest.tag.clone(),
            pattern: pattern.clone(),
        })?;

        info!("Found update: {} -> {}", cfg.current_version, latest.tag);

        // DRAIN
        let report = self.drain_siblings()?;
        for (pid, reason) in &report.failures {
            warn!("Failed to stop PID {}: {}", pid, reason);
        }
        if !report.remaining.is_empty() {
            warn!(
                "{} old process(es) still running, proceeding anyway: {:?}",
                report.remaining.len(),
                report.remaining
            );
        }

        // DOWNLOAD
        let staged = staged_path(&self.live);
        if let Err(e) = self.download_staged(asset, &staged) {
            let _ = fs::remove_file(&staged);
            return Err(e);
        }

        // REPLACE_AND_RECONCILE
        let relaunch = relaunch_args(cfg);
        let replacement = match self.platform.replace(&staged, &self.live, &relaunch) {
            Ok(r) => r,
            Err(source) => {
                let _ = fs::remove_file(&staged);
                return Err(UpdateError::Replace {
                    path: self.live.clone(),
                    source,
                });
            }
        };

        // 重启前先写入新版本，重启前崩溃也能在下次启动时看到正确状态
        let previous = std::mem::replace(&mut cfg.current_version, latest.tag.clone());
        if let Err(source) = cfg.save() {
            cfg.current_version = previous;
            return Err(UpdateError::Persist {
                tag: latest.tag,
                source,
            });
        }
        info!("Successfully updated to version {}", latest.tag);

        // RESTART
        self.platform
            .restart(&replacement)
            .map_err(|source| UpdateError::Restart {
                path: self.live.clone(),
                source,
            })?;

        Ok(UpdateOutcome::Updated {
            from: previous,
            to: latest.tag,
            restarted: true,
        })
    }

    /// 发送优雅终止 → 等待 → 重新发现 → 强制终止幸存者 → 等待 → 最终确认
    ///
    /// 与当前版本相同的实例不在清理范围内。
    pub fn drain_siblings(&self) -> Result<DrainReport, UpdateError> {
        let mut report = DrainReport::default();

        let siblings = self.registry.discover_other_versions()?;
        if siblings.is_empty() {
            info!("No old processes found");
            return Ok(report);
        }

        info!("Found {} old process(es) to stop:", siblings.len());
        for proc in &siblings {
            info!("  PID: {}, Version: {}", proc.pid, proc.version);
        }

        for proc in &siblings {
            match self.platform.terminate(proc.pid) {
                Ok(()) => {
                    info!("Stopped PID {}", proc.pid);
                    METRICS.drained_processes.with_label_values(&["term"]).inc();
                    report.terminated.push(proc.pid);
                }
                Err(e) => {
                    report.failures.push((proc.pid, format!("{:#}", e)));
                }
            }
        }
        thread::sleep(self.drain.grace);

        let survivors = self.registry.discover_other_versions()?;
        if !survivors.is_empty() {
            info!("Force killing {} remaining process(es)...", survivors.len());
            for proc in &survivors {
                match self.platform.kill(proc.pid) {
                    Ok(()) => {
                        METRICS.drained_processes.with_label_values(&["kill"]).inc();
                        report.killed.push(proc.pid);
                    }
                    Err(e) => {
                        report.failures.push((proc.pid, format!("{:#}", e)));
                    }
                }
            }
            thread::sleep(self.drain.force_wait);
        }

        let remaining = self.registry.discover_other_versions()?;
        report.remaining = remaining.iter().map(|p| p.pid).collect();
        if report.remaining.is_empty() {
            info!("All old processes stopped successfully");
        }
        METRICS.sibling_processes.set(report.remaining.len() as f64);

        Ok(report)
    }

    fn download_staged(&self, asset: &ReleaseAsset, staged: &Path) -> Result<(), UpdateError> {
        let download_err = |source: anyhow::Error| UpdateError::Download {
            url: asset.download_url.clone(),
            path: staged.to_path_buf(),
            source,
        };

        let bytes = self
            .releases
            .download(&asset.download_url, staged)
            .map_err(download_err)?;
        info!("Downloaded {} ({} bytes) to {}", asset.name, bytes, staged.display());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(staged, fs::Permissions::from_mode(0o755))
                .map_err(|e| download_err(e.into()))?;
        }

        Ok(())
    }
}

/// 循环边界上调用：错误只记日志，等下一次调度
pub fn run_pass(updater: &Updater, cfg: &mut AgentConfig) -> Option<UpdateOutcome> {
    match updater.check_and_apply(cfg) {
        Ok(outcome) => {
            let label = match &outcome {
                UpdateOutcome::UpToDate { .. } => "up_to_date",
                UpdateOutcome::Updated { .. } => "updated",
            };
            METRICS.update_checks.with_label_values(&[label]).inc();
            Some(outcome)
        }
        Err(e) => {
            METRICS.update_checks.with_label_values(&["failed"]).inc();
            error!("Update check failed: {}", e);
            None
        }
    }
}
