use anyhow::{Context, Result};
use log::{info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::{
    run_checked, spawn_detached, ListingFormat, PlatformOps, ReplaceMethod,
    Replacement, ServiceSpec,
};

/// Linux 及其他 Unix：`ps aux` + 信号 + rename，systemd 下通过 systemctl 重启
pub struct PosixOps {
    unit_name: String,
    unit_dir: PathBuf,
}

impl PosixOps {
    pub fn new(service_name: &str) -> Self {
        Self {
            unit_name: format!("{}.service", service_name),
            unit_dir: PathBuf::from("/etc/systemd/system"),
        }
    }

    fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(&self.unit_name)
    }

    /// systemd 启动的服务会带 INVOCATION_ID
    fn under_systemd() -> bool {
        env::var_os("INVOCATION_ID").is_some()
    }

    fn systemctl_restart(&self) -> Result<()> {
        // --no-block: systemd 会先停掉当前进程，阻塞等待会互相卡住
        run_checked(
            Command::new("systemctl").args(["--no-block", "restart", &self.unit_name]),
            "systemctl restart",
        )?;
        Ok(())
    }
}

pub(crate) fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let raw = i32::try_from(pid).with_context(|| format!("PID {} out of range", pid))?;
    kill(Pid::from_raw(raw), signal)
        .with_context(|| format!("failed to send {} to PID {}", signal, pid))
}

pub(crate) fn list_ps() -> io::Result<String> {
    let output = Command::new("ps").arg("aux").output()?;
    if !output.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("ps aux exited with {}", output.status),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// 同一文件系统内 rename 是原子的
pub(crate) fn atomic_rename(staged: &Path, live: &Path) -> Result<()> {
    fs::rename(staged, live).with_context(|| {
        format!(
            "failed to replace {} with {}",
            live.display(),
            staged.display()
        )
    })
}

pub fn render_systemd_unit(spec: &ServiceSpec) -> String {
    let mut exec = spec.executable.display().to_string();
    for arg in &spec.arguments {
        exec.push(' ');
        exec.push_str(arg);
    }
    format!(
        "[Unit]\n\
         Description={}\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={}\n\
         Restart=on-failure\n\
         RestartSec=10\n\
         KillSignal=SIGTERM\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        spec.description, exec
    )
}

impl PlatformOps for PosixOps {
    fn listing_format(&self) -> ListingFormat {
        ListingFormat::Ps
    }

    fn list_processes(&self, _token: &str) -> io::Result<String> {
        list_ps()
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        send_signal(pid, Signal::SIGTERM)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        send_signal(pid, Signal::SIGKILL)
    }

    fn replace(&self, staged: &Path, live: &Path, args: &[String]) -> Result<Replacement> {
        atomic_rename(staged, live)?;
        info!("✓ Replaced {}", live.display());
        Ok(Replacement {
            live: live.to_path_buf(),
            method: ReplaceMethod::Renamed,
            args: args.to_vec(),
        })
    }

    fn restart(&self, replacement: &Replacement) -> Result<()> {
        if Self::under_systemd() {
            match self.systemctl_restart() {
                Ok(()) => {
                    info!("Requested systemd restart of {}", self.unit_name);
                    return Ok(());
                }
                Err(e) => {
                    warn!("systemd restart failed, falling back to direct spawn: {:#}", e);
                }
            }
        }
        let pid = spawn_detached(&replacement.live, &replacement.arg_refs())?;
        info!("Started {} {:?} (PID {})", replacement.live.display(), replacement.args, pid);
        Ok(())
    }

    fn install_service(&self, spec: &ServiceSpec) -> Result<()> {
        let path = self.unit_path();
        fs::write(&path, render_systemd_unit(spec))
            .with_context(|| format!("writing unit file {}", path.display()))?;
        run_checked(Command::new("systemctl").arg("daemon-reload"), "systemctl daemon-reload")?;
        run_checked(
            Command::new("systemctl").args(["enable", "--now", &self.unit_name]),
            "systemctl enable",
        )?;
        info!("Installed systemd unit {}", path.display());
        Ok(())
    }

    fn uninstall_service(&self, _spec: &ServiceSpec) -> Result<()> {
        if let Err(e) = run_checked(
            Command::new("systemctl").args(["disable", "--now", &self.unit_name]),
            "systemctl disable",
        ) {
            warn!("{:#}", e);
        }
        let path = self.unit_path();
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("removing unit file {}", path.display()))
            }
        }
        run_checked(Command::new("systemctl").arg("daemon-reload"), "systemctl daemon-reload")?;
        info!("Removed systemd unit {}", path.display());
        Ok(())
    }
}
