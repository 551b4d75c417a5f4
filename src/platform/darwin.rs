use anyhow::{bail, Context, Result};
use log::{info, warn};
use nix::sys::signal::Signal;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use super::posix::{atomic_rename, list_ps, send_signal};
use super::{
    run_checked, spawn_detached, ListingFormat, PlatformOps, ReplaceMethod,
    Replacement, ServiceSpec,
};

/// macOS：进程操作同 POSIX，服务由 launchd 托管
pub struct LaunchdOps {
    label: String,
    plist_path: PathBuf,
    settle: Duration,
}

impl LaunchdOps {
    pub fn new(service_name: &str) -> Self {
        let label = format!("com.{}", service_name.replace('-', "."));
        let plist_path = PathBuf::from("/Library/LaunchDaemons").join(format!("{}.plist", label));
        Self {
            label,
            plist_path,
            settle: Duration::from_secs(3),
        }
    }

    fn service_loaded(&self) -> bool {
        Command::new("launchctl")
            .args(["list", &self.label])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn unload(&self) -> Result<()> {
        run_checked(
            Command::new("launchctl")
                .args(["unload", "-w"])
                .arg(&self.plist_path),
            "launchctl unload",
        )?;
        Ok(())
    }

    fn load_and_start(&self) -> Result<()> {
        if !self.plist_path.exists() {
            bail!(
                "launchd plist not found at {} - service may not be installed",
                self.plist_path.display()
            );
        }
        run_checked(
            Command::new("launchctl")
                .args(["load", "-w"])
                .arg(&self.plist_path),
            "launchctl load",
        )?;
        thread::sleep(Duration::from_millis(500));
        run_checked(
            Command::new("launchctl").args(["start", &self.label]),
            "launchctl start",
        )?;
        Ok(())
    }
}

pub fn render_plist(label: &str, spec: &ServiceSpec) -> String {
    let mut args = format!("    <string>{}</string>\n", spec.executable.display());
    for a in &spec.arguments {
        args.push_str(&format!("    <string>{}</string>\n", a));
    }
    let workdir = spec
        .executable
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/".to_string());
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>Label</key>
  <string>{label}</string>
  <key>ProgramArguments</key>
  <array>
{args}  </array>
  <key>RunAtLoad</key>
  <true/>
  <key>KeepAlive</key>
  <true/>
  <key>StandardOutPath</key>
  <string>/var/log/{name}.log</string>
  <key>StandardErrorPath</key>
  <string>/var/log/{name}.err</string>
  <key>WorkingDirectory</key>
  <string>{workdir}</string>
  <key>Comment</key>
  <string>{description}</string>
</dict>
</plist>
"#,
        label = label,
        args = args,
        name = spec.name,
        workdir = workdir,
        description = spec.description,
    )
}

impl PlatformOps for LaunchdOps {
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
        let loaded = self.service_loaded();
        if loaded {
            info!("Stopping launchd service {}...", self.label);
            if let Err(e) = self.unload() {
                warn!("Failed to unload launchd service: {:#}", e);
            }
            thread::sleep(self.settle);
        }

        atomic_rename(staged, live)?;
        info!("✓ Replaced {}", live.display());

        Ok(Replacement {
            live: live.to_path_buf(),
            method: if loaded {
                ReplaceMethod::ServiceUnloaded
            } else {
                ReplaceMethod::Renamed
            },
            args: args.to_vec(),
        })
    }

    fn restart(&self, replacement: &Replacement) -> Result<()> {
        // 替换前卸载过 launchd 服务时重新加载，否则直接启动
        if replacement.method == ReplaceMethod::ServiceUnloaded {
            match self.load_and_start() {
                Ok(()) => {
                    info!("Launchd service {} started", self.label);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Failed to start launchd service: {:#}", e);
                    warn!("Falling back to direct execution...");
                }
            }
        }
        let pid = spawn_detached(&replacement.live, &replacement.arg_refs())?;
        info!("Started {} in direct execution mode (PID {})", replacement.live.display(), pid);
        Ok(())
    }

    fn install_service(&self, spec: &ServiceSpec) -> Result<()> {
        if let Some(dir) = self.plist_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        fs::write(&self.plist_path, render_plist(&self.label, spec))
            .with_context(|| format!("writing plist {}", self.plist_path.display()))?;
        info!("Created launchd plist: {}", self.plist_path.display());
        self.load_and_start()
    }

    fn uninstall_service(&self, _spec: &ServiceSpec) -> Result<()> {
        if let Err(e) = self.unload() {
            warn!("Failed to unload launchd service: {:#}", e);
        }
        match fs::remove_file(&self.plist_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("removing plist {}", self.plist_path.display()))
            }
        }
        info!("Removed launchd plist: {}", self.plist_path.display());
        Ok(())
    }
}
