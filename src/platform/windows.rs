use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::{
    run_checked, spawn_detached, ListingFormat, PlatformOps, ReplaceMethod,
    Replacement, ServiceSpec,
};

/// Windows：运行中的 exe 无法被覆盖，替换交给退出后执行的批处理脚本
pub struct WindowsOps {
    service_name: String,
}

impl WindowsOps {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
        }
    }
}

/// `<live>.bat`
pub fn script_path(live: &Path) -> PathBuf {
    let mut name = live.as_os_str().to_os_string();
    name.push(".bat");
    PathBuf::from(name)
}

/// 重启脚本：等待当前进程退出、移动新文件、拉起服务或直接启动、删除自身
pub fn render_relaunch_script(
    staged: &Path,
    live: &Path,
    service_name: &str,
    args: &[String],
) -> String {
    let args: Vec<String> = args.iter().map(|a| format!("\"{}\"", a)).collect();
    format!(
        "@echo off\r\n\
         timeout /t 2 /nobreak >nul\r\n\
         move /Y \"{staged}\" \"{live}\" >nul\r\n\
         sc query \"{svc}\" >nul 2>&1\r\n\
         if %errorlevel%==0 (\r\n\
         \x20 sc start \"{svc}\" >nul\r\n\
         ) else (\r\n\
         \x20 start \"\" \"{live}\" {args}\r\n\
         )\r\n\
         del \"%~f0\"\r\n",
        staged = staged.display(),
        live = live.display(),
        svc = service_name,
        args = args.join(" "),
    )
}

impl PlatformOps for WindowsOps {
    fn listing_format(&self) -> ListingFormat {
        ListingFormat::TasklistCsv
    }

    fn list_processes(&self, token: &str) -> io::Result<String> {
        let filter = format!("imagename eq {}", token);
        let output = Command::new("tasklist")
            .args(["/fi", &filter, "/fo", "csv", "/v", "/nh"])
            .output()?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("tasklist exited with {}", output.status),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        run_checked(
            Command::new("taskkill").args(["/PID", &pid.to_string()]),
            "taskkill",
        )?;
        Ok(())
    }

    fn kill(&self, pid: u32) -> Result<()> {
        run_checked(
            Command::new("taskkill").args(["/F", "/PID", &pid.to_string()]),
            "taskkill /F",
        )?;
        Ok(())
    }

    fn replace(&self, staged: &Path, live: &Path, args: &[String]) -> Result<Replacement> {
        let script = script_path(live);
        fs::write(&script, render_relaunch_script(staged, live, &self.service_name, args))
            .with_context(|| format!("writing relaunch script {}", script.display()))?;
        info!("✓ Wrote relaunch script {}", script.display());
        Ok(Replacement {
            live: live.to_path_buf(),
            method: ReplaceMethod::Scripted(script),
            args: args.to_vec(),
        })
    }

    fn restart(&self, replacement: &Replacement) -> Result<()> {
        let script = match &replacement.method {
            ReplaceMethod::Scripted(script) => script.clone(),
            _ => {
                let pid = spawn_detached(&replacement.live, &replacement.arg_refs())?;
                info!("Started {} (PID {})", replacement.live.display(), pid);
                return Ok(());
            }
        };
        let script_arg = script.display().to_string();
        let pid = spawn_detached(Path::new("cmd"), &["/C", &script_arg])?;
        info!("Launched relaunch script {} (PID {})", script.display(), pid);
        Ok(())
    }

    #[cfg(windows)]
    fn install_service(&self, spec: &ServiceSpec) -> Result<()> {
        use windows_service::{
            service::{ServiceAccess, ServiceErrorControl, ServiceInfo, ServiceStartType, ServiceType},
            service_manager::{ServiceManager, ServiceManagerAccess},
        };

        let mgr = ServiceManager::local_computer(
            None::<&str>,
            ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE,
        )?;
        let info = ServiceInfo {
            name: spec.name.clone().into(),
            display_name: spec.display_name.clone().into(),
            service_type: ServiceType::OWN_PROCESS,
            start_type: ServiceStartType::AutoStart,
            error_control: ServiceErrorControl::Normal,
            executable_path: spec.executable.clone(),
            launch_arguments: spec.arguments.iter().map(|a| a.into()).collect(),
            dependencies: vec![],
            account_name: None,
            account_password: None,
        };
        let svc = mgr
            .create_service(&info, ServiceAccess::all())
            .context("create service")?;
        let _ = svc.set_description(&spec.description);
        svc.start::<&str>(&[]).context("start service")?;
        info!("Installed Windows service {}", spec.name);
        Ok(())
    }

    #[cfg(not(windows))]
    fn install_service(&self, _spec: &ServiceSpec) -> Result<()> {
        anyhow::bail!("Windows service install is Windows-only")
    }

    #[cfg(windows)]
    fn uninstall_service(&self, spec: &ServiceSpec) -> Result<()> {
        use windows_service::{
            service::{ServiceAccess, ServiceState},
            service_manager::{ServiceManager, ServiceManagerAccess},
        };

        let mgr = ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)?;
        let svc = mgr
            .open_service(&spec.name, ServiceAccess::all())
            .context("open service")?;
        if let Ok(st) = svc.query_status() {
            if st.current_state != ServiceState::Stopped {
                let _ = svc.stop();
            }
        }
        svc.delete().context("delete service")?;
        info!("Removed Windows service {}", spec.name);
        Ok(())
    }

    #[cfg(not(windows))]
    fn uninstall_service(&self, _spec: &ServiceSpec) -> Result<()> {
        anyhow::bail!("Windows service uninstall is Windows-only")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_sits_next_to_live_binary() {
        let live = Path::new("C:/Program Files/Sentinel/sentinel-agent.exe");
        assert_eq!(
            script_path(live),
            PathBuf::from("C:/Program Files/Sentinel/sentinel-agent.exe.bat")
        );
    }

    #[test]
    fn script_moves_staged_file_then_relaunches_and_self_deletes() {
        let staged = Path::new("C:/agent/sentinel-agent.exe.new");
        let live = Path::new("C:/agent/sentinel-agent.exe");
        let args = vec![
            "run".to_string(),
            "--config".to_string(),
            "C:/ProgramData/Sentinel/config.json".to_string(),
        ];
        let script = render_relaunch_script(staged, live, "sentinel-agent", &args);

        let mv = script
            .find("move /Y \"C:/agent/sentinel-agent.exe.new\" \"C:/agent/sentinel-agent.exe\"")
            .unwrap();
        let start = script
            .find(
                "start \"\" \"C:/agent/sentinel-agent.exe\" \"run\" \"--config\" \"C:/ProgramData/Sentinel/config.json\"",
            )
            .unwrap();
        let del = script.find("del \"%~f0\"").unwrap();
        assert!(script.starts_with("@echo off"));
        assert!(mv < start && start < del);
        assert!(script.contains("sc start \"sentinel-agent\""));
    }

    #[test]
    fn replace_writes_script_and_leaves_live_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("sentinel-agent.exe");
        let staged = dir.path().join("sentinel-agent.exe.new");
        fs::write(&live, b"old").unwrap();
        fs::write(&staged, b"new").unwrap();

        let ops = WindowsOps::new("sentinel-agent");
        let args = vec!["run".to_string(), "--config".to_string(), "C:/agent/config.json".to_string()];
        let r = ops.replace(&staged, &live, &args).unwrap();

        let script = script_path(&live);
        assert_eq!(r.args, args);
        assert!(fs::read_to_string(&script).unwrap().contains("\"--config\" \"C:/agent/config.json\""));
        assert_eq!(r.method, ReplaceMethod::Scripted(script.clone()));
        assert!(script.exists());
        assert_eq!(fs::read(&live).unwrap(), b"old");
        assert!(staged.exists());
    }
}
