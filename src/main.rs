use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpServer};
use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::collections::BTreeSet;
use std::sync::{mpsc, Arc};

mod agent;
mod api;
mod cli;
mod config;
mod metrics;
mod models;
mod platform;
mod services;
mod state;

use agent::{Agent, LoopExit};
use cli::{Command, CommandArgs};
use config::{build_version, AgentConfig, PRODUCT_NAME};
use metrics::METRICS;
use models::{AgentIdentity, ProcessRecord};
use platform::{PlatformOps, ServiceSpec};
use services::release_client::GITHUB_API;
use services::{
    GithubReleases, HeartbeatSink, HttpHeartbeat, ProcessRegistry, SingleInstanceLock,
    UpdateOutcome, Updater, VersionResolver,
};
use state::{new_state, AgentSnapshot, AgentState};

#[actix_web::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 兄弟实例通过 `<binary> -version` 探测版本
    if cli::is_version_probe(std::env::args()) {
        print_version();
        return Ok(());
    }

    let args = CommandArgs::parse();
    match args.command() {
        Command::Run => run_agent(&args).await,
        Command::Version => {
            print_version();
            Ok(())
        }
        cmd => {
            // 一次性命令里有阻塞 HTTP 和子进程调用，放到阻塞线程池
            tokio::task::spawn_blocking(move || run_command(cmd, &args))
                .await
                .context("command task panicked")?
        }
    }
}

fn print_version() {
    println!("{} version {}", PRODUCT_NAME, build_version());
}

fn run_command(cmd: Command, args: &CommandArgs) -> Result<()> {
    let identity = AgentIdentity::new(PRODUCT_NAME, build_version());
    let platform = platform::detect(PRODUCT_NAME);
    let registry = Arc::new(ProcessRegistry::new(
        platform.clone(),
        VersionResolver::default(),
        &identity,
    ));

    match cmd {
        Command::Status => cmd_status(&registry),
        Command::Stop => cmd_stop(platform.as_ref(), &registry),
        Command::Update => {
            let mut cfg = AgentConfig::load(args.config.as_deref())?;
            let updater = build_updater(platform, registry)?;
            match updater.check_and_apply(&mut cfg)? {
                UpdateOutcome::UpToDate { version } => println!("Already up to date ({})", version),
                UpdateOutcome::Updated { from, to, .. } => {
                    println!("Updated {} -> {}, new version started", from, to)
                }
            }
            Ok(())
        }
        Command::Install => {
            let cfg = AgentConfig::load(args.config.as_deref())?;
            let spec = service_spec(&cfg)?;
            platform
                .install_service(&spec)
                .with_context(|| format!("Failed to install service {}", spec.name))?;
            println!("✓ {} service installed and started", PRODUCT_NAME);
            Ok(())
        }
        Command::Uninstall => {
            let cfg = AgentConfig::load(args.config.as_deref())?;
            let spec = service_spec(&cfg)?;
            platform
                .uninstall_service(&spec)
                .with_context(|| format!("Failed to uninstall service {}", spec.name))?;
            println!("✓ {} service uninstalled", PRODUCT_NAME);
            Ok(())
        }
        Command::EnableAutoUpdate => {
            let mut cfg = AgentConfig::load(args.config.as_deref())?;
            cfg.auto_update = true;
            cfg.save()?;
            println!("Auto-update enabled in {}", cfg.path.display());
            Ok(())
        }
        Command::Run | Command::Version => Ok(()),
    }
}

fn cmd_status(registry: &ProcessRegistry) -> Result<()> {
    let records = registry.discover()?;
    if records.is_empty() {
        println!("No other {} processes running", PRODUCT_NAME);
        return Ok(());
    }

    print_records(&records);
    let versions: BTreeSet<&str> = records.iter().map(|p| p.version.as_str()).collect();
    if versions.len() > 1 {
        println!();
        println!("WARNING: multiple versions are running: {:?}", versions);
        println!("Run '{} stop' to stop old versions", PRODUCT_NAME);
    }
    Ok(())
}

fn cmd_stop(platform: &dyn PlatformOps, registry: &ProcessRegistry) -> Result<()> {
    let records = registry.discover()?;
    if records.is_empty() {
        println!("No {} processes to stop", PRODUCT_NAME);
        return Ok(());
    }

    let mut failed = 0;
    for proc in &records {
        match platform.terminate(proc.pid) {
            Ok(()) => println!("Stopped PID {} ({})", proc.pid, proc.version),
            Err(e) => {
                failed += 1;
                error!("Failed to stop PID {}: {:#}", proc.pid, e);
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} process(es) could not be stopped", failed, records.len());
    }
    Ok(())
}

fn print_records(records: &[ProcessRecord]) {
    println!("Found {} running {} process(es):", records.len(), PRODUCT_NAME);
    for proc in records {
        println!("  PID: {}, Version: {}, Status: {}", proc.pid, proc.version, proc.status);
    }
}

fn service_spec(cfg: &AgentConfig) -> Result<ServiceSpec> {
    let executable = std::env::current_exe().context("locating current executable")?;
    Ok(ServiceSpec {
        name: PRODUCT_NAME.to_string(),
        display_name: "Sentinel Agent".to_string(),
        description: "Host agent that reports heartbeats and keeps itself up to date".to_string(),
        executable,
        arguments: vec![
            "run".to_string(),
            "--config".to_string(),
            cfg.path.display().to_string(),
        ],
    })
}

fn build_updater(platform: Arc<dyn PlatformOps>, registry: Arc<ProcessRegistry>) -> Result<Updater> {
    let live = std::env::current_exe().context("locating current executable")?;
    let releases = GithubReleases::new(GITHUB_API)?;
    Ok(Updater::new(PRODUCT_NAME, platform, registry, Box::new(releases), live))
}

async fn run_agent(args: &CommandArgs) -> Result<()> {
    let cfg = AgentConfig::load(args.config.as_deref())?;
    let identity = AgentIdentity::new(PRODUCT_NAME, build_version());
    let platform = platform::detect(PRODUCT_NAME);
    let registry = Arc::new(ProcessRegistry::new(
        platform.clone(),
        VersionResolver::default(),
        &identity,
    ));

    // 提示已有的其他版本实例，自动更新会负责清理
    let probe = registry.clone();
    match tokio::task::spawn_blocking(move || probe.discover()).await? {
        Ok(records) if !records.is_empty() => {
            warn!("Found {} running {} process(es):", records.len(), PRODUCT_NAME);
            for proc in &records {
                warn!("  PID: {}, Version: {}", proc.pid, proc.version);
            }
            warn!("Consider running '{} stop' to stop old versions first", PRODUCT_NAME);
        }
        Ok(_) => {}
        Err(e) => warn!("Could not check for existing processes: {}", e),
    }

    let mut lock = SingleInstanceLock::new(&cfg.state_dir(), &identity.lock_name());
    match lock.check_existing_lock() {
        Ok(true) => {
            let pid = lock.locked_pid().ok();
            bail!(
                "another {} instance is already running (PID {:?})",
                identity.lock_name(),
                pid
            );
        }
        Ok(false) => {}
        Err(e) => warn!("Failed to check existing lock: {}", e),
    }
    lock.try_acquire().context("Failed to acquire process lock")?;
    info!("✓ Acquired process lock {}", lock.path().display());

    let status_port = args.status_port.or(cfg.status_port);
    let state = new_state(
        AgentSnapshot {
            device_id: cfg.device_id.clone(),
            version: cfg.current_version.clone(),
            auto_update: cfg.auto_update,
            heartbeat_interval_secs: cfg.heartbeat_interval_secs,
            started_at: services::stats_collector::now_rfc3339(),
            ..Default::default()
        },
        registry.clone(),
    );
    METRICS.set_agent_info(&cfg.current_version, &cfg.device_id);

    print_banner(&cfg, status_port);

    let server = match status_port {
        Some(port) => Some(start_status_server(state.clone(), port)?),
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let worker_state = state.clone();
    let mut worker = tokio::task::spawn_blocking(move || -> Result<LoopExit> {
        // reqwest::blocking 客户端必须在运行时之外创建和销毁
        let heartbeat = HttpHeartbeat::from_config(&cfg)?
            .map(|h| Box::new(h) as Box<dyn HeartbeatSink>);
        if heartbeat.is_none() {
            warn!("heartbeat_url not configured, heartbeats disabled");
        }
        let updater = if cfg.auto_update {
            Some(build_updater(platform, registry)?)
        } else {
            info!("Auto update disabled");
            None
        };
        Ok(Agent::new(cfg, heartbeat, updater)
            .with_state(worker_state)
            .run(shutdown_rx))
    });

    let exit = tokio::select! {
        res = &mut worker => res.context("agent worker panicked")?,
        _ = shutdown_signal() => {
            info!("Shutdown signal received, waiting for current task to finish...");
            let _ = shutdown_tx.send(());
            worker.await.context("agent worker panicked")?
        }
    };

    if let Some(handle) = server {
        handle.stop(true).await;
    }
    if let Err(e) = lock.release() {
        warn!("Failed to release process lock: {}", e);
    } else {
        info!("Released process lock");
    }

    match exit? {
        LoopExit::Shutdown => info!("{} stopped", PRODUCT_NAME),
        LoopExit::Restarted => info!("Handed over to the new version, exiting"),
    }
    Ok(())
}

fn start_status_server(state: AgentState, port: u16) -> std::io::Result<ServerHandle> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(api::routes)
    })
        .workers(1)
        .disable_signals()
        .bind(("127.0.0.1", port))?
        .run();

    let handle = server.handle();
    actix_rt::spawn(server);
    Ok(handle)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn print_banner(cfg: &AgentConfig, status_port: Option<u16>) {
    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║      Sentinel Agent {:<38}║", build_version());
    println!("║      Heartbeat + Self Update                              ║");
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!();
    println!("🆔 Device:            {}", cfg.device_id);
    println!("📦 Current version:   {}", cfg.current_version);
    println!("💓 Heartbeat every:   {}s", cfg.heartbeat_interval_secs);
    println!("🔄 Auto update:       {}", if cfg.auto_update { "on (daily)" } else { "off" });
    println!("📁 Config:            {}", cfg.path.display());
    println!();
    if let Some(port) = status_port {
        println!("📋 Status endpoints on http://127.0.0.1:{}", port);
        println!("  GET    /health                 - Health check");
        println!("  GET    /metrics                - Prometheus metrics");
        println!("  GET    /api/agent/status       - Agent status");
        println!("  GET    /api/agent/processes    - Running agent instances");
    }
    println!("═══════════════════════════════════════════════════════════");
}
