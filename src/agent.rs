//! agent 主循环
//!
//! 单个阻塞工作线程负责全部调度：心跳按 `heartbeat_interval_secs` 发送，
//! 更新检查在启动时执行一次、之后每 24 小时一次。每个 tick 只做一件事，
//! 停止信号只在 tick 之间检查，进行中的更新不会被打断。

use log::{debug, error, info, warn};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

use crate::config::AgentConfig;
use crate::metrics::{unix_now, METRICS};
use crate::services::heartbeat::{build_payload, HeartbeatSink};
use crate::services::stats_collector::now_rfc3339;
use crate::services::updater::{self, UpdateOutcome, Updater};
use crate::services::StatsCollector;
use crate::state::{update_snapshot, AgentState};

pub const UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Heartbeat,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// 收到停止信号
    Shutdown,
    /// 新版本已启动，当前进程应退出
    Restarted,
}

/// 两类任务的下一次触发时间；同时到期时先发心跳
#[derive(Debug, Clone)]
pub struct Schedule {
    heartbeat_every: Duration,
    update_every: Option<Duration>,
    next_heartbeat: Instant,
    next_update: Option<Instant>,
}

impl Schedule {
    /// 两类任务都在 `start` 立即到期一次
    pub fn new(start: Instant, heartbeat_every: Duration, update_every: Option<Duration>) -> Self {
        Self {
            heartbeat_every,
            update_every,
            next_heartbeat: start,
            next_update: update_every.map(|_| start),
        }
    }

    pub fn from_config(cfg: &AgentConfig, start: Instant) -> Self {
        let heartbeat = Duration::from_secs(cfg.heartbeat_interval_secs.max(1));
        let update = cfg.auto_update.then_some(UPDATE_INTERVAL);
        Self::new(start, heartbeat, update)
    }

    pub fn due(&self, now: Instant) -> Option<Job> {
        if now >= self.next_heartbeat {
            return Some(Job::Heartbeat);
        }
        match self.next_update {
            Some(at) if now >= at => Some(Job::Update),
            _ => None,
        }
    }

    pub fn mark_done(&mut self, job: Job, now: Instant) {
        match job {
            Job::Heartbeat => self.next_heartbeat = now + self.heartbeat_every,
            Job::Update => {
                if let Some(every) = self.update_every {
                    self.next_update = Some(now + every);
                }
            }
        }
    }

    /// 距离最近一次到期的时间
    pub fn until_next(&self, now: Instant) -> Duration {
        let next = match self.next_update {
            Some(at) => at.min(self.next_heartbeat),
            None => self.next_heartbeat,
        };
        next.saturating_duration_since(now)
    }
}

pub struct Agent {
    cfg: AgentConfig,
    stats: StatsCollector,
    heartbeat: Option<Box<dyn HeartbeatSink>>,
    updater: Option<Updater>,
    state: Option<AgentState>,
    schedule: Schedule,
}

impl Agent {
    pub fn new(
        cfg: AgentConfig,
        heartbeat: Option<Box<dyn HeartbeatSink>>,
        updater: Option<Updater>,
    ) -> Self {
        let schedule = Schedule::from_config(&cfg, Instant::now());
        Self {
            cfg,
            stats: StatsCollector::new(),
            heartbeat,
            updater,
            state: None,
            schedule,
        }
    }

    pub fn with_state(mut self, state: AgentState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// 运行到收到停止信号（或发送端全部断开）或新版本接管为止
    pub fn run(mut self, shutdown: Receiver<()>) -> LoopExit {
        info!(
            "Agent loop started: heartbeat every {}s, auto update {}",
            self.cfg.heartbeat_interval_secs,
            if self.updater.is_some() { "on" } else { "off" }
        );

        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return self.stopped(),
                Err(TryRecvError::Empty) => {}
            }

            let now = Instant::now();
            match self.schedule.due(now) {
                Some(Job::Heartbeat) => {
                    self.heartbeat_tick();
                    self.schedule.mark_done(Job::Heartbeat, Instant::now());
                }
                Some(Job::Update) => {
                    if self.update_tick() {
                        info!("New version started, leaving agent loop");
                        return LoopExit::Restarted;
                    }
                    self.schedule.mark_done(Job::Update, Instant::now());
                }
                None => match shutdown.recv_timeout(self.schedule.until_next(now)) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return self.stopped(),
                    Err(RecvTimeoutError::Timeout) => {}
                },
            }
        }
    }

    fn stopped(&self) -> LoopExit {
        info!("Agent loop stopping");
        LoopExit::Shutdown
    }

    fn heartbeat_tick(&mut self) {
        let Some(sink) = &self.heartbeat else {
            debug!("heartbeat_url not configured, skipping heartbeat");
            return;
        };

        let payload = build_payload(&self.cfg, self.stats.collect());
        match sink.send(&payload) {
            Ok(()) => {
                METRICS.heartbeats.with_label_values(&["ok"]).inc();
                METRICS.last_heartbeat_timestamp.set(unix_now());
                self.record(|s| {
                    s.last_heartbeat = Some(payload.timestamp.clone());
                    s.last_heartbeat_error = None;
                });
            }
            Err(e) => {
                METRICS.heartbeats.with_label_values(&["failed"]).inc();
                error!("Heartbeat failed: {:#}", e);
                let msg = format!("{:#}", e);
                self.record(|s| s.last_heartbeat_error = Some(msg));
            }
        }
    }

    /// 返回 true 表示新版本已接管
    fn update_tick(&mut self) -> bool {
        let Some(up) = &self.updater else {
            return false;
        };

        let outcome = updater::run_pass(up, &mut self.cfg);
        METRICS.last_update_check_timestamp.set(unix_now());

        let result = match &outcome {
            Some(UpdateOutcome::UpToDate { version }) => format!("up to date ({})", version),
            Some(UpdateOutcome::Updated { from, to, .. }) => format!("updated {} -> {}", from, to),
            None => "failed".to_string(),
        };
        let version = self.cfg.current_version.clone();
        self.record(|s| {
            s.last_update_check = Some(now_rfc3339());
            s.last_update_result = Some(result);
            s.version = version;
        });

        match outcome {
            Some(UpdateOutcome::Updated { restarted: true, .. }) => true,
            Some(UpdateOutcome::Updated { restarted: false, to, .. }) => {
                warn!("Updated to {} but restart did not happen", to);
                false
            }
            _ => false,
        }
    }

    fn record(&self, f: impl FnOnce(&mut crate::state::AgentSnapshot)) {
        if let Some(state) = &self.state {
            update_snapshot(state, f);
        }
    }
}
