use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::services::ProcessRegistry;

/// 状态接口可见的运行信息，由工作线程写入
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentSnapshot {
    pub device_id: String,
    pub version: String,
    pub auto_update: bool,
    pub heartbeat_interval_secs: u64,
    pub started_at: String,
    pub last_heartbeat: Option<String>,
    pub last_heartbeat_error: Option<String>,
    pub last_update_check: Option<String>,
    pub last_update_result: Option<String>,
}

pub struct AgentStateInner {
    pub snapshot: AgentSnapshot,
    pub registry: Arc<ProcessRegistry>,
}

pub type AgentState = Arc<Mutex<AgentStateInner>>;

pub fn new_state(snapshot: AgentSnapshot, registry: Arc<ProcessRegistry>) -> AgentState {
    Arc::new(Mutex::new(AgentStateInner { snapshot, registry }))
}

/// 写入快照，锁中毒时继续使用内部数据
pub fn update_snapshot(state: &AgentState, f: impl FnOnce(&mut AgentSnapshot)) {
    let mut guard = match state.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard.snapshot);
}
