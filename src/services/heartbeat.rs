use anyhow::{bail, Context, Result};
use log::{debug, info};
use reqwest::blocking::Client;
use std::time::Duration;

use crate::config::AgentConfig;
use crate::models::{HeartbeatPayload, SystemInfo};
use crate::services::stats_collector::now_rfc3339;

/// 心跳上报目标
pub trait HeartbeatSink: Send + Sync {
    fn send(&self, payload: &HeartbeatPayload) -> Result<()>;
}

pub fn build_payload(cfg: &AgentConfig, system_info: SystemInfo) -> HeartbeatPayload {
    HeartbeatPayload {
        device_id: cfg.device_id.clone(),
        version: cfg.current_version.clone(),
        timestamp: now_rfc3339(),
        alive: true,
        system_info,
    }
}

/// JSON POST 到 heartbeat_url
pub struct HttpHeartbeat {
    url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpHeartbeat {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("sentinel-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .context("building heartbeat client")?;
        Ok(Self {
            url: url.into(),
            api_key,
            client,
        })
    }

    /// 未配置 heartbeat_url 时返回 None
    pub fn from_config(cfg: &AgentConfig) -> Result<Option<Self>> {
        match cfg.heartbeat_url.as_deref() {
            Some(url) if !url.is_empty() => {
                Ok(Some(Self::new(url, cfg.heartbeat_api_key.clone())?))
            }
            _ => Ok(None),
        }
    }
}

impl HeartbeatSink for HttpHeartbeat {
    fn send(&self, payload: &HeartbeatPayload) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .header("Prefer", "return=minimal")
            .json(payload);
        if let Some(key) = &self.api_key {
            req = req
                .header("apikey", key)
                .header("Authorization", format!("Bearer {}", key));
        }

        let resp = req
            .send()
            .with_context(|| format!("POST {}", self.url))?;
        let status = resp.status();
        if status.as_u16() >= 400 {
            bail!("heartbeat failed with status {}", status);
        }

        debug!("heartbeat accepted with status {}", status);
        info!("Heartbeat sent successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_identity_and_version() {
        let mut cfg = AgentConfig::default();
        cfg.device_id = "a1b2c3d4e5f60718".into();
        cfg.current_version = "v1.4.0".into();

        let payload = build_payload(&cfg, SystemInfo::default());
        assert!(payload.alive);
        assert_eq!(payload.device_id, "a1b2c3d4e5f60718");
        assert_eq!(payload.version, "v1.4.0");

        let json = serde_json::to_value(&payload).unwrap();
        assert!(json["system_info"]["cpu"].is_object());
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn no_url_means_no_sink() {
        let mut cfg = AgentConfig::default();
        cfg.heartbeat_url = None;
        assert!(HttpHeartbeat::from_config(&cfg).unwrap().is_none());

        cfg.heartbeat_url = Some("http://127.0.0.1:9/rest/v1/heartbeat".into());
        assert!(HttpHeartbeat::from_config(&cfg).unwrap().is_some());
    }

    #[test]
    fn unreachable_endpoint_is_an_error() {
        // 端口 9 (discard) 通常无人监听
        let hb = HttpHeartbeat::new("http://127.0.0.1:9/heartbeat", Some("k".into())).unwrap();
        let mut cfg = AgentConfig::default();
        cfg.device_id = "00".into();
        assert!(hb.send(&build_payload(&cfg, SystemInfo::default())).is_err());
    }
}
