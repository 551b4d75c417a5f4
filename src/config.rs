use anyhow::{Context, Result};
use directories::BaseDirs;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::{env, fs, path::{Path, PathBuf}};

pub const PRODUCT_NAME: &str = "sentinel-agent";

/// 构建版本，可在编译期通过 SENTINEL_BUILD_VERSION 注入
pub fn build_version() -> String {
    match option_env!("SENTINEL_BUILD_VERSION") {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => format!("v{}", env!("CARGO_PKG_VERSION")),
    }
}

/// 持久化的 agent 配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub path: PathBuf,

    /// 心跳间隔（秒）
    pub heartbeat_interval_secs: u64,
    pub github_owner: String,
    pub github_repo: String,
    /// 当前运行的版本标签，仅在成功替换二进制后由更新器修改
    pub current_version: String,
    /// 设备唯一标识，首次加载时生成
    pub device_id: String,
    pub auto_update: bool,
    pub heartbeat_url: Option<String>,
    pub status_port: Option<u16>,

    /// 心跳凭据，只从环境变量读取，不写盘
    #[serde(skip)]
    pub heartbeat_api_key: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            path: state_dir().join("config.json"),
            heartbeat_interval_secs: 300,
            github_owner: "sentinel-hq".into(),
            github_repo: "sentinel-agent".into(),
            current_version: build_version(),
            device_id: String::new(),
            auto_update: true,
            heartbeat_url: None,
            status_port: None,
            heartbeat_api_key: None,
        }
    }
}

/// 每用户状态目录（配置和锁文件都放在这里）
pub fn state_dir() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.home_dir().join(format!(".{}", PRODUCT_NAME)))
        .unwrap_or_else(|| PathBuf::from("/opt").join(PRODUCT_NAME))
}

impl AgentConfig {
    /// 加载配置：默认值 <- 配置文件 <- 环境变量
    ///
    /// device_id 缺失时生成并立即写回。
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => state_dir().join("config.json"),
        };

        let mut cfg = if path.exists() {
            let s = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str::<AgentConfig>(&s)
                .with_context(|| format!("parsing config JSON {}", path.display()))?
        } else {
            AgentConfig::default()
        };
        cfg.path = path;

        cfg.apply_env();

        if cfg.device_id.is_empty() {
            cfg.device_id = generate_device_id();
            cfg.save()?;
        }

        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("SENTINEL_HEARTBEAT_URL") {
            if !v.is_empty() {
                self.heartbeat_url = Some(v);
            }
        }
        if let Ok(v) = env::var("SENTINEL_HEARTBEAT_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.heartbeat_interval_secs = n;
            }
        }
        if let Ok(v) = env::var("SENTINEL_HEARTBEAT_KEY") {
            if !v.is_empty() {
                self.heartbeat_api_key = Some(v);
            }
        }
    }

    /// 先写 `<path>.tmp` 再 rename 覆盖，读者只会看到完整的旧文件或新文件
    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating config dir {}", dir.display()))?;
        }
        let data = serde_json::to_string_pretty(self).context("serializing config")?;

        let tmp = self.tmp_path();
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(data.as_bytes())
            .and_then(|_| file.sync_all())
            .with_context(|| format!("writing config file {}", tmp.display()))?;
        drop(file);
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| {
                format!("renaming {} -> {}", tmp.display(), self.path.display())
            });
        }
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// 锁文件目录与配置文件同目录
    pub fn state_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(state_dir)
    }
}

fn generate_device_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_generates_and_persists_device_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let cfg = AgentConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.device_id.len(), 16);
        assert!(path.exists());

        let again = AgentConfig::load(Some(&path)).unwrap();
        assert_eq!(again.device_id, cfg.device_id);
    }

    #[test]
    fn save_round_trips_current_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = AgentConfig::load(Some(&path)).unwrap();
        cfg.current_version = "v9.9.9".into();
        cfg.save().unwrap();

        let loaded = AgentConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.current_version, "v9.9.9");
        assert_eq!(loaded.state_dir(), dir.path());
    }

    #[test]
    fn save_replaces_existing_file_without_leaving_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"current_version":"v1.0.0","device_id":"abc"}"#).unwrap();

        let mut cfg = AgentConfig::load(Some(&path)).unwrap();
        cfg.current_version = "v1.1.0".into();
        cfg.save().unwrap();

        assert!(!dir.path().join("config.json.tmp").exists());
        let loaded = AgentConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.current_version, "v1.1.0");
        assert_eq!(loaded.device_id, "abc");
    }

    #[test]
    fn save_into_unwritable_target_keeps_old_file() {
        let dir = tempfile::tempdir().unwrap();
        // 目标是目录时 rename 失败，临时文件被清掉
        let path = dir.path().join("config.json");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"x").unwrap();

        let mut cfg = AgentConfig::default();
        cfg.path = path.clone();
        assert!(cfg.save().is_err());
        assert!(path.join("keep").exists());
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[test]
    fn api_key_is_never_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AgentConfig::default();
        cfg.path = dir.path().join("config.json");
        cfg.heartbeat_api_key = Some("secret".into());
        cfg.save().unwrap();

        let raw = fs::read_to_string(&cfg.path).unwrap();
        assert!(!raw.contains("secret"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"current_version":"v1.0.0","device_id":"abc"}"#).unwrap();

        let cfg = AgentConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.current_version, "v1.0.0");
        assert_eq!(cfg.github_repo, "sentinel-agent");
        assert!(cfg.heartbeat_interval_secs > 0);
    }
}
