use anyhow::{bail, Context, Result};
use log::info;
use reqwest::blocking::Client;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::models::ReleaseDescriptor;

pub const GITHUB_API: &str = "https://api.github.com";

/// 发布信息来源
pub trait ReleaseSource: Send + Sync {
    fn fetch_latest(&self, owner: &str, repo: &str) -> Result<ReleaseDescriptor>;

    /// 把资源流式写入 `dest`，返回字节数
    fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// GitHub releases API
pub struct GithubReleases {
    api_base: String,
    client: Client,
    download_client: Client,
}

impl GithubReleases {
    pub fn new(api_base: impl Into<String>) -> Result<Self> {
        let user_agent = concat!("sentinel-agent/", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()
            .context("building release client")?;
        let download_client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(300))
            .build()
            .context("building download client")?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client,
            download_client,
        })
    }

    pub fn latest_url(&self, owner: &str, repo: &str) -> String {
        format!("{}/repos/{}/{}/releases/latest", self.api_base, owner, repo)
    }
}

impl ReleaseSource for GithubReleases {
    fn fetch_latest(&self, owner: &str, repo: &str) -> Result<ReleaseDescriptor> {
        let url = self.latest_url(owner, repo);
        info!("Fetching release from: {}", url);

        let resp = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .with_context(|| format!("GET {}", url))?;
        if !resp.status().is_success() {
            bail!("GitHub API status {}", resp.status());
        }

        let rel: ReleaseDescriptor = resp.json().context("decoding release JSON")?;
        info!("Fetched release: {} with {} assets", rel.tag, rel.assets.len());
        Ok(rel)
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut resp = self
            .download_client
            .get(url)
            .send()
            .with_context(|| format!("GET {}", url))?;
        if !resp.status().is_success() {
            bail!("download failed status {}", resp.status());
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dest)
            .with_context(|| format!("creating {}", dest.display()))?;
        let written = resp
            .copy_to(&mut file)
            .with_context(|| format!("streaming {} to {}", url, dest.display()))?;
        file.flush()?;
        file.sync_all()?;
        Ok(written)
    }
}
