//! 单元测试用的平台和发布源替身

use anyhow::{anyhow, bail, Result};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::models::{ReleaseAsset, ReleaseDescriptor};
use crate::platform::{
    ListingFormat, PlatformOps, ReplaceMethod, Replacement, ServiceSpec,
};
use crate::services::release_client::ReleaseSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Listed,
    Terminate(u32),
    Kill(u32),
    Replace,
    Restart,
}

/// 按顺序返回预设的进程列表输出，用尽后重复最后一个
pub struct FakePlatform {
    format: ListingFormat,
    listings: Mutex<VecDeque<String>>,
    fail_listing: bool,
    fail_replace: bool,
    unkillable: Vec<u32>,
    pub events: Mutex<Vec<Event>>,
    restart_args: Mutex<Option<Vec<String>>>,
}

impl FakePlatform {
    pub fn with_listings(format: ListingFormat, listings: Vec<&str>) -> Self {
        Self {
            format,
            listings: Mutex::new(listings.into_iter().map(String::from).collect()),
            fail_listing: false,
            fail_replace: false,
            unkillable: Vec::new(),
            events: Mutex::new(Vec::new()),
            restart_args: Mutex::new(None),
        }
    }

    pub fn failing_listing() -> Self {
        let mut p = Self::with_listings(ListingFormat::Ps, vec![]);
        p.fail_listing = true;
        p
    }

    pub fn failing_replace(mut self) -> Self {
        self.fail_replace = true;
        self
    }

    pub fn unkillable(mut self, pid: u32) -> Self {
        self.unkillable.push(pid);
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// 最近一次 restart 收到的启动参数
    pub fn restart_args(&self) -> Option<Vec<String>> {
        self.restart_args.lock().unwrap().clone()
    }

    fn record(&self, e: Event) {
        self.events.lock().unwrap().push(e);
    }
}

impl PlatformOps for FakePlatform {
    fn listing_format(&self) -> ListingFormat {
        self.format
    }

    fn list_processes(&self, _token: &str) -> io::Result<String> {
        if self.fail_listing {
            return Err(io::Error::new(io::ErrorKind::NotFound, "ps: not found"));
        }
        self.record(Event::Listed);
        let mut listings = self.listings.lock().unwrap();
        let out = if listings.len() > 1 {
            listings.pop_front().unwrap_or_default()
        } else {
            listings.front().cloned().unwrap_or_default()
        };
        Ok(out)
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.record(Event::Terminate(pid));
        Ok(())
    }

    fn kill(&self, pid: u32) -> Result<()> {
        self.record(Event::Kill(pid));
        if self.unkillable.contains(&pid) {
            bail!("operation not permitted (PID {})", pid);
        }
        Ok(())
    }

    fn replace(&self, staged: &Path, live: &Path, args: &[String]) -> Result<Replacement> {
        self.record(Event::Replace);
        if self.fail_replace {
            return Err(anyhow!("rename {} -> {}: cross-device link", staged.display(), live.display()));
        }
        fs::rename(staged, live)?;
        Ok(Replacement {
            live: live.to_path_buf(),
            method: ReplaceMethod::Renamed,
            args: args.to_vec(),
        })
    }

    fn restart(&self, replacement: &Replacement) -> Result<()> {
        self.record(Event::Restart);
        *self.restart_args.lock().unwrap() = Some(replacement.args.clone());
        Ok(())
    }

    fn install_service(&self, _spec: &ServiceSpec) -> Result<()> {
        Ok(())
    }

    fn uninstall_service(&self, _spec: &ServiceSpec) -> Result<()> {
        Ok(())
    }
}

/// 固定发布信息，下载时写入固定内容
pub struct FakeReleases {
    pub release: ReleaseDescriptor,
    pub payload: Vec<u8>,
    pub fail_download: bool,
    downloads: Arc<Mutex<Vec<String>>>,
}

impl FakeReleases {
    pub fn new(tag: &str, asset_names: &[&str]) -> Self {
        Self {
            release: ReleaseDescriptor {
                tag: tag.to_string(),
                assets: asset_names
                    .iter()
                    .map(|n| ReleaseAsset {
                        name: n.to_string(),
                        download_url: format!("https://downloads.test/{}", n),
                    })
                    .collect(),
            },
            payload: b"#!/bin/sh\necho new\n".to_vec(),
            fail_download: false,
            downloads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_download(mut self) -> Self {
        self.fail_download = true;
        self
    }

    /// 下载记录的共享句柄，发布源交给 Updater 之后仍可查看
    pub fn downloads(&self) -> Arc<Mutex<Vec<String>>> {
        self.downloads.clone()
    }
}

impl ReleaseSource for FakeReleases {
    fn fetch_latest(&self, _owner: &str, _repo: &str) -> Result<ReleaseDescriptor> {
        Ok(self.release.clone())
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        self.downloads.lock().unwrap().push(url.to_string());
        if self.fail_download {
            bail!("download failed status 404");
        }
        fs::write(dest, &self.payload)?;
        Ok(self.payload.len() as u64)
    }
}
