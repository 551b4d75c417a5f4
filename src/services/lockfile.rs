use fs2::FileExt;
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::platform::is_process_running;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// 打开后发现文件已被换掉时的重试次数
const REOPEN_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock already held by another process (PID {pid:?})")]
    AlreadyLocked { pid: Option<u32> },

    #[error("invalid PID in lock file: {0:?}")]
    InvalidPid(String),

    #[error("timeout acquiring lock after {0:?}")]
    Timeout(Duration),

    #[error("lock file I/O: {0}")]
    Io(#[from] io::Error),
}

/// 单实例锁：`<dir>/<name>.lock`，内容为持有者 PID
///
/// 是否被占用只由文件上的 fs2 排他锁决定。拿不到锁的一方从不删除或改写文件，
/// 文件内容（PID）只用于展示，空文件或损坏的内容在拿到锁后直接覆盖。
pub struct SingleInstanceLock {
    path: PathBuf,
    file: Option<File>,
}

enum Attempt {
    Locked(File),
    Contended,
    /// 拿到锁时文件已被持有者删除或替换
    Replaced,
}

impl SingleInstanceLock {
    pub fn new(dir: &Path, name: &str) -> Self {
        if let Err(e) = fs::create_dir_all(dir) {
            // 目录创建失败时，后续创建锁文件会报错
            debug!("creating lock dir {} failed: {}", dir.display(), e);
        }
        Self {
            path: dir.join(format!("{}.lock", name)),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    pub fn try_acquire(&mut self) -> Result<(), LockError> {
        if self.file.is_some() {
            return Ok(());
        }

        for _ in 0..REOPEN_ATTEMPTS {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)?;

            let mut file = match self.lock_current(file)? {
                Attempt::Locked(f) => f,
                Attempt::Contended => {
                    return Err(LockError::AlreadyLocked {
                        pid: self.locked_pid().ok(),
                    })
                }
                Attempt::Replaced => continue,
            };

            match read_pid(&mut file) {
                Some(pid) if pid != std::process::id() && is_process_running(pid) => {
                    warn!(
                        "Lock {} names live PID {} without holding it, reclaiming",
                        self.path.display(),
                        pid
                    );
                }
                Some(pid) => debug!("reclaiming stale lock {} (PID {})", self.path.display(), pid),
                None => {}
            }

            if let Err(e) = write_pid(&mut file) {
                let _ = fs2::FileExt::unlock(&file);
                return Err(e.into());
            }

            self.file = Some(file);
            return Ok(());
        }

        Err(LockError::AlreadyLocked {
            pid: self.locked_pid().ok(),
        })
    }

    /// 轮询 try_acquire 直到成功或超时；AlreadyLocked 以外的错误立即返回
    pub fn acquire_with_timeout(&mut self, timeout: Duration) -> Result<(), LockError> {
        let start = Instant::now();
        loop {
            match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(LockError::AlreadyLocked { .. }) => {}
                Err(e) => return Err(e),
            }
            if start.elapsed() >= timeout {
                return Err(LockError::Timeout(timeout));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// 释放锁，未持有时为空操作
    ///
    /// 先在持锁状态下删除文件再解锁，等待中的句柄拿到的只会是已删除的文件。
    pub fn release(&mut self) -> Result<(), LockError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let removed = remove_if_exists(&self.path);
        let _ = fs2::FileExt::unlock(&file);
        drop(file);
        removed?;
        Ok(())
    }

    pub fn locked_pid(&self) -> Result<u32, LockError> {
        let data = fs::read_to_string(&self.path)?;
        let trimmed = data.trim();
        trimmed
            .parse::<u32>()
            .map_err(|_| LockError::InvalidPid(trimmed.to_string()))
    }

    /// 是否存在存活的持有者；无人持有的锁文件（包括空文件、内容损坏）会被删除
    pub fn check_existing_lock(&self) -> Result<bool, LockError> {
        if self.file.is_some() {
            return Ok(true);
        }

        for _ in 0..REOPEN_ATTEMPTS {
            let file = match OpenOptions::new().read(true).write(true).open(&self.path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e.into()),
            };

            match self.lock_current(file)? {
                Attempt::Locked(file) => {
                    match self.locked_pid() {
                        Ok(pid) => debug!("removing stale lock {} (PID {})", self.path.display(), pid),
                        Err(e) => debug!("removing unowned lock {}: {}", self.path.display(), e),
                    }
                    let removed = remove_if_exists(&self.path);
                    let _ = fs2::FileExt::unlock(&file);
                    removed?;
                    return Ok(false);
                }
                Attempt::Contended => return Ok(true),
                Attempt::Replaced => continue,
            }
        }

        Ok(self.path.exists())
    }

    /// 对已打开的句柄加锁，并确认它仍是路径上的那个文件
    fn lock_current(&self, file: File) -> Result<Attempt, LockError> {
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => return Ok(Attempt::Contended),
            Err(e) => return Err(e.into()),
        }

        if same_file(&file, &self.path)? {
            Ok(Attempt::Locked(file))
        } else {
            let _ = fs2::FileExt::unlock(&file);
            Ok(Attempt::Replaced)
        }
    }
}

impl Drop for SingleInstanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut data = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut data).ok()?;
    data.trim().parse::<u32>().ok()
}

fn write_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()
}

#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(on_disk) => Ok(held.dev() == on_disk.dev() && held.ino() == on_disk.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> io::Result<bool> {
    Ok(path.exists())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
