use lazy_static::lazy_static;
use regex::Regex;
use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub const UNKNOWN_VERSION: &str = "unknown";

lazy_static! {
    /// `-version=v1`、`--version=v1`、`-version v1`、`--version v1`
    static ref VERSION_FLAG: Regex =
        Regex::new(r#"(?:^|\s)--?version(?:=|\s+)"?([^\s"]+)"?"#).unwrap();
}

/// 通过执行二进制获取版本（第二级回退）
pub trait VersionProbe: Send + Sync {
    fn probe(&self, binary: &str) -> Option<String>;
}

/// 以 `-version` 参数执行候选二进制，读取 stdout
pub struct ExecProbe {
    timeout: Duration,
}

impl ExecProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ExecProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl VersionProbe for ExecProbe {
    fn probe(&self, binary: &str) -> Option<String> {
        let path = resolve_binary(binary)?;
        let mut child = Command::new(&path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .ok()?;

        // 输出超过管道缓冲时子进程会阻塞在写上，必须边跑边读
        let mut stdout = child.stdout.take()?;
        let reader = thread::spawn(move || {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).map(|_| buf)
        });

        // 不可信的二进制可能挂住，超时后杀掉
        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                    log::debug!("version probe of {} timed out", path.display());
                    return None;
                }
            }
        };

        let stdout = reader.join().ok()?.ok()?;
        if !status.success() {
            return None;
        }
        parse_version_output(&String::from_utf8_lossy(&stdout))
    }
}

/// 不执行任何二进制
pub struct NoProbe;

impl VersionProbe for NoProbe {
    fn probe(&self, _binary: &str) -> Option<String> {
        None
    }
}

/// 从进程命令行推断版本号
///
/// 命令行经常被服务管理器或包装脚本改写，因此逐级回退：
/// 1. 命令行中的 `-version` 参数
/// 2. 执行二进制并解析输出
/// 3. 可执行文件名中的 `-v<版本>` 片段
/// 4. "unknown"
pub struct VersionResolver {
    probe: Box<dyn VersionProbe>,
}

impl VersionResolver {
    pub fn new(probe: Box<dyn VersionProbe>) -> Self {
        Self { probe }
    }

    pub fn resolve(&self, command_line: &str) -> String {
        if let Some(v) = version_from_flag(command_line) {
            return v;
        }

        if let Some(binary) = command_line.split_whitespace().next() {
            let binary = binary.trim_matches('"');
            if let Some(v) = self.probe.probe(binary) {
                return v;
            }
            if let Some(v) = version_from_path(binary) {
                return v;
            }
        }

        UNKNOWN_VERSION.to_string()
    }
}

impl Default for VersionResolver {
    fn default() -> Self {
        Self::new(Box::new(ExecProbe::default()))
    }
}

pub fn version_from_flag(command_line: &str) -> Option<String> {
    VERSION_FLAG
        .captures(command_line)
        .map(|c| c[1].to_string())
        .filter(|v| !v.starts_with('-'))
}

/// 取可执行文件路径中最后一个 `v<数字>` 开头的 `-` 分隔片段，例如 `sentinel-agent-v1.8.4`
pub fn version_from_path(executable: &str) -> Option<String> {
    executable
        .split('-')
        .rev()
        .find(|part| {
            let mut chars = part.chars();
            chars.next() == Some('v') && chars.next().is_some_and(|c| c.is_ascii_digit())
        })
        .map(|part| part.trim_matches('"').to_string())
}

/// 在 `-version` 输出中找包含 "version" 的行，取其后一个词
pub fn parse_version_output(output: &str) -> Option<String> {
    for line in output.lines() {
        if !line.contains("version") {
            continue;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        for (i, word) in words.iter().enumerate() {
            if word.contains("version") {
                if let Some(next) = words.get(i + 1) {
                    return Some(next.trim_end_matches(',').to_string());
                }
            }
        }
    }
    None
}

/// 裸命令名通过 PATH 查找
fn resolve_binary(binary: &str) -> Option<PathBuf> {
    let path = Path::new(binary);
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }
    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(&'static str);

    impl VersionProbe for FixedProbe {
        fn probe(&self, _binary: &str) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn resolver() -> VersionResolver {
        VersionResolver::new(Box::new(NoProbe))
    }

    #[test]
    fn explicit_equals_flag_wins() {
        assert_eq!(
            resolver().resolve("/opt/sentinel-agent/sentinel-agent -version=v2.3.1 run"),
            "v2.3.1"
        );
    }

    #[test]
    fn double_dash_and_separate_value_forms() {
        assert_eq!(resolver().resolve("sentinel-agent --version v1.0.0"), "v1.0.0");
        assert_eq!(resolver().resolve("sentinel-agent -version \"v1.2.0\""), "v1.2.0");
        assert_eq!(resolver().resolve("sentinel-agent --version=v3"), "v3");
    }

    #[test]
    fn no_recognizable_token_is_unknown() {
        assert_eq!(resolver().resolve("/usr/local/bin/sentinel run"), UNKNOWN_VERSION);
        assert_eq!(resolver().resolve(""), UNKNOWN_VERSION);
    }

    #[test]
    fn probe_is_consulted_before_path() {
        let r = VersionResolver::new(Box::new(FixedProbe("v5.0.0")));
        assert_eq!(r.resolve("/opt/sentinel-agent-v1.0.0 run"), "v5.0.0");
    }

    #[test]
    fn flag_is_preferred_over_probe() {
        let r = VersionResolver::new(Box::new(FixedProbe("v5.0.0")));
        assert_eq!(r.resolve("sentinel-agent -version=v2"), "v2");
    }

    #[test]
    fn path_fallback_takes_last_v_token() {
        assert_eq!(
            resolver().resolve("/opt/bin/sentinel-agent-v1.8.4"),
            "v1.8.4"
        );
        assert_eq!(
            version_from_path("/tmp/sentinel-agent-v1.0-build-v1.1"),
            Some("v1.1".to_string())
        );
    }

    #[test]
    fn path_fallback_ignores_arguments() {
        assert_eq!(
            resolver().resolve("/usr/bin/sentinel-agent run --verbose"),
            UNKNOWN_VERSION
        );
    }

    #[test]
    fn version_output_parsing() {
        assert_eq!(
            parse_version_output("sentinel-agent version: v1.0.0\nBuild info: linux/amd64\n"),
            Some("v1.0.0".to_string())
        );
        assert_eq!(
            parse_version_output("tool version v2.1.0, built today"),
            Some("v2.1.0".to_string())
        );
        assert_eq!(parse_version_output("nothing here"), None);
    }

    #[cfg(unix)]
    #[test]
    fn exec_probe_reads_script_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("fake-agent");
        std::fs::write(&bin, "#!/bin/sh\necho \"fake-agent version v7.7.7\"\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let probe = ExecProbe::default();
        assert_eq!(probe.probe(bin.to_str().unwrap()), Some("v7.7.7".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn exec_probe_drains_output_larger_than_pipe_buffer() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("chatty-agent");
        std::fs::write(
            &bin,
            "#!/bin/sh\nhead -c 200000 /dev/zero | tr '\\0' 'x'\necho\necho \"chatty-agent version v7.7.8\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let probe = ExecProbe::new(Duration::from_secs(5));
        let started = Instant::now();
        assert_eq!(probe.probe(bin.to_str().unwrap()), Some("v7.7.8".to_string()));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn exec_probe_missing_binary_is_none() {
        let probe = ExecProbe::new(Duration::from_millis(200));
        assert_eq!(probe.probe("/definitely/not/here/sentinel-agent"), None);
    }
}
