use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::models::{AgentIdentity, ProcessRecord, ProcessStatus};
use crate::platform::{ListingFormat, PlatformOps};
use crate::services::version_resolver::VersionResolver;

/// 包含这些子串的行属于名字碰巧重叠的其他工具（日志查看、服务管理、grep 自身等）
pub const DENYLIST: &[&str] = &[
    "grep",
    "systemctl",
    "journalctl",
    "launchctl",
    "editor",
    "tail -f",
];

#[derive(Debug, Error)]
#[error("process listing failed: {0}")]
pub struct DiscoveryError(#[from] pub io::Error);

/// 解析出的候选进程（尚未解析版本）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub pid: u32,
    pub command_line: String,
}

/// 判断进程列表中的一行是否是 agent 实例
#[derive(Debug, Clone)]
pub struct CandidateFilter {
    pub token: String,
    pub self_pid: u32,
}

impl CandidateFilter {
    pub fn new(token: impl Into<String>, self_pid: u32) -> Self {
        Self {
            token: token.into(),
            self_pid,
        }
    }

    pub fn matches_line(&self, line: &str) -> bool {
        line.contains(&self.token) && !DENYLIST.iter().any(|d| line.contains(d))
    }
}

/// 解析原生进程列表输出
///
/// - `ps aux`：`USER PID %CPU %MEM VSZ RSS TTY STAT START TIME COMMAND...`
/// - `tasklist /fo csv /v /nh`：`"Image","PID","Session","#","Mem","Status","User","CPU","Title"`
///
/// 字段缺失或 PID 无法解析的行直接丢弃。
pub fn parse_listing(output: &str, format: ListingFormat, filter: &CandidateFilter) -> Vec<Candidate> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| filter.matches_line(line))
        .filter_map(|line| match format {
            ListingFormat::Ps => parse_ps_line(line),
            ListingFormat::TasklistCsv => parse_csv_line(line),
        })
        .filter(|c| c.pid != 0 && c.pid != filter.self_pid)
        .collect()
}

fn parse_ps_line(line: &str) -> Option<Candidate> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 11 {
        return None;
    }
    let pid = fields[1].parse::<u32>().ok()?;
    Some(Candidate {
        pid,
        command_line: fields[10..].join(" "),
    })
}

fn parse_csv_line(line: &str) -> Option<Candidate> {
    let fields = split_csv(line);
    if fields.len() < 2 {
        return None;
    }
    let pid = fields[1].trim().parse::<u32>().ok()?;
    // tasklist 没有命令行列，窗口标题可用时优先，否则用映像名
    let command_line = match fields.get(8) {
        Some(title) if !title.is_empty() && title != "N/A" => title.clone(),
        _ => fields[0].clone(),
    };
    Some(Candidate { pid, command_line })
}

/// 支持引号的 CSV 拆分，内存列形如 "12,345 K"
fn split_csv(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.trim_end_matches('\r').chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// 发现本机上其他 agent 实例（任意版本，排除自身）
///
/// 每次调用都是一次全新的快照，不保留历史状态。
pub struct ProcessRegistry {
    platform: Arc<dyn PlatformOps>,
    resolver: VersionResolver,
    filter: CandidateFilter,
    version: String,
}

impl ProcessRegistry {
    pub fn new(platform: Arc<dyn PlatformOps>, resolver: VersionResolver, identity: &AgentIdentity) -> Self {
        Self {
            platform,
            resolver,
            filter: CandidateFilter::new(identity.executable_token(), std::process::id()),
            version: identity.version.clone(),
        }
    }

    pub fn with_filter(mut self, filter: CandidateFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn discover(&self) -> Result<Vec<ProcessRecord>, DiscoveryError> {
        let output = self.platform.list_processes(&self.filter.token)?;
        let candidates = parse_listing(&output, self.platform.listing_format(), &self.filter);

        let records = candidates
            .into_iter()
            .map(|c| ProcessRecord {
                pid: c.pid,
                version: self.resolver.resolve(&c.command_line),
                command_line: c.command_line,
                status: ProcessStatus::Running,
            })
            .collect::<Vec<_>>();

        log::debug!("Discovered {} sibling process(es)", records.len());
        Ok(records)
    }

    /// 只返回与当前版本不同的实例（版本未知的也算在内），清理旧版本时使用
    pub fn discover_other_versions(&self) -> Result<Vec<ProcessRecord>, DiscoveryError> {
        let mut records = self.discover()?;
        records.retain(|r| r.version != self.version);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::version_resolver::NoProbe;
    use crate::services::testing::FakePlatform;
    use proptest::prelude::*;

    const PS_SAMPLE: &str = "\
USER         PID %CPU %MEM    VSZ   RSS TTY      STAT START   TIME COMMAND
root           1  0.0  0.1 167744 11520 ?        Ss   Oct10   0:09 /sbin/init splash
root         812  0.1  0.2 712345 20480 ?        Ssl  Oct10   1:02 /opt/sentinel-agent/sentinel-agent -version=v1.4.0 run
root         950  0.0  0.2 712345 20480 ?        Ssl  Oct10   0:31 /opt/sentinel-agent/sentinel-agent-v1.3.2 run
alice       2001  0.0  0.0   9040  2304 pts/0    S+   10:11   0:00 grep --color=auto sentinel-agent
alice       2002  0.0  0.0  18912  5120 pts/1    S+   10:12   0:00 journalctl -u sentinel-agent -f
alice       2003  0.0  0.0  18912  5120 pts/1    S+   10:12   0:00 tail -f /var/log/sentinel-agent.log
root        4242  0.0  0.2 712345 20480 ?        Ssl  10:00   0:01 /opt/sentinel-agent/sentinel-agent run
root        broken line sentinel-agent
";

    const TASKLIST_SAMPLE: &str = "\
\"sentinel-agent.exe\",\"3120\",\"Services\",\"0\",\"12,344 K\",\"Unknown\",\"NT AUTHORITY\\SYSTEM\",\"0:00:03\",\"N/A\"\r
\"sentinel-agent.exe\",\"5528\",\"Console\",\"1\",\"9,120 K\",\"Running\",\"HOST\\alice\",\"0:00:01\",\"sentinel-agent -version=v1.2.0\"\r
\"sentinel-agent.exe\",\"notapid\",\"Console\",\"1\",\"9,120 K\",\"Running\",\"HOST\\alice\",\"0:00:01\",\"N/A\"\r
";

    fn filter() -> CandidateFilter {
        CandidateFilter::new("sentinel-agent", 4242)
    }

    #[test]
    fn ps_output_yields_agent_lines_only() {
        let found = parse_listing(PS_SAMPLE, ListingFormat::Ps, &filter());
        assert_eq!(
            found,
            vec![
                Candidate {
                    pid: 812,
                    command_line: "/opt/sentinel-agent/sentinel-agent -version=v1.4.0 run".into()
                },
                Candidate {
                    pid: 950,
                    command_line: "/opt/sentinel-agent/sentinel-agent-v1.3.2 run".into()
                },
            ]
        );
    }

    #[test]
    fn tasklist_csv_handles_quoted_commas() {
        let f = CandidateFilter::new("sentinel-agent.exe", 1);
        let found = parse_listing(TASKLIST_SAMPLE, ListingFormat::TasklistCsv, &f);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].pid, 3120);
        assert_eq!(found[0].command_line, "sentinel-agent.exe");
        assert_eq!(found[1].pid, 5528);
        assert_eq!(found[1].command_line, "sentinel-agent -version=v1.2.0");
    }

    #[test]
    fn tasklist_no_match_message_is_empty() {
        let out = "INFO: No tasks are running which match the specified criteria.\r\n";
        let f = CandidateFilter::new("sentinel-agent.exe", 1);
        assert!(parse_listing(out, ListingFormat::TasklistCsv, &f).is_empty());
    }

    #[test]
    fn split_csv_unescapes_doubled_quotes() {
        assert_eq!(
            split_csv(r#""a","b ""x"" c","1,2""#),
            vec!["a".to_string(), "b \"x\" c".to_string(), "1,2".to_string()]
        );
    }

    #[test]
    fn discover_resolves_versions() {
        let platform = Arc::new(FakePlatform::with_listings(ListingFormat::Ps, vec![PS_SAMPLE]));
        let id = AgentIdentity::new("sentinel-agent", "v1.5.0");
        let registry = ProcessRegistry::new(platform, VersionResolver::new(Box::new(NoProbe)), &id)
            .with_filter(filter());

        let records = registry.discover().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].version, "v1.4.0");
        assert_eq!(records[1].version, "v1.3.2");
        assert!(records.iter().all(|r| r.status == ProcessStatus::Running));
    }

    #[test]
    fn other_versions_skip_same_version_instances() {
        let listing = "\
USER PID %CPU %MEM VSZ RSS TTY STAT START TIME COMMAND
root 555 0.0 0.1 1000 100 ? Ssl 09:00 0:01 /opt/sentinel-agent/sentinel-agent -version=v1.4.0 run
root 556 0.0 0.1 1000 100 ? Ssl 09:00 0:01 /opt/sentinel-agent/sentinel-agent -version=v1.3.0 run
root 557 0.0 0.1 1000 100 ? Ssl 09:00 0:01 /opt/sentinel-agent/sentinel-agent run
";
        let platform = Arc::new(FakePlatform::with_listings(ListingFormat::Ps, vec![listing]));
        let id = AgentIdentity::new("sentinel-agent", "v1.4.0");
        let registry = ProcessRegistry::new(platform, VersionResolver::new(Box::new(NoProbe)), &id)
            .with_filter(filter());

        assert_eq!(registry.discover().unwrap().len(), 3);
        let pids: Vec<u32> = registry
            .discover_other_versions()
            .unwrap()
            .iter()
            .map(|r| r.pid)
            .collect();
        assert_eq!(pids, vec![556, 557]);
    }

    #[test]
    fn listing_failure_is_an_error() {
        let platform = Arc::new(FakePlatform::failing_listing());
        let id = AgentIdentity::new("sentinel-agent", "v1.5.0");
        let registry = ProcessRegistry::new(platform, VersionResolver::new(Box::new(NoProbe)), &id);
        assert!(registry.discover().is_err());
    }

    proptest! {
        #[test]
        fn lines_without_token_never_yield_records(lines in proptest::collection::vec("[a-z0-9 ./:%-]{0,80}", 0..20)) {
            let output = lines
                .into_iter()
                .filter(|l| !l.contains("sentinel-agent"))
                .collect::<Vec<_>>()
                .join("\n");
            prop_assert!(parse_listing(&output, ListingFormat::Ps, &filter()).is_empty());
            prop_assert!(parse_listing(&output, ListingFormat::TasklistCsv, &filter()).is_empty());
        }

        #[test]
        fn arbitrary_input_never_panics(output in ".{0,400}") {
            let _ = parse_listing(&output, ListingFormat::Ps, &filter());
            let _ = parse_listing(&output, ListingFormat::TasklistCsv, &filter());
        }
    }
}
