pub mod heartbeat;
pub mod lockfile;
pub mod process_registry;
pub mod release_client;
pub mod stats_collector;
pub mod updater;
pub mod version_resolver;

#[cfg(test)]
pub mod testing;

pub use heartbeat::{HeartbeatSink, HttpHeartbeat};
pub use lockfile::{LockError, SingleInstanceLock};
pub use process_registry::ProcessRegistry;
pub use release_client::{GithubReleases, ReleaseSource};
pub use stats_collector::StatsCollector;
pub use updater::{UpdateOutcome, Updater};
pub use version_resolver::VersionResolver;
