pub mod process;
pub mod release;
pub mod stats;

pub use process::{AgentIdentity, ProcessRecord, ProcessStatus};
pub use release::{ReleaseAsset, ReleaseDescriptor};
pub use stats::{HeartbeatPayload, SystemInfo};
