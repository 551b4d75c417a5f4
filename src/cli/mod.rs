#[allow(clippy::module_inception)]
mod cli;

pub use cli::{is_version_probe, Command, CommandArgs};
