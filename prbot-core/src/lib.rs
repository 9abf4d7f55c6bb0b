pub mod command;
pub mod config;
pub mod forge;
pub mod github;
pub mod processor;
pub mod property_file;
pub mod recording;
pub mod state_machine;

pub use command::{parse, Command, CommandKind, CommandSet};
pub use config::{BotConfig, ConfigProvider, RuntimeConfig};
pub use forge::{ForgeClient, IssueSnapshot};
pub use github::GitHubClient;
pub use processor::{IssueProcessor, ProcessError, ProcessOutcome};
pub use property_file::PropertyFileWriter;
pub use recording::RecordingForge;
pub use state_machine::*;

/// Version string embedded in bot-authored comments.
pub fn get_bot_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
