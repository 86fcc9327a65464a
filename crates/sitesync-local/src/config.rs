use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sitesync_core::RetryPolicy;

/// Configuration for the sitesync command-line tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "sitesync")]
#[command(about = "Mount site workspaces and publish them to their targets")]
pub struct Config {
    /// Site configuration file (JSON array of sites)
    #[arg(long, default_value = "sites.json", env = "SITESYNC_CONFIG")]
    pub config: PathBuf,

    /// Total publish attempts for connectivity and timeout failures
    #[arg(long, default_value = "3", env = "SITESYNC_MAX_ATTEMPTS")]
    pub max_attempts: u32,

    /// Delay before the first retry, doubled for each further one (milliseconds)
    #[arg(long, default_value = "500", env = "SITESYNC_RETRY_BASE_MS")]
    pub retry_base_ms: u64,

    /// Upper bound of a retry delay (milliseconds)
    #[arg(long, default_value = "30000", env = "SITESYNC_RETRY_MAX_MS")]
    pub retry_max_ms: u64,

    /// Deadline of each mount, update and publish attempt (seconds, 0 = none)
    #[arg(long, default_value = "0", env = "SITESYNC_TIMEOUT_SECS")]
    pub timeout_secs: u64,

    /// Progress events buffered before new ones are dropped
    #[arg(long, default_value = "256", env = "SITESYNC_EVENT_BUFFER")]
    pub event_buffer: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List configured sites, or the workspaces of one site
    List { site: Option<String> },

    /// Mount a workspace (the site's first one by default)
    Mount {
        site: String,
        workspace: Option<String>,
    },

    /// Mount a workspace and refresh it from its source
    Update { site: String, workspace: String },

    /// Publish a site to one of its configured targets
    Publish {
        site: String,
        target: String,

        /// Workspace to publish instead of the target's default
        #[arg(long)]
        workspace: Option<String>,
    },
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            attempt_timeout: self.deadline(),
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["sitesync", "list"]);
        assert_eq!(config.config, PathBuf::from("sites.json"));
        assert_eq!(config.command, Command::List { site: None });
        assert_eq!(config.deadline(), None);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_publish_command() {
        let config = Config::parse_from([
            "sitesync",
            "--timeout-secs",
            "30",
            "publish",
            "docs",
            "production",
            "--workspace",
            "next",
        ]);
        assert_eq!(
            config.command,
            Command::Publish {
                site: "docs".into(),
                target: "production".into(),
                workspace: Some("next".into()),
            }
        );
        assert_eq!(config.retry_policy().attempt_timeout, Some(Duration::from_secs(30)));
    }
}
