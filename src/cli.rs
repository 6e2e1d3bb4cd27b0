use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ConfigError, DrainerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "node-drainer")]
#[command(about = "Safely drain Kubernetes worker nodes that AWS is about to terminate")]
#[command(version)]
pub struct Args {
    /// URL of the SQS queue receiving lifecycle-hook notifications
    #[arg(long, env = "NODE_DRAINER_QUEUE_URL", value_name = "URL")]
    pub queue_url: Option<String>,

    /// Seconds between EC2 instance polls
    #[arg(long, env = "NODE_DRAINER_EC2_POLL_INTERVAL", default_value = "10", value_name = "SECS")]
    pub ec2_poll_interval: u64,

    /// Seconds between Spot request polls
    #[arg(long, env = "NODE_DRAINER_SPOT_POLL_INTERVAL", default_value = "10", value_name = "SECS")]
    pub spot_poll_interval: u64,

    /// Lifecycle messages younger than this many seconds are never deleted
    #[arg(long, env = "NODE_DRAINER_MIN_DELETE_AGE", default_value = "1800", value_name = "SECS")]
    pub min_delete_age: u64,

    /// Seconds a deleted lifecycle message is remembered
    #[arg(long, env = "NODE_DRAINER_DELETION_GRACE", default_value = "300", value_name = "SECS")]
    pub deletion_grace: u64,

    /// Maximum seconds between reconciliation passes
    #[arg(long, env = "NODE_DRAINER_MAX_WAIT", default_value = "60", value_name = "SECS")]
    pub max_wait: u64,

    /// Seconds to pause after a failed reconciliation pass
    #[arg(long, env = "NODE_DRAINER_ERROR_COOLDOWN", default_value = "5", value_name = "SECS")]
    pub error_cooldown: u64,

    /// Only watch pods and workloads in this namespace
    #[arg(long, env = "NODE_DRAINER_NAMESPACE", value_name = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Path to a .env file with AWS and drainer settings
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Dry-run mode: validate config and print it without running
    #[arg(long)]
    pub dry_run: bool,
}

impl Args {
    /// Default log filter for the verbosity level
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    pub fn to_config(&self) -> Result<DrainerConfig, ConfigError> {
        let config = DrainerConfig {
            queue_url: self.queue_url.clone().unwrap_or_default(),
            ec2_poll_interval: Duration::from_secs(self.ec2_poll_interval),
            spot_poll_interval: Duration::from_secs(self.spot_poll_interval),
            min_delete_age: Duration::from_secs(self.min_delete_age),
            deletion_grace: Duration::from_secs(self.deletion_grace),
            max_wait: Duration::from_secs(self.max_wait),
            error_cooldown: Duration::from_secs(self.error_cooldown),
            namespace: self.namespace.clone().filter(|ns| !ns.is_empty()),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Format the effective configuration for `--dry-run`.
/// Pure function - returns a formatted string.
pub fn format_dry_run(config: &DrainerConfig) -> String {
    let secs = |d: Duration| format!("{}s", d.as_secs());
    let mut output = String::new();

    output.push_str(&format!(
        "node-drainer v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Queue: {}\n", config.queue_url));
    output.push_str(&format!(
        "Namespace: {}\n\n",
        config.namespace.as_deref().unwrap_or("<all>")
    ));

    output.push_str("Polling:\n");
    output.push_str(&format!("  EC2:   every {}\n", secs(config.ec2_poll_interval)));
    output.push_str(&format!("  Spot:  every {}\n", secs(config.spot_poll_interval)));
    output.push_str(&format!("  Retry: after {}\n\n", secs(config.fetch_backoff)));

    output.push_str("Reconciliation:\n");
    output.push_str(&format!("  Max wait:          {}\n", secs(config.max_wait)));
    output.push_str(&format!("  Error cooldown:    {}\n", secs(config.error_cooldown)));
    output.push_str(&format!("  Min delete age:    {}\n", secs(config.min_delete_age)));
    output.push_str(&format!("  Deletion grace:    {}\n", secs(config.deletion_grace)));

    output
}
