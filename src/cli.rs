use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "clustercoord")]
#[command(about = "Coordinate VLAN pools, network tokens and orphaned addresses per cluster")]
#[command(version)]
pub struct Args {
    /// Path to the coordinator config file (YAML or JSON)
    #[arg(required = true, env = "CLUSTERCOORD_CONFIG")]
    pub config_file: PathBuf,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dry-run mode: validate config and show clusters without running
    #[arg(long)]
    pub dry_run: bool,

    /// Override the bind address of the control API
    #[arg(long, value_name = "ADDR", env = "CLUSTERCOORD_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Override the port of the control API
    #[arg(short, long, value_name = "PORT", env = "CLUSTERCOORD_PORT")]
    pub port: Option<u16>,

    /// Path to a .env file loaded before anything else
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

impl Args {
    /// Bind address: flag, then config, then all interfaces
    pub fn effective_bind_addr<'a>(&'a self, config: &'a CoordinatorConfig) -> &'a str {
        self.bind_addr
            .as_deref()
            .or(config.server.bind_addr.as_deref())
            .unwrap_or("0.0.0.0")
    }

    pub fn effective_port(&self, config: &CoordinatorConfig) -> u16 {
        self.port.or(config.server.port).unwrap_or(8080)
    }
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

use crate::config::CoordinatorConfig;

/// Format a dry-run output showing the configured clusters.
/// Pure function - returns a formatted string.
pub fn format_dry_run(config: &CoordinatorConfig, args: &Args) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "clustercoord v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Config: {}\n\n", args.config_file.display()));

    output.push_str(&format!("Clusters ({}):\n", config.clusters.len()));
    for cluster in &config.clusters {
        let bound = |v: Option<u16>| v.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
        output.push_str(&format!(
            "  - {} [vlans {}..{}, mode {}]",
            cluster.name,
            bound(cluster.min_vlan),
            bound(cluster.max_vlan),
            cluster.mode
        ));
        if cluster.public_addressing {
            output.push_str(" public-addressing");
        }
        if let Some(capacity) = cluster.address_capacity {
            output.push_str(&format!(" capacity={}", capacity));
        }
        output.push('\n');
    }

    let range = config.derived_range();
    output.push_str(&format!(
        "\nDerived VLAN range: {} ({} tags)\n",
        range,
        range.len()
    ));
    output.push_str(&format!(
        "Accounts: {}  Networks: {}  Addresses: {}\n",
        config.accounts.len(),
        config.networks.len(),
        config.addresses.len()
    ));
    output.push_str(&format!(
        "Control API: {}:{}\n",
        args.effective_bind_addr(config),
        args.effective_port(config)
    ));

    output.push_str("\nValidation: PASSED\n");
    output.push_str("Ready to start. Remove --dry-run to execute.\n");

    output
}
