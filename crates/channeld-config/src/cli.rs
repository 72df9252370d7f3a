//! Command-line argument parsing for channeld connections.

use std::path::PathBuf;

use channeld_net::protocol::ChannelType;
use clap::Parser;
use tracing::info;

use crate::Config;

/// Short flags launchers pass with a single dash (`-sa 10.0.0.2`, `-sp=11288`).
const LEGACY_FLAGS: [&str; 8] = ["sa", "sp", "sc", "ca", "cp", "ct", "fo", "cm"];

/// channeld connection arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default, PartialEq)]
#[command(name = "channeld-client", about = "channeld hub connection")]
pub struct CliArgs {
    /// Hub address for the server connection.
    #[arg(long, alias = "sa")]
    pub server_address: Option<String>,

    /// Hub port for the server connection.
    #[arg(long, alias = "sp")]
    pub server_port: Option<u16>,

    /// Channel type the server creates (name or number).
    #[arg(long, alias = "sc")]
    pub server_channel_type: Option<ChannelType>,

    /// Hub address for the client connection.
    #[arg(long, alias = "ca")]
    pub client_address: Option<String>,

    /// Hub port for the client connection.
    #[arg(long, alias = "cp")]
    pub client_port: Option<u16>,

    /// Channel type for both roles (name or number).
    #[arg(long, alias = "ct")]
    pub channel_type: Option<ChannelType>,

    /// Fan-out interval in milliseconds for both roles.
    #[arg(long, alias = "fo")]
    pub fan_out_interval: Option<u32>,

    /// Metadata attached to the server's channel.
    #[arg(long, alias = "cm")]
    pub channel_meta: Option<String>,

    /// Compress outbound packets.
    #[arg(long)]
    pub compression: Option<bool>,

    /// TCP connect timeout in milliseconds.
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// RPC reply timeout in milliseconds.
    #[arg(long)]
    pub rpc_timeout_ms: Option<u64>,

    /// Log filter (error, warn, info, debug, trace, or a directive list).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl CliArgs {
    /// Parse the process arguments, accepting the legacy single-dash flags.
    pub fn from_env() -> Self {
        Self::parse_from(normalize_legacy_args(std::env::args()))
    }
}

/// Rewrite legacy single-dash flags into their long form so clap accepts them.
///
/// `-sa 10.0.0.2` becomes `--sa 10.0.0.2` and `-sp=11288` becomes
/// `--sp=11288`. Everything else is passed through untouched.
pub fn normalize_legacy_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            let Some(body) = arg.strip_prefix('-') else {
                return arg;
            };
            let name = body.split('=').next().unwrap_or_default();
            if !body.starts_with('-') && LEGACY_FLAGS.contains(&name) {
                format!("-{arg}")
            } else {
                arg
            }
        })
        .collect()
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.server_address {
            info!("Server hub address from command line: {}", addr);
            self.server.hub_address = addr.clone();
        }
        if let Some(port) = args.server_port {
            self.server.hub_port = port;
        }
        if let Some(ref addr) = args.client_address {
            self.client.hub_address = addr.clone();
        }
        if let Some(port) = args.client_port {
            self.client.hub_port = port;
        }
        if let Some(channel_type) = args.channel_type {
            self.server.channel_type = channel_type;
            self.client.channel_type = channel_type;
        }
        if let Some(channel_type) = args.server_channel_type {
            self.server.channel_type = channel_type;
        }
        if let Some(interval) = args.fan_out_interval {
            self.server.fan_out_interval_ms = interval;
            self.client.fan_out_interval_ms = interval;
        }
        if let Some(ref meta) = args.channel_meta {
            self.server.channel_metadata = meta.clone();
        }
        if let Some(compression) = args.compression {
            self.connection.compression = compression;
        }
        if let Some(ms) = args.connect_timeout_ms {
            self.connection.connect_timeout_ms = ms;
        }
        if let Some(ms) = args.rpc_timeout_ms {
            self.connection.rpc_timeout_ms = Some(ms);
        }
        if let Some(ref level) = args.log_level {
            self.log.level = level.clone();
        }
    }
}
