//! Command-line interface definition.

use crate::config::ExitPolicy;
use clap::Parser;
use std::path::PathBuf;

/// Start a backend on the first client connection and stop it once the
/// proxy has seen no traffic for the idle timeout.
#[derive(Parser, Debug, Default)]
#[command(name = "lazyproxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file; flags override its values
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Idle timeout before the backend is stopped (e.g. 30s, 10m)
    #[arg(long, value_name = "DURATION")]
    pub idle: Option<String>,

    /// Address to listen on (":8080" for all interfaces)
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Address the backend listens on
    #[arg(long, value_name = "ADDR")]
    pub forward: Option<String>,

    /// How often to check for idleness (default: 5s)
    #[arg(long, value_name = "DURATION")]
    pub check_interval: Option<String>,

    /// Time a stopped backend gets to exit before it is killed (default: 10s)
    #[arg(long, value_name = "DURATION")]
    pub stop_grace_period: Option<String>,

    /// What to do when the backend exits on its own
    #[arg(long, value_enum, value_name = "POLICY")]
    pub on_backend_exit: Option<ExitPolicy>,

    /// Stop dialing the backend after this long and drop the client
    #[arg(long, value_name = "DURATION")]
    pub dial_max_wait: Option<String>,

    /// Stop dialing the backend after this many failed attempts and drop the client
    #[arg(long, value_name = "N")]
    pub dial_max_attempts: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Backend command and its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}
