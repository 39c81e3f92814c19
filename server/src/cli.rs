//! # Command-Line Surface
//!
//! Boundary-only flags; everything interesting happens behind them.
//! Exit code 42 (from the `reload` tool) tells a supervisor to respawn
//! the process.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "bridge-server", version, about = "Local bridge exposing a browser extension as JSON-RPC tools")]
pub struct Cli {
    /// Enable debug tooling (the `reload` tool, verbose headers).
    /// `--debug=no_truncate` additionally keeps forwarded console
    /// payloads untruncated.
    #[arg(long, value_name = "MODE", num_args = 0..=1, default_missing_value = "on")]
    pub debug: Option<String>,

    /// Loopback port for the extension WebSocket endpoint.
    #[arg(long, default_value_t = 5555)]
    pub port: u16,

    /// Write logs to this file instead of stderr.
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Quiet stderr for supervised runs; wire behavior is unchanged.
    #[arg(long)]
    pub script_mode: bool,
}

impl Cli {
    pub fn debug_enabled(&self) -> bool {
        self.debug.is_some()
    }

    pub fn no_truncate(&self) -> bool {
        self.debug.as_deref() == Some("no_truncate")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["bridge-server"]).unwrap();
        assert!(!cli.debug_enabled());
        assert!(!cli.no_truncate());
        assert_eq!(cli.port, 5555);
        assert!(!cli.script_mode);
    }

    #[test]
    fn debug_modes() {
        let cli = Cli::try_parse_from(["bridge-server", "--debug"]).unwrap();
        assert!(cli.debug_enabled());
        assert!(!cli.no_truncate());

        let cli = Cli::try_parse_from(["bridge-server", "--debug=no_truncate"]).unwrap();
        assert!(cli.debug_enabled());
        assert!(cli.no_truncate());
    }

    #[test]
    fn port_and_log_file() {
        let cli = Cli::try_parse_from([
            "bridge-server",
            "--port",
            "6001",
            "--log-file",
            "/tmp/bridge.log",
            "--script-mode",
        ])
        .unwrap();
        assert_eq!(cli.port, 6001);
        assert_eq!(cli.log_file.unwrap(), PathBuf::from("/tmp/bridge.log"));
        assert!(cli.script_mode);
    }
}
