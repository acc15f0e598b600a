use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::ReadErrorAction;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, broadcasting every message to the other clients.
    Server(ServerArgs),
    /// Connect to a relay server, print what arrives and send typed lines.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Optional TOML file; flags given here take precedence over it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Host to bind to [default: localhost]
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to. Use 0 for an ephemeral port [default: 9999]
    #[arg(long)]
    pub port: Option<u16>,

    /// DEBUG logs verbosely and reports delivery failures as errors; any other value is quieter [default: DEBUG]
    #[arg(long)]
    pub mode: Option<String>,

    /// What to do when reading from a client fails [default: retry]
    #[arg(long, value_enum)]
    pub on_read_error: Option<ReadErrorAction>,

    /// Consecutive read failures tolerated before closing, with --on-read-error retry [default: 5]
    #[arg(long)]
    pub max_read_retries: Option<u32>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Optional TOML file; flags given here take precedence over it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Server host [default: localhost]
    #[arg(long)]
    pub host: Option<String>,

    /// Server port [default: 9999]
    #[arg(long)]
    pub port: Option<u16>,

    /// KEEPALIVE listens until the first error, TIMEOUT tolerates idle periods [default: KEEPALIVE]
    #[arg(long)]
    pub mode: Option<String>,

    /// Idle timeout in seconds, used in TIMEOUT mode [default: 10]
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_flags() {
        let cli = Cli::try_parse_from([
            "chat-relay",
            "client",
            "--host",
            "127.0.0.1",
            "--mode",
            "TIMEOUT",
            "--timeout",
            "1",
        ])
        .expect("valid client flags");

        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert_eq!(args.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(args.mode.as_deref(), Some("TIMEOUT"));
        assert_eq!(args.timeout, Some(1));
        assert_eq!(args.port, None);
    }

    #[test]
    fn parses_server_read_error_policy() {
        let cli = Cli::try_parse_from(["chat-relay", "server", "--on-read-error", "close"])
            .expect("valid server flags");

        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        assert_eq!(args.on_read_error, Some(ReadErrorAction::Close));
    }

    #[test]
    fn rejects_unknown_read_error_policy() {
        let result = Cli::try_parse_from(["chat-relay", "server", "--on-read-error", "ignore"]);
        assert!(result.is_err());
    }
}
