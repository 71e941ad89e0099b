//! CLI argument parsing for the fiscal-ledger-worker binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "fiscal-ledger-worker", about = "Resumable fiscal-ledger import worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the worker server (default if no subcommand given)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Import a local ledger file in memory and print the resulting counts
    Replay {
        /// Path of the ledger file
        #[arg(long)]
        file: PathBuf,
        /// Company the rows are attributed to
        #[arg(long)]
        company: Option<Uuid>,
        /// Line budget per invocation, to exercise resumption
        #[arg(long)]
        max_lines: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_migrate_command_parses() {
        let cli = Cli::parse_from(["fiscal-ledger-worker", "migrate"]);
        assert!(matches!(cli.command, Some(Command::Migrate)));
    }

    #[test]
    fn test_cli_no_command_defaults_to_none() {
        let cli = Cli::parse_from(["fiscal-ledger-worker"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_serve_command_parses() {
        let cli = Cli::parse_from(["fiscal-ledger-worker", "serve"]);
        assert!(matches!(cli.command, Some(Command::Serve)));
    }

    #[test]
    fn test_cli_replay_command_parses() {
        let cli = Cli::parse_from([
            "fiscal-ledger-worker",
            "replay",
            "--file",
            "/tmp/efd.txt",
            "--max-lines",
            "1000",
        ]);
        match cli.command {
            Some(Command::Replay {
                file,
                company,
                max_lines,
            }) => {
                assert_eq!(file, PathBuf::from("/tmp/efd.txt"));
                assert!(company.is_none());
                assert_eq!(max_lines, Some(1000));
            }
            _ => panic!("expected replay command"),
        }
    }

    #[test]
    fn test_cli_replay_requires_file() {
        assert!(Cli::try_parse_from(["fiscal-ledger-worker", "replay"]).is_err());
    }
}
