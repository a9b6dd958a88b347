//! Command-line arguments using clap
//!
//! `sa-broker [--config PATH] <command> [args...]`. `--config` is global, so
//! it may appear before or after the command.

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "sa-broker")]
#[command(about = "Quota-aware service account rotation for rclone remotes")]
#[command(version)]
pub struct Cli {
    /// Path to the TOML config (falls back to CONFIG_PATH, then sa-broker.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Print ENV=path for leased service accounts
    Lease {
        #[arg(required = true, value_name = "REMOTE:PATH")]
        remotes: Vec<String>,
    },

    /// Ban a remote or service account file
    Ban {
        /// Remote name, `remote:path`, or absolute service account path
        key: String,

        /// Ban duration (defaults to the configured reissue ban hours)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        hours: Option<u64>,
    },

    /// Lift a ban
    Unban { key: String },

    /// List active bans
    Bans,

    /// Drop expired bans
    Purge,

    /// Service accounts per configured remote
    Status,

    /// Apply a transfer exit status
    Report {
        /// rclone exit code
        code: i32,

        #[arg(value_name = "REMOTE:PATH")]
        remote: String,

        /// Service account files used by the transfer
        credentials: Vec<String>,
    },

    /// Run a reissue server until interrupted
    Serve {
        #[arg(required = true, value_name = "REMOTE:PATH")]
        remotes: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(line: &str) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("sa-broker").chain(line.split_whitespace()))
    }

    #[test]
    fn lease_collects_remotes() {
        let cli = parse("lease gdrive:media backup:media").unwrap();
        assert_eq!(cli.config, None);
        assert_eq!(
            cli.command,
            Command::Lease {
                remotes: vec!["gdrive:media".into(), "backup:media".into()]
            }
        );
    }

    #[test]
    fn config_flag_before_or_after_command() {
        let before = parse("--config /etc/sa.toml bans").unwrap();
        let after = parse("bans --config /etc/sa.toml").unwrap();
        assert_eq!(before.command, after.command);
        assert_eq!(before.config.as_deref(), Some("/etc/sa.toml"));
        assert_eq!(after.config.as_deref(), Some("/etc/sa.toml"));
    }

    #[test]
    fn config_flag_without_value_is_error() {
        assert!(parse("bans --config").is_err());
    }

    #[test]
    fn ban_with_and_without_hours() {
        assert_eq!(
            parse("ban gdrive").unwrap().command,
            Command::Ban {
                key: "gdrive".into(),
                hours: None
            }
        );
        assert_eq!(
            parse("ban --hours 6 /opt/sa/sa1.json").unwrap().command,
            Command::Ban {
                key: "/opt/sa/sa1.json".into(),
                hours: Some(6)
            }
        );
    }

    #[test]
    fn ban_rejects_bad_hours_and_extra_keys() {
        assert_eq!(
            parse("ban gdrive --hours 0").unwrap_err().kind(),
            ErrorKind::ValueValidation
        );
        assert!(parse("ban gdrive --hours soon").is_err());
        assert!(parse("ban gdrive --hours").is_err());
        assert_eq!(
            parse("ban gdrive backup").unwrap_err().kind(),
            ErrorKind::UnknownArgument
        );
        assert_eq!(
            parse("ban").unwrap_err().kind(),
            ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn report_parses_code_remote_and_credentials() {
        assert_eq!(
            parse("report 7 gdrive:media /opt/sa/sa1.json").unwrap().command,
            Command::Report {
                code: 7,
                remote: "gdrive:media".into(),
                credentials: vec!["/opt/sa/sa1.json".into()]
            }
        );
        assert_eq!(
            parse("report 0 gdrive:media").unwrap().command,
            Command::Report {
                code: 0,
                remote: "gdrive:media".into(),
                credentials: vec![]
            }
        );
        assert!(parse("report seven gdrive:media").is_err());
        assert!(parse("report 7").is_err());
    }

    #[test]
    fn simple_commands_take_no_arguments() {
        assert_eq!(parse("purge").unwrap().command, Command::Purge);
        assert_eq!(parse("status").unwrap().command, Command::Status);
        assert!(parse("status gdrive").is_err());
    }

    #[test]
    fn unban_and_serve() {
        assert_eq!(
            parse("unban gdrive").unwrap().command,
            Command::Unban {
                key: "gdrive".into()
            }
        );
        assert!(parse("unban").is_err());
        assert_eq!(
            parse("serve").unwrap_err().kind(),
            ErrorKind::MissingRequiredArgument
        );
        assert_eq!(
            parse("serve gdrive:media").unwrap().command,
            Command::Serve {
                remotes: vec!["gdrive:media".into()]
            }
        );
    }

    #[test]
    fn missing_and_unknown_commands() {
        assert!(parse("").is_err());
        assert_eq!(
            parse("rotate").unwrap_err().kind(),
            ErrorKind::InvalidSubcommand
        );
    }

    #[test]
    fn command_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
