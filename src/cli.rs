use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::render::Format;

#[derive(Parser)]
#[command(
    name = "histdb",
    version = env!("HISTDB_BUILD_VERSION"),
    long_version = env!("HISTDB_BUILD_LONG_VERSION"),
    about = "Store, search and sync your shell command history"
)]
pub struct Cli {
    /// Path to the history database
    #[arg(long, global = true, env = "HISTDB_DB")]
    pub db: Option<PathBuf>,

    /// User to record and query as, instead of $USER
    #[arg(short = 'u', long, global = true)]
    pub user: Option<String>,

    /// Hostname to record and query as, instead of the detected one
    #[arg(short = 'H', long, global = true)]
    pub host: Option<String>,

    /// Remote server to send this operation to
    #[arg(short = 'r', long, global = true, env = "HISTDB_REMOTE")]
    pub remote: Option<String>,

    /// Port for client and server modes
    #[arg(short = 'p', long, global = true, env = "HISTDB_PORT")]
    pub port: Option<u16>,

    /// Passphrase protecting client/server traffic
    #[arg(short = 'k', long, global = true, env = "HISTDB_KEY")]
    pub key: Option<String>,

    /// Use the local database even when a remote is configured
    #[arg(long, global = true, default_value_t = false)]
    pub local: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Search the history (the default operation)
    Search {
        /// Search every user and host, not just the current pair
        #[arg(short = 'g', long, default_value_t = false)]
        global: bool,

        /// Collapse repeated commands to their earliest occurrence
        #[arg(long, default_value_t = false)]
        unique: bool,

        /// Treat the pattern as a regular expression
        #[arg(short = 'e', long, default_value_t = false)]
        regex: bool,

        /// Output format
        #[arg(short = 'f', long, value_enum, default_value = "command_line")]
        format: Format,

        /// Also show N rows before each match
        #[arg(short = 'B', long, default_value_t = 0)]
        before: u32,

        /// Also show N rows after each match
        #[arg(short = 'A', long, default_value_t = 0)]
        after: u32,

        /// Also show N rows before and after each match
        #[arg(short = 'C', long, default_value_t = 0)]
        context: u32,

        /// Pattern words, matched as a substring of the command
        #[arg(trailing_var_arg = true)]
        pattern: Vec<String>,
    },

    /// Show the most frequent commands
    Topk {
        /// How many entries to return
        #[arg(short = 'n', long = "count", default_value = "20")]
        count: i64,

        /// Count across every user and host
        #[arg(short = 'g', long, default_value_t = false)]
        global: bool,

        /// Pattern words, matched as a substring of the command
        #[arg(trailing_var_arg = true)]
        pattern: Vec<String>,
    },

    /// Show the most recent commands
    Lastk {
        /// How many entries to return
        #[arg(short = 'n', long = "count", default_value = "20")]
        count: i64,

        /// Keep each command once, at its most recent run
        #[arg(long, default_value_t = false)]
        unique: bool,

        /// Output format
        #[arg(short = 'f', long, value_enum, default_value = "command_line")]
        format: Format,

        /// Look across every user and host
        #[arg(short = 'g', long, default_value_t = false)]
        global: bool,

        /// Pattern words, matched as a substring of the command
        #[arg(trailing_var_arg = true)]
        pattern: Vec<String>,
    },

    /// List the user@host pairs present in the history
    Users {
        /// Pattern words, matched as a substring of the command
        #[arg(trailing_var_arg = true)]
        pattern: Vec<String>,
    },

    /// Print one stored command by row id
    Row {
        /// Row id to print
        id: i64,
    },

    /// Delete rows by id
    Delete {
        /// Row ids to delete
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Show a summary report of the database
    Demo {
        /// Report across every user and host
        #[arg(short = 'g', long, default_value_t = false)]
        global: bool,
    },

    /// Read history lines from stdin into the store
    Import,

    /// Print this user's history in a .bash_history restorable form
    Restore,

    /// Serve the encrypted sync endpoint
    Server,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_invocation_with_globals() {
        let cli = Cli::try_parse_from(["histdb", "-u", "alice", "-H", "devbox"])
            .expect("bare invocation should parse");
        assert!(cli.command.is_none());
        assert_eq!(cli.user.as_deref(), Some("alice"));
        assert_eq!(cli.host.as_deref(), Some("devbox"));
    }

    #[test]
    fn parses_search_with_context_flags() {
        let cli = Cli::try_parse_from([
            "histdb", "search", "-e", "--unique", "-B", "2", "-A", "3", "git", "push",
        ])
        .expect("search should parse");

        match cli.command {
            Some(Commands::Search {
                regex,
                unique,
                before,
                after,
                pattern,
                ..
            }) => {
                assert!(regex);
                assert!(unique);
                assert_eq!(before, 2);
                assert_eq!(after, 3);
                assert_eq!(pattern, vec!["git", "push"]);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn parses_search_format_names() {
        let cli = Cli::try_parse_from(["histdb", "search", "-f", "command_line", "ls"])
            .expect("format name should parse");
        match cli.command {
            Some(Commands::Search { format, .. }) => assert_eq!(format, Format::CommandLine),
            _ => panic!("expected search command"),
        }

        let cli = Cli::try_parse_from(["histdb", "search", "-f", "json", "ls"])
            .expect("format name should parse");
        match cli.command {
            Some(Commands::Search { format, .. }) => assert_eq!(format, Format::Json),
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn rejects_unknown_format_name() {
        assert!(Cli::try_parse_from(["histdb", "search", "-f", "yaml", "ls"]).is_err());
    }

    #[test]
    fn rejects_negative_context_counts() {
        assert!(Cli::try_parse_from(["histdb", "search", "-B=-1", "ls"]).is_err());
        assert!(Cli::try_parse_from(["histdb", "search", "-A=-1", "ls"]).is_err());
        assert!(Cli::try_parse_from(["histdb", "search", "-C=-1", "ls"]).is_err());
    }

    #[test]
    fn parses_topk_count() {
        let cli = Cli::try_parse_from(["histdb", "topk", "-n", "5"]).expect("topk should parse");
        match cli.command {
            Some(Commands::Topk { count, pattern, .. }) => {
                assert_eq!(count, 5);
                assert!(pattern.is_empty());
            }
            _ => panic!("expected topk command"),
        }
    }

    #[test]
    fn parses_lastk_defaults() {
        let cli = Cli::try_parse_from(["histdb", "lastk"]).expect("lastk should parse");
        match cli.command {
            Some(Commands::Lastk {
                count,
                unique,
                format,
                ..
            }) => {
                assert_eq!(count, 20);
                assert!(!unique);
                assert_eq!(format, Format::CommandLine);
            }
            _ => panic!("expected lastk command"),
        }
    }

    #[test]
    fn parses_delete_with_multiple_ids() {
        let cli =
            Cli::try_parse_from(["histdb", "delete", "4", "9", "2"]).expect("delete should parse");
        match cli.command {
            Some(Commands::Delete { ids }) => assert_eq!(ids, vec![4, 9, 2]),
            _ => panic!("expected delete command"),
        }
    }

    #[test]
    fn rejects_delete_without_ids() {
        assert!(Cli::try_parse_from(["histdb", "delete"]).is_err());
    }

    #[test]
    fn parses_server_with_port_before_subcommand() {
        let cli =
            Cli::try_parse_from(["histdb", "-p", "12345", "server"]).expect("server should parse");
        assert_eq!(cli.port, Some(12345));
        assert!(matches!(cli.command, Some(Commands::Server)));
    }
}
