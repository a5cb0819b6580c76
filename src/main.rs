mod cli;
mod client;
mod config;
mod db;
mod net;
mod query;
mod render;
mod server;

use std::io::{IsTerminal, Read, Write};

use clap::Parser;

use cli::{Cli, Commands};
use config::{Config, Settings};
use net::Request;
use query::{QueryKind, QueryParams};
use render::Format;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut cli = Cli::parse();
    let config = Config::load()?;
    let settings = Settings::resolve(&cli, &config)?;

    // A bare invocation imports piped history; on a terminal it reports
    // on the database instead.
    let command = cli.command.take().unwrap_or_else(|| {
        if std::io::stdin().is_terminal() {
            Commands::Demo { global: false }
        } else {
            Commands::Import
        }
    });

    if let Commands::Server = command {
        return server::serve(&settings);
    }

    let use_remote = settings.remote.is_some() && !cli.local;

    if let Commands::Import = command {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        let summary = if use_remote {
            client::exchange(
                &settings,
                &Request::Ingest {
                    lines: text,
                    user: settings.user.clone(),
                    host: settings.host.clone(),
                },
            )?
        } else {
            let store = db::Store::open(&settings.db)?;
            let stats = store.ingest(&text, &settings.user, &settings.host)?;
            store.close()?;
            stats.to_string()
        };
        println!("{summary}");
        return Ok(());
    }

    let params = query_params(&command, &cli, &settings);
    let output = if use_remote {
        client::exchange(&settings, &Request::Query { params })?.into_bytes()
    } else {
        let store = db::Store::open(&settings.db)?;
        let output = store.run_query(&params)?;
        store.close()?;
        output
    };

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&output)?;
    stdout.write_all(b"\n")?;
    Ok(())
}

/// Builds the command term for a query. Plain searches behave like grep:
/// the words are joined and matched as a substring, and no words at all
/// match everything. In regex mode the joined words are handed to the
/// engine untouched.
fn pattern_term(words: &[String], regex: bool) -> String {
    if regex {
        words.join(" ")
    } else if words.is_empty() {
        "%".into()
    } else {
        format!("%{}%", words.join(" "))
    }
}

/// Maps a parsed subcommand onto query parameters. Queries are scoped to
/// the current user and host unless -g widens them, except `users` which
/// is global unless -u or -H narrows it.
fn query_params(command: &Commands, cli: &Cli, settings: &Settings) -> QueryParams {
    let mut p = QueryParams {
        user: settings.user.clone(),
        host: settings.host.clone(),
        ..QueryParams::default()
    };
    match command {
        Commands::Search {
            global,
            unique,
            regex,
            format,
            before,
            after,
            context,
            pattern,
        } => {
            p.kind = QueryKind::Search;
            p.pattern = pattern_term(pattern, *regex);
            p.regex = *regex;
            p.unique = *unique;
            p.format = *format;
            if *global {
                p.user = "%".into();
                p.host = "%".into();
            }
            p.before = if *before > 0 { *before } else { *context };
            p.after = if *after > 0 { *after } else { *context };
            if p.before > 0 || p.after > 0 {
                p.kind = QueryKind::Content;
            }
        }
        Commands::Topk {
            count,
            global,
            pattern,
        } => {
            p.kind = QueryKind::Topk;
            p.kappa = *count;
            p.pattern = pattern_term(pattern, false);
            if *global {
                p.user = "%".into();
                p.host = "%".into();
            }
        }
        Commands::Lastk {
            count,
            unique,
            format,
            global,
            pattern,
        } => {
            p.kind = QueryKind::Lastk;
            p.kappa = *count;
            p.unique = *unique;
            p.format = *format;
            p.pattern = pattern_term(pattern, false);
            if *global {
                p.user = "%".into();
                p.host = "%".into();
            }
        }
        Commands::Users { pattern } => {
            p.kind = QueryKind::Users;
            p.pattern = pattern_term(pattern, false);
            p.user = cli.user.clone().unwrap_or_else(|| "%".into());
            p.host = cli.host.clone().unwrap_or_else(|| "%".into());
        }
        Commands::Row { id } => {
            p.kind = QueryKind::Row;
            p.kappa = *id;
        }
        Commands::Delete { ids } => {
            p.kind = QueryKind::Delete;
            p.rows = ids.clone();
        }
        Commands::Demo { global } => {
            p.kind = QueryKind::Demo;
            if *global {
                p.user = "%".into();
                p.host = "%".into();
            }
        }
        Commands::Restore => {
            p.kind = QueryKind::Search;
            p.format = Format::Restore;
        }
        Commands::Import | Commands::Server => unreachable!(),
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            db: "/tmp/test.db".into(),
            user: "alice".into(),
            host: "devbox".into(),
            remote: None,
            port: config::DEFAULT_PORT,
            key: None,
        }
    }

    fn params_for(argv: &[&str]) -> QueryParams {
        let cli = Cli::try_parse_from(argv).expect("argv should parse");
        let command = cli.command.as_ref().expect("argv should carry a subcommand");
        query_params(command, &cli, &settings())
    }

    #[test]
    fn pattern_term_joins_words_as_substring() {
        assert_eq!(pattern_term(&[], false), "%");
        assert_eq!(
            pattern_term(&["git".into(), "push".into()], false),
            "%git push%"
        );
    }

    #[test]
    fn pattern_term_leaves_regex_untouched() {
        assert_eq!(pattern_term(&["^git s.*".into()], true), "^git s.*");
        assert_eq!(pattern_term(&[], true), "");
    }

    #[test]
    fn search_params_scope_to_current_pair() {
        let p = params_for(&["histdb", "search", "make"]);
        assert_eq!(p.kind, QueryKind::Search);
        assert_eq!(p.user, "alice");
        assert_eq!(p.host, "devbox");
        assert_eq!(p.pattern, "%make%");
    }

    #[test]
    fn global_search_widens_to_wildcards() {
        let p = params_for(&["histdb", "search", "-g", "make"]);
        assert_eq!(p.user, "%");
        assert_eq!(p.host, "%");
    }

    #[test]
    fn context_flags_turn_search_into_content_query() {
        let p = params_for(&["histdb", "search", "-C", "2", "make"]);
        assert_eq!(p.kind, QueryKind::Content);
        assert_eq!(p.before, 2);
        assert_eq!(p.after, 2);

        let p = params_for(&["histdb", "search", "-B", "1", "-C", "3", "make"]);
        assert_eq!(p.before, 1);
        assert_eq!(p.after, 3);
    }

    #[test]
    fn users_params_are_global_unless_narrowed() {
        let p = params_for(&["histdb", "users"]);
        assert_eq!(p.kind, QueryKind::Users);
        assert_eq!(p.user, "%");
        assert_eq!(p.host, "%");

        let p = params_for(&["histdb", "-u", "bob", "users"]);
        assert_eq!(p.user, "bob");
        assert_eq!(p.host, "%");
    }

    #[test]
    fn restore_is_a_scoped_search_in_restore_format() {
        let p = params_for(&["histdb", "restore"]);
        assert_eq!(p.kind, QueryKind::Search);
        assert_eq!(p.format, Format::Restore);
        assert_eq!(p.user, "alice");
        assert_eq!(p.pattern, "%");
    }

    #[test]
    fn topk_and_lastk_carry_kappa() {
        let p = params_for(&["histdb", "topk", "-n", "7"]);
        assert_eq!(p.kind, QueryKind::Topk);
        assert_eq!(p.kappa, 7);

        let p = params_for(&["histdb", "lastk", "--unique"]);
        assert_eq!(p.kind, QueryKind::Lastk);
        assert_eq!(p.kappa, 20);
        assert!(p.unique);
    }

    #[test]
    fn row_params_carry_the_requested_id() {
        let p = params_for(&["histdb", "row", "42"]);
        assert_eq!(p.kind, QueryKind::Row);
        assert_eq!(p.kappa, 42);
    }

    #[test]
    fn delete_params_collect_all_ids() {
        let p = params_for(&["histdb", "delete", "3", "1", "2"]);
        assert_eq!(p.kind, QueryKind::Delete);
        assert_eq!(p.rows, vec![3, 1, 2]);
    }
}
