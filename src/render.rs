use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::db::TIME_FORMAT;

/// Output shapes a query result can be rendered into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// Bash history file shape, a `#<epoch>` line before each command.
    Restore,
    /// Full table: row | timestamp | user | host | command.
    All,
    /// Row number and command only.
    #[value(name = "command_line")]
    CommandLine,
    /// Timestamp-prefixed command.
    Timestamp,
    /// Log line: timestamp user@host command.
    Log,
    /// JSON array of row objects.
    Json,
    /// Re-importable shape: user host timestamp command.
    Export,
}

impl Default for Format {
    fn default() -> Self {
        Format::CommandLine
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct JsonRow<'a> {
    row: i64,
    datetime: String,
    user: &'a str,
    host: &'a str,
    command: &'a str,
}

/// Accumulates query rows into one formatted byte buffer. Separators go
/// between entries only, and the JSON container stays syntactically valid
/// even when no row is ever added.
pub struct Renderer {
    out: String,
    written: bool,
    digits: usize,
    format: Format,
}

impl Renderer {
    pub fn new(format: Format) -> Self {
        let mut out = String::new();
        if format == Format::Json {
            out.push_str("[\n");
        }
        Self {
            out,
            written: false,
            digits: 0,
            format,
        }
    }

    pub fn add_row(&mut self, row: i64, user: &str, host: &str, command: &str, when: DateTime<Utc>) {
        if self.written {
            self.out.push_str(if self.format == Format::Json {
                ",\n"
            } else {
                "\n"
            });
        } else {
            self.written = true;
        }

        let stamp = when.format(TIME_FORMAT);
        let entry = match self.format {
            Format::Restore => format!("#{}\n{command}", when.timestamp()),
            Format::All => {
                format!("{row:05} | {stamp} | {user:>10} | {host:>10} | {command}")
            }
            Format::CommandLine => format!("{row} {command}"),
            Format::Timestamp => format!("{stamp}: {command}"),
            Format::Log => format!("{stamp} {user}@{host} {command}"),
            Format::Json => serde_json::to_string(&JsonRow {
                row,
                datetime: stamp.to_string(),
                user,
                host,
                command,
            })
            .unwrap_or_default(),
            Format::Export => format!("{user} {host} {stamp} {command}"),
        };
        self.out.push_str(&entry);
    }

    /// Adds a frequency row, as produced by the top-k query. The count
    /// column width is pinned to the first row's digit count, which is the
    /// widest since rows arrive in descending count order.
    pub fn add_count_row(&mut self, count: i64, command: &str) {
        if self.written {
            self.out.push('\n');
        } else {
            self.written = true;
            self.digits = digits(count);
        }
        let width = self.digits;
        self.out.push_str(&format!("{count:>width$} | {command}"));
    }

    /// Consumes the renderer, closing the JSON container when that format
    /// was selected.
    pub fn formatted(mut self) -> Vec<u8> {
        if self.format == Format::Json {
            self.out.push_str("\n]");
        }
        self.out.into_bytes()
    }
}

fn digits(n: i64) -> usize {
    if n < 10 {
        1
    } else {
        digits(n / 10) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn when() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 3, 1, 9, 0, 0).unwrap()
    }

    fn rendered(r: Renderer) -> String {
        String::from_utf8(r.formatted()).unwrap()
    }

    #[test]
    fn test_command_line_rows_separated_without_trailing_newline() {
        let mut r = Renderer::new(Format::CommandLine);
        r.add_row(1, "alice", "devbox", "ls", when());
        r.add_row(2, "alice", "devbox", "pwd", when());
        assert_eq!(rendered(r), "1 ls\n2 pwd");
    }

    #[test]
    fn test_all_format_pads_row_user_and_host() {
        let mut r = Renderer::new(Format::All);
        r.add_row(7, "alice", "devbox", "cargo build", when());
        assert_eq!(
            rendered(r),
            "00007 | 2020-03-01T09:00:00+0000 |      alice |     devbox | cargo build"
        );
    }

    #[test]
    fn test_restore_format_emits_epoch_header_lines() {
        let mut r = Renderer::new(Format::Restore);
        r.add_row(1, "alice", "devbox", "ls", when());
        r.add_row(2, "alice", "devbox", "pwd", when());
        assert_eq!(rendered(r), "#1583053200\nls\n#1583053200\npwd");
    }

    #[test]
    fn test_timestamp_format() {
        let mut r = Renderer::new(Format::Timestamp);
        r.add_row(1, "alice", "devbox", "ls", when());
        assert_eq!(rendered(r), "2020-03-01T09:00:00+0000: ls");
    }

    #[test]
    fn test_log_format() {
        let mut r = Renderer::new(Format::Log);
        r.add_row(1, "alice", "devbox", "ls", when());
        assert_eq!(rendered(r), "2020-03-01T09:00:00+0000 alice@devbox ls");
    }

    #[test]
    fn test_export_format_matches_import_shape() {
        let mut r = Renderer::new(Format::Export);
        r.add_row(1, "alice", "devbox", "git status", when());
        assert_eq!(rendered(r), "alice devbox 2020-03-01T09:00:00+0000 git status");
    }

    #[test]
    fn test_json_format_produces_valid_array() {
        let mut r = Renderer::new(Format::Json);
        r.add_row(3, "alice", "devbox", "ls -la", when());
        r.add_row(4, "bob", "buildhost", "make", when());
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&rendered(r)).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["Row"], 3);
        assert_eq!(parsed[0]["Datetime"], "2020-03-01T09:00:00+0000");
        assert_eq!(parsed[1]["User"], "bob");
        assert_eq!(parsed[1]["Host"], "buildhost");
        assert_eq!(parsed[1]["Command"], "make");
    }

    #[test]
    fn test_json_container_stays_valid_with_no_rows() {
        let r = Renderer::new(Format::Json);
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&rendered(r)).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_count_rows_align_to_first_count_width() {
        let mut r = Renderer::new(Format::CommandLine);
        r.add_count_row(123, "git status");
        r.add_count_row(45, "ls");
        r.add_count_row(6, "make");
        assert_eq!(rendered(r), "123 | git status\n 45 | ls\n  6 | make");
    }
}
