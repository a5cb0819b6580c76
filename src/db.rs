use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// Schema version written to the admin table. Stores recorded with an older
/// version are migrated in place on open; stores recorded with a newer one
/// are refused.
pub const SCHEMA_VERSION: i32 = 2;

/// Timestamp layout used on text surfaces: ingestion input, the
/// export/log/all output formats and the wire. ISO-8601 with a numeric
/// offset and no colon, always 24 characters.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store schema version {found} is newer than this build supports ({}); refusing to open", SCHEMA_VERSION)]
    IncompatibleVersion { found: String },
    #[error("unparsable timestamp in line {line:?}")]
    BadTimestamp {
        line: String,
        #[source]
        source: chrono::format::ParseError,
    },
    #[error("no history row with id {0}")]
    RowNotFound(i64),
    #[error("invalid regex pattern: {0}")]
    BadRegex(#[from] regex::Error),
}

/// Counters returned by a completed ingestion batch. `total` counts the
/// lines of the input minus a trailing empty line, `failed` counts both
/// unrecognized lines and duplicates, and `succeeded = total - failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Processed {} entries, successful {}, failed {}.",
            self.total, self.succeeded, self.failed
        )
    }
}

#[derive(Debug)]
pub struct Store {
    pub(crate) conn: Connection,
    path: Option<PathBuf>,
}

fn init_store(conn: &Connection, busy_timeout_ms: u64) -> Result<(), StoreError> {
    conn.execute_batch(
        "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA temp_store = MEMORY;
",
    )?;
    conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;

    conn.execute_batch("BEGIN IMMEDIATE;")?;

    conn.execute_batch(
        "
        -- One row per recorded command; rowid addresses rows for the
        -- row/delete/context operations.
        CREATE TABLE IF NOT EXISTS history (
            user     TEXT,
            host     TEXT,
            command  TEXT,
            datetime DATETIME,
            PRIMARY KEY (user, command, datetime)
        );

        CREATE TABLE IF NOT EXISTS admin (
            key   TEXT PRIMARY KEY,
            value TEXT
        );

        -- One row per inbound network connection.
        CREATE TABLE IF NOT EXISTS connlog (
            datetime TEXT PRIMARY KEY,
            remote   TEXT
        );

        -- Reverse-DNS cache, populated asynchronously.
        CREATE TABLE IF NOT EXISTS rlookup (
            ip      TEXT PRIMARY KEY,
            reverse TEXT
        );

        CREATE VIEW IF NOT EXISTS connections AS
            SELECT datetime, remote, reverse
              FROM connlog AS c
              LEFT JOIN rlookup AS r
                ON c.remote = r.ip;
    ",
    )?;

    let recorded: Option<String> = conn
        .query_row("SELECT value FROM admin WHERE key = 'version'", [], |row| {
            row.get(0)
        })
        .optional()?;
    let current_version: i32 = match recorded.as_deref() {
        None => 0,
        Some(v) => v.parse().unwrap_or(i32::MAX),
    };

    if current_version > SCHEMA_VERSION {
        conn.execute_batch("ROLLBACK;")?;
        return Err(StoreError::IncompatibleVersion {
            found: recorded.unwrap_or_else(|| "unknown".into()),
        });
    }

    if current_version == 0 {
        // Fresh store, already created with the current layout above.
        conn.execute(
            "INSERT INTO admin VALUES ('version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
    } else if current_version < 2 {
        // v1 kept connlog keyed by a DATETIME column; rebuild it with a TEXT
        // key. ALTER TABLE re-parses every view in the schema, so the
        // connections view cannot exist while connlog is dropped.
        conn.execute_batch(
            "DROP VIEW IF EXISTS connections;
             CREATE TABLE connlog_new (
                 datetime TEXT PRIMARY KEY,
                 remote   TEXT
             );
             INSERT INTO connlog_new SELECT datetime, remote FROM connlog;
             DROP TABLE connlog;
             ALTER TABLE connlog_new RENAME TO connlog;
             CREATE VIEW connections AS
                 SELECT datetime, remote, reverse
                   FROM connlog AS c
                   LEFT JOIN rlookup AS r
                     ON c.remote = r.ip;",
        )?;
        conn.execute(
            "UPDATE admin SET value = ?1 WHERE key = 'version'",
            params![SCHEMA_VERSION.to_string()],
        )?;
        tracing::info!("history database upgraded to schema version {SCHEMA_VERSION}");
    }

    conn.execute_batch("COMMIT;")?;
    Ok(())
}

impl Store {
    /// Opens (creating if absent) the history database at `path` and brings
    /// its schema up to [`SCHEMA_VERSION`]. Fails closed when the store was
    /// written by a newer build.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let fresh = !path.exists();
        let conn = Connection::open(path)?;
        init_store(&conn, 10_000)?;
        if fresh {
            tracing::info!("created new history database at {}", path.display());
        } else {
            tracing::debug!("opened history database at {}", path.display());
        }
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_store(&conn, 10_000)?;
        Ok(Self { conn, path: None })
    }

    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, e)| StoreError::Sql(e))
    }

    /// Schema version currently recorded in the admin table.
    pub fn version(&self) -> Result<String, StoreError> {
        let v = self
            .conn
            .query_row("SELECT value FROM admin WHERE key = 'version'", [], |row| {
                row.get(0)
            })?;
        Ok(v)
    }

    // ── Ingestion ──────────────────────────────────────────────────

    /// Inserts one record directly, absorbing a duplicate natural key as a
    /// no-op.
    pub fn add_record(
        &self,
        user: &str,
        host: &str,
        command: &str,
        when: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let res = self.conn.execute(
            "INSERT INTO history(user, host, command, datetime) VALUES (?1, ?2, ?3, ?4)",
            params![user, host, command, when],
        );
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate(&e) => {
                tracing::debug!("duplicate entry ignored: {user}@{host} {command:?}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parses a batch of history lines and applies them in one transaction.
    ///
    /// Two line shapes are recognized: shell history output (`INDEX
    /// TIMESTAMP COMMAND`, user and host taken from the arguments) and this
    /// tool's own export format (`USER HOST TIMESTAMP COMMAND`). A line
    /// matching neither shape counts as failed and the batch continues; a
    /// line whose matched timestamp does not parse aborts and rolls back
    /// the whole batch. Duplicate records count as failed without aborting.
    pub fn ingest(&self, text: &str, user: &str, host: &str) -> Result<IngestStats, StoreError> {
        let history_line = Regex::new(r"^ *[0-9]+\*? *([0-9T:+-]{24}) *(.*)").unwrap();
        let export_line = Regex::new(
            r"^([a-zA-Z_][a-zA-Z0-9_-]*) ([a-zA-Z0-9][a-zA-Z0-9_.]*) *([0-9T:+-]{24}) *(.*)",
        )
        .unwrap();

        let tx = self.conn.unchecked_transaction()?;
        let mut insert = tx
            .prepare("INSERT INTO history(user, host, command, datetime) VALUES (?1, ?2, ?3, ?4)")?;

        let mut total: u64 = 0;
        let mut failed: u64 = 0;
        let mut export_seen = false;

        for line in text.lines() {
            total += 1;

            let (line_user, line_host, stamp, command) =
                if let Some(caps) = history_line.captures(line) {
                    (
                        user,
                        host,
                        caps.get(1).map_or("", |m| m.as_str()),
                        caps.get(2).map_or("", |m| m.as_str()),
                    )
                } else if let Some(caps) = export_line.captures(line) {
                    if !export_seen {
                        tracing::info!("export format detected");
                        export_seen = true;
                    }
                    (
                        caps.get(1).map_or("", |m| m.as_str()),
                        caps.get(2).map_or("", |m| m.as_str()),
                        caps.get(3).map_or("", |m| m.as_str()),
                        caps.get(4).map_or("", |m| m.as_str()),
                    )
                } else {
                    tracing::debug!("unrecognized history line skipped: {line:?}");
                    failed += 1;
                    continue;
                };

            let when = DateTime::parse_from_str(stamp, TIME_FORMAT)
                .map_err(|source| StoreError::BadTimestamp {
                    line: line.to_string(),
                    source,
                })?
                .with_timezone(&Utc);

            match insert.execute(params![line_user, line_host, command, when]) {
                Ok(_) => {}
                Err(e) if is_duplicate(&e) => {
                    tracing::debug!("duplicate entry ignored: {line_user}@{line_host} {command:?}");
                    failed += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        drop(insert);
        tx.commit()?;

        Ok(IngestStats {
            total,
            succeeded: total - failed,
            failed,
        })
    }

    // ── Connection log ─────────────────────────────────────────────

    /// Records an inbound connection and, when the address has not been
    /// seen before, resolves its reverse DNS name on a detached thread.
    /// Lookup failures are logged and swallowed.
    pub fn log_connection(&self, remote: SocketAddr) -> Result<(), StoreError> {
        let ip = remote.ip();
        self.conn.execute(
            "INSERT INTO connlog VALUES (?1, ?2)",
            params![Utc::now(), ip.to_string()],
        )?;
        if let Some(path) = self.path.clone() {
            std::thread::spawn(move || {
                if let Err(e) = cache_reverse_name(&path, ip) {
                    tracing::debug!("reverse lookup for {ip} failed: {e}");
                }
            });
        }
        Ok(())
    }
}

fn cache_reverse_name(path: &Path, ip: IpAddr) -> Result<(), StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_millis(10_000))?;
    let cached: Option<String> = conn
        .query_row(
            "SELECT ip FROM rlookup WHERE ip = ?1",
            params![ip.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    if cached.is_none() {
        let name = dns_lookup::lookup_addr(&ip)?;
        conn.execute(
            "INSERT OR REPLACE INTO rlookup(ip, reverse) VALUES (?1, ?2)",
            params![ip.to_string(), name],
        )?;
        tracing::debug!("cached reverse name for {ip}");
    }
    Ok(())
}

fn is_duplicate(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}
