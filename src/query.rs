use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};

use crate::db::{Store, StoreError};
use crate::render::{Format, Renderer};

/// The retrieval operations the store answers. Arrives over the wire as a
/// tag string; an unrecognized tag is rejected at decode time rather than
/// falling through to a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Search,
    Topk,
    Lastk,
    Users,
    Row,
    Delete,
    Content,
    Demo,
}

/// One fully resolved query. `user`, `host` and `pattern` are SQL LIKE
/// patterns unless `regex` is set, in which case `pattern` is a regular
/// expression applied to command text in process, after the user/host
/// filter has narrowed the scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryParams {
    pub kind: QueryKind,
    pub user: String,
    pub host: String,
    pub pattern: String,
    pub regex: bool,
    pub unique: bool,
    pub kappa: i64,
    pub rows: Vec<i64>,
    pub before: u32,
    pub after: u32,
    pub format: Format,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            kind: QueryKind::Search,
            user: "%".into(),
            host: "%".into(),
            pattern: "%".into(),
            regex: false,
            unique: false,
            kappa: 20,
            rows: Vec::new(),
            before: 0,
            after: 0,
            format: Format::CommandLine,
        }
    }
}

// In regex mode the storage engine only runs the coarse user/host filter;
// the compiled pattern is applied to each candidate row's command here.
fn command_filter(p: &QueryParams) -> Result<Option<Regex>, StoreError> {
    if p.regex {
        Ok(Some(Regex::new(&p.pattern)?))
    } else {
        Ok(None)
    }
}

impl Store {
    pub fn run_query(&self, p: &QueryParams) -> Result<Vec<u8>, StoreError> {
        match p.kind {
            QueryKind::Search => self.search(p),
            QueryKind::Topk => self.top_k(p),
            QueryKind::Lastk => self.last_k(p),
            QueryKind::Users => self.users(p),
            QueryKind::Row => self.return_row(p),
            QueryKind::Delete => self.delete_rows(p),
            QueryKind::Content => self.content_query(p),
            QueryKind::Demo => self.demo(p),
        }
    }

    /// Plain history search. With `unique` set, rows collapse to one per
    /// distinct command text and the surviving row is the earliest
    /// occurrence of that command, ordered ascending by timestamp.
    fn search(&self, p: &QueryParams) -> Result<Vec<u8>, StoreError> {
        let regex = command_filter(p)?;
        let sql = match (p.unique, regex.is_some()) {
            (false, false) => {
                r"SELECT rowid, user, host, command, datetime FROM history
                   WHERE user LIKE ?1 AND host LIKE ?2 AND command LIKE ?3 ESCAPE '\'"
            }
            (false, true) => {
                r"SELECT rowid, user, host, command, datetime FROM history
                   WHERE user LIKE ?1 AND host LIKE ?2 ESCAPE '\'"
            }
            (true, false) => {
                r"SELECT rowid, user, host, command, min(datetime) AS datetime FROM history
                   WHERE user LIKE ?1 AND host LIKE ?2 AND command LIKE ?3 ESCAPE '\'
                   GROUP BY command ORDER BY datetime ASC"
            }
            (true, true) => {
                r"SELECT rowid, user, host, command, min(datetime) AS datetime FROM history
                   WHERE user LIKE ?1 AND host LIKE ?2 ESCAPE '\'
                   GROUP BY command ORDER BY datetime ASC"
            }
        };
        let mut stmt = self.conn.prepare(sql)?;
        let mut binds: Vec<&dyn ToSql> = vec![&p.user, &p.host];
        if regex.is_none() {
            binds.push(&p.pattern);
        }
        let rows = stmt.query_map(&binds[..], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, DateTime<Utc>>(4)?,
            ))
        })?;

        let mut renderer = Renderer::new(p.format);
        for r in rows {
            let (id, user, host, command, when) = r?;
            if let Some(re) = &regex {
                if !re.is_match(&command) {
                    continue;
                }
            }
            renderer.add_row(id, &user, &host, &command, when);
        }
        Ok(renderer.formatted())
    }

    /// The `kappa` most frequent command texts, most frequent first.
    /// Equal counts fall back to the store's natural row order.
    fn top_k(&self, p: &QueryParams) -> Result<Vec<u8>, StoreError> {
        let mut stmt = self.conn.prepare(
            r"SELECT command, count(*) AS count FROM history
               WHERE user LIKE ?1 AND host LIKE ?2 AND command LIKE ?3 ESCAPE '\'
               GROUP BY command ORDER BY count DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map(params![p.user, p.host, p.pattern, p.kappa], |row| {
            Ok((row.get::<_, i64>(1)?, row.get::<_, String>(0)?))
        })?;

        // Count rows have one fixed shape, the requested format only
        // applies to full history rows.
        let mut renderer = Renderer::new(Format::CommandLine);
        for r in rows {
            let (count, command) = r?;
            renderer.add_count_row(count, &command);
        }
        Ok(renderer.formatted())
    }

    /// The `kappa` most recently timestamped rows, re-ordered ascending
    /// for display. With `unique` set, each command text appears once and
    /// keeps its most recent occurrence.
    fn last_k(&self, p: &QueryParams) -> Result<Vec<u8>, StoreError> {
        let sql = if p.unique {
            r"SELECT * FROM
                (SELECT rowid, user, host, command, max(datetime) AS datetime FROM history
                  WHERE user LIKE ?1 AND host LIKE ?2 AND command LIKE ?3 ESCAPE '\'
                  GROUP BY command
                  ORDER BY datetime DESC LIMIT ?4)
              ORDER BY datetime ASC"
        } else {
            r"SELECT * FROM
                (SELECT rowid, user, host, command, datetime FROM history
                  WHERE user LIKE ?1 AND host LIKE ?2 AND command LIKE ?3 ESCAPE '\'
                  ORDER BY datetime DESC LIMIT ?4)
              ORDER BY datetime ASC"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![p.user, p.host, p.pattern, p.kappa], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, DateTime<Utc>>(4)?,
            ))
        })?;

        let mut renderer = Renderer::new(p.format);
        for r in rows {
            let (id, user, host, command, when) = r?;
            renderer.add_row(id, &user, &host, &command, when);
        }
        Ok(renderer.formatted())
    }

    /// Distinct `user@host` pairs among matching rows.
    fn users(&self, p: &QueryParams) -> Result<Vec<u8>, StoreError> {
        let mut out = String::from("Unique user-hosts pairs:");
        let mut stmt = self.conn.prepare(
            r"SELECT DISTINCT user, host FROM history
               WHERE user LIKE ?1 AND host LIKE ?2 AND command LIKE ?3 ESCAPE '\'
               ORDER BY user, host",
        )?;
        let rows = stmt.query_map(params![p.user, p.host, p.pattern], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for r in rows {
            let (user, host) = r?;
            out.push_str(&format!("\n{user}@{host}"));
        }
        Ok(out.into_bytes())
    }

    /// The bare command text of the row with id `kappa`, suitable for
    /// piping straight back into a shell.
    fn return_row(&self, p: &QueryParams) -> Result<Vec<u8>, StoreError> {
        let command: Option<String> = self
            .conn
            .query_row(
                "SELECT command FROM history WHERE rowid = ?1",
                params![p.kappa],
                |row| row.get(0),
            )
            .optional()?;
        match command {
            Some(c) => Ok(c.into_bytes()),
            None => Err(StoreError::RowNotFound(p.kappa)),
        }
    }

    /// Deletes every row whose id appears in `rows`, in one transaction.
    /// Ids that do not exist are skipped silently. Deletes run highest id
    /// first so the remaining targets keep their ids while the transaction
    /// is open.
    fn delete_rows(&self, p: &QueryParams) -> Result<Vec<u8>, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM history WHERE rowid = ?1")?;
            let mut ids = p.rows.clone();
            ids.sort_unstable_by(|a, b| b.cmp(a));
            for id in ids {
                stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(b"No errors during deletion.".to_vec())
    }

    /// A composite report: record totals plus an embedded top-15 and
    /// last-10 section, scoped to the query's user/host filter.
    fn demo(&self, p: &QueryParams) -> Result<Vec<u8>, StoreError> {
        let pairs: i64 = self.conn.query_row(
            "SELECT count(*) FROM (SELECT DISTINCT user, host FROM history)",
            [],
            |r| r.get(0),
        )?;
        let hosts: i64 =
            self.conn
                .query_row("SELECT count(DISTINCT host) FROM history", [], |r| r.get(0))?;
        let lines: i64 =
            self.conn
                .query_row("SELECT count(command) FROM history", [], |r| r.get(0))?;
        let unique_lines: i64 =
            self.conn
                .query_row("SELECT count(DISTINCT command) FROM history", [], |r| {
                    r.get(0)
                })?;

        let top = self.top_k(&QueryParams {
            kappa: 15,
            ..p.clone()
        })?;
        let last = self.last_k(&QueryParams {
            kappa: 10,
            ..p.clone()
        })?;

        let mut out = format!(
            "There are {lines} command lines ({unique_lines} unique) in your database from {pairs} users across {hosts} hosts.\n\n"
        );
        out.push_str(&format!("Top-15 commands for user {}@{}:\n", p.user, p.host));
        out.push_str(&String::from_utf8_lossy(&top));
        out.push_str(&format!(
            "\n\nLast 10 commands user {}@{} ran:\n",
            p.user, p.host
        ));
        out.push_str(&String::from_utf8_lossy(&last));
        Ok(out.into_bytes())
    }

    /// Returns each match together with up to `before` rows preceding and
    /// `after` rows following it in timestamp order, like `grep -B/-A/-C`
    /// over the history timeline. Overlapping context windows are merged
    /// so adjacent matches render as one block.
    fn content_query(&self, p: &QueryParams) -> Result<Vec<u8>, StoreError> {
        let regex = command_filter(p)?;

        // Stage 1: timestamps of every matching row.
        let sql = if regex.is_some() {
            r"SELECT datetime, command FROM history
               WHERE user LIKE ?1 AND host LIKE ?2 ESCAPE '\'"
        } else {
            r"SELECT datetime, command FROM history
               WHERE user LIKE ?1 AND host LIKE ?2 AND command LIKE ?3 ESCAPE '\'"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let mut binds: Vec<&dyn ToSql> = vec![&p.user, &p.host];
        if regex.is_none() {
            binds.push(&p.pattern);
        }
        let matched = stmt.query_map(&binds[..], |row| {
            Ok((
                row.get::<_, DateTime<Utc>>(0)?,
                row.get::<_, String>(1)?,
            ))
        })?;
        let mut hits: Vec<DateTime<Utc>> = Vec::new();
        for r in matched {
            let (when, command) = r?;
            if let Some(re) = &regex {
                if !re.is_match(&command) {
                    continue;
                }
            }
            hits.push(when);
        }
        // The merge below assumes windows arrive in chronological order,
        // which the scan order alone does not guarantee after out-of-order
        // imports.
        hits.sort_unstable();

        // Stage 2: per hit, the surrounding row ids in ascending time
        // order. The before query always runs and includes the matched row
        // itself.
        let mut before_stmt = self.conn.prepare(
            r"SELECT rowid, datetime FROM
                (SELECT rowid, datetime FROM history
                  WHERE datetime <= ?1 AND user LIKE ?2 AND host LIKE ?3 ESCAPE '\'
                  ORDER BY datetime DESC LIMIT ?4)
              ORDER BY datetime ASC",
        )?;
        let mut after_stmt = self.conn.prepare(
            r"SELECT rowid, datetime FROM history
               WHERE datetime > ?1 AND user LIKE ?2 AND host LIKE ?3 ESCAPE '\'
               ORDER BY datetime ASC LIMIT ?4",
        )?;
        let mut windows: Vec<Vec<i64>> = Vec::new();
        for hit in &hits {
            let mut window: Vec<i64> = Vec::new();
            let ids = before_stmt.query_map(
                params![hit, p.user, p.host, i64::from(p.before) + 1],
                |row| row.get::<_, i64>(0),
            )?;
            for id in ids {
                window.push(id?);
            }
            if p.after > 0 {
                let ids = after_stmt.query_map(
                    params![hit, p.user, p.host, i64::from(p.after)],
                    |row| row.get::<_, i64>(0),
                )?;
                for id in ids {
                    window.push(id?);
                }
            }
            windows.push(window);
        }

        // Stage 3: splice overlapping windows. Walking backward lets a
        // chain of touching windows collapse into one in a single pass.
        for i in (0..windows.len().saturating_sub(1)).rev() {
            let head = match windows[i + 1].first() {
                Some(&id) => id,
                None => continue,
            };
            if let Some(k) = windows[i].iter().position(|&id| id == head) {
                let tail = windows.remove(i + 1);
                windows[i].truncate(k);
                windows[i].extend(tail);
            }
        }

        // Stage 4: fetch and render each surviving window as one block.
        let mut out: Vec<u8> = Vec::new();
        for (i, window) in windows.iter().enumerate() {
            let ids = window
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!(
                r"SELECT rowid, user, host, command, datetime FROM history
                   WHERE user LIKE ?1 ESCAPE '\' AND host LIKE ?2 ESCAPE '\' AND rowid IN ({ids})
                   ORDER BY datetime ASC",
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params![p.user, p.host], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, DateTime<Utc>>(4)?,
                ))
            })?;
            let mut renderer = Renderer::new(p.format);
            for r in rows {
                let (id, user, host, command, when) = r?;
                renderer.add_row(id, &user, &host, &command, when);
            }
            out.extend_from_slice(&renderer.formatted());
            if i < windows.len() - 1 {
                out.extend_from_slice(b"\n------------------\n");
            }
        }
        Ok(out)
    }
}
