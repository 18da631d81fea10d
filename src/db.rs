use anyhow::Result;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::QueryBuilder;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Open (creating if missing) the SQLite database at `db_path`.
pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Append `AND <column> starts with <prefix>` to a query.
///
/// Uses `substr` rather than `LIKE` so the match is case-sensitive and
/// `%`/`_` in paths need no escaping.
pub fn push_prefix_match(qb: &mut QueryBuilder<Sqlite>, column: &str, prefix: &str) {
    qb.push(format!(" AND substr({}, 1, ", column))
        .push_bind(prefix.chars().count() as i64)
        .push(") = ")
        .push_bind(prefix.to_string());
}
