pub mod batch;
pub mod migrations;
pub mod schema;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

use migrations::{MigrationError, Migrator, Target};

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn create_pool(db_path: &Path) -> anyhow::Result<DbPool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )
    });
    let pool = Pool::builder().max_size(8).build(manager)?;

    let conn = pool.get()?;
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        ",
    )?;

    Ok(pool)
}

/// Brings the database up to the newest bundled revision.
pub fn run_migrations(pool: &DbPool) -> Result<Vec<&'static str>, MigrationError> {
    let mut conn = pool.get()?;
    let migrator = Migrator::bundled()?;
    let applied = migrator.upgrade(&mut conn, &Target::Head)?;

    if applied.is_empty() {
        tracing::info!("Database already at head ({})", migrator.head().unwrap_or("base"));
    } else {
        tracing::info!("Applied {} migration(s)", applied.len());
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::column_names;
    use rusqlite::params;
    use std::time::Duration;

    fn test_pool() -> DbPool {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")
        });
        Pool::builder().max_size(1).build(manager).unwrap()
    }

    #[test]
    fn create_pool_creates_db_file() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("sub/dir/test.db");
        let pool = create_pool(&db_path).unwrap();
        assert!(db_path.exists());

        let conn = pool.get().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
        let fk: bool = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert!(fk);
    }

    #[test]
    fn migrations_run_to_head() {
        let pool = test_pool();
        let applied = run_migrations(&pool).unwrap();
        assert_eq!(applied, vec!["a934000a9b42", "d67dfdca2793"]);

        let conn = pool.get().unwrap();
        let current: String = conn
            .query_row("SELECT revision FROM schema_revision", [], |row| row.get(0))
            .unwrap();
        assert_eq!(current, "d67dfdca2793");

        let user_cols = column_names(&conn, "user").unwrap();
        assert!(user_cols.contains("about_me"));
        assert!(user_cols.contains("last_seen"));
    }

    #[test]
    fn migrations_are_idempotent() {
        let pool = test_pool();
        run_migrations(&pool).unwrap();
        let second = run_migrations(&pool).unwrap();
        assert!(second.is_empty());

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_revision", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn unavailable_connection_is_a_pool_error() {
        let manager = SqliteConnectionManager::memory()
            .with_init(|_| Err(rusqlite::Error::InvalidQuery));
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_millis(50))
            .build_unchecked(manager);

        assert!(matches!(
            run_migrations(&pool),
            Err(MigrationError::Pool(_))
        ));
    }

    #[test]
    fn foreign_keys_enforced() {
        let pool = test_pool();
        run_migrations(&pool).unwrap();

        let conn = pool.get().unwrap();
        let result = conn.execute(
            "INSERT INTO post (body, timestamp, user_id) VALUES (?1, datetime('now'), ?2)",
            params!["hello", 42],
        );
        assert!(result.is_err());
    }
}
