use rusqlite::Connection;

use super::{MigrationError, SchemaMigration};
use crate::db::batch::BatchAlter;
use crate::db::schema::Column;

pub struct Migration;

impl SchemaMigration for Migration {
    fn revision(&self) -> &'static str {
        "d67dfdca2793"
    }

    fn down_revision(&self) -> Option<&'static str> {
        Some("a934000a9b42")
    }

    fn message(&self) -> &'static str {
        "new fields in user model"
    }

    fn upgrade(&self, conn: &Connection) -> Result<(), MigrationError> {
        BatchAlter::new("user")
            .add_column(Column::varchar("about_me", 140))
            .add_column(Column::datetime("last_seen"))
            .apply(conn)
    }

    fn downgrade(&self, conn: &Connection) -> Result<(), MigrationError> {
        BatchAlter::new("user")
            .drop_column("last_seen")
            .drop_column("about_me")
            .apply(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{column_names, reflect_table};
    use std::collections::BTreeSet;

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn bare_user_table() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE \"user\" (id INTEGER PRIMARY KEY);")
            .unwrap();
        conn
    }

    #[test]
    fn upgrade_adds_nullable_columns() {
        let conn = bare_user_table();
        Migration.upgrade(&conn).unwrap();

        let schema = reflect_table(&conn, "user").unwrap();
        assert_eq!(
            schema.column_names(),
            names(&["id", "about_me", "last_seen"])
        );
        let about_me = schema.column("about_me").unwrap();
        assert!(about_me.nullable);
        assert_eq!(about_me.sql_type, "VARCHAR(140)");
        assert_eq!(about_me.default, None);
        let last_seen = schema.column("last_seen").unwrap();
        assert!(last_seen.nullable);
        assert_eq!(last_seen.sql_type, "DATETIME");
    }

    #[test]
    fn downgrade_restores_bare_table() {
        let conn = bare_user_table();
        Migration.upgrade(&conn).unwrap();
        Migration.downgrade(&conn).unwrap();
        assert_eq!(column_names(&conn, "user").unwrap(), names(&["id"]));
    }

    #[test]
    fn existing_rows_read_null_after_upgrade() {
        let conn = bare_user_table();
        conn.execute("INSERT INTO \"user\" (id) VALUES (1), (2)", [])
            .unwrap();
        Migration.upgrade(&conn).unwrap();

        let nulls: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM \"user\" WHERE about_me IS NULL AND last_seen IS NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(nulls, 2);
    }

    #[test]
    fn second_upgrade_conflicts() {
        let conn = bare_user_table();
        Migration.upgrade(&conn).unwrap();
        let err = Migration.upgrade(&conn).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::SchemaConflict { ref table, ref column, .. }
                if table == "user" && column == "about_me"
        ));
    }

    #[test]
    fn downgrade_without_columns_conflicts() {
        let conn = bare_user_table();
        assert!(matches!(
            Migration.downgrade(&conn),
            Err(MigrationError::SchemaConflict { ref column, .. }) if column == "last_seen"
        ));
    }

    #[test]
    fn partial_state_is_rejected_without_changes() {
        let conn = bare_user_table();
        conn.execute_batch("ALTER TABLE \"user\" ADD COLUMN last_seen DATETIME")
            .unwrap();
        assert!(Migration.upgrade(&conn).is_err());
        assert_eq!(
            column_names(&conn, "user").unwrap(),
            names(&["id", "last_seen"])
        );
    }

    #[test]
    fn upgrade_requires_user_table() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(matches!(
            Migration.upgrade(&conn),
            Err(MigrationError::NoSuchTable(_))
        ));
    }
}
