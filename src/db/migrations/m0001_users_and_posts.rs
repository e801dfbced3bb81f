use rusqlite::Connection;

use super::{MigrationError, SchemaMigration};
use crate::db::schema::table_exists;

const TABLES: &[&str] = &["user", "post"];

pub struct Migration;

impl SchemaMigration for Migration {
    fn revision(&self) -> &'static str {
        "a934000a9b42"
    }

    fn down_revision(&self) -> Option<&'static str> {
        None
    }

    fn message(&self) -> &'static str {
        "users and posts tables"
    }

    fn upgrade(&self, conn: &Connection) -> Result<(), MigrationError> {
        for table in TABLES {
            if table_exists(conn, table)? {
                return Err(MigrationError::TableExists(table.to_string()));
            }
        }
        conn.execute_batch(include_str!(
            "../../../migrations/a934000a9b42_users_and_posts.sql"
        ))?;
        Ok(())
    }

    fn downgrade(&self, conn: &Connection) -> Result<(), MigrationError> {
        for table in TABLES {
            if !table_exists(conn, table)? {
                return Err(MigrationError::NoSuchTable(table.to_string()));
            }
        }
        conn.execute_batch(
            "DROP INDEX ix_post_user_id;
             DROP INDEX ix_post_timestamp;
             DROP TABLE post;
             DROP INDEX ix_user_email;
             DROP INDEX ix_user_username;
             DROP TABLE \"user\";",
        )?;
        Ok(())
    }
}
