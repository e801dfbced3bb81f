//! Batch column alterations.
//!
//! Operations against one table are collected first and applied together.
//! When a rebuild is needed the table is recreated under a temporary name,
//! its rows copied across, the original dropped and the copy renamed into
//! place. Views and triggers are dropped around the swap and recreated
//! from their original SQL. Either every operation lands or the table is
//! left untouched.

use rusqlite::Connection;

use super::migrations::MigrationError;
use super::schema::{
    dependent_objects, quote_ident, reflect_table, Column, IndexOrigin, TableSchema,
};

/// When to rebuild the table instead of using `ALTER TABLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Recreate {
    /// Use `ALTER TABLE` and rebuild only when SQLite refuses to drop a
    /// column in place (unique, primary key or foreign key columns).
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone)]
enum Op {
    AddColumn(Column),
    DropColumn(String),
}

#[derive(Debug)]
pub struct BatchAlter {
    table: String,
    recreate: Recreate,
    ops: Vec<Op>,
}

impl BatchAlter {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            recreate: Recreate::default(),
            ops: Vec::new(),
        }
    }

    pub fn recreate(mut self, mode: Recreate) -> Self {
        self.recreate = mode;
        self
    }

    pub fn add_column(&mut self, column: Column) -> &mut Self {
        self.ops.push(Op::AddColumn(column));
        self
    }

    pub fn drop_column(&mut self, name: impl Into<String>) -> &mut Self {
        self.ops.push(Op::DropColumn(name.into()));
        self
    }

    pub fn apply(&self, conn: &Connection) -> Result<(), MigrationError> {
        let before = reflect_table(conn, &self.table)?;
        let after = self.plan(&before)?;

        let has_drops = self.ops.iter().any(|op| matches!(op, Op::DropColumn(_)));
        let in_place = |conn: &Connection| in_savepoint(conn, |conn| self.alter_in_place(conn, &before));

        match self.recreate {
            Recreate::Always => rebuild(conn, &before, &after),
            Recreate::Never => in_place(conn),
            Recreate::Auto => match in_place(conn) {
                Err(MigrationError::Sqlite(e)) if has_drops => {
                    tracing::debug!("Cannot alter {} in place ({}), rebuilding", self.table, e);
                    rebuild(conn, &before, &after)
                }
                result => result,
            },
        }
    }

    /// Applies the operations to a copy of `before`, rejecting any that
    /// conflict with the columns present at that point.
    fn plan(&self, before: &TableSchema) -> Result<TableSchema, MigrationError> {
        let mut after = before.clone();
        for op in &self.ops {
            match op {
                Op::AddColumn(column) => {
                    if after.has_column(&column.name) {
                        return Err(MigrationError::SchemaConflict {
                            table: self.table.clone(),
                            column: column.name.clone(),
                            reason: "column already exists",
                        });
                    }
                    after.columns.push(column.clone());
                }
                Op::DropColumn(name) => {
                    if !after.has_column(name) {
                        return Err(MigrationError::SchemaConflict {
                            table: self.table.clone(),
                            column: name.clone(),
                            reason: "column does not exist",
                        });
                    }
                    after.columns.retain(|c| &c.name != name);
                    after.indexes.retain(|i| !i.columns.contains(name));
                    after.foreign_keys.retain(|fk| !fk.columns.contains(name));
                    after.checks.retain(|c| c.column.as_deref() != Some(name.as_str()));
                }
            }
        }
        Ok(after)
    }

    fn alter_in_place(&self, conn: &Connection, before: &TableSchema) -> Result<(), MigrationError> {
        let table = quote_ident(&self.table);
        for op in &self.ops {
            match op {
                Op::AddColumn(column) => {
                    tracing::debug!("ALTER {} ADD COLUMN {}", self.table, column.name);
                    conn.execute_batch(&format!(
                        "ALTER TABLE {table} ADD COLUMN {}",
                        column.definition()
                    ))?;
                }
                Op::DropColumn(name) => {
                    // SQLite refuses to drop a column that an index still covers
                    for index in before.indexes.iter().filter(|i| {
                        i.origin == IndexOrigin::Explicit && i.columns.contains(name)
                    }) {
                        conn.execute_batch(&format!(
                            "DROP INDEX IF EXISTS {}",
                            quote_ident(&index.name)
                        ))?;
                    }
                    tracing::debug!("ALTER {} DROP COLUMN {}", self.table, name);
                    conn.execute_batch(&format!(
                        "ALTER TABLE {table} DROP COLUMN {}",
                        quote_ident(name)
                    ))?;
                }
            }
        }
        Ok(())
    }
}

fn rebuild(
    conn: &Connection,
    before: &TableSchema,
    after: &TableSchema,
) -> Result<(), MigrationError> {
    with_foreign_keys_relaxed(conn, |conn| {
        in_savepoint(conn, |conn| {
            rebuild_table(conn, before, after)?;
            check_foreign_keys(conn)
        })
    })
}

fn rebuild_table(
    conn: &Connection,
    before: &TableSchema,
    after: &TableSchema,
) -> Result<(), MigrationError> {
    let table = quote_ident(&before.name);
    let tmp_name = format!("_batch_tmp_{}", before.name);
    let tmp = quote_ident(&tmp_name);

    tracing::debug!("Rebuilding table {} via {}", before.name, tmp_name);

    conn.execute_batch(&after.create_sql(&tmp_name))?;

    let retained: Vec<String> = after
        .columns
        .iter()
        .filter(|c| before.has_column(&c.name))
        .map(|c| quote_ident(&c.name))
        .collect();
    if !retained.is_empty() {
        let cols = retained.join(", ");
        conn.execute_batch(&format!(
            "INSERT INTO {tmp} ({cols}) SELECT {cols} FROM {table}"
        ))?;
    }

    // Renaming re-parses every view and trigger, so none may point at the
    // table while it is missing
    let dependents = dependent_objects(conn)?;
    for object in dependents.iter().rev() {
        conn.execute_batch(&object.drop_sql())?;
    }

    conn.execute_batch(&format!("DROP TABLE {table}"))?;
    conn.execute_batch(&format!("ALTER TABLE {tmp} RENAME TO {table}"))?;

    for index in &after.indexes {
        if let (IndexOrigin::Explicit, Some(sql)) = (index.origin, index.sql.as_deref()) {
            conn.execute_batch(sql)?;
        }
    }

    for object in &dependents {
        conn.execute_batch(&object.sql)?;
    }

    Ok(())
}

/// Runs `f` inside a savepoint, rolling back to it on error. Works both at
/// top level and nested inside an open transaction.
fn in_savepoint<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, MigrationError>,
) -> Result<T, MigrationError> {
    conn.execute_batch("SAVEPOINT batch_alter")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("RELEASE batch_alter")?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = conn.execute_batch("ROLLBACK TO batch_alter; RELEASE batch_alter") {
                tracing::error!("Failed to roll back batch alteration: {}", rollback);
            }
            Err(e)
        }
    }
}

/// Dropping a referenced parent table trips foreign key enforcement.
/// Outside a transaction enforcement is switched off for the duration.
/// Inside one the pragma has no effect, so checks are deferred to commit;
/// callers holding referencing rows must disable enforcement before
/// opening their transaction, as the migration runner does.
pub(crate) fn with_foreign_keys_relaxed<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, MigrationError>,
) -> Result<T, MigrationError> {
    let enforced: bool = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
    if !enforced {
        return f(conn);
    }

    if conn.is_autocommit() {
        conn.execute_batch("PRAGMA foreign_keys = OFF")?;
        let result = f(conn);
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        result
    } else {
        conn.execute_batch("PRAGMA defer_foreign_keys = ON")?;
        f(conn)
    }
}

pub(crate) fn check_foreign_keys(conn: &Connection) -> Result<(), MigrationError> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let mut rows = stmt.query([])?;
    if let Some(row) = rows.next()? {
        let table: String = row.get(0)?;
        return Err(MigrationError::ForeignKeyViolation(table));
    }
    Ok(())
}
