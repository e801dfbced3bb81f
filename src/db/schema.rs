//! Reflection of SQLite table definitions.
//!
//! Batch alterations rebuild a table from what SQLite reports about it, so
//! everything needed to recreate the table is captured here: columns,
//! primary key, unique and check constraints, foreign keys and explicit
//! indexes. Views and triggers are captured separately as SQL text so a
//! rebuild can put them back.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;

use super::migrations::MigrationError;

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    /// 1-based position within the primary key, 0 when not part of it.
    pub primary_key: u32,
}

impl Column {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: true,
            default: None,
            primary_key: 0,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, "INTEGER")
    }

    pub fn varchar(name: impl Into<String>, length: u32) -> Self {
        Self::new(name, format!("VARCHAR({length})"))
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, "DATETIME")
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// Column clause as used in `CREATE TABLE` and `ADD COLUMN`.
    /// Primary keys are emitted as a table constraint, never inline.
    pub fn definition(&self) -> String {
        let mut sql = quote_ident(&self.name);
        if !self.sql_type.is_empty() {
            sql.push(' ');
            sql.push_str(&self.sql_type);
        }
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(ref default) = self.default {
            sql.push_str(&format!(" DEFAULT ({default})"));
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub ref_table: String,
    /// Empty when the reference targets the parent's primary key implicitly.
    pub ref_columns: Vec<String>,
    pub on_update: String,
    pub on_delete: String,
}

impl ForeignKey {
    fn definition(&self) -> String {
        let mut sql = format!(
            "FOREIGN KEY ({}) REFERENCES {}",
            join_idents(&self.columns),
            quote_ident(&self.ref_table)
        );
        if !self.ref_columns.is_empty() {
            sql.push_str(&format!(" ({})", join_idents(&self.ref_columns)));
        }
        if self.on_update != "NO ACTION" {
            sql.push_str(&format!(" ON UPDATE {}", self.on_update));
        }
        if self.on_delete != "NO ACTION" {
            sql.push_str(&format!(" ON DELETE {}", self.on_delete));
        }
        sql
    }
}

/// Where an index came from, as reported by `pragma_index_list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrigin {
    /// `CREATE INDEX` statement.
    Explicit,
    /// `UNIQUE` constraint in the table definition.
    Unique,
    /// Primary key constraint.
    PrimaryKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub origin: IndexOrigin,
    /// Original `CREATE INDEX` statement for explicit indexes.
    pub sql: Option<String>,
}

/// A `CHECK` clause lifted from the table's `CREATE TABLE` text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckConstraint {
    /// Column the clause is declared on, `None` for table constraints.
    pub column: Option<String>,
    pub expr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub foreign_keys: Vec<ForeignKey>,
    pub indexes: Vec<Index>,
    pub checks: Vec<CheckConstraint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    View,
    Trigger,
}

/// A view or trigger, kept as the statement that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaObject {
    pub kind: ObjectKind,
    pub name: String,
    pub sql: String,
}

impl SchemaObject {
    pub fn drop_sql(&self) -> String {
        let kind = match self.kind {
            ObjectKind::View => "VIEW",
            ObjectKind::Trigger => "TRIGGER",
        };
        format!("DROP {kind} IF EXISTS {}", quote_ident(&self.name))
    }
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> BTreeSet<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// `CREATE TABLE` statement for this schema under `table_name`.
    pub fn create_sql(&self, table_name: &str) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|column| {
                let mut sql = column.definition();
                for check in self
                    .checks
                    .iter()
                    .filter(|c| c.column.as_deref() == Some(column.name.as_str()))
                {
                    sql.push_str(&format!(" CHECK ({})", check.expr));
                }
                sql
            })
            .collect();

        let mut pk: Vec<&Column> = self.columns.iter().filter(|c| c.primary_key > 0).collect();
        pk.sort_by_key(|c| c.primary_key);
        if !pk.is_empty() {
            let names: Vec<String> = pk.iter().map(|c| c.name.clone()).collect();
            parts.push(format!("PRIMARY KEY ({})", join_idents(&names)));
        }

        for index in &self.indexes {
            if index.origin == IndexOrigin::Unique {
                parts.push(format!("UNIQUE ({})", join_idents(&index.columns)));
            }
        }

        for fk in &self.foreign_keys {
            parts.push(fk.definition());
        }

        for check in self.checks.iter().filter(|c| c.column.is_none()) {
            parts.push(format!("CHECK ({})", check.expr));
        }

        format!(
            "CREATE TABLE {} (\n    {}\n)",
            quote_ident(table_name),
            parts.join(",\n    ")
        )
    }
}

pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )
}

/// Column names of `table`, or `NoSuchTable` if it does not exist.
pub fn column_names(conn: &Connection, table: &str) -> Result<BTreeSet<String>, MigrationError> {
    Ok(reflect_table(conn, table)?.column_names())
}

pub fn reflect_table(conn: &Connection, table: &str) -> Result<TableSchema, MigrationError> {
    if !table_exists(conn, table)? {
        return Err(MigrationError::NoSuchTable(table.to_string()));
    }

    let columns = {
        let mut stmt = conn.prepare(
            "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
        )?;
        let rows = stmt.query_map(params![table], |row| {
            Ok(Column {
                name: row.get(0)?,
                sql_type: row.get(1)?,
                nullable: !row.get::<_, bool>(2)?,
                default: row.get(3)?,
                primary_key: row.get(4)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let foreign_keys = reflect_foreign_keys(conn, table)?;
    let indexes = reflect_indexes(conn, table)?;

    let create_sql: Option<String> = conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    let checks = create_sql.as_deref().map(check_constraints).unwrap_or_default();

    Ok(TableSchema {
        name: table.to_string(),
        columns,
        foreign_keys,
        indexes,
        checks,
    })
}

/// Every view and trigger in the database, in creation order.
pub fn dependent_objects(conn: &Connection) -> rusqlite::Result<Vec<SchemaObject>> {
    let mut stmt = conn.prepare(
        "SELECT type, name, sql FROM sqlite_master \
         WHERE type IN ('view', 'trigger') AND sql IS NOT NULL ORDER BY rowid",
    )?;
    let rows = stmt.query_map([], |row| {
        let kind: String = row.get(0)?;
        Ok(SchemaObject {
            kind: if kind == "view" {
                ObjectKind::View
            } else {
                ObjectKind::Trigger
            },
            name: row.get(1)?,
            sql: row.get(2)?,
        })
    })?;
    rows.collect()
}

fn reflect_foreign_keys(conn: &Connection, table: &str) -> rusqlite::Result<Vec<ForeignKey>> {
    let mut stmt = conn.prepare(
        "SELECT id, \"table\", \"from\", \"to\", on_update, on_delete \
         FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
    )?;
    let rows = stmt.query_map(params![table], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;

    let mut keys: Vec<(i64, ForeignKey)> = Vec::new();
    for row in rows {
        let (id, ref_table, from, to, on_update, on_delete) = row?;
        match keys.last_mut() {
            Some((last_id, fk)) if *last_id == id => {
                fk.columns.push(from);
                if let Some(to) = to {
                    fk.ref_columns.push(to);
                }
            }
            _ => keys.push((
                id,
                ForeignKey {
                    columns: vec![from],
                    ref_table,
                    ref_columns: to.into_iter().collect(),
                    on_update,
                    on_delete,
                },
            )),
        }
    }
    Ok(keys.into_iter().map(|(_, fk)| fk).collect())
}

fn reflect_indexes(conn: &Connection, table: &str) -> rusqlite::Result<Vec<Index>> {
    let listed = {
        let mut stmt =
            conn.prepare("SELECT name, \"unique\", origin FROM pragma_index_list(?1) ORDER BY seq")?;
        let rows = stmt.query_map(params![table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, bool>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut indexes = Vec::with_capacity(listed.len());
    for (name, unique, origin) in listed {
        let origin = match origin.as_str() {
            "u" => IndexOrigin::Unique,
            "pk" => IndexOrigin::PrimaryKey,
            _ => IndexOrigin::Explicit,
        };

        let columns = {
            let mut stmt =
                conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
            let rows = stmt.query_map(params![name], |row| row.get::<_, Option<String>>(0))?;
            // Expression indexes report NULL column names
            rows.filter_map(|r| r.transpose())
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let sql: Option<String> = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'index' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        indexes.push(Index {
            name,
            columns,
            unique,
            origin,
            sql,
        });
    }
    Ok(indexes)
}

/// `CHECK` clauses of a `CREATE TABLE` statement, attributed to the column
/// they are declared on where applicable.
fn check_constraints(create_sql: &str) -> Vec<CheckConstraint> {
    let mut checks = Vec::new();
    for definition in table_definitions(create_sql) {
        let column = definition_owner(definition);
        for expr in check_exprs(definition) {
            checks.push(CheckConstraint {
                column: column.clone(),
                expr,
            });
        }
    }
    checks
}

/// Visits every byte of `sql` outside string literals, quoted identifiers
/// and comments, along with its parenthesis depth. An opening paren and its
/// matching close report the same depth.
fn scan(sql: &str, mut visit: impl FnMut(usize, u8, usize)) {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut depth = 0usize;
    let mut i = 0;
    while i < len {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < len {
                    if bytes[i] == quote {
                        if i + 1 < len && bytes[i + 1] == quote {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
            }
            b'[' => {
                while i < len && bytes[i] != b']' {
                    i += 1;
                }
            }
            b'-' if i + 1 < len && bytes[i + 1] == b'-' => {
                while i < len && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if i + 1 < len && bytes[i + 1] == b'*' => {
                i += 2;
                while i + 1 < len && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            b'(' => {
                visit(i, b'(', depth);
                depth += 1;
            }
            b')' => {
                depth = depth.saturating_sub(1);
                visit(i, b')', depth);
            }
            b => visit(i, b, depth),
        }
        i += 1;
    }
}

/// Column definitions and table constraints between the outer parentheses.
fn table_definitions(create_sql: &str) -> Vec<&str> {
    let mut open = None;
    let mut close = None;
    let mut commas = Vec::new();
    scan(create_sql, |i, b, depth| match (b, depth) {
        (b'(', 0) if open.is_none() => open = Some(i),
        (b')', 0) if open.is_some() && close.is_none() => close = Some(i),
        (b',', 1) if open.is_some() && close.is_none() => commas.push(i),
        _ => {}
    });

    let (Some(open), Some(close)) = (open, close) else {
        return Vec::new();
    };
    let mut bounds = vec![open];
    bounds.extend(commas);
    bounds.push(close);
    bounds
        .windows(2)
        .map(|w| create_sql[w[0] + 1..w[1]].trim())
        .collect()
}

/// Column a definition declares, or `None` for a table constraint.
fn definition_owner(definition: &str) -> Option<String> {
    let definition = skip_comments(definition);
    let bytes = definition.as_bytes();
    let name = match bytes.first()? {
        quote @ (b'"' | b'`') => {
            let mut name = String::new();
            let mut chars = definition[1..].chars().peekable();
            while let Some(c) = chars.next() {
                if c as u32 == *quote as u32 {
                    if chars.peek().map(|&n| n as u32) == Some(*quote as u32) {
                        chars.next();
                    } else {
                        break;
                    }
                }
                name.push(c);
            }
            return Some(name);
        }
        b'[' => {
            let end = definition.find(']')?;
            return Some(definition[1..end].to_string());
        }
        _ => {
            let end = bytes
                .iter()
                .position(|&b| !is_ident_byte(b))
                .unwrap_or(bytes.len());
            &definition[..end]
        }
    };

    const CONSTRAINT_KEYWORDS: &[&str] = &["CONSTRAINT", "CHECK", "PRIMARY", "UNIQUE", "FOREIGN"];
    if CONSTRAINT_KEYWORDS
        .iter()
        .any(|kw| name.eq_ignore_ascii_case(kw))
    {
        None
    } else {
        Some(name.to_string())
    }
}

fn skip_comments(mut s: &str) -> &str {
    loop {
        s = s.trim_start();
        if let Some(rest) = s.strip_prefix("--") {
            s = rest.split_once('\n').map_or("", |(_, r)| r);
        } else if let Some(rest) = s.strip_prefix("/*") {
            s = rest.split_once("*/").map_or("", |(_, r)| r);
        } else {
            return s;
        }
    }
}

/// Expressions of the `CHECK (...)` clauses in one definition.
fn check_exprs(definition: &str) -> Vec<String> {
    let mut top_level = Vec::new();
    scan(definition, |i, b, depth| {
        if depth == 0 {
            top_level.push((i, b));
        }
    });

    let mut exprs = Vec::new();
    let mut k = 0;
    while k < top_level.len() {
        let (i, _) = top_level[k];
        if starts_keyword(definition, i, "CHECK") {
            let open = top_level[k..].iter().position(|&(_, b)| b == b'(').map(|p| k + p);
            let close = open.and_then(|o| {
                top_level[o..].iter().position(|&(_, b)| b == b')').map(|p| o + p)
            });
            if let (Some(open), Some(close)) = (open, close) {
                let (start, end) = (top_level[open].0, top_level[close].0);
                exprs.push(definition[start + 1..end].trim().to_string());
                k = close;
            }
        }
        k += 1;
    }
    exprs
}

fn starts_keyword(s: &str, i: usize, keyword: &str) -> bool {
    let bytes = s.as_bytes();
    let end = i + keyword.len();
    (i == 0 || !is_ident_byte(bytes[i - 1]))
        && end <= bytes.len()
        && bytes[i..end].eq_ignore_ascii_case(keyword.as_bytes())
        && (end == bytes.len() || !is_ident_byte(bytes[end]))
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn join_idents(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}
