//! Versioned schema migrations.
//!
//! Each step names its own revision and the revision it builds on. The
//! steps form a single chain from the root (no predecessor) to the head.
//! The revision currently applied is stored in `schema_revision`.

mod m0001_users_and_posts;
mod m0002_new_fields_in_user_model;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};

use super::batch::check_foreign_keys;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Schema conflict on {table}.{column}: {reason}")]
    SchemaConflict {
        table: String,
        column: String,
        reason: &'static str,
    },

    #[error("No such table: {0}")]
    NoSuchTable(String),

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Unknown revision: {0}")]
    UnknownRevision(String),

    #[error("Broken revision chain: {0}")]
    BrokenChain(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Foreign key violation in table {0}")]
    ForeignKeyViolation(String),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

/// One reversible schema change.
pub trait SchemaMigration: Send + Sync {
    fn revision(&self) -> &'static str;

    /// Revision this step must be applied on top of; `None` for the root.
    fn down_revision(&self) -> Option<&'static str>;

    fn message(&self) -> &'static str;

    fn upgrade(&self, conn: &Connection) -> Result<(), MigrationError>;

    fn downgrade(&self, conn: &Connection) -> Result<(), MigrationError>;
}

/// Every migration shipped with the application, in no particular order.
pub fn all() -> Vec<Box<dyn SchemaMigration>> {
    vec![
        Box::new(m0001_users_and_posts::Migration),
        Box::new(m0002_new_fields_in_user_model::Migration),
    ]
}

/// Where an upgrade or downgrade should stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Head,
    Base,
    Revision(String),
    /// Number of steps forward (positive) or back (negative) from current.
    Relative(i64),
}

impl FromStr for Target {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "head" => Target::Head,
            "base" => Target::Base,
            _ => match s.parse::<i64>() {
                Ok(n) if s.starts_with('+') || s.starts_with('-') => Target::Relative(n),
                _ => Target::Revision(s.to_string()),
            },
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Head => f.write_str("head"),
            Target::Base => f.write_str("base"),
            Target::Revision(rev) => f.write_str(rev),
            Target::Relative(n) => write!(f, "{n:+}"),
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Up,
    Down,
}

/// Applies and reverts migrations along a validated revision chain.
pub struct Migrator {
    /// Root first.
    steps: Vec<Box<dyn SchemaMigration>>,
}

impl Migrator {
    /// Orders `steps` into a chain, rejecting duplicates, forks, dangling
    /// predecessors and anything unreachable from the root.
    pub fn new(steps: Vec<Box<dyn SchemaMigration>>) -> Result<Self, MigrationError> {
        if steps.is_empty() {
            return Ok(Self { steps });
        }

        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.revision()) {
                return Err(MigrationError::BrokenChain(format!(
                    "revision {} is defined more than once",
                    step.revision()
                )));
            }
        }
        for step in &steps {
            if let Some(down) = step.down_revision() {
                if !seen.contains(down) {
                    return Err(MigrationError::BrokenChain(format!(
                        "revision {} builds on unknown revision {}",
                        step.revision(),
                        down
                    )));
                }
            }
        }

        let mut roots = steps.iter().enumerate().filter(|(_, s)| s.down_revision().is_none());
        let root = match (roots.next(), roots.next()) {
            (Some((i, _)), None) => i,
            (None, _) => {
                return Err(MigrationError::BrokenChain("no root revision".into()));
            }
            (Some(_), Some(_)) => {
                return Err(MigrationError::BrokenChain("multiple root revisions".into()));
            }
        };

        let mut children: HashMap<&'static str, Vec<usize>> = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            if let Some(down) = step.down_revision() {
                children.entry(down).or_default().push(i);
            }
        }

        let mut order = vec![root];
        let mut current = root;
        while let Some(next) = children.get(steps[current].revision()) {
            if next.len() > 1 {
                return Err(MigrationError::BrokenChain(format!(
                    "revision {} has {} successors",
                    steps[current].revision(),
                    next.len()
                )));
            }
            current = next[0];
            order.push(current);
        }
        if order.len() != steps.len() {
            return Err(MigrationError::BrokenChain(
                "some revisions are not reachable from the root".into(),
            ));
        }

        let mut slots: Vec<Option<Box<dyn SchemaMigration>>> = steps.into_iter().map(Some).collect();
        let steps = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect();
        Ok(Self { steps })
    }

    /// The migrations shipped with the application.
    pub fn bundled() -> Result<Self, MigrationError> {
        Self::new(all())
    }

    /// The chain, root first.
    pub fn history(&self) -> impl Iterator<Item = &dyn SchemaMigration> {
        self.steps.iter().map(|s| s.as_ref())
    }

    pub fn head(&self) -> Option<&'static str> {
        self.steps.last().map(|s| s.revision())
    }

    pub fn current(&self, conn: &Connection) -> Result<Option<String>, MigrationError> {
        ensure_revision_table(conn)?;
        let current = conn
            .query_row("SELECT revision FROM schema_revision LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(current)
    }

    /// Applies every step after the current revision up to `target`.
    /// Returns the revisions applied, oldest first.
    pub fn upgrade(
        &self,
        conn: &mut Connection,
        target: &Target,
    ) -> Result<Vec<&'static str>, MigrationError> {
        let from = self.applied_count(conn)?;
        let to = self.resolve(target, from)?;
        if to < from {
            return Err(MigrationError::InvalidTarget(format!(
                "{target} is behind the current revision; use downgrade"
            )));
        }

        let mut applied = Vec::with_capacity(to - from);
        for step in &self.steps[from..to] {
            tracing::info!(
                "Upgrading {} -> {}, {}",
                step.down_revision().unwrap_or("base"),
                step.revision(),
                step.message()
            );
            run_step(conn, step.as_ref(), Direction::Up)?;
            applied.push(step.revision());
        }
        Ok(applied)
    }

    /// Reverts steps, newest first, until `target` is the current revision.
    /// Returns the revisions reverted, newest first.
    pub fn downgrade(
        &self,
        conn: &mut Connection,
        target: &Target,
    ) -> Result<Vec<&'static str>, MigrationError> {
        let from = self.applied_count(conn)?;
        let to = self.resolve(target, from)?;
        if to > from {
            return Err(MigrationError::InvalidTarget(format!(
                "{target} is ahead of the current revision; use upgrade"
            )));
        }

        let mut reverted = Vec::with_capacity(from - to);
        for step in self.steps[to..from].iter().rev() {
            tracing::info!(
                "Downgrading {} -> {}, {}",
                step.revision(),
                step.down_revision().unwrap_or("base"),
                step.message()
            );
            run_step(conn, step.as_ref(), Direction::Down)?;
            reverted.push(step.revision());
        }
        Ok(reverted)
    }

    fn position(&self, revision: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.revision() == revision)
    }

    /// Number of chain steps applied, derived from the stored pointer.
    fn applied_count(&self, conn: &Connection) -> Result<usize, MigrationError> {
        match self.current(conn)? {
            None => Ok(0),
            Some(rev) => self
                .position(&rev)
                .map(|i| i + 1)
                .ok_or(MigrationError::UnknownRevision(rev)),
        }
    }

    /// Translates `target` into the number of steps that should be applied.
    fn resolve(&self, target: &Target, applied: usize) -> Result<usize, MigrationError> {
        match target {
            Target::Head => Ok(self.steps.len()),
            Target::Base => Ok(0),
            Target::Revision(rev) => self
                .position(rev)
                .map(|i| i + 1)
                .ok_or_else(|| MigrationError::UnknownRevision(rev.clone())),
            Target::Relative(n) => {
                let leaves_chain = || {
                    MigrationError::InvalidTarget(format!("relative target {target} leaves the chain"))
                };
                let to = i64::try_from(applied)
                    .ok()
                    .and_then(|applied| applied.checked_add(*n))
                    .ok_or_else(leaves_chain)?;
                if to < 0 || to > self.steps.len() as i64 {
                    return Err(leaves_chain());
                }
                Ok(to as usize)
            }
        }
    }
}

fn ensure_revision_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_revision (
            revision TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
}

fn set_current(conn: &Connection, revision: Option<&str>) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM schema_revision", [])?;
    if let Some(revision) = revision {
        conn.execute(
            "INSERT INTO schema_revision (revision) VALUES (?1)",
            params![revision],
        )?;
    }
    Ok(())
}

/// Runs one step and moves the revision pointer in a single transaction.
/// Foreign key enforcement is lifted for the duration so table rebuilds
/// can drop referenced tables; integrity is checked before commit.
fn run_step(
    conn: &mut Connection,
    step: &dyn SchemaMigration,
    direction: Direction,
) -> Result<(), MigrationError> {
    let enforced: bool = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
    if enforced {
        conn.execute_batch("PRAGMA foreign_keys = OFF")?;
    }

    let result = step_transaction(conn, step, direction);

    if enforced {
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
    }
    result
}

fn step_transaction(
    conn: &mut Connection,
    step: &dyn SchemaMigration,
    direction: Direction,
) -> Result<(), MigrationError> {
    let tx = conn.transaction()?;
    match direction {
        Direction::Up => {
            step.upgrade(&tx)?;
            set_current(&tx, Some(step.revision()))?;
        }
        Direction::Down => {
            step.downgrade(&tx)?;
            set_current(&tx, step.down_revision())?;
        }
    }
    check_foreign_keys(&tx)?;
    tx.commit()?;
    Ok(())
}
