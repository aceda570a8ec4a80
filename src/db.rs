//! The persistent store: a SQLite database holding every node, link, flag,
//! and variable, plus the transaction and schema machinery around it.

use crate::entry::{
    is_virtual, EntryCache, Mtime, NodeType, Tupid, DOT_DT, ENV_DT, EXCLUSION_DT,
};
use crate::flags::{Flag, FlagSet};
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const TUP_DIR: &str = ".tup";
pub const TUP_DB: &str = "db";
pub const TUP_CONFIG: &str = "tup.config";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("transaction already in progress")]
    NestedTransaction,
    #[error("no transaction in progress")]
    NoTransaction,
    #[error("node {name:?} already exists in directory {parent}")]
    NameTaken { parent: Tupid, name: String },
    #[error("node {id} not found")]
    NotFound { id: Tupid },
    #[error("output {output} is already written by command {first}; command {second} cannot write it too")]
    MultipleProducers {
        output: Tupid,
        first: Tupid,
        second: Tupid,
    },
    #[error("node {id} is a {found}, expected a {expected}")]
    TypeMismatch {
        id: Tupid,
        found: NodeType,
        expected: NodeType,
    },
    #[error("directory {id} is not empty")]
    DirNotEmpty { id: Tupid },
    #[error("store invariant violated: {0}")]
    Invariant(String),
    #[error("another process holds the build lock")]
    AlreadyLocked,
    #[error("store version {found} is newer than this build supports ({supported})")]
    SchemaMismatch { found: i64, supported: i64 },
}

const DB_VERSION: i64 = 3;

const SCHEMA: &str = "
CREATE TABLE node (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dir INTEGER NOT NULL,
    type INTEGER NOT NULL,
    name TEXT NOT NULL,
    mtime_sec INTEGER NOT NULL DEFAULT -1,
    mtime_nsec INTEGER NOT NULL DEFAULT 0,
    srcid INTEGER NOT NULL DEFAULT 0,
    display TEXT,
    flags TEXT
);
CREATE UNIQUE INDEX node_dir_name ON node(dir, name);
CREATE TABLE link (
    from_id INTEGER NOT NULL,
    to_id INTEGER NOT NULL,
    style INTEGER NOT NULL,
    PRIMARY KEY (from_id, to_id, style)
) WITHOUT ROWID;
CREATE INDEX link_to ON link(to_id);
CREATE TABLE create_list (id INTEGER PRIMARY KEY) WITHOUT ROWID;
CREATE TABLE modify_list (id INTEGER PRIMARY KEY) WITHOUT ROWID;
CREATE TABLE config_list (id INTEGER PRIMARY KEY) WITHOUT ROWID;
CREATE TABLE variant_list (id INTEGER PRIMARY KEY) WITHOUT ROWID;
CREATE TABLE transient_list (id INTEGER PRIMARY KEY) WITHOUT ROWID;
CREATE TABLE var (id INTEGER PRIMARY KEY, value TEXT NOT NULL) WITHOUT ROWID;
CREATE TABLE config (lval TEXT PRIMARY KEY, rval TEXT NOT NULL);
";

/// Forward-only, idempotent upgrade steps.  Each entry is the version the
/// step upgrades the store *to*.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        2,
        "ALTER TABLE node ADD COLUMN display TEXT;
         ALTER TABLE node ADD COLUMN flags TEXT;",
    ),
    (
        3,
        "CREATE TABLE IF NOT EXISTS transient_list (id INTEGER PRIMARY KEY) WITHOUT ROWID;
         CREATE INDEX IF NOT EXISTS link_to ON link(to_id);",
    ),
];

/// An open store.  All mutation happens through one of these, on one
/// thread; workers report their observations back to whoever owns it.
pub struct Db {
    pub(crate) conn: Connection,
    pub(crate) cache: EntryCache,
    pub(crate) ghost_candidates: HashSet<Tupid>,
    in_tx: bool,
    tx_base_changes: i64,
}

/// Walks up from `start` looking for the directory containing `.tup`.
pub fn find_top(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(TUP_DIR).is_dir() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

impl Db {
    /// Creates a fresh store under `root/.tup/` and writes the schema and
    /// the reserved root rows.
    pub fn create(root: &Path, sync: bool, memory: bool) -> Result<Db, DbError> {
        let conn = if memory {
            Connection::open_in_memory()?
        } else {
            let dir = root.join(TUP_DIR);
            std::fs::create_dir_all(&dir)?;
            let conn = Connection::open(dir.join(TUP_DB))?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            conn
        };
        if !sync {
            conn.execute_batch("PRAGMA synchronous=OFF;")?;
        }
        conn.execute_batch(SCHEMA)?;
        let mut db = Db {
            conn,
            cache: EntryCache::new(),
            ghost_candidates: HashSet::new(),
            in_tx: false,
            tx_base_changes: 0,
        };
        db.begin()?;
        for (id, name) in [
            (DOT_DT, "."),
            (ENV_DT, "<environ>"),
            (EXCLUSION_DT, "<exclusions>"),
        ] {
            db.conn.execute(
                "INSERT INTO node (id, dir, type, name) VALUES (?1, 0, ?2, ?3)",
                rusqlite::params![id, NodeType::Dir.to_int(), name],
            )?;
        }
        db.config_set_int("db_version", DB_VERSION)?;
        // The project root starts out needing a parse.
        db.flag_add(Flag::Create, DOT_DT)?;
        db.commit()?;
        tracing::debug!(memory, sync, "store created");
        Ok(db)
    }

    /// In-memory store with the full schema; the test entry point.
    pub fn open_memory() -> Result<Db, DbError> {
        Db::create(Path::new("."), false, true)
    }

    /// Opens an existing store, running any pending migrations.
    pub fn open(root: &Path) -> Result<Db, DbError> {
        let path = root.join(TUP_DIR).join(TUP_DB);
        if !path.exists() {
            return Err(DbError::Invariant(format!(
                "no store at {}; run init first",
                path.display()
            )));
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let mut db = Db {
            conn,
            cache: EntryCache::new(),
            ghost_candidates: HashSet::new(),
            in_tx: false,
            tx_base_changes: 0,
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&mut self) -> Result<(), DbError> {
        let mut version = self.config_get_int("db_version", 0)?;
        if version == 0 {
            return Err(DbError::Invariant("store has no version row".to_owned()));
        }
        if version > DB_VERSION {
            return Err(DbError::SchemaMismatch {
                found: version,
                supported: DB_VERSION,
            });
        }
        if version == DB_VERSION {
            return Ok(());
        }
        self.begin()?;
        for &(target, sql) in MIGRATIONS {
            if version < target {
                tracing::debug!(from = version, to = target, "store migration");
                self.conn.execute_batch(sql)?;
                version = target;
            }
        }
        self.config_set_int("db_version", version)?;
        self.commit()?;
        Ok(())
    }

    fn total_changes(&self) -> Result<i64, DbError> {
        Ok(self
            .conn
            .query_row("SELECT total_changes()", [], |row| row.get(0))?)
    }

    /// Rows touched by the most recent statement.
    pub(crate) fn last_changes(&self) -> Result<i64, DbError> {
        Ok(self
            .conn
            .query_row("SELECT changes()", [], |row| row.get(0))?)
    }

    pub fn begin(&mut self) -> Result<(), DbError> {
        if self.in_tx {
            return Err(DbError::NestedTransaction);
        }
        self.conn.execute_batch("BEGIN")?;
        self.tx_base_changes = self.total_changes()?;
        self.cache.begin();
        self.in_tx = true;
        Ok(())
    }

    /// Commits the transaction, reaping unreferenced ghosts first.
    pub fn commit(&mut self) -> Result<(), DbError> {
        if !self.in_tx {
            return Err(DbError::NoTransaction);
        }
        self.reap_ghosts()?;
        self.conn.execute_batch("COMMIT")?;
        self.cache.commit();
        self.in_tx = false;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), DbError> {
        if !self.in_tx {
            return Err(DbError::NoTransaction);
        }
        self.conn.execute_batch("ROLLBACK")?;
        self.cache.rollback();
        self.ghost_candidates.clear();
        self.in_tx = false;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.in_tx
    }

    /// Rows mutated since begin; a zero here after an update pass means the
    /// build was a no-op.
    pub fn changes(&self) -> Result<i64, DbError> {
        Ok(self.total_changes()? - self.tx_base_changes)
    }

    // ---- config table -----------------------------------------------------

    pub fn config_set_int(&mut self, lval: &str, x: i64) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO config (lval, rval) VALUES (?1, ?2)",
            rusqlite::params![lval, x.to_string()],
        )?;
        Ok(())
    }

    pub fn config_get_int(&self, lval: &str, default: i64) -> Result<i64, DbError> {
        let rval: Option<String> = self
            .conn
            .query_row("SELECT rval FROM config WHERE lval=?1", [lval], |row| {
                row.get(0)
            })
            .optional()?;
        match rval {
            Some(s) => Ok(s.parse().unwrap_or(default)),
            None => Ok(default),
        }
    }

    pub fn config_set_string(&mut self, lval: &str, rval: &str) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO config (lval, rval) VALUES (?1, ?2)",
            rusqlite::params![lval, rval],
        )?;
        Ok(())
    }

    pub fn config_get_string(&self, lval: &str) -> Result<Option<String>, DbError> {
        Ok(self
            .conn
            .query_row("SELECT rval FROM config WHERE lval=?1", [lval], |row| {
                row.get(0)
            })
            .optional()?)
    }

    /// All config rows, ascending by key.
    pub fn show_config(&self) -> Result<Vec<(String, String)>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT lval, rval FROM config ORDER BY lval")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- bulk reflag ------------------------------------------------------

    /// Flags every command for re-execution.
    pub fn rebuild_all(&mut self) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO modify_list SELECT id FROM node WHERE type=?1",
            [NodeType::Command.to_int()],
        )?;
        Ok(())
    }

    /// Flags every directory for re-parsing.
    pub fn reparse_all(&mut self) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO create_list SELECT id FROM node WHERE type=?1",
            [NodeType::Dir.to_int()],
        )?;
        Ok(())
    }

    // ---- ghost reaper -----------------------------------------------------

    /// Marks a node as possibly unreferenced; checked at commit.
    pub(crate) fn note_ghost_candidate(&mut self, id: Tupid) {
        if id.valid() {
            self.ghost_candidates.insert(id);
        }
    }

    /// Seeds the reaper with every ghost in the store.  Consistency-check
    /// tool; normal operation only ever visits candidates.
    pub fn add_all_ghost_candidates(&mut self) -> Result<usize, DbError> {
        let ids = self.nodes_by_type(NodeType::Ghost)?;
        let n = ids.len();
        for id in ids {
            self.ghost_candidates.insert(id);
        }
        Ok(n)
    }

    fn ghost_is_referenced(&self, id: Tupid) -> Result<bool, DbError> {
        let linked: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM link WHERE from_id=?1 OR to_id=?1 LIMIT 1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        if linked.is_some() {
            return Ok(true);
        }
        let var: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM var WHERE id=?1", [id], |row| row.get(0))
            .optional()?;
        if var.is_some() {
            return Ok(true);
        }
        for flag in Flag::ALL {
            if self.flag_contains(flag, id)? {
                return Ok(true);
            }
        }
        let children: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM node WHERE dir=?1 LIMIT 1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(children.is_some())
    }

    /// Deletes every candidate ghost that lost its last reference.  Only
    /// visits the candidate set, never the whole table.
    fn reap_ghosts(&mut self) -> Result<(), DbError> {
        let mut queue: Vec<Tupid> = self.ghost_candidates.drain().collect();
        queue.sort();
        while let Some(id) = queue.pop() {
            let e = match self.get_or_load(id) {
                Ok(e) => e,
                Err(DbError::NotFound { .. }) => continue,
                Err(err) => return Err(err),
            };
            if e.ntype != NodeType::Ghost {
                continue;
            }
            if self.ghost_is_referenced(id)? {
                continue;
            }
            tracing::debug!(id = id.0, name = %e.name, "reap ghost");
            self.conn.execute("DELETE FROM node WHERE id=?1", [id])?;
            self.cache.remove(id);
            // The parent may have been kept alive only by this child.
            if e.parent.valid() && !is_virtual(e.parent) && e.parent != DOT_DT {
                queue.push(e.parent);
            }
        }
        Ok(())
    }

    /// True when any of the named flag sets is non-empty.
    pub fn check_flags(&self, set: FlagSet) -> Result<bool, DbError> {
        for flag in set.iter() {
            let any: Option<i64> = self
                .conn
                .query_row(
                    &format!("SELECT 1 FROM {} LIMIT 1", flag.table()),
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            if any.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ---- scan bracket ---------------------------------------------------------

/// Observations accumulated between `scan_begin` and `scan_end`.  Flag
/// effects are deferred: nothing seen during the bracket is flagged until
/// the end reconciles observed against known in one batch.
#[derive(Default)]
pub struct Scan {
    seen: HashSet<Tupid>,
    created: Vec<Tupid>,
    modified: Vec<Tupid>,
    deleted: Vec<Tupid>,
}

impl Db {
    /// Opens the scan bracket; the scan runs inside its own transaction.
    pub fn scan_begin(&mut self) -> Result<Scan, DbError> {
        self.begin()?;
        Ok(Scan::default())
    }

    /// Records one path the scanner saw.  Creates or promotes the node as
    /// needed but defers all flagging to `scan_end`.
    pub fn note_existing(
        &mut self,
        scan: &mut Scan,
        parent: Tupid,
        name: &str,
        ntype: NodeType,
        mtime: Mtime,
    ) -> Result<Tupid, DbError> {
        let id = match self.lookup(parent, name)? {
            None => {
                let e = self.node_insert(parent, name, ntype, mtime, Tupid::NONE)?;
                scan.created.push(e.id);
                e.id
            }
            Some(e) if e.ntype == NodeType::Ghost => {
                self.retype(e.id, ntype)?;
                self.set_mtime(e.id, mtime)?;
                scan.created.push(e.id);
                e.id
            }
            Some(e) if e.ntype.is_dir() != ntype.is_dir() => {
                // A file replaced a directory (or vice versa); there is no
                // useful history to keep.
                self.remove_node(e.id, true)?;
                let e = self.node_insert(parent, name, ntype, mtime, Tupid::NONE)?;
                scan.created.push(e.id);
                e.id
            }
            Some(e) => {
                if e.mtime != mtime {
                    self.set_mtime(e.id, mtime)?;
                    scan.modified.push(e.id);
                }
                e.id
            }
        };
        scan.seen.insert(id);
        Ok(id)
    }

    /// Records a path the monitor reported as gone.
    pub fn note_deleted(&mut self, scan: &mut Scan, id: Tupid) {
        scan.deleted.push(id);
    }

    /// Closes the bracket: diffs observed against known and applies all
    /// create/modify/delete effects in one batch, then commits.
    pub fn scan_end(&mut self, scan: Scan) -> Result<(), DbError> {
        // On-disk nodes the scanner did not report are gone.  The reserved
        // roots and the virtual subtrees are not scannable.
        let mut stmt = self.conn.prepare(
            "SELECT id FROM node WHERE type IN (?1, ?2) AND dir NOT IN (?3, ?4) AND id > ?5",
        )?;
        let known: Vec<Tupid> = stmt
            .query_map(
                rusqlite::params![
                    NodeType::File.to_int(),
                    NodeType::Dir.to_int(),
                    ENV_DT,
                    EXCLUSION_DT,
                    EXCLUSION_DT
                ],
                |row| row.get(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut gone: Vec<Tupid> = known
            .into_iter()
            .filter(|id| !scan.seen.contains(id))
            .collect();
        gone.extend(scan.deleted.iter().copied());
        gone.sort();
        gone.dedup();
        for id in gone {
            self.path_vanished(id)?;
        }

        for id in scan.created {
            let e = match self.get_or_load(id) {
                Ok(e) => e,
                Err(DbError::NotFound { .. }) => continue,
                Err(err) => return Err(err),
            };
            if e.ntype.is_dir() {
                self.flag_maybe_add(Flag::Create, id)?;
            } else {
                // A new file can change what a directory's rules match.
                self.flag_maybe_add(Flag::Create, e.parent)?;
                self.modify_cmds_by_input(id)?;
            }
            if e.name == TUP_CONFIG {
                self.flag_maybe_add(Flag::Config, id)?;
            }
        }

        for id in scan.modified {
            let e = self.get_or_load(id)?;
            if e.ntype.is_dir() {
                self.flag_maybe_add(Flag::Create, id)?;
            } else {
                self.flag_maybe_add(Flag::Modify, id)?;
                self.modify_cmds_by_input(id)?;
            }
            if e.name == TUP_CONFIG {
                self.flag_maybe_add(Flag::Config, id)?;
            }
        }

        self.commit()
    }

    /// A path disappeared from disk.  Still-referenced nodes demote to
    /// ghosts so their readers keep something to point at; unreferenced
    /// ones are removed outright.
    fn path_vanished(&mut self, id: Tupid) -> Result<(), DbError> {
        let e = match self.get_or_load(id) {
            Ok(e) => e,
            Err(DbError::NotFound { .. }) => return Ok(()),
            Err(err) => return Err(err),
        };
        if e.parent.valid() {
            self.flag_maybe_add(Flag::Create, e.parent)?;
        }
        self.modify_cmds_by_input(id)?;
        if self.ghost_is_referenced(id)? {
            self.retype(id, NodeType::Ghost)?;
            self.set_mtime(id, Mtime::Unknown)?;
            self.note_ghost_candidate(id);
        } else {
            self.remove_node(id, true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_seeds_reserved_rows() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let root = db.get_or_load(DOT_DT)?;
        assert_eq!(root.name, ".");
        assert_eq!(root.ntype, NodeType::Dir);
        assert_eq!(db.get_or_load(ENV_DT)?.name, "<environ>");
        assert_eq!(db.get_or_load(EXCLUSION_DT)?.name, "<exclusions>");
        db.commit()?;
        Ok(())
    }

    #[test]
    fn nested_begin_is_an_error() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        assert!(matches!(db.begin(), Err(DbError::NestedTransaction)));
        db.rollback()?;
        Ok(())
    }

    #[test]
    fn rollback_restores_store_and_cache() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let a = db.node_insert(DOT_DT, "a.c", NodeType::File, Mtime::Unknown, Tupid::NONE)?;
        db.commit()?;

        db.begin()?;
        db.change_node(a.id, DOT_DT, "b.c")?;
        let extra = db.node_insert(DOT_DT, "extra", NodeType::File, Mtime::Unknown, Tupid::NONE)?;
        db.rollback()?;

        db.begin()?;
        assert_eq!(db.lookup(DOT_DT, "a.c")?.map(|e| e.id), Some(a.id));
        assert!(db.lookup(DOT_DT, "b.c")?.is_none());
        assert!(matches!(
            db.get_or_load(extra.id),
            Err(DbError::NotFound { .. })
        ));
        db.commit()?;
        Ok(())
    }

    #[test]
    fn changes_counts_transaction_rows() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        assert_eq!(db.changes()?, 0);
        db.node_insert(DOT_DT, "a.c", NodeType::File, Mtime::Unknown, Tupid::NONE)?;
        assert!(db.changes()? > 0);
        db.commit()?;
        Ok(())
    }

    #[test]
    fn config_roundtrip() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        assert_eq!(db.config_get_int("keep_going", 7)?, 7);
        db.config_set_int("keep_going", 1)?;
        assert_eq!(db.config_get_int("keep_going", 7)?, 1);
        db.commit()?;
        Ok(())
    }

    #[test]
    fn scan_flags_new_and_modified_files() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        let mut scan = db.scan_begin()?;
        let sub = db.note_existing(
            &mut scan,
            DOT_DT,
            "sub",
            NodeType::Dir,
            Mtime::Known { sec: 1, nsec: 0 },
        )?;
        let a = db.note_existing(
            &mut scan,
            sub,
            "a.c",
            NodeType::File,
            Mtime::Known { sec: 5, nsec: 0 },
        )?;
        db.scan_end(scan)?;

        db.begin()?;
        assert!(db.flag_contains(Flag::Create, sub)?);
        assert!(!db.flag_contains(Flag::Modify, a)?);
        db.commit()?;

        // Second scan: a.c changed, sub unchanged.
        let mut scan = db.scan_begin()?;
        db.note_existing(
            &mut scan,
            DOT_DT,
            "sub",
            NodeType::Dir,
            Mtime::Known { sec: 1, nsec: 0 },
        )?;
        db.note_existing(
            &mut scan,
            sub,
            "a.c",
            NodeType::File,
            Mtime::Known { sec: 9, nsec: 0 },
        )?;
        db.scan_end(scan)?;

        db.begin()?;
        assert!(db.flag_contains(Flag::Modify, a)?);
        db.commit()?;
        Ok(())
    }

    #[test]
    fn scan_removes_vanished_files() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        let mut scan = db.scan_begin()?;
        let a = db.note_existing(
            &mut scan,
            DOT_DT,
            "a.c",
            NodeType::File,
            Mtime::Known { sec: 5, nsec: 0 },
        )?;
        db.scan_end(scan)?;

        let scan = db.scan_begin()?;
        db.scan_end(scan)?;

        db.begin()?;
        assert!(matches!(db.get_or_load(a), Err(DbError::NotFound { .. })));
        db.commit()?;
        Ok(())
    }
}
