//! Node types and the in-memory entry cache: the canonical mapping from id
//! to entry record, with a parent+name index for sibling lookup.

use crate::db::{Db, DbError};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::OptionalExtension;
use std::collections::HashMap;
use std::fmt;

/// Stable node identifier, allocated monotonically and never reused.
/// 0 means "no node" (the parent of virtual roots, or an unset srcid).
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Tupid(pub i64);

impl Tupid {
    pub const NONE: Tupid = Tupid(0);

    pub fn valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Tupid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl ToSql for Tupid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Tupid {
    fn column_result(value: ValueRef) -> FromSqlResult<Self> {
        i64::column_result(value).map(Tupid)
    }
}

/// Project root directory (`.`).
pub const DOT_DT: Tupid = Tupid(1);
/// Virtual directory holding environment-variable nodes.
pub const ENV_DT: Tupid = Tupid(2);
/// Virtual directory holding exclusion patterns.
pub const EXCLUSION_DT: Tupid = Tupid(3);

/// True for the reserved roots that never correspond to on-disk paths.
pub fn is_virtual(id: Tupid) -> bool {
    id == ENV_DT || id == EXCLUSION_DT
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NodeType {
    File = 0,
    Dir = 1,
    Command = 2,
    GeneratedFile = 3,
    GeneratedDir = 4,
    Ghost = 5,
    Var = 6,
    Group = 7,
}

impl NodeType {
    pub fn to_int(self) -> i64 {
        self as i64
    }

    pub fn from_int(n: i64) -> Option<NodeType> {
        Some(match n {
            0 => NodeType::File,
            1 => NodeType::Dir,
            2 => NodeType::Command,
            3 => NodeType::GeneratedFile,
            4 => NodeType::GeneratedDir,
            5 => NodeType::Ghost,
            6 => NodeType::Var,
            7 => NodeType::Group,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::File => "file",
            NodeType::Dir => "dir",
            NodeType::Command => "command",
            NodeType::GeneratedFile => "generated file",
            NodeType::GeneratedDir => "generated dir",
            NodeType::Ghost => "ghost",
            NodeType::Var => "var",
            NodeType::Group => "group",
        }
    }

    pub fn is_dir(self) -> bool {
        matches!(self, NodeType::Dir | NodeType::GeneratedDir)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filesystem modification time.  Unknown covers nodes we have never
/// stat()ed (ghosts, commands); External marks directories outside the
/// project root that we track but do not scan.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mtime {
    Known { sec: i64, nsec: i32 },
    Unknown,
    External,
}

impl Mtime {
    pub fn encode(self) -> (i64, i32) {
        match self {
            Mtime::Known { sec, nsec } => (sec, nsec),
            Mtime::Unknown => (-1, 0),
            Mtime::External => (-2, 0),
        }
    }

    pub fn decode(sec: i64, nsec: i32) -> Mtime {
        match sec {
            -1 => Mtime::Unknown,
            -2 => Mtime::External,
            _ => Mtime::Known { sec, nsec },
        }
    }
}

/// One addressable object: file, directory, command, variable, group, or
/// ghost.  Plain data only; neighbours are looked up through the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: Tupid,
    pub parent: Tupid,
    pub name: String,
    pub ntype: NodeType,
    pub mtime: Mtime,
    pub srcid: Tupid,
    pub display: Option<String>,
    pub flags: Option<String>,
}

impl Entry {
    /// The label shown in graphs and command output.
    pub fn label(&self) -> &str {
        self.display.as_deref().unwrap_or(&self.name)
    }
}

enum CacheOp {
    Inserted(Tupid),
    Replaced(Entry),
    Removed(Entry),
}

/// In-memory entry table.  Authoritative within a transaction; an undo
/// journal lets rollback restore the pre-transaction view.
#[derive(Default)]
pub struct EntryCache {
    entries: HashMap<Tupid, Entry>,
    children: HashMap<(Tupid, String), Tupid>,
    journal: Vec<CacheOp>,
    journaling: bool,
}

impl EntryCache {
    pub fn new() -> EntryCache {
        EntryCache::default()
    }

    pub fn get(&self, id: Tupid) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn child(&self, parent: Tupid, name: &str) -> Option<Tupid> {
        self.children.get(&(parent, name.to_owned())).copied()
    }

    pub fn insert(&mut self, e: Entry) {
        if self.journaling {
            match self.entries.get(&e.id) {
                Some(old) => self.journal.push(CacheOp::Replaced(old.clone())),
                None => self.journal.push(CacheOp::Inserted(e.id)),
            }
        }
        self.insert_raw(e);
    }

    fn insert_raw(&mut self, e: Entry) {
        if let Some(old) = self.entries.remove(&e.id) {
            self.children.remove(&(old.parent, old.name));
        }
        self.children.insert((e.parent, e.name.clone()), e.id);
        self.entries.insert(e.id, e);
    }

    pub fn remove(&mut self, id: Tupid) {
        if let Some(e) = self.entries.remove(&id) {
            self.children.remove(&(e.parent, e.name.clone()));
            if self.journaling {
                self.journal.push(CacheOp::Removed(e));
            }
        }
    }

    /// Loads without journaling: the entry already exists in the store, so
    /// rollback must keep it cached rather than dropping it.
    pub fn load(&mut self, e: Entry) {
        self.insert_raw(e);
    }

    pub fn begin(&mut self) {
        self.journal.clear();
        self.journaling = true;
    }

    pub fn commit(&mut self) {
        self.journal.clear();
        self.journaling = false;
    }

    /// Reconciles the cache with the store after a rollback: entries created
    /// in memory are dropped, mutated fields revert.
    pub fn rollback(&mut self) {
        while let Some(op) = self.journal.pop() {
            match op {
                CacheOp::Inserted(id) => {
                    if let Some(e) = self.entries.remove(&id) {
                        self.children.remove(&(e.parent, e.name));
                    }
                }
                CacheOp::Replaced(e) | CacheOp::Removed(e) => self.insert_raw(e),
            }
        }
        self.journaling = false;
    }
}

fn entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<Entry> {
    let ntype: i64 = row.get(3)?;
    let sec: i64 = row.get(4)?;
    let nsec: i32 = row.get(5)?;
    Ok(Entry {
        id: row.get(0)?,
        parent: row.get(1)?,
        name: row.get(2)?,
        ntype: NodeType::from_int(ntype).unwrap_or(NodeType::Ghost),
        mtime: Mtime::decode(sec, nsec),
        srcid: row.get(6)?,
        display: row.get(7)?,
        flags: row.get(8)?,
    })
}

const ENTRY_COLS: &str = "id, dir, name, type, mtime_sec, mtime_nsec, srcid, display, flags";

impl Db {
    /// Returns the cached entry, loading from the store on miss.
    pub fn get_or_load(&mut self, id: Tupid) -> Result<Entry, DbError> {
        if let Some(e) = self.cache.get(id) {
            return Ok(e.clone());
        }
        let e = self
            .conn
            .query_row(
                &format!("SELECT {} FROM node WHERE id=?1", ENTRY_COLS),
                [id],
                entry_from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound { id })?;
        self.cache.load(e.clone());
        Ok(e)
    }

    /// Sibling lookup by exact name.  Returns None when absent.
    pub fn lookup(&mut self, parent: Tupid, name: &str) -> Result<Option<Entry>, DbError> {
        if let Some(id) = self.cache.child(parent, name) {
            return Ok(Some(self.get_or_load(id)?));
        }
        let e = self
            .conn
            .query_row(
                &format!("SELECT {} FROM node WHERE dir=?1 AND name=?2", ENTRY_COLS),
                rusqlite::params![parent, name],
                entry_from_row,
            )
            .optional()?;
        if let Some(ref e) = e {
            self.cache.load(e.clone());
        }
        Ok(e)
    }

    /// Lookup on a length-limited prefix of `name`, for callers holding a
    /// larger path buffer.
    pub fn lookup_part(
        &mut self,
        parent: Tupid,
        name: &str,
        len: usize,
    ) -> Result<Option<Entry>, DbError> {
        self.lookup(parent, &name[..len])
    }

    /// Inserts a brand-new node.  Fails with NameTaken if a sibling with
    /// this name exists.
    pub fn node_insert(
        &mut self,
        parent: Tupid,
        name: &str,
        ntype: NodeType,
        mtime: Mtime,
        srcid: Tupid,
    ) -> Result<Entry, DbError> {
        if self.lookup(parent, name)?.is_some() {
            return Err(DbError::NameTaken {
                parent,
                name: name.to_owned(),
            });
        }
        let (sec, nsec) = mtime.encode();
        self.conn.execute(
            "INSERT INTO node (dir, type, name, mtime_sec, mtime_nsec, srcid) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![parent, ntype.to_int(), name, sec, nsec, srcid],
        )?;
        let e = Entry {
            id: Tupid(self.conn.last_insert_rowid()),
            parent,
            name: name.to_owned(),
            ntype,
            mtime,
            srcid,
            display: None,
            flags: None,
        };
        tracing::debug!(id = e.id.0, name, ntype = %ntype, "node insert");
        self.cache.insert(e.clone());
        Ok(e)
    }

    /// Parser-facing get-or-create.  Reuses an existing node when the type
    /// is compatible, promoting ghosts in place so that links pointing at
    /// them survive.  Returns the entry and whether anything changed.
    pub fn create_node(
        &mut self,
        parent: Tupid,
        name: &str,
        ntype: NodeType,
        srcid: Tupid,
    ) -> Result<(Entry, bool), DbError> {
        if let Some(e) = self.lookup(parent, name)? {
            if e.ntype == ntype {
                if e.srcid != srcid {
                    self.set_srcid(e.id, srcid)?;
                    return Ok((self.get_or_load(e.id)?, true));
                }
                return Ok((e, false));
            }
            if e.ntype == NodeType::Ghost {
                // A ghost is a promise: something referenced this name before
                // it existed.  Promote it and re-flag everything that reads it.
                self.retype(e.id, ntype)?;
                self.set_srcid(e.id, srcid)?;
                self.modify_cmds_by_input(e.id)?;
                return Ok((self.get_or_load(e.id)?, true));
            }
            if e.ntype == NodeType::GeneratedDir && ntype == NodeType::Dir {
                // A real directory appearing over a generated one wins.
                return Ok((e, false));
            }
            return Err(DbError::TypeMismatch {
                id: e.id,
                found: e.ntype,
                expected: ntype,
            });
        }
        let e = self.node_insert(parent, name, ntype, Mtime::Unknown, srcid)?;
        if ntype == NodeType::Dir {
            self.flag_add(crate::flags::Flag::Create, e.id)?;
        }
        Ok((e, true))
    }

    /// Moves a node to a new directory and/or name.
    pub fn change_node(
        &mut self,
        id: Tupid,
        new_parent: Tupid,
        new_name: &str,
    ) -> Result<(), DbError> {
        let old = self.get_or_load(id)?;
        if let Some(clash) = self.lookup(new_parent, new_name)? {
            if clash.id != id {
                return Err(DbError::NameTaken {
                    parent: new_parent,
                    name: new_name.to_owned(),
                });
            }
        }
        self.conn.execute(
            "UPDATE node SET dir=?1, name=?2 WHERE id=?3",
            rusqlite::params![new_parent, new_name, id],
        )?;
        let mut e = old;
        e.parent = new_parent;
        e.name = new_name.to_owned();
        self.cache.insert(e);
        Ok(())
    }

    pub fn retype(&mut self, id: Tupid, ntype: NodeType) -> Result<(), DbError> {
        let old = self.get_or_load(id)?;
        if old.ntype == NodeType::GeneratedDir && ntype == NodeType::Dir {
            // One-way within a commit; reverting is delete-and-recreate.
            return Err(DbError::Invariant(format!(
                "cannot revert generated dir {} to a normal dir",
                id
            )));
        }
        self.conn.execute(
            "UPDATE node SET type=?1 WHERE id=?2",
            rusqlite::params![ntype.to_int(), id],
        )?;
        let mut e = old;
        e.ntype = ntype;
        self.cache.insert(e);
        Ok(())
    }

    pub fn set_mtime(&mut self, id: Tupid, mtime: Mtime) -> Result<(), DbError> {
        let old = self.get_or_load(id)?;
        let (sec, nsec) = mtime.encode();
        self.conn.execute(
            "UPDATE node SET mtime_sec=?1, mtime_nsec=?2 WHERE id=?3",
            rusqlite::params![sec, nsec, id],
        )?;
        let mut e = old;
        e.mtime = mtime;
        self.cache.insert(e);
        Ok(())
    }

    pub fn set_display(&mut self, id: Tupid, display: Option<&str>) -> Result<(), DbError> {
        let old = self.get_or_load(id)?;
        self.conn.execute(
            "UPDATE node SET display=?1 WHERE id=?2",
            rusqlite::params![display, id],
        )?;
        let mut e = old;
        e.display = display.map(str::to_owned);
        self.cache.insert(e);
        Ok(())
    }

    pub fn set_flags(&mut self, id: Tupid, flags: Option<&str>) -> Result<(), DbError> {
        let old = self.get_or_load(id)?;
        self.conn.execute(
            "UPDATE node SET flags=?1 WHERE id=?2",
            rusqlite::params![flags, id],
        )?;
        let mut e = old;
        e.flags = flags.map(str::to_owned);
        self.cache.insert(e);
        Ok(())
    }

    pub fn set_srcid(&mut self, id: Tupid, srcid: Tupid) -> Result<(), DbError> {
        let old = self.get_or_load(id)?;
        self.conn.execute(
            "UPDATE node SET srcid=?1 WHERE id=?2",
            rusqlite::params![srcid, id],
        )?;
        let mut e = old;
        e.srcid = srcid;
        self.cache.insert(e);
        Ok(())
    }

    /// Marks a directory as generated.  The transition only runs when every
    /// remaining child is itself generated.
    pub fn dir_to_generated(&mut self, id: Tupid) -> Result<(), DbError> {
        let e = self.get_or_load(id)?;
        if e.ntype == NodeType::GeneratedDir {
            return Ok(());
        }
        if e.ntype != NodeType::Dir {
            return Err(DbError::TypeMismatch {
                id,
                found: e.ntype,
                expected: NodeType::Dir,
            });
        }
        let normal: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM node WHERE dir=?1 AND type NOT IN (?2, ?3, ?4)",
            rusqlite::params![
                id,
                NodeType::GeneratedFile.to_int(),
                NodeType::GeneratedDir.to_int(),
                NodeType::Ghost.to_int()
            ],
            |row| row.get(0),
        )?;
        if normal > 0 {
            return Err(DbError::Invariant(format!(
                "directory {} still has {} non-generated children",
                id, normal
            )));
        }
        self.retype(id, NodeType::GeneratedDir)
    }

    pub fn is_generated_dir(&mut self, id: Tupid) -> Result<bool, DbError> {
        Ok(self.get_or_load(id)?.ntype == NodeType::GeneratedDir)
    }

    /// Children of a directory, ascending by id.
    pub fn dir_entries(&mut self, dir: Tupid) -> Result<Vec<Entry>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM node WHERE dir=?1 ORDER BY id",
            ENTRY_COLS
        ))?;
        let rows = stmt
            .query_map([dir], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        for e in &rows {
            self.cache.load(e.clone());
        }
        Ok(rows)
    }

    /// All node ids of a given type, ascending.
    pub fn nodes_by_type(&mut self, ntype: NodeType) -> Result<Vec<Tupid>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM node WHERE type=?1 ORDER BY id")?;
        let ids = stmt
            .query_map([ntype.to_int()], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Removes a node.  A non-empty directory is only removed with `force`,
    /// which cascades to the whole subtree.  All incident links go too.
    pub fn remove_node(&mut self, id: Tupid, force: bool) -> Result<(), DbError> {
        let e = self.get_or_load(id)?;
        if e.ntype.is_dir() {
            let children = self.dir_entries(id)?;
            if !children.is_empty() {
                if !force {
                    return Err(DbError::DirNotEmpty { id });
                }
                for child in children {
                    self.remove_node(child.id, true)?;
                }
            }
        }
        self.delete_links(id)?;
        self.var_forget(id)?;
        self.flag_remove_all(id)?;
        self.conn.execute("DELETE FROM node WHERE id=?1", [id])?;
        tracing::debug!(id = id.0, name = %e.name, "node remove");
        self.cache.remove(id);
        Ok(())
    }

    /// Deletes a directory's contents.  The directory node itself stays so
    /// the parser can repopulate it.
    pub fn delete_dir(&mut self, dir: Tupid, force: bool) -> Result<(), DbError> {
        for child in self.dir_entries(dir)? {
            self.remove_node(child.id, force)?;
        }
        Ok(())
    }

    /// Root-relative display path, built by walking parents.
    pub fn path_of(&mut self, id: Tupid) -> Result<String, DbError> {
        let mut parts = Vec::new();
        let mut cur = id;
        while cur.valid() && cur != DOT_DT {
            let e = self.get_or_load(cur)?;
            parts.push(e.name.clone());
            cur = e.parent;
        }
        if parts.is_empty() {
            return Ok(".".to_owned());
        }
        parts.reverse();
        Ok(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtime_roundtrip() {
        for m in [
            Mtime::Known { sec: 100, nsec: 5 },
            Mtime::Unknown,
            Mtime::External,
        ] {
            let (sec, nsec) = m.encode();
            assert_eq!(Mtime::decode(sec, nsec), m);
        }
    }

    #[test]
    fn generated_dir_transition_is_one_way() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let sub = db
            .node_insert(DOT_DT, "out", NodeType::Dir, Mtime::Unknown, Tupid::NONE)?
            .id;
        let obj = db
            .node_insert(sub, "a.o", NodeType::GeneratedFile, Mtime::Unknown, Tupid::NONE)?
            .id;
        db.dir_to_generated(sub)?;
        assert!(db.is_generated_dir(sub)?);
        assert!(matches!(
            db.retype(sub, NodeType::Dir),
            Err(DbError::Invariant(_))
        ));

        // A directory with a plain file in it cannot become generated.
        let src = db
            .node_insert(DOT_DT, "src", NodeType::Dir, Mtime::Unknown, Tupid::NONE)?
            .id;
        db.node_insert(src, "a.c", NodeType::File, Mtime::Unknown, Tupid::NONE)?;
        assert!(matches!(
            db.dir_to_generated(src),
            Err(DbError::Invariant(_))
        ));
        let _ = obj;
        db.rollback()?;
        Ok(())
    }

    #[test]
    fn non_empty_dir_needs_force_to_remove() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let sub = db
            .node_insert(DOT_DT, "sub", NodeType::Dir, Mtime::Unknown, Tupid::NONE)?
            .id;
        let a = db
            .node_insert(sub, "a.c", NodeType::File, Mtime::Unknown, Tupid::NONE)?
            .id;
        assert!(matches!(
            db.remove_node(sub, false),
            Err(DbError::DirNotEmpty { .. })
        ));
        db.remove_node(sub, true)?;
        assert!(matches!(db.get_or_load(a), Err(DbError::NotFound { .. })));
        assert!(db.lookup(DOT_DT, "sub")?.is_none());
        db.rollback()?;
        Ok(())
    }

    #[test]
    fn path_of_walks_parents() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let sub = db
            .node_insert(DOT_DT, "src", NodeType::Dir, Mtime::Unknown, Tupid::NONE)?
            .id;
        let a = db
            .node_insert(sub, "a.c", NodeType::File, Mtime::Unknown, Tupid::NONE)?
            .id;
        assert_eq!(db.path_of(a)?, "src/a.c");
        assert_eq!(db.path_of(DOT_DT)?, ".");
        db.rollback()?;
        Ok(())
    }

    #[test]
    fn cache_rollback_drops_new_entries() {
        let mut cache = EntryCache::new();
        let a = Entry {
            id: Tupid(10),
            parent: DOT_DT,
            name: "a.c".to_owned(),
            ntype: NodeType::File,
            mtime: Mtime::Unknown,
            srcid: Tupid::NONE,
            display: None,
            flags: None,
        };
        cache.load(a.clone());
        cache.begin();
        let mut a2 = a.clone();
        a2.name = "b.c".to_owned();
        cache.insert(a2);
        cache.insert(Entry {
            id: Tupid(11),
            parent: DOT_DT,
            name: "new".to_owned(),
            ntype: NodeType::File,
            mtime: Mtime::Unknown,
            srcid: Tupid::NONE,
            display: None,
            flags: None,
        });
        cache.rollback();
        assert_eq!(cache.get(Tupid(10)).unwrap().name, "a.c");
        assert!(cache.get(Tupid(11)).is_none());
        assert_eq!(cache.child(DOT_DT, "a.c"), Some(Tupid(10)));
        assert_eq!(cache.child(DOT_DT, "b.c"), None);
    }
}
