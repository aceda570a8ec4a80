//! Per-node flag sets driving the updater.  A node's membership in these
//! sets is what makes the next update pass revisit it.

use crate::db::{Db, DbError};
use crate::entry::{Entry, NodeType, Tupid};
use std::fmt;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Flag {
    /// Directories whose rules must be re-parsed.
    Create,
    /// Files and commands with changed content or inputs.
    Modify,
    /// tup.config entries whose variables must be re-read.
    Config,
    /// Variant directories needing regeneration.
    Variant,
    /// Outputs that may legitimately be missing from disk.
    Transient,
}

impl Flag {
    pub const ALL: [Flag; 5] = [
        Flag::Create,
        Flag::Modify,
        Flag::Config,
        Flag::Variant,
        Flag::Transient,
    ];

    pub fn table(self) -> &'static str {
        match self {
            Flag::Create => "create_list",
            Flag::Modify => "modify_list",
            Flag::Config => "config_list",
            Flag::Variant => "variant_list",
            Flag::Transient => "transient_list",
        }
    }

    fn mask(self) -> u8 {
        match self {
            Flag::Create => 1 << 0,
            Flag::Modify => 1 << 1,
            Flag::Config => 1 << 2,
            Flag::Variant => 1 << 3,
            Flag::Transient => 1 << 4,
        }
    }

    /// Which node types may carry this flag.  `maybe_add` is a no-op for
    /// everything else; ghosts in particular never enter `modify`.
    fn allows(self, ntype: NodeType) -> bool {
        match self {
            Flag::Create => matches!(ntype, NodeType::Dir | NodeType::GeneratedDir),
            Flag::Modify => matches!(
                ntype,
                NodeType::File | NodeType::GeneratedFile | NodeType::Command
            ),
            Flag::Config => matches!(ntype, NodeType::File | NodeType::Ghost),
            Flag::Variant => matches!(ntype, NodeType::Dir),
            Flag::Transient => matches!(ntype, NodeType::File | NodeType::GeneratedFile),
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Flag::Create => "create",
            Flag::Modify => "modify",
            Flag::Config => "config",
            Flag::Variant => "variant",
            Flag::Transient => "transient",
        };
        f.write_str(s)
    }
}

/// A set of flag tags, with a compact encoding for persistence and
/// display.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct FlagSet(u8);

impl FlagSet {
    pub const EMPTY: FlagSet = FlagSet(0);

    pub fn of(flags: &[Flag]) -> FlagSet {
        let mut set = FlagSet::EMPTY;
        for &f in flags {
            set = set.with(f);
        }
        set
    }

    pub fn with(self, f: Flag) -> FlagSet {
        FlagSet(self.0 | f.mask())
    }

    pub fn contains(self, f: Flag) -> bool {
        self.0 & f.mask() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> FlagSet {
        let mut set = FlagSet::EMPTY;
        for f in Flag::ALL {
            if bits & f.mask() != 0 {
                set = set.with(f);
            }
        }
        set
    }

    pub fn iter(self) -> impl Iterator<Item = Flag> {
        Flag::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for flag in self.iter() {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{}", flag)?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Iterates one flag set.  The id list is snapshotted ascending when the
/// iterator is made; each id is re-checked for membership before it is
/// yielded, so deletions during iteration take effect and insertions
/// never appear.
pub struct FlagIter {
    flag: Flag,
    ids: Vec<Tupid>,
    next: usize,
}

impl FlagIter {
    pub fn next(&mut self, db: &mut Db) -> Result<Option<Entry>, DbError> {
        while self.next < self.ids.len() {
            let id = self.ids[self.next];
            self.next += 1;
            if !db.flag_contains(self.flag, id)? {
                continue;
            }
            return db.get_or_load(id).map(Some);
        }
        Ok(None)
    }
}

impl Db {
    pub fn flag_add(&mut self, flag: Flag, id: Tupid) -> Result<(), DbError> {
        self.conn.execute(
            &format!("INSERT OR IGNORE INTO {} (id) VALUES (?1)", flag.table()),
            [id],
        )?;
        Ok(())
    }

    /// Adds only when the node's type is allowed to carry the flag.
    /// Returns whether the flag is now set.
    pub fn flag_maybe_add(&mut self, flag: Flag, id: Tupid) -> Result<bool, DbError> {
        let e = self.get_or_load(id)?;
        if !flag.allows(e.ntype) {
            return Ok(false);
        }
        self.flag_add(flag, id)?;
        Ok(true)
    }

    pub fn flag_remove(&mut self, flag: Flag, id: Tupid) -> Result<(), DbError> {
        self.conn.execute(
            &format!("DELETE FROM {} WHERE id=?1", flag.table()),
            [id],
        )?;
        // Dropping the last flag can orphan a ghost.
        if let Ok(e) = self.get_or_load(id) {
            if e.ntype == NodeType::Ghost {
                self.note_ghost_candidate(id);
            }
        }
        Ok(())
    }

    pub(crate) fn flag_remove_all(&mut self, id: Tupid) -> Result<(), DbError> {
        for flag in Flag::ALL {
            self.conn.execute(
                &format!("DELETE FROM {} WHERE id=?1", flag.table()),
                [id],
            )?;
        }
        Ok(())
    }

    pub fn flag_contains(&self, flag: Flag, id: Tupid) -> Result<bool, DbError> {
        use rusqlite::OptionalExtension;
        let hit: Option<i64> = self
            .conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE id=?1", flag.table()),
                [id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    /// The full tag set a node currently carries.
    pub fn node_flags(&self, id: Tupid) -> Result<FlagSet, DbError> {
        let mut set = FlagSet::EMPTY;
        for flag in Flag::ALL {
            if self.flag_contains(flag, id)? {
                set = set.with(flag);
            }
        }
        Ok(set)
    }

    /// Snapshot of one flag set's ids, ascending.
    pub fn flag_ids(&self, flag: Flag) -> Result<Vec<Tupid>, DbError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM {} ORDER BY id", flag.table()))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn flag_iter(&self, flag: Flag) -> Result<FlagIter, DbError> {
        Ok(FlagIter {
            flag,
            ids: self.flag_ids(flag)?,
            next: 0,
        })
    }

    // ---- combo updates: single statements, not per-row loops -------------

    /// Flags every command that writes `output`.  Returns whether any
    /// command was newly flagged.
    pub fn modify_cmds_by_output(&mut self, output: Tupid) -> Result<bool, DbError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO modify_list \
             SELECT link.from_id FROM link JOIN node ON node.id = link.from_id \
             WHERE link.to_id = ?1 AND node.type = ?2",
            rusqlite::params![output, NodeType::Command.to_int()],
        )?;
        Ok(self.last_changes()? > 0)
    }

    /// Flags every command that reads `input`.
    pub fn modify_cmds_by_input(&mut self, input: Tupid) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO modify_list \
             SELECT link.to_id FROM link JOIN node ON node.id = link.to_id \
             WHERE link.from_id = ?1 AND node.type = ?2",
            rusqlite::params![input, NodeType::Command.to_int()],
        )?;
        Ok(())
    }

    /// Propagates a directory's create flag into the directories that
    /// depend on it.
    pub fn set_dependent_dir_flags(&mut self, id: Tupid) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO create_list \
             SELECT link.to_id FROM link JOIN node ON node.id = link.to_id \
             WHERE link.from_id = ?1 AND node.type IN (?2, ?3)",
            rusqlite::params![
                id,
                NodeType::Dir.to_int(),
                NodeType::GeneratedDir.to_int()
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Mtime, DOT_DT};

    fn file(db: &mut Db, name: &str) -> Entry {
        db.node_insert(DOT_DT, name, NodeType::File, Mtime::Unknown, Tupid::NONE)
            .unwrap()
    }

    #[test]
    fn flagset_encoding_roundtrip() {
        let set = FlagSet::of(&[Flag::Create, Flag::Transient]);
        assert_eq!(FlagSet::from_bits(set.bits()), set);
        assert!(set.contains(Flag::Create));
        assert!(!set.contains(Flag::Modify));
        assert_eq!(set.to_string(), "create|transient");
    }

    #[test]
    fn maybe_add_rejects_disallowed_types() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let ghost = db.node_insert(DOT_DT, "gone", NodeType::Ghost, Mtime::Unknown, Tupid::NONE)?;
        assert!(!db.flag_maybe_add(Flag::Modify, ghost.id)?);
        assert!(!db.flag_contains(Flag::Modify, ghost.id)?);
        let f = file(&mut db, "a.c");
        assert!(db.flag_maybe_add(Flag::Modify, f.id)?);
        db.rollback()?;
        Ok(())
    }

    #[test]
    fn iterator_sees_deletions_not_insertions() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let a = file(&mut db, "a.c");
        let b = file(&mut db, "b.c");
        let c = file(&mut db, "c.c");
        for id in [a.id, b.id, c.id] {
            db.flag_add(Flag::Modify, id)?;
        }

        let mut it = db.flag_iter(Flag::Modify)?;
        let first = it.next(&mut db)?.unwrap();
        assert_eq!(first.id, a.id);
        // Delete an unvisited member and insert a new one mid-iteration.
        db.flag_remove(Flag::Modify, b.id)?;
        let d = file(&mut db, "d.c");
        db.flag_add(Flag::Modify, d.id)?;

        let second = it.next(&mut db)?.unwrap();
        assert_eq!(second.id, c.id);
        assert!(it.next(&mut db)?.is_none());
        db.rollback()?;
        Ok(())
    }

    #[test]
    fn modify_cmds_by_input_flags_readers() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let a = file(&mut db, "a.c");
        let cc = db.node_insert(
            DOT_DT,
            "cc a.c",
            NodeType::Command,
            Mtime::Unknown,
            Tupid::NONE,
        )?;
        db.create_link(a.id, cc.id, crate::link::LinkStyle::Sticky)?;
        db.modify_cmds_by_input(a.id)?;
        assert!(db.flag_contains(Flag::Modify, cc.id)?);
        db.rollback()?;
        Ok(())
    }
}
