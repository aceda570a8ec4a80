//! Typed directed edges between nodes.  Sticky links come from the parser,
//! normal links from observed reads, group links tie commands to their
//! group aggregators.

use crate::db::{Db, DbError};
use crate::entry::{Entry, NodeType, Tupid, EXCLUSION_DT};
use rusqlite::OptionalExtension;
use std::collections::BTreeSet;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LinkStyle {
    /// Observed at runtime: the sandbox saw the command read this node.
    Normal = 0,
    /// Declared by the author in a rule.
    Sticky = 1,
    /// Connects a command to a group aggregator.
    Group = 2,
}

impl LinkStyle {
    pub fn to_int(self) -> i64 {
        self as i64
    }

    pub fn from_int(n: i64) -> Option<LinkStyle> {
        Some(match n {
            0 => LinkStyle::Normal,
            1 => LinkStyle::Sticky,
            2 => LinkStyle::Group,
            _ => return None,
        })
    }
}

/// A command's incoming dependency sets, split by how we learned of them.
#[derive(Debug, Default, PartialEq)]
pub struct InputSets {
    pub sticky: BTreeSet<Tupid>,
    pub normal: BTreeSet<Tupid>,
    pub group_sticky: BTreeSet<Tupid>,
}

/// A command's outgoing sets: real outputs, exclusion patterns, and the
/// group it publishes into.
#[derive(Debug, Default)]
pub struct OutputSets {
    pub outputs: BTreeSet<Tupid>,
    pub exclusions: BTreeSet<Tupid>,
    pub group: Option<Tupid>,
}

impl Db {
    /// Inserts an edge; duplicate `(from, to, style)` rows are suppressed.
    /// Returns whether the edge was newly inserted.
    pub fn create_link(&mut self, a: Tupid, b: Tupid, style: LinkStyle) -> Result<bool, DbError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO link (from_id, to_id, style) VALUES (?1, ?2, ?3)",
            rusqlite::params![a, b, style.to_int()],
        )?;
        Ok(self.last_changes()? > 0)
    }

    /// Creates the producing edge `cmdid -> output`, asserting that no
    /// other command already writes the output.
    pub fn create_unique_link(&mut self, cmdid: Tupid, output: Tupid) -> Result<(), DbError> {
        let existing: Option<Tupid> = self
            .conn
            .query_row(
                "SELECT link.from_id FROM link JOIN node ON node.id = link.from_id \
                 WHERE link.to_id = ?1 AND node.type = ?2 AND link.from_id != ?3 LIMIT 1",
                rusqlite::params![output, NodeType::Command.to_int(), cmdid],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(first) = existing {
            return Err(DbError::MultipleProducers {
                output,
                first,
                second: cmdid,
            });
        }
        self.create_link(cmdid, output, LinkStyle::Normal)?;
        Ok(())
    }

    pub fn link_exists(&self, a: Tupid, b: Tupid, style: LinkStyle) -> Result<bool, DbError> {
        let hit: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM link WHERE from_id=?1 AND to_id=?2 AND style=?3",
                rusqlite::params![a, b, style.to_int()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    /// The command that produces `b`, if any.  Generated files have exactly
    /// one; everything else has none.
    pub fn incoming_link(&mut self, b: Tupid) -> Result<Option<Entry>, DbError> {
        let id: Option<Tupid> = self
            .conn
            .query_row(
                "SELECT link.from_id FROM link JOIN node ON node.id = link.from_id \
                 WHERE link.to_id = ?1 AND node.type = ?2 LIMIT 1",
                rusqlite::params![b, NodeType::Command.to_int()],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => self.get_or_load(id).map(Some),
            None => Ok(None),
        }
    }

    /// Targets of `a`'s outgoing edges of one style, ascending by id.
    pub fn outgoing(&mut self, a: Tupid, style: LinkStyle) -> Result<Vec<Entry>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT to_id FROM link WHERE from_id=?1 AND style=?2 ORDER BY to_id")?;
        let ids: Vec<Tupid> = stmt
            .query_map(rusqlite::params![a, style.to_int()], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        ids.into_iter().map(|id| self.get_or_load(id)).collect()
    }

    /// Sources of `a`'s incoming edges of one style, ascending by id.
    pub fn incoming_by_style(&mut self, a: Tupid, style: LinkStyle) -> Result<Vec<Entry>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT from_id FROM link WHERE to_id=?1 AND style=?2 ORDER BY from_id")?;
        let ids: Vec<Tupid> = stmt
            .query_map(rusqlite::params![a, style.to_int()], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        ids.into_iter().map(|id| self.get_or_load(id)).collect()
    }

    /// Every command publishing into a group, with duplicates.
    pub fn by_group(&mut self, group: Tupid) -> Result<Vec<Entry>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT from_id FROM link WHERE to_id=?1 AND style=?2 ORDER BY from_id",
        )?;
        let ids: Vec<Tupid> = stmt
            .query_map(rusqlite::params![group, LinkStyle::Group.to_int()], |row| {
                row.get(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        ids.into_iter().map(|id| self.get_or_load(id)).collect()
    }

    /// Commands publishing into a group, deduplicated.  This is the fan-out
    /// a group consumer expands through.
    pub fn distinct_group_targets(&mut self, group: Tupid) -> Result<Vec<Entry>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT from_id FROM link WHERE to_id=?1 AND style=?2 ORDER BY from_id",
        )?;
        let ids: Vec<Tupid> = stmt
            .query_map(rusqlite::params![group, LinkStyle::Group.to_int()], |row| {
                row.get(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        ids.into_iter().map(|id| self.get_or_load(id)).collect()
    }

    /// Removes every edge incident to `id`.  The nodes on the far end may
    /// have just lost their last reference, so they become reap candidates.
    pub fn delete_links(&mut self, id: Tupid) -> Result<(), DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT from_id, to_id FROM link WHERE from_id=?1 OR to_id=?1",
        )?;
        let pairs: Vec<(Tupid, Tupid)> = stmt
            .query_map([id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        self.conn.execute(
            "DELETE FROM link WHERE from_id=?1 OR to_id=?1",
            [id],
        )?;
        for (from, to) in pairs {
            let other = if from == id { to } else { from };
            self.note_ghost_candidate(other);
        }
        Ok(())
    }

    /// Removes one edge.  Returns whether it existed.
    pub fn delete_link(&mut self, a: Tupid, b: Tupid, style: LinkStyle) -> Result<bool, DbError> {
        self.conn.execute(
            "DELETE FROM link WHERE from_id=?1 AND to_id=?2 AND style=?3",
            rusqlite::params![a, b, style.to_int()],
        )?;
        let removed = self.last_changes()? > 0;
        if removed {
            self.note_ghost_candidate(a);
            self.note_ghost_candidate(b);
        }
        Ok(removed)
    }

    /// A command's declared and observed input sets.
    pub fn get_inputs(&mut self, cmdid: Tupid) -> Result<InputSets, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT link.from_id, link.style, node.type FROM link \
             JOIN node ON node.id = link.from_id \
             WHERE link.to_id = ?1 ORDER BY link.from_id",
        )?;
        let rows: Vec<(Tupid, i64, i64)> = stmt
            .query_map([cmdid], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        let mut sets = InputSets::default();
        for (from, style, ntype) in rows {
            match LinkStyle::from_int(style) {
                Some(LinkStyle::Normal) => {
                    sets.normal.insert(from);
                }
                Some(LinkStyle::Sticky) => {
                    if NodeType::from_int(ntype) == Some(NodeType::Group) {
                        sets.group_sticky.insert(from);
                    } else {
                        sets.sticky.insert(from);
                    }
                }
                _ => {}
            }
        }
        Ok(sets)
    }

    /// A command's declared output sets.
    pub fn get_outputs(&mut self, cmdid: Tupid) -> Result<OutputSets, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT link.to_id, link.style, node.type, node.dir FROM link \
             JOIN node ON node.id = link.to_id \
             WHERE link.from_id = ?1 ORDER BY link.to_id",
        )?;
        let rows: Vec<(Tupid, i64, i64, Tupid)> = stmt
            .query_map([cmdid], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        let mut sets = OutputSets::default();
        for (to, style, ntype, dir) in rows {
            if LinkStyle::from_int(style) == Some(LinkStyle::Group)
                || NodeType::from_int(ntype) == Some(NodeType::Group)
            {
                sets.group = Some(to);
            } else if dir == EXCLUSION_DT {
                sets.exclusions.insert(to);
            } else {
                sets.outputs.insert(to);
            }
        }
        Ok(sets)
    }
}

/// Everything the parser declares about one command.  `create_command`
/// reconciles the store with this in a single pass.
#[derive(Debug, Default)]
pub struct CommandSpec<'a> {
    pub dir: Tupid,
    pub name: &'a str,
    pub display: Option<&'a str>,
    pub flags: Option<&'a str>,
    /// Sticky inputs, file or group nodes.
    pub inputs: &'a [Tupid],
    pub outputs: &'a [Tupid],
    /// Exclusion patterns, stored under the exclusion root.
    pub exclusions: &'a [&'a str],
    pub group: Option<Tupid>,
}

impl Db {
    /// True for sticky inputs the parser does not own: variables and
    /// environment entries, recorded by reads rather than declarations.
    fn is_variable_input(&mut self, id: Tupid) -> Result<bool, DbError> {
        let e = self.get_or_load(id)?;
        if e.ntype == NodeType::Var || e.parent == crate::entry::ENV_DT {
            return Ok(true);
        }
        if e.ntype == NodeType::Ghost {
            let parent = self.get_or_load(e.parent)?;
            return Ok(parent.name == crate::db::TUP_CONFIG);
        }
        Ok(false)
    }

    /// Allocates or reuses a command node and rewires its declared inputs,
    /// outputs, exclusions, and group to match the declaration.  Variable
    /// and environment edges recorded at read time are left alone.
    pub fn create_command(&mut self, spec: &CommandSpec) -> Result<Entry, DbError> {
        let (cmd, mut changed) =
            self.create_node(spec.dir, spec.name, NodeType::Command, Tupid::NONE)?;
        let cmdid = cmd.id;
        if cmd.display.as_deref() != spec.display {
            self.set_display(cmdid, spec.display)?;
            changed = true;
        }
        if cmd.flags.as_deref() != spec.flags {
            self.set_flags(cmdid, spec.flags)?;
            changed = true;
        }

        let old = self.get_inputs(cmdid)?;
        let want: BTreeSet<Tupid> = spec.inputs.iter().copied().collect();
        let mut old_sticky = old.sticky;
        old_sticky.extend(old.group_sticky.iter().copied());
        for &added in want.difference(&old_sticky) {
            self.create_link(added, cmdid, LinkStyle::Sticky)?;
            changed = true;
        }
        for &stale in old_sticky.difference(&want) {
            if self.is_variable_input(stale)? {
                continue;
            }
            self.delete_link(stale, cmdid, LinkStyle::Sticky)?;
            changed = true;
        }

        let old_out = self.get_outputs(cmdid)?;
        let want_out: BTreeSet<Tupid> = spec.outputs.iter().copied().collect();
        for &added in want_out.difference(&old_out.outputs) {
            self.create_unique_link(cmdid, added)?;
            changed = true;
        }
        for &stale in old_out.outputs.difference(&want_out) {
            // An output without its producer has no way to appear again.
            self.modify_cmds_by_input(stale)?;
            self.remove_node(stale, true)?;
            changed = true;
        }

        let mut want_excl = BTreeSet::new();
        for pattern in spec.exclusions {
            let (x, _) = self.create_node(EXCLUSION_DT, pattern, NodeType::File, Tupid::NONE)?;
            want_excl.insert(x.id);
            if !old_out.exclusions.contains(&x.id) {
                self.create_link(cmdid, x.id, LinkStyle::Sticky)?;
                changed = true;
            }
        }
        for &stale in old_out.exclusions.difference(&want_excl) {
            self.delete_link(cmdid, stale, LinkStyle::Sticky)?;
            changed = true;
        }

        if old_out.group != spec.group {
            if let Some(g) = old_out.group {
                self.delete_link(cmdid, g, LinkStyle::Group)?;
            }
            if let Some(g) = spec.group {
                self.create_link(cmdid, g, LinkStyle::Group)?;
            }
            changed = true;
        }

        if changed {
            self.flag_maybe_add(crate::flags::Flag::Modify, cmdid)?;
        }
        self.get_or_load(cmdid)
    }

    /// Deletes a command and the outputs only it could produce.
    pub fn delete_command(&mut self, cmdid: Tupid) -> Result<(), DbError> {
        let outs = self.get_outputs(cmdid)?;
        for &o in &outs.outputs {
            self.modify_cmds_by_input(o)?;
            self.remove_node(o, true)?;
        }
        self.remove_node(cmdid, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Mtime, DOT_DT};

    fn node(db: &mut Db, name: &str, ntype: NodeType) -> Entry {
        db.node_insert(DOT_DT, name, ntype, Mtime::Unknown, Tupid::NONE)
            .unwrap()
    }

    #[test]
    fn duplicate_links_are_suppressed() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let a = node(&mut db, "a.c", NodeType::File);
        let cc = node(&mut db, "cc a.c", NodeType::Command);
        assert!(db.create_link(a.id, cc.id, LinkStyle::Sticky)?);
        assert!(!db.create_link(a.id, cc.id, LinkStyle::Sticky)?);
        // Styles coexist on the same endpoints.
        assert!(db.create_link(a.id, cc.id, LinkStyle::Normal)?);
        assert!(db.link_exists(a.id, cc.id, LinkStyle::Sticky)?);
        assert!(!db.link_exists(cc.id, a.id, LinkStyle::Sticky)?);
        db.rollback()?;
        Ok(())
    }

    #[test]
    fn second_producer_is_rejected() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let out = node(&mut db, "main.o", NodeType::GeneratedFile);
        let cc1 = node(&mut db, "cc one", NodeType::Command);
        let cc2 = node(&mut db, "cc two", NodeType::Command);
        db.create_unique_link(cc1.id, out.id)?;
        match db.create_unique_link(cc2.id, out.id) {
            Err(DbError::MultipleProducers { output, first, second }) => {
                assert_eq!(output, out.id);
                assert_eq!(first, cc1.id);
                assert_eq!(second, cc2.id);
            }
            other => panic!("expected MultipleProducers, got {:?}", other.map(|_| ())),
        }
        // The first producer stays in place.
        assert_eq!(db.incoming_link(out.id)?.map(|e| e.id), Some(cc1.id));
        db.rollback()?;
        Ok(())
    }

    #[test]
    fn group_fanout_deduplicates() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let group = node(&mut db, "<objs>", NodeType::Group);
        let cc1 = node(&mut db, "cc one", NodeType::Command);
        let cc2 = node(&mut db, "cc two", NodeType::Command);
        db.create_link(cc1.id, group.id, LinkStyle::Group)?;
        db.create_link(cc2.id, group.id, LinkStyle::Group)?;
        db.create_link(cc2.id, group.id, LinkStyle::Group)?;
        let targets = db.distinct_group_targets(group.id)?;
        let ids: Vec<Tupid> = targets.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![cc1.id, cc2.id]);
        db.rollback()?;
        Ok(())
    }

    #[test]
    fn input_output_sets_split_by_style() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let a = node(&mut db, "a.c", NodeType::File);
        let h = node(&mut db, "a.h", NodeType::File);
        let group = node(&mut db, "<hdrs>", NodeType::Group);
        let cc = node(&mut db, "cc a.c", NodeType::Command);
        let out = node(&mut db, "a.o", NodeType::GeneratedFile);
        db.create_link(a.id, cc.id, LinkStyle::Sticky)?;
        db.create_link(h.id, cc.id, LinkStyle::Normal)?;
        db.create_link(group.id, cc.id, LinkStyle::Sticky)?;
        db.create_link(cc.id, out.id, LinkStyle::Normal)?;
        db.create_link(cc.id, group.id, LinkStyle::Group)?;

        let ins = db.get_inputs(cc.id)?;
        assert_eq!(ins.sticky.iter().copied().collect::<Vec<_>>(), vec![a.id]);
        assert_eq!(ins.normal.iter().copied().collect::<Vec<_>>(), vec![h.id]);
        assert_eq!(
            ins.group_sticky.iter().copied().collect::<Vec<_>>(),
            vec![group.id]
        );

        let outs = db.get_outputs(cc.id)?;
        assert_eq!(outs.outputs.iter().copied().collect::<Vec<_>>(), vec![out.id]);
        assert_eq!(outs.group, Some(group.id));
        db.rollback()?;
        Ok(())
    }

    #[test]
    fn create_command_rewires_declared_sets() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let a = node(&mut db, "a.c", NodeType::File);
        let b = node(&mut db, "b.c", NodeType::File);
        let a_o = node(&mut db, "a.o", NodeType::GeneratedFile);
        let b_o = node(&mut db, "b.o", NodeType::GeneratedFile);

        let cmd = db.create_command(&CommandSpec {
            dir: DOT_DT,
            name: "cc $(in)",
            display: Some("CC a.c"),
            inputs: &[a.id],
            outputs: &[a_o.id],
            ..Default::default()
        })?;
        assert!(db.link_exists(a.id, cmd.id, LinkStyle::Sticky)?);
        assert!(db.link_exists(cmd.id, a_o.id, LinkStyle::Normal)?);
        assert_eq!(cmd.display.as_deref(), Some("CC a.c"));
        assert!(db.flag_contains(crate::flags::Flag::Modify, cmd.id)?);

        // Re-parse with a different input and output set.
        let cmd2 = db.create_command(&CommandSpec {
            dir: DOT_DT,
            name: "cc $(in)",
            display: Some("CC b.c"),
            inputs: &[b.id],
            outputs: &[b_o.id],
            ..Default::default()
        })?;
        assert_eq!(cmd2.id, cmd.id);
        assert!(!db.link_exists(a.id, cmd.id, LinkStyle::Sticky)?);
        assert!(db.link_exists(b.id, cmd.id, LinkStyle::Sticky)?);
        // The orphaned output is gone entirely.
        assert!(db.lookup(DOT_DT, "a.o")?.is_none());
        assert!(db.link_exists(cmd.id, b_o.id, LinkStyle::Normal)?);
        db.rollback()?;
        Ok(())
    }

    #[test]
    fn variable_edges_survive_a_reparse() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let a = node(&mut db, "a.c", NodeType::File);
        let cmd = db.create_command(&CommandSpec {
            dir: DOT_DT,
            name: "cc $(CFLAGS) a.c",
            inputs: &[a.id],
            ..Default::default()
        })?;
        let variant = db.variant_for_root(DOT_DT, "")?;
        db.get_var(&variant, "CFLAGS", Some(cmd.id))?;
        let cflags = db.lookup(variant.config, "CFLAGS")?.unwrap();

        db.create_command(&CommandSpec {
            dir: DOT_DT,
            name: "cc $(CFLAGS) a.c",
            inputs: &[a.id],
            ..Default::default()
        })?;
        assert!(db.link_exists(cflags.id, cmd.id, LinkStyle::Sticky)?);
        db.rollback()?;
        Ok(())
    }

    #[test]
    fn delete_command_takes_its_outputs() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let a = node(&mut db, "a.c", NodeType::File);
        let a_o = node(&mut db, "a.o", NodeType::GeneratedFile);
        let cmd = db.create_command(&CommandSpec {
            dir: DOT_DT,
            name: "cc a.c",
            inputs: &[a.id],
            outputs: &[a_o.id],
            ..Default::default()
        })?;
        db.delete_command(cmd.id)?;
        assert!(db.lookup(DOT_DT, "a.o")?.is_none());
        assert!(db.lookup(DOT_DT, "cc a.c")?.is_none());
        // Sources are untouched.
        assert!(db.lookup(DOT_DT, "a.c")?.is_some());
        db.rollback()?;
        Ok(())
    }

    #[test]
    fn deleting_a_node_deletes_incident_links() -> Result<(), DbError> {
        let mut db = Db::open_memory()?;
        db.begin()?;
        let a = node(&mut db, "a.c", NodeType::File);
        let cc = node(&mut db, "cc a.c", NodeType::Command);
        db.create_link(a.id, cc.id, LinkStyle::Sticky)?;
        db.remove_node(a.id, false)?;
        assert!(!db.link_exists(a.id, cc.id, LinkStyle::Sticky)?);
        db.rollback()?;
        Ok(())
    }
}
