//! The @-variable database: per-variant scopes with ghost-on-miss reads,
//! plus the environment snapshot commands depend on.
//!
//! Dependency edges always run from the variable node into the command
//! that reads it, the same direction as file inputs, so the flag combos
//! in flags.rs cover variables for free.

use crate::db::{Db, DbError, TUP_CONFIG};
use crate::entry::{Entry, Mtime, NodeType, Tupid, DOT_DT, ENV_DT};
use crate::link::LinkStyle;
use rusqlite::OptionalExtension;
use std::path::Path;

/// An alternate build scope: `build-<name>/` with its own tup.config.
/// The in-tree build is the variant rooted at `.`.
#[derive(Debug, Clone)]
pub struct Variant {
    pub name: String,
    pub root: Tupid,
    pub config: Tupid,
}

impl Db {
    fn var_value(&self, id: Tupid) -> Result<Option<String>, DbError> {
        Ok(self
            .conn
            .query_row("SELECT value FROM var WHERE id=?1", [id], |row| row.get(0))
            .optional()?)
    }

    pub(crate) fn var_forget(&mut self, id: Tupid) -> Result<(), DbError> {
        self.conn.execute("DELETE FROM var WHERE id=?1", [id])?;
        Ok(())
    }

    /// The tup.config node for a build root, as a ghost when the file does
    /// not exist yet, so reads of it survive until it appears.
    pub fn tup_config_node(&mut self, root: Tupid) -> Result<Entry, DbError> {
        if let Some(e) = self.lookup(root, TUP_CONFIG)? {
            return Ok(e);
        }
        let e = self.node_insert(root, TUP_CONFIG, NodeType::Ghost, Mtime::Unknown, Tupid::NONE)?;
        self.note_ghost_candidate(e.id);
        Ok(e)
    }

    /// The variant anchored at a build root directory.
    pub fn variant_for_root(&mut self, root: Tupid, name: &str) -> Result<Variant, DbError> {
        let config = self.tup_config_node(root)?;
        Ok(Variant {
            name: name.to_owned(),
            root,
            config: config.id,
        })
    }

    /// Every known variant: the in-tree one plus each `build-*` directory
    /// that carries a tup.config.
    pub fn load_variants(&mut self) -> Result<Vec<Variant>, DbError> {
        let mut variants = vec![self.variant_for_root(DOT_DT, "")?];
        for child in self.dir_entries(DOT_DT)? {
            if !child.ntype.is_dir() {
                continue;
            }
            let Some(name) = child.name.strip_prefix("build-") else {
                continue;
            };
            if self.lookup(child.id, TUP_CONFIG)?.is_some() {
                let name = name.to_owned();
                variants.push(self.variant_for_root(child.id, &name)?);
            }
        }
        Ok(variants)
    }

    /// Reads a variable.  The variant's scope is consulted first, then the
    /// global environment scope.  An undefined name leaves a ghost behind
    /// and, when a command is reading, a sticky edge to it, so defining the
    /// variable later re-flags the command.
    pub fn get_var(
        &mut self,
        variant: &Variant,
        name: &str,
        cmdid: Option<Tupid>,
    ) -> Result<Option<String>, DbError> {
        let node = match self.lookup(variant.config, name)? {
            Some(e) => e,
            None => match self.lookup(ENV_DT, name)? {
                Some(e) => e,
                None => {
                    tracing::debug!(name, "undefined variable, leaving ghost");
                    self.node_insert(
                        variant.config,
                        name,
                        NodeType::Ghost,
                        Mtime::Unknown,
                        Tupid::NONE,
                    )?
                }
            },
        };
        if let Some(cmdid) = cmdid {
            self.create_link(node.id, cmdid, LinkStyle::Sticky)?;
        }
        if node.ntype == NodeType::Ghost {
            self.note_ghost_candidate(node.id);
            return Ok(None);
        }
        self.var_value(node.id)
    }

    /// Sets a variable's value on an existing node, promoting a ghost in
    /// place (the id is stable) and re-flagging readers when the value
    /// actually changed.
    pub fn set_var(&mut self, id: Tupid, value: &str) -> Result<(), DbError> {
        let e = self.get_or_load(id)?;
        let changed = match e.ntype {
            NodeType::Ghost => {
                self.retype(id, NodeType::Var)?;
                true
            }
            NodeType::Var => self.var_value(id)?.as_deref() != Some(value),
            _ => {
                return Err(DbError::TypeMismatch {
                    id,
                    found: e.ntype,
                    expected: NodeType::Var,
                })
            }
        };
        self.conn.execute(
            "INSERT OR REPLACE INTO var (id, value) VALUES (?1, ?2)",
            rusqlite::params![id, value],
        )?;
        if changed {
            self.modify_cmds_by_input(id)?;
        }
        Ok(())
    }

    /// Defines a variable by name in a scope, creating the node on first
    /// definition.
    pub fn set_var_named(&mut self, scope: Tupid, name: &str, value: &str) -> Result<Tupid, DbError> {
        let id = match self.lookup(scope, name)? {
            Some(e) => e.id,
            None => {
                self.node_insert(scope, name, NodeType::Var, Mtime::Unknown, Tupid::NONE)?
                    .id
            }
        };
        self.set_var(id, value)?;
        Ok(id)
    }

    /// Removes a definition.  A still-referenced variable demotes to a
    /// ghost so its readers stay flagged; an unreferenced one is removed.
    pub fn delete_var(&mut self, id: Tupid) -> Result<(), DbError> {
        self.modify_cmds_by_input(id)?;
        self.var_forget(id)?;
        self.retype(id, NodeType::Ghost)?;
        self.note_ghost_candidate(id);
        Ok(())
    }

    /// Parses `CONFIG_<NAME>=value` lines of a tup.config and reconciles
    /// the variant's scope with them in one pass.
    pub fn read_config_vars(&mut self, variant: &Variant, path: &Path) -> Result<(), DbError> {
        let text = std::fs::read_to_string(path)?;
        let mut fresh: Vec<(String, String)> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(rest) = line.strip_prefix("CONFIG_") else {
                continue;
            };
            let Some((name, value)) = rest.split_once('=') else {
                continue;
            };
            fresh.push((name.to_owned(), value.to_owned()));
        }

        let existing = self.dir_entries(variant.config)?;
        for e in existing {
            if e.ntype != NodeType::Var {
                continue;
            }
            if !fresh.iter().any(|(name, _)| *name == e.name) {
                self.delete_var(e.id)?;
            }
        }
        for (name, value) in fresh {
            self.set_var_named(variant.config, &name, &value)?;
        }
        Ok(())
    }

    // ---- environment ------------------------------------------------------

    /// Get-or-create the node for one environment entry, snapshotting its
    /// current value.  An unset entry is tracked as a ghost.
    pub fn findenv(&mut self, name: &str) -> Result<Entry, DbError> {
        if let Some(e) = self.lookup(ENV_DT, name)? {
            return Ok(e);
        }
        match std::env::var(name) {
            Ok(value) => {
                let e =
                    self.node_insert(ENV_DT, name, NodeType::Var, Mtime::Unknown, Tupid::NONE)?;
                self.conn.execute(
                    "INSERT OR REPLACE INTO var (id, value) VALUES (?1, ?2)",
                    rusqlite::params![e.id, value],
                )?;
                Ok(e)
            }
            Err(_) => {
                self.node_insert(ENV_DT, name, NodeType::Ghost, Mtime::Unknown, Tupid::NONE)
            }
        }
    }

    /// Resolves the environment entries a command declared, recording a
    /// sticky edge per entry.  Returns `(name, value)` pairs for the
    /// executor, unset entries as None.
    pub fn get_environ(
        &mut self,
        names: &[&str],
        cmdid: Tupid,
    ) -> Result<Vec<(String, Option<String>)>, DbError> {
        let mut env = Vec::new();
        for &name in names {
            let e = self.findenv(name)?;
            self.create_link(e.id, cmdid, LinkStyle::Sticky)?;
            let value = if e.ntype == NodeType::Var {
                self.var_value(e.id)?
            } else {
                self.note_ghost_candidate(e.id);
                None
            };
            env.push((name.to_owned(), value));
        }
        Ok(env)
    }

    /// Compares every tracked environment entry against the live process
    /// environment, re-flagging readers of entries that changed.  Returns
    /// how many entries differed.
    pub fn check_env(&mut self) -> Result<usize, DbError> {
        let entries = self.dir_entries(ENV_DT)?;
        let mut changed = 0;
        for e in entries {
            let stored = match e.ntype {
                NodeType::Var => self.var_value(e.id)?,
                NodeType::Ghost => None,
                _ => continue,
            };
            let live = std::env::var(&e.name).ok();
            if stored == live {
                continue;
            }
            tracing::debug!(name = %e.name, "environment changed");
            changed += 1;
            match live {
                Some(value) => self.set_var(e.id, &value)?,
                None => self.delete_var(e.id)?,
            }
        }
        Ok(changed)
    }
}
