//! Compares what a command declared against what it actually did, updating
//! the link database and diagnosing violations.
//!
//! Runs once per command execution, inside the caller's transaction.  A
//! bork fails the command without failing the surrounding batch.

use crate::db::{Db, DbError};
use crate::entry::{NodeType, Tupid};
use crate::flags::Flag;
use crate::link::LinkStyle;
use std::collections::BTreeSet;

/// What the sandbox and parser know about one command execution.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub cmdid: Tupid,
    /// Nodes the sandbox saw the command write.
    pub writes: BTreeSet<Tupid>,
    /// Paths written that have no node at all; always violations.
    pub unknown_writes: Vec<String>,
    /// Nodes the sandbox saw the command read.
    pub reads: BTreeSet<Tupid>,
    /// Outputs the rule declared.
    pub declared_outputs: BTreeSet<Tupid>,
    /// Sticky inputs the rule declared.
    pub declared_inputs: BTreeSet<Tupid>,
    /// Groups the rule consumes.
    pub group_sticky: BTreeSet<Tupid>,
    /// Exclusion patterns the rule declared.
    pub exclusions: BTreeSet<Tupid>,
    /// The group the rule publishes into.
    pub group: Option<Tupid>,
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Ask the caller to unlink files written outside the declared set.
    pub do_unlink: bool,
    /// Treat a declared-but-unwritten output as an error rather than
    /// flagging it transient.
    pub complain_missing: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        ReconcileOptions {
            do_unlink: false,
            complain_missing: true,
        }
    }
}

/// A rule violation charged to one command.
#[derive(Debug)]
pub struct Bork {
    pub cmdid: Tupid,
    pub message: String,
}

/// The outcome of one reconciliation pass.
#[derive(Debug, Default)]
pub struct Reconciled {
    pub borks: Vec<Bork>,
    /// Soft complaints that do not fail the command.
    pub diagnostics: Vec<String>,
    /// Files the caller should unlink (undeclared writes, when asked to).
    pub unlink: Vec<Tupid>,
    /// A removed normal link pointed at another command's output; the
    /// caller must rebuild the graph before continuing.
    pub important_link_removed: bool,
}

impl Reconciled {
    pub fn ok(&self) -> bool {
        self.borks.is_empty()
    }
}

pub fn reconcile(
    db: &mut Db,
    report: &ReconcileReport,
    opts: &ReconcileOptions,
) -> Result<Reconciled, DbError> {
    let cmdid = report.cmdid;
    let mut out = Reconciled::default();

    // 1. Writes outside the declared output set.
    for &w in report
        .writes
        .difference(&report.declared_outputs)
        .filter(|w| !report.exclusions.contains(*w))
    {
        let e = db.get_or_load(w)?;
        out.borks.push(Bork {
            cmdid,
            message: format!("wrote to undeclared output {}", db.path_of(e.id)?),
        });
        if opts.do_unlink {
            out.unlink.push(w);
        }
    }
    for path in &report.unknown_writes {
        out.borks.push(Bork {
            cmdid,
            message: format!("wrote to undeclared output {}", path),
        });
    }

    // 2. Declared outputs that never appeared.
    for &o in report.declared_outputs.difference(&report.writes) {
        let e = db.get_or_load(o)?;
        if e.ntype != NodeType::GeneratedFile {
            continue;
        }
        if opts.complain_missing {
            out.borks.push(Bork {
                cmdid,
                message: format!("declared output {} was not written", db.path_of(o)?),
            });
        } else {
            db.flag_maybe_add(Flag::Transient, o)?;
        }
    }

    // 3. The observed read set becomes the normal input set; diff against
    // what the store has and apply atomically.
    let old = db.get_inputs(cmdid)?.normal;
    let new: BTreeSet<Tupid> = report
        .reads
        .iter()
        .copied()
        .filter(|r| !report.declared_outputs.contains(r) && !report.writes.contains(r))
        .collect();
    for &added in new.difference(&old) {
        db.create_link(added, cmdid, LinkStyle::Normal)?;
    }
    for &stale in old.difference(&new) {
        db.delete_link(stale, cmdid, LinkStyle::Normal)?;
        // 5. Losing a dependency on another command's output changes the
        // shape of the build; the caller has to re-plan.
        let e = db.get_or_load(stale)?;
        if e.ntype == NodeType::GeneratedFile && db.incoming_link(stale)?.is_some() {
            out.important_link_removed = true;
        }
    }

    // 4. Declared inputs the command never read.  The sticky edge stays;
    // this is only worth a note, unless a consumed group covers it.
    for &s in report.declared_inputs.difference(&report.reads) {
        let e = db.get_or_load(s)?;
        if !matches!(e.ntype, NodeType::File | NodeType::GeneratedFile) {
            continue;
        }
        let covered = match db.incoming_link(s)? {
            Some(producer) => {
                let mut hit = false;
                for &g in &report.group_sticky {
                    if db.link_exists(producer.id, g, LinkStyle::Group)? {
                        hit = true;
                        break;
                    }
                }
                hit
            }
            None => false,
        };
        if !covered {
            out.diagnostics
                .push(format!("declared input {} was not read", db.path_of(s)?));
        }
    }

    // 6. Group membership follows the new output set.
    let current_groups = db.outgoing(cmdid, LinkStyle::Group)?;
    for g in current_groups {
        if report.group != Some(g.id) {
            db.delete_link(cmdid, g.id, LinkStyle::Group)?;
        }
    }
    if let Some(g) = report.group {
        db.create_link(cmdid, g, LinkStyle::Group)?;
    }

    if out.ok() {
        db.flag_remove(Flag::Modify, cmdid)?;
        for &w in &report.writes {
            db.flag_remove(Flag::Transient, w)?;
        }
    } else {
        for bork in &out.borks {
            tracing::warn!(cmdid = cmdid.0, "{}", bork.message);
        }
    }
    Ok(out)
}
