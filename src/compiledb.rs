//! Exports a clang-style compilation database: one record per command of
//! a variant.

use crate::db::{Db, DbError};
use crate::entry::{NodeType, Tupid};
use crate::vardb::Variant;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

#[derive(Serialize)]
struct CompileCommand {
    directory: String,
    command: String,
    file: String,
}

fn is_under(db: &mut Db, id: Tupid, root: Tupid) -> Result<bool, DbError> {
    let mut cur = id;
    while cur.valid() {
        if cur == root {
            return Ok(true);
        }
        cur = db.get_or_load(cur)?.parent;
    }
    Ok(false)
}

/// Writes the compile database for one variant as a JSON array.  Commands
/// without a file input are not compilations and are skipped.
pub fn write_compile_db<W: Write>(
    db: &mut Db,
    variant: &Variant,
    top: &Path,
    w: &mut W,
) -> Result<(), DbError> {
    let mut records = Vec::new();
    for cmdid in db.nodes_by_type(NodeType::Command)? {
        let cmd = db.get_or_load(cmdid)?;
        if !is_under(db, cmd.parent, variant.root)? {
            continue;
        }
        let inputs = db.get_inputs(cmdid)?;
        let mut file = None;
        for &input in &inputs.sticky {
            let e = db.get_or_load(input)?;
            if matches!(e.ntype, NodeType::File | NodeType::GeneratedFile) {
                file = Some(db.path_of(input)?);
                break;
            }
        }
        let Some(file) = file else { continue };
        let dir = db.path_of(cmd.parent)?;
        let directory = if dir == "." {
            top.display().to_string()
        } else {
            top.join(dir).display().to_string()
        };
        records.push(CompileCommand {
            directory,
            command: cmd.name.clone(),
            file,
        });
    }
    serde_json::to_writer_pretty(&mut *w, &records)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
    writeln!(w)?;
    Ok(())
}
