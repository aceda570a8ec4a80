//! CLI surface: option parsing, subcommand dispatch, and exit codes.
//! The store layer never prints; everything user-visible happens here.

use crate::db::{find_top, Db, DbError, TUP_CONFIG, TUP_DIR};
use crate::entry::{Entry, Mtime, NodeType, Tupid, DOT_DT, ENV_DT};
use crate::flags::{Flag, FlagSet};
use crate::graph::{Graph, GraphOptions, PrunePolicy};
use crate::link::LinkStyle;
use crate::lock::BuildLock;
use anyhow::{anyhow, bail};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

#[derive(argh::FromArgs)]
/// t2, the dependency database of a file-based build system
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// debug logging to stderr
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// print version
    #[argh(switch)]
    version: bool,

    /// subcommand and arguments
    #[argh(positional, greedy)]
    args: Vec<String>,
}

const USAGE: &str = "\
usage: t2 COMMAND [ARGS]

commands:
  init [dir]          create a .tup store
  scan                reconcile the store with the filesystem
  graph [opts] [t..]  print a graphviz graph of the database
  todo [t..]          print the commands the next update would run first
  compiledb           write compile_commands.json per variant
  dbconfig            show internal store configuration
  entry NAME|ID..     show entries
  varshow [VAR..]     show @-variables
  touch FILE..        insert files into the store (test helper)
  node_exists DIR N.. normal_exists/sticky_exists A B C D
  flags_exists        ghost_check
";

fn mtime_of(meta: &std::fs::Metadata) -> Mtime {
    match meta.modified().ok().and_then(|t| t.duration_since(UNIX_EPOCH).ok()) {
        Some(d) => Mtime::Known {
            sec: d.as_secs() as i64,
            nsec: d.subsec_nanos() as i32,
        },
        None => Mtime::Unknown,
    }
}

fn open_db() -> anyhow::Result<(PathBuf, Db)> {
    let cwd = std::env::current_dir()?;
    let top = find_top(&cwd)
        .ok_or_else(|| anyhow!("no {} directory found; run 't2 init' first", TUP_DIR))?;
    let db = Db::open(&top)?;
    Ok((top, db))
}

/// Resolves a slash-separated root-relative path to its entry.
fn resolve_path(db: &mut Db, path: &str) -> anyhow::Result<Option<Entry>> {
    let mut cur = db.get_or_load(DOT_DT)?;
    for part in path.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        match db.lookup(cur.id, part)? {
            Some(e) => cur = e,
            None => return Ok(None),
        }
    }
    Ok(Some(cur))
}

fn cmd_init(args: &[String]) -> anyhow::Result<i32> {
    let dir = PathBuf::from(args.first().map(String::as_str).unwrap_or("."));
    if dir.join(TUP_DIR).exists() {
        bail!("{} already exists in {}", TUP_DIR, dir.display());
    }
    std::fs::create_dir_all(&dir)?;
    Db::create(&dir, true, false)?;
    println!("t2: initialized {} in {}", TUP_DIR, dir.display());
    Ok(0)
}

fn scan_dir(
    db: &mut Db,
    scan: &mut crate::db::Scan,
    parent: Tupid,
    path: &Path,
) -> anyhow::Result<()> {
    let mut names: Vec<(String, std::fs::Metadata)> = Vec::new();
    for dent in std::fs::read_dir(path)? {
        let dent = dent?;
        let name = match dent.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if name.starts_with('.') {
            continue;
        }
        // Follow symlinks so a linked tup.config scans as a file; skip
        // anything broken.
        match std::fs::metadata(dent.path()) {
            Ok(meta) => names.push((name, meta)),
            Err(_) => continue,
        }
    }
    names.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, meta) in names {
        if meta.is_dir() {
            let id = db.note_existing(scan, parent, &name, NodeType::Dir, mtime_of(&meta))?;
            scan_dir(db, scan, id, &path.join(&name))?;
        } else if meta.is_file() {
            db.note_existing(scan, parent, &name, NodeType::File, mtime_of(&meta))?;
        }
    }
    Ok(())
}

fn cmd_scan() -> anyhow::Result<i32> {
    let (top, mut db) = open_db()?;
    let _lock = BuildLock::acquire(&top)?;
    let mut scan = db.scan_begin()?;
    scan_dir(&mut db, &mut scan, DOT_DT, &top)?;
    db.scan_end(scan)?;
    Ok(0)
}

fn cmd_graph(args: &[String]) -> anyhow::Result<i32> {
    let (_top, mut db) = open_db()?;
    let mut opts = GraphOptions::default();
    let mut targets = Vec::new();
    let mut prune: Option<(PrunePolicy, Vec<String>)> = None;
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--dirs" => opts.show_dirs = true,
            "--ghosts" => opts.show_ghosts = true,
            "--env" => opts.show_env = true,
            "--combine" => opts.combine = true,
            "--stickies" => opts.stickies = true,
            "--prune" => {
                let policy = match it.next().map(String::as_str) {
                    Some("all") => PrunePolicy::All,
                    Some("upwards") => PrunePolicy::Upwards,
                    Some("downwards") => PrunePolicy::Downwards,
                    other => bail!("--prune needs all|upwards|downwards, got {:?}", other),
                };
                prune = Some((policy, it.map(String::clone).collect()));
                break;
            }
            name => targets.push(name.to_owned()),
        }
    }

    db.begin()?;
    let mut g = if targets.is_empty() {
        Graph::build_from_flags(&mut db, &opts)?
    } else {
        let mut seeds = Vec::new();
        for t in &targets {
            let e = resolve_path(&mut db, t)?
                .ok_or_else(|| anyhow!("unable to find node for {:?}", t))?;
            seeds.push(e.id);
        }
        Graph::build(&mut db, &seeds, &opts)?
    };
    if let Some((policy, names)) = prune {
        let mut prune_targets = Vec::new();
        for name in &names {
            let e = resolve_path(&mut db, name)?
                .ok_or_else(|| anyhow!("unable to find node for {:?}", name))?;
            prune_targets.push(e.id);
        }
        let cut = g.prune(&prune_targets, policy)?;
        tracing::debug!(cut, "pruned graph");
    }
    let stdout = std::io::stdout();
    g.dump(&mut db, &mut stdout.lock(), &opts)?;
    db.commit()?;
    Ok(0)
}

fn cmd_todo(args: &[String]) -> anyhow::Result<i32> {
    let (_top, mut db) = open_db()?;
    db.begin()?;
    let opts = GraphOptions::default();
    let g = if args.is_empty() {
        Graph::build_from_flags(&mut db, &opts)?
    } else {
        let mut seeds = Vec::new();
        for t in args {
            let e = resolve_path(&mut db, t)?
                .ok_or_else(|| anyhow!("unable to find node for {:?}", t))?;
            seeds.push(e.id);
        }
        Graph::build(&mut db, &seeds, &opts)?
    };
    let ready = g.ready_commands();
    if ready.is_empty() {
        println!("t2: nothing to do");
    }
    for cmdid in ready {
        let e = db.get_or_load(cmdid)?;
        println!("{}: {}", db.path_of(e.parent)?, e.label());
    }
    db.commit()?;
    Ok(0)
}

fn cmd_compiledb() -> anyhow::Result<i32> {
    let (top, mut db) = open_db()?;
    db.begin()?;
    for variant in db.load_variants()? {
        let dir = if variant.name.is_empty() {
            top.clone()
        } else {
            top.join(format!("build-{}", variant.name))
        };
        let mut f = std::fs::File::create(dir.join("compile_commands.json"))?;
        crate::compiledb::write_compile_db(&mut db, &variant, &top, &mut f)?;
    }
    db.commit()?;
    Ok(0)
}

fn cmd_dbconfig() -> anyhow::Result<i32> {
    let (_top, db) = open_db()?;
    for (lval, rval) in db.show_config()? {
        println!("{} = {}", lval, rval);
    }
    Ok(0)
}

fn cmd_entry(args: &[String]) -> anyhow::Result<i32> {
    let (_top, mut db) = open_db()?;
    db.begin()?;
    for arg in args {
        let e = match arg.parse::<i64>() {
            Ok(n) => Some(db.get_or_load(Tupid(n))?),
            Err(_) => resolve_path(&mut db, arg)?,
        };
        match e {
            Some(e) => {
                let flags = db.node_flags(e.id)?;
                println!(
                    "{} [{}] {} flags={}",
                    e.id,
                    e.ntype,
                    db.path_of(e.id)?,
                    flags
                );
            }
            None => bail!("entry not found for {:?}", arg),
        }
    }
    db.commit()?;
    Ok(0)
}

fn cmd_varshow(args: &[String]) -> anyhow::Result<i32> {
    let (_top, mut db) = open_db()?;
    db.begin()?;
    let variant = db.variant_for_root(DOT_DT, "")?;
    if args.is_empty() {
        for scope in [variant.config, ENV_DT] {
            for e in db.dir_entries(scope)? {
                if e.ntype != NodeType::Var {
                    continue;
                }
                let name = e.name.clone();
                let value = db.get_var(&variant, &name, None)?;
                println!("{}={}", name, value.unwrap_or_default());
            }
        }
    } else {
        for name in args {
            match db.get_var(&variant, name, None)? {
                Some(value) => println!("{}={}", name, value),
                None => println!("{} is not set", name),
            }
        }
    }
    db.commit()?;
    Ok(0)
}

fn cmd_touch(args: &[String]) -> anyhow::Result<i32> {
    let (top, mut db) = open_db()?;
    let _lock = BuildLock::acquire(&top)?;
    db.begin()?;
    for path in args {
        let full = top.join(path);
        if !full.exists() {
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(&full)?;
        }
        let meta = std::fs::metadata(&full)?;

        // Walk the path, creating directory nodes as needed.
        let mut dir = DOT_DT;
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
        let Some((name, dirs)) = parts.split_last() else {
            continue;
        };
        for part in dirs {
            let (e, _) = db.create_node(dir, part, NodeType::Dir, Tupid::NONE)?;
            dir = e.id;
        }
        let ntype = if meta.is_dir() {
            NodeType::Dir
        } else {
            NodeType::File
        };
        let (e, _) = db.create_node(dir, name, ntype, Tupid::NONE)?;
        db.set_mtime(e.id, mtime_of(&meta))?;
        db.flag_maybe_add(Flag::Modify, e.id)?;
        db.modify_cmds_by_input(e.id)?;
        if *name == TUP_CONFIG {
            db.flag_maybe_add(Flag::Config, e.id)?;
        }
    }
    db.commit()?;
    Ok(0)
}

fn cmd_node_exists(args: &[String]) -> anyhow::Result<i32> {
    let (_top, mut db) = open_db()?;
    let Some((dir, names)) = args.split_first() else {
        bail!("usage: node_exists dir [n1] [n2...]");
    };
    db.begin()?;
    let dtent = resolve_path(&mut db, dir)?.ok_or_else(|| anyhow!("no directory {:?}", dir))?;
    let mut rc = 0;
    for name in names {
        if db.lookup(dtent.id, name)?.is_none() {
            rc = 1;
        }
    }
    db.commit()?;
    Ok(rc)
}

fn cmd_link_exists(style: LinkStyle, args: &[String]) -> anyhow::Result<i32> {
    if args.len() != 4 {
        bail!("link predicates take two dir/name pairs");
    }
    let (_top, mut db) = open_db()?;
    db.begin()?;
    let mut ends = Vec::new();
    for pair in args.chunks(2) {
        let dtent = resolve_path(&mut db, &pair[0])?
            .ok_or_else(|| anyhow!("dir {:?} doesn't exist", pair[0]))?;
        let tent = db
            .lookup(dtent.id, &pair[1])?
            .ok_or_else(|| anyhow!("node {:?} doesn't exist", pair[1]))?;
        ends.push(tent.id);
    }
    let exists = db.link_exists(ends[0], ends[1], style)?;
    db.commit()?;
    // 11 distinguishes "present" from generic success.
    Ok(if exists { 11 } else { 0 })
}

fn cmd_flags_exists() -> anyhow::Result<i32> {
    let (_top, db) = open_db()?;
    let set = FlagSet::of(&[Flag::Create, Flag::Modify, Flag::Config, Flag::Transient]);
    Ok(if db.check_flags(set)? { 1 } else { 0 })
}

fn cmd_ghost_check() -> anyhow::Result<i32> {
    let (_top, mut db) = open_db()?;
    db.begin()?;
    let n = db.add_all_ghost_candidates()?;
    db.commit()?;
    println!("t2: checked {} ghost{}", n, if n == 1 { "" } else { "s" });
    Ok(0)
}

fn run_impl() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();

    if opts.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    }

    if opts.version {
        println!("t2 {}", env!("CARGO_PKG_VERSION"));
        return Ok(0);
    }

    if let Some(dir) = &opts.chdir {
        std::env::set_current_dir(Path::new(dir))
            .map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    let Some((cmd, rest)) = opts.args.split_first() else {
        print!("{}", USAGE);
        return Ok(1);
    };
    match cmd.as_str() {
        "init" => cmd_init(rest),
        "scan" => cmd_scan(),
        "graph" => cmd_graph(rest),
        "todo" => cmd_todo(rest),
        "compiledb" => cmd_compiledb(),
        "dbconfig" => cmd_dbconfig(),
        "entry" => cmd_entry(rest),
        "varshow" => cmd_varshow(rest),
        "touch" => cmd_touch(rest),
        "node_exists" => cmd_node_exists(rest),
        "normal_exists" => cmd_link_exists(LinkStyle::Normal, rest),
        "sticky_exists" => cmd_link_exists(LinkStyle::Sticky, rest),
        "flags_exists" => cmd_flags_exists(),
        "ghost_check" => cmd_ghost_check(),
        _ => {
            print!("{}", USAGE);
            bail!("unknown command {:?}", cmd)
        }
    }
}

pub fn run() -> anyhow::Result<i32> {
    match run_impl() {
        Ok(code) => Ok(code),
        Err(err) => {
            // Schema and lock problems get a clean one-liner.
            if let Some(db_err) = err.downcast_ref::<DbError>() {
                eprintln!("t2 error: {}", db_err);
                return Ok(1);
            }
            Err(err)
        }
    }
}
