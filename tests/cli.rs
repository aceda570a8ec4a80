//! Runs the t2 binary against a scratch project.

use std::path::PathBuf;
use std::process::{Command, Output};

fn t2_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_t2"))
}

/// Manages a temporary project directory for invoking t2.
struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        let full = self.dir.path().join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(full, content)
    }

    fn run(&self, args: &[&str]) -> anyhow::Result<Output> {
        let out = Command::new(t2_binary())
            .args(args)
            .current_dir(self.dir.path())
            .output()?;
        Ok(out)
    }

    fn run_ok(&self, args: &[&str]) -> anyhow::Result<Output> {
        let out = self.run(args)?;
        if !out.status.success() {
            anyhow::bail!(
                "t2 {:?} failed: {}{}",
                args,
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Ok(out)
    }
}

#[test]
fn init_scan_and_query() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.run_ok(&["init"])?;
    space.write("src/a.c", "int main() { return 0; }\n")?;
    space.run_ok(&["scan"])?;

    assert_eq!(space.run(&["node_exists", ".", "src"])?.status.code(), Some(0));
    assert_eq!(
        space.run(&["node_exists", "src", "a.c"])?.status.code(),
        Some(0)
    );
    assert_eq!(
        space.run(&["node_exists", "src", "b.c"])?.status.code(),
        Some(1)
    );
    Ok(())
}

#[test]
fn graph_emits_a_digraph() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.run_ok(&["init"])?;
    space.write("a.c", "\n")?;
    space.run_ok(&["scan"])?;
    let out = space.run_ok(&["graph", "a.c"])?;
    let text = String::from_utf8(out.stdout)?;
    assert!(text.starts_with("digraph G {"), "got: {}", text);
    assert!(text.contains("a.c"));
    Ok(())
}

#[test]
fn link_predicates_use_reserved_exit_code() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.run_ok(&["init"])?;
    space.write("a.c", "\n")?;
    space.write("b.c", "\n")?;
    space.run_ok(&["scan"])?;
    // No link between two plain files.
    assert_eq!(
        space
            .run(&["sticky_exists", ".", "a.c", ".", "b.c"])?
            .status
            .code(),
        Some(0)
    );
    // Unknown nodes are an error, not "absent".
    assert_eq!(
        space
            .run(&["sticky_exists", ".", "a.c", ".", "zzz"])?
            .status
            .code(),
        Some(1)
    );
    Ok(())
}

#[test]
fn flags_exist_after_scan_finds_work() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.run_ok(&["init"])?;
    // A fresh store flags the root for parsing.
    assert_eq!(space.run(&["flags_exists"])?.status.code(), Some(1));
    Ok(())
}

#[test]
fn second_init_is_refused() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.run_ok(&["init"])?;
    let out = space.run(&["init"])?;
    assert_eq!(out.status.code(), Some(1));
    Ok(())
}

#[test]
fn touch_inserts_nodes() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.run_ok(&["init"])?;
    space.run_ok(&["touch", "lib/util.c"])?;
    assert_eq!(
        space.run(&["node_exists", "lib", "util.c"])?.status.code(),
        Some(0)
    );
    let out = space.run_ok(&["entry", "lib/util.c"])?;
    let text = String::from_utf8(out.stdout)?;
    assert!(text.contains("lib/util.c"), "got: {}", text);
    assert!(text.contains("[file]"), "got: {}", text);
    Ok(())
}
