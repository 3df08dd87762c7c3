//! Parsing of `git worktree list --porcelain` output.
//!
//! Each worktree block starts with `worktree <path>` followed by metadata
//! lines (`HEAD <sha>`, `branch <ref>`, `detached`, `bare`, `locked`,
//! `prunable ...`) and a blank separator. Only the `worktree` lines matter
//! here; the path is everything after the first space, so paths containing
//! spaces survive intact.
//!
//! Git prints absolute, symlink-resolved paths, so both sides of every
//! comparison go through [`comparable_path`] first.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use taskd_common::CommandRunner;

const WORKTREE_PREFIX: &str = "worktree ";

pub fn parse_worktree_paths(raw: &str) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut paths = Vec::new();
    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some(path) = line.strip_prefix(WORKTREE_PREFIX) else {
            continue;
        };
        if path.is_empty() {
            continue;
        }
        let path = PathBuf::from(path);
        if seen.insert(path.clone()) {
            paths.push(path);
        }
    }
    paths
}

/// `path` anchored at the process working directory when relative.
pub fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Absolute and, when the path exists, canonical.
pub fn comparable_path(path: &Path) -> PathBuf {
    let absolute = absolute_path(path);
    std::fs::canonicalize(&absolute).unwrap_or(absolute)
}

/// Listed worktrees that no active task claims, minus the main checkout.
/// Touches the filesystem to resolve paths.
pub fn find_orphans(raw: &str, active: &HashSet<PathBuf>, main_checkout: &Path) -> Vec<PathBuf> {
    let claimed: HashSet<PathBuf> = active.iter().map(|path| comparable_path(path)).collect();
    let main_checkout = comparable_path(main_checkout);
    parse_worktree_paths(raw)
        .into_iter()
        .filter(|path| {
            let resolved = comparable_path(path);
            resolved != main_checkout && !claimed.contains(&resolved)
        })
        .collect()
}

/// Raw porcelain listing for the repository at `repo_path`.
pub async fn list_worktrees(runner: &dyn CommandRunner, repo_path: &Path) -> Result<String> {
    let output = runner
        .run("git", &["worktree", "list", "--porcelain"], Some(repo_path))
        .await?
        .into_success("git worktree list")?;
    Ok(output.stdout)
}
