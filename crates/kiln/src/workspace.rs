use std::fs;
use std::path::Component;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_build_dir() -> String {
    "build".into()
}

fn default_out_dir() -> String {
    "out".into()
}

fn default_root_dir() -> String {
    ".".into()
}

/// What `kiln clean` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanMode {
    /// The recipe's build trees (staged sources and every key's build dir).
    Build,
    /// Build trees and package output.
    All,
}

/// `[workspace]` table of a recipe. Relative paths are resolved against the
/// directory that holds the recipe file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            out_dir: default_out_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub out_dir: PathBuf,
}

impl WorkspacePaths {
    pub fn error_logs_dir(&self) -> PathBuf {
        self.build_dir.join("error-logs")
    }
}

/// Compute workspace paths without touching the filesystem.
pub fn load_paths(recipe_dir: &Path, cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let root = resolve_user_path(recipe_dir, &cfg.root_dir)?;
    let build_dir = resolve_user_dir(&root, &cfg.build_dir)?;
    let out_dir = resolve_user_dir(&root, &cfg.out_dir)?;
    if build_dir == out_dir {
        return Err(Error::config(format!(
            "workspace build_dir and out_dir must differ (both are {})",
            build_dir.display()
        )));
    }
    Ok(WorkspacePaths {
        root,
        build_dir,
        out_dir,
    })
}

pub fn init_dirs(paths: &WorkspacePaths) -> Result<()> {
    fs::create_dir_all(&paths.build_dir).map_err(|e| {
        Error::msg(format!(
            "failed to create build_dir {}: {e}",
            paths.build_dir.display()
        ))
    })?;
    fs::create_dir_all(&paths.out_dir).map_err(|e| {
        Error::msg(format!(
            "failed to create out_dir {}: {e}",
            paths.out_dir.display()
        ))
    })?;
    Ok(())
}

/// Remove the directories a recipe owns inside the workspace. Returns the
/// directories that were removed.
pub fn clean(paths: &WorkspacePaths, name: &str, mode: CleanMode) -> Result<Vec<PathBuf>> {
    let mut targets = vec![paths.build_dir.join(name)];
    if mode == CleanMode::All {
        targets.push(paths.out_dir.join(name));
    }
    let mut removed = Vec::new();
    for dir in targets {
        if safe_remove_dir_all(&paths.root, &dir)? {
            removed.push(dir);
        }
    }
    Ok(removed)
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace dir"));
    }
    let rel_pb = Path::new(p);
    if rel_pb
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::config(format!(
            "invalid workspace dir '{}' (contains '..')",
            p
        )));
    }
    Ok(if rel_pb.is_absolute() {
        rel_pb.to_path_buf()
    } else {
        root.join(rel_pb)
    })
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    let joined = if pb.is_absolute() { pb } else { base.join(pb) };
    // "." components make equal roots compare unequal.
    Ok(joined
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect())
}

fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(false);
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) || dir_can == root_can {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (outside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))?;
    Ok(true)
}
