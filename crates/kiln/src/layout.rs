//! Layout resolution (pure path computation) and source staging.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::settings::BuildKey;
use crate::workspace::WorkspacePaths;

pub const GENERATORS_DIR: &str = "generators";
pub const INSTALL_STAGING_DIR: &str = "install-staging";
pub const TOOLCHAIN_RECORD: &str = "kiln_toolchain.json";

/// The directories one invocation works in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layout {
    /// Staged sources, shared by every key of the recipe.
    pub source_dir: PathBuf,
    /// Native build tree for this key.
    pub build_dir: PathBuf,
    pub generators_dir: PathBuf,
    pub package_dir: PathBuf,
}

impl Layout {
    pub fn resolve(ws: &WorkspacePaths, name: &str, key: &BuildKey) -> Layout {
        let slug = key.slug();
        let recipe_build = ws.build_dir.join(name);
        let build_dir = recipe_build.join(&slug);
        Layout {
            source_dir: recipe_build.join("source"),
            generators_dir: build_dir.join(GENERATORS_DIR),
            build_dir,
            package_dir: ws.out_dir.join(name).join(slug),
        }
    }

    pub fn install_staging(&self) -> PathBuf {
        self.build_dir.join(INSTALL_STAGING_DIR)
    }

    pub fn toolchain_record(&self) -> PathBuf {
        self.generators_dir.join(TOOLCHAIN_RECORD)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub copied: usize,
    pub unchanged: usize,
    pub removed: usize,
    /// Patterns that matched no file.
    pub unmatched: Vec<String>,
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<(String, GlobMatcher)>> {
    let mut out = Vec::with_capacity(patterns.len());
    for raw in patterns {
        let pattern = raw.trim().trim_start_matches("./");
        // `*` crosses directory separators, like fnmatch.
        let glob = GlobBuilder::new(pattern)
            .literal_separator(false)
            .build()
            .map_err(|e| Error::config(format!("invalid exports_sources pattern '{raw}': {e}")))?;
        out.push((raw.clone(), glob.compile_matcher()));
    }
    Ok(out)
}

fn normalise(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Copy the files matching `patterns` from `recipe_dir` into `dest`.
///
/// A file is rewritten only when its content differs; staged files that no
/// longer match are removed. The workspace build/out trees and `.git` are
/// never exported.
pub fn stage_sources(
    recipe_dir: &Path,
    patterns: &[String],
    ws: &WorkspacePaths,
    dest: &Path,
) -> Result<StageReport> {
    let matchers = compile_patterns(patterns)?;
    let mut hits = vec![false; matchers.len()];
    let mut report = StageReport::default();
    let mut wanted = BTreeSet::<String>::new();

    let skip = [ws.build_dir.clone(), ws.out_dir.clone(), dest.to_path_buf()];
    let walker = WalkDir::new(recipe_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 {
                return true;
            }
            if e.file_type().is_dir() && e.file_name() == ".git" {
                return false;
            }
            !skip.iter().any(|s| e.path() == s.as_path())
        });

    for entry in walker {
        let entry = entry.map_err(|e| Error::msg(format!("walk {}: {e}", recipe_dir.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(recipe_dir) else {
            continue;
        };
        let rel = normalise(rel);
        let mut matched = false;
        for (i, (_, m)) in matchers.iter().enumerate() {
            if m.is_match(&rel) {
                hits[i] = true;
                matched = true;
            }
        }
        if !matched {
            continue;
        }
        if copy_if_changed(entry.path(), &dest.join(&rel))? {
            report.copied += 1;
        } else {
            report.unchanged += 1;
        }
        wanted.insert(rel);
    }

    report.removed = remove_stale(dest, &wanted)?;
    report.unmatched = matchers
        .iter()
        .zip(hits)
        .filter(|(_, hit)| !hit)
        .map(|((raw, _), _)| raw.clone())
        .collect();
    for p in &report.unmatched {
        tracing::warn!(pattern = %p, "exports_sources pattern matched no files");
    }
    Ok(report)
}

fn copy_if_changed(src: &Path, dst: &Path) -> Result<bool> {
    let data =
        fs::read(src).map_err(|e| Error::msg(format!("failed to read {}: {e}", src.display())))?;
    if let Ok(existing) = fs::read(dst)
        && existing == data
    {
        return Ok(false);
    }
    let parent = dst
        .parent()
        .ok_or_else(|| Error::msg(format!("no parent for {}", dst.display())))?;
    fs::create_dir_all(parent)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", parent.display())))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| Error::msg(format!("failed to create temp file in {}: {e}", parent.display())))?;
    tmp.write_all(&data)
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", dst.display())))?;
    if let Ok(meta) = fs::metadata(src) {
        let _ = fs::set_permissions(tmp.path(), meta.permissions());
    }
    tmp.persist(dst)
        .map_err(|e| Error::msg(format!("failed to replace {}: {e}", dst.display())))?;
    Ok(true)
}

fn remove_stale(dest: &Path, wanted: &BTreeSet<String>) -> Result<usize> {
    if !dest.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in WalkDir::new(dest).contents_first(true) {
        let entry = entry.map_err(|e| Error::msg(format!("walk {}: {e}", dest.display())))?;
        if entry.depth() == 0 {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(dest) else {
            continue;
        };
        if entry.file_type().is_dir() {
            // Only succeeds once empty.
            let _ = fs::remove_dir(entry.path());
        } else if !wanted.contains(&normalise(rel)) {
            fs::remove_file(entry.path()).map_err(|e| {
                Error::msg(format!("failed to remove {}: {e}", entry.path().display()))
            })?;
            removed += 1;
        }
    }
    Ok(removed)
}
