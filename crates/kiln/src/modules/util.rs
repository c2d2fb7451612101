use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{Error, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
}

pub fn read_text(p: &Path) -> Result<String> {
    fs::read_to_string(p).map_err(|e| Error::msg(format!("failed to read {}: {e}", p.display())))
}

pub fn write_json_pretty<T: serde::Serialize>(p: &Path, v: &T) -> Result<()> {
    let mut s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    s.push('\n');
    write_text(p, &s)
}

/// Remove a directory tree if it exists.
pub fn remove_dir_if_exists(p: &Path) -> Result<()> {
    match fs::remove_dir_all(p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::msg(format!("failed to remove {}: {e}", p.display()))),
    }
}

/// `/`-joined relative path, independent of the host separator.
pub fn rel_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn file_sha256(p: &Path) -> Result<String> {
    let mut f =
        fs::File::open(p).map_err(|e| Error::msg(format!("failed to open {}: {e}", p.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", p.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// sha256 of every regular file under `root`, keyed by relative path.
/// Top-level entries named in `skip` are ignored.
pub fn tree_digests(root: &Path, skip: &[&str]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::msg(format!("walk {}: {e}", root.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel = rel_string(rel);
        if skip.contains(&rel.as_str()) {
            continue;
        }
        out.insert(rel, file_sha256(entry.path())?);
    }
    Ok(out)
}

/// Copy every file (and symlink) under `src` into `dst`, creating directories
/// as needed. Returns the copied relative paths.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<Vec<PathBuf>> {
    let mut copied = Vec::new();
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::msg(format!("walk {}: {e}", src.display())))?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            ensure_dir(&target)?;
        } else {
            copy_file(entry.path(), &target)?;
            copied.push(rel.to_path_buf());
        }
    }
    Ok(copied)
}

/// Copy one file, recreating symlinks as symlinks on unix.
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    #[cfg(unix)]
    {
        let meta = fs::symlink_metadata(src)
            .map_err(|e| Error::msg(format!("stat {}: {e}", src.display())))?;
        if meta.file_type().is_symlink() {
            let link = fs::read_link(src)
                .map_err(|e| Error::msg(format!("readlink {}: {e}", src.display())))?;
            let _ = fs::remove_file(dst);
            return std::os::unix::fs::symlink(&link, dst).map_err(|e| {
                Error::msg(format!("failed to link {} -> {}: {e}", dst.display(), link.display()))
            });
        }
    }
    fs::copy(src, dst).map_err(|e| {
        Error::msg(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            dst.display()
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digests_are_keyed_by_relative_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_text(&tmp.path().join("include/a.h"), "#pragma once\n").expect("write");
        write_text(&tmp.path().join("manifest.toml"), "x").expect("write");
        let d = tree_digests(tmp.path(), &["manifest.toml"]).expect("digests");
        assert_eq!(d.keys().collect::<Vec<_>>(), ["include/a.h"]);
        assert_eq!(d["include/a.h"].len(), 64);
    }
}
