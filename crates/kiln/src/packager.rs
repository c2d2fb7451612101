//! Packaging: select the artifacts relevant to the package type from the
//! install staging tree and swap them into the package directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use filetime::FileTime;
use regex::Regex;
use walkdir::WalkDir;

use crate::cache::{MANIFEST_FILE, PackageManifest};
use crate::error::{Error, Result};
use crate::modules::util;
use crate::recipe::{PackageInfo, PackageType, Recipe};
use crate::settings::BuildKey;

/// Modification time stamped on every packaged file (1980-01-01).
const NORMALIZED_MTIME: i64 = 315_532_800;

static SHARED_LIB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\.so(\.[0-9]+)*|\.dylib|\.dll)$").expect("shared library pattern is valid")
});

static LINKABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:lib)?([A-Za-z0-9_.+-]+?)\.(?:a|so(?:\.[0-9]+)*|dylib|lib)$")
        .expect("library pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageReport {
    pub package_dir: PathBuf,
    pub manifest: PackageManifest,
}

/// Relative paths of every regular file or symlink under `root`, sorted.
fn staged_files(root: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    if !root.is_dir() {
        return Ok(out);
    }
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::msg(format!("walk {}: {e}", root.display())))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        out.push(util::rel_string(rel));
    }
    Ok(out)
}

fn top_dir(rel: &str) -> &str {
    rel.split_once('/').map(|(top, _)| top).unwrap_or("")
}

/// Pick the files that belong in a package of type `package_type`.
///
/// Applications keep `bin/`, `share/` and the shared libraries under `lib/`;
/// libraries keep `include/`, `lib/` and `bin/`.
pub fn select_artifacts(staging: &Path, package_type: PackageType) -> Result<Vec<String>> {
    let all = staged_files(staging)?;
    let selected: Vec<String> = all
        .into_iter()
        .filter(|rel| match (package_type, top_dir(rel)) {
            (PackageType::Application, "bin" | "share") => true,
            (PackageType::Application, "lib") => SHARED_LIB.is_match(rel),
            (PackageType::Library, "include" | "lib" | "bin") => true,
            _ => false,
        })
        .collect();

    match package_type {
        PackageType::Application if !selected.iter().any(|r| top_dir(r) == "bin") => {
            Err(Error::Package(format!(
                "application package has no executables: nothing under {}/bin",
                staging.display()
            )))
        }
        PackageType::Library
            if !selected
                .iter()
                .any(|r| matches!(top_dir(r), "include" | "lib")) =>
        {
            Err(Error::Package(format!(
                "library package has no headers or libraries under {}/include or {}/lib",
                staging.display(),
                staging.display()
            )))
        }
        _ => Ok(selected),
    }
}

/// Library names found directly under `lib/`, for packages that declare none.
fn detect_libs(files: &[String]) -> Vec<String> {
    let mut libs: Vec<String> = files
        .iter()
        .filter_map(|rel| rel.strip_prefix("lib/"))
        .filter(|name| !name.contains('/'))
        .filter_map(|name| LINKABLE.captures(name).map(|c| c[1].to_string()))
        .collect();
    libs.sort();
    libs.dedup();
    libs
}

fn cpp_info_for(recipe: &Recipe, files: &[String]) -> PackageInfo {
    let mut info = recipe.package_info.clone();
    if recipe.package_type == PackageType::Library && info.libs.is_empty() {
        info.libs = detect_libs(files);
    }
    info
}

/// Assemble the package for `key` from `staging` into `package_dir`.
///
/// The tree is built in a sibling scratch directory and renamed into place,
/// replacing any previous package. Running it twice on the same staging tree
/// yields byte-identical results, including the manifest.
pub fn assemble(
    recipe: &Recipe,
    key: &BuildKey,
    staging: &Path,
    package_dir: &Path,
) -> Result<PackageReport> {
    let files = select_artifacts(staging, recipe.package_type)?;
    let parent = package_dir.parent().ok_or_else(|| {
        Error::Package(format!("package dir {} has no parent", package_dir.display()))
    })?;
    util::ensure_dir(parent)?;

    let scratch = tempfile::Builder::new()
        .prefix(".kiln-pkg-")
        .tempdir_in(parent)
        .map_err(|e| Error::Package(format!("failed to create scratch dir in {}: {e}", parent.display())))?;
    let mtime = FileTime::from_unix_time(NORMALIZED_MTIME, 0);
    for rel in &files {
        let dst = scratch.path().join(rel);
        util::copy_file(&staging.join(rel), &dst)?;
        filetime::set_symlink_file_times(&dst, mtime, mtime)
            .map_err(|e| Error::Package(format!("failed to set mtime on {}: {e}", dst.display())))?;
    }

    let digests = util::tree_digests(scratch.path(), &[MANIFEST_FILE])?;
    let manifest = PackageManifest {
        name: recipe.name.clone(),
        version: recipe.version_or_default().to_string(),
        revision: PackageManifest::revision_for(&digests),
        package_type: recipe.package_type,
        settings: key.as_map(),
        cpp_info: cpp_info_for(recipe, &files),
        files: digests,
    };
    manifest.write(scratch.path())?;
    let manifest_path = scratch.path().join(MANIFEST_FILE);
    filetime::set_file_times(&manifest_path, mtime, mtime).map_err(|e| {
        Error::Package(format!("failed to set mtime on {}: {e}", manifest_path.display()))
    })?;

    swap_into_place(scratch.keep(), package_dir)?;
    tracing::info!(
        package = %format!("{}/{}#{}", manifest.name, manifest.version, manifest.revision),
        dir = %package_dir.display(),
        files = files.len(),
        "packaged"
    );
    Ok(PackageReport {
        package_dir: package_dir.to_path_buf(),
        manifest,
    })
}

fn swap_into_place(staged: PathBuf, package_dir: &Path) -> Result<()> {
    let Some(parent) = package_dir.parent() else {
        return Err(Error::Package(format!("package dir {} has no parent", package_dir.display())));
    };
    let trash = if package_dir.exists() {
        let trash = tempfile::Builder::new()
            .prefix(".kiln-old-")
            .tempdir_in(parent)
            .map_err(|e| Error::Package(format!("failed to create scratch dir in {}: {e}", parent.display())))?;
        let old = trash.path().join("package");
        fs::rename(package_dir, &old).map_err(|e| {
            let _ = fs::remove_dir_all(&staged);
            Error::Package(format!("failed to move aside {}: {e}", package_dir.display()))
        })?;
        Some((trash, old))
    } else {
        None
    };

    if let Err(e) = fs::rename(&staged, package_dir) {
        if let Some((_, old)) = &trash {
            let _ = fs::rename(old, package_dir);
        }
        let _ = fs::remove_dir_all(&staged);
        return Err(Error::Package(format!(
            "failed to move package into {}: {e}",
            package_dir.display()
        )));
    }
    // Dropping the trash dir deletes the previous package.
    drop(trash);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDoc;
    use crate::settings::{Axis, Settings};

    fn recipe(package_type: &str) -> Recipe {
        let raw = format!(
            "[package]\nname = \"hc_db\"\nversion = \"0.3.0\"\npackage_type = \"{package_type}\"\nsettings = [\"os\"]\n"
        );
        Recipe::from_doc(&ConfigDoc::parse("/src/hc_db/kiln.toml", &raw).expect("doc"))
            .expect("recipe")
    }

    fn key() -> BuildKey {
        let mut s = Settings::default();
        s.set(Axis::Os, "linux").expect("os");
        BuildKey::new(&[Axis::Os], &s).expect("key")
    }

    fn stage(root: &Path, files: &[&str]) {
        for f in files {
            util::write_text(&root.join(f), f).expect("write");
        }
    }

    #[test]
    fn application_keeps_binaries_and_shared_libs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let staging = tmp.path().join("staging");
        stage(
            &staging,
            &[
                "bin/hc_db",
                "lib/libhc.so.1",
                "lib/libhc.a",
                "include/hc.h",
                "share/hc/default.conf",
            ],
        );
        let files = select_artifacts(&staging, PackageType::Application).expect("select");
        assert_eq!(files, ["bin/hc_db", "lib/libhc.so.1", "share/hc/default.conf"]);
        let lib = select_artifacts(&staging, PackageType::Library).expect("select");
        assert_eq!(lib, ["bin/hc_db", "include/hc.h", "lib/libhc.a", "lib/libhc.so.1"]);
    }

    #[test]
    fn missing_artifacts_are_package_errors() {
        let tmp = tempfile::tempdir().expect("tempdir");
        stage(tmp.path(), &["include/hc.h"]);
        assert!(matches!(
            select_artifacts(tmp.path(), PackageType::Application),
            Err(Error::Package(_))
        ));
        assert!(matches!(
            select_artifacts(&tmp.path().join("nothing"), PackageType::Library),
            Err(Error::Package(_))
        ));
    }

    #[test]
    fn packaging_twice_is_identical_and_replaces_stale_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let staging = tmp.path().join("staging");
        let out = tmp.path().join("out/hc_db/linux");
        stage(&staging, &["bin/hc_db"]);
        util::write_text(&out.join("bin/stale"), "old").expect("stale");

        let r = recipe("application");
        let first = assemble(&r, &key(), &staging, &out).expect("first");
        let before = util::tree_digests(&out, &[]).expect("digests");
        let second = assemble(&r, &key(), &staging, &out).expect("second");
        let after = util::tree_digests(&out, &[]).expect("digests");

        assert_eq!(first, second);
        assert_eq!(before, after);
        assert!(!out.join("bin/stale").exists());
        assert_eq!(first.manifest.settings["os"], "linux");
        let leftovers: Vec<_> = fs::read_dir(out.parent().expect("parent"))
            .expect("read")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn library_libs_are_detected_when_undeclared() {
        let files = vec![
            "include/z.h".to_string(),
            "lib/libz.a".to_string(),
            "lib/libz.so.1".to_string(),
            "lib/cmake/z.cmake".to_string(),
            "lib/boost_system.lib".to_string(),
        ];
        assert_eq!(detect_libs(&files), ["boost_system", "z"]);
    }
}
