//! Local package cache.
//!
//! Layout: `<root>/p/<name>/<version>/<revision>/` holds one package tree and
//! its `kiln-package.toml` manifest. Writers serialize per package name with
//! an in-process mutex plus an advisory file lock in `<root>/locks/`, so
//! several kiln processes can share one cache.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::modules::util;
use crate::recipe::{PackageInfo, PackageType, validate_name};
use crate::version::parse_version;

pub const MANIFEST_FILE: &str = "kiln-package.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    pub revision: String,
    pub package_type: PackageType,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub cpp_info: PackageInfo,
    /// Relative path -> sha256 of every file in the package except the
    /// manifest itself.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl PackageManifest {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let raw = util::read_text(&path)?;
        toml::from_str(&raw)
            .map_err(|e| Error::msg(format!("invalid package manifest {}: {e}", path.display())))
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let raw = toml::to_string(self)
            .map_err(|e| Error::msg(format!("failed to encode package manifest: {e}")))?;
        util::write_text(&dir.join(MANIFEST_FILE), &raw)
    }

    /// Content revision for a set of file digests.
    pub fn revision_for(files: &BTreeMap<String, String>) -> String {
        let mut hasher = Sha256::new();
        for (path, digest) in files {
            hasher.update(path.as_bytes());
            hasher.update([0]);
            hasher.update(digest.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())[..16].to_string()
    }

    /// Check that the files under `dir` are exactly the recorded ones.
    pub fn verify(&self, dir: &Path) -> Result<()> {
        let actual = util::tree_digests(dir, &[MANIFEST_FILE])?;
        if actual != self.files {
            return Err(Error::msg(format!(
                "package {}/{}#{} at {} does not match its manifest",
                self.name,
                self.version,
                self.revision,
                dir.display()
            )));
        }
        Ok(())
    }
}

/// Reject `value` unless it is one plain path component made of
/// `[A-Za-z0-9._+-]`. Versions and revisions arrive from remote manifests and
/// indexes and end up joined into cache paths.
pub fn validate_component(value: &str, what: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-'));
    if !valid {
        return Err(Error::msg(format!("invalid {what} '{value}'")));
    }
    Ok(())
}

fn validate_coordinate(name: &str, version: &str, revision: &str) -> Result<()> {
    validate_name(name, "package name")?;
    validate_component(version, "package version")?;
    validate_component(revision, "package revision")
}

/// A package present in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPackage {
    pub manifest: PackageManifest,
    pub path: PathBuf,
}

impl CachedPackage {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    pub fn revision(&self) -> &str {
        &self.manifest.revision
    }
}

pub struct PackageCache {
    root: PathBuf,
    locks: Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
}

impl PackageCache {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["p", "locks", "tmp"] {
            util::ensure_dir(&root.join(sub))?;
        }
        let root = root.canonicalize().unwrap_or(root);
        Ok(Self {
            root,
            locks: Mutex::new(BTreeMap::new()),
        })
    }

    /// `$KILN_HOME`, else `~/.kiln`.
    pub fn default_root() -> PathBuf {
        if let Some(home) = std::env::var_os("KILN_HOME").filter(|v| !v.is_empty()) {
            return PathBuf::from(home);
        }
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        home.join(".kiln")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package_dir(&self, name: &str, version: &str, revision: &str) -> PathBuf {
        self.root.join("p").join(name).join(version).join(revision)
    }

    /// Every cached package named `name`, sorted by (version, revision).
    pub fn list(&self, name: &str) -> Result<Vec<CachedPackage>> {
        let base = self.root.join("p").join(name);
        let mut out = Vec::new();
        for version_dir in read_dirs(&base)? {
            for rev_dir in read_dirs(&version_dir)? {
                if !rev_dir.join(MANIFEST_FILE).is_file() {
                    continue;
                }
                let manifest = match PackageManifest::load(&rev_dir) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(path = %rev_dir.display(), "skipping cache entry: {e}");
                        continue;
                    }
                };
                if manifest.name != name {
                    continue;
                }
                out.push(CachedPackage {
                    manifest,
                    path: rev_dir,
                });
            }
        }
        out.sort_by(|a, b| {
            let va = parse_version(a.version()).ok();
            let vb = parse_version(b.version()).ok();
            va.cmp(&vb).then_with(|| a.revision().cmp(b.revision()))
        });
        Ok(out)
    }

    pub fn get(&self, name: &str, version: &str, revision: &str) -> Result<Option<CachedPackage>> {
        validate_coordinate(name, version, revision)?;
        let dir = self.package_dir(name, version, revision);
        if !dir.join(MANIFEST_FILE).is_file() {
            return Ok(None);
        }
        Ok(Some(CachedPackage {
            manifest: PackageManifest::load(&dir)?,
            path: dir,
        }))
    }

    /// Run `f` while holding the write lock for package `name`.
    pub fn with_lock<T>(&self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        validate_name(name, "package name")?;
        let slot = {
            let mut map = self
                .locks
                .lock()
                .map_err(|_| Error::msg("package cache lock table poisoned"))?;
            map.entry(name.to_string()).or_default().clone()
        };
        let _guard = slot
            .lock()
            .map_err(|_| Error::msg(format!("package cache lock for '{name}' poisoned")))?;

        let lock_path = self.root.join("locks").join(format!("{name}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::msg(format!("failed to open {}: {e}", lock_path.display())))?;
        file.lock_exclusive().map_err(|e| {
            Error::msg(format!("failed to lock {}: {e}", lock_path.display()))
        })?;
        tracing::debug!(package = name, "acquired cache lock");

        let out = f();
        let _ = FileExt::unlock(&file);
        out
    }

    /// Populate a new cache entry. `fill` writes the package tree (including
    /// its manifest) into a scratch directory, which is verified and renamed
    /// into place. Callers must hold the package lock.
    pub fn install(
        &self,
        name: &str,
        version: &str,
        revision: &str,
        fill: impl FnOnce(&Path) -> Result<()>,
    ) -> Result<CachedPackage> {
        validate_coordinate(name, version, revision)?;
        if let Some(existing) = self.get(name, version, revision)? {
            return Ok(existing);
        }
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{name}-"))
            .tempdir_in(self.root.join("tmp"))
            .map_err(|e| Error::msg(format!("failed to create cache scratch dir: {e}")))?;
        fill(scratch.path())?;

        let manifest = PackageManifest::load(scratch.path())?;
        if manifest.name != name || manifest.version != version || manifest.revision != revision {
            return Err(Error::msg(format!(
                "package manifest says {}/{}#{}, expected {name}/{version}#{revision}",
                manifest.name, manifest.version, manifest.revision
            )));
        }
        manifest.verify(scratch.path())?;
        let content_revision = PackageManifest::revision_for(&manifest.files);
        if content_revision != revision {
            return Err(Error::msg(format!(
                "package {name}/{version} claims revision {revision} but its files hash to {content_revision}"
            )));
        }

        let dest = self.package_dir(name, version, revision);
        if let Some(parent) = dest.parent() {
            util::ensure_dir(parent)?;
        }
        let staged = scratch.keep();
        fs::rename(&staged, &dest).map_err(|e| {
            let _ = fs::remove_dir_all(&staged);
            Error::msg(format!("failed to move package into {}: {e}", dest.display()))
        })?;
        tracing::info!(package = %format!("{name}/{version}#{revision}"), "installed into cache");
        Ok(CachedPackage {
            manifest,
            path: dest,
        })
    }

    /// Copy a finished package directory into the cache.
    pub fn export(&self, package_dir: &Path) -> Result<CachedPackage> {
        let manifest = PackageManifest::load(package_dir)?;
        manifest.verify(package_dir)?;
        self.with_lock(&manifest.name, || {
            self.install(&manifest.name, &manifest.version, &manifest.revision, |dest| {
                util::copy_tree(package_dir, dest).map(|_| ())
            })
        })
    }
}

fn read_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let rd = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::msg(format!("failed to read {}: {e}", dir.display()))),
    };
    let mut out = Vec::new();
    for entry in rd {
        let entry = entry.map_err(|e| Error::msg(format!("failed to read {}: {e}", dir.display())))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a minimal library package tree with a valid manifest.
    pub(crate) fn write_package(dir: &Path, name: &str, version: &str, header: &str) -> String {
        util::write_text(&dir.join(format!("include/{name}.h")), header).expect("write header");
        let files = util::tree_digests(dir, &[MANIFEST_FILE]).expect("digests");
        let revision = PackageManifest::revision_for(&files);
        PackageManifest {
            name: name.into(),
            version: version.into(),
            revision: revision.clone(),
            package_type: PackageType::Library,
            settings: BTreeMap::new(),
            cpp_info: PackageInfo::default(),
            files,
        }
        .write(dir)
        .expect("manifest");
        revision
    }

    #[test]
    fn export_then_list_finds_the_package() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = PackageCache::open(tmp.path().join("cache")).expect("cache");
        let pkg = tmp.path().join("pkg");
        let rev = write_package(&pkg, "zlib", "1.3", "// zlib");

        let installed = cache.export(&pkg).expect("export");
        assert_eq!(installed.revision(), rev);
        assert_eq!(installed.path, cache.package_dir("zlib", "1.3", &rev));
        assert!(installed.path.join("include/zlib.h").is_file());

        let listed = cache.list("zlib").expect("list");
        assert_eq!(listed.len(), 1);
        assert!(cache.list("openssl").expect("list other").is_empty());

        // Re-export is a no-op.
        cache.export(&pkg).expect("export again");
        assert_eq!(cache.list("zlib").expect("list").len(), 1);
    }

    #[test]
    fn coordinates_must_stay_inside_the_cache() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = PackageCache::open(tmp.path().join("cache")).expect("cache");
        let pkg = tmp.path().join("pkg");
        let rev = write_package(&pkg, "zlib", "1.3", "// zlib");

        for (version, revision) in [("1.3", "../../../../escaped"), ("..", rev.as_str()), ("1.3", "")] {
            assert!(cache.get("zlib", version, revision).is_err());
            let err = cache
                .install("zlib", version, revision, |dest| {
                    util::copy_tree(&pkg, dest).map(|_| ())
                })
                .unwrap_err();
            assert!(err.to_string().contains("invalid package"), "unexpected err: {err}");
        }
        assert!(!tmp.path().join("escaped").exists());
        assert!(cache.list("zlib").expect("list").is_empty());
    }

    #[test]
    fn claimed_revision_must_match_the_content() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = PackageCache::open(tmp.path().join("cache")).expect("cache");
        let pkg = tmp.path().join("pkg");
        write_package(&pkg, "zlib", "1.3", "// zlib");
        let mut manifest = PackageManifest::load(&pkg).expect("manifest");
        manifest.revision = "0123456789abcdef".into();
        manifest.write(&pkg).expect("rewrite");

        let err = cache.export(&pkg).unwrap_err();
        assert!(err.to_string().contains("hash to"), "unexpected err: {err}");
        assert!(cache.list("zlib").expect("list").is_empty());
    }

    #[test]
    fn tampered_trees_are_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = PackageCache::open(tmp.path().join("cache")).expect("cache");
        let pkg = tmp.path().join("pkg");
        write_package(&pkg, "zlib", "1.3", "// zlib");
        util::write_text(&pkg.join("include/zlib.h"), "// changed").expect("tamper");
        assert!(cache.export(&pkg).is_err());
        assert!(cache.list("zlib").expect("list").is_empty());
    }
}
