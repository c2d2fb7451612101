//! Package remotes: where the resolver looks when the local cache has no
//! match.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tar::Archive;

use crate::cache::{MANIFEST_FILE, PackageManifest, validate_component};
use crate::error::{Error, Result};
use crate::modules::util;
use crate::version::{VersionConstraint, parse_version};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    Dir,
    Http,
}

/// One `[[resolver.remotes]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub name: String,
    pub kind: RemoteKind,
    /// Directory for `dir` remotes, relative to the recipe.
    #[serde(default)]
    pub path: Option<String>,
    /// Base URL for `http` remotes.
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding a bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
}

/// A package version a remote offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCandidate {
    pub remote: String,
    pub name: String,
    pub version: String,
    pub revision: String,
    /// Remote-specific location (a directory or an archive URL).
    pub locator: String,
    pub sha256: Option<String>,
}

pub trait Remote: Send + Sync {
    fn name(&self) -> &str;

    /// Candidates for `name` satisfying `constraint`; empty when the remote
    /// does not know the package.
    fn query(&self, name: &str, constraint: &VersionConstraint) -> Result<Vec<RemoteCandidate>>;

    /// Write the package tree (including its manifest) into `dest`.
    fn fetch(&self, candidate: &RemoteCandidate, dest: &Path) -> Result<()>;
}

pub fn build_remotes(cfgs: &[RemoteConfig], base_dir: &Path) -> Result<Vec<Box<dyn Remote>>> {
    let mut out: Vec<Box<dyn Remote>> = Vec::with_capacity(cfgs.len());
    for cfg in cfgs {
        let name = cfg.name.trim();
        if name.is_empty() {
            return Err(Error::config("resolver remote has an empty name"));
        }
        if out.iter().any(|r| r.name() == name) {
            return Err(Error::config(format!("duplicate resolver remote '{name}'")));
        }
        match cfg.kind {
            RemoteKind::Dir => {
                let Some(raw) = cfg.path.as_deref().map(str::trim).filter(|p| !p.is_empty()) else {
                    return Err(Error::config(format!("dir remote '{name}' needs 'path'")));
                };
                let path = PathBuf::from(raw);
                let path = if path.is_absolute() {
                    path
                } else {
                    base_dir.join(path)
                };
                out.push(Box::new(DirRemote::new(name, path)));
            }
            RemoteKind::Http => {
                let Some(url) = cfg.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
                    return Err(Error::config(format!("http remote '{name}' needs 'url'")));
                };
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(Error::config(format!(
                        "http remote '{name}' url must start with http:// or https://"
                    )));
                }
                let token = cfg
                    .token_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty());
                out.push(Box::new(HttpRemote::new(name, url, token)?));
            }
        }
    }
    Ok(out)
}

/// A directory laid out as `<name>/<version>/<revision>/`.
pub struct DirRemote {
    name: String,
    root: PathBuf,
}

impl DirRemote {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }
}

impl Remote for DirRemote {
    fn name(&self) -> &str {
        &self.name
    }

    fn query(&self, name: &str, constraint: &VersionConstraint) -> Result<Vec<RemoteCandidate>> {
        let mut out = Vec::new();
        let base = self.root.join(name);
        if !base.is_dir() {
            return Ok(out);
        }
        for entry in walkdir::WalkDir::new(&base)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
        {
            let entry =
                entry.map_err(|e| Error::msg(format!("walk {}: {e}", base.display())))?;
            if !entry.file_type().is_dir() || !entry.path().join(MANIFEST_FILE).is_file() {
                continue;
            }
            let manifest = PackageManifest::load(entry.path())?;
            if manifest.name != name {
                continue;
            }
            if let Err(e) = validate_component(&manifest.version, "package version")
                .and_then(|_| validate_component(&manifest.revision, "package revision"))
            {
                tracing::warn!(remote = %self.name, path = %entry.path().display(), "skipping package: {e}");
                continue;
            }
            let Ok(version) = parse_version(&manifest.version) else {
                tracing::warn!(remote = %self.name, path = %entry.path().display(), "skipping package with unparseable version");
                continue;
            };
            if !constraint.matches(&version) {
                continue;
            }
            out.push(RemoteCandidate {
                remote: self.name.clone(),
                name: manifest.name,
                version: manifest.version,
                revision: manifest.revision,
                locator: entry.path().to_string_lossy().into_owned(),
                sha256: None,
            });
        }
        Ok(out)
    }

    fn fetch(&self, candidate: &RemoteCandidate, dest: &Path) -> Result<()> {
        util::copy_tree(Path::new(&candidate.locator), dest).map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct HttpIndex {
    #[serde(default)]
    packages: Vec<HttpIndexEntry>,
}

#[derive(Debug, Deserialize)]
struct HttpIndexEntry {
    version: String,
    revision: String,
    archive: String,
    sha256: String,
}

/// Serves `GET <url>/v1/<name>/index.json` plus `.tar.gz` package archives.
pub struct HttpRemote {
    name: String,
    base: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpRemote {
    pub fn new(name: impl Into<String>, base: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: name.into(),
            base: base.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        let mut req = self.client.get(url);
        if let Some(t) = self.token.as_deref() {
            req = req.bearer_auth(t);
        }
        req.send()
            .map_err(|e| Error::msg(format!("remote '{}': GET {url} failed: {e}", self.name)))
    }

    fn archive_url(&self, archive: &str) -> String {
        if archive.starts_with("http://") || archive.starts_with("https://") {
            archive.to_string()
        } else {
            format!("{}/{}", self.base, archive.trim_start_matches('/'))
        }
    }
}

impl Remote for HttpRemote {
    fn name(&self) -> &str {
        &self.name
    }

    fn query(&self, name: &str, constraint: &VersionConstraint) -> Result<Vec<RemoteCandidate>> {
        let url = format!("{}/v1/{name}/index.json", self.base);
        let res = self.get(&url)?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "remote '{}': GET {url} returned status {}",
                self.name,
                res.status()
            )));
        }
        let index: HttpIndex = res
            .json()
            .map_err(|e| Error::msg(format!("remote '{}': invalid index {url}: {e}", self.name)))?;

        let mut out = Vec::new();
        for entry in index.packages {
            if let Err(e) = validate_component(&entry.version, "package version")
                .and_then(|_| validate_component(&entry.revision, "package revision"))
            {
                tracing::warn!(remote = %self.name, "skipping index entry: {e}");
                continue;
            }
            let Ok(version) = parse_version(&entry.version) else {
                tracing::warn!(remote = %self.name, version = %entry.version, "skipping unparseable version");
                continue;
            };
            if !constraint.matches(&version) {
                continue;
            }
            out.push(RemoteCandidate {
                remote: self.name.clone(),
                name: name.to_string(),
                version: entry.version,
                revision: entry.revision,
                locator: self.archive_url(&entry.archive),
                sha256: Some(entry.sha256.to_ascii_lowercase()),
            });
        }
        Ok(out)
    }

    fn fetch(&self, candidate: &RemoteCandidate, dest: &Path) -> Result<()> {
        let mut res = self.get(&candidate.locator)?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "remote '{}': GET {} returned status {}",
                self.name,
                candidate.locator,
                res.status()
            )));
        }

        let mut download = tempfile::NamedTempFile::new()
            .map_err(|e| Error::msg(format!("failed to create download file: {e}")))?;
        let mut hashing = HashingWriter {
            inner: download.as_file_mut(),
            hasher: Sha256::new(),
        };
        res.copy_to(&mut hashing).map_err(|e| {
            Error::msg(format!("remote '{}': download failed: {e}", self.name))
        })?;
        let actual = hex::encode(hashing.hasher.finalize());
        if let Some(expected) = candidate.sha256.as_deref()
            && actual != expected
        {
            return Err(Error::msg(format!(
                "sha256 mismatch for {}: expected {expected}, got {actual}",
                candidate.locator
            )));
        }

        let file = File::open(download.path())
            .map_err(|e| Error::msg(format!("failed to reopen download: {e}")))?;
        let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
        archive
            .unpack(dest)
            .map_err(|e| Error::msg(format!("failed to unpack {}: {e}", candidate.locator)))?;
        Ok(())
    }
}

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
