//! Dependency resolution: local cache first, then remotes in order.

use std::fmt;
use std::path::PathBuf;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::cache::{CachedPackage, PackageCache};
use crate::error::{Error, Result};
use crate::recipe::{Dependency, PackageInfo, PackageType};
use crate::remote::{Remote, RemoteCandidate};
use crate::version::parse_version;

/// How to pick one candidate when several satisfy a constraint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// The highest matching version wins; several revisions of that version
    /// are ambiguous.
    #[default]
    HighestVersion,
    /// More than one matching candidate is ambiguous.
    Strict,
}

/// A concrete package selected for a dependency coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedDependency {
    pub name: String,
    pub version: String,
    pub revision: String,
    pub package_type: PackageType,
    /// Installation path inside the cache.
    pub path: PathBuf,
    /// The same path relative to the cache root, `/`-separated.
    pub cache_rel: String,
    /// `cache` or the name of the remote it was fetched from.
    pub origin: String,
    pub cpp_info: PackageInfo,
}

impl ResolvedDependency {
    fn from_cached(pkg: CachedPackage, origin: &str) -> Self {
        let m = pkg.manifest;
        Self {
            cache_rel: format!("p/{}/{}/{}", m.name, m.version, m.revision),
            name: m.name,
            version: m.version,
            revision: m.revision,
            package_type: m.package_type,
            path: pkg.path,
            origin: origin.to_string(),
            cpp_info: m.cpp_info,
        }
    }
}

impl fmt::Display for ResolvedDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.name, self.version, self.revision)
    }
}

enum Origin<'a> {
    Cache(CachedPackage),
    Remote(&'a dyn Remote, RemoteCandidate),
}

struct Candidate<'a> {
    version: Version,
    version_raw: String,
    revision: String,
    origin: Origin<'a>,
}

impl Candidate<'_> {
    fn label(&self, name: &str) -> String {
        let from = match &self.origin {
            Origin::Cache(_) => "cache",
            Origin::Remote(r, _) => r.name(),
        };
        format!("{name}/{}#{} ({from})", self.version_raw, self.revision)
    }

    fn same_package(&self, other: &Candidate<'_>) -> bool {
        self.version == other.version && self.revision == other.revision
    }
}

pub struct Resolver<'a> {
    cache: &'a PackageCache,
    remotes: &'a [Box<dyn Remote>],
    tie_break: TieBreak,
    update: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(
        cache: &'a PackageCache,
        remotes: &'a [Box<dyn Remote>],
        tie_break: TieBreak,
        update: bool,
    ) -> Self {
        Self {
            cache,
            remotes,
            tie_break,
            update,
        }
    }

    /// Resolve every coordinate. Coordinates are resolved concurrently; the
    /// result (or the first error) follows declaration order.
    pub fn resolve_all(&self, deps: &[Dependency]) -> Result<Vec<ResolvedDependency>> {
        if deps.len() <= 1 {
            return deps.iter().map(|d| self.resolve(d)).collect();
        }
        let results: Vec<Result<ResolvedDependency>> = std::thread::scope(|s| {
            let handles: Vec<_> = deps
                .iter()
                .map(|d| s.spawn(move || self.resolve(d)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(Error::msg("resolver thread panicked")))
                })
                .collect()
        });
        results.into_iter().collect()
    }

    pub fn resolve(&self, dep: &Dependency) -> Result<ResolvedDependency> {
        let mut candidates = self.cached_candidates(dep)?;
        if candidates.is_empty() || self.update {
            for remote in self.remotes {
                for rc in remote.query(&dep.name, &dep.constraint)? {
                    let Ok(version) = parse_version(&rc.version) else {
                        continue;
                    };
                    let cand = Candidate {
                        version,
                        version_raw: rc.version.clone(),
                        revision: rc.revision.clone(),
                        origin: Origin::Remote(remote.as_ref(), rc),
                    };
                    if !candidates.iter().any(|c| c.same_package(&cand)) {
                        candidates.push(cand);
                    }
                }
            }
        }

        let selected = self.select(dep, candidates)?;
        let resolved = match selected.origin {
            Origin::Cache(pkg) => ResolvedDependency::from_cached(pkg, "cache"),
            Origin::Remote(remote, rc) => {
                let pkg = self.cache.with_lock(&dep.name, || {
                    if let Some(existing) = self.cache.get(&rc.name, &rc.version, &rc.revision)? {
                        return Ok(existing);
                    }
                    tracing::info!(
                        package = %format!("{}/{}#{}", rc.name, rc.version, rc.revision),
                        remote = remote.name(),
                        "fetching"
                    );
                    self.cache
                        .install(&rc.name, &rc.version, &rc.revision, |dest| {
                            remote.fetch(&rc, dest)
                        })
                })?;
                ResolvedDependency::from_cached(pkg, remote.name())
            }
        };
        tracing::info!(
            dependency = %dep,
            resolved = %resolved,
            origin = %resolved.origin,
            "resolved dependency"
        );
        Ok(resolved)
    }

    fn cached_candidates(&self, dep: &Dependency) -> Result<Vec<Candidate<'a>>> {
        let mut out = Vec::new();
        for pkg in self.cache.list(&dep.name)? {
            let Ok(version) = parse_version(pkg.version()) else {
                continue;
            };
            if !dep.constraint.matches(&version) {
                continue;
            }
            out.push(Candidate {
                version,
                version_raw: pkg.version().to_string(),
                revision: pkg.revision().to_string(),
                origin: Origin::Cache(pkg),
            });
        }
        Ok(out)
    }

    fn select<'c>(&self, dep: &Dependency, mut candidates: Vec<Candidate<'c>>) -> Result<Candidate<'c>> {
        if candidates.is_empty() {
            return Err(Error::UnresolvedDependency {
                name: dep.name.clone(),
                constraint: dep.constraint.to_string(),
            });
        }
        if self.tie_break == TieBreak::HighestVersion
            && let Some(top) = candidates.iter().map(|c| c.version.clone()).max()
        {
            candidates.retain(|c| c.version == top);
        }
        if candidates.len() > 1 {
            let mut labels: Vec<String> = candidates.iter().map(|c| c.label(&dep.name)).collect();
            labels.sort();
            return Err(Error::AmbiguousDependency {
                name: dep.name.clone(),
                constraint: dep.constraint.to_string(),
                candidates: labels,
            });
        }
        Ok(candidates.remove(0))
    }
}
