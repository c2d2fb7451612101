//! Version constraint grammar for dependency coordinates.
//!
//! Accepted forms:
//! - `1.83.0`, `1.83`: exact version
//! - `[>=1.0 <2.0]`: bracketed range, comparators separated by whitespace
//! - semver requirements: `>=1.83.0`, `^1.2`, `~1.2`, `>=1.0, <2.0`
//! - `*`: any version
//!
//! A requirement made only of lower bounds is capped below the next major
//! version of its highest bound, so `>=1.0` never selects `2.x`.

use std::fmt;

use semver::{Comparator, Op, Version, VersionReq};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    raw: String,
    req: VersionReq,
}

impl VersionConstraint {
    pub fn parse(raw: &str) -> Result<Self> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(Error::config(
                "empty version constraint (dependencies must be pinned or ranged)",
            ));
        }

        let normalized = if let Some(inner) = text.strip_prefix('[') {
            let inner = inner.strip_suffix(']').ok_or_else(|| {
                Error::config(format!("unterminated version range '{text}'"))
            })?;
            inner.split_whitespace().collect::<Vec<_>>().join(", ")
        } else if text.starts_with(|c: char| c.is_ascii_digit()) {
            format!("={}", text)
        } else {
            text.to_string()
        };

        let req = VersionReq::parse(&normalized)
            .map_err(|e| Error::config(format!("invalid version constraint '{text}': {e}")))?;
        let req = cap_open_range(req)?;
        Ok(Self {
            raw: text.to_string(),
            req,
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.req.matches(version)
    }

    /// The constraint as written in the recipe.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The effective semver requirement, after normalization and capping.
    pub fn effective(&self) -> &VersionReq {
        &self.req
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn cap_open_range(req: VersionReq) -> Result<VersionReq> {
    if req.comparators.is_empty() {
        return Ok(req);
    }
    let only_lower_bounds = req
        .comparators
        .iter()
        .all(|c| matches!(c.op, Op::Greater | Op::GreaterEq));
    if !only_lower_bounds {
        return Ok(req);
    }
    let major = req
        .comparators
        .iter()
        .map(effective_lower_major)
        .max()
        .unwrap_or(0);
    let capped = format!("{}, <{}.0.0", req, major + 1);
    VersionReq::parse(&capped)
        .map_err(|e| Error::config(format!("failed to cap version range '{req}': {e}")))
}

/// Major version of the smallest release a lower-bound comparator admits.
/// A partial `>` bound rounds up: `>1` starts at `2.0.0`, `>1.2` at `1.3.0`.
fn effective_lower_major(c: &Comparator) -> u64 {
    match (c.op, c.minor) {
        (Op::Greater, None) => c.major + 1,
        _ => c.major,
    }
}

/// Parse a package version leniently: missing minor/patch components are
/// filled with zeros (`1.2` → `1.2.0`, `2.0-rc1` → `2.0.0-rc1`).
pub fn parse_version(raw: &str) -> Result<Version> {
    let text = raw.trim();
    let split = text.find(['-', '+']).unwrap_or(text.len());
    let (core, rest) = text.split_at(split);
    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::config(format!("invalid version '{text}'")));
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&format!("{}{}", parts.join("."), rest))
        .map_err(|e| Error::config(format!("invalid version '{text}': {e}")))
}
