//! Settings axes, build configuration keys, overrides and profiles.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

macro_rules! setting_enum {
    ($(#[$meta:meta])* $name:ident, $axis:literal { $($variant:ident => $slug:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $slug),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(raw: &str) -> Result<Self> {
                let needle = raw.trim();
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(needle))
                    .ok_or_else(|| {
                        let allowed: Vec<&str> = Self::ALL.iter().map(|v| v.as_str()).collect();
                        Error::config(format!(
                            "invalid value '{}' for setting '{}' (allowed: {})",
                            raw,
                            $axis,
                            allowed.join(", ")
                        ))
                    })
            }
        }
    };
}

setting_enum!(
    /// A settings axis a recipe may declare.
    Axis, "axis" {
        Os => "os",
        Compiler => "compiler",
        BuildType => "build_type",
        Arch => "arch",
    }
);

setting_enum!(Os, "os" {
    Linux => "linux",
    Macos => "macos",
    Windows => "windows",
    Freebsd => "freebsd",
});

setting_enum!(Compiler, "compiler" {
    Gcc => "gcc",
    Clang => "clang",
    AppleClang => "apple-clang",
    Msvc => "msvc",
});

setting_enum!(BuildType, "build_type" {
    Debug => "Debug",
    Release => "Release",
    RelWithDebInfo => "RelWithDebInfo",
    MinSizeRel => "MinSizeRel",
});

setting_enum!(Arch, "arch" {
    X86 => "x86",
    X86_64 => "x86_64",
    Armv7 => "armv7",
    Armv8 => "armv8",
});

/// Settings values as supplied by a profile or the command line. Any axis may
/// be unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Settings {
    pub os: Option<Os>,
    pub compiler: Option<Compiler>,
    pub build_type: Option<BuildType>,
    pub arch: Option<Arch>,
}

impl Settings {
    pub fn set(&mut self, axis: Axis, raw: &str) -> Result<()> {
        match axis {
            Axis::Os => self.os = Some(raw.parse()?),
            Axis::Compiler => self.compiler = Some(raw.parse()?),
            Axis::BuildType => self.build_type = Some(raw.parse()?),
            Axis::Arch => self.arch = Some(raw.parse()?),
        }
        Ok(())
    }

    pub fn get(&self, axis: Axis) -> Option<&'static str> {
        match axis {
            Axis::Os => self.os.map(Os::as_str),
            Axis::Compiler => self.compiler.map(Compiler::as_str),
            Axis::BuildType => self.build_type.map(BuildType::as_str),
            Axis::Arch => self.arch.map(Arch::as_str),
        }
    }

    fn clear(&mut self, axis: Axis) {
        match axis {
            Axis::Os => self.os = None,
            Axis::Compiler => self.compiler = None,
            Axis::BuildType => self.build_type = None,
            Axis::Arch => self.arch = None,
        }
    }

    /// Apply `axis=value` assignments (the `-s` flag).
    pub fn apply_assignments(&mut self, raw: &[String]) -> Result<()> {
        for (key, value) in parse_assignments(raw, "setting")? {
            self.set(key.parse()?, &value)?;
        }
        Ok(())
    }

    /// Layer `other` on top of `self`: values set in `other` win.
    pub fn overlay(&mut self, other: &Settings) {
        self.os = other.os.or(self.os);
        self.compiler = other.compiler.or(self.compiler);
        self.build_type = other.build_type.or(self.build_type);
        self.arch = other.arch.or(self.arch);
    }

    /// Best-effort description of the machine kiln runs on.
    pub fn detect() -> Settings {
        let os = match std::env::consts::OS {
            "linux" => Some(Os::Linux),
            "macos" => Some(Os::Macos),
            "windows" => Some(Os::Windows),
            "freebsd" => Some(Os::Freebsd),
            _ => None,
        };
        let arch = match std::env::consts::ARCH {
            "x86" => Some(Arch::X86),
            "x86_64" => Some(Arch::X86_64),
            "arm" => Some(Arch::Armv7),
            "aarch64" => Some(Arch::Armv8),
            _ => None,
        };
        let compiler = match os {
            Some(Os::Macos) => Some(Compiler::AppleClang),
            Some(Os::Windows) => Some(Compiler::Msvc),
            Some(Os::Freebsd) => Some(Compiler::Clang),
            _ => Some(Compiler::Gcc),
        };
        Settings {
            os,
            compiler,
            build_type: Some(BuildType::Release),
            arch,
        }
    }
}

fn parse_assignments(raw: &[String], what: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::with_capacity(raw.len());
    for item in raw {
        let Some((k, v)) = item.trim().split_once('=') else {
            return Err(Error::config(format!(
                "invalid {what} '{item}'; expected KEY=VALUE"
            )));
        };
        let key = k.trim();
        if key.is_empty() {
            return Err(Error::config(format!("invalid {what} '{item}'; key is empty")));
        }
        out.push((key.to_string(), v.trim().to_string()));
    }
    Ok(out)
}

/// Concrete values for the settings axes a recipe declares.
///
/// Axes the recipe does not declare are erased, so two invocations that only
/// differ in an undeclared axis share one key (and one build directory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuildKey {
    settings: Settings,
}

impl BuildKey {
    pub fn new(declared: &[Axis], supplied: &Settings) -> Result<Self> {
        let mut settings = *supplied;
        for axis in Axis::ALL {
            if declared.contains(axis) {
                if supplied.get(*axis).is_none() {
                    return Err(Error::config(format!(
                        "setting '{axis}' is declared by the recipe but no value was supplied (use -s {axis}=<value> or a profile)"
                    )));
                }
            } else {
                settings.clear(*axis);
            }
        }
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// `(axis, value)` pairs sorted by axis name.
    pub fn pairs(&self) -> Vec<(&'static str, &'static str)> {
        let mut out: Vec<_> = Axis::ALL
            .iter()
            .filter_map(|a| self.settings.get(*a).map(|v| (a.as_str(), v)))
            .collect();
        out.sort();
        out
    }

    pub fn as_map(&self) -> BTreeMap<String, String> {
        self.pairs()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Canonical text form, e.g. `arch=x86_64;build_type=Release;compiler=gcc;os=linux`.
    pub fn canonical(&self) -> String {
        self.pairs()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn id(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        hex::encode(digest)[..16].to_string()
    }

    /// Directory name for this key. Values never contain '.', so the slug is
    /// unique per key.
    pub fn slug(&self) -> String {
        let s = &self.settings;
        let parts: Vec<String> = [
            s.os.map(Os::as_str),
            s.arch.map(Arch::as_str),
            s.compiler.map(Compiler::as_str),
            s.build_type.map(BuildType::as_str),
        ]
        .into_iter()
        .flatten()
        .map(str::to_ascii_lowercase)
        .collect();
        if parts.is_empty() {
            "default".into()
        } else {
            parts.join(".")
        }
    }
}

impl fmt::Display for BuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pairs().is_empty() {
            return f.write_str("<no settings>");
        }
        f.write_str(&self.canonical())
    }
}

/// Externally supplied values that take precedence over anything kiln would
/// compute (the `-c` flag and the `[conf]` table of a profile).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub c_compiler: Option<String>,
    pub cxx_compiler: Option<String>,
    pub c_flags: Vec<String>,
    pub cxx_flags: Vec<String>,
    pub defines: BTreeMap<String, String>,
    pub generator: Option<String>,
    pub jobs: Option<usize>,
}

impl Overrides {
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let non_empty = |v: &str| -> Result<String> {
            if v.is_empty() {
                return Err(Error::config(format!("conf '{key}' must not be empty")));
            }
            Ok(v.to_string())
        };
        match key {
            "cc" => self.c_compiler = Some(non_empty(value)?),
            "cxx" => self.cxx_compiler = Some(non_empty(value)?),
            "cflags" => self.c_flags = value.split_whitespace().map(String::from).collect(),
            "cxxflags" => self.cxx_flags = value.split_whitespace().map(String::from).collect(),
            "generator" => self.generator = Some(non_empty(value)?),
            "jobs" => {
                let jobs: usize = value.parse().map_err(|e| {
                    Error::config(format!("conf 'jobs' expects a positive integer: {e}"))
                })?;
                if jobs == 0 {
                    return Err(Error::config("conf 'jobs' must be at least 1"));
                }
                self.jobs = Some(jobs);
            }
            other => {
                let Some(name) = other.strip_prefix("define.") else {
                    return Err(Error::config(format!(
                        "unknown conf key '{other}' (known: cc, cxx, cflags, cxxflags, define.<NAME>, generator, jobs)"
                    )));
                };
                if name.is_empty() {
                    return Err(Error::config("conf 'define.' needs a name"));
                }
                self.defines.insert(name.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// Apply `key=value` assignments (the `-c` flag).
    pub fn apply_assignments(&mut self, raw: &[String]) -> Result<()> {
        for (key, value) in parse_assignments(raw, "conf")? {
            self.set(&key, &value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ProfileFile {
    settings: BTreeMap<String, String>,
    conf: BTreeMap<String, toml::Value>,
}

/// A settings profile: `[settings]` values and `[conf]` overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub settings: Settings,
    pub overrides: Overrides,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self> {
        let doc = crate::config::load(path)?;
        let file: ProfileFile = doc.deserialize_path("")?.unwrap_or_default();

        let mut profile = Profile::default();
        for (axis, value) in &file.settings {
            profile.settings.set(axis.parse()?, value)?;
        }
        for (key, value) in &file.conf {
            let text = match value {
                toml::Value::String(s) => s.clone(),
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Array(items) => items
                    .iter()
                    .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
                    .collect::<Vec<_>>()
                    .join(" "),
                other => other.to_string(),
            };
            profile.overrides.set(key, &text)?;
        }
        Ok(profile)
    }

    /// Load profiles in order; later profiles override earlier ones.
    pub fn load_layered(paths: &[PathBuf]) -> Result<Self> {
        let mut out = Profile::default();
        for p in paths {
            let next = Profile::load(p)?;
            out.settings.overlay(&next.settings);
            out.overrides.merge(next.overrides);
        }
        Ok(out)
    }

    pub fn to_toml(&self) -> String {
        let mut out = String::from("[settings]\n");
        for axis in Axis::ALL {
            if let Some(v) = self.settings.get(*axis) {
                out.push_str(&format!("{} = \"{}\"\n", axis, v));
            }
        }
        out
    }
}

impl Overrides {
    /// Layer `other` on top of `self`: values set in `other` win.
    pub fn merge(&mut self, other: Overrides) {
        if other.c_compiler.is_some() {
            self.c_compiler = other.c_compiler;
        }
        if other.cxx_compiler.is_some() {
            self.cxx_compiler = other.cxx_compiler;
        }
        if !other.c_flags.is_empty() {
            self.c_flags = other.c_flags;
        }
        if !other.cxx_flags.is_empty() {
            self.cxx_flags = other.cxx_flags;
        }
        self.defines.extend(other.defines);
        if other.generator.is_some() {
            self.generator = other.generator;
        }
        if other.jobs.is_some() {
            self.jobs = other.jobs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> Settings {
        let mut s = Settings::default();
        s.apply_assignments(&[
            "os=Linux".into(),
            "compiler=gcc".into(),
            "build_type=release".into(),
            "arch=x86_64".into(),
        ])
        .expect("settings");
        s
    }

    #[test]
    fn values_parse_case_insensitively_into_canonical_form() {
        let s = full();
        assert_eq!(s.os, Some(Os::Linux));
        assert_eq!(s.build_type, Some(BuildType::Release));
        let err = "sparc".parse::<Arch>().unwrap_err().to_string();
        assert!(err.contains("allowed: x86, x86_64, armv7, armv8"), "{err}");
    }

    #[test]
    fn key_canonical_form_and_slug() {
        let key = BuildKey::new(Axis::ALL, &full()).expect("key");
        assert_eq!(
            key.canonical(),
            "arch=x86_64;build_type=Release;compiler=gcc;os=linux"
        );
        assert_eq!(key.slug(), "linux.x86_64.gcc.release");
        assert_eq!(key.id().len(), 16);
    }

    #[test]
    fn undeclared_axes_are_erased_from_the_key() {
        let a = BuildKey::new(&[Axis::Os], &full()).expect("key a");
        let mut other = full();
        other.build_type = Some(BuildType::Debug);
        let b = BuildKey::new(&[Axis::Os], &other).expect("key b");
        assert_eq!(a, b);
        assert_eq!(a.slug(), "linux");
        assert_eq!(BuildKey::new(&[], &full()).expect("empty").slug(), "default");
    }

    #[test]
    fn missing_declared_axis_is_a_configuration_error() {
        let mut s = full();
        s.arch = None;
        let err = BuildKey::new(Axis::ALL, &s).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("'arch'"));
    }

    #[test]
    fn overrides_parse_known_keys() {
        let mut o = Overrides::default();
        o.apply_assignments(&[
            "cxx=/opt/gcc-13/bin/g++".into(),
            "cxxflags=-Wall -Wextra".into(),
            "define.HC_DEBUG=1".into(),
            "jobs=4".into(),
        ])
        .expect("overrides");
        assert_eq!(o.cxx_compiler.as_deref(), Some("/opt/gcc-13/bin/g++"));
        assert_eq!(o.cxx_flags, ["-Wall", "-Wextra"]);
        assert_eq!(o.defines.get("HC_DEBUG").map(String::as_str), Some("1"));
        assert_eq!(o.jobs, Some(4));
        assert!(o.set("linker", "mold").is_err());
        assert!(o.set("jobs", "0").is_err());
    }

    #[test]
    fn layered_profiles_later_wins() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let base = tmp.path().join("base.toml");
        let dbg = tmp.path().join("debug.toml");
        std::fs::write(
            &base,
            "[settings]\nos = \"linux\"\nbuild_type = \"Release\"\n[conf]\njobs = 2\n",
        )
        .expect("write base");
        std::fs::write(&dbg, "[settings]\nbuild_type = \"Debug\"\n").expect("write debug");

        let p = Profile::load_layered(&[base, dbg]).expect("profiles");
        assert_eq!(p.settings.os, Some(Os::Linux));
        assert_eq!(p.settings.build_type, Some(BuildType::Debug));
        assert_eq!(p.overrides.jobs, Some(2));
    }
}
