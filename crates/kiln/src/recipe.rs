//! Recipe descriptor: the declarative description of one buildable package.
//!
//! ```toml
//! [package]
//! name = "hc_db"
//! package_type = "application"
//! settings = ["os", "compiler", "build_type", "arch"]
//! exports_sources = ["CMakeLists.txt", "src/*", "include/*"]
//!
//! requires = ["boost/>=1.83.0"]
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::remote::RemoteConfig;
use crate::resolver::TieBreak;
use crate::settings::Axis;
use crate::version::VersionConstraint;
use crate::workspace::WorkspaceConfig;

/// Top-level tables and keys a recipe may contain.
const KNOWN_KEYS: &[&str] = &[
    "package",
    "requires",
    "build",
    "package_info",
    "resolver",
    "workspace",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    Application,
    Library,
}

impl PackageType {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageType::Application => "application",
            PackageType::Library => "library",
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dependency coordinate: package name plus version constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub constraint: VersionConstraint,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.constraint)
    }
}

/// Consumer information a library publishes with its package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageInfo {
    pub libs: Vec<String>,
    pub defines: Vec<String>,
    pub include_dirs: Vec<String>,
    pub lib_dirs: Vec<String>,
    pub bin_dirs: Vec<String>,
}

impl PackageInfo {
    pub fn is_empty(&self) -> bool {
        self.libs.is_empty()
            && self.defines.is_empty()
            && self.include_dirs.is_empty()
            && self.lib_dirs.is_empty()
            && self.bin_dirs.is_empty()
    }
}

/// `[build]` table: backend selection and its options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub backend: BackendKind,
    /// CMake generator (`-G`).
    pub generator: Option<String>,
    pub configure_args: Vec<String>,
    pub build_args: Vec<String>,
    /// argv lists for the `command` backend.
    pub configure: Vec<String>,
    pub compile: Vec<String>,
    pub install: Vec<String>,
}

/// `[resolver]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    pub tie_break: TieBreak,
    pub update: bool,
    pub cache_dir: Option<String>,
    pub remotes: Vec<RemoteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackageSection {
    name: String,
    #[serde(default)]
    version: Option<String>,
    package_type: PackageType,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    settings: Vec<String>,
    #[serde(default)]
    exports_sources: Vec<String>,
    /// Requirements may sit next to the package metadata or at top level.
    #[serde(default)]
    requires: Option<Vec<RawRequirement>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawRequirement {
    Short(String),
    Table {
        name: String,
        #[serde(default)]
        version: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Recipe {
    pub name: String,
    pub version: Option<String>,
    pub package_type: PackageType,
    pub license: Option<String>,
    pub author: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    /// Declared settings axes, in declaration order.
    pub settings: Vec<Axis>,
    pub exports_sources: Vec<String>,
    pub requires: Vec<Dependency>,
    pub build: BuildConfig,
    pub package_info: PackageInfo,
    pub resolver: ResolverConfig,
    pub workspace: WorkspaceConfig,
    /// Absolute directory holding the recipe file.
    pub dir: PathBuf,
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let doc = crate::config::load(path)?;
        Self::from_doc(&doc)
    }

    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        for key in doc.top_level_keys() {
            if !KNOWN_KEYS.contains(&key) {
                return Err(Error::config(format!(
                    "unknown top-level key '{key}' in {} (known: {})",
                    doc.path.display(),
                    KNOWN_KEYS.join(", ")
                )));
            }
        }

        let Some(pkg) = doc.deserialize_path::<PackageSection>("package")? else {
            return Err(Error::config(format!(
                "{} has no [package] table",
                doc.path.display()
            )));
        };
        validate_name(&pkg.name, "package name")?;

        let version = pkg
            .version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ToOwned::to_owned);

        let mut settings = Vec::with_capacity(pkg.settings.len());
        for raw in &pkg.settings {
            let axis: Axis = raw.parse()?;
            if settings.contains(&axis) {
                return Err(Error::config(format!(
                    "settings axis '{axis}' is declared twice"
                )));
            }
            settings.push(axis);
        }

        for pattern in &pkg.exports_sources {
            validate_export_pattern(pattern)?;
        }

        let top_requires: Option<Vec<RawRequirement>> = doc.deserialize_path("requires")?;
        let raw_requires = match (pkg.requires, top_requires) {
            (Some(_), Some(_)) => {
                return Err(Error::config(format!(
                    "{} declares 'requires' both in [package] and at top level",
                    doc.path.display()
                )));
            }
            (Some(r), None) | (None, Some(r)) => r,
            (None, None) => Vec::new(),
        };
        let requires = parse_requirements(&raw_requires)?;

        let dir = doc.dir();
        let dir = dir.canonicalize().unwrap_or(dir);

        Ok(Recipe {
            name: pkg.name,
            version,
            package_type: pkg.package_type,
            license: pkg.license,
            author: pkg.author,
            url: pkg.url,
            description: pkg.description,
            settings,
            exports_sources: pkg.exports_sources,
            requires,
            build: doc.deserialize_path("build")?.unwrap_or_default(),
            package_info: doc.deserialize_path("package_info")?.unwrap_or_default(),
            resolver: doc.deserialize_path("resolver")?.unwrap_or_default(),
            workspace: doc.deserialize_path("workspace")?.unwrap_or_default(),
            dir,
        })
    }

    /// `name/version`, or `name/unversioned` when the recipe carries no version.
    pub fn reference(&self) -> String {
        format!(
            "{}/{}",
            self.name,
            self.version.as_deref().unwrap_or("unversioned")
        )
    }

    pub fn version_or_default(&self) -> &str {
        self.version.as_deref().unwrap_or("unversioned")
    }
}

fn parse_requirements(raw: &[RawRequirement]) -> Result<Vec<Dependency>> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for item in raw {
        let (name, constraint) = match item {
            RawRequirement::Short(s) => match s.trim().split_once('/') {
                Some((n, c)) => (n.trim().to_string(), c.trim().to_string()),
                None => (s.trim().to_string(), String::new()),
            },
            RawRequirement::Table { name, version } => (
                name.trim().to_string(),
                version.clone().unwrap_or_default().trim().to_string(),
            ),
        };
        validate_name(&name, "dependency name")?;
        if constraint.is_empty() {
            return Err(Error::config(format!(
                "dependency '{name}' has no version constraint (use '{name}/<version>' or '{name}/*')"
            )));
        }
        if !seen.insert(name.clone()) {
            return Err(Error::config(format!(
                "dependency '{name}' is declared more than once"
            )));
        }
        let constraint = VersionConstraint::parse(&constraint).map_err(|e| match e {
            Error::Configuration(m) => Error::config(format!("dependency '{name}': {m}")),
            other => other,
        })?;
        out.push(Dependency { name, constraint });
    }
    Ok(out)
}

pub(crate) fn validate_name(name: &str, what: &str) -> Result<()> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '+' | '-')
        });
    if !valid {
        return Err(Error::config(format!(
            "invalid {what} '{name}' (allowed: a-z 0-9 _ . + -, starting with a letter or digit)"
        )));
    }
    Ok(())
}

fn validate_export_pattern(pattern: &str) -> Result<()> {
    let p = pattern.trim();
    if p.is_empty() {
        return Err(Error::config("exports_sources contains an empty pattern"));
    }
    let path = Path::new(p);
    if path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(Error::config(format!(
            "exports_sources pattern '{p}' must stay inside the recipe directory"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe(raw: &str) -> Result<Recipe> {
        Recipe::from_doc(&ConfigDoc::parse("/src/hc_db/kiln.toml", raw)?)
    }

    const HC_DB: &str = r#"
requires = ["boost/>=1.83.0"]

[package]
name = "hc_db"
package_type = "application"
license = "GPLv3"
settings = ["os", "compiler", "build_type", "arch"]
exports_sources = ["CMakeLists.txt", "src/*", "include/*"]
"#;

    #[test]
    fn parses_the_application_recipe() {
        let r = recipe(HC_DB).expect("recipe");
        assert_eq!(r.name, "hc_db");
        assert_eq!(r.package_type, PackageType::Application);
        assert_eq!(r.reference(), "hc_db/unversioned");
        assert_eq!(r.settings, Axis::ALL);
        assert_eq!(r.requires.len(), 1);
        assert_eq!(r.requires[0].to_string(), "boost/>=1.83.0");
        assert_eq!(r.build.backend, BackendKind::CMake);
        assert_eq!(r.resolver.tie_break, TieBreak::HighestVersion);
    }

    #[test]
    fn requires_inside_the_package_table_is_accepted() {
        let r = recipe(
            r#"
[package]
name = "hc_db"
package_type = "application"
settings = ["os", "compiler", "build_type", "arch"]
exports_sources = ["CMakeLists.txt", "src/*", "include/*"]

requires = ["boost/>=1.83.0"]
"#,
        )
        .expect("recipe");
        assert_eq!(r.requires.len(), 1);
        assert_eq!(r.requires[0].to_string(), "boost/>=1.83.0");

        let both = "requires = [\"z/1\"]\n[package]\nname = \"a\"\npackage_type = \"application\"\nrequires = [\"y/1\"]\n";
        assert!(matches!(recipe(both), Err(Error::Configuration(_))));
    }

    #[test]
    fn table_requirements_are_accepted() {
        let r = recipe(
            "[package]\nname = \"a\"\npackage_type = \"library\"\nversion = \"0.1\"\n\n[[requires]]\nname = \"zlib\"\nversion = \"[>=1.2 <2]\"\n",
        )
        .expect("recipe");
        assert_eq!(r.reference(), "a/0.1");
        assert_eq!(r.requires[0].name, "zlib");
    }

    #[test]
    fn structural_problems_are_configuration_errors() {
        let cases = [
            // missing constraint
            "requires = [\"boost\"]\n[package]\nname = \"a\"\npackage_type = \"application\"\n",
            // duplicate dependency
            "requires = [\"z/1\", \"z/2\"]\n[package]\nname = \"a\"\npackage_type = \"application\"\n",
            // unknown axis
            "[package]\nname = \"a\"\npackage_type = \"application\"\nsettings = [\"libc\"]\n",
            // duplicated axis
            "[package]\nname = \"a\"\npackage_type = \"application\"\nsettings = [\"os\", \"OS\"]\n",
            // unknown top-level table
            "[package]\nname = \"a\"\npackage_type = \"application\"\n[tools]\nx = 1\n",
            // missing package type
            "[package]\nname = \"a\"\n",
            // escaping export
            "[package]\nname = \"a\"\npackage_type = \"application\"\nexports_sources = [\"../secret/*\"]\n",
            // bad name
            "[package]\nname = \"Bad Name\"\npackage_type = \"application\"\n",
        ];
        for raw in cases {
            let err = recipe(raw).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{raw}: {err}");
        }
    }
}
