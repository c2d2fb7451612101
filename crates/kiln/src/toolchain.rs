//! Toolchain generation.
//!
//! [`generate`] is a pure function of the build key, the resolved
//! dependencies and the overrides. Dependency paths are written relative to
//! `${KILN_CACHE_ROOT}`, which the build backend supplies at configure time,
//! so the generated files contain no machine-specific paths unless an
//! override names one.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::error::{Error, Result};
use crate::layout::TOOLCHAIN_RECORD;
use crate::modules::util;
use crate::resolver::ResolvedDependency;
use crate::settings::{Arch, BuildKey, BuildType, Compiler, Os, Overrides};

pub const CMAKE_TOOLCHAIN: &str = "kiln_toolchain.cmake";

/// Per-dependency consumer information, relative to the cache root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub name: String,
    pub version: String,
    pub revision: String,
    pub cache_rel: String,
    pub include_dirs: Vec<String>,
    pub lib_dirs: Vec<String>,
    pub bin_dirs: Vec<String>,
    pub libs: Vec<String>,
    pub defines: Vec<String>,
}

/// Machine-readable toolchain description, written next to the generated
/// CMake files and read back by the build and package phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainRecord {
    pub backend: BackendKind,
    pub settings: BTreeMap<String, String>,
    pub c_compiler: Option<String>,
    pub cxx_compiler: Option<String>,
    pub build_type_flags: Vec<String>,
    pub arch_flags: Vec<String>,
    pub c_flags: Vec<String>,
    pub cxx_flags: Vec<String>,
    pub defines: BTreeMap<String, String>,
    pub generator: Option<String>,
    pub jobs: Option<usize>,
    pub dependencies: Vec<DependencyRecord>,
}

impl ToolchainRecord {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = util::read_text(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::msg(format!("invalid toolchain record {}: {e}", path.display())))
    }

    pub fn build_type(&self) -> Option<&str> {
        self.settings.get("build_type").map(String::as_str)
    }

    fn define_flags(&self) -> Vec<String> {
        self.defines
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    format!("-D{k}")
                } else {
                    format!("-D{k}={v}")
                }
            })
            .collect()
    }

    /// Complete C flags for build systems that take them from the environment.
    pub fn effective_c_flags(&self) -> Vec<String> {
        let mut out = self.build_type_flags.clone();
        out.extend(self.arch_flags.iter().cloned());
        out.extend(self.define_flags());
        out.extend(self.c_flags.iter().cloned());
        out
    }

    pub fn effective_cxx_flags(&self) -> Vec<String> {
        let mut out = self.build_type_flags.clone();
        out.extend(self.arch_flags.iter().cloned());
        out.extend(self.define_flags());
        out.extend(self.cxx_flags.iter().cloned());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub name: String,
    pub contents: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub record: ToolchainRecord,
    pub files: Vec<GeneratedFile>,
}

impl Toolchain {
    /// Write every generated file into `dir`.
    pub fn write(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        util::ensure_dir(dir)?;
        let mut written = Vec::with_capacity(self.files.len());
        for f in &self.files {
            let path = dir.join(&f.name);
            util::write_text(&path, &f.contents)?;
            written.push(path);
        }
        Ok(written)
    }
}

fn check_supported(key: &BuildKey) -> Result<()> {
    let s = key.settings();
    match (s.compiler, s.os) {
        (Some(Compiler::Msvc), Some(os)) if os != Os::Windows => {
            return Err(Error::ToolchainGeneration(format!(
                "compiler msvc is not available for os {os}"
            )));
        }
        (Some(Compiler::AppleClang), Some(os)) if os != Os::Macos => {
            return Err(Error::ToolchainGeneration(format!(
                "compiler apple-clang is not available for os {os}"
            )));
        }
        _ => {}
    }
    if s.os == Some(Os::Macos)
        && let Some(arch @ (Arch::X86 | Arch::Armv7)) = s.arch
    {
        return Err(Error::ToolchainGeneration(format!(
            "arch {arch} is not supported on macos"
        )));
    }
    Ok(())
}

fn default_compilers(compiler: Option<Compiler>) -> (Option<&'static str>, Option<&'static str>) {
    match compiler {
        Some(Compiler::Gcc) => (Some("gcc"), Some("g++")),
        Some(Compiler::Clang) | Some(Compiler::AppleClang) => (Some("clang"), Some("clang++")),
        Some(Compiler::Msvc) => (Some("cl"), Some("cl")),
        None => (None, None),
    }
}

fn build_type_flags(compiler: Option<Compiler>, bt: Option<BuildType>) -> Vec<String> {
    let Some(bt) = bt else {
        return Vec::new();
    };
    let msvc = compiler == Some(Compiler::Msvc);
    let flags: &[&str] = match (msvc, bt) {
        (false, BuildType::Debug) => &["-O0", "-g"],
        (false, BuildType::Release) => &["-O3", "-DNDEBUG"],
        (false, BuildType::RelWithDebInfo) => &["-O2", "-g", "-DNDEBUG"],
        (false, BuildType::MinSizeRel) => &["-Os", "-DNDEBUG"],
        (true, BuildType::Debug) => &["/Od", "/Zi"],
        (true, BuildType::Release) => &["/O2", "/DNDEBUG"],
        (true, BuildType::RelWithDebInfo) => &["/O2", "/Zi", "/DNDEBUG"],
        (true, BuildType::MinSizeRel) => &["/O1", "/DNDEBUG"],
    };
    flags.iter().map(|f| f.to_string()).collect()
}

fn arch_flags(compiler: Option<Compiler>, arch: Option<Arch>) -> Vec<String> {
    if compiler == Some(Compiler::Msvc) {
        return Vec::new();
    }
    match arch {
        Some(Arch::X86) => vec!["-m32".into()],
        Some(Arch::X86_64) => vec!["-m64".into()],
        Some(Arch::Armv7) => vec!["-march=armv7-a".into()],
        Some(Arch::Armv8) | None => Vec::new(),
    }
}

fn or_default(dirs: &[String], fallback: &str) -> Vec<String> {
    if dirs.is_empty() {
        vec![fallback.to_string()]
    } else {
        dirs.to_vec()
    }
}

fn dependency_record(dep: &ResolvedDependency) -> DependencyRecord {
    DependencyRecord {
        name: dep.name.clone(),
        version: dep.version.clone(),
        revision: dep.revision.clone(),
        cache_rel: dep.cache_rel.clone(),
        include_dirs: or_default(&dep.cpp_info.include_dirs, "include"),
        lib_dirs: or_default(&dep.cpp_info.lib_dirs, "lib"),
        bin_dirs: or_default(&dep.cpp_info.bin_dirs, "bin"),
        libs: dep.cpp_info.libs.clone(),
        defines: dep.cpp_info.defines.clone(),
    }
}

pub fn generate(
    key: &BuildKey,
    backend: BackendKind,
    deps: &[ResolvedDependency],
    overrides: &Overrides,
) -> Result<Toolchain> {
    check_supported(key)?;
    let s = key.settings();
    let (cc, cxx) = default_compilers(s.compiler);

    let record = ToolchainRecord {
        backend,
        settings: key.as_map(),
        c_compiler: overrides
            .c_compiler
            .clone()
            .or_else(|| cc.map(String::from)),
        cxx_compiler: overrides
            .cxx_compiler
            .clone()
            .or_else(|| cxx.map(String::from)),
        build_type_flags: build_type_flags(s.compiler, s.build_type),
        arch_flags: arch_flags(s.compiler, s.arch),
        c_flags: overrides.c_flags.clone(),
        cxx_flags: overrides.cxx_flags.clone(),
        defines: overrides.defines.clone(),
        generator: overrides.generator.clone(),
        jobs: overrides.jobs,
        dependencies: deps.iter().map(dependency_record).collect(),
    };

    let mut files = vec![GeneratedFile {
        name: CMAKE_TOOLCHAIN.into(),
        contents: cmake_toolchain(&record),
    }];
    for dep in &record.dependencies {
        files.push(GeneratedFile {
            name: format!("{}-config.cmake", dep.name),
            contents: cmake_package_config(dep),
        });
        files.push(GeneratedFile {
            name: format!("{}-config-version.cmake", dep.name),
            contents: cmake_package_version(dep),
        });
    }
    let mut json = serde_json::to_string_pretty(&record)
        .map_err(|e| Error::ToolchainGeneration(format!("failed to encode record: {e}")))?;
    json.push('\n');
    files.push(GeneratedFile {
        name: TOOLCHAIN_RECORD.into(),
        contents: json,
    });

    Ok(Toolchain { record, files })
}

fn cmake_quote(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for c in raw.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn cmake_toolchain(r: &ToolchainRecord) -> String {
    let mut out = String::from("# Generated by kiln. Do not edit.\n\n");
    out.push_str("if(NOT DEFINED KILN_CACHE_ROOT)\n");
    out.push_str("  message(FATAL_ERROR \"KILN_CACHE_ROOT is not defined; configure with -DKILN_CACHE_ROOT=<kiln cache>\")\n");
    out.push_str("endif()\n");
    out.push_str("list(APPEND CMAKE_TRY_COMPILE_PLATFORM_VARIABLES KILN_CACHE_ROOT)\n\n");

    if let Some(bt) = r.build_type() {
        let _ = writeln!(
            out,
            "set(CMAKE_BUILD_TYPE {} CACHE STRING \"Build type\")",
            cmake_quote(bt)
        );
    }
    if let Some(cc) = &r.c_compiler {
        let _ = writeln!(out, "set(CMAKE_C_COMPILER {})", cmake_quote(cc));
    }
    if let Some(cxx) = &r.cxx_compiler {
        let _ = writeln!(out, "set(CMAKE_CXX_COMPILER {})", cmake_quote(cxx));
    }

    // CMake adds the build-type flags itself.
    let mut c_init = r.arch_flags.clone();
    c_init.extend(r.define_flags());
    let mut cxx_init = c_init.clone();
    c_init.extend(r.c_flags.iter().cloned());
    cxx_init.extend(r.cxx_flags.iter().cloned());
    if !c_init.is_empty() {
        let _ = writeln!(
            out,
            "string(APPEND CMAKE_C_FLAGS_INIT {})",
            cmake_quote(&format!(" {}", c_init.join(" ")))
        );
    }
    if !cxx_init.is_empty() {
        let _ = writeln!(
            out,
            "string(APPEND CMAKE_CXX_FLAGS_INIT {})",
            cmake_quote(&format!(" {}", cxx_init.join(" ")))
        );
    }

    out.push_str("\nset(CMAKE_FIND_PACKAGE_PREFER_CONFIG ON)\n");
    out.push_str("list(PREPEND CMAKE_PREFIX_PATH \"${CMAKE_CURRENT_LIST_DIR}\")\n");
    for dep in &r.dependencies {
        let _ = writeln!(out, "set({}_DIR \"${{CMAKE_CURRENT_LIST_DIR}}\")", dep.name);
    }
    out
}

fn under_root(dirs: &[String]) -> String {
    dirs.iter()
        .map(|d| format!("${{_kiln_root}}/{}", d.trim_matches('/')))
        .collect::<Vec<_>>()
        .join(";")
}

fn cmake_package_config(dep: &DependencyRecord) -> String {
    let target = format!("{0}::{0}", dep.name);
    let mut out = format!(
        "# Generated by kiln for {}/{}#{}. Do not edit.\n\n",
        dep.name, dep.version, dep.revision
    );
    let _ = writeln!(
        out,
        "set(_kiln_root \"${{KILN_CACHE_ROOT}}/{}\")",
        dep.cache_rel
    );
    let _ = writeln!(out, "if(NOT TARGET {target})");
    let _ = writeln!(out, "  add_library({target} INTERFACE IMPORTED)");
    let _ = writeln!(out, "  set_target_properties({target} PROPERTIES");
    let _ = writeln!(
        out,
        "    INTERFACE_INCLUDE_DIRECTORIES \"{}\"",
        under_root(&dep.include_dirs)
    );
    let _ = writeln!(
        out,
        "    INTERFACE_LINK_DIRECTORIES \"{}\"",
        under_root(&dep.lib_dirs)
    );
    if !dep.libs.is_empty() {
        let _ = writeln!(
            out,
            "    INTERFACE_LINK_LIBRARIES {}",
            cmake_quote(&dep.libs.join(";"))
        );
    }
    if !dep.defines.is_empty() {
        let _ = writeln!(
            out,
            "    INTERFACE_COMPILE_DEFINITIONS {}",
            cmake_quote(&dep.defines.join(";"))
        );
    }
    out.push_str("  )\nendif()\n\n");
    let _ = writeln!(out, "set({}_FOUND TRUE)", dep.name);
    let _ = writeln!(out, "set({}_VERSION {})", dep.name, cmake_quote(&dep.version));
    let _ = writeln!(
        out,
        "set({}_INCLUDE_DIRS \"{}\")",
        dep.name,
        under_root(&dep.include_dirs)
    );
    let _ = writeln!(out, "set({}_LIBRARIES {target})", dep.name);
    out.push_str("unset(_kiln_root)\n");
    out
}

fn cmake_package_version(dep: &DependencyRecord) -> String {
    format!(
        "# Generated by kiln. Do not edit.\n\n\
set(PACKAGE_VERSION {})\n\
if(PACKAGE_FIND_VERSION AND PACKAGE_FIND_VERSION VERSION_GREATER PACKAGE_VERSION)\n\
  set(PACKAGE_VERSION_COMPATIBLE FALSE)\n\
else()\n\
  set(PACKAGE_VERSION_COMPATIBLE TRUE)\n\
  if(PACKAGE_FIND_VERSION STREQUAL PACKAGE_VERSION)\n\
    set(PACKAGE_VERSION_EXACT TRUE)\n\
  endif()\n\
endif()\n",
        cmake_quote(&dep.version)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{PackageInfo, PackageType};
    use crate::settings::{Axis, Settings};

    fn key(assign: &[&str]) -> BuildKey {
        let mut s = Settings::default();
        s.apply_assignments(&assign.iter().map(|a| a.to_string()).collect::<Vec<_>>())
            .expect("settings");
        BuildKey::new(Axis::ALL, &s).expect("key")
    }

    fn linux_gcc() -> BuildKey {
        key(&["os=linux", "compiler=gcc", "build_type=Release", "arch=x86_64"])
    }

    fn boost() -> ResolvedDependency {
        ResolvedDependency {
            name: "boost".into(),
            version: "1.83.0".into(),
            revision: "0123456789abcdef".into(),
            package_type: PackageType::Library,
            path: PathBuf::from("/home/ci/.kiln/p/boost/1.83.0/0123456789abcdef"),
            cache_rel: "p/boost/1.83.0/0123456789abcdef".into(),
            origin: "cache".into(),
            cpp_info: PackageInfo {
                libs: vec!["boost_system".into()],
                ..Default::default()
            },
        }
    }

    #[test]
    fn output_is_deterministic_and_free_of_cache_paths() {
        let a = generate(&linux_gcc(), BackendKind::CMake, &[boost()], &Overrides::default())
            .expect("toolchain");
        let b = generate(&linux_gcc(), BackendKind::CMake, &[boost()], &Overrides::default())
            .expect("toolchain");
        assert_eq!(a, b);
        for f in &a.files {
            assert!(!f.contents.contains("/home/ci"), "{} leaks a path", f.name);
        }
        let names: Vec<&str> = a.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "kiln_toolchain.cmake",
                "boost-config.cmake",
                "boost-config-version.cmake",
                "kiln_toolchain.json"
            ]
        );
        let config = &a.files[1].contents;
        assert!(config.contains("add_library(boost::boost INTERFACE IMPORTED)"));
        assert!(config.contains("${KILN_CACHE_ROOT}/p/boost/1.83.0/0123456789abcdef"));
    }

    #[test]
    fn settings_map_to_compilers_and_flags() {
        let t = generate(&linux_gcc(), BackendKind::Command, &[], &Overrides::default())
            .expect("toolchain");
        assert_eq!(t.record.c_compiler.as_deref(), Some("gcc"));
        assert_eq!(t.record.cxx_compiler.as_deref(), Some("g++"));
        assert_eq!(t.record.effective_cxx_flags(), ["-O3", "-DNDEBUG", "-m64"]);
        let cmake = &t.files[0].contents;
        assert!(cmake.contains("set(CMAKE_BUILD_TYPE \"Release\""));
        assert!(cmake.contains("string(APPEND CMAKE_CXX_FLAGS_INIT \" -m64\")"));
    }

    #[test]
    fn overrides_win_over_computed_values() {
        let mut o = Overrides::default();
        o.set("cxx", "/opt/gcc-13/bin/g++").expect("cxx");
        o.set("cxxflags", "-Wall").expect("flags");
        o.set("define.HC_TRACE", "1").expect("define");
        let t = generate(&linux_gcc(), BackendKind::CMake, &[], &o).expect("toolchain");
        assert_eq!(t.record.cxx_compiler.as_deref(), Some("/opt/gcc-13/bin/g++"));
        assert_eq!(t.record.c_compiler.as_deref(), Some("gcc"));
        let cmake = &t.files[0].contents;
        assert!(cmake.contains("set(CMAKE_CXX_COMPILER \"/opt/gcc-13/bin/g++\")"));
        assert!(cmake.contains("-DHC_TRACE=1 -Wall"));
    }

    #[test]
    fn unsupported_combinations_fail() {
        for bad in [
            ["os=linux", "compiler=msvc", "build_type=Release", "arch=x86_64"],
            ["os=windows", "compiler=apple-clang", "build_type=Release", "arch=x86_64"],
            ["os=macos", "compiler=apple-clang", "build_type=Release", "arch=x86"],
        ] {
            let err = generate(&key(&bad), BackendKind::CMake, &[], &Overrides::default())
                .unwrap_err();
            assert!(matches!(err, Error::ToolchainGeneration(_)), "{err}");
        }
        let msvc = key(&["os=windows", "compiler=msvc", "build_type=Debug", "arch=x86_64"]);
        let t = generate(&msvc, BackendKind::CMake, &[], &Overrides::default()).expect("msvc");
        assert_eq!(t.record.build_type_flags, ["/Od", "/Zi"]);
        assert!(t.record.arch_flags.is_empty());
    }
}
