#![cfg(unix)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};

use kiln::Error;
use kiln::cache::{MANIFEST_FILE, PackageManifest};
use kiln::executor::{ChannelSink, ExecCtx, ExecEvent, NullSink};
use kiln::lifecycle::{Engine, EngineOptions, Phase, PhaseOutcome, RunRequest, Status};
use kiln::modules::util;
use kiln::recipe::{PackageInfo, PackageType};
use kiln::settings::{Overrides, Settings};

const BUILD_SH: &str = r#"set -e
printf 'flags: %s\n' "$CXXFLAGS" > "$1/hc_db"
cat "$KILN_SOURCE_DIR/src/main.cpp" >> "$1/hc_db"
echo "compiled hc_db"
"#;

const INSTALL_SH: &str = r#"set -e
mkdir -p "$1/bin" "$1/include" "$1/lib"
cp "$KILN_BUILD_DIR/hc_db" "$1/bin/hc_db"
echo "int hc;" > "$1/include/hc.h"
echo "archive" > "$1/lib/libhc.a"
"#;

fn write(path: &Path, body: &str) {
    util::write_text(path, body).unwrap();
}

/// A recipe directory for an application built by small shell scripts.
fn hc_db_recipe(root: &Path, build_table: &str, extra: &str) -> PathBuf {
    write(&root.join("src/main.cpp"), "int main() { return 0; }\n");
    write(&root.join("build.sh"), BUILD_SH);
    write(&root.join("install.sh"), INSTALL_SH);
    let path = root.join("kiln.toml");
    write(
        &path,
        &format!(
            r#"{extra}

[package]
name = "hc_db"
version = "0.4.1"
package_type = "application"
settings = ["os", "build_type"]
exports_sources = ["src/*", "*.sh"]

[build]
backend = "command"
{build_table}
"#
        ),
    );
    path
}

fn scripted_build() -> &'static str {
    r#"compile = ["sh", "{source_dir}/build.sh", "{build_dir}"]
install = ["sh", "{source_dir}/install.sh", "{install_dir}"]"#
}

fn engine(recipe: &Path, cache: &Path) -> Engine {
    Engine::load(
        recipe,
        &EngineOptions {
            cache_dir: Some(cache.to_path_buf()),
            update: false,
        },
    )
    .unwrap()
}

fn request(build_type: &str) -> RunRequest {
    let mut settings = Settings::default();
    settings
        .apply_assignments(&["os=linux".to_string(), format!("build_type={build_type}")])
        .unwrap();
    RunRequest {
        settings,
        overrides: Overrides::default(),
    }
}

fn quiet() -> ExecCtx {
    ExecCtx::new(false, Arc::new(NullSink))
}

/// Write a library package tree into a dir remote at
/// `<remote>/<name>/<version>/<revision>/` and return the revision.
fn publish(remote: &Path, name: &str, version: &str, header: &str) -> String {
    let scratch = tempfile::tempdir().unwrap();
    write(&scratch.path().join(format!("include/{name}/version.hpp")), header);
    write(&scratch.path().join(format!("lib/lib{name}_system.a")), "archive\n");
    let files = util::tree_digests(scratch.path(), &[MANIFEST_FILE]).unwrap();
    let revision = PackageManifest::revision_for(&files);
    PackageManifest {
        name: name.into(),
        version: version.into(),
        revision: revision.clone(),
        package_type: PackageType::Library,
        settings: BTreeMap::new(),
        cpp_info: PackageInfo {
            libs: vec![format!("{name}_system")],
            ..Default::default()
        },
        files,
    }
    .write(scratch.path())
    .unwrap();
    util::copy_tree(scratch.path(), &remote.join(name).join(version).join(&revision)).unwrap();
    revision
}

#[test]
fn create_runs_all_phases_and_packages_the_application() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe = hc_db_recipe(tmp.path(), scripted_build(), "");
    let engine = engine(&recipe, &tmp.path().join("cache"));

    let (tx, rx) = mpsc::channel();
    let ctx = ExecCtx::new(false, Arc::new(ChannelSink::new(tx)));
    let report = engine.run(&request("Release"), &Phase::ALL, &ctx).unwrap();
    assert!(report.status.is_success(), "unexpected status: {:?}", report.status);

    let started: Vec<String> = rx
        .try_iter()
        .filter_map(|ev| match ev {
            ExecEvent::TaskStarted { id } => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(
        started,
        ["recipe.layout", "recipe.generate", "recipe.build", "recipe.package"]
    );

    let l = &report.layout;
    assert!(l.source_dir.join("src/main.cpp").is_file());
    assert!(l.generators_dir.join("kiln_toolchain.json").is_file());
    let binary = fs::read_to_string(l.package_dir.join("bin/hc_db")).unwrap();
    assert!(binary.contains("-O3"), "release flags missing: {binary}");
    assert!(l.package_dir.join(MANIFEST_FILE).is_file());
    // Headers and static archives are not part of an application package.
    assert!(!l.package_dir.join("include").exists());
    assert!(!l.package_dir.join("lib").exists());

    let manifest = report.package.expect("package manifest");
    assert_eq!(manifest.name, "hc_db");
    assert_eq!(manifest.version, "0.4.1");
    assert_eq!(manifest.files.keys().collect::<Vec<_>>(), ["bin/hc_db"]);
    assert!(report.phases.iter().all(|p| p.outcome == PhaseOutcome::Ok));
}

#[test]
fn repackaging_is_byte_identical() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe = hc_db_recipe(tmp.path(), scripted_build(), "");
    let engine = engine(&recipe, &tmp.path().join("cache"));

    let first = engine.run(&request("Release"), &Phase::ALL, &quiet()).unwrap();
    let before = util::tree_digests(&first.layout.package_dir, &[]).unwrap();
    let second = engine.run(&request("Release"), &Phase::ALL, &quiet()).unwrap();
    let after = util::tree_digests(&second.layout.package_dir, &[]).unwrap();

    assert_eq!(before, after);
    assert_eq!(
        first.package.unwrap().revision,
        second.package.unwrap().revision
    );
}

#[test]
fn build_failure_keeps_exit_code_and_output() {
    let tmp = tempfile::tempdir().unwrap();
    let failing = r#"compile = ["sh", "-c", "echo 'main.cpp:1: error: boom' >&2; exit 3"]
install = ["sh", "{source_dir}/install.sh", "{install_dir}"]"#;
    let recipe = hc_db_recipe(tmp.path(), failing, "");
    let engine = engine(&recipe, &tmp.path().join("cache"));

    let report = engine.run(&request("Debug"), &Phase::ALL, &quiet()).unwrap();
    let Status::Failed { phase, cause } = &report.status else {
        panic!("expected failure, got {:?}", report.status);
    };
    assert_eq!(*phase, Phase::Build);
    match cause.cause() {
        Error::BuildFailed { exit_code, output } => {
            assert_eq!(*exit_code, Some(3));
            assert!(
                output.iter().any(|l| l.contains("main.cpp:1: error: boom")),
                "output not captured: {output:?}"
            );
        }
        other => panic!("unexpected err: {other}"),
    }

    let outcomes: Vec<(Phase, PhaseOutcome)> =
        report.phases.iter().map(|p| (p.phase, p.outcome)).collect();
    assert_eq!(
        outcomes,
        [
            (Phase::Layout, PhaseOutcome::Ok),
            (Phase::Generate, PhaseOutcome::Ok),
            (Phase::Build, PhaseOutcome::Failed),
            (Phase::Package, PhaseOutcome::Skipped),
        ]
    );
    assert!(!report.layout.package_dir.exists());
    assert!(report.package.is_none());
}

#[test]
fn build_without_generate_fails_in_the_build_phase() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe = hc_db_recipe(tmp.path(), scripted_build(), "");
    let engine = engine(&recipe, &tmp.path().join("cache"));

    engine.run(&request("Release"), &[Phase::Layout], &quiet()).unwrap();
    let report = engine.run(&request("Release"), &[Phase::Build], &quiet()).unwrap();
    let Status::Failed { phase, cause } = &report.status else {
        panic!("expected failure, got {:?}", report.status);
    };
    assert_eq!(*phase, Phase::Build);
    assert!(
        cause.to_string().contains("generate phase"),
        "unexpected err: {cause}"
    );
}

#[test]
fn phases_can_run_one_at_a_time() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe = hc_db_recipe(tmp.path(), scripted_build(), "");
    let engine = engine(&recipe, &tmp.path().join("cache"));

    for phase in Phase::ALL {
        let report = engine.run(&request("Release"), &[phase], &quiet()).unwrap();
        assert!(report.status.is_success(), "{phase}: {:?}", report.status);
        assert_eq!(report.phases.len(), 1);
        assert_eq!(report.phases[0].touched, phase.touched(&report.layout));
    }
    let key = engine.key(&request("Release").settings).unwrap();
    assert!(engine.layout(&key).package_dir.join("bin/hc_db").is_file());
}

#[test]
fn matrix_builds_each_key_in_its_own_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe = hc_db_recipe(tmp.path(), scripted_build(), "");
    let engine = engine(&recipe, &tmp.path().join("cache"));

    let reqs = [request("Debug"), request("Release")];
    let reports = engine.run_matrix(&reqs, &Phase::ALL, 2, &quiet()).unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.status.is_success()));
    assert_eq!(reports[0].key.settings().build_type.unwrap().as_str(), "Debug");
    assert_ne!(reports[0].layout.build_dir, reports[1].layout.build_dir);
    assert_ne!(reports[0].layout.package_dir, reports[1].layout.package_dir);
    assert_eq!(reports[0].layout.source_dir, reports[1].layout.source_dir);

    let debug = fs::read_to_string(reports[0].layout.package_dir.join("bin/hc_db")).unwrap();
    let release = fs::read_to_string(reports[1].layout.package_dir.join("bin/hc_db")).unwrap();
    assert!(debug.contains("-g"), "debug flags missing: {debug}");
    assert!(release.contains("-O3"), "release flags missing: {release}");
}

const BOOST_REMOTE: &str = r#"
requires = ["boost/>=1.83.0"]

[resolver]
remotes = [{ name = "local", kind = "dir", path = "remote" }]
"#;

#[test]
fn dependencies_resolve_from_a_dir_remote_into_the_toolchain() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    publish(&remote, "boost", "1.83.0", "// 1.83\n");
    let picked = publish(&remote, "boost", "1.84.0", "// 1.84\n");
    publish(&remote, "boost", "2.0.0", "// 2.0\n");
    let recipe = hc_db_recipe(tmp.path(), scripted_build(), BOOST_REMOTE);
    let engine = engine(&recipe, &tmp.path().join("cache"));

    let report = engine
        .run(&request("Release"), &[Phase::Layout, Phase::Generate], &quiet())
        .unwrap();
    assert!(report.status.is_success(), "unexpected status: {:?}", report.status);
    assert_eq!(report.dependencies.len(), 1);
    let dep = &report.dependencies[0];
    assert_eq!(dep.version, "1.84.0");
    assert_eq!(dep.revision, picked);
    assert_eq!(dep.origin, "local");
    assert!(dep.path.join("include/boost/version.hpp").is_file());

    let config =
        fs::read_to_string(report.layout.generators_dir.join("boost-config.cmake")).unwrap();
    assert!(config.contains("${KILN_CACHE_ROOT}"), "{config}");
    assert!(config.contains(&format!("p/boost/1.84.0/{picked}")), "{config}");
    assert!(!config.contains(&tmp.path().to_string_lossy().into_owned()));

    // The second resolution is served from the cache.
    let again = engine
        .run(&request("Release"), &[Phase::Generate], &quiet())
        .unwrap();
    assert_eq!(again.dependencies[0].origin, "cache");
    assert_eq!(again.dependencies[0].revision, picked);
}

/// Compiles hc_db against the boost headers the generated config points at.
const BUILD_WITH_BOOST_SH: &str = r#"set -e
sh "$KILN_SOURCE_DIR/build.sh" "$1"
rel=$(grep -o 'p/boost/[0-9.]*/[0-9a-f]*' "$KILN_GENERATORS_DIR/boost-config.cmake" | head -n 1)
cat "$KILN_CACHE_ROOT/$rel/include/boost/version.hpp" >> "$1/hc_db"
"#;

#[test]
fn create_builds_against_the_resolved_dependency() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    publish(&remote, "boost", "1.83.0", "// boost 1.83\n");
    publish(&remote, "boost", "1.84.0", "// boost 1.84\n");
    publish(&remote, "boost", "2.0.0", "// boost 2.0\n");
    let build = r#"compile = ["sh", "{source_dir}/build_with_boost.sh", "{build_dir}"]
install = ["sh", "{source_dir}/install.sh", "{install_dir}"]"#;
    let recipe = hc_db_recipe(tmp.path(), build, BOOST_REMOTE);
    write(&tmp.path().join("build_with_boost.sh"), BUILD_WITH_BOOST_SH);
    let engine = engine(&recipe, &tmp.path().join("cache"));

    let report = engine.run(&request("Release"), &Phase::ALL, &quiet()).unwrap();
    assert!(report.status.is_success(), "unexpected status: {:?}", report.status);
    assert_eq!(report.dependencies.len(), 1);
    assert_eq!(report.dependencies[0].name, "boost");
    assert_eq!(report.dependencies[0].version, "1.84.0");

    let pkg = &report.layout.package_dir;
    let binary = fs::read_to_string(pkg.join("bin/hc_db")).unwrap();
    assert!(binary.contains("// boost 1.84"), "boost headers not used: {binary}");
    assert!(!binary.contains("// boost 2.0"));

    let files = util::tree_digests(pkg, &[]).unwrap();
    assert!(files.contains_key("bin/hc_db"));
    assert!(
        files.keys().all(|f| !f.contains("boost") && !f.starts_with("include/")),
        "dependency files leaked into the package: {files:?}"
    );
    let manifest = report.package.expect("package manifest");
    assert_eq!(manifest.files.keys().collect::<Vec<_>>(), ["bin/hc_db"]);
}

#[test]
fn competing_revisions_fail_closed() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    publish(&remote, "boost", "1.84.0", "// first build\n");
    publish(&remote, "boost", "1.84.0", "// second build\n");
    let recipe = hc_db_recipe(tmp.path(), scripted_build(), BOOST_REMOTE);
    let engine = engine(&recipe, &tmp.path().join("cache"));

    let report = engine.run(&request("Release"), &Phase::ALL, &quiet()).unwrap();
    let Status::Failed { phase, cause } = &report.status else {
        panic!("expected failure, got {:?}", report.status);
    };
    assert_eq!(*phase, Phase::Generate);
    match cause.cause() {
        Error::AmbiguousDependency { name, candidates, .. } => {
            assert_eq!(name, "boost");
            assert_eq!(candidates.len(), 2);
        }
        other => panic!("unexpected err: {other}"),
    }
    assert!(!report.layout.generators_dir.join("kiln_toolchain.json").exists());
}

#[test]
fn missing_dependency_is_unresolved() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe = hc_db_recipe(
        tmp.path(),
        scripted_build(),
        r#"requires = ["zlib/1.3.1"]"#,
    );
    let engine = engine(&recipe, &tmp.path().join("cache"));

    let report = engine.run(&request("Release"), &Phase::ALL, &quiet()).unwrap();
    let Status::Failed { phase, cause } = &report.status else {
        panic!("expected failure, got {:?}", report.status);
    };
    assert_eq!(*phase, Phase::Generate);
    assert!(
        matches!(cause.cause(), Error::UnresolvedDependency { name, .. } if name == "zlib"),
        "unexpected err: {cause}"
    );
}
