//! The four lifecycle phases of a recipe, as planner tasks.

use kiln_macros::{Module, Task};

use crate::backend::{self, BuildBackend, BuildRequest};
use crate::executor::ExecCtx;
use crate::layout;
use crate::lifecycle::Invocation;
use crate::modules::util;
use crate::packager;
use crate::resolver::Resolver;
use crate::toolchain::{self, ToolchainRecord};
use crate::{Error, Result};

#[Task(
    id = "recipe.layout",
    module = "recipe",
    phase = Layout,
    provides = ["phase:layout"],
    label = "Stage exported sources"
)]
pub struct LayoutTask;

impl LayoutTask {
    fn run(inv: &Invocation, ctx: &mut ExecCtx) -> Result<()> {
        let l = &inv.layout;
        let report = {
            let _guard = inv
                .staging_lock
                .lock()
                .map_err(|_| Error::msg("source staging lock poisoned"))?;
            util::ensure_dir(&l.source_dir)?;
            layout::stage_sources(
                &inv.recipe.dir,
                &inv.recipe.exports_sources,
                &inv.workspace,
                &l.source_dir,
            )?
        };
        for pattern in &report.unmatched {
            ctx.log(&format!("WARN: exports_sources pattern '{pattern}' matched no files"));
        }
        util::ensure_dir(&l.build_dir)?;
        ctx.log(&format!(
            "staged {} -> {} (copied={}, unchanged={}, removed={})",
            inv.recipe.dir.display(),
            l.source_dir.display(),
            report.copied,
            report.unchanged,
            report.removed
        ));
        Ok(())
    }

    fn preview(inv: &Invocation, ctx: &mut ExecCtx) -> Result<()> {
        let l = &inv.layout;
        ctx.log(&format!("source dir:     {}", l.source_dir.display()));
        ctx.log(&format!("build dir:      {}", l.build_dir.display()));
        ctx.log(&format!("generators dir: {}", l.generators_dir.display()));
        ctx.log(&format!("package dir:    {}", l.package_dir.display()));
        ctx.log(&format!(
            "would stage [{}] from {}",
            inv.recipe.exports_sources.join(", "),
            inv.recipe.dir.display()
        ));
        Ok(())
    }
}

#[Task(
    id = "recipe.generate",
    module = "recipe",
    phase = Generate,
    after = ["phase:layout?"],
    provides = ["phase:generate"],
    label = "Resolve dependencies and generate toolchain"
)]
pub struct GenerateTask;

impl GenerateTask {
    fn run(inv: &Invocation, ctx: &mut ExecCtx) -> Result<()> {
        let recipe = &inv.recipe;
        // Reject an inconsistent [build] table before any network access.
        let backend = backend::select(recipe.build.backend, &recipe.build)?;

        let deps = if recipe.requires.is_empty() {
            Vec::new()
        } else {
            let cache = inv.cache.open()?;
            let resolver = Resolver::new(&cache, &inv.remotes, inv.tie_break, inv.update);
            resolver.resolve_all(&recipe.requires)?
        };
        for dep in &deps {
            ctx.log(&format!("resolved {dep} ({}) -> {}", dep.origin, dep.path.display()));
        }

        let tc = toolchain::generate(&inv.key, backend.kind(), &deps, &inv.overrides)?;
        let dir = &inv.layout.generators_dir;
        util::remove_dir_if_exists(dir)?;
        for path in tc.write(dir)? {
            ctx.log(&format!("wrote {}", path.display()));
        }
        inv.set_resolved(deps);
        Ok(())
    }

    fn preview(inv: &Invocation, ctx: &mut ExecCtx) -> Result<()> {
        let recipe = &inv.recipe;
        backend::select(recipe.build.backend, &recipe.build)?;
        for dep in &recipe.requires {
            ctx.log(&format!(
                "would resolve {dep} (cache {}, tie-break {:?})",
                inv.cache.root().display(),
                inv.tie_break
            ));
        }
        ctx.log(&format!(
            "would write {} toolchain files into {}",
            recipe.build.backend,
            inv.layout.generators_dir.display()
        ));
        Ok(())
    }
}

/// Read back the toolchain record written by `generate` and check that it
/// belongs to this key.
fn load_record(inv: &Invocation) -> Result<ToolchainRecord> {
    let path = inv.layout.toolchain_record();
    if !path.is_file() {
        return Err(Error::msg(format!(
            "no toolchain record at {}; run the generate phase first",
            path.display()
        )));
    }
    let record = ToolchainRecord::load(&path)?;
    if record.settings != inv.key.as_map() {
        return Err(Error::msg(format!(
            "toolchain record {} was generated for different settings; run the generate phase again",
            path.display()
        )));
    }
    Ok(record)
}

fn with_backend<T>(
    inv: &Invocation,
    f: impl FnOnce(&dyn BuildBackend, &BuildRequest<'_>) -> Result<T>,
) -> Result<T> {
    let record = load_record(inv)?;
    let backend = backend::select(record.backend, &inv.recipe.build)?;
    let cache_root = if record.dependencies.is_empty() {
        inv.cache.root().to_path_buf()
    } else {
        inv.cache.open()?.root().to_path_buf()
    };
    let req = BuildRequest {
        layout: &inv.layout,
        record: &record,
        config: &inv.recipe.build,
        cache_root: &cache_root,
    };
    f(backend.as_ref(), &req)
}

#[Task(
    id = "recipe.build",
    module = "recipe",
    phase = Build,
    after = ["phase:generate?"],
    provides = ["phase:build"],
    label = "Configure and compile"
)]
pub struct BuildTask;

impl BuildTask {
    fn run(inv: &Invocation, ctx: &mut ExecCtx) -> Result<()> {
        let l = &inv.layout;
        if !l.source_dir.is_dir() {
            return Err(Error::msg(format!(
                "no staged sources at {}; run the layout phase first",
                l.source_dir.display()
            )));
        }
        with_backend(inv, |backend, req| {
            util::ensure_dir(&l.build_dir)?;
            ctx.log(&format!("configure ({})", backend.kind()));
            backend.configure(req, ctx)?;
            ctx.log(&format!("compile ({})", backend.kind()));
            backend.compile(req, ctx)
        })
    }

    fn preview(inv: &Invocation, ctx: &mut ExecCtx) -> Result<()> {
        ctx.log(&format!(
            "would configure {} into {} and compile it",
            inv.layout.source_dir.display(),
            inv.layout.build_dir.display()
        ));
        Ok(())
    }
}

#[Task(
    id = "recipe.package",
    module = "recipe",
    phase = Package,
    after = ["phase:build?"],
    provides = ["phase:package"],
    label = "Install and package"
)]
pub struct PackageTask;

impl PackageTask {
    fn run(inv: &Invocation, ctx: &mut ExecCtx) -> Result<()> {
        let l = &inv.layout;
        let staging = l.install_staging();
        with_backend(inv, |backend, req| {
            util::remove_dir_if_exists(&staging)?;
            util::ensure_dir(&staging)?;
            ctx.log(&format!("install ({}) -> {}", backend.kind(), staging.display()));
            backend.install(req, &staging, ctx)
        })?;
        let report = packager::assemble(&inv.recipe, &inv.key, &staging, &l.package_dir)?;
        ctx.log(&format!(
            "packaged {}/{}#{} ({} files) -> {}",
            report.manifest.name,
            report.manifest.version,
            report.manifest.revision,
            report.manifest.files.len(),
            report.package_dir.display()
        ));
        inv.set_packaged(report.manifest);
        Ok(())
    }

    fn preview(inv: &Invocation, ctx: &mut ExecCtx) -> Result<()> {
        ctx.log(&format!(
            "would install into {} and package the {} artifacts into {}",
            inv.layout.install_staging().display(),
            inv.recipe.package_type,
            inv.layout.package_dir.display()
        ));
        Ok(())
    }
}

#[Module(
    id = "recipe",
    detect = "package",
    tasks = [LayoutTask, GenerateTask, BuildTask, PackageTask]
)]
pub struct RecipeModule;
