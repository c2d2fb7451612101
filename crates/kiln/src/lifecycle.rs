//! The recipe lifecycle engine: `layout -> generate -> build -> package`,
//! strictly in that order, aborting at the first failing phase.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, mpsc};

use serde::Serialize;

use crate::cache::{PackageCache, PackageManifest};
use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::{self, ExecCtx, ExecEvent, TaskRegistry};
use crate::layout::Layout;
use crate::modules;
use crate::planner::Plan;
use crate::recipe::Recipe;
use crate::remote::{Remote, build_remotes};
use crate::resolver::{ResolvedDependency, TieBreak};
use crate::settings::{BuildKey, Overrides, Settings};
use crate::workspace::{self, WorkspacePaths};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Layout,
    Generate,
    Build,
    Package,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Layout, Phase::Generate, Phase::Build, Phase::Package];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Layout => "layout",
            Phase::Generate => "generate",
            Phase::Build => "build",
            Phase::Package => "package",
        }
    }

    /// Directories this phase writes to.
    pub fn touched(self, layout: &Layout) -> Vec<PathBuf> {
        match self {
            Phase::Layout => vec![layout.source_dir.clone()],
            Phase::Generate => vec![layout.generators_dir.clone()],
            Phase::Build => vec![layout.build_dir.clone()],
            Phase::Package => vec![layout.install_staging(), layout.package_dir.clone()],
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == raw.trim())
            .ok_or_else(|| Error::config(format!("unknown phase '{raw}'")))
    }
}

/// Lazily opened package cache, shared by every invocation of an engine.
/// Phases that never resolve dependencies leave the cache untouched.
pub struct CacheHandle {
    root: PathBuf,
    cache: Mutex<Option<Arc<PackageCache>>>,
}

impl CacheHandle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn open(&self) -> Result<Arc<PackageCache>> {
        let mut slot = self
            .cache
            .lock()
            .map_err(|_| Error::msg("package cache handle poisoned"))?;
        if let Some(cache) = slot.as_ref() {
            return Ok(cache.clone());
        }
        let cache = Arc::new(PackageCache::open(&self.root)?);
        *slot = Some(cache.clone());
        Ok(cache)
    }
}

/// Everything the phase tasks of one key work with. Created by the engine
/// per key and discarded after the run.
pub struct Invocation {
    pub recipe: Arc<Recipe>,
    pub key: BuildKey,
    pub overrides: Overrides,
    pub workspace: WorkspacePaths,
    pub layout: Layout,
    pub cache: Arc<CacheHandle>,
    pub remotes: Arc<Vec<Box<dyn Remote>>>,
    pub tie_break: TieBreak,
    pub update: bool,
    /// Held while staging sources, which every key of a recipe shares.
    pub staging_lock: Arc<Mutex<()>>,
    resolved: OnceLock<Vec<ResolvedDependency>>,
    packaged: OnceLock<PackageManifest>,
}

impl Invocation {
    pub fn set_resolved(&self, deps: Vec<ResolvedDependency>) {
        let _ = self.resolved.set(deps);
    }

    pub fn resolved(&self) -> Option<&[ResolvedDependency]> {
        self.resolved.get().map(Vec::as_slice)
    }

    pub fn set_packaged(&self, manifest: PackageManifest) {
        let _ = self.packaged.set(manifest);
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub cache_dir: Option<PathBuf>,
    pub update: bool,
}

/// One key of a run: settings plus overrides.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub settings: Settings,
    pub overrides: Overrides,
}

#[derive(Debug)]
pub enum Status {
    Success,
    Failed { phase: Phase, cause: Error },
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseOutcome {
    Ok,
    Failed,
    /// Not reached because an earlier phase failed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub touched: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct RunReport {
    pub reference: String,
    pub key: BuildKey,
    pub layout: Layout,
    pub status: Status,
    pub phases: Vec<PhaseReport>,
    pub dependencies: Vec<ResolvedDependency>,
    pub package: Option<PackageManifest>,
}

impl RunReport {
    pub fn to_json(&self) -> serde_json::Value {
        let status = match &self.status {
            Status::Success => serde_json::json!({ "result": "success" }),
            Status::Failed { phase, cause } => serde_json::json!({
                "result": "failed",
                "phase": phase,
                "kind": cause.kind(),
                "message": cause.cause().to_string(),
                "output_tail": tail(cause.captured_output(), 50),
            }),
        };
        serde_json::json!({
            "reference": self.reference,
            "key": self.key.canonical(),
            "key_id": self.key.id(),
            "layout": self.layout,
            "status": status,
            "phases": self.phases,
            "dependencies": self.dependencies,
            "package": self.package.as_ref().map(|m| serde_json::json!({
                "name": m.name,
                "version": m.version,
                "revision": m.revision,
                "files": m.files.len(),
            })),
        })
    }

    /// Human-readable terminal status.
    pub fn summary(&self) -> String {
        match &self.status {
            Status::Success => format!("{} [{}]: success", self.reference, self.key),
            Status::Failed { phase, cause } => {
                let mut out = format!(
                    "{} [{}]: failed in phase '{phase}' ({}): {}",
                    self.reference,
                    self.key,
                    cause.kind(),
                    cause.cause()
                );
                let lines = tail(cause.captured_output(), 20);
                if !lines.is_empty() {
                    out.push_str("\n  last output:");
                    for l in lines {
                        out.push_str("\n    ");
                        out.push_str(l);
                    }
                }
                out
            }
        }
    }
}

fn tail(lines: &[String], n: usize) -> &[String] {
    &lines[lines.len().saturating_sub(n)..]
}

pub struct Engine {
    doc: ConfigDoc,
    recipe: Arc<Recipe>,
    workspace: WorkspacePaths,
    cache: Arc<CacheHandle>,
    remotes: Arc<Vec<Box<dyn Remote>>>,
    update: bool,
    registry: TaskRegistry,
    staging_lock: Arc<Mutex<()>>,
}

impl Engine {
    pub fn load(recipe_path: &Path, opts: &EngineOptions) -> Result<Self> {
        let doc = crate::config::load(recipe_path)?;
        Self::from_doc(doc, opts)
    }

    pub fn from_doc(doc: ConfigDoc, opts: &EngineOptions) -> Result<Self> {
        let recipe = Recipe::from_doc(&doc)?;
        let workspace = workspace::load_paths(&recipe.dir, &recipe.workspace)?;
        let cache_root = match (&opts.cache_dir, &recipe.resolver.cache_dir) {
            (Some(dir), _) => dir.clone(),
            (None, Some(dir)) => recipe.dir.join(dir),
            (None, None) => PackageCache::default_root(),
        };
        let remotes = build_remotes(&recipe.resolver.remotes, &recipe.dir)?;
        Ok(Self {
            doc,
            update: opts.update || recipe.resolver.update,
            recipe: Arc::new(recipe),
            workspace,
            cache: Arc::new(CacheHandle::new(cache_root)),
            remotes: Arc::new(remotes),
            registry: executor::builtin_registry()?,
            staging_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    pub fn doc(&self) -> &ConfigDoc {
        &self.doc
    }

    pub fn workspace(&self) -> &WorkspacePaths {
        &self.workspace
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    /// The build key for `settings`, restricted to the recipe's axes.
    pub fn key(&self, settings: &Settings) -> Result<BuildKey> {
        BuildKey::new(&self.recipe.settings, settings)
    }

    pub fn layout(&self, key: &BuildKey) -> Layout {
        Layout::resolve(&self.workspace, &self.recipe.name, key)
    }

    /// Plan the given phases (all four when `phases` is empty).
    pub fn plan(&self, phases: &[Phase]) -> Result<Plan> {
        let mut plan = Plan::default();
        let mut claimed = false;
        for module in modules::builtin_modules() {
            if module.detect(&self.doc) {
                tracing::debug!(module = module.id(), "planning module");
                module.plan(&mut plan)?;
                claimed = true;
            }
        }
        if !claimed {
            return Err(Error::config(format!(
                "no module handles {}",
                self.doc.path.display()
            )));
        }
        if !phases.is_empty() {
            plan.retain_phases(phases);
        }
        plan.lifecycle_order()?;
        Ok(plan)
    }

    fn invocation(&self, key: BuildKey, overrides: Overrides) -> Invocation {
        Invocation {
            recipe: self.recipe.clone(),
            layout: self.layout(&key),
            key,
            overrides,
            workspace: self.workspace.clone(),
            cache: self.cache.clone(),
            remotes: self.remotes.clone(),
            tie_break: self.recipe.resolver.tie_break,
            update: self.update,
            staging_lock: self.staging_lock.clone(),
            resolved: OnceLock::new(),
            packaged: OnceLock::new(),
        }
    }

    /// Run `phases` for one key and emit the executor summary.
    pub fn run(&self, req: &RunRequest, phases: &[Phase], ctx: &ExecCtx) -> Result<RunReport> {
        let res = self.run_key(req, phases, ctx);
        emit_done(ctx, res.as_ref().map(|r| std::slice::from_ref(r)));
        res
    }

    fn run_key(&self, req: &RunRequest, phases: &[Phase], ctx: &ExecCtx) -> Result<RunReport> {
        let key = self.key(&req.settings)?;
        let plan = self.plan(phases)?;
        let planned: Vec<Phase> = {
            let mut p: Vec<Phase> = plan.tasks().map(|t| t.phase).collect();
            p.sort();
            p.dedup();
            p
        };
        let inv = self.invocation(key, req.overrides.clone());
        tracing::info!(
            recipe = %self.recipe.reference(),
            key = %inv.key,
            phases = ?planned.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
            dry_run = ctx.dry_run,
            "starting lifecycle"
        );

        let mut task_ctx = ctx.clone();
        let status = match executor::execute_plan(&inv, &plan, &self.registry, &mut task_ctx) {
            Ok(()) => Status::Success,
            Err(e) => match e.phase() {
                Some(phase) => Status::Failed { phase, cause: e },
                None => return Err(e),
            },
        };

        let failed_at = match &status {
            Status::Failed { phase, .. } => Some(*phase),
            Status::Success => None,
        };
        let phases = planned
            .iter()
            .map(|&phase| {
                let outcome = match failed_at {
                    Some(f) if phase == f => PhaseOutcome::Failed,
                    Some(f) if phase > f => PhaseOutcome::Skipped,
                    _ => PhaseOutcome::Ok,
                };
                let touched = if ctx.dry_run || outcome == PhaseOutcome::Skipped {
                    Vec::new()
                } else {
                    phase.touched(&inv.layout)
                };
                PhaseReport {
                    phase,
                    outcome,
                    touched,
                }
            })
            .collect();

        match &status {
            Status::Success => tracing::info!(key = %inv.key, "lifecycle finished"),
            Status::Failed { phase, cause } => {
                tracing::error!(key = %inv.key, %phase, kind = cause.kind(), "lifecycle failed: {}", cause.cause())
            }
        }
        Ok(RunReport {
            reference: self.recipe.reference(),
            layout: inv.layout.clone(),
            key: inv.key,
            status,
            phases,
            dependencies: inv.resolved().map(<[_]>::to_vec).unwrap_or_default(),
            package: inv.packaged.get().cloned(),
        })
    }

    /// Run several keys concurrently, at most `max_parallel` at a time.
    /// Reports come back in request order; one key failing does not stop
    /// the others.
    pub fn run_matrix(
        &self,
        reqs: &[RunRequest],
        phases: &[Phase],
        max_parallel: usize,
        ctx: &ExecCtx,
    ) -> Result<Vec<RunReport>> {
        let res = self.run_matrix_inner(reqs, phases, max_parallel, ctx);
        emit_done(ctx, res.as_deref());
        res
    }

    fn run_matrix_inner(
        &self,
        reqs: &[RunRequest],
        phases: &[Phase],
        max_parallel: usize,
        ctx: &ExecCtx,
    ) -> Result<Vec<RunReport>> {
        let mut seen = BTreeSet::new();
        for req in reqs {
            let key = self.key(&req.settings)?;
            if !seen.insert(key) {
                return Err(Error::config(format!(
                    "matrix lists build key [{key}] more than once"
                )));
            }
        }
        // Fail fast on planning problems before any worker starts.
        self.plan(phases)?;

        let workers = max_parallel.clamp(1, reqs.len().max(1));
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<(usize, Result<RunReport>)>();
        std::thread::scope(|s| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                s.spawn(move || {
                    loop {
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(req) = reqs.get(i) else {
                            break;
                        };
                        let scope = self
                            .key(&req.settings)
                            .map(|k| k.slug())
                            .unwrap_or_else(|_| format!("key{i}"));
                        let res = self.run_key(req, phases, &ctx.scoped(scope));
                        if tx.send((i, res)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);

        let mut slots: Vec<Option<Result<RunReport>>> = reqs.iter().map(|_| None).collect();
        for (i, res) in rx {
            slots[i] = Some(res);
        }
        slots
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::msg("matrix worker exited early"))))
            .collect()
    }
}

fn emit_done(ctx: &ExecCtx, reports: std::result::Result<&[RunReport], &Error>) {
    let (ok, error) = match reports {
        Ok(reports) => {
            let failed: Vec<String> = reports
                .iter()
                .filter(|r| !r.status.is_success())
                .map(RunReport::summary)
                .collect();
            (failed.is_empty(), (!failed.is_empty()).then(|| failed.join("\n")))
        }
        Err(e) => (false, Some(e.to_string())),
    };
    ctx.sink.emit(ExecEvent::ExecutorDone { ok, error });
}
