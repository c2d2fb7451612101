use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use kiln::cache::{PackageCache, PackageManifest};
use kiln::executor::{self, ExecCtx, ExecSink, StdoutSink, TracingSink};
use kiln::lifecycle::{Engine, EngineOptions, Phase, RunReport, RunRequest};
use kiln::settings::{Overrides, Profile, Settings};
use kiln::version::parse_version;
use kiln::workspace::{self, CleanMode};
use kiln::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Log output format (filter with KILN_LOG)
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, ClapArgs)]
struct KeyArgs {
    /// Path to the recipe TOML
    recipe: PathBuf,
    /// Setting value, e.g. -s build_type=Debug (repeatable, wins over profiles)
    #[arg(short = 's', long = "setting")]
    settings: Vec<String>,
    /// Override, e.g. -c cxx=/usr/bin/g++-13 (repeatable, wins over profiles)
    #[arg(short = 'c', long = "conf")]
    conf: Vec<String>,
    /// Profile TOML (repeatable; later profiles win). Without one the
    /// detected host settings are used.
    #[arg(short = 'p', long = "profile")]
    profiles: Vec<PathBuf>,
}

#[derive(Debug, ClapArgs)]
struct RunArgs {
    #[command(flatten)]
    key: KeyArgs,
    /// Package cache root (default: $KILN_HOME or ~/.kiln)
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Query remotes even when the cache already satisfies a dependency
    #[arg(long)]
    update: bool,
    /// Log what each phase would do without touching anything
    #[arg(long)]
    dry_run: bool,
    /// Print the run report as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stage exported sources into the layout
    Layout(RunArgs),
    /// Resolve dependencies and write the toolchain files
    Generate(RunArgs),
    /// Configure and compile against the generated toolchain
    Build(RunArgs),
    /// Install and assemble the package directory
    Package(RunArgs),
    /// Run the full lifecycle (layout, generate, build, package)
    Create {
        #[command(flatten)]
        run: RunArgs,
        /// Additional build key as a profile layered on the base settings
        /// (repeatable; runs the keys concurrently)
        #[arg(long = "matrix")]
        matrix: Vec<PathBuf>,
        /// Max number of keys built concurrently (0 = use CPU count)
        #[arg(long, default_value_t = 0)]
        max_parallel: usize,
    },
    /// Print the planned phase tasks
    Plan {
        /// Path to the recipe TOML
        recipe: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Print the recipe after imports/extends are merged
    Inspect {
        /// Path to the recipe TOML
        recipe: PathBuf,
    },
    /// Print the build key and layout for the given settings
    Key(KeyArgs),
    /// Copy a finished package directory into the package cache
    ExportPkg {
        package_dir: PathBuf,
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
    /// Print a profile describing this machine
    DetectProfile,
    /// Remove the recipe's build trees (and package output with --all)
    Clean {
        /// Path to the recipe TOML
        recipe: PathBuf,
        #[arg(long)]
        all: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_format);
    executor::install_interrupt_handler();

    match dispatch(args.cmd) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error ({}): {e}", e.kind());
            ExitCode::from(2)
        }
    }
}

/// `Ok(false)` means the command ran but a lifecycle phase failed.
fn dispatch(cmd: Command) -> Result<bool> {
    match cmd {
        Command::Layout(run) => cmd_run(&run, &[Phase::Layout], &[], 1),
        Command::Generate(run) => cmd_run(&run, &[Phase::Generate], &[], 1),
        Command::Build(run) => cmd_run(&run, &[Phase::Build], &[], 1),
        Command::Package(run) => cmd_run(&run, &[Phase::Package], &[], 1),
        Command::Create {
            run,
            matrix,
            max_parallel,
        } => cmd_run(&run, &Phase::ALL, &matrix, max_parallel),
        Command::Plan { recipe, dot } => cmd_plan(&recipe, dot).map(|_| true),
        Command::Inspect { recipe } => cmd_inspect(&recipe).map(|_| true),
        Command::Key(key) => cmd_key(&key).map(|_| true),
        Command::ExportPkg {
            package_dir,
            cache_dir,
        } => cmd_export(&package_dir, cache_dir).map(|_| true),
        Command::DetectProfile => {
            let profile = Profile {
                settings: Settings::detect(),
                overrides: Overrides::default(),
            };
            print!("{}", profile.to_toml());
            Ok(true)
        }
        Command::Clean { recipe, all } => cmd_clean(&recipe, all).map(|_| true),
    }
}

/// Settings and overrides from profiles, then from the command line.
fn base_request(key: &KeyArgs) -> Result<RunRequest> {
    let profile = if key.profiles.is_empty() {
        Profile {
            settings: Settings::detect(),
            overrides: Overrides::default(),
        }
    } else {
        Profile::load_layered(&key.profiles)?
    };
    let mut req = RunRequest {
        settings: profile.settings,
        overrides: profile.overrides,
    };
    apply_flags(&mut req, key)?;
    Ok(req)
}

fn apply_flags(req: &mut RunRequest, key: &KeyArgs) -> Result<()> {
    req.settings.apply_assignments(&key.settings)?;
    let mut flags = Overrides::default();
    flags.apply_assignments(&key.conf)?;
    req.overrides.merge(flags);
    Ok(())
}

fn matrix_requests(key: &KeyArgs, matrix: &[PathBuf]) -> Result<Vec<RunRequest>> {
    let base = if key.profiles.is_empty() {
        Profile::default()
    } else {
        Profile::load_layered(&key.profiles)?
    };
    let mut out = Vec::with_capacity(matrix.len());
    for path in matrix {
        let entry = Profile::load(path)?;
        let mut req = RunRequest {
            settings: base.settings,
            overrides: base.overrides.clone(),
        };
        req.settings.overlay(&entry.settings);
        req.overrides.merge(entry.overrides);
        apply_flags(&mut req, key)?;
        out.push(req);
    }
    Ok(out)
}

fn cmd_run(run: &RunArgs, phases: &[Phase], matrix: &[PathBuf], max_parallel: usize) -> Result<bool> {
    let engine = Engine::load(
        &run.key.recipe,
        &EngineOptions {
            cache_dir: run.cache_dir.clone(),
            update: run.update,
        },
    )?;
    let sink: Arc<dyn ExecSink> = if run.json {
        Arc::new(TracingSink)
    } else {
        Arc::new(StdoutSink::new(engine.workspace().error_logs_dir()))
    };
    let ctx = ExecCtx::new(run.dry_run, sink);

    let reports = if matrix.is_empty() {
        vec![engine.run(&base_request(&run.key)?, phases, &ctx)?]
    } else {
        let max_parallel = if max_parallel == 0 {
            num_cpus::get().max(1)
        } else {
            max_parallel
        };
        engine.run_matrix(&matrix_requests(&run.key, matrix)?, phases, max_parallel, &ctx)?
    };

    if run.json {
        let body: Vec<serde_json::Value> = reports.iter().map(RunReport::to_json).collect();
        let body = if body.len() == 1 {
            body.into_iter().next().unwrap_or_default()
        } else {
            serde_json::Value::Array(body)
        };
        let text = serde_json::to_string_pretty(&body)
            .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
        println!("{text}");
    } else {
        for r in &reports {
            println!("{}", r.summary());
        }
    }
    Ok(reports.iter().all(|r| r.status.is_success()))
}

fn cmd_plan(recipe: &Path, dot: bool) -> Result<()> {
    let engine = Engine::load(recipe, &EngineOptions::default())?;
    let plan = engine.plan(&[])?;
    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }
    for (i, task) in plan.lifecycle_order()?.iter().enumerate() {
        println!(
            "{:>2}. {:<18}  {:<8} {:<9}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_inspect(recipe: &Path) -> Result<()> {
    let doc = kiln::config::load(recipe)?;
    // Validate before printing so a broken recipe is not mistaken for a good one.
    kiln::recipe::Recipe::from_doc(&doc)?;
    let s = toml::to_string_pretty(&doc.value)
        .map_err(|e| Error::msg(format!("failed to render {}: {e}", recipe.display())))?;
    print!("{s}");
    Ok(())
}

fn cmd_key(key: &KeyArgs) -> Result<()> {
    let engine = Engine::load(&key.recipe, &EngineOptions::default())?;
    let req = base_request(key)?;
    let k = engine.key(&req.settings)?;
    let layout = engine.layout(&k);
    println!("reference:  {}", engine.recipe().reference());
    println!("key:        {k}");
    println!("id:         {}", k.id());
    println!("slug:       {}", k.slug());
    println!("source:     {}", layout.source_dir.display());
    println!("build:      {}", layout.build_dir.display());
    println!("generators: {}", layout.generators_dir.display());
    println!("package:    {}", layout.package_dir.display());
    Ok(())
}

fn cmd_export(package_dir: &Path, cache_dir: Option<PathBuf>) -> Result<()> {
    let manifest = PackageManifest::load(package_dir)?;
    if parse_version(&manifest.version).is_err() {
        return Err(Error::config(format!(
            "package {} has version '{}'; set [package] version to export it",
            manifest.name, manifest.version
        )));
    }
    let cache = PackageCache::open(cache_dir.unwrap_or_else(PackageCache::default_root))?;
    let pkg = cache.export(package_dir)?;
    println!(
        "exported {}/{}#{} -> {}",
        pkg.name(),
        pkg.version(),
        pkg.revision(),
        pkg.path.display()
    );
    Ok(())
}

fn cmd_clean(recipe: &Path, all: bool) -> Result<()> {
    let engine = Engine::load(recipe, &EngineOptions::default())?;
    let mode = if all { CleanMode::All } else { CleanMode::Build };
    let removed = workspace::clean(engine.workspace(), &engine.recipe().name, mode)?;
    if removed.is_empty() {
        println!("nothing to clean");
    }
    for dir in removed {
        println!("removed {}", dir.display());
    }
    Ok(())
}
