//! Build backends: how the native build system is configured, compiled and
//! installed. The backend is chosen once during `generate`, recorded in the
//! toolchain record, and reused by `build` and `package`.

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::layout::Layout;
use crate::recipe::BuildConfig;
use crate::toolchain::{CMAKE_TOOLCHAIN, ToolchainRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    CMake,
    Command,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::CMake => "cmake",
            BackendKind::Command => "command",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a backend step needs to know about one invocation.
pub struct BuildRequest<'a> {
    pub layout: &'a Layout,
    pub record: &'a ToolchainRecord,
    pub config: &'a BuildConfig,
    /// Value handed to the build system as `KILN_CACHE_ROOT`.
    pub cache_root: &'a Path,
}

impl BuildRequest<'_> {
    fn jobs(&self) -> usize {
        self.record.jobs.unwrap_or_else(num_cpus::get).max(1)
    }
}

pub trait BuildBackend {
    fn kind(&self) -> BackendKind;
    fn configure(&self, req: &BuildRequest<'_>, ctx: &ExecCtx) -> Result<()>;
    fn compile(&self, req: &BuildRequest<'_>, ctx: &ExecCtx) -> Result<()>;
    /// Install the build results under `dest`.
    fn install(&self, req: &BuildRequest<'_>, dest: &Path, ctx: &ExecCtx) -> Result<()>;
}

/// Check `config` against the backend it names and return that backend.
pub fn select(kind: BackendKind, config: &BuildConfig) -> Result<Box<dyn BuildBackend>> {
    match kind {
        BackendKind::CMake => {
            if !(config.configure.is_empty() && config.compile.is_empty() && config.install.is_empty()) {
                return Err(Error::config(
                    "[build] configure/compile/install are only valid with backend = \"command\"",
                ));
            }
            Ok(Box::new(CMakeBackend))
        }
        BackendKind::Command => {
            if config.compile.is_empty() {
                return Err(Error::config(
                    "backend \"command\" needs a non-empty [build] compile argv",
                ));
            }
            if config.generator.is_some() {
                return Err(Error::config(
                    "[build] generator is only valid with backend = \"cmake\"",
                ));
            }
            Ok(Box::new(CommandBackend))
        }
    }
}

pub struct CMakeBackend;

impl CMakeBackend {
    fn cmake() -> Command {
        Command::new(std::env::var_os("KILN_CMAKE").unwrap_or_else(|| "cmake".into()))
    }
}

impl BuildBackend for CMakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::CMake
    }

    fn configure(&self, req: &BuildRequest<'_>, ctx: &ExecCtx) -> Result<()> {
        let l = req.layout;
        let mut cmd = Self::cmake();
        cmd.arg("-S")
            .arg(&l.source_dir)
            .arg("-B")
            .arg(&l.build_dir)
            .arg(format!(
                "-DCMAKE_TOOLCHAIN_FILE={}",
                l.generators_dir.join(CMAKE_TOOLCHAIN).display()
            ))
            .arg(format!("-DKILN_CACHE_ROOT={}", req.cache_root.display()));
        let generator = req.record.generator.as_ref().or(req.config.generator.as_ref());
        if let Some(g) = generator {
            cmd.arg("-G").arg(g);
        }
        cmd.args(&req.config.configure_args);
        ctx.run_cmd(cmd)
    }

    fn compile(&self, req: &BuildRequest<'_>, ctx: &ExecCtx) -> Result<()> {
        let mut cmd = Self::cmake();
        cmd.arg("--build").arg(&req.layout.build_dir);
        if let Some(bt) = req.record.build_type() {
            cmd.arg("--config").arg(bt);
        }
        cmd.arg("--parallel").arg(req.jobs().to_string());
        cmd.args(&req.config.build_args);
        ctx.run_cmd(cmd)
    }

    fn install(&self, req: &BuildRequest<'_>, dest: &Path, ctx: &ExecCtx) -> Result<()> {
        let mut cmd = Self::cmake();
        cmd.arg("--install").arg(&req.layout.build_dir);
        if let Some(bt) = req.record.build_type() {
            cmd.arg("--config").arg(bt);
        }
        cmd.arg("--prefix").arg(dest);
        ctx.run_cmd(cmd)
    }
}

/// Runs recipe-declared argv lists in the build directory.
pub struct CommandBackend;

impl CommandBackend {
    fn command(
        &self,
        step: &str,
        argv: &[String],
        req: &BuildRequest<'_>,
        install_dir: &Path,
    ) -> Result<Option<Command>> {
        if argv.is_empty() {
            return Ok(None);
        }
        let l = req.layout;
        let vars: [(&str, &Path); 4] = [
            ("{source_dir}", &l.source_dir),
            ("{build_dir}", &l.build_dir),
            ("{generators_dir}", &l.generators_dir),
            ("{install_dir}", install_dir),
        ];
        let expand = |raw: &str| {
            vars.iter().fold(raw.to_string(), |acc, (var, path)| {
                acc.replace(var, &path.to_string_lossy())
            })
        };
        let program = expand(&argv[0]);
        if program.trim().is_empty() {
            return Err(Error::config(format!("[build] {step} has an empty program")));
        }

        let mut cmd = Command::new(program);
        cmd.args(argv[1..].iter().map(|a| expand(a)))
            .current_dir(&l.build_dir)
            .env("KILN_SOURCE_DIR", &l.source_dir)
            .env("KILN_BUILD_DIR", &l.build_dir)
            .env("KILN_GENERATORS_DIR", &l.generators_dir)
            .env("KILN_INSTALL_DIR", install_dir)
            .env("KILN_CACHE_ROOT", req.cache_root)
            .env("KILN_JOBS", req.jobs().to_string())
            .env("CFLAGS", req.record.effective_c_flags().join(" "))
            .env("CXXFLAGS", req.record.effective_cxx_flags().join(" "));
        for (k, v) in &req.record.settings {
            cmd.env(format!("KILN_SETTING_{}", k.to_ascii_uppercase()), v);
        }
        if let Some(cc) = &req.record.c_compiler {
            cmd.env("CC", cc);
        }
        if let Some(cxx) = &req.record.cxx_compiler {
            cmd.env("CXX", cxx);
        }
        Ok(Some(cmd))
    }

    fn run(
        &self,
        step: &str,
        argv: &[String],
        req: &BuildRequest<'_>,
        install_dir: &Path,
        ctx: &ExecCtx,
    ) -> Result<()> {
        match self.command(step, argv, req, install_dir)? {
            Some(cmd) => ctx.run_cmd(cmd),
            None => {
                ctx.log(&format!("no {step} step declared"));
                Ok(())
            }
        }
    }
}

impl BuildBackend for CommandBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Command
    }

    fn configure(&self, req: &BuildRequest<'_>, ctx: &ExecCtx) -> Result<()> {
        self.run("configure", &req.config.configure, req, &req.layout.install_staging(), ctx)
    }

    fn compile(&self, req: &BuildRequest<'_>, ctx: &ExecCtx) -> Result<()> {
        self.run("compile", &req.config.compile, req, &req.layout.install_staging(), ctx)
    }

    fn install(&self, req: &BuildRequest<'_>, dest: &Path, ctx: &ExecCtx) -> Result<()> {
        if req.config.install.is_empty() {
            return Err(Error::Package(
                "backend \"command\" declares no [build] install argv".into(),
            ));
        }
        self.run("install", &req.config.install, req, dest, ctx)
    }
}
