use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::lifecycle::Invocation;
use crate::log_sanitize::sanitize_log_line;
use crate::planner::Plan;

pub type TaskExecFn = fn(&Invocation, &mut ExecCtx) -> Result<()>;

/// Lines of external tool output kept for failure reports and error logs.
pub const CAPTURED_LINES: usize = 4000;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route SIGINT into the process-wide interrupt flag. Running child process
/// groups are torn down by [`ExecCtx::run_cmd`] once the flag is seen.
pub fn install_interrupt_handler() {
    #[cfg(unix)]
    unsafe {
        let handler = on_interrupt as extern "C" fn(libc::c_int);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

#[derive(Default)]
struct SharedExecState {
    // Process groups of running children, keyed by pgid.
    child_pgroups: Mutex<BTreeMap<u32, String>>,
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Console reporting for interactive runs.
///
/// Prints `RUN:` / `DONE:` / `FAIL:` lines per phase task and a summary once
/// the run is over. The captured tail of every failed task is written to
/// `<error_logs>/<timestamp>/<task>.log`.
pub struct StdoutSink {
    error_logs_root: PathBuf,
    state: Mutex<ConsoleState>,
}

#[derive(Default)]
struct TaskRecord {
    tail: VecDeque<String>,
    elapsed_ms: u128,
    failed: bool,
}

#[derive(Default)]
struct ConsoleState {
    started_at: Option<Instant>,
    log_lines: usize,
    // Insertion order is the order tasks started in.
    order: Vec<String>,
    tasks: BTreeMap<String, TaskRecord>,
    run_dir: Option<PathBuf>,
    error_logs: Vec<PathBuf>,
}

impl ConsoleState {
    fn record(&mut self, id: &str) -> &mut TaskRecord {
        if !self.tasks.contains_key(id) {
            self.order.push(id.to_string());
        }
        self.tasks.entry(id.to_string()).or_default()
    }

    fn summary(&self, ok: bool) -> String {
        let wall = self.started_at.map(|t| t.elapsed()).unwrap_or_default();
        let failed: Vec<&str> = self
            .order
            .iter()
            .filter(|id| self.tasks.get(*id).is_some_and(|t| t.failed))
            .map(String::as_str)
            .collect();
        let task_ms: u128 = self.tasks.values().map(|t| t.elapsed_ms).sum();
        let mut out = format!(
            "SUMMARY: {}\n  tasks: {} run, {} failed\n  output lines: {}\n  wall time: {}\n  task time: {}\n",
            if ok { "ok" } else { "failed" },
            self.order.len(),
            failed.len(),
            self.log_lines,
            format_elapsed_hms(wall.as_secs()),
            format_elapsed_hms((task_ms / 1000) as u64),
        );
        if !failed.is_empty() {
            out.push_str(&format!("  failed: {}\n", failed.join(", ")));
        }
        for p in &self.error_logs {
            out.push_str(&format!("  error log: {}\n", p.display()));
        }
        out
    }
}

impl StdoutSink {
    pub fn new(error_logs_root: impl Into<PathBuf>) -> Self {
        Self {
            error_logs_root: error_logs_root.into(),
            state: Mutex::new(ConsoleState::default()),
        }
    }

    fn finish_task(&self, id: &str, ok: bool, error: Option<&str>, elapsed_ms: u128) -> Option<PathBuf> {
        let mut s = self.state.lock().ok()?;
        let rec = s.record(id);
        rec.elapsed_ms = elapsed_ms;
        rec.failed = !ok;
        if ok {
            rec.tail.clear();
            return None;
        }
        match write_task_error_log(&self.error_logs_root, &mut s, id, error, elapsed_ms) {
            Ok(path) => Some(path),
            Err(e) => {
                println!("WARN: could not write error log for {id}: {e}");
                None
            }
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new(
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("build")
                .join("error-logs"),
        )
    }
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::TaskStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.started_at.get_or_insert_with(Instant::now);
                    s.record(&id);
                }
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines += 1;
                    let tail = &mut s.record(&id).tail;
                    if tail.len() == CAPTURED_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                }
                println!("[{id}] {line}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                let log = self.finish_task(&id, ok, error.as_deref(), elapsed_ms);
                let took = format_elapsed_hms((elapsed_ms / 1000) as u64);
                match error.filter(|_| !ok) {
                    None if ok => println!("DONE: {id} ({took})"),
                    e => println!("FAIL: {id} ({took}) {}", e.unwrap_or_default()),
                }
                if let Some(path) = log {
                    println!("ERROR_LOG: {id} => {}", path.display());
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let summary = match self.state.lock() {
                    Ok(mut s) => {
                        let text = s.summary(ok);
                        *s = ConsoleState::default();
                        text
                    }
                    Err(_) => format!("SUMMARY: {}\n", if ok { "ok" } else { "failed" }),
                };
                print!("{summary}");
                if let Some(e) = error.filter(|_| !ok) {
                    println!("  error: {e}");
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

/// Forwards events to `tracing`, keeping stdout free for machine-readable
/// output.
pub struct TracingSink;

impl ExecSink for TracingSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::TaskStarted { id } => tracing::info!(task = %id, "task started"),
            ExecEvent::TaskLog { id, line } => tracing::debug!(task = %id, "{line}"),
            ExecEvent::TaskFinished {
                id,
                ok: true,
                elapsed_ms,
                ..
            } => tracing::info!(task = %id, elapsed_ms = elapsed_ms as u64, "task finished"),
            ExecEvent::TaskFinished {
                id,
                error,
                elapsed_ms,
                ..
            } => tracing::error!(
                task = %id,
                elapsed_ms = elapsed_ms as u64,
                "task failed: {}",
                error.unwrap_or_default()
            ),
            ExecEvent::ExecutorDone { ok, .. } => tracing::info!(ok, "run finished"),
        }
    }
}

/// Discards every event.
pub struct NullSink;

impl ExecSink for NullSink {
    fn emit(&self, _ev: ExecEvent) {}
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub cancel: Arc<AtomicBool>,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    /// Prefix for task ids in events (the key slug during matrix runs).
    scope: Option<String>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            cancel: Arc::new(AtomicBool::new(false)),
            sink,
            current_task_id: None,
            scope: None,
            shared: Arc::new(SharedExecState::default()),
        }
    }

    /// A context sharing cancellation and child tracking, whose event ids
    /// are prefixed with `scope`.
    pub fn scoped(&self, scope: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.scope = Some(scope.into());
        ctx.current_task_id = None;
        ctx
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || interrupted()
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.current_task_id = Some(match &self.scope {
            Some(scope) => format!("{scope}/{id}"),
            None => id,
        });
    }

    fn task_label(&self) -> String {
        self.current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into())
    }

    fn register_child_pgroup(&self, pgid: u32) {
        if let Ok(mut g) = self.shared.child_pgroups.lock() {
            g.insert(pgid, self.task_label());
        }
    }

    fn unregister_child_pgroup(&self, pgid: u32) {
        if let Ok(mut g) = self.shared.child_pgroups.lock() {
            g.remove(&pgid);
        }
    }

    pub fn kill_running_children_force(&self) {
        let pgids: Vec<u32> = self
            .shared
            .child_pgroups
            .lock()
            .ok()
            .map(|g| g.keys().copied().collect())
            .unwrap_or_default();
        for pgid in pgids {
            kill_pgroup(pgid, true);
        }
    }

    pub fn log(&self, msg: &str) {
        self.sink.emit(ExecEvent::TaskLog {
            id: self.task_label(),
            line: msg.to_string(),
        });
    }

    pub fn emit_started(&self) {
        self.sink.emit(ExecEvent::TaskStarted {
            id: self.task_label(),
        });
    }

    pub fn emit_finished(&self, res: &Result<()>, elapsed_ms: u128) {
        self.sink.emit(ExecEvent::TaskFinished {
            id: self.task_label(),
            ok: res.is_ok(),
            error: res.as_ref().err().map(|e| e.to_string()),
            elapsed_ms,
        });
    }

    /// Run an external command, streaming its sanitized output to the sink.
    ///
    /// The child gets its own process group, which is terminated when the
    /// context is cancelled. A non-zero exit becomes `BuildFailed` carrying
    /// the last [`CAPTURED_LINES`] lines of output.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        if self.cancelled() {
            return Err(Error::Cancelled);
        }
        if self.dry_run {
            self.log(&format!("DRY-RUN: {:?}", cmd));
            return Ok(());
        }
        tracing::debug!(command = ?cmd, "spawning");

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            // Reading from the controlling TTY would stop a background process group.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::msg(format!(
                    "failed to spawn {:?}: {e}",
                    cmd.get_program().to_string_lossy()
                ))
            })?;
        let pgid = child.id();
        self.register_child_pgroup(pgid);

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        let mut captured: VecDeque<String> = VecDeque::new();
        let mut killed = false;
        loop {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(line) => {
                    // The sink gets a cleaned copy; failures carry the raw line.
                    let shown = sanitize_log_line(&line);
                    if !shown.is_empty() {
                        self.log(&shown);
                    }
                    if captured.len() >= CAPTURED_LINES {
                        captured.pop_front();
                    }
                    captured.push_back(line);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
            if !killed && self.cancelled() {
                kill_pgroup(pgid, false);
                std::thread::sleep(Duration::from_millis(200));
                kill_pgroup(pgid, true);
                killed = true;
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")));
        self.unregister_child_pgroup(pgid);
        let status = status?;
        if killed {
            return Err(Error::Cancelled);
        }
        if !status.success() {
            return Err(Error::BuildFailed {
                exit_code: status.code(),
                output: captured.into(),
            });
        }
        Ok(())
    }
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative pid addresses the whole group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    crate::modules::recipe::RecipeModule::register_tasks(&mut reg)?;
    Ok(reg)
}

/// Run the plan's tasks one at a time in plan order, stopping at the first
/// failure. The failing task's error is returned unchanged.
pub fn execute_plan(
    inv: &Invocation,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    for task in plan.ordered()? {
        let Some(exec) = reg.get(&task.id) else {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        };
        ctx.set_task(task.id.clone());
        ctx.emit_started();
        let start = Instant::now();
        let res = exec(inv, ctx);
        ctx.emit_finished(&res, start.elapsed().as_millis());
        res?;
    }
    Ok(())
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        let line = String::from_utf8_lossy(pending).into_owned();
        pending.clear();
        tx.send(line).is_ok()
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for b in &buf[..n] {
            if *b == b'\n' {
                if pending.last() == Some(&b'\r') {
                    pending.pop();
                }
                if !flush(&mut pending) {
                    return;
                }
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES && !flush(&mut pending) {
                    return;
                }
            }
        }
    }
    if !pending.is_empty() {
        flush(&mut pending);
    }
}

fn write_task_error_log(
    root: &std::path::Path,
    state: &mut ConsoleState,
    task_id: &str,
    error: Option<&str>,
    elapsed_ms: u128,
) -> Result<PathBuf> {
    // One directory per run, created on the first failure.
    let dir = match &state.run_dir {
        Some(d) => d.clone(),
        None => {
            let dir = root.join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
            fs::create_dir_all(&dir).map_err(|e| {
                Error::msg(format!("failed to create {}: {e}", dir.display()))
            })?;
            state.run_dir = Some(dir.clone());
            dir
        }
    };
    let path = dir.join(format!("{}.log", sanitize_filename_component(task_id)));

    let mut body = format!("task: {task_id}\nelapsed: {elapsed_ms}ms\n");
    if let Some(e) = error.map(str::trim).filter(|e| !e.is_empty()) {
        body.push_str(&format!("error: {e}\n"));
    }
    body.push_str("\n--- output (last lines) ---\n");
    if let Some(rec) = state.tasks.get(task_id) {
        for line in &rec.tail {
            body.push_str(line);
            body.push('\n');
        }
    }
    fs::write(&path, body)
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;

    if !state.error_logs.contains(&path) {
        state.error_logs.push(path.clone());
    }
    Ok(path)
}

/// Task ids contain '/' in matrix runs; keep file names flat.
fn sanitize_filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => ch,
            _ => '_',
        })
        .collect();
    if out.is_empty() { "task".into() } else { out }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let (h, m, s) = (total_secs / 3600, total_secs / 60 % 60, total_secs % 60);
    format!("{h:02}:{m:02}:{s:02}")
}
