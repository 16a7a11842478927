//! Supervised execution of a single external tool invocation.
//!
//! Every invocation gets a freshly built environment, a private working
//! directory, kernel resource ceilings, a wall-clock deadline and its own
//! process group. Whatever happens, the caller receives a [`StageResult`].

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
#[cfg(unix)]
use std::os::unix::process::{CommandExt, ExitStatusExt};

use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::error::{ErrorKind, PathViolation, StageError};
use crate::guard::{EntryClass, GuardedPath};
use crate::pipeline::{StageMethod, StageResult};
use crate::profile::Ratio;

pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
pub const STDERR_CAP: usize = 4 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Absolute path to an existing executable regular file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPath(PathBuf);

impl ToolPath {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, PathViolation> {
        let path = path.as_ref();
        if !path.is_absolute() {
            return Err(PathViolation::Absolute(path.display().to_string()));
        }
        let canonical =
            fs::canonicalize(path).map_err(|_| PathViolation::Missing(path.to_path_buf()))?;
        let meta =
            fs::metadata(&canonical).map_err(|_| PathViolation::Missing(path.to_path_buf()))?;
        if !meta.is_file() {
            return Err(PathViolation::NotAFile(canonical));
        }
        #[cfg(unix)]
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(PathViolation::NotExecutable(canonical));
        }
        Ok(Self(canonical))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

/// One element of a tool's argument vector.
///
/// There is deliberately no variant carrying an arbitrary string: every token
/// is a compile-time literal, one of the two guarded paths, or a bounded number.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgToken {
    Literal(&'static str),
    Input,
    Output,
    Integer(u32),
    Ratio(Ratio),
}

impl ArgToken {
    fn render(&self, input: &Path, output: &Path) -> OsString {
        match self {
            ArgToken::Literal(text) => OsString::from(*text),
            ArgToken::Input => input.as_os_str().to_owned(),
            ArgToken::Output => output.as_os_str().to_owned(),
            ArgToken::Integer(value) => OsString::from(value.to_string()),
            ArgToken::Ratio(ratio) => OsString::from(ratio.render()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: Option<u64>,
    pub cpu_seconds: Option<u64>,
    pub max_output_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: Some(2 * 1024 * 1024 * 1024),
            cpu_seconds: Some(600),
            max_output_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    pub program: ToolPath,
    pub args: Vec<ArgToken>,
    pub expected_exit_codes: Vec<i32>,
    pub timeout: Duration,
    pub limits: ResourceLimits,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, program: ToolPath, args: Vec<ArgToken>) -> Self {
        Self {
            name: name.into(),
            program,
            args,
            expected_exit_codes: vec![0],
            timeout: Duration::from_secs(300),
            limits: ResourceLimits::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn argv(&self, input: &Path, output: &Path) -> Vec<OsString> {
        self.args
            .iter()
            .map(|token| token.render(input, output))
            .collect()
    }
}

/// Explicit environment for child processes; nothing is inherited implicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvPolicy {
    fixed: BTreeMap<String, String>,
    passthrough: Vec<String>,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        let mut fixed = BTreeMap::new();
        fixed.insert("PATH".to_string(), DEFAULT_PATH.to_string());
        fixed.insert("LANG".to_string(), "C.UTF-8".to_string());
        fixed.insert("LC_ALL".to_string(), "C.UTF-8".to_string());
        Self {
            fixed,
            passthrough: Vec::new(),
        }
    }
}

impl EnvPolicy {
    pub fn with_passthrough(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.passthrough.extend(names);
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fixed.insert(key.into(), value.into());
        self
    }

    pub fn build(&self, workdir: &Path) -> BTreeMap<OsString, OsString> {
        let mut env: BTreeMap<OsString, OsString> = self
            .fixed
            .iter()
            .map(|(key, value)| (OsString::from(key), OsString::from(value)))
            .collect();
        env.insert("HOME".into(), workdir.as_os_str().to_owned());
        env.insert("TMPDIR".into(), workdir.as_os_str().to_owned());
        for name in &self.passthrough {
            if let Some(value) = std::env::var_os(name) {
                env.insert(OsString::from(name), value);
            }
        }
        env
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    env: EnvPolicy,
}

impl Sandbox {
    pub fn new(env: EnvPolicy) -> Self {
        Self { env }
    }

    /// Run `spec` reading `input` and writing `output` inside `workdir`.
    pub fn run(
        &self,
        spec: &StageSpec,
        input: &GuardedPath,
        output: &GuardedPath,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> StageResult {
        let started = Instant::now();
        let input_size = file_size(input.as_path()).unwrap_or(0);
        match self.supervise(spec, input, output, workdir, cancel, started) {
            Ok(result) => result,
            Err((error, exit_code)) => {
                if error.kind == ErrorKind::ResourceExceeded {
                    warn!(stage = spec.name.as_str(), detail = %error.detail, "Resource ceiling breached");
                }
                let result = StageResult::failure(&spec.name, started.elapsed(), input_size, error);
                match exit_code {
                    Some(code) => result.with_exit_code(code),
                    None => result,
                }
            }
        }
    }

    fn supervise(
        &self,
        spec: &StageSpec,
        input: &GuardedPath,
        output: &GuardedPath,
        workdir: &Path,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<StageResult, (StageError, Option<i32>)> {
        let fail = |kind, detail: String| (StageError::new(kind, detail), None);

        if cancel.is_cancelled() {
            return Err(fail(ErrorKind::Cancelled, "cancelled before launch".into()));
        }
        if input.class() != EntryClass::File {
            return Err(fail(
                ErrorKind::PathViolation,
                format!("input '{}' is not a regular file", input.as_path().display()),
            ));
        }
        if output.class() != EntryClass::Missing {
            return Err(fail(
                ErrorKind::PathViolation,
                format!("output '{}' already exists", output.as_path().display()),
            ));
        }

        let mut command = Command::new(spec.program.as_path());
        command
            .args(spec.argv(input.as_path(), output.as_path()))
            .env_clear()
            .envs(self.env.build(workdir))
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        apply_limits(&mut command, &spec.limits);

        debug!(
            stage = spec.name.as_str(),
            program = %spec.program.as_path().display(),
            "Launching tool"
        );
        let mut child = command.spawn().map_err(|err| {
            fail(
                ErrorKind::ProcessFailure,
                format!("failed to launch {}: {err}", spec.program.as_path().display()),
            )
        })?;
        let stderr = spawn_stderr_drain(&mut child);

        let deadline = started + spec.timeout;
        let max_output = spec.limits.max_output_bytes;
        let waited: Result<ExitStatus, StageError> = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => {}
                Err(err) => {
                    terminate(&mut child);
                    break Err(StageError::new(ErrorKind::Io, format!("wait failed: {err}")));
                }
            }
            if cancel.is_cancelled() {
                terminate(&mut child);
                break Err(StageError::new(ErrorKind::Cancelled, "cancelled while running"));
            }
            if Instant::now() >= deadline {
                terminate(&mut child);
                break Err(StageError::new(
                    ErrorKind::ProcessTimeout,
                    format!("exceeded timeout of {:?}", spec.timeout),
                ));
            }
            if file_size(output.as_path()).is_some_and(|size| size > max_output) {
                terminate(&mut child);
                break Err(StageError::new(
                    ErrorKind::ResourceExceeded,
                    format!("output grew past {max_output} bytes"),
                ));
            }
            thread::sleep(POLL_INTERVAL);
        };
        // Leader is gone; sweep anything it left behind in its group.
        kill_group(&child);
        let stderr_text = stderr.and_then(|handle| handle.join().ok()).unwrap_or_default();
        let status = waited.map_err(|error| (error, None))?;

        let output_size = file_size(output.as_path());
        if output_size.is_some_and(|size| size > max_output) {
            return Err(fail(
                ErrorKind::ResourceExceeded,
                format!("output exceeds ceiling of {max_output} bytes"),
            ));
        }
        #[cfg(unix)]
        if let Some(signal) = status.signal() {
            let kind = if signal == libc_signal::SIGXFSZ || signal == libc_signal::SIGXCPU {
                ErrorKind::ResourceExceeded
            } else {
                ErrorKind::ProcessFailure
            };
            return Err(fail(
                kind,
                format!("terminated by signal {signal}; stderr: {stderr_text}"),
            ));
        }
        let code = status.code().unwrap_or(-1);
        if !spec.expected_exit_codes.contains(&code) {
            return Err((
                StageError::new(
                    ErrorKind::ProcessFailure,
                    format!("exited with status {code}; stderr: {stderr_text}"),
                ),
                Some(code),
            ));
        }
        let Some(output_size) = output_size else {
            return Err((
                StageError::new(
                    ErrorKind::ProcessFailure,
                    "tool exited successfully but wrote no output",
                ),
                Some(code),
            ));
        };

        let input_size = file_size(input.as_path()).unwrap_or(0);
        Ok(StageResult::success(
            &spec.name,
            StageMethod::Tool,
            started.elapsed(),
            input_size,
            output_size,
        )
        .with_exit_code(code))
    }
}

fn file_size(path: &Path) -> Option<u64> {
    fs::symlink_metadata(path).ok().map(|meta| meta.len())
}

/// Keep the first [`STDERR_CAP`] bytes, discard the rest so the pipe never blocks.
fn spawn_stderr_drain(child: &mut Child) -> Option<JoinHandle<String>> {
    let mut pipe = child.stderr.take()?;
    Some(thread::spawn(move || {
        let mut kept = Vec::with_capacity(STDERR_CAP);
        let mut buffer = [0u8; 1024];
        let mut truncated = false;
        loop {
            match pipe.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    let room = STDERR_CAP - kept.len();
                    if read > room {
                        truncated = true;
                    }
                    kept.extend_from_slice(&buffer[..read.min(room)]);
                }
            }
        }
        let mut text = String::from_utf8_lossy(&kept).trim_end().to_string();
        if truncated {
            text.push_str("…[truncated]");
        }
        text
    }))
}

fn terminate(child: &mut Child) {
    kill_group(child);
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_group(child: &Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Ok(pid) = i32::try_from(child.id()) {
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

#[cfg(unix)]
fn apply_limits(command: &mut Command, limits: &ResourceLimits) {
    use nix::sys::resource::{Resource, getrlimit, setrlimit};

    let memory = limits.memory_bytes;
    let cpu = limits.cpu_seconds;
    // One byte of slack so an overflowing write is observable as an oversized file.
    let fsize = limits.max_output_bytes.saturating_add(1);

    command.process_group(0);
    let cap = move |resource: Resource, value: u64| -> std::io::Result<()> {
        let (_, hard) = getrlimit(resource)?;
        let value = value.min(hard);
        setrlimit(resource, value, value)?;
        Ok(())
    };
    // SAFETY: the closure only issues getrlimit/setrlimit syscalls, which are
    // async-signal-safe, and touches no shared state.
    unsafe {
        command.pre_exec(move || {
            if let Some(bytes) = memory {
                cap(Resource::RLIMIT_AS, bytes)?;
            }
            if let Some(seconds) = cpu {
                cap(Resource::RLIMIT_CPU, seconds)?;
            }
            cap(Resource::RLIMIT_FSIZE, fsize)?;
            cap(Resource::RLIMIT_CORE, 0)?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_limits(_command: &mut Command, _limits: &ResourceLimits) {}

#[cfg(unix)]
mod libc_signal {
    use nix::sys::signal::Signal;

    pub const SIGXFSZ: i32 = Signal::SIGXFSZ as i32;
    pub const SIGXCPU: i32 = Signal::SIGXCPU as i32;
}
