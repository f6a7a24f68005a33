//! Sandboxed Execution Engine
//!
//! Runs a verified bundle's declared command steps sequentially with a
//! minimal, explicit environment and file-based input passing.
//!
//! # Security Model
//!
//! 1. **Environment allow-list**: the child sees exactly PATH, HOME, LANG
//!    plus the variables the manifest declares in `requires_env`. Nothing
//!    else leaks from the parent, regardless of what is set there.
//! 2. **File-passed input**: `{{input}}` resolves to the path of a
//!    restrictively-permissioned file holding the JSON-serialized input.
//!    Raw input text is never interpolated into a command string.
//! 3. **Resource ceilings**: every step is bounded by a wall-clock timeout
//!    and a captured-output cap; exceeding either is a command failure,
//!    never an engine failure.

use super::types::{ExecutionResult, ExecutionStep, SkillBundle, SkillError, SkillManifest};
use crate::ipc::server::{serve, IpcHandler};
use crate::ipc::IPC_FD;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

const MANIFEST_FILE: &str = "SKILL.md";
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
/// How much of the user input the no-steps fallback echoes.
const INPUT_ECHO_LIMIT: usize = 120;

/// Runner limits and scratch location.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Wall-clock ceiling per step.
    pub step_timeout_secs: u64,
    /// Captured stdout cap per step; stderr gets a quarter of this.
    pub max_output_bytes: usize,
    /// Parent directory for per-invocation scratch dirs.
    pub scratch_root: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 60,
            max_output_bytes: 1024 * 1024,
            scratch_root: std::env::temp_dir(),
        }
    }
}

/// Executes skill bundles. One instance may serve concurrent invocations;
/// within an invocation steps run strictly in declared order.
pub struct SkillRunner {
    config: RunnerConfig,
    ipc: Option<Arc<IpcHandler>>,
}

impl SkillRunner {
    pub fn new(config: RunnerConfig, ipc: Option<Arc<IpcHandler>>) -> Self {
        Self { config, ipc }
    }

    /// Run every declared step of the bundle against the given input.
    ///
    /// Returns `Err` only for fatal conditions (missing/invalid manifest,
    /// scratch setup). A failing command is captured in its step's
    /// `exit_code` and execution continues with the next step.
    pub async fn execute(
        &self,
        bundle: &SkillBundle,
        input: &str,
    ) -> Result<ExecutionResult, SkillError> {
        let manifest_path = bundle.dir.join(MANIFEST_FILE);
        let manifest_text = std::fs::read_to_string(&manifest_path)
            .map_err(|_| SkillError::MissingManifest(bundle.id.clone()))?;
        let manifest = SkillManifest::from_markdown(&manifest_text)?;

        // The input file is removed on every exit path by the guard.
        let scratch = Scratch::create(&self.config.scratch_root)?;
        let input_json =
            serde_json::to_string(input).map_err(|e| SkillError::Io(std::io::Error::other(e)))?;
        std::fs::write(&scratch.input_path, &input_json)?;
        restrict_file(&scratch.input_path)?;

        let env = build_env(&manifest.requires_env);
        let mut steps = Vec::new();

        if manifest.execution.is_empty() {
            info!("skill '{}' declares no steps, recording fallback", bundle.id);
            steps.push(ExecutionStep {
                template: String::new(),
                command: "(no steps declared)".to_string(),
                stdout: format!(
                    "skill '{}' declares no executable steps; input: {}",
                    bundle.id,
                    truncate_chars(input, INPUT_ECHO_LIMIT)
                ),
                stderr: String::new(),
                exit_code: 0,
            });
        } else {
            for decl in &manifest.execution {
                let resolved = decl
                    .run
                    .replace("{{input}}", &scratch.input_path.to_string_lossy())
                    .replace("{{output}}", &scratch.output_path.to_string_lossy());
                debug!("running step: {resolved}");
                let step = self.run_step(&bundle.dir, &decl.run, &resolved, &env).await;
                if step.exit_code != 0 {
                    warn!("step exited with {}: {}", step.exit_code, resolved);
                }
                // No short-circuiting: later steps run regardless.
                steps.push(step);
            }
        }

        let output = steps
            .last()
            .map(|step| step.stdout.trim().to_string())
            .unwrap_or_default();

        Ok(ExecutionResult {
            skill_id: bundle.id.clone(),
            output,
            steps,
        })
    }

    async fn run_step(
        &self,
        workdir: &Path,
        template: &str,
        command: &str,
        env: &[(String, String)],
    ) -> ExecutionStep {
        let timeout = Duration::from_secs(self.config.step_timeout_secs);

        // Pre-open the side channel for the step when a handler is wired.
        let mut child_end = None;
        let mut serve_task = None;
        if let Some(ref handler) = self.ipc {
            match ipc_pair() {
                Ok((parent_stream, child_sock)) => {
                    serve_task = Some(tokio::spawn(serve(parent_stream, handler.clone())));
                    child_end = Some(child_sock);
                }
                Err(e) => warn!("could not open IPC channel for step: {e}"),
            }
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(workdir)
            .env_clear();
        for (key, value) in env {
            cmd.env(key, value);
        }

        if let Some(ref sock) = child_end {
            let fd = sock.as_raw_fd();
            unsafe {
                cmd.pre_exec(move || {
                    // Map the channel onto the fixed descriptor; dup2 also
                    // clears close-on-exec on the new fd. If the socket
                    // already sits on it, only the flag needs clearing.
                    if fd == IPC_FD {
                        if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                            return Err(std::io::Error::last_os_error());
                        }
                    } else if libc::dup2(fd, IPC_FD) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionStep {
                    template: template.to_string(),
                    command: command.to_string(),
                    stdout: String::new(),
                    stderr: format!("failed to spawn: {e}"),
                    exit_code: 127,
                };
            }
        };
        // The parent must not hold the child's channel end open, or the
        // serve loop would never see EOF.
        drop(child_end);

        let mut stdout_pipe = child.stdout.take().expect("piped stdout");
        let mut stderr_pipe = child.stderr.take().expect("piped stderr");
        let max = self.config.max_output_bytes;

        let result = tokio::time::timeout(timeout, async {
            let ((stdout_buf, stdout_trunc), (stderr_buf, stderr_trunc)) = tokio::join!(
                read_capped(&mut stdout_pipe, max),
                read_capped(&mut stderr_pipe, max / 4),
            );
            let truncated = stdout_trunc || stderr_trunc;
            if truncated {
                let _ = child.kill().await;
            }
            let status = child.wait().await;
            (stdout_buf, stderr_buf, truncated, status)
        })
        .await;

        let step = match result {
            Ok((stdout_buf, stderr_buf, truncated, status)) => {
                let mut exit_code = match status {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(_) => -1,
                };
                let mut stderr = String::from_utf8_lossy(&stderr_buf).into_owned();
                if truncated {
                    if exit_code == 0 {
                        exit_code = 1;
                    }
                    stderr.push_str(&format!("\noutput exceeded {max} bytes, truncated"));
                }
                ExecutionStep {
                    template: template.to_string(),
                    command: command.to_string(),
                    stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
                    stderr,
                    exit_code,
                }
            }
            Err(_) => {
                let _ = child.kill().await;
                warn!("step timed out after {}s", self.config.step_timeout_secs);
                ExecutionStep {
                    template: template.to_string(),
                    command: command.to_string(),
                    stdout: String::new(),
                    stderr: format!(
                        "step timed out after {} seconds",
                        self.config.step_timeout_secs
                    ),
                    exit_code: 124,
                }
            }
        };

        // The child has exited, so its channel end is closed; the serve
        // loop drains any in-flight dispatch and returns on EOF.
        if let Some(task) = serve_task {
            let _ = task.await;
        }
        step
    }
}

/// Socketpair for one step: a registered tokio stream for the parent and
/// a plain socket for the child to inherit.
fn ipc_pair() -> std::io::Result<(tokio::net::UnixStream, std::os::unix::net::UnixStream)> {
    let (parent_end, child_end) = std::os::unix::net::UnixStream::pair()?;
    parent_end.set_nonblocking(true)?;
    let parent_stream = tokio::net::UnixStream::from_std(parent_end)?;
    Ok((parent_stream, child_end))
}

/// The child environment: exactly three fixed variables plus every
/// declared-and-present required variable. Names are matched exactly.
fn build_env(required: &[String]) -> Vec<(String, String)> {
    let mut env = vec![
        (
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
        ),
        (
            "HOME".to_string(),
            std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()),
        ),
        ("LANG".to_string(), "C.UTF-8".to_string()),
    ];
    for name in required {
        if matches!(name.as_str(), "PATH" | "HOME" | "LANG") {
            continue;
        }
        if let Ok(value) = std::env::var(name) {
            env.push((name.clone(), value));
        }
    }
    env
}

async fn read_capped<R: AsyncRead + Unpin>(reader: &mut R, max: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() + n <= max {
                    buf.extend_from_slice(&chunk[..n]);
                } else {
                    truncated = true;
                    break;
                }
            }
            Err(_) => break,
        }
    }
    (buf, truncated)
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Per-invocation scratch directory holding the input/output placeholder
/// files. Removed on drop, success or failure.
struct Scratch {
    dir: PathBuf,
    input_path: PathBuf,
    output_path: PathBuf,
}

impl Scratch {
    fn create(root: &Path) -> Result<Self, SkillError> {
        let dir = root.join(format!("skill-run-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        restrict_dir(&dir)?;
        Ok(Self {
            input_path: dir.join("input.json"),
            output_path: dir.join("output.json"),
            dir,
        })
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if std::fs::remove_dir_all(&self.dir).is_err() && self.dir.exists() {
            warn!("could not remove scratch dir {}", self.dir.display());
        }
    }
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}
