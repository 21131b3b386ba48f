// External git executable backend
// reason: tokio::process for async child management, nix for graceful termination
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use bitvault_core::application::worker::constants::{
    GRACEFUL_SHUTDOWN_TIMEOUT, PROCESS_EXIT_POLL_INTERVAL,
};
use bitvault_core::config::Credentials;
use bitvault_core::port::{
    classify_failure, GitBackend, GitError, GitOperation, GitOutput, GitRequest,
};

/// Environment passed through to git; everything else is dropped
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TMPDIR",
    "SSL_CERT_FILE",
    "SSL_CERT_DIR",
    "HTTPS_PROXY",
    "HTTP_PROXY",
    "NO_PROXY",
    "https_proxy",
    "http_proxy",
    "no_proxy",
];

/// Runs `git` as a child process with a filtered environment
pub struct CliGitBackend {
    program: PathBuf,
    credentials: Option<Credentials>,
    env_allowlist: Vec<String>,
}

impl CliGitBackend {
    /// Backend using `git` from PATH
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self {
            program: PathBuf::from("git"),
            credentials,
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Use another executable (absolute path or name on PATH)
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_env_allowlist(mut self, allowlist: Vec<String>) -> Self {
        self.env_allowlist = allowlist;
        self
    }

    /// Allowlisted subset of `base` plus the variables git needs to run
    /// non-interactively with our credentials
    fn build_env(
        &self,
        base: impl IntoIterator<Item = (String, String)>,
    ) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = base
            .into_iter()
            .filter(|(k, _)| self.env_allowlist.contains(k))
            .collect();

        env.insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
        env.insert("GIT_ASKPASS".to_string(), String::new());

        if let Some(creds) = &self.credentials {
            env.insert("GIT_CONFIG_COUNT".to_string(), "1".to_string());
            env.insert("GIT_CONFIG_KEY_0".to_string(), "http.extraHeader".to_string());
            env.insert("GIT_CONFIG_VALUE_0".to_string(), authorization_header(creds));
        }
        env
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .env_clear()
            .envs(self.build_env(std::env::vars()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn args_for(operation: GitOperation, request: &GitRequest) -> Vec<String> {
        let path = request.local_path.to_string_lossy().into_owned();
        match operation {
            GitOperation::Clone => vec![
                "clone".to_string(),
                "--mirror".to_string(),
                "--quiet".to_string(),
                request.remote_url.clone(),
                path,
            ],
            GitOperation::Fetch => vec![
                format!("--git-dir={}", path),
                "remote".to_string(),
                "update".to_string(),
                "--prune".to_string(),
            ],
        }
    }

    /// Spawn git and wait for it, honoring the deadline and cancellation
    async fn run_git(
        &self,
        operation: GitOperation,
        request: &GitRequest,
    ) -> Result<(), GitError> {
        let args = Self::args_for(operation, request);

        info!(
            operation = %operation,
            program = %self.program.display(),
            path = %request.local_path.display(),
            "Starting git subprocess"
        );

        let mut child = self.command(&args).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitError::Unavailable(format!("{} not found", self.program.display()))
            } else {
                GitError::Io(format!("failed to spawn {}: {}", self.program.display(), e))
            }
        })?;

        let stdout = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr = tokio::spawn(read_pipe(child.stderr.take()));

        let mut cancel = request.cancel.clone();
        let exit = tokio::select! {
            status = child.wait() => Ok(status),
            _ = tokio::time::sleep_until(request.deadline) => Err(GitError::Timeout {
                operation,
                after: std::time::Duration::ZERO,
            }),
            _ = cancel.cancelled() => Err(GitError::Cancelled),
        };

        let status = match exit {
            Ok(status) => status.map_err(|e| GitError::Io(format!("waiting for git: {}", e)))?,
            Err(err) => {
                // Grandchildren (remote helpers) may hold the pipes open
                stdout.abort();
                stderr.abort();
                self.terminate(&mut child).await;
                return Err(err);
            }
        };

        let _ = stdout.await;
        let stderr = stderr.await.unwrap_or_default();
        let stderr = String::from_utf8_lossy(&stderr);

        info!(
            operation = %operation,
            exit_code = ?status.code(),
            "Git subprocess completed"
        );

        check_status(status, &stderr)
    }

    /// Resolve HEAD of the mirror; `None` for empty repositories
    async fn resolve_head(&self, request: &GitRequest) -> Option<String> {
        let args = vec![
            format!("--git-dir={}", request.local_path.to_string_lossy()),
            "rev-parse".to_string(),
            "--verify".to_string(),
            "--quiet".to_string(),
            "HEAD".to_string(),
        ];
        let output = tokio::time::timeout_at(request.deadline, self.command(&args).output())
            .await
            .ok()?
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let head = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!head.is_empty()).then_some(head)
    }

    /// SIGTERM first, then SIGKILL if the process outlives the grace period
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                info!(pid = %pid, "Sending SIGTERM to git");
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(pid = %pid, error = %e, "SIGTERM failed");
                }

                let started = tokio::time::Instant::now();
                while started.elapsed() < GRACEFUL_SHUTDOWN_TIMEOUT {
                    tokio::time::sleep(PROCESS_EXIT_POLL_INTERVAL).await;
                    if let Ok(Some(_)) = child.try_wait() {
                        debug!(pid = %pid, "Git exited after SIGTERM");
                        return;
                    }
                }
                warn!(pid = %pid, "Git did not exit after SIGTERM, sending SIGKILL");
            }
        }

        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to kill git");
        }
    }
}

#[async_trait]
impl GitBackend for CliGitBackend {
    fn name(&self) -> &'static str {
        "git-cli"
    }

    async fn clone_mirror(&self, request: &GitRequest) -> Result<GitOutput, GitError> {
        if request.cancel.is_cancelled() {
            return Err(GitError::Cancelled);
        }
        self.run_git(GitOperation::Clone, request).await?;
        Ok(GitOutput {
            head: self.resolve_head(request).await,
        })
    }

    async fn fetch_mirror(&self, request: &GitRequest) -> Result<GitOutput, GitError> {
        if request.cancel.is_cancelled() {
            return Err(GitError::Cancelled);
        }
        self.run_git(GitOperation::Fetch, request).await?;
        Ok(GitOutput {
            head: self.resolve_head(request).await,
        })
    }
}

fn authorization_header(creds: &Credentials) -> String {
    let (user, pass) = creds.git_userpass();
    let encoded = STANDARD.encode(format!("{}:{}", user, pass));
    format!("Authorization: Basic {}", encoded)
}

fn check_status(status: ExitStatus, stderr: &str) -> Result<(), GitError> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(_) if !stderr.trim().is_empty() => Err(classify_failure(stderr)),
        Some(code) => Err(GitError::Remote(format!("git exited with status {}", code))),
        // Killed by a signal from outside
        None => Err(GitError::Implementation(format!(
            "git terminated by signal: {}",
            stderr.trim()
        ))),
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}
