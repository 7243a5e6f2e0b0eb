use globset::{Glob, GlobMatcher};
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::warn;

/// Attempts granted to a retried command. The post-processing retry
/// sweeps use the same budget.
pub const RETRY_ATTEMPTS: u32 = 5;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("cannot write log file {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot start `{cmd}` in {}: {source}", wdir.display())]
    Spawn {
        cmd: String,
        wdir: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot collect output of `{cmd}`: {source}")]
    Collect {
        cmd: String,
        source: std::io::Error,
    },
    #[error(
        "command failed:\n    => cmd: {cmd}\n    => wdir: {wdir}\n    => err: {status}\n    => stderr: {stderr}\n    =="
    )]
    Failed {
        cmd: String,
        wdir: String,
        status: String,
        stderr: String,
    },
    #[error("invalid log preservation pattern")]
    Preserve(#[from] globset::Error),
}

/// How often and how patiently a command is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: RETRY_ATTEMPTS,
            pause: Duration::from_secs(60),
        }
    }
}

/// Runs `cmd` through `bash -c` in `dir` with `env` added to the
/// environment, blocking until it exits.
///
/// When `log_name` is given, stdout is streamed to that file in `dir`
/// (truncated first) and stderr is appended to it after the run.
/// Stderr is always captured and embedded in the error on failure.
pub fn run(cmd: &str, dir: &Path, log_name: Option<&str>, env: &[(&str, String)]) -> Result<(), ExecError> {
    let mut command = Command::new("bash");
    command
        .arg("-c")
        .arg(cmd)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stderr(Stdio::piped());
    for (name, value) in env {
        command.env(name, value);
    }

    let mut log = match log_name {
        Some(name) => {
            let path = dir.join(name);
            let file = File::create(&path).map_err(|source| ExecError::LogFile {
                path: path.clone(),
                source,
            })?;
            let stdout = file.try_clone().map_err(|source| ExecError::LogFile {
                path: path.clone(),
                source,
            })?;
            command.stdout(stdout);
            Some((path, file))
        }
        None => {
            command.stdout(Stdio::null());
            None
        }
    };

    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        cmd: cmd.to_owned(),
        wdir: dir.to_path_buf(),
        source,
    })?;

    // drain stderr before waiting, so the pipe cannot fill up and
    // stall the child
    let mut stderr_bytes = Vec::new();
    if let Some(pipe) = child.stderr.as_mut() {
        pipe.read_to_end(&mut stderr_bytes)
            .map_err(|source| ExecError::Collect {
                cmd: cmd.to_owned(),
                source,
            })?;
    }
    let status = child.wait().map_err(|source| ExecError::Collect {
        cmd: cmd.to_owned(),
        source,
    })?;
    let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();

    if let Some((path, file)) = log.as_mut() {
        if !stderr.is_empty() {
            file.write_all(stderr.as_bytes())
                .map_err(|source| ExecError::LogFile {
                    path: path.clone(),
                    source,
                })?;
        }
    }

    if status.success() {
        Ok(())
    } else {
        Err(ExecError::Failed {
            cmd: cmd.to_owned(),
            wdir: dir.display().to_string(),
            status: status.to_string(),
            stderr,
        })
    }
}

/// Like [`run`], but retries failed commands after a fixed pause.
///
/// Before each retry, files in `dir` matching the `preserve` glob are
/// copied aside to `<name>.<attempt>` so the evidence of a failed
/// attempt survives the next one. The error of the last attempt is
/// returned once the budget is exhausted.
pub fn run_with_retries(
    cmd: &str,
    dir: &Path,
    log_name: Option<&str>,
    preserve: Option<&str>,
    env: &[(&str, String)],
    policy: &RetryPolicy,
) -> Result<(), ExecError> {
    let preserve = match preserve {
        Some(pattern) => Some(Glob::new(pattern)?.compile_matcher()),
        None => None,
    };

    let attempts = policy.attempts.max(1);
    for attempt in 0..attempts - 1 {
        let error = match run(cmd, dir, log_name, env) {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };
        warn!(
            "Command `{cmd}` has failed: {error}. Retry n.{} in {}s",
            attempt + 1,
            policy.pause.as_secs()
        );
        if let Some(matcher) = &preserve {
            preserve_logs(dir, matcher, attempt);
        }
        thread::sleep(policy.pause);
    }
    run(cmd, dir, log_name, env)
}

// Preservation failures are warnings only, the retry still happens.
fn preserve_logs(dir: &Path, matcher: &GlobMatcher, attempt: u32) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) => {
            warn!("Cannot save logs for previous attempt: {error}");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !matcher.is_match(Path::new(&name)) {
            continue;
        }
        let name = name.to_string_lossy();
        let saved = dir.join(format!("{name}.{attempt}"));
        if let Err(error) = fs::copy(entry.path(), &saved) {
            warn!("Cannot save log file {name} to {}: {error}", saved.display());
        }
    }
}
