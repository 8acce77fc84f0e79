//! Thin wrapper around `std::process::Command` for external build tools.
//!
//! Every privileged filesystem operation in this crate (mount, mksquashfs,
//! xorriso, ...) shells out to a host tool. `Cmd` gives those call sites a
//! builder with captured output, a caller-supplied error message, and an
//! interactive mode for long-running tools whose progress the operator
//! should see.

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    success: bool,
}

impl CmdOutput {
    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.success
    }
}

/// Builder for running an external tool.
///
/// # Example
///
/// ```rust,ignore
/// use liveforge::process::Cmd;
///
/// Cmd::new("mkfs.fat")
///     .args(["-F", "16"])
///     .arg_path(&image)
///     .error_msg("mkfs.fat failed. Install dosfstools.")
///     .run()?;
/// ```
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    env_clear: bool,
    current_dir: Option<PathBuf>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Cmd {
            program: program.to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            env_clear: false,
            current_dir: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_os_string());
        }
        self
    }

    /// Append a path argument without lossy string conversion.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs
            .push((OsString::from(key), OsString::from(value)));
        self
    }

    /// Start from an empty environment instead of inheriting ours.
    /// Host environment bleeding into a chroot breaks package scripts.
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Message used when the command fails. Should tell the operator what
    /// broke and, for missing tools, which package to install.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Treat a non-zero exit as a normal result instead of an error.
    /// The caller inspects `CmdOutput::success()`.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if self.env_clear {
            command.env_clear();
        }
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }

    fn failure(&self, stderr: &str) -> anyhow::Error {
        let detail = stderr.trim();
        let msg = match &self.error_msg {
            Some(msg) => msg.clone(),
            None => format!("command '{}' failed", self.program),
        };
        if detail.is_empty() {
            anyhow::anyhow!("{}", msg)
        } else {
            anyhow::anyhow!("{}\n{}", msg, detail)
        }
    }

    /// Run with captured stdout/stderr.
    pub fn run(self) -> Result<CmdOutput> {
        let output = self
            .command()
            .output()
            .with_context(|| format!("running '{}'", self.program))?;

        let result = CmdOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
        };

        if !result.success && !self.allow_fail {
            return Err(self.failure(&result.stderr));
        }

        Ok(result)
    }

    /// Run with inherited stdio so the operator sees tool progress live.
    pub fn run_interactive(self) -> Result<()> {
        let status = self
            .command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("running '{}'", self.program))?;

        if !status.success() && !self.allow_fail {
            return Err(self.failure(""));
        }

        Ok(())
    }
}

/// Run a shell command line through `sh -c`.
///
/// For the few places that genuinely need a pipeline. Single tools go
/// through [`Cmd`].
pub fn shell(command: &str) -> Result<()> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .with_context(|| format!("running shell command: {}", command))?;

    if !status.success() {
        bail!("shell command failed: {}", command);
    }

    Ok(())
}

/// Whether a tool is available on PATH.
pub fn exists(tool: &str) -> bool {
    which::which(tool).is_ok()
}

/// Bail with a readable message when a required input path is missing.
pub fn ensure_exists(path: &Path, description: &str) -> Result<()> {
    if !path.exists() {
        bail!("{} not found at '{}'", description, path.display());
    }
    Ok(())
}
