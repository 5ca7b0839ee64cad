use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;

/// Result of a finished external program.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// The last non-empty line the program wrote to stderr, usually the error message
    pub fn last_error_line(&self) -> Option<&str> {
        self.stderr
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .next_back()
    }
}

/// Runs a program with arguments and additional environment variables, capturing output.
///
/// # Arguments
/// * `program` - The program to execute, looked up in `PATH` unless it is a path.
/// * `args` - Command line arguments.
/// * `env_vars` - A map of environment variables to set.
/// * `working_dir` - Directory to run the program in.
///
/// # Errors
/// When the program cannot launch, or its status cannot be determined.
pub async fn run_command<I, A, S>(
    program: &OsStr,
    args: I,
    env_vars: HashMap<OsString, OsString, S>,
    working_dir: &Path,
) -> io::Result<CommandOutput>
where
    I: IntoIterator<Item = A>,
    A: AsRef<OsStr>,
    S: std::hash::BuildHasher,
{
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.current_dir(working_dir);
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);

    for (key, value) in env_vars {
        cmd.env(key, value);
    }

    let output = cmd.output().await?;
    Ok(CommandOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
