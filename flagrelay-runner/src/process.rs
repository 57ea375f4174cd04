// Subprocess launch: one child per invocation, stdin inherited from this
// process, stdout/stderr piped back to the relay.

use flagrelay_core::{ArgumentList, FlagrelayError, HandlerConfig, Result};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Spawn the configured executable with `leading_args` followed by `args`.
///
/// Returns as soon as the process is running; the child is killed if its
/// handle is dropped.
pub fn spawn_subprocess(config: &HandlerConfig, args: &ArgumentList) -> Result<Child> {
    let program = resolve_program(&config.executable)?;

    let mut command = Command::new(&program);
    command
        .args(&config.leading_args)
        .args(args.iter())
        .envs(&config.env)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &config.working_directory {
        command.current_dir(dir);
    }

    debug!(program = %program.display(), "Spawning subprocess");

    command.spawn().map_err(|e| FlagrelayError::SpawnFailure {
        program: program.display().to_string(),
        reason: e.to_string(),
    })
}

/// Bare names (`aqua`) are looked up on `PATH`; anything with a directory
/// part (`./aqua`, `/opt/bin/aqua`) is used as given.
pub fn resolve_program(executable: &Path) -> Result<PathBuf> {
    let mut components = executable.components();
    let is_bare_name = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );

    if !is_bare_name {
        return Ok(executable.to_path_buf());
    }

    which::which(executable).map_err(|e| FlagrelayError::SpawnFailure {
        program: executable.display().to_string(),
        reason: e.to_string(),
    })
}
