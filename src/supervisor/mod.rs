//! User-program supervision: argument rendering, spawn and termination,
//! status probing, and removal of externally started instances.
//!
//! The argument convention is a contract with companion programs: always
//! `--iface` and `--direction`, then any of `--map-name`, `--log-dir`,
//! `--rules-file`, `--cmd`, and finally the spec's own `--key=value` pairs.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::model::{string_arg, ArgMap, Hook, ProgramSpec, ResourceLimits};

/// Expected status-command output for a healthy program.
const STATUS_RUNNING: &str = "RUNNING";

/// Kernel comm values are truncated to this many bytes.
const COMM_LEN: usize = 15;

/// A fully rendered user-program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(install_dir: &Path, command: &str, args: Vec<String>) -> Self {
        Self {
            program: install_dir.join(command),
            args,
        }
    }

    /// Run the command to completion, capturing combined output.
    pub async fn run(&self) -> Result<std::process::Output> {
        assert_executable(&self.program)?;
        info!(command = %self.program.display(), args = ?self.args, "running user command");
        Command::new(&self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|e| Error::SpawnFailed {
                command: self.program.display().to_string(),
                source: e,
            })
    }

    /// Spawn the command as a long-running child.
    pub fn spawn(&self) -> Result<Child> {
        assert_executable(&self.program)?;
        info!(command = %self.program.display(), args = ?self.args, "spawning user program");
        Command::new(&self.program)
            .args(&self.args)
            .spawn()
            .map_err(|e| Error::SpawnFailed {
                command: self.program.display().to_string(),
                source: e,
            })
    }
}

/// Fail unless the path exists and carries an execute bit.
pub fn assert_executable(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path)
        .map_err(|_| Error::ExecNotExecutable(path.to_path_buf()))?;
    if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
        return Err(Error::ExecNotExecutable(path.to_path_buf()));
    }
    Ok(())
}

/// Optional inputs for start-argument rendering.
#[derive(Debug, Default)]
pub struct StartContext<'a> {
    /// Pinned path of the previous program's chain map; passed when the
    /// kernel side is loaded by the user program rather than the daemon.
    pub prev_map_path: Option<&'a Path>,
    pub log_dir: Option<&'a Path>,
    pub rules_file: Option<&'a Path>,
}

/// Render start arguments per the user-program contract.
pub fn build_start_args(spec: &ProgramSpec, iface: &str, ctx: &StartContext<'_>) -> Result<Vec<String>> {
    let mut args = base_args(iface, spec.hook);

    if let Some(map_path) = ctx.prev_map_path {
        args.push(format!("--map-name={}", map_path.display()));
    }
    if let Some(log_dir) = ctx.log_dir {
        args.push(format!("--log-dir={}", log_dir.display()));
    }
    if let Some(rules) = ctx.rules_file {
        args.push(format!("--rules-file={}", rules.display()));
    }

    append_arg_map(&mut args, &spec.name, &spec.start_args)?;
    Ok(args)
}

pub fn build_stop_args(spec: &ProgramSpec, iface: &str) -> Result<Vec<String>> {
    let mut args = base_args(iface, spec.hook);
    append_arg_map(&mut args, &spec.name, &spec.stop_args)?;
    Ok(args)
}

pub fn build_status_args(spec: &ProgramSpec) -> Result<Vec<String>> {
    let mut args = Vec::with_capacity(spec.status_args.len());
    append_arg_map(&mut args, &spec.name, &spec.status_args)?;
    Ok(args)
}

pub fn build_update_args(
    spec: &ProgramSpec,
    iface: &str,
    log_dir: Option<&Path>,
) -> Result<Vec<String>> {
    let mut args = base_args(iface, spec.hook);
    args.push("--cmd=update".to_string());
    if let Some(log_dir) = log_dir {
        args.push(format!("--log-dir={}", log_dir.display()));
    }
    append_arg_map(&mut args, &spec.name, &spec.update_args)?;
    Ok(args)
}

fn base_args(iface: &str, hook: Hook) -> Vec<String> {
    vec![
        format!("--iface={iface}"),
        format!("--direction={}", hook.as_str()),
    ]
}

fn append_arg_map(args: &mut Vec<String>, program: &str, map: &ArgMap) -> Result<()> {
    for (key, value) in map {
        let value = string_arg(program, key, value)?;
        args.push(format!("--{key}={value}"));
    }
    Ok(())
}

/// Write the spec's rules body to `<install-dir>/<hook>/<rules-file>` with
/// mode 0644, returning the path for `--rules-file`.
pub fn write_rules_file(spec: &ProgramSpec, install_dir: &Path) -> Result<Option<PathBuf>> {
    let (Some(file), Some(rules)) = (spec.rules_file.as_deref(), spec.rules.as_deref()) else {
        return Ok(None);
    };
    if file.is_empty() || rules.is_empty() {
        return Ok(None);
    }

    let dir = install_dir.join(spec.hook.as_str());
    std::fs::create_dir_all(&dir)?;

    let path = dir.join(file);
    std::fs::write(&path, rules)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;

    debug!(program = %spec.name, path = %path.display(), "wrote rules file");
    Ok(Some(path))
}

/// Kill any process whose executable name matches the start command and
/// whose parent is not this daemon. Run before every spawn so at most one
/// instance of a user program exists per host.
pub fn stop_external_instances(cmd_start: &str) -> Result<()> {
    if cmd_start.is_empty() {
        return Err(Error::StopExternalFailed(
            cmd_start.to_string(),
            "process name cannot be empty".to_string(),
        ));
    }

    let basename = Path::new(cmd_start)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| cmd_start.to_string());
    let truncated: String = basename.chars().take(COMM_LEN).collect();

    let my_pid = std::process::id();
    info!(process = %basename, my_pid, "searching for external instances");

    let entries = std::fs::read_dir("/proc").map_err(|e| {
        Error::StopExternalFailed(basename.clone(), format!("reading /proc: {e}"))
    })?;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        if pid == my_pid {
            continue;
        }

        let Ok(comm) = read_proc_comm(pid) else {
            continue;
        };
        if !comm.contains(&truncated) {
            continue;
        }

        let ppid = read_proc_ppid(pid).unwrap_or(0);
        if ppid == my_pid {
            continue;
        }

        warn!(pid, comm = %comm, ppid, "stopping external instance");
        // SAFETY: plain kill(2) on a pid we just discovered.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // the process may have exited between scan and kill
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(Error::StopExternalFailed(basename, err.to_string()));
            }
        }
    }

    Ok(())
}

/// Liveness check by pid, optionally matching the executable name.
pub fn is_process_running(pid: u32, name: &str) -> bool {
    match read_proc_comm(pid) {
        Ok(comm) => {
            let truncated: String = name.chars().take(COMM_LEN).collect();
            name.is_empty() || comm.contains(&truncated)
        }
        Err(_) => false,
    }
}

/// Run the status command and report health: the combined stdout/stderr must
/// equal `RUNNING`, case-insensitively, after trimming.
pub async fn probe_status(cmd: &CommandSpec) -> bool {
    match cmd.run().await {
        Ok(output) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            status_output_is_running(&combined)
        }
        Err(e) => {
            warn!(command = %cmd.program.display(), error = %e, "status command failed");
            false
        }
    }
}

fn status_output_is_running(output: &str) -> bool {
    output.trim().eq_ignore_ascii_case(STATUS_RUNNING)
}

/// Send SIGTERM to a daemonized child and wait for it to exit.
pub async fn terminate_child(child: &mut Child, name: &str) -> Result<()> {
    if let Some(pid) = child.id() {
        // SAFETY: signalling our own child.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(program = name, pid, error = %err, "SIGTERM failed, killing");
                let _ = child.start_kill();
            }
        }
    }

    match child.wait().await {
        Ok(status) => {
            debug!(program = name, ?status, "user program exited");
            Ok(())
        }
        Err(e) => Err(Error::SpawnFailed {
            command: name.to_string(),
            source: e,
        }),
    }
}

/// Apply declared resource limits to a running child.
pub fn apply_limits(pid: u32, limits: &ResourceLimits) {
    if let Some(cpu) = limits.cpu_secs {
        set_prlimit(pid, libc::RLIMIT_CPU, cpu);
    }
    if let Some(memory) = limits.memory_bytes {
        set_prlimit(pid, libc::RLIMIT_AS, memory);
    }
}

fn set_prlimit(pid: u32, resource: libc::__rlimit_resource_t, value: u64) {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    // SAFETY: prlimit reads the new limit struct and ignores the old-limit
    // pointer when null.
    let rc = unsafe { libc::prlimit(pid as libc::pid_t, resource, &limit, std::ptr::null_mut()) };
    if rc != 0 {
        warn!(
            pid,
            resource = resource as i32,
            error = %std::io::Error::last_os_error(),
            "failed to apply resource limit"
        );
    }
}

fn read_proc_comm(pid: u32) -> std::io::Result<String> {
    let data = std::fs::read_to_string(format!("/proc/{pid}/comm"))?;
    Ok(data.trim().to_string())
}

fn read_proc_ppid(pid: u32) -> Option<u32> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("PPid:") {
            return rest.trim().parse().ok();
        }
    }
    None
}
