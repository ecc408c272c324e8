//! Per-program lifecycle: fetch, load, attach, chain-link, configure,
//! supervise, and unload.
//!
//! A [`BpfProgram`] owns every runtime resource of one chain slot: the aya
//! collection, the hook attachment, the pinned maps, the optional user-space
//! child, and the optional config watcher. The reconciler composes these
//! through [`BpfProgram::start`] and [`BpfProgram::stop`] and wires
//! neighboring slots together through [`link`].

pub mod attach;
pub mod link;
pub mod loader;
pub mod maps;
pub mod watcher;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use aya::Ebpf;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::model::{string_arg, ProgramSpec};
use crate::supervisor::{self, CommandSpec, StartContext};

use attach::AttachHandle;
use maps::{BpfMap, MetricsBpfMap};
use watcher::ConfigWatcher;

/// Attempts for the pin-existence and prog-id verification polls.
const VERIFY_ATTEMPTS: u32 = 10;
/// Delay between verification attempts.
const VERIFY_DELAY: Duration = Duration::from_secs(1);

/// Runtime record for one program slot in a chain.
pub struct BpfProgram {
    pub spec: ProgramSpec,
    pub iface: String,
    /// Unpacked artifact directory; empty until artifacts are verified.
    pub install_dir: PathBuf,
    pub restart_count: u32,
    /// Kernel id of the entry program; 0 when not loaded.
    pub prog_id: u32,
    /// Kernel id of this program's own chain map.
    pub prog_map_id: u32,
    /// Kernel id of the predecessor's chain map (where our fd is written).
    pub prev_prog_map_id: u32,
    /// Pin path of this program's own chain map.
    pub map_pin_path: Option<PathBuf>,
    /// Pin path of the predecessor's chain map.
    pub prev_map_path: Option<PathBuf>,
    /// Maps owned by this program, by name.
    pub bpf_maps: HashMap<String, BpfMap>,
    /// Metric rings keyed by (map, key, aggregator).
    pub metrics_maps: HashMap<String, MetricsBpfMap>,
    collection: Option<Ebpf>,
    attachment: Option<AttachHandle>,
    child: Option<Child>,
    config_watcher: Option<ConfigWatcher>,
    bpf_map_root: PathBuf,
    log_dir: Option<PathBuf>,
    monitor_samples: usize,
}

impl BpfProgram {
    pub fn new(spec: ProgramSpec, cfg: &Config, iface: &str) -> Result<Self> {
        let map_pin_path = match spec.map_name.as_deref().filter(|m| !m.is_empty()) {
            Some(map_name) => {
                let path = loader::map_pin_path(&cfg.bpf_map_root, spec.hook, iface, map_name);
                if path.to_string_lossy().contains("..") {
                    return Err(Error::IllegalPath(path.to_string_lossy().into_owned()));
                }
                Some(path)
            }
            None => None,
        };

        Ok(Self {
            spec,
            iface: iface.to_string(),
            install_dir: PathBuf::new(),
            restart_count: 0,
            prog_id: 0,
            prog_map_id: 0,
            prev_prog_map_id: 0,
            map_pin_path,
            prev_map_path: None,
            bpf_maps: HashMap::new(),
            metrics_maps: HashMap::new(),
            collection: None,
            attachment: None,
            child: None,
            config_watcher: None,
            bpf_map_root: cfg.bpf_map_root.clone(),
            log_dir: cfg.bpf_log_dir.clone(),
            monitor_samples: cfg.monitor.samples,
        })
    }

    /// Record the predecessor's chain map so Start can link into it.
    pub fn set_predecessor(&mut self, map_id: u32, pin_path: Option<PathBuf>) {
        self.prev_prog_map_id = map_id;
        self.prev_map_path = pin_path;
    }

    /// Whether the daemon itself loaded the kernel side.
    pub fn loaded_natively(&self) -> bool {
        self.collection.is_some()
    }

    /// Start the program: clear the stale predecessor edge, load and link or
    /// attach the kernel side, launch the user program, then verify pins,
    /// apply map/update args, and confirm liveness.
    pub async fn start(&mut self, chain: bool) -> Result<()> {
        if self.install_dir.as_os_str().is_empty() {
            return Err(Error::StartupFailed {
                program: self.spec.name.clone(),
                reason: "no program install directory".to_string(),
            });
        }

        if let Some(cmd_start) = self.spec.cmd_start.clone() {
            supervisor::stop_external_instances(&cmd_start)?;
        }

        // A previous run may have left our fd in the predecessor's slot.
        if self.prev_prog_map_id != 0 {
            if let Err(e) = link::remove_next_prog_fd(self.prev_prog_map_id) {
                warn!(program = %self.spec.name, error = %e, "clearing stale predecessor entry failed");
            }
        }

        if self.spec.has_object_file() {
            if chain {
                self.load_and_link()?;
            } else {
                self.load_and_attach(false)?;
            }
        } else {
            info!(program = %self.spec.name, "no object file declared, user-space only");
        }

        if self.spec.cmd_start.is_some() {
            self.start_user_program(chain).await?;
        }

        if chain {
            self.verify_pinned_prog_map(true).await?;
        }

        if !self.spec.map_args.is_empty() {
            self.update_bpf_maps()?;
        }

        if self.spec.cmd_update.is_some() && !self.spec.update_args.is_empty() {
            self.run_update_command().await?;
        }

        // Programs loaded by their user program publish their own fd into
        // the predecessor's map; resolve our id from there.
        if self.prev_map_path.is_some() && self.collection.is_none() {
            self.resolve_prog_id_from_prev().await?;
        }

        if self.spec.cmd_update.is_some() {
            if let Some(config_path) = self.spec.config_file_path.clone() {
                self.spawn_config_watcher(PathBuf::from(config_path))?;
            }
        }

        let (user_alive, kernel_alive) = self.is_running().await;
        if !user_alive && !kernel_alive {
            return Err(Error::StartupFailed {
                program: self.spec.name.clone(),
                reason: "neither user-space nor kernel side is alive".to_string(),
            });
        }

        info!(program = %self.spec.name, prog_id = self.prog_id, "program started");
        Ok(())
    }

    /// Load the object and splice this program into the chain by writing its
    /// fd into the predecessor's map. Chained programs are not attached to
    /// the hook; the root program tail-calls into them.
    fn load_and_link(&mut self) -> Result<()> {
        let mut ebpf = self.load_object_common()?;

        self.update_program_map(&ebpf)?;

        if self.prev_prog_map_id != 0 {
            let entry = self.entry_function()?;
            let program = ebpf.program(&entry).ok_or_else(|| Error::MissingEntryFunction {
                function: entry.clone(),
                object: self.object_path(),
            })?;
            let fd = program.fd().map_err(|e| Error::MapUpdateFailed {
                map: format!("chain map id {}", self.prev_prog_map_id),
                reason: format!("program fd unavailable: {e}"),
            })?;
            link::write_prog_fd(self.prev_prog_map_id, fd)?;
            debug!(
                program = %self.spec.name,
                prev_map_id = self.prev_prog_map_id,
                "linked into predecessor map"
            );
        }

        self.collection = Some(ebpf);
        Ok(())
    }

    /// Load the object and attach it directly to the hook. Used for the root
    /// program and for every program when chaining is disabled.
    fn load_and_attach(&mut self, record_chain_map: bool) -> Result<()> {
        let mut ebpf = self.load_object_common()?;
        let entry = self.entry_function()?;

        let handle = attach::attach(
            &mut ebpf,
            &entry,
            &self.spec.name,
            &self.iface,
            self.spec.hook,
        )?;
        self.attachment = Some(handle);

        if record_chain_map && self.spec.has_chain_map() {
            self.update_program_map(&ebpf)?;
        }

        self.collection = Some(ebpf);
        Ok(())
    }

    /// Root-program start: attach at the hook and record the head chain map.
    pub fn start_root(&mut self) -> Result<()> {
        if self.install_dir.as_os_str().is_empty() {
            return Err(Error::StartupFailed {
                program: self.spec.name.clone(),
                reason: "no program install directory".to_string(),
            });
        }
        self.load_and_attach(true)
    }

    fn load_object_common(&mut self) -> Result<Ebpf> {
        let object = self.object_path();
        let entry = self.entry_function()?;

        let (mut ebpf, prog_id) = loader::load_object(&object, &entry, self.spec.hook)?;
        self.prog_id = prog_id;

        loader::seed_monitor_maps(&mut ebpf, &self.spec.monitor_maps, &self.spec.name)?;

        let owned = loader::pin_maps(&mut ebpf, &self.bpf_map_root, self.spec.hook, &self.iface)?;
        for map in owned {
            self.bpf_maps.insert(map.name.clone(), map);
        }

        Ok(ebpf)
    }

    fn object_path(&self) -> PathBuf {
        self.install_dir
            .join(self.spec.object_file.as_deref().unwrap_or_default())
    }

    fn entry_function(&self) -> Result<String> {
        self.spec
            .entry_function
            .clone()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| Error::MissingEntryFunction {
                function: String::new(),
                object: self.object_path(),
            })
    }

    /// Record the kernel id of this program's own chain map.
    fn update_program_map(&mut self, ebpf: &Ebpf) -> Result<()> {
        let Some(map_name) = self.spec.map_name.as_deref().filter(|m| !m.is_empty()) else {
            return Ok(());
        };

        let map = ebpf.map(map_name).ok_or_else(|| Error::MapLookupFailed {
            map: map_name.to_string(),
            reason: "chain map not present in object".to_string(),
        })?;
        self.prog_map_id = maps::map_id(map).ok_or_else(|| Error::MapLookupFailed {
            map: map_name.to_string(),
            reason: "kernel did not report a map id".to_string(),
        })?;
        Ok(())
    }

    async fn start_user_program(&mut self, chain: bool) -> Result<()> {
        let cmd_start = self
            .spec
            .cmd_start
            .clone()
            .expect("caller checked cmd_start");

        let rules_path = supervisor::write_rules_file(&self.spec, &self.install_dir)?;

        let ctx = StartContext {
            prev_map_path: if chain && self.collection.is_none() {
                self.prev_map_path.as_deref()
            } else {
                None
            },
            log_dir: self.log_dir.as_deref(),
            rules_file: rules_path.as_deref(),
        };

        let args = supervisor::build_start_args(&self.spec, &self.iface, &ctx)?;
        let cmd = CommandSpec::new(&self.install_dir, &cmd_start, args);

        if self.spec.user_program_daemon {
            let child = cmd.spawn()?;
            match child.id() {
                Some(pid) => {
                    supervisor::apply_limits(pid, &self.spec.limits);
                    info!(program = %self.spec.name, pid, "user program started");
                }
                None => {
                    return Err(Error::StartupFailed {
                        program: self.spec.name.clone(),
                        reason: "user program exited immediately".to_string(),
                    })
                }
            }
            self.child = Some(child);
        } else {
            let output = cmd.run().await?;
            if !output.status.success() {
                warn!(
                    program = %self.spec.name,
                    status = ?output.status.code(),
                    "one-shot user program exited non-zero"
                );
            }
        }

        Ok(())
    }

    /// Apply map-args through this program's own maps.
    pub fn update_bpf_maps(&mut self) -> Result<()> {
        let Some(ebpf) = self.collection.as_mut() else {
            return Err(Error::MapUpdateFailed {
                map: self.spec.name.clone(),
                reason: "kernel side not loaded by daemon".to_string(),
            });
        };

        for (key, value) in &self.spec.map_args {
            let value = string_arg(&self.spec.name, key, value)?;
            let map = ebpf.map_mut(key).ok_or_else(|| Error::MapLookupFailed {
                map: key.clone(),
                reason: "map not present in object".to_string(),
            })?;
            maps::write_map_cell(map, key, link::CHAIN_KEY, &value)?;
            info!(program = %self.spec.name, map = %key, value = %value, "applied map arg");
        }
        Ok(())
    }

    /// Invoke the user program's update command with `--cmd=update`.
    pub async fn run_update_command(&self) -> Result<()> {
        let Some(cmd_update) = self.spec.cmd_update.as_deref() else {
            return Ok(());
        };

        let args =
            supervisor::build_update_args(&self.spec, &self.iface, self.log_dir.as_deref())?;
        let cmd = CommandSpec::new(&self.install_dir, cmd_update, args);
        let output = cmd.run().await?;

        if !output.status.success() {
            return Err(Error::SpawnFailed {
                command: cmd.program.display().to_string(),
                source: std::io::Error::other(format!(
                    "update command exited with {:?}",
                    output.status.code()
                )),
            });
        }

        info!(program = %self.spec.name, "config updated");
        Ok(())
    }

    fn spawn_config_watcher(&mut self, config_path: PathBuf) -> Result<()> {
        let cmd_update = self
            .spec
            .cmd_update
            .as_deref()
            .expect("caller checked cmd_update");
        let args =
            supervisor::build_update_args(&self.spec, &self.iface, self.log_dir.as_deref())?;
        let cmd = CommandSpec::new(&self.install_dir, cmd_update, args);

        self.config_watcher = Some(ConfigWatcher::spawn(
            self.spec.name.clone(),
            config_path,
            watcher::DEFAULT_POLL_INTERVAL,
            cmd,
        ));
        Ok(())
    }

    /// Poll for our program id in the predecessor's pinned map.
    async fn resolve_prog_id_from_prev(&mut self) -> Result<()> {
        let path = self
            .prev_map_path
            .clone()
            .expect("caller checked prev_map_path");

        for _ in 0..VERIFY_ATTEMPTS {
            match link::read_next_prog_id(&path) {
                Ok(Some(prog_id)) if link::is_prog_loaded(prog_id) => {
                    self.prog_id = prog_id;
                    debug!(program = %self.spec.name, prog_id, "resolved program id");
                    return Ok(());
                }
                Ok(_) => {
                    warn!(program = %self.spec.name, "program id not yet published, retrying");
                }
                Err(e) => {
                    warn!(program = %self.spec.name, error = %e, "program id lookup failed, retrying");
                }
            }
            tokio::time::sleep(VERIFY_DELAY).await;
        }

        Err(Error::ProgIdResolveTimeout(self.spec.name.clone()))
    }

    /// Poll until this program's chain map pin exists (or does not, on
    /// teardown).
    async fn verify_pinned_prog_map(&self, expect_exists: bool) -> Result<()> {
        let Some(path) = self.map_pin_path.as_ref() else {
            return Ok(());
        };

        for _ in 0..VERIFY_ATTEMPTS {
            let exists = path.exists();
            if exists == expect_exists {
                debug!(
                    program = %self.spec.name,
                    path = %path.display(),
                    expect_exists,
                    "pinned map verified"
                );
                return Ok(());
            }
            tokio::time::sleep(VERIFY_DELAY).await;
        }

        if expect_exists {
            Err(Error::PinVerifyTimeout(path.clone()))
        } else {
            Err(Error::CleanupFailed {
                program: self.spec.name.clone(),
                reason: format!("pinned map {} was never removed", path.display()),
            })
        }
    }

    /// Poll until every owned map id stops resolving in the kernel.
    async fn verify_maps_vanish(&self, owned_ids: &[u32]) -> Result<()> {
        for _ in 0..VERIFY_ATTEMPTS {
            if owned_ids.iter().all(|id| !link::is_map_live(*id)) {
                return Ok(());
            }
            warn!(program = %self.spec.name, "kernel map references still live, retrying");
            tokio::time::sleep(VERIFY_DELAY).await;
        }

        Err(Error::CleanupFailed {
            program: self.spec.name.clone(),
            reason: "owned kernel maps were never released".to_string(),
        })
    }

    /// Liveness of the user-space and kernel sides.
    ///
    /// With a status command, both report its verdict. Otherwise the user
    /// side is the daemon child's state and the kernel side is whether the
    /// program id still resolves.
    pub async fn is_running(&mut self) -> (bool, bool) {
        if let Some(cmd_status) = self.spec.cmd_status.as_deref().filter(|c| !c.is_empty()) {
            let args = match supervisor::build_status_args(&self.spec) {
                Ok(args) => args,
                Err(e) => {
                    warn!(program = %self.spec.name, error = %e, "bad status args");
                    return (false, false);
                }
            };
            let cmd = CommandSpec::new(&self.install_dir, cmd_status, args);
            let healthy = supervisor::probe_status(&cmd).await;
            return (healthy, healthy);
        }

        let mut user_alive = true;
        if self.spec.cmd_start.is_some() && self.spec.user_program_daemon {
            user_alive = match self.child.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(None)),
                None => false,
            };
        }

        (user_alive, link::is_prog_loaded(self.prog_id))
    }

    /// Stop the program. Proceeds best-effort through every step and returns
    /// the first cleanup-fatal error, leaving later steps attempted.
    pub async fn stop(&mut self, chain: bool) -> Result<()> {
        info!(program = %self.spec.name, iface = %self.iface, "stopping program");

        if self.spec.user_program_daemon && self.child.is_none() && self.spec.cmd_stop.is_none() {
            warn!(program = %self.spec.name, "daemonized user program has no child handle");
        }

        let owned_ids: Vec<u32> = self.bpf_maps.values().map(|m| m.id).collect();
        let map_names: Vec<String> = self.bpf_maps.keys().cloned().collect();
        self.bpf_maps.clear();
        self.metrics_maps.clear();

        if let Some(watcher) = self.config_watcher.take() {
            watcher.stop().await;
        }

        self.prog_id = 0;

        let mut first_err: Option<Error> = None;
        let mut record = |e: Error| {
            warn!(error = %e, "stop step failed");
            if first_err.is_none() {
                first_err = Some(e);
            }
        };

        // User-space side first: explicit stop command wins, otherwise a
        // daemonized child is terminated directly.
        if let Some(cmd_stop) = self.spec.cmd_stop.clone().filter(|c| !c.is_empty()) {
            match supervisor::build_stop_args(&self.spec, &self.iface) {
                Ok(args) => {
                    let cmd = CommandSpec::new(&self.install_dir, &cmd_stop, args);
                    match cmd.run().await {
                        Ok(output) if !output.status.success() => {
                            warn!(
                                program = %self.spec.name,
                                status = ?output.status.code(),
                                "stop command exited non-zero"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(program = %self.spec.name, error = %e, "stop command failed"),
                    }
                }
                Err(e) => record(e),
            }
            self.child = None;
        } else if self.spec.user_program_daemon {
            if let Some(mut child) = self.child.take() {
                if let Err(e) = supervisor::terminate_child(&mut child, &self.spec.name).await {
                    record(e);
                }
            }
        }

        // Kernel side: detach, drop the collection, remove pins.
        if self.collection.is_some() {
            if let Some(handle) = self.attachment.take() {
                attach::detach(handle, &self.spec.name, &self.iface, self.spec.hook);
            }
            self.collection = None;

            if let Err(e) =
                loader::remove_pinned_maps(&map_names, &self.bpf_map_root, self.spec.hook, &self.iface)
            {
                record(e);
            }
        }

        if chain {
            if let Err(e) = self.verify_pinned_prog_map(false).await {
                record(e);
            }
        }

        if let Err(e) = self.verify_maps_vanish(&owned_ids).await {
            record(e);
        }

        self.prog_map_id = 0;
        self.prev_prog_map_id = 0;

        match first_err {
            Some(e) if !e.is_cleanup_soft() => Err(e),
            Some(e) => {
                warn!(program = %self.spec.name, error = %e, "stop completed with warnings");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Apply changed update-args and map-args in place, without a restart.
    pub async fn apply_config_update(&mut self, new_spec: &ProgramSpec) -> Result<()> {
        self.spec.map_args = new_spec.map_args.clone();
        self.spec.update_args = new_spec.update_args.clone();

        if !self.spec.map_args.is_empty() {
            self.update_bpf_maps()?;
        }
        if self.spec.cmd_update.is_some() && !self.spec.update_args.is_empty() {
            self.run_update_command().await?;
        }
        Ok(())
    }

    /// Sample declared monitor maps into their rings, returning
    /// (metric name, aggregated value) pairs for the exporter.
    pub fn sample_monitor_maps(&mut self) -> Vec<(String, f64)> {
        let Self {
            collection,
            spec,
            metrics_maps,
            monitor_samples,
            ..
        } = self;

        let Some(ebpf) = collection.as_mut() else {
            return Vec::new();
        };

        let mut out = Vec::with_capacity(spec.monitor_maps.len());
        for monitor in &spec.monitor_maps {
            let ring = metrics_maps
                .entry(format!(
                    "{}{}{}",
                    monitor.name, monitor.key, monitor.aggregator
                ))
                .or_insert_with(|| MetricsBpfMap::new(monitor, *monitor_samples));

            let Some(map) = ebpf.map_mut(&monitor.name) else {
                warn!(program = %spec.name, map = %monitor.name, "monitor map missing");
                continue;
            };

            match maps::read_map_cell(map, &monitor.name, monitor.key) {
                Ok(sample) => ring.record(sample),
                Err(e) => {
                    debug!(program = %spec.name, map = %monitor.name, error = %e, "monitor read failed");
                    continue;
                }
            }

            out.push((ring.metric_name(), ring.value()));
        }
        out
    }
}
