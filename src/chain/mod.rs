//! Per-interface chain reconciliation.
//!
//! [`ChainManager`] holds the ordered program chain for every
//! (interface, hook) pair and drives kernel state toward the desired lists:
//! loading the root program on first insertion, inserting, removing,
//! replacing, and updating programs, and repairing exactly the two chain
//! edges around each mutation. All mutations are serialized by one
//! process-wide lock, held across the verification polls so linked state is
//! never observed half-written.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::artifact::Fetcher;
use crate::bpf::{link, loader, BpfProgram};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::export::HealthMetrics;
use crate::model::{order_by_seq, ArgMap, DesiredState, Hook, HookPrograms, ProgramSpec};

/// Minimal view of an installed slot used by the pure diff.
#[derive(Debug, Clone)]
pub struct SlotSummary {
    pub name: String,
    pub version: String,
    pub map_args: ArgMap,
    pub update_args: ArgMap,
}

/// One mutation decided by [`plan`]. Actions are emitted in execution
/// order: removals, replacements, insertions, then in-place updates.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanAction {
    Remove(String),
    Replace(ProgramSpec),
    Insert(ProgramSpec),
    UpdateConfig(ProgramSpec),
}

impl PlanAction {
    fn rank(&self) -> u8 {
        match self {
            PlanAction::Remove(_) => 0,
            PlanAction::Replace(_) => 1,
            PlanAction::Insert(_) => 2,
            PlanAction::UpdateConfig(_) => 3,
        }
    }
}

/// Diff the installed user slots against a desired list (already ordered by
/// sequence number). Pure; kernel work happens in the executor.
pub fn plan(current: &[SlotSummary], desired: &[ProgramSpec]) -> Vec<PlanAction> {
    let mut actions = Vec::new();

    for spec in desired {
        let installed = current.iter().find(|s| s.name == spec.name);

        if !spec.admin_status.is_enabled() {
            if installed.is_some() {
                actions.push(PlanAction::Remove(spec.name.clone()));
            }
            continue;
        }

        match installed {
            None => actions.push(PlanAction::Insert(spec.clone())),
            Some(slot) if slot.version != spec.version => {
                actions.push(PlanAction::Replace(spec.clone()));
            }
            Some(slot) if slot.map_args != spec.map_args || slot.update_args != spec.update_args => {
                actions.push(PlanAction::UpdateConfig(spec.clone()));
            }
            Some(_) => {}
        }
    }

    for slot in current {
        if !desired.iter().any(|spec| spec.name == slot.name) {
            actions.push(PlanAction::Remove(slot.name.clone()));
        }
    }

    actions.sort_by_key(|a| a.rank());
    actions
}

type ChainMap = HashMap<Hook, HashMap<String, Vec<BpfProgram>>>;

/// Owner of every chain on the host.
pub struct ChainManager {
    cfg: Arc<Config>,
    fetcher: Fetcher,
    health: Arc<HealthMetrics>,
    chains: Mutex<ChainMap>,
}

impl ChainManager {
    pub fn new(cfg: Arc<Config>, health: Arc<HealthMetrics>) -> Result<Self> {
        let fetcher = Fetcher::new(&cfg)?;
        Ok(Self {
            cfg,
            fetcher,
            health,
            chains: Mutex::new(HashMap::new()),
        })
    }

    /// Apply a full desired-state snapshot for this host.
    pub async fn apply_desired_state(&self, state: &DesiredState, hostname: &str) -> Result<()> {
        let Some(interfaces) = state.host(hostname) else {
            info!(hostname, "desired state has no entry for this host");
            return Ok(());
        };

        for (iface, hooks) in interfaces {
            self.reconcile(iface, hooks).await?;
        }
        Ok(())
    }

    /// Drive one interface toward its desired per-hook lists. Serialized by
    /// the process-wide lock; returns on the first fatal error, leaving the
    /// chain in its last consistent state.
    pub async fn reconcile(&self, iface: &str, desired: &HookPrograms) -> Result<()> {
        if !interface_exists(iface) {
            return Err(Error::UnknownInterface(iface.to_string()));
        }

        let start = Instant::now();
        let mut chains = self.chains.lock().await;

        let empty = Vec::new();
        for hook in Hook::ALL {
            let desired_list = desired.get(&hook).unwrap_or(&empty);
            self.reconcile_hook(&mut chains, iface, hook, desired_list)
                .await?;
        }

        self.health
            .reconcile_duration
            .observe(start.elapsed().as_secs_f64());
        Ok(())
    }

    async fn reconcile_hook(
        &self,
        chains: &mut ChainMap,
        iface: &str,
        hook: Hook,
        desired_in: &[ProgramSpec],
    ) -> Result<()> {
        let mut desired: Vec<ProgramSpec> = desired_in.to_vec();
        order_by_seq(&mut desired);

        let chaining = self.cfg.chaining_enabled;
        let any_enabled = desired.iter().any(|s| s.admin_status.is_enabled());

        let per_iface = chains.entry(hook).or_default();

        if !per_iface.contains_key(iface) && !any_enabled {
            return Ok(());
        }
        let chain = per_iface.entry(iface.to_string()).or_default();

        // First insertion on a hook brings up the root program that owns the
        // head of the chain.
        if chaining && chain.is_empty() && any_enabled {
            let root = self.load_root_program(iface, hook).await?;
            self.health
                .program_starts
                .with_label_values(&[&root.spec.name, hook.as_str(), iface])
                .inc();
            chain.push(root);
        }

        let offset = usize::from(chaining && !chain.is_empty());

        let summaries: Vec<SlotSummary> = chain[offset..]
            .iter()
            .map(|p| SlotSummary {
                name: p.spec.name.clone(),
                version: p.spec.version.clone(),
                map_args: p.spec.map_args.clone(),
                update_args: p.spec.update_args.clone(),
            })
            .collect();

        let actions = plan(&summaries, &desired);
        if !actions.is_empty() {
            debug!(iface, hook = %hook, count = actions.len(), "executing reconcile actions");
        }

        for action in actions {
            match action {
                PlanAction::Remove(name) => {
                    if let Some(pos) = position_of(chain, offset, &name) {
                        self.remove_at(chain, pos, iface, hook, chaining).await?;
                    }
                }
                PlanAction::Replace(spec) => {
                    if let Some(pos) = position_of(chain, offset, &spec.name) {
                        self.remove_at(chain, pos, iface, hook, chaining).await?;
                    }
                    self.insert_program(chain, offset, iface, hook, spec, chaining)
                        .await?;
                }
                PlanAction::Insert(spec) => {
                    self.insert_program(chain, offset, iface, hook, spec, chaining)
                        .await?;
                }
                PlanAction::UpdateConfig(spec) => {
                    if let Some(pos) = position_of(chain, offset, &spec.name) {
                        let program = &mut chain[pos];
                        match program.apply_config_update(&spec).await {
                            Ok(()) => {
                                self.health
                                    .program_updates
                                    .with_label_values(&[&spec.name, hook.as_str(), iface])
                                    .inc();
                            }
                            Err(e) => {
                                self.health
                                    .program_update_failures
                                    .with_label_values(&[&spec.name, hook.as_str(), iface])
                                    .inc();
                                return Err(e);
                            }
                        }
                    }
                }
            }
        }

        // Last removal tears the root down with it.
        if offset == 1 && chain.len() == 1 {
            let mut root = chain.pop().expect("root present");
            info!(iface, hook = %hook, "chain empty, removing root program");
            let root_name = root.spec.name.clone();
            root.stop(true).await?;
            if let Some(pin) = &root.map_pin_path {
                remove_stale_pin(pin)?;
            }
            self.health
                .program_stops
                .with_label_values(&[&root_name, hook.as_str(), iface])
                .inc();
        }

        if chain.is_empty() {
            per_iface.remove(iface);
        }

        let installed = per_iface.get(iface).map_or(0, |c| c.len());
        self.health
            .chain_length
            .with_label_values(&[iface, hook.as_str()])
            .set(installed as f64);

        Ok(())
    }

    /// Create, fetch, and start a program at its sequence position, then
    /// repair the forward edge if it landed mid-chain.
    async fn insert_program(
        &self,
        chain: &mut Vec<BpfProgram>,
        offset: usize,
        iface: &str,
        hook: Hook,
        spec: ProgramSpec,
        chaining: bool,
    ) -> Result<()> {
        let name = spec.name.clone();
        let version = spec.version.clone();

        let mut program = BpfProgram::new(spec, &self.cfg, iface)?;
        program.install_dir = self.fetcher.verify_and_get(&program.spec).await?;

        let rel = chain[offset..]
            .iter()
            .position(|p| p.spec.seq_id > program.spec.seq_id)
            .unwrap_or(chain.len() - offset);
        let pos = offset + rel;

        if chaining {
            let prev = &chain[pos - 1];
            program.set_predecessor(prev.prog_map_id, prev.map_pin_path.clone());
        }

        program.start(chaining).await?;

        // Wire the forward edge for a mid-chain insertion.
        if chaining && pos < chain.len() {
            let next_id = chain[pos].prog_id;
            if program.prog_map_id != 0 && next_id != 0 {
                link::put_next_prog_fd_from_id(program.prog_map_id, next_id)?;
            }
            let prev_map_id = program.prog_map_id;
            let prev_pin = program.map_pin_path.clone();
            chain[pos].set_predecessor(prev_map_id, prev_pin);
        }

        info!(iface, hook = %hook, program = %name, pos, "inserted program");
        chain.insert(pos, program);

        self.health
            .program_starts
            .with_label_values(&[&name, hook.as_str(), iface])
            .inc();
        self.health
            .programs_running
            .with_label_values(&[&name, &version, hook.as_str(), iface])
            .set(1.0);
        Ok(())
    }

    /// Stop and remove the slot at `pos`, then repair the gap: predecessor
    /// points at the successor, or its slot is cleared at the tail.
    async fn remove_at(
        &self,
        chain: &mut Vec<BpfProgram>,
        pos: usize,
        iface: &str,
        hook: Hook,
        chaining: bool,
    ) -> Result<()> {
        let mut program = chain.remove(pos);
        let name = program.spec.name.clone();
        let version = program.spec.version.clone();

        let stop_result = program.stop(chaining).await;

        self.health
            .program_stops
            .with_label_values(&[&name, hook.as_str(), iface])
            .inc();
        self.health
            .programs_running
            .with_label_values(&[&name, &version, hook.as_str(), iface])
            .set(0.0);

        // Repair the surrounding edge even if the stop reported a cleanup
        // problem, so the chain never dangles.
        if chaining && pos >= 1 {
            let prev_map_id = chain[pos - 1].prog_map_id;
            let prev_pin = chain[pos - 1].map_pin_path.clone();
            if pos < chain.len() {
                let next_id = chain[pos].prog_id;
                if prev_map_id != 0 && next_id != 0 {
                    link::put_next_prog_fd_from_id(prev_map_id, next_id)?;
                }
                chain[pos].set_predecessor(prev_map_id, prev_pin);
            } else if prev_map_id != 0 {
                link::remove_next_prog_fd(prev_map_id)?;
            }
        }

        info!(iface, hook = %hook, program = %name, "removed program");
        stop_result
    }

    /// Load the hook's root program, recovering from stale pins left by a
    /// crashed predecessor daemon.
    async fn load_root_program(&self, iface: &str, hook: Hook) -> Result<BpfProgram> {
        let spec = self.cfg.root_for(hook).to_spec(hook);
        info!(iface, hook = %hook, program = %spec.name, "loading root program");

        let mut root = BpfProgram::new(spec, &self.cfg, iface)?;
        root.install_dir = self.fetcher.verify_and_get(&root.spec).await?;

        // A pin with no in-memory owner means the previous daemon instance
        // crashed without cleanup.
        if let Some(pin) = root.map_pin_path.clone() {
            if pin.exists() {
                warn!(iface, hook = %hook, pin = %pin.display(), "stale root map found, removing");
                remove_stale_pin(&pin)?;
            }
        }

        loader::raise_memlock();
        root.start_root()?;
        Ok(root)
    }

    /// Sample monitor maps of every installed program into health gauges.
    pub async fn sample_monitor_metrics(&self) {
        let mut chains = self.chains.lock().await;
        for per_iface in chains.values_mut() {
            for (iface, chain) in per_iface.iter_mut() {
                for program in chain.iter_mut() {
                    let name = program.spec.name.clone();
                    for (metric, value) in program.sample_monitor_maps() {
                        self.health
                            .monitor_map_value
                            .with_label_values(&[&name, &metric, iface])
                            .set(value);
                    }
                }
            }
        }
    }

    /// Stop every chain: user programs tail-first, then the root.
    pub async fn close(&self) {
        let mut chains = self.chains.lock().await;
        for (hook, per_iface) in chains.iter_mut() {
            for (iface, chain) in per_iface.iter_mut() {
                while let Some(mut program) = chain.pop() {
                    let name = program.spec.name.clone();
                    if let Err(e) = program.stop(self.cfg.chaining_enabled).await {
                        warn!(iface = %iface, hook = %hook, program = %name, error = %e, "stop during shutdown failed");
                    }
                    self.health
                        .program_stops
                        .with_label_values(&[&name, hook.as_str(), iface])
                        .inc();
                }
            }
        }
        chains.clear();
        info!("all chains stopped");
    }
}

fn position_of(chain: &[BpfProgram], offset: usize, name: &str) -> Option<usize> {
    chain[offset..]
        .iter()
        .position(|p| p.spec.name == name)
        .map(|rel| offset + rel)
}

fn interface_exists(iface: &str) -> bool {
    !iface.is_empty() && Path::new("/sys/class/net").join(iface).exists()
}

fn remove_stale_pin(pin: &Path) -> Result<()> {
    if pin.to_string_lossy().contains("..") {
        return Err(Error::IllegalPath(pin.to_string_lossy().into_owned()));
    }
    match std::fs::remove_file(pin) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::StaleRootMap(pin.to_path_buf(), e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AdminStatus;

    fn spec(name: &str, version: &str, seq: u32) -> ProgramSpec {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "version": version,
            "artifact": format!("{name}.tar.gz"),
            "hook": "xdp_ingress",
            "seq_id": seq,
        }))
        .unwrap()
    }

    fn slot(name: &str, version: &str) -> SlotSummary {
        SlotSummary {
            name: name.to_string(),
            version: version.to_string(),
            map_args: Default::default(),
            update_args: Default::default(),
        }
    }

    #[test]
    fn test_plan_first_insert() {
        let actions = plan(&[], &[spec("foo", "1.0", 1)]);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], PlanAction::Insert(s) if s.name == "foo"));
    }

    #[test]
    fn test_plan_version_change_is_replace() {
        let actions = plan(&[slot("foo", "1.0")], &[spec("foo", "2.0", 1)]);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], PlanAction::Replace(s) if s.version == "2.0"));
    }

    #[test]
    fn test_plan_admin_disable_removes() {
        let mut disabled = spec("foo", "1.0", 1);
        disabled.admin_status = AdminStatus::Disabled;

        let actions = plan(&[slot("foo", "1.0")], &[disabled.clone()]);
        assert_eq!(actions, vec![PlanAction::Remove("foo".to_string())]);

        // disabled and not installed: nothing to do
        assert!(plan(&[], &[disabled]).is_empty());
    }

    #[test]
    fn test_plan_absent_in_desired_removes() {
        let actions = plan(
            &[slot("foo", "1.0"), slot("bar", "1.0")],
            &[spec("bar", "1.0", 2)],
        );
        assert_eq!(actions, vec![PlanAction::Remove("foo".to_string())]);
    }

    #[test]
    fn test_plan_args_change_updates_in_place() {
        let mut desired = spec("foo", "1.0", 1);
        desired
            .map_args
            .insert("rl_config_map".to_string(), serde_json::json!("4096"));

        let actions = plan(&[slot("foo", "1.0")], &[desired]);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], PlanAction::UpdateConfig(s) if s.name == "foo"));
    }

    #[test]
    fn test_plan_noop_when_converged() {
        let actions = plan(
            &[slot("foo", "1.0"), slot("bar", "2.1")],
            &[spec("foo", "1.0", 1), spec("bar", "2.1", 2)],
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn test_plan_orders_removals_before_inserts() {
        let actions = plan(
            &[slot("old", "1.0")],
            &[spec("new", "1.0", 1), spec("mid", "3.0", 2)],
        );
        assert_eq!(actions.len(), 3);
        assert!(matches!(&actions[0], PlanAction::Remove(n) if n == "old"));
        assert!(matches!(&actions[1], PlanAction::Insert(_)));
        assert!(matches!(&actions[2], PlanAction::Insert(_)));
    }

    #[test]
    fn test_interface_exists_loopback() {
        assert!(interface_exists("lo"));
        assert!(!interface_exists("definitely-not-an-iface"));
        assert!(!interface_exists(""));
    }

    #[test]
    fn test_remove_stale_pin_missing_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        remove_stale_pin(&tmp.path().join("gone")).unwrap();

        let pin = tmp.path().join("xdp_root_map");
        std::fs::write(&pin, [0u8; 4]).unwrap();
        remove_stale_pin(&pin).unwrap();
        assert!(!pin.exists());
    }
}
