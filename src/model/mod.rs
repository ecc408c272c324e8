//! Declarative input model: program specifications and desired state.
//!
//! The desired-state snapshot arrives from the config-delivery surface as
//! ordered program lists keyed by hook kind, interface, and host. The core
//! consumes it read-only; all runtime bookkeeping lives on
//! [`crate::bpf::BpfProgram`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Kernel hook a program attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    XdpIngress,
    TcIngress,
    TcEgress,
}

impl Hook {
    pub const ALL: [Hook; 3] = [Hook::XdpIngress, Hook::TcIngress, Hook::TcEgress];

    /// Stable string form, also passed to user programs as `--direction`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::XdpIngress => "xdp_ingress",
            Hook::TcIngress => "tc_ingress",
            Hook::TcEgress => "tc_egress",
        }
    }

    pub fn is_xdp(&self) -> bool {
        matches!(self, Hook::XdpIngress)
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Hook {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xdp_ingress" => Ok(Hook::XdpIngress),
            "tc_ingress" => Ok(Hook::TcIngress),
            "tc_egress" => Ok(Hook::TcEgress),
            other => Err(Error::UnknownHook(other.to_string())),
        }
    }
}

/// Administrative state requested for a program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminStatus {
    #[default]
    Enabled,
    Disabled,
}

impl AdminStatus {
    pub fn is_enabled(&self) -> bool {
        matches!(self, AdminStatus::Enabled)
    }
}

/// Monitor-map declaration: a kernel map cell sampled into metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorMapSpec {
    pub name: String,
    #[serde(default)]
    pub key: u32,
    #[serde(default)]
    pub aggregator: String,
}

/// Resource limits applied to a daemonized user program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Soft CPU-time limit in seconds.
    #[serde(default)]
    pub cpu_secs: Option<u64>,
    /// Address-space limit in bytes.
    #[serde(default)]
    pub memory_bytes: Option<u64>,
}

/// Heterogeneous keyword arguments delivered by the external surface.
///
/// Values must be strings; anything else is rejected with `BadArgument` at
/// the point of use rather than at parse time.
pub type ArgMap = serde_json::Map<String, serde_json::Value>;

/// One program in a hook's ordered list.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProgramSpec {
    /// Stable name, unique within its (interface, hook) list.
    pub name: String,
    /// Semantic version of the artifact.
    pub version: String,
    /// Artifact file name (`.tar.gz` or `.zip`).
    pub artifact: String,
    /// Per-program artifact repository override.
    #[serde(default)]
    pub artifact_repo_url: Option<String>,
    /// Hook this program attaches to.
    pub hook: Hook,
    /// Position within the hook's list; unique, defines total order.
    pub seq_id: u32,
    /// Compiled object file inside the artifact; absent for user-space-only
    /// programs.
    #[serde(default)]
    pub object_file: Option<String>,
    /// Entry function inside the object file.
    #[serde(default)]
    pub entry_function: Option<String>,
    /// Tail-call map owned by this program; absent for terminal programs.
    #[serde(default)]
    pub map_name: Option<String>,
    #[serde(default)]
    pub cmd_start: Option<String>,
    #[serde(default)]
    pub cmd_stop: Option<String>,
    #[serde(default)]
    pub cmd_status: Option<String>,
    #[serde(default)]
    pub cmd_update: Option<String>,
    #[serde(default)]
    pub start_args: ArgMap,
    #[serde(default)]
    pub stop_args: ArgMap,
    #[serde(default)]
    pub status_args: ArgMap,
    #[serde(default)]
    pub update_args: ArgMap,
    /// Config map writes applied through the map interface at start.
    #[serde(default)]
    pub map_args: ArgMap,
    #[serde(default)]
    pub monitor_maps: Vec<MonitorMapSpec>,
    #[serde(default)]
    pub rules_file: Option<String>,
    #[serde(default)]
    pub rules: Option<String>,
    /// Whether the start command stays resident.
    #[serde(default)]
    pub user_program_daemon: bool,
    #[serde(default)]
    pub admin_status: AdminStatus,
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Path watched for live reconfiguration.
    #[serde(default)]
    pub config_file_path: Option<String>,
}

impl ProgramSpec {
    /// Whether this program participates in tail-call chaining.
    pub fn has_chain_map(&self) -> bool {
        self.map_name.as_deref().is_some_and(|m| !m.is_empty())
    }

    /// Whether the kernel side is loaded by the daemon itself.
    pub fn has_object_file(&self) -> bool {
        self.object_file.as_deref().is_some_and(|o| !o.is_empty())
    }
}

/// Ordered program lists per hook.
pub type HookPrograms = HashMap<Hook, Vec<ProgramSpec>>;

/// Desired state for one host: interface name to per-hook lists.
pub type InterfacePrograms = HashMap<String, HookPrograms>;

/// Full desired-state snapshot: host name to interfaces.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DesiredState(pub HashMap<String, InterfacePrograms>);

impl DesiredState {
    /// Programs for one host, if the snapshot covers it.
    pub fn host(&self, hostname: &str) -> Option<&InterfacePrograms> {
        self.0.get(hostname)
    }
}

/// Extract a string argument value, rejecting any other JSON type.
pub fn string_arg(program: &str, key: &str, value: &serde_json::Value) -> Result<String, Error> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        _ => Err(Error::BadArgument {
            program: program.to_string(),
            key: key.to_string(),
        }),
    }
}

/// Sort a desired list by sequence number. Sequence numbers are unique by
/// invariant; ties are broken by name to keep the order deterministic anyway.
pub fn order_by_seq(specs: &mut [ProgramSpec]) {
    specs.sort_by(|a, b| a.seq_id.cmp(&b.seq_id).then_with(|| a.name.cmp(&b.name)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, seq: u32) -> ProgramSpec {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "version": "1.0.0",
            "artifact": format!("{name}.tar.gz"),
            "hook": "xdp_ingress",
            "seq_id": seq,
        }))
        .expect("valid spec")
    }

    #[test]
    fn test_hook_roundtrip() {
        for hook in Hook::ALL {
            assert_eq!(hook.as_str().parse::<Hook>().unwrap(), hook);
        }
        assert!(matches!(
            "xdpingress".parse::<Hook>(),
            Err(Error::UnknownHook(_))
        ));
    }

    #[test]
    fn test_hook_as_map_key() {
        let yaml = r#"
xdp_ingress:
  - name: ratelimit
    version: "1.0.0"
    artifact: ratelimit.tar.gz
    hook: xdp_ingress
    seq_id: 1
tc_egress: []
"#;
        let parsed: HookPrograms = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed[&Hook::XdpIngress].len(), 1);
        assert!(parsed[&Hook::TcEgress].is_empty());
        assert_eq!(parsed[&Hook::XdpIngress][0].name, "ratelimit");
        assert!(parsed[&Hook::XdpIngress][0].admin_status.is_enabled());
    }

    #[test]
    fn test_order_by_seq() {
        let mut specs = vec![spec("c", 3), spec("a", 1), spec("b", 2)];
        order_by_seq(&mut specs);
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn test_string_arg_rejects_non_strings() {
        assert_eq!(
            string_arg("p", "k", &serde_json::json!("v")).unwrap(),
            "v"
        );
        assert!(matches!(
            string_arg("p", "k", &serde_json::json!(42)),
            Err(Error::BadArgument { .. })
        ));
        assert!(matches!(
            string_arg("p", "k", &serde_json::json!(["a"])),
            Err(Error::BadArgument { .. })
        ));
    }

    #[test]
    fn test_chain_map_and_object_predicates() {
        let mut s = spec("x", 1);
        assert!(!s.has_chain_map());
        assert!(!s.has_object_file());
        s.map_name = Some("next_prog_map".into());
        s.object_file = Some("x.bpf.o".into());
        assert!(s.has_chain_map());
        assert!(s.has_object_file());
        s.map_name = Some(String::new());
        assert!(!s.has_chain_map());
    }
}
