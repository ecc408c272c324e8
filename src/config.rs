use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::model::{Hook, ProgramSpec};

/// Top-level daemon configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Host name used to select this host's slice of the desired state.
    /// Default: kernel hostname.
    #[serde(default)]
    pub hostname: Option<String>,

    /// Root directory of the on-disk artifact cache. Artifacts are unpacked
    /// into `<bpf_dir>/<name>/<version>/`.
    #[serde(default = "default_bpf_dir")]
    pub bpf_dir: PathBuf,

    /// BPF filesystem root for pinned maps. Default: /sys/fs/bpf.
    #[serde(default = "default_bpf_map_root")]
    pub bpf_map_root: PathBuf,

    /// Directory passed to user programs as `--log-dir`, if set.
    #[serde(default)]
    pub bpf_log_dir: Option<PathBuf>,

    /// Default artifact repository base URL (file://, http://, https://).
    #[serde(default = "default_repo_url")]
    pub artifact_repo_url: String,

    /// Total HTTP request timeout for artifact downloads. Default: 30s.
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub http_client_timeout: Duration,

    /// Bound on waiting for HTTP response headers. Default: 10s.
    #[serde(default = "default_header_timeout", with = "humantime_serde")]
    pub http_header_timeout: Duration,

    /// Whether programs on one hook are stitched into a tail-call chain
    /// behind a root program. When false each hook holds at most one
    /// program. Default: true.
    #[serde(default = "default_true")]
    pub chaining_enabled: bool,

    /// Optional desired-state snapshot applied once at startup.
    #[serde(default)]
    pub desired_state_file: Option<PathBuf>,

    /// Prometheus health server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Monitor-map sampling configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Root program for the XDP hook.
    #[serde(default = "default_xdp_root")]
    pub xdp_root: RootProgramConfig,

    /// Root program for TC ingress.
    #[serde(default = "default_tc_root_ingress")]
    pub tc_root_ingress: RootProgramConfig,

    /// Root program for TC egress.
    #[serde(default = "default_tc_root_egress")]
    pub tc_root_egress: RootProgramConfig,
}

/// Health/metrics HTTP server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: "127.0.0.1:9553".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Monitor-map sampling configuration.
#[derive(Debug, Deserialize)]
pub struct MonitorConfig {
    /// How often monitor maps are sampled. Default: 30s.
    #[serde(default = "default_monitor_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Ring length for per-metric samples. Default: 24.
    #[serde(default = "default_monitor_samples")]
    pub samples: usize,
}

/// Identity of a hook's root program: a trivial kernel program owning the
/// head tail-call map of the chain.
#[derive(Debug, Clone, Deserialize)]
pub struct RootProgramConfig {
    pub name: String,
    pub version: String,
    pub artifact: String,
    pub map_name: String,
    pub object_file: String,
    pub entry_function: String,
}

impl RootProgramConfig {
    /// Materialize the root program as a spec at the head of the chain.
    pub fn to_spec(&self, hook: Hook) -> ProgramSpec {
        ProgramSpec {
            name: self.name.clone(),
            version: self.version.clone(),
            artifact: self.artifact.clone(),
            artifact_repo_url: None,
            hook,
            seq_id: 0,
            object_file: Some(self.object_file.clone()),
            entry_function: Some(self.entry_function.clone()),
            map_name: Some(self.map_name.clone()),
            cmd_start: None,
            cmd_stop: None,
            cmd_status: None,
            cmd_update: None,
            start_args: Default::default(),
            stop_args: Default::default(),
            status_args: Default::default(),
            update_args: Default::default(),
            map_args: Default::default(),
            monitor_maps: Vec::new(),
            rules_file: None,
            rules: None,
            user_program_daemon: false,
            admin_status: Default::default(),
            limits: Default::default(),
            config_file_path: None,
        }
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bpf_dir() -> PathBuf {
    PathBuf::from("/var/lib/bpfchaind/artifacts")
}

fn default_bpf_map_root() -> PathBuf {
    PathBuf::from("/sys/fs/bpf")
}

fn default_repo_url() -> String {
    "file:///var/lib/bpfchaind/repo".to_string()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_header_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    "127.0.0.1:9553".to_string()
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_monitor_samples() -> usize {
    24
}

fn default_xdp_root() -> RootProgramConfig {
    RootProgramConfig {
        name: "xdp-root".to_string(),
        version: "1.0.0".to_string(),
        artifact: "xdp-root.tar.gz".to_string(),
        map_name: "xdp_root_map".to_string(),
        object_file: "xdp_root.bpf.o".to_string(),
        entry_function: "xdp_root".to_string(),
    }
}

fn default_tc_root_ingress() -> RootProgramConfig {
    RootProgramConfig {
        name: "tc-root".to_string(),
        version: "1.0.0".to_string(),
        artifact: "tc-root.tar.gz".to_string(),
        map_name: "tc_root_ingress_map".to_string(),
        object_file: "tc_root.bpf.o".to_string(),
        entry_function: "tc_ingress_root".to_string(),
    }
}

fn default_tc_root_egress() -> RootProgramConfig {
    RootProgramConfig {
        name: "tc-root".to_string(),
        version: "1.0.0".to_string(),
        artifact: "tc-root.tar.gz".to_string(),
        map_name: "tc_root_egress_map".to_string(),
        object_file: "tc_root.bpf.o".to_string(),
        entry_function: "tc_egress_root".to_string(),
    }
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            hostname: None,
            bpf_dir: default_bpf_dir(),
            bpf_map_root: default_bpf_map_root(),
            bpf_log_dir: None,
            artifact_repo_url: default_repo_url(),
            http_client_timeout: default_http_timeout(),
            http_header_timeout: default_header_timeout(),
            chaining_enabled: true,
            desired_state_file: None,
            health: HealthConfig::default(),
            monitor: MonitorConfig::default(),
            xdp_root: default_xdp_root(),
            tc_root_ingress: default_tc_root_ingress(),
            tc_root_egress: default_tc_root_egress(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: default_monitor_interval(),
            samples: default_monitor_samples(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.bpf_dir.as_os_str().is_empty() {
            bail!("bpf_dir is required");
        }

        if self.bpf_map_root.as_os_str().is_empty() {
            bail!("bpf_map_root is required");
        }

        if self.artifact_repo_url.is_empty() {
            bail!("artifact_repo_url is required");
        }

        match self.artifact_repo_url.split_once("://") {
            Some(("file" | "http" | "https", _)) => {}
            _ => bail!(
                "artifact_repo_url has unsupported scheme: {}",
                self.artifact_repo_url
            ),
        }

        if self.monitor.samples == 0 {
            bail!("monitor.samples must be positive");
        }

        if self.health.addr.is_empty() {
            bail!("health.addr is required");
        }

        Ok(())
    }

    /// Root program definition for a hook.
    pub fn root_for(&self, hook: Hook) -> &RootProgramConfig {
        match hook {
            Hook::XdpIngress => &self.xdp_root,
            Hook::TcIngress => &self.tc_root_ingress,
            Hook::TcEgress => &self.tc_root_egress,
        }
    }

    /// Host name for desired-state selection: configured override or the
    /// kernel hostname.
    pub fn resolved_hostname(&self) -> Result<String> {
        if let Some(name) = &self.hostname {
            return Ok(name.clone());
        }
        let raw = std::fs::read_to_string("/proc/sys/kernel/hostname")
            .context("reading kernel hostname")?;
        Ok(raw.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.bpf_map_root, PathBuf::from("/sys/fs/bpf"));
        assert_eq!(cfg.http_client_timeout, Duration::from_secs(30));
        assert_eq!(cfg.http_header_timeout, Duration::from_secs(10));
        assert!(cfg.chaining_enabled);
        assert_eq!(cfg.health.addr, "127.0.0.1:9553");
        assert_eq!(cfg.monitor.samples, 24);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_root_for_hooks() {
        let cfg = Config::default();
        assert_eq!(cfg.root_for(Hook::XdpIngress).map_name, "xdp_root_map");
        assert_eq!(
            cfg.root_for(Hook::TcIngress).map_name,
            "tc_root_ingress_map"
        );
        assert_eq!(cfg.root_for(Hook::TcEgress).map_name, "tc_root_egress_map");
    }

    #[test]
    fn test_root_spec_shape() {
        let cfg = Config::default();
        let spec = cfg.xdp_root.to_spec(Hook::XdpIngress);
        assert_eq!(spec.seq_id, 0);
        assert!(spec.has_chain_map());
        assert!(spec.has_object_file());
        assert!(spec.admin_status.is_enabled());
        assert!(!spec.user_program_daemon);
    }

    #[test]
    fn test_validation_rejects_bad_scheme() {
        let cfg = Config {
            artifact_repo_url: "ftp://repo.example.com".to_string(),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn test_validation_rejects_zero_samples() {
        let cfg = Config {
            monitor: MonitorConfig {
                interval: Duration::from_secs(30),
                samples: 0,
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("monitor.samples"));
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
bpf_dir: /tmp/cache
artifact_repo_url: https://repo.example.com/ebpf
http_client_timeout: 45s
chaining_enabled: false
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.bpf_dir, PathBuf::from("/tmp/cache"));
        assert_eq!(cfg.http_client_timeout, Duration::from_secs(45));
        assert!(!cfg.chaining_enabled);
        // untouched fields keep defaults
        assert_eq!(cfg.health.addr, "127.0.0.1:9553");
        assert!(cfg.validate().is_ok());
    }
}
