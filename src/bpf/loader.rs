//! Kernel object loading and map pinning.
//!
//! Loads a compiled object file through aya, selects the entry program for
//! the hook, seeds declared monitor maps, and pins every map in the object
//! into the canonical per-interface directory. Pin paths are a stable
//! contract with companion user programs:
//!
//! - XDP: `<bpf_map_root>/<iface>/<map-name>`
//! - TC:  `<bpf_map_root>/tc/globals/<iface>/<map-name>`

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Once;

use aya::programs::{Program, SchedClassifier, Xdp};
use aya::Ebpf;
use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::model::{Hook, MonitorMapSpec};

use super::maps::{self, BpfMap};

/// Subdirectory of the BPF filesystem where TC maps are pinned.
const TC_GLOBALS: &str = "tc/globals";

static MEMLOCK_ONCE: Once = Once::new();

/// Raise RLIMIT_MEMLOCK so map and program allocations are not rejected on
/// kernels that still account BPF memory against it. Runs once per process.
pub fn raise_memlock() {
    MEMLOCK_ONCE.call_once(|| {
        let limit = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        // SAFETY: setrlimit only reads the provided struct.
        let rc = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
        if rc != 0 {
            warn!(
                errno = std::io::Error::last_os_error().raw_os_error(),
                "failed to raise RLIMIT_MEMLOCK"
            );
        }
    });
}

/// Directory a program's maps are pinned into.
pub fn map_pin_dir(bpf_map_root: &Path, hook: Hook, iface: &str) -> PathBuf {
    if hook.is_xdp() {
        bpf_map_root.join(iface)
    } else {
        bpf_map_root.join(TC_GLOBALS).join(iface)
    }
}

/// Canonical pin path for one named map.
pub fn map_pin_path(bpf_map_root: &Path, hook: Hook, iface: &str, map_name: &str) -> PathBuf {
    map_pin_dir(bpf_map_root, hook, iface).join(map_name)
}

/// Load an object file and the entry program for the given hook.
///
/// All maps in the object are created; only the entry function is loaded as
/// a program. Returns the collection handle and the kernel program id.
pub fn load_object(object: &Path, entry: &str, hook: Hook) -> Result<(Ebpf, u32)> {
    if !object.is_file() {
        return Err(Error::LoadFailed {
            object: object.to_path_buf(),
            source: anyhow::anyhow!("object file does not exist"),
        });
    }

    raise_memlock();

    let mut ebpf = Ebpf::load_file(object).map_err(|e| Error::LoadFailed {
        object: object.to_path_buf(),
        source: e.into(),
    })?;

    let program = ebpf
        .program_mut(entry)
        .ok_or_else(|| Error::MissingEntryFunction {
            function: entry.to_string(),
            object: object.to_path_buf(),
        })?;

    load_entry_program(program, hook).map_err(|e| Error::LoadFailed {
        object: object.to_path_buf(),
        source: e,
    })?;

    let prog_id = entry_program_id(&ebpf, entry).map_err(|e| Error::LoadFailed {
        object: object.to_path_buf(),
        source: e,
    })?;

    debug!(object = %object.display(), entry, prog_id, "loaded object");
    Ok((ebpf, prog_id))
}

fn load_entry_program(program: &mut Program, hook: Hook) -> anyhow::Result<()> {
    if hook.is_xdp() {
        let xdp: &mut Xdp = program
            .try_into()
            .map_err(|_| anyhow::anyhow!("entry function is not an XDP program"))?;
        xdp.load()?;
    } else {
        let cls: &mut SchedClassifier = program
            .try_into()
            .map_err(|_| anyhow::anyhow!("entry function is not a TC classifier program"))?;
        cls.load()?;
    }
    Ok(())
}

fn entry_program_id(ebpf: &Ebpf, entry: &str) -> anyhow::Result<u32> {
    let program = ebpf
        .program(entry)
        .ok_or_else(|| anyhow::anyhow!("entry function vanished after load"))?;
    Ok(program.info()?.id())
}

/// Seed declared monitor maps with zeroed entries. Width or type mismatches
/// are logged and skipped inside; only real kernel failures surface.
pub fn seed_monitor_maps(
    ebpf: &mut Ebpf,
    monitor_maps: &[MonitorMapSpec],
    program: &str,
) -> Result<()> {
    maps::seed_monitor_maps(ebpf, monitor_maps, program)
}

/// Pin every map of the collection into the canonical directory, creating it
/// with mode 0750. A pre-existing pin for the same map name is reused, not
/// overwritten, so siblings can share a map. Returns the owned-map records.
pub fn pin_maps(
    ebpf: &mut Ebpf,
    bpf_map_root: &Path,
    hook: Hook,
    iface: &str,
) -> Result<Vec<BpfMap>> {
    let dir = map_pin_dir(bpf_map_root, hook, iface);
    if dir.to_string_lossy().contains("..") {
        return Err(Error::IllegalPath(dir.to_string_lossy().into_owned()));
    }

    if !dir.is_dir() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(&dir)
            .map_err(|e| Error::PinFailed {
                map: String::new(),
                path: dir.clone(),
                reason: format!("creating pin directory: {e}"),
            })?;
    }

    let mut owned = Vec::new();
    for (name, map) in ebpf.maps_mut() {
        let path = dir.join(name);

        if !path.exists() {
            map.pin(&path).map_err(|e| Error::PinFailed {
                map: name.to_string(),
                path: path.clone(),
                reason: e.to_string(),
            })?;
        } else {
            debug!(map = name, path = %path.display(), "reusing existing pin");
        }

        if let Some(id) = maps::map_id(map) {
            owned.push(BpfMap {
                name: name.to_string(),
                id,
            });
        }
    }

    Ok(owned)
}

/// Remove the pinned files of the named maps. Missing files are fine; other
/// failures are reported so Stop can escalate after its verification poll.
pub fn remove_pinned_maps(
    map_names: &[String],
    bpf_map_root: &Path,
    hook: Hook,
    iface: &str,
) -> Result<()> {
    for name in map_names {
        let path = map_pin_path(bpf_map_root, hook, iface, name);
        if path.to_string_lossy().contains("..") {
            return Err(Error::IllegalPath(path.to_string_lossy().into_owned()));
        }
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed pinned map"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::CleanupFailed {
                    program: name.clone(),
                    reason: format!("removing pin {}: {e}", path.display()),
                })
            }
        }
    }
    Ok(())
}
