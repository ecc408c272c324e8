//! Tail-call chain plumbing.
//!
//! Every chained program owns a single-slot program array (key 0, value =
//! next program's fd). Linking writes the successor's fd into the
//! predecessor's map; shortening the chain deletes the entry. Userspace
//! lookups of a program array return the program *id*, which aya does not
//! expose, so the read path goes through a minimal bpf(2) wrapper.

use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::path::Path;

use aya::maps::{Map, MapData, ProgramArray};
use aya::programs::loaded_programs;
use aya::programs::ProgramFd;
use tracing::debug;

use crate::errors::{Error, Result};

/// Slot written in every chaining map.
pub const CHAIN_KEY: u32 = 0;

/// Write a program fd into the chain map identified by kernel map id.
pub fn write_prog_fd(map_id: u32, fd: &ProgramFd) -> Result<()> {
    let data = MapData::from_id(map_id).map_err(|e| Error::MapLookupFailed {
        map: format!("map id {map_id}"),
        reason: e.to_string(),
    })?;
    let mut array = ProgramArray::try_from(Map::ProgramArray(data)).map_err(|e| {
        Error::MapUpdateFailed {
            map: format!("map id {map_id}"),
            reason: format!("not a program array: {e}"),
        }
    })?;
    array
        .set(CHAIN_KEY, fd, 0)
        .map_err(|e| Error::MapUpdateFailed {
            map: format!("map id {map_id}"),
            reason: e.to_string(),
        })
}

/// Resolve a program fd from its kernel id.
pub fn prog_fd_by_id(prog_id: u32) -> Result<ProgramFd> {
    let info = loaded_programs()
        .filter_map(|p| p.ok())
        .find(|p| p.id() == prog_id)
        .ok_or_else(|| Error::MapLookupFailed {
            map: format!("program id {prog_id}"),
            reason: "no loaded program with this id".to_string(),
        })?;
    info.fd().map_err(|e| Error::MapLookupFailed {
        map: format!("program id {prog_id}"),
        reason: e.to_string(),
    })
}

/// Point the chain map at the program identified by `next_prog_id`.
/// Used when repairing the edge between two surviving neighbors.
pub fn put_next_prog_fd_from_id(map_id: u32, next_prog_id: u32) -> Result<()> {
    let fd = prog_fd_by_id(next_prog_id)?;
    debug!(map_id, next_prog_id, "linking next program");
    write_prog_fd(map_id, &fd)
}

/// Delete the next-program entry of a chain map. Succeeds if the entry was
/// already absent.
pub fn remove_next_prog_fd(map_id: u32) -> Result<()> {
    let data = MapData::from_id(map_id).map_err(|e| Error::MapLookupFailed {
        map: format!("map id {map_id}"),
        reason: e.to_string(),
    })?;
    let mut array = ProgramArray::try_from(Map::ProgramArray(data)).map_err(|e| {
        Error::MapUpdateFailed {
            map: format!("map id {map_id}"),
            reason: format!("not a program array: {e}"),
        }
    })?;
    match array.clear_index(&CHAIN_KEY) {
        Ok(()) => Ok(()),
        // an empty slot is the desired end state
        Err(aya::maps::MapError::SyscallError(ref s))
            if s.io_error.raw_os_error() == Some(libc::ENOENT) =>
        {
            Ok(())
        }
        Err(e) => Err(Error::MapUpdateFailed {
            map: format!("map id {map_id}"),
            reason: e.to_string(),
        }),
    }
}

/// Whether the kernel still resolves this program id to a live program.
pub fn is_prog_loaded(prog_id: u32) -> bool {
    if prog_id == 0 {
        return false;
    }
    loaded_programs()
        .filter_map(|p| p.ok())
        .any(|p| p.id() == prog_id)
}

/// Whether the kernel still resolves this map id to a live map.
pub fn is_map_live(map_id: u32) -> bool {
    aya::maps::loaded_maps()
        .filter_map(|m| m.ok())
        .any(|m| m.id() == map_id)
}

// ---------------------------------------------------------------------------
// Raw bpf(2) read of a pinned program array
// ---------------------------------------------------------------------------

const BPF_MAP_LOOKUP_ELEM: libc::c_long = 1;
const BPF_OBJ_GET: libc::c_long = 7;

#[repr(C)]
struct BpfObjGetAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

#[repr(C)]
struct BpfMapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

unsafe fn sys_bpf<T>(cmd: libc::c_long, attr: &mut T) -> libc::c_long {
    libc::syscall(
        libc::SYS_bpf,
        cmd,
        attr as *mut T as *mut libc::c_void,
        std::mem::size_of::<T>() as libc::c_uint,
    )
}

/// Read the program id stored at key 0 of a pinned program array. Returns
/// `None` when the slot is empty.
pub fn read_next_prog_id(pinned_map: &Path) -> Result<Option<u32>> {
    let lookup_err = |reason: String| Error::MapLookupFailed {
        map: pinned_map.display().to_string(),
        reason,
    };

    let path = CString::new(pinned_map.as_os_str().as_encoded_bytes())
        .map_err(|_| lookup_err("path contains NUL".to_string()))?;

    let mut get_attr = BpfObjGetAttr {
        pathname: path.as_ptr() as u64,
        bpf_fd: 0,
        file_flags: 0,
    };
    // SAFETY: attr points to a properly sized, initialised struct and the
    // CString outlives the call.
    let fd = unsafe { sys_bpf(BPF_OBJ_GET, &mut get_attr) };
    if fd < 0 {
        return Err(lookup_err(format!(
            "BPF_OBJ_GET: {}",
            std::io::Error::last_os_error()
        )));
    }
    let fd = OwnedRawFd(fd as libc::c_int);

    let key: u32 = CHAIN_KEY;
    let mut value: u32 = 0;
    let mut elem_attr = BpfMapElemAttr {
        map_fd: fd.as_raw_fd() as u32,
        _pad: 0,
        key: &key as *const u32 as u64,
        value: &mut value as *mut u32 as u64,
        flags: 0,
    };
    // SAFETY: key and value buffers match the 4-byte key/value widths of a
    // program array and stay alive across the call.
    let rc = unsafe { sys_bpf(BPF_MAP_LOOKUP_ELEM, &mut elem_attr) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(None);
        }
        return Err(lookup_err(format!("BPF_MAP_LOOKUP_ELEM: {err}")));
    }

    Ok(Some(value))
}

struct OwnedRawFd(libc::c_int);

impl AsRawFd for OwnedRawFd {
    fn as_raw_fd(&self) -> libc::c_int {
        self.0
    }
}

impl Drop for OwnedRawFd {
    fn drop(&mut self) {
        // SAFETY: fd was returned by a successful BPF_OBJ_GET.
        unsafe { libc::close(self.0) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_key_is_zero() {
        assert_eq!(CHAIN_KEY, 0);
    }

    #[test]
    fn test_prog_id_zero_is_never_loaded() {
        assert!(!is_prog_loaded(0));
    }

    #[test]
    fn test_read_next_prog_id_missing_pin() {
        let err = read_next_prog_id(Path::new("/nonexistent/pin")).unwrap_err();
        assert!(matches!(err, Error::MapLookupFailed { .. }));
    }
}
