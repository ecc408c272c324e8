//! Hook attachment for loaded programs.
//!
//! XDP programs attach directly to the interface; TC programs attach as a
//! classifier filter behind a clsact qdisc that is created on demand. The
//! owned link is held on the program instance and dropped on detach, which
//! removes the attachment.

use aya::programs::tc::SchedClassifierLink;
use aya::programs::xdp::XdpLink;
use aya::programs::{tc, SchedClassifier, TcAttachType, Xdp, XdpFlags};
use aya::Ebpf;
use tracing::debug;

use crate::errors::{Error, Result};
use crate::model::Hook;

/// Owned attachment handle; dropping it detaches the program.
pub enum AttachHandle {
    Xdp(XdpLink),
    Tc(SchedClassifierLink),
}

/// Attach the already-loaded entry program to the interface at the hook.
pub fn attach(ebpf: &mut Ebpf, entry: &str, name: &str, iface: &str, hook: Hook) -> Result<AttachHandle> {
    let attach_err = |source: anyhow::Error| Error::AttachFailed {
        name: name.to_string(),
        iface: iface.to_string(),
        direction: hook.as_str().to_string(),
        source,
    };

    let program = ebpf
        .program_mut(entry)
        .ok_or_else(|| attach_err(anyhow::anyhow!("entry function {entry} not loaded")))?;

    let handle = if hook.is_xdp() {
        let xdp: &mut Xdp = program
            .try_into()
            .map_err(|_| attach_err(anyhow::anyhow!("{entry} is not an XDP program")))?;
        let link_id = xdp
            .attach(iface, XdpFlags::default())
            .map_err(|e| attach_err(e.into()))?;
        let link = xdp.take_link(link_id).map_err(|e| attach_err(e.into()))?;
        AttachHandle::Xdp(link)
    } else {
        ensure_clsact(iface).map_err(attach_err)?;

        let direction = match hook {
            Hook::TcIngress => TcAttachType::Ingress,
            _ => TcAttachType::Egress,
        };
        let cls: &mut SchedClassifier = program
            .try_into()
            .map_err(|_| attach_err(anyhow::anyhow!("{entry} is not a TC classifier program")))?;
        let link_id = cls
            .attach(iface, direction)
            .map_err(|e| attach_err(e.into()))?;
        let link = cls.take_link(link_id).map_err(|e| attach_err(e.into()))?;
        AttachHandle::Tc(link)
    };

    debug!(name, iface, hook = %hook, "attached program");
    Ok(handle)
}

/// Detach by dropping the owned link.
pub fn detach(handle: AttachHandle, name: &str, iface: &str, hook: Hook) {
    debug!(name, iface, hook = %hook, "detaching program");
    drop(handle);
}

/// Create the clsact qdisc on the interface if it is not already present.
fn ensure_clsact(iface: &str) -> anyhow::Result<()> {
    match tc::qdisc_add_clsact(iface) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("adding clsact qdisc on {iface}: {e}")),
    }
}
