//! Namespace selection and child-side namespace initialization.

use crate::mounts::MountTree;
use crate::{Result, WardenError};
use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

const DEFAULT_HOSTNAME: &str = "warden";

/// Which namespaces a sandboxee gets, plus the filesystem view and hostname
/// inside them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceSpec {
    pub user: bool,
    pub pid: bool,
    pub mount: bool,
    pub net: bool,
    pub ipc: bool,
    pub uts: bool,
    /// Hostname inside the UTS namespace.
    pub hostname: Option<String>,
    /// Leaves the sandboxee in the supervisor's network namespace.
    pub allow_unrestricted_networking: bool,
    pub mounts: MountTree,
}

impl Default for NamespaceSpec {
    fn default() -> Self {
        Self {
            user: true,
            pid: true,
            mount: true,
            net: true,
            ipc: true,
            uts: true,
            hostname: None,
            allow_unrestricted_networking: false,
            mounts: MountTree::new(),
        }
    }
}

impl NamespaceSpec {
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.net && !self.allow_unrestricted_networking {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        flags
    }

    /// Sets up the freshly created namespaces from inside the child: id
    /// maps, the mount tree, and the hostname. `outer_uid`/`outer_gid` are
    /// the credentials the parent had before `CLONE_NEWUSER`.
    pub fn initialize_in_child(&self, outer_uid: u32, outer_gid: u32) -> Result<()> {
        if self.user {
            write_id_maps(outer_uid, outer_gid)?;
        }
        if self.mount {
            self.mounts.apply_and_pivot()?;
        }
        if self.uts {
            let hostname = self.hostname.as_deref().unwrap_or(DEFAULT_HOSTNAME);
            nix::unistd::sethostname(hostname)
                .map_err(|e| WardenError::Namespace(format!("sethostname: {e}")))?;
        }
        Ok(())
    }
}

/// Maps the outer uid/gid onto themselves inside a new user namespace.
fn write_id_maps(outer_uid: u32, outer_gid: u32) -> Result<()> {
    std::fs::write("/proc/self/setgroups", "deny")
        .map_err(|e| WardenError::Namespace(format!("denying setgroups: {e}")))?;
    std::fs::write("/proc/self/uid_map", format!("{outer_uid} {outer_uid} 1"))
        .map_err(|e| WardenError::Namespace(format!("writing uid_map: {e}")))?;
    std::fs::write("/proc/self/gid_map", format!("{outer_gid} {outer_gid} 1"))
        .map_err(|e| WardenError::Namespace(format!("writing gid_map: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_spec_creates_all_namespaces() {
        let spec = NamespaceSpec::default();
        let flags = spec.clone_flags();
        for flag in [
            CloneFlags::CLONE_NEWUSER,
            CloneFlags::CLONE_NEWPID,
            CloneFlags::CLONE_NEWNS,
            CloneFlags::CLONE_NEWNET,
            CloneFlags::CLONE_NEWIPC,
            CloneFlags::CLONE_NEWUTS,
        ] {
            assert!(flags.contains(flag));
        }
    }

    #[test]
    fn unrestricted_networking_drops_the_net_namespace() {
        let spec = NamespaceSpec {
            allow_unrestricted_networking: true,
            ..Default::default()
        };
        assert!(!spec.clone_flags().contains(CloneFlags::CLONE_NEWNET));
    }
}
