//! The sandboxee's filesystem view: a tree of bind mounts and tmpfs mounts
//! that is materialized under a fresh tmpfs and entered via `pivot_root`.

use crate::{Result, WardenError};
use nix::mount::{MntFlags, MsFlags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

const ROOT_DIR: &str = "/tmp/.warden_root";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
enum Mount {
    Bind {
        outside: PathBuf,
        writable: bool,
        is_file: bool,
    },
    Tmpfs {
        size: u64,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct Node {
    mount: Option<Mount>,
    children: BTreeMap<String, Node>,
}

/// Declarative description of everything visible inside the sandboxee's
/// mount namespace.
///
/// Inside paths must be absolute and normalized. Mount points nest freely
/// under directory binds, but nothing can be mounted below a file bind, and
/// `/proc/self` entries are rejected outright (map the whole `/proc`
/// instead, its `self` entry cannot be faked per-file).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountTree {
    root_writable: bool,
    root: Node,
}

/// Returns the normalized form of `path`, failing on relative paths and on
/// `..` components.
fn clean_path(path: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(WardenError::Mount(format!(
            "path is not absolute: '{}'",
            path.display()
        )));
    }
    let mut out = PathBuf::from("/");
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            _ => {
                return Err(WardenError::Mount(format!(
                    "path is not normalized: '{}'",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}

fn path_parts(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

impl MountTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn root_writable(&self) -> bool {
        self.root_writable
    }

    pub fn set_root_writable(&mut self, writable: bool) {
        self.root_writable = writable;
    }

    fn insert(&mut self, inside: &Path, mount: Mount) -> Result<()> {
        let inside = clean_path(inside)?;
        if inside == Path::new("/") {
            return Err(WardenError::Mount("cannot remap '/' itself".into()));
        }
        if inside.starts_with("/proc/self") {
            return Err(WardenError::Mount(format!(
                "cannot add /proc/self entries, mount all of /proc instead: '{}'",
                inside.display()
            )));
        }
        let mut node = &mut self.root;
        for part in path_parts(&inside) {
            if matches!(
                node.mount,
                Some(Mount::Bind { is_file: true, .. })
            ) {
                return Err(WardenError::Mount(format!(
                    "cannot mount below a file at '{}'",
                    inside.display()
                )));
            }
            node = node.children.entry(part).or_default();
        }
        if let Some(existing) = &node.mount {
            if *existing == mount {
                tracing::debug!(path = %inside.display(), "mount already present, skipping");
                return Ok(());
            }
            return Err(WardenError::Mount(format!(
                "'{}' is already mapped differently",
                inside.display()
            )));
        }
        if !node.children.is_empty() && matches!(mount, Mount::Bind { is_file: true, .. }) {
            return Err(WardenError::Mount(format!(
                "cannot mount a file over existing entries at '{}'",
                inside.display()
            )));
        }
        node.mount = Some(mount);
        Ok(())
    }

    /// Bind-mounts a single file.
    pub fn add_file_at(
        &mut self,
        outside: impl Into<PathBuf>,
        inside: impl AsRef<Path>,
        writable: bool,
    ) -> Result<()> {
        self.insert(
            inside.as_ref(),
            Mount::Bind {
                outside: outside.into(),
                writable,
                is_file: true,
            },
        )
    }

    /// Bind-mounts a directory subtree.
    pub fn add_directory_at(
        &mut self,
        outside: impl Into<PathBuf>,
        inside: impl AsRef<Path>,
        writable: bool,
    ) -> Result<()> {
        self.insert(
            inside.as_ref(),
            Mount::Bind {
                outside: outside.into(),
                writable,
                is_file: false,
            },
        )
    }

    /// Mounts a fresh tmpfs of the given byte size.
    pub fn add_tmpfs(&mut self, inside: impl AsRef<Path>, size: u64) -> Result<()> {
        self.insert(inside.as_ref(), Mount::Tmpfs { size })
    }

    /// Maps an inside path back to the outside path backing it, walking to
    /// the deepest bind mount that covers it.
    #[must_use]
    pub fn resolve_path(&self, inside: &Path) -> Option<PathBuf> {
        let inside = clean_path(inside).ok()?;
        let parts = path_parts(&inside);
        let mut node = &self.root;
        let mut best: Option<(usize, &PathBuf)> = None;
        for (depth, part) in parts.iter().enumerate() {
            node = node.children.get(part)?;
            if let Some(Mount::Bind { outside, .. }) = &node.mount {
                best = Some((depth + 1, outside));
            }
        }
        let (depth, outside) = best?;
        let mut resolved = outside.clone();
        for part in &parts[depth..] {
            resolved.push(part);
        }
        Some(resolved)
    }

    /// Lists `(outside, inside)` pairs of all bind mounts, for logging.
    #[must_use]
    pub fn list_binds(&self) -> Vec<(PathBuf, PathBuf)> {
        fn walk(node: &Node, prefix: &Path, out: &mut Vec<(PathBuf, PathBuf)>) {
            if let Some(Mount::Bind { outside, .. }) = &node.mount {
                out.push((outside.clone(), prefix.to_path_buf()));
            }
            for (name, child) in &node.children {
                walk(child, &prefix.join(name), out);
            }
        }
        let mut out = Vec::new();
        walk(&self.root, Path::new("/"), &mut out);
        out
    }

    /// Materializes the tree and pivots into it. Must run inside a fresh
    /// mount namespace; called from the fork-server child.
    pub fn apply_and_pivot(&self) -> Result<()> {
        use nix::mount::{mount, umount2};

        // Stop mount events from propagating back out.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| WardenError::Mount(format!("making / private: {e}")))?;

        mount(
            Some("warden"),
            "/tmp",
            Some("tmpfs"),
            MsFlags::empty(),
            Some("mode=0755"),
        )
        .map_err(|e| WardenError::Mount(format!("mounting scratch tmpfs: {e}")))?;
        std::fs::create_dir_all(ROOT_DIR)?;

        self.materialize(&self.root, Path::new(ROOT_DIR))?;

        nix::unistd::chdir(ROOT_DIR)?;
        nix::unistd::pivot_root(".", ".")?;
        umount2(".", MntFlags::MNT_DETACH)
            .map_err(|e| WardenError::Mount(format!("detaching old root: {e}")))?;
        nix::unistd::chdir("/")?;

        if !self.root_writable {
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| WardenError::Mount(format!("remounting / read-only: {e}")))?;
        }
        Ok(())
    }

    fn materialize(&self, node: &Node, dest: &Path) -> Result<()> {
        use nix::mount::mount;

        match &node.mount {
            Some(Mount::Bind {
                outside,
                writable,
                is_file,
            }) => {
                if *is_file {
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    if !dest.exists() {
                        std::fs::File::create(dest)?;
                    }
                } else {
                    std::fs::create_dir_all(dest)?;
                }
                tracing::debug!(outside = %outside.display(), inside = %dest.display(),
                    writable, "bind mount");
                mount(
                    Some(outside.as_path()),
                    dest,
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REC,
                    None::<&str>,
                )
                .map_err(|e| {
                    WardenError::Mount(format!("binding '{}': {e}", outside.display()))
                })?;
                if !writable {
                    mount(
                        None::<&str>,
                        dest,
                        None::<&str>,
                        MsFlags::MS_REMOUNT
                            | MsFlags::MS_BIND
                            | MsFlags::MS_REC
                            | MsFlags::MS_RDONLY,
                        None::<&str>,
                    )
                    .map_err(|e| {
                        WardenError::Mount(format!(
                            "remounting '{}' read-only: {e}",
                            dest.display()
                        ))
                    })?;
                }
            }
            Some(Mount::Tmpfs { size }) => {
                std::fs::create_dir_all(dest)?;
                tracing::debug!(inside = %dest.display(), size, "tmpfs mount");
                mount(
                    Some("warden"),
                    dest,
                    Some("tmpfs"),
                    MsFlags::empty(),
                    Some(format!("size={size}").as_str()),
                )
                .map_err(|e| {
                    WardenError::Mount(format!("tmpfs at '{}': {e}", dest.display()))
                })?;
            }
            None => {
                std::fs::create_dir_all(dest)?;
            }
        }
        for (name, child) in &node.children {
            self.materialize(child, &dest.join(name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_and_unnormalized_paths() {
        let mut tree = MountTree::new();
        assert!(tree.add_directory_at("/usr", "usr", false).is_err());
        assert!(tree.add_directory_at("/usr", "/a/../b", false).is_err());
        assert!(tree.add_directory_at("/usr", "/a/./b", false).is_ok());
    }

    #[test]
    fn rejects_proc_self_entries() {
        let mut tree = MountTree::new();
        assert!(tree.add_file_at("/x", "/proc/self/maps", false).is_err());
        assert!(tree.add_directory_at("/proc", "/proc", false).is_ok());
    }

    #[test]
    fn rejects_children_below_a_file() {
        let mut tree = MountTree::new();
        tree.add_file_at("/etc/passwd", "/etc/passwd", false).unwrap();
        assert!(
            tree.add_file_at("/x", "/etc/passwd/deeper", false)
                .is_err()
        );
    }

    #[test]
    fn duplicate_identical_mounts_are_idempotent() {
        let mut tree = MountTree::new();
        tree.add_directory_at("/lib", "/lib", false).unwrap();
        tree.add_directory_at("/lib", "/lib", false).unwrap();
        assert!(tree.add_directory_at("/lib64", "/lib", false).is_err());
    }

    #[test]
    fn resolves_through_the_deepest_bind() {
        let mut tree = MountTree::new();
        tree.add_directory_at("/usr", "/usr", false).unwrap();
        tree.add_directory_at("/opt/libs", "/usr/lib/special", false)
            .unwrap();
        assert_eq!(
            tree.resolve_path(Path::new("/usr/bin/env")).unwrap(),
            PathBuf::from("/usr/bin/env")
        );
        assert_eq!(
            tree.resolve_path(Path::new("/usr/lib/special/libc.so")).unwrap(),
            PathBuf::from("/opt/libs/libc.so")
        );
        assert!(tree.resolve_path(Path::new("/nonexistent")).is_none());
    }

    #[test]
    fn lists_binds_with_inside_paths() {
        let mut tree = MountTree::new();
        tree.add_directory_at("/lib", "/lib", false).unwrap();
        tree.add_file_at("/etc/hosts", "/etc/hosts", false).unwrap();
        let binds = tree.list_binds();
        assert_eq!(binds.len(), 2);
        assert!(binds.contains(&(PathBuf::from("/lib"), PathBuf::from("/lib"))));
    }

    #[test]
    fn serializes_for_the_fork_request() {
        let mut tree = MountTree::new();
        tree.add_tmpfs("/tmp", 1 << 20).unwrap();
        let bytes = rmp_serde::to_vec(&tree).unwrap();
        let back: MountTree = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, tree);
    }
}
