use anyhow::{anyhow, Result};
use mnt::MountEntry;
use std::convert::TryFrom;
use std::path::Path;
use std::str::FromStr;

pub use double::*;

const MOUNT_EXPECTATION: &str = "All entries in mount list must be parsable.";

/// Mount-table lookups, faked in tests exactly as `sys::process::double` fakes
/// process execution -- the process boundary and the mount-table boundary are
/// the two places this crate talks to the outside world without a `Cmd`.
#[cfg_attr(test, mockall::automock)]
pub mod double {
    use super::*;
    use mnt::MountIter;

    /// Lookup an exact mount entry at target.
    pub fn lookup_mountentry(target: &Path) -> Option<MountEntry> {
        let mut iter = MountIter::new_from_proc().expect(MOUNT_EXPECTATION);
        iter.find_map(|m| match m.expect(MOUNT_EXPECTATION) {
            m if m.file == target => Some(m),
            _ => None,
        })
    }
}

#[derive(Debug)]
pub struct BtrfsMountEntry(MountEntry);

impl BtrfsMountEntry {
    pub fn mount_entry(&self) -> &MountEntry {
        &self.0
    }

    pub fn subvolume_id(&self) -> Option<u32> {
        self.keyed_option("subvolid")
    }

    pub fn subvolume_path(&self) -> Option<String> {
        self.keyed_option("subvol")
    }

    pub fn is_toplevel_subvolume(&self) -> bool {
        let subvol_id = self.subvolume_id();
        let subvol_path = self.subvolume_path();

        (subvol_id.is_none() && subvol_path.is_none())
            || subvol_id.unwrap_or_default() == 5
            || subvol_path.unwrap_or_default() == "/"
    }

    fn keyed_option<T>(&self, key: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: std::fmt::Debug,
    {
        let prefix = format!("{}=", key);
        self.0.mntops.iter().find_map(|x| match x {
            mnt::MntOps::Extra(extra) if extra.starts_with(prefix.as_str()) => {
                extra.splitn(2, '=').nth(1).and_then(|s| s.parse::<T>().ok())
            }
            _ => None,
        })
    }
}

impl TryFrom<MountEntry> for BtrfsMountEntry {
    type Error = anyhow::Error;

    fn try_from(other: MountEntry) -> Result<Self, Self::Error> {
        match other.vfstype.as_str() {
            "btrfs" => Ok(BtrfsMountEntry(other)),
            x => Err(anyhow!("{} is not a btrfs mount (it's {}).", other.file.to_string_lossy(), x)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_if_not_btrfs() {
        let non_btrfs_mount: MountEntry = "/dev/vda / ext4 rw 0 0".parse().unwrap();
        assert!(BtrfsMountEntry::try_from(non_btrfs_mount).unwrap_err().to_string().contains("not a btrfs mount"))
    }

    #[test]
    fn no_subvol_options_is_toplevel() {
        assert!(btrfs_without_subvol_opts().is_toplevel_subvolume())
    }

    #[test]
    fn top_subvol_options_is_toplevel() {
        assert!(btrfs_with_top_subvol_opts().is_toplevel_subvolume())
    }

    #[test]
    fn child_subvol_options_is_not_toplevel() {
        assert!(!btrfs_with_child_subvol_opts().is_toplevel_subvolume())
    }

    fn btrfs_with_top_subvol_opts() -> BtrfsMountEntry {
        let mount: MountEntry = "/dev/vda / btrfs rw,noatime,subvolid=5,subvol=/ 0 0".parse().unwrap();
        BtrfsMountEntry::try_from(mount).unwrap()
    }

    fn btrfs_with_child_subvol_opts() -> BtrfsMountEntry {
        let mount: MountEntry = "/dev/vda / btrfs rw,noatime,subvolid=257,subvol=/testsub 0 0".parse().unwrap();
        BtrfsMountEntry::try_from(mount).unwrap()
    }

    fn btrfs_without_subvol_opts() -> BtrfsMountEntry {
        let mount: MountEntry = "/dev/vda / btrfs rw,noatime 0 0".parse().unwrap();
        BtrfsMountEntry::try_from(mount).unwrap()
    }
}
