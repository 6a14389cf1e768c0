use crate::cmd::{Cmd, StreamSpec};
use crate::error::BtrSyncError;
#[mockall_double::double]
use crate::sys::fs::double as fs_double;
use crate::sys::fs::BtrfsMountEntry;
#[mockall_double::double]
use crate::sys::process::double as process_double;
use crate::vol::{parse_ro_property, parse_subvolume_list, ro_property_argv, Vol};
use anyhow::{Context, Result};
use std::convert::TryFrom;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::Capabilities;

/// A local btrfs mount this process can shell out to directly, optionally
/// through `sudo -n`. Grounded on `libblkcapt::sys::btrfs::{Filesystem, Subvolume}`:
/// the regex-based column scraper generalizes directly and the mount-point
/// validation is reused almost verbatim.
#[derive(Debug, Clone)]
pub struct LocalRoot {
    pub mountpoint: PathBuf,
    pub subpath: PathBuf,
    pub use_sudo: bool,
    pub sudo_flag: String,
}

impl LocalRoot {
    pub fn new(mountpoint: PathBuf, subpath: PathBuf, use_sudo: bool, sudo_flag: String) -> Result<Self> {
        let mountentry = fs_double::lookup_mountentry(&mountpoint).context("mountpoint does not exist")?;
        if !BtrfsMountEntry::try_from(mountentry)?.is_toplevel_subvolume() {
            return Err(BtrSyncError::Filesystem { kind: crate::error::FilesystemErrorKind::NotBtrfs }.into());
        }
        Ok(Self { mountpoint, subpath, use_sudo, sudo_flag })
    }

    pub fn name(&self) -> String {
        format!("local:{}", self.mountpoint.join(&self.subpath).display())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            can_send: true,
            can_receive: true,
            needs_list_for_planning: true,
            supports_incremental_send: true,
        }
    }

    pub fn list(&self) -> Result<Vec<Vol>> {
        let target = self.mountpoint.join(&self.subpath);
        let mut command = Command::new("btrfs");
        command.args(["subvolume", "list", "-a", "-u", "-q", "-R", "-t"]).arg(&target);
        if self.use_sudo {
            command = self.sudo_wrap(command);
        }
        let output = process_double::run_command_as_result(command).context("failed to list local btrfs subvolumes")?;
        let mut vols = parse_subvolume_list(&output, &|_| false)?;
        for vol in &mut vols {
            vol.ro = self.query_ro(&vol.path)?;
        }
        Ok(vols)
    }

    /// `btrfs subvolume list` never reports the read-only flag; ask for it
    /// directly per subvolume rather than trusting a caller-supplied default.
    fn query_ro(&self, path: &Path) -> Result<bool> {
        let full_path = self.mountpoint.join(path);
        let mut command = Command::new("btrfs");
        command.args(ro_property_argv(&full_path));
        if self.use_sudo {
            command = self.sudo_wrap(command);
        }
        let output = process_double::run_command_as_result(command).context("failed to query subvolume read-only property")?;
        parse_ro_property(&output)
    }

    pub fn send_cmd(&self, vol: &Vol, parent: Option<&Vol>, clones: &[Vol]) -> Result<Cmd> {
        let mut argv: Vec<String> = vec!["btrfs".into(), "send".into()];
        if let Some(p) = parent {
            argv.push("-p".into());
            argv.push(self.mountpoint.join(&p.path).to_string_lossy().into_owned());
        }
        for c in clones {
            argv.push("-c".into());
            argv.push(self.mountpoint.join(&c.path).to_string_lossy().into_owned());
        }
        argv.push(self.mountpoint.join(&vol.path).to_string_lossy().into_owned());

        let cmd = Cmd::new(argv).with_stdout(StreamSpec::Pipe);
        Ok(if self.use_sudo { cmd.wrap_sudo(&self.sudo_flag) } else { cmd })
    }

    pub fn receive_cmd(&self, dst_path: &Path) -> Result<Cmd> {
        let cmd = Cmd::new(vec![
            "btrfs".to_string(),
            "receive".to_string(),
            "-e".to_string(),
            dst_path.to_string_lossy().into_owned(),
        ])
        .with_stdin(StreamSpec::Pipe);
        Ok(if self.use_sudo { cmd.wrap_sudo(&self.sudo_flag) } else { cmd })
    }

    fn sudo_wrap(&self, command: Command) -> Command {
        let mut wrapped = Command::new("sudo");
        wrapped.arg(&self.sudo_flag).arg(command.get_program()).args(command.get_args());
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use mnt::MountEntry;
    use serial_test::serial;

    fn toplevel_mount() -> MountEntry {
        "/dev/vda / btrfs rw,noatime,subvolid=5,subvol=/ 0 0".parse().unwrap()
    }

    #[test]
    #[serial(fakecmd)]
    fn list_parses_real_output_shape() {
        let lookup_ctx = fs_double::lookup_mountentry_context();
        lookup_ctx.expect().returning(|_| Some(toplevel_mount()));

        let run_ctx = process_double::run_command_as_result_context();
        run_ctx.expect().returning(|cmd: Command| {
            let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
            if args.contains(&"list".to_string()) {
                Ok(indoc!(
                    r#"
                    ID 260 gen 48 cgen 8 parent 5 top level 5 parent_uuid -                                    received_uuid -                                    uuid 8a7ae0b5-b28c-b240-8c07-0015431d58d8 path test4"#
                )
                .to_string())
            } else {
                Ok("ro=true".to_string())
            }
        });

        let root = LocalRoot::new(PathBuf::from("/mnt/pool"), PathBuf::from(""), false, "-n".into()).unwrap();
        let vols = root.list().unwrap();
        assert_eq!(vols.len(), 1);
        assert_eq!(vols[0].path, PathBuf::from("test4"));
        assert!(vols[0].ro);
    }

    #[test]
    #[serial(fakecmd)]
    fn rejects_non_btrfs_mountpoint() {
        let lookup_ctx = fs_double::lookup_mountentry_context();
        lookup_ctx.expect().returning(|_| Some("/dev/vda / ext4 rw 0 0".parse().unwrap()));

        let err = LocalRoot::new(PathBuf::from("/mnt/pool"), PathBuf::from(""), false, "-n".into()).unwrap_err();
        assert!(err.to_string().contains("not a btrfs mount"));
    }

    #[test]
    #[serial(fakecmd)]
    fn send_cmd_includes_parent_and_clones() {
        let lookup_ctx = fs_double::lookup_mountentry_context();
        lookup_ctx.expect().returning(|_| Some(toplevel_mount()));
        let root = LocalRoot::new(PathBuf::from("/mnt/pool"), PathBuf::from(""), false, "-n".into()).unwrap();

        let vol = |name: &str| Vol {
            id: 1,
            generation: 1,
            uuid: uuid::Uuid::new_v4(),
            parent_uuid: None,
            received_uuid: None,
            path: PathBuf::from(name),
            ro: true,
        };
        let s = vol("S");
        let parent = vol("P");
        let clone = vol("C");
        let cmd = root.send_cmd(&s, Some(&parent), std::slice::from_ref(&clone)).unwrap();
        let argv: Vec<String> = cmd.argv.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(argv[0], "btrfs");
        assert!(argv.contains(&"-p".to_string()));
        assert!(argv.contains(&"-c".to_string()));
        assert!(argv.iter().any(|a| a.ends_with("/P")));
        assert!(argv.iter().any(|a| a.ends_with("/C")));
    }
}
