use crate::cmd::wrap_ssh_cmd;
use crate::vol::{parse_ro_property, parse_subvolume_list, ro_property_argv, Vol};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::{Capabilities, LocalRoot};

/// A btrfs root reached over SSH: the underlying commands are built exactly
/// like a [`LocalRoot`]'s, then each is individually `wrap_ssh`-ed, per the
/// "compose ssh per-stage, not around a whole pipeline" rule in `cmd`.
#[derive(Debug, Clone)]
pub struct SshRoot {
    pub user: String,
    pub host: String,
    pub port: Option<u16>,
    pub inner: LocalRoot,
}

impl SshRoot {
    pub fn new(user: String, host: String, port: Option<u16>, mountpoint: PathBuf, subpath: PathBuf, use_sudo: bool, sudo_flag: String) -> Self {
        // The remote mountpoint's validity can't be checked locally; trust
        // the configured path and let the first remote `btrfs` invocation
        // fail loudly if it's wrong.
        Self {
            user,
            host,
            port,
            inner: LocalRoot { mountpoint, subpath, use_sudo, sudo_flag },
        }
    }

    pub fn name(&self) -> String {
        format!("ssh:{}@{}:{}", self.user, self.host, self.inner.mountpoint.join(&self.inner.subpath).display())
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
        let target = self.inner.mountpoint.join(&self.inner.subpath);
        let mut argv: Vec<String> = vec!["btrfs".into(), "subvolume".into(), "list".into(), "-a".into(), "-u".into(), "-q".into(), "-R".into(), "-t".into()];
        argv.push(target.to_string_lossy().into_owned());
        let cmd = crate::cmd::Cmd::new(argv);
        let cmd = if self.inner.use_sudo { cmd.wrap_sudo(&self.inner.sudo_flag) } else { cmd };
        let wrapped = wrap_ssh_cmd(cmd, &self.user, &self.host, self.port);

        let mut command = std::process::Command::new(&wrapped.argv[0]);
        command.args(&wrapped.argv[1..]);
        let output = command.output().context("failed to run ssh subvolume listing")?;
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        let mut vols = parse_subvolume_list(&text, &|_| false)?;
        for vol in &mut vols {
            vol.ro = self.query_ro(&vol.path)?;
        }
        Ok(vols)
    }

    /// Mirrors [`LocalRoot::list`]'s ro lookup, run over ssh per subvolume.
    fn query_ro(&self, path: &Path) -> Result<bool> {
        let full_path = self.inner.mountpoint.join(path);
        let mut argv: Vec<String> = vec!["btrfs".into()];
        argv.extend(ro_property_argv(&full_path));
        let cmd = crate::cmd::Cmd::new(argv);
        let cmd = if self.inner.use_sudo { cmd.wrap_sudo(&self.inner.sudo_flag) } else { cmd };
        let wrapped = wrap_ssh_cmd(cmd, &self.user, &self.host, self.port);

        let mut command = std::process::Command::new(&wrapped.argv[0]);
        command.args(&wrapped.argv[1..]);
        let output = command.output().context("failed to run ssh ro property query")?;
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        parse_ro_property(&text)
    }

    pub fn send_cmd(&self, vol: &Vol, parent: Option<&Vol>, clones: &[Vol]) -> Result<crate::cmd::Cmd> {
        let local_cmd = self.inner.send_cmd(vol, parent, clones)?;
        Ok(wrap_ssh_cmd(local_cmd, &self.user, &self.host, self.port))
    }

    pub fn receive_cmd(&self, dst_path: &Path) -> Result<crate::cmd::Cmd> {
        let local_cmd = self.inner.receive_cmd(dst_path)?;
        Ok(wrap_ssh_cmd(local_cmd, &self.user, &self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_cmd_is_a_single_ssh_invocation() {
        let inner = LocalRoot { mountpoint: PathBuf::from("/mnt/pool"), subpath: PathBuf::from(""), use_sudo: false, sudo_flag: "-n".into() };
        let root = SshRoot { user: "root".into(), host: "backup-host".into(), port: Some(2222), inner };
        let vol = Vol {
            id: 1,
            generation: 1,
            uuid: uuid::Uuid::new_v4(),
            parent_uuid: None,
            received_uuid: None,
            path: PathBuf::from("A"),
            ro: true,
        };
        let cmd = root.send_cmd(&vol, None, &[]).unwrap();
        assert_eq!(cmd.argv[0], "ssh");
        let joined: Vec<String> = cmd.argv.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(joined.contains(&"root@backup-host".to_string()));
    }
}
