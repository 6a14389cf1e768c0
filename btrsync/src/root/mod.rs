mod dump;
mod local;
mod pipe;
mod ssh;

pub use dump::{DumpReader, DumpWriter};
pub use local::LocalRoot;
pub use pipe::PipeSink;
pub use ssh::SshRoot;

use crate::cmd::Cmd;
use crate::cowtree::COWTree;
use crate::error::BtrSyncError;
use crate::vol::Vol;
use anyhow::Result;
use std::path::PathBuf;

/// Capability flags a planner/executor can check before attempting an
/// operation a variant doesn't support, rather than discovering it only as a
/// runtime error from a spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub can_send: bool,
    pub can_receive: bool,
    pub needs_list_for_planning: bool,
    /// False for sources (like a dump directory) that cannot express
    /// parent/clone relationships -- such a root can only ever produce full
    /// sends.
    pub supports_incremental_send: bool,
}

/// A place that holds or receives subvolumes. One enum closes the set of
/// variants rather than a trait object hierarchy, matching the "tagged
/// variant, not deep inheritance" design note.
pub enum Root {
    Local(LocalRoot),
    Ssh(SshRoot),
    DumpReader(DumpReader),
    DumpWriter(DumpWriter),
    Pipe(PipeSink),
}

impl Root {
    pub fn name(&self) -> String {
        match self {
            Root::Local(r) => r.name(),
            Root::Ssh(r) => r.name(),
            Root::DumpReader(r) => r.name(),
            Root::DumpWriter(r) => r.name(),
            Root::Pipe(r) => r.name(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            Root::Local(r) => r.capabilities(),
            Root::Ssh(r) => r.capabilities(),
            Root::DumpReader(r) => r.capabilities(),
            Root::DumpWriter(r) => r.capabilities(),
            Root::Pipe(r) => r.capabilities(),
        }
    }

    pub fn list(&self) -> Result<Vec<Vol>> {
        match self {
            Root::Local(r) => r.list(),
            Root::Ssh(r) => r.list(),
            Root::DumpReader(r) => r.list(),
            Root::DumpWriter(_) | Root::Pipe(_) => Ok(Vec::new()),
        }
    }

    pub fn build_tree(&self) -> Result<COWTree> {
        COWTree::from_vols(self.list()?)
    }

    pub fn send_cmd(&self, vol: &Vol, parent: Option<&Vol>, clones: &[Vol]) -> Result<Cmd> {
        if (parent.is_some() || !clones.is_empty()) && !self.capabilities().supports_incremental_send {
            return Err(BtrSyncError::configuration(format!(
                "{} cannot express parent/clone relationships for an incremental send",
                self.name()
            ))
            .into());
        }
        match self {
            Root::Local(r) => r.send_cmd(vol, parent, clones),
            Root::Ssh(r) => r.send_cmd(vol, parent, clones),
            Root::DumpReader(r) => r.send_cmd(vol, parent, clones),
            _ => Err(BtrSyncError::configuration(format!("{} cannot act as a send source", self.name())).into()),
        }
    }

    /// `Root::Pipe` is a valid receive destination (see `capabilities()`) but
    /// has no receive subprocess to build a [`Cmd`] for -- [`crate::executor::BtrSync::run`]
    /// special-cases it and drives it through `Flow::Sink::SelfStdout`
    /// instead of calling this method, so this arm is unreachable in
    /// practice rather than a dead-end.
    pub fn receive_cmd(&self, dst_path: &PathBuf) -> Result<Cmd> {
        match self {
            Root::Local(r) => r.receive_cmd(dst_path),
            Root::Ssh(r) => r.receive_cmd(dst_path),
            Root::DumpWriter(r) => r.receive_cmd(dst_path),
            Root::Pipe(_) => Err(BtrSyncError::configuration("pipe sink has no receive command; it is wired directly").into()),
            _ => Err(BtrSyncError::configuration(format!("{} cannot act as a receive destination", self.name())).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_writer_rejects_acting_as_send_source() {
        let root = Root::DumpWriter(DumpWriter::new(PathBuf::from("/tmp/dumps")));
        let vol = Vol {
            id: 1,
            generation: 1,
            uuid: uuid::Uuid::from_bytes([1; 16]),
            parent_uuid: None,
            received_uuid: None,
            path: PathBuf::from("A"),
            ro: true,
        };
        let err = root.send_cmd(&vol, None, &[]).unwrap_err();
        assert!(err.to_string().contains("configuration error"));
    }
}
