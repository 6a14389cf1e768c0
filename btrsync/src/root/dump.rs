use crate::cmd::{Cmd, FileMode, StreamSpec};
use crate::error::BtrSyncError;
use crate::vol::Vol;
use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::Capabilities;

/// A directory of raw `btrfs send` stream dumps, one file per subvolume,
/// filename encoding the subvolume name. Cannot express parent/clone
/// relationships, so it only ever supports full sends.
#[derive(Debug, Clone)]
pub struct DumpReader {
    pub dir: PathBuf,
}

impl DumpReader {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn name(&self) -> String {
        format!("dump-reader:{}", self.dir.display())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            can_send: true,
            can_receive: false,
            needs_list_for_planning: false,
            supports_incremental_send: false,
        }
    }

    /// Each file becomes a synthetic read-only subvolume with no parent and
    /// no received_uuid; a fresh random uuid stands in for identity since
    /// dump files carry none.
    pub fn list(&self) -> Result<Vec<Vol>> {
        let mut vols = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("stream") {
                continue;
            }
            let name = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
            vols.push(Vol {
                id: vols.len() as u64,
                generation: 0,
                uuid: Uuid::new_v4(),
                parent_uuid: None,
                received_uuid: None,
                path: PathBuf::from(name),
                ro: true,
            });
        }
        Ok(vols)
    }

    pub fn send_cmd(&self, vol: &Vol, parent: Option<&Vol>, clones: &[Vol]) -> Result<Cmd> {
        if parent.is_some() || !clones.is_empty() {
            return Err(BtrSyncError::configuration("a dump reader cannot express parent/clone relationships").into());
        }
        let file = self.dir.join(format!("{}.stream", vol.display_name()));
        Ok(Cmd::new(vec!["cat".to_string(), file.to_string_lossy().into_owned()]).with_stdout(StreamSpec::Pipe))
    }
}

/// Writes received send streams verbatim to `<dir>/<name>.stream`. Refuses to
/// overwrite an existing file.
#[derive(Debug, Clone)]
pub struct DumpWriter {
    pub dir: PathBuf,
}

impl DumpWriter {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn name(&self) -> String {
        format!("dump-writer:{}", self.dir.display())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            can_send: false,
            can_receive: true,
            needs_list_for_planning: false,
            supports_incremental_send: false,
        }
    }

    pub fn receive_cmd(&self, dst_path: &Path) -> Result<Cmd> {
        if dst_path.exists() {
            return Err(BtrSyncError::Filesystem { kind: crate::error::FilesystemErrorKind::FileExists }.into());
        }
        Ok(Cmd::new(vec!["cat".to_string()])
            .with_stdin(StreamSpec::Pipe)
            .with_stdout(StreamSpec::File(dst_path.to_path_buf(), FileMode::WriteCreate)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_cmd_rejects_incremental_request() {
        let reader = DumpReader::new(PathBuf::from("/dumps"));
        let vol = Vol { id: 1, generation: 1, uuid: Uuid::new_v4(), parent_uuid: None, received_uuid: None, path: PathBuf::from("A"), ro: true };
        let parent = vol.clone();
        let err = reader.send_cmd(&vol, Some(&parent), &[]).unwrap_err();
        assert!(err.to_string().contains("configuration error"));
    }

    #[test]
    fn receive_cmd_refuses_existing_destination() {
        let dir = std::env::temp_dir().join(format!("btrsync-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let existing = dir.join("A.stream");
        fs::write(&existing, b"x").unwrap();

        let writer = DumpWriter::new(dir.clone());
        let err = writer.receive_cmd(&existing).unwrap_err();
        assert!(err.to_string().contains("filesystem error"));

        fs::remove_dir_all(&dir).ok();
    }
}
