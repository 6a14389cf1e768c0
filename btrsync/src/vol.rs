use crate::error::BtrSyncError;
use crate::parsing::parse_uuid;
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use regex::Regex;
use std::path::PathBuf;
use uuid::Uuid;

/// A single btrfs subvolume as reported by `btrfs subvolume list`.
///
/// `uuid` is stable identity within a root; `parent_uuid`/`received_uuid`
/// carry the two relations [`crate::cowtree::COWTree`] turns into edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vol {
    pub id: u64,
    pub generation: u64,
    pub uuid: Uuid,
    pub parent_uuid: Option<Uuid>,
    pub received_uuid: Option<Uuid>,
    pub path: PathBuf,
    pub ro: bool,
}

impl Vol {
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

fn list_line_regex() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^ID\s+(?P<id>\d+)\s+gen\s+(?P<gen>\d+)\s+.*?\bparent_uuid\s+(?P<parent>\S+)\s+received_uuid\s+(?P<received>\S+)\s+uuid\s+(?P<uuid>\S+)\s+path\s+(?P<path>.*?)\s*$",
        )
        .expect("static regex is valid")
    })
}

fn header_regex() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?m)^ID\s+gen\s+parent\s+top level\s+").expect("static regex is valid"))
}

/// Parse the tabular output of `btrfs subvolume list -a -u -q -R -t <mount>`.
///
/// Tolerates added trailing columns; fails loudly with [`BtrSyncError::Protocol`]
/// if the required columns (`parent_uuid`, `received_uuid`, `uuid`, `path`) are
/// missing from every line, which usually means the column layout changed.
///
/// `ro_paths` carries the read-only subvolume paths so callers that already
/// have `subvolume show` output (or a prior listing) for them can populate
/// [`Vol::ro`]; subvolumes not present in the set are treated as read-write.
pub fn parse_subvolume_list(data: &str, ro_paths: &dyn Fn(&std::path::Path) -> bool) -> Result<Vec<Vol>> {
    let has_header = data.lines().any(|l| header_regex().is_match(l));
    let re = list_line_regex();
    let vols: Vec<Vol> = re
        .captures_iter(data)
        .map(|caps| {
            let id = caps["id"].parse::<u64>().context("id column did not parse as integer")?;
            let generation = caps["gen"].parse::<u64>().context("gen column did not parse as integer")?;
            let uuid = parse_uuid(&caps["uuid"])?;
            let parent_uuid = zero_or_dash_to_none(&caps["parent"])?;
            let received_uuid = zero_or_dash_to_none(&caps["received"])?;
            let path = PathBuf::from(caps["path"].to_string());
            let ro = ro_paths(&path);
            Ok(Vol {
                id,
                generation,
                uuid,
                parent_uuid,
                received_uuid,
                path,
                ro,
            })
        })
        .collect::<Result<_>>()?;

    if vols.is_empty() && !data.trim().is_empty() && !has_header {
        return Err(BtrSyncError::protocol(
            "btrfs subvolume list output did not contain the expected parent_uuid/received_uuid/uuid/path columns",
        )
        .into());
    }

    Ok(vols)
}

fn zero_or_dash_to_none(value: &str) -> Result<Option<Uuid>> {
    match value {
        "-" => Ok(None),
        s => Ok(Some(parse_uuid(s)?)),
    }
}

/// Args (excluding the `btrfs` program name) for querying a subvolume's live
/// read-only property. `btrfs subvolume list` never reports this flag, so a
/// [`crate::root::Root`] that needs real `ro` status runs this as a
/// follow-up per subvolume.
pub fn ro_property_argv(path: &std::path::Path) -> Vec<String> {
    vec!["property".into(), "get".into(), "-t".into(), "subvol".into(), path.to_string_lossy().into_owned(), "ro".into()]
}

/// Parse `btrfs property get -t subvol <path> ro` output: a single
/// `ro=true`/`ro=false` line.
pub fn parse_ro_property(output: &str) -> Result<bool> {
    use crate::parsing::parse_key_value_line;
    for line in output.lines() {
        if let Ok((key, value)) = parse_key_value_line(line, "=") {
            if key == "ro" {
                return Ok(value == "true");
            }
        }
    }
    Err(BtrSyncError::protocol("btrfs property get output did not contain a ro= line").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const BTRFS_DATA: &str = indoc!(
        r#"
        ID 260 gen 48 cgen 8 parent 5 top level 5 parent_uuid -                                    received_uuid -                                    uuid 8a7ae0b5-b28c-b240-8c07-0015431d58d8 path test4
        ID 261 gen 9 cgen 9 parent 260 top level 260 parent_uuid -                                    received_uuid -                                    uuid ed4c840e-934f-9c49-bcac-fa8a1be864ff path test4/test5
        ID 285 gen 48 cgen 48 parent 284 top level 284 parent_uuid 8a7ae0b5-b28c-b240-8c07-0015431d58d8 received_uuid -                                    uuid 269b40d7-e072-954e-9138-04cbef62a13f path .snapshots/b99a584c-72c0-4cbe-9c6d-0c32274563f7/2020-08-26T21-25-26Z"#
    );

    #[test]
    fn parses_fixed_columns_and_maps_dash_to_none() {
        let vols = parse_subvolume_list(BTRFS_DATA, &|_| true).unwrap();
        assert_eq!(vols.len(), 3);
        assert_eq!(vols[0].uuid, Uuid::parse_str("8a7ae0b5-b28c-b240-8c07-0015431d58d8").unwrap());
        assert_eq!(vols[0].parent_uuid, None);
        assert_eq!(vols[0].received_uuid, None);
        assert_eq!(
            vols[2].parent_uuid,
            Some(Uuid::parse_str("8a7ae0b5-b28c-b240-8c07-0015431d58d8").unwrap())
        );
        assert_eq!(vols[2].path, PathBuf::from(".snapshots/b99a584c-72c0-4cbe-9c6d-0c32274563f7/2020-08-26T21-25-26Z"));
    }

    #[test]
    fn tolerates_extra_trailing_columns() {
        let data = "ID 1 gen 1 parent 0 top level 5 parent_uuid - received_uuid - uuid 8a7ae0b5-b28c-b240-8c07-0015431d58d8 path foo extra_col_value";
        let vols = parse_subvolume_list(data, &|_| false).unwrap();
        assert_eq!(vols.len(), 1);
        assert_eq!(vols[0].path, PathBuf::from("foo extra_col_value"));
    }

    #[test]
    fn fails_loudly_on_missing_required_columns() {
        let data = "ID 260 gen 48 cgen 8 parent 5 top level 5 path test4";
        let err = parse_subvolume_list(data, &|_| false).unwrap_err();
        assert!(err.to_string().contains("protocol error"));
    }

    #[test]
    fn ro_predicate_controls_ro_flag() {
        let vols = parse_subvolume_list(BTRFS_DATA, &|p| p == std::path::Path::new("test4")).unwrap();
        assert!(vols[0].ro);
        assert!(!vols[1].ro);
    }

    #[test]
    fn parses_ro_property_output() {
        assert!(parse_ro_property("ro=true\n").unwrap());
        assert!(!parse_ro_property("ro=false\n").unwrap());
    }

    #[test]
    fn ro_property_fails_loudly_on_unexpected_output() {
        let err = parse_ro_property("unrelated line\n").unwrap_err();
        assert!(err.to_string().contains("protocol error"));
    }
}
