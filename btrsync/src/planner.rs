use crate::cowtree::COWTree;
use crate::vol::Vol;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A single subvolume's transfer decision: which destination path it lands
/// at and, if any, the parent/clone sources that make the transfer
/// incremental.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub src_vol: Vol,
    pub parent: Option<Vol>,
    pub clones: Vec<Vol>,
    pub dst_path: PathBuf,
}

impl Plan {
    pub fn class(&self) -> PlanClass {
        if self.parent.is_some() {
            PlanClass::Incremental
        } else {
            PlanClass::Full
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanClass {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyPresent,
    NoParent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skip {
    pub src_vol: Vol,
    pub reason: SkipReason,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PlanningResult {
    pub plans: Vec<Plan>,
    pub skipped: Vec<Skip>,
}

/// Plan transfers for every eligible (read-only) source subvolume against a
/// destination tree, joining destination paths with `dst_root` via `layout`.
///
/// Pure: performs no I/O and is deterministic given the same trees (input
/// ordering does not matter -- candidates are canonically sorted by
/// `(path, uuid)` before any tie-break).
pub fn plan_transfers(
    src_tree: &COWTree,
    dst_tree: &COWTree,
    dst_root: &Path,
    layout: impl Fn(&Path) -> PathBuf,
    incremental_only: bool,
) -> PlanningResult {
    let dst_received: std::collections::HashMap<Uuid, Vec<&Vol>> = dst_tree.received_index();
    let has_dst_counterpart = |uuid: Uuid| dst_received.contains_key(&uuid);

    let mut sources: Vec<&Vol> = src_tree.iter_eligible().collect();
    sources.sort_by(|a, b| a.path.cmp(&b.path).then(a.uuid.cmp(&b.uuid)));

    let mut result = PlanningResult::default();

    for &s in &sources {
        slog_scope::debug!("evaluating source subvolume"; "path" => s.display_name(), "uuid" => %s.uuid);

        if has_dst_counterpart(s.uuid) {
            slog_scope::warn!("skipping source subvolume"; "path" => s.display_name(), "reason" => "already_present");
            result.skipped.push(Skip { src_vol: s.clone(), reason: SkipReason::AlreadyPresent });
            continue;
        }

        let s_roots = src_tree.roots_of(s.uuid);
        let mut candidates: Vec<&Vol> = sources
            .iter()
            .copied()
            .filter(|c| c.uuid != s.uuid)
            .filter(|c| src_tree.roots_of(c.uuid) == s_roots)
            .filter(|c| has_dst_counterpart(c.uuid))
            .collect();
        candidates.sort_by(|a, b| a.path.cmp(&b.path).then(a.uuid.cmp(&b.uuid)));

        let mut ancestor_candidates: Vec<(&Vol, usize)> = candidates
            .iter()
            .filter_map(|&c| src_tree.distance_to_ancestor(s.uuid, c.uuid).map(|d| (c, d)))
            .filter(|(c, _)| c.generation <= s.generation)
            .collect();
        ancestor_candidates.sort_by(|(va, da), (vb, db)| {
            vb.generation
                .cmp(&va.generation)
                .then(da.cmp(db))
                .then(va.path.cmp(&vb.path))
                .then(va.uuid.cmp(&vb.uuid))
        });

        let parent: Option<&Vol> = ancestor_candidates.first().map(|(v, _)| *v).or_else(|| candidates.first().copied());

        let parent = match parent {
            Some(p) => {
                slog_scope::debug!("chose parent candidate"; "src" => s.display_name(), "parent" => p.display_name());
                Some(p.clone())
            }
            None if incremental_only => {
                slog_scope::warn!("skipping source subvolume"; "path" => s.display_name(), "reason" => "no_parent");
                result.skipped.push(Skip { src_vol: s.clone(), reason: SkipReason::NoParent });
                continue;
            }
            None => None,
        };

        let clones: Vec<Vol> = candidates
            .iter()
            .filter(|c| parent.as_ref().map(|p| p.uuid != c.uuid).unwrap_or(true))
            .map(|&c| c.clone())
            .collect();

        let dst_path = dst_root.join(layout(&s.path));

        slog_scope::info!("planned transfer"; "src" => s.display_name(), "dst" => %dst_path.display(), "incremental" => parent.is_some());

        result.plans.push(Plan { src_vol: s.clone(), parent, clones, dst_path });
    }

    result
}

/// Default destination layout: flatten the source path to its basename.
pub fn flatten_layout(src_path: &Path) -> PathBuf {
    src_path.file_name().map(PathBuf::from).unwrap_or_else(|| src_path.to_path_buf())
}

/// Alternate layout: preserve the source's relative path structure.
pub fn preserve_layout(src_path: &Path) -> PathBuf {
    src_path.to_path_buf()
}
