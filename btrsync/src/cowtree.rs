use crate::error::BtrSyncError;
use crate::vol::Vol;
use anyhow::Result;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// A forest of subvolumes linked by snapshot (`parent_uuid`) edges, plus an
/// index of received-from relationships used to find cross-root
/// incrementality substrate.
///
/// Nodes are addressed by `uuid` throughout; `build()` must run once after
/// every `insert()` before any query is made.
pub struct COWTree {
    by_uuid: HashMap<Uuid, Vol>,
    /// child uuid -> parent uuid, populated by `build()` only for parents
    /// that actually resolve within this tree.
    snapshot_parent: HashMap<Uuid, Uuid>,
    roots_cache: RefCell<HashMap<Uuid, HashSet<Uuid>>>,
    built: bool,
}

impl COWTree {
    pub fn new() -> Self {
        Self {
            by_uuid: HashMap::new(),
            snapshot_parent: HashMap::new(),
            roots_cache: RefCell::new(HashMap::new()),
            built: false,
        }
    }

    pub fn from_vols(vols: impl IntoIterator<Item = Vol>) -> Result<Self> {
        let mut tree = Self::new();
        for vol in vols {
            tree.insert(vol);
        }
        tree.build()?;
        Ok(tree)
    }

    pub fn insert(&mut self, vol: Vol) {
        self.built = false;
        self.by_uuid.insert(vol.uuid, vol);
    }

    /// Resolve snapshot edges. Unresolved `parent_uuid` (not present in this
    /// tree, e.g. the parent snapshot was deleted) makes the child a root,
    /// matching source behavior -- this is not an error.
    pub fn build(&mut self) -> Result<()> {
        self.snapshot_parent.clear();
        for vol in self.by_uuid.values() {
            if let Some(parent_uuid) = vol.parent_uuid {
                if self.by_uuid.contains_key(&parent_uuid) {
                    self.snapshot_parent.insert(vol.uuid, parent_uuid);
                }
            }
        }
        self.detect_cycles()?;
        self.roots_cache.borrow_mut().clear();
        self.built = true;
        Ok(())
    }

    fn detect_cycles(&self) -> Result<()> {
        for &start in self.snapshot_parent.keys() {
            let mut seen = HashSet::new();
            let mut current = start;
            loop {
                if !seen.insert(current) {
                    return Err(BtrSyncError::consistency(format!(
                        "cycle detected in snapshot parent chain starting at {}",
                        start
                    ))
                    .into());
                }
                match self.snapshot_parent.get(&current) {
                    Some(&parent) => current = parent,
                    None => break,
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, uuid: Uuid) -> Option<&Vol> {
        self.by_uuid.get(&uuid)
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.by_uuid.contains_key(&uuid)
    }

    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }

    /// All ultimate ancestors reachable from `vol` by following snapshot
    /// edges upward; a node with no in-tree parent is its own root. Always
    /// nonempty for a uuid present in the tree.
    pub fn roots_of(&self, uuid: Uuid) -> HashSet<Uuid> {
        debug_assert!(self.built, "COWTree::build must run before queries");
        if let Some(cached) = self.roots_cache.borrow().get(&uuid) {
            return cached.clone();
        }
        let mut current = uuid;
        let mut visited = HashSet::new();
        let root = loop {
            if !visited.insert(current) {
                // A cycle would have been rejected in build(); guard anyway.
                break current;
            }
            match self.snapshot_parent.get(&current) {
                Some(&parent) => current = parent,
                None => break current,
            }
        };
        let mut set = HashSet::new();
        set.insert(root);
        self.roots_cache.borrow_mut().insert(uuid, set.clone());
        set
    }

    /// Snapshot-edge distance from `uuid` up to `ancestor`, or `None` if
    /// `ancestor` is not actually an ancestor of `uuid`.
    pub fn distance_to_ancestor(&self, uuid: Uuid, ancestor: Uuid) -> Option<usize> {
        let mut current = uuid;
        let mut distance = 0;
        loop {
            if current == ancestor {
                return Some(distance);
            }
            match self.snapshot_parent.get(&current) {
                Some(&parent) => {
                    current = parent;
                    distance += 1;
                }
                None => return None,
            }
        }
    }

    /// Mapping from nonzero received-uuid to every local subvolume that
    /// declares it -- "which local destinations are copies of which source".
    pub fn received_index(&self) -> HashMap<Uuid, Vec<&Vol>> {
        let mut index: HashMap<Uuid, Vec<&Vol>> = HashMap::new();
        for vol in self.by_uuid.values() {
            if let Some(received_uuid) = vol.received_uuid {
                index.entry(received_uuid).or_default().push(vol);
            }
        }
        index
    }

    /// Read-only subvolumes, the only ones eligible to send.
    pub fn iter_eligible(&self) -> impl Iterator<Item = &Vol> {
        self.by_uuid.values().filter(|v| v.ro)
    }

    pub fn iter_all(&self) -> impl Iterator<Item = &Vol> {
        self.by_uuid.values()
    }
}

impl Default for COWTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn vol(uuid: u8, parent: Option<u8>, received: Option<u8>, gen: u64, ro: bool) -> Vol {
        Vol {
            id: uuid as u64,
            generation: gen,
            uuid: uuid_of(uuid),
            parent_uuid: parent.map(uuid_of),
            received_uuid: received.map(uuid_of),
            path: PathBuf::from(format!("vol{}", uuid)),
            ro,
        }
    }

    fn uuid_of(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn roots_nonempty_and_parent_edges_correct() {
        let a = vol(1, None, None, 1, true);
        let b = vol(2, Some(1), None, 2, true);
        let c = vol(3, Some(2), None, 3, true);
        let tree = COWTree::from_vols(vec![a, b, c]).unwrap();

        for uuid in [uuid_of(1), uuid_of(2), uuid_of(3)] {
            let roots = tree.roots_of(uuid);
            assert!(!roots.is_empty());
            assert_eq!(roots, [uuid_of(1)].into_iter().collect());
        }
    }

    #[test]
    fn deleted_parent_makes_node_a_root_not_an_error() {
        let orphan = vol(2, Some(99), None, 2, true); // parent uuid 99 doesn't exist
        let tree = COWTree::from_vols(vec![orphan]).unwrap();
        assert_eq!(tree.roots_of(uuid_of(2)), [uuid_of(2)].into_iter().collect());
    }

    #[test]
    fn cycle_is_rejected() {
        let mut tree = COWTree::new();
        tree.insert(vol(1, Some(2), None, 1, true));
        tree.insert(vol(2, Some(1), None, 1, true));
        let err = tree.build().unwrap_err();
        assert!(err.to_string().contains("consistency error"));
    }

    #[test]
    fn received_index_groups_by_received_uuid() {
        let a = vol(10, None, Some(1), 1, true);
        let b = vol(11, None, Some(1), 1, true);
        let tree = COWTree::from_vols(vec![a, b]).unwrap();
        let index = tree.received_index();
        assert_eq!(index.get(&uuid_of(1)).unwrap().len(), 2);
    }

    #[test]
    fn iter_eligible_only_yields_read_only() {
        let ro = vol(1, None, None, 1, true);
        let rw = vol(2, None, None, 1, false);
        let tree = COWTree::from_vols(vec![ro, rw]).unwrap();
        let eligible: Vec<_> = tree.iter_eligible().map(|v| v.uuid).collect();
        assert_eq!(eligible, vec![uuid_of(1)]);
    }

    #[test]
    fn distance_to_ancestor_counts_edges() {
        let a = vol(1, None, None, 1, true);
        let b = vol(2, Some(1), None, 2, true);
        let c = vol(3, Some(2), None, 3, true);
        let tree = COWTree::from_vols(vec![a, b, c]).unwrap();
        assert_eq!(tree.distance_to_ancestor(uuid_of(3), uuid_of(1)), Some(2));
        assert_eq!(tree.distance_to_ancestor(uuid_of(1), uuid_of(3)), None);
    }
}
