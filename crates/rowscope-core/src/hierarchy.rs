//! In-memory organization hierarchy index.
//!
//! The index is built once from a full organization snapshot and never
//! mutated afterwards, so concurrent resolutions can share it behind an
//! `Arc` without locking.
//!
//! ## Layout
//!
//! Organizations live in an arena (`Vec<Organization>`) and child links are
//! stored as arena positions. Traversal is an explicit depth-first walk with
//! a visited set and a depth counter, so a corrupt snapshot (a parent cycle or
//! a runaway chain) surfaces as a [`CoreError`] instead of an endless loop or
//! a stack overflow.
//!
//! ## Fail-closed lookups
//!
//! Unknown and inactive organizations resolve to an empty descendant set.
//! Inactive descendants are pruned together with their subtrees.

use std::collections::{BTreeSet, HashMap};

use crate::error::{CoreError, Result};
use crate::id::{FacilityId, OrganizationId};
use crate::organization::Organization;

/// Maximum number of levels below a traversal root.
pub const MAX_HIERARCHY_DEPTH: usize = 10;

/// Immutable, arena-backed view of an organization snapshot.
#[derive(Debug, Clone, Default)]
pub struct HierarchyIndex {
    nodes: Vec<Organization>,
    positions: HashMap<OrganizationId, usize>,
    children: Vec<Vec<usize>>,
}

impl HierarchyIndex {
    /// Build an index from an organization snapshot.
    ///
    /// Child links pointing at unknown parents are dropped (the orphan is
    /// still addressable as its own root).
    ///
    /// # Errors
    ///
    /// Returns `CoreError::DuplicateOrganization` if two records share an id.
    pub fn build(organizations: impl IntoIterator<Item = Organization>) -> Result<Self> {
        let nodes: Vec<Organization> = organizations.into_iter().collect();

        let mut positions = HashMap::with_capacity(nodes.len());
        for (idx, org) in nodes.iter().enumerate() {
            if positions.insert(org.id, idx).is_some() {
                tracing::error!(organization_id = %org.id, "Duplicate organization in snapshot");
                return Err(CoreError::DuplicateOrganization(org.id));
            }
        }

        let mut children = vec![Vec::new(); nodes.len()];
        for (idx, org) in nodes.iter().enumerate() {
            if let Some(parent) = org.parent_id {
                match positions.get(&parent) {
                    Some(&parent_idx) => children[parent_idx].push(idx),
                    None => tracing::debug!(
                        organization_id = %org.id,
                        parent_id = %parent,
                        "Organization references unknown parent"
                    ),
                }
            }
        }

        Ok(Self {
            nodes,
            positions,
            children,
        })
    }

    /// An index with no organizations. Every lookup resolves empty.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up an organization record.
    pub fn get(&self, id: OrganizationId) -> Option<&Organization> {
        self.positions.get(&id).map(|&idx| &self.nodes[idx])
    }

    /// All active organizations in the subtree rooted at `id`, including `id`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::HierarchyCycle` when the walk revisits a node and
    /// `CoreError::HierarchyTooDeep` when the subtree is deeper than
    /// [`MAX_HIERARCHY_DEPTH`]. Both are logged at error level here.
    pub fn descendants(&self, id: OrganizationId) -> Result<BTreeSet<OrganizationId>> {
        let mut result = BTreeSet::new();
        self.walk(id, |org| {
            result.insert(org.id);
        })?;
        Ok(result)
    }

    /// Union of the facilities owned by `id` and all of its active descendants.
    ///
    /// # Errors
    ///
    /// Same as [`HierarchyIndex::descendants`].
    pub fn facility_union(&self, id: OrganizationId) -> Result<BTreeSet<FacilityId>> {
        let mut result = BTreeSet::new();
        self.walk(id, |org| {
            result.extend(org.facilities.iter().copied());
        })?;
        Ok(result)
    }

    /// True if `descendant` is in the subtree of `ancestor` (an organization
    /// counts as its own ancestor).
    ///
    /// # Errors
    ///
    /// Same as [`HierarchyIndex::descendants`].
    pub fn is_ancestor(&self, ancestor: OrganizationId, descendant: OrganizationId) -> Result<bool> {
        Ok(self.descendants(ancestor)?.contains(&descendant))
    }

    /// Check every parent chain in the snapshot.
    ///
    /// Unlike traversal, which only trips on corruption reachable from the
    /// queried root, this reports every organization whose ancestry loops or
    /// exceeds the depth cap. Construction never fails on these, so callers
    /// loading a snapshot use this to surface problems for admin review.
    pub fn validate(&self) -> Vec<CoreError> {
        let mut issues = Vec::new();

        for (start, org) in self.nodes.iter().enumerate() {
            let mut seen = vec![false; self.nodes.len()];
            let mut current = start;
            let mut steps = 0usize;

            loop {
                if seen[current] {
                    issues.push(CoreError::hierarchy_cycle(org.id));
                    break;
                }
                seen[current] = true;

                let parent = self.nodes[current]
                    .parent_id
                    .and_then(|p| self.positions.get(&p).copied());
                match parent {
                    Some(parent_idx) => {
                        steps += 1;
                        if steps > MAX_HIERARCHY_DEPTH {
                            issues.push(CoreError::hierarchy_too_deep(org.id, MAX_HIERARCHY_DEPTH));
                            break;
                        }
                        current = parent_idx;
                    }
                    None => break,
                }
            }
        }

        issues
    }

    fn walk(&self, root_id: OrganizationId, mut visit: impl FnMut(&Organization)) -> Result<()> {
        let Some(&root) = self.positions.get(&root_id) else {
            tracing::debug!(organization_id = %root_id, "Unknown organization resolves empty");
            return Ok(());
        };
        if !self.nodes[root].active {
            tracing::debug!(organization_id = %root_id, "Inactive organization resolves empty");
            return Ok(());
        }

        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![(root, 0usize)];

        while let Some((idx, depth)) = stack.pop() {
            let node = &self.nodes[idx];
            if visited[idx] {
                tracing::error!(
                    organization_id = %node.id,
                    root = %root_id,
                    "Organization hierarchy contains a cycle"
                );
                return Err(CoreError::hierarchy_cycle(node.id));
            }
            if depth > MAX_HIERARCHY_DEPTH {
                tracing::error!(
                    organization_id = %node.id,
                    root = %root_id,
                    max_depth = MAX_HIERARCHY_DEPTH,
                    "Organization hierarchy exceeds maximum depth"
                );
                return Err(CoreError::hierarchy_too_deep(root_id, MAX_HIERARCHY_DEPTH));
            }

            visited[idx] = true;
            visit(node);

            for &child in self.children[idx].iter().rev() {
                if self.nodes[child].active {
                    stack.push((child, depth + 1));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org(id: i64, parent: Option<i64>, facilities: &[i64]) -> Organization {
        let mut org = Organization::new(OrganizationId::new(id))
            .with_facilities(facilities.iter().copied().map(FacilityId::new));
        if let Some(parent) = parent {
            org = org.with_parent(OrganizationId::new(parent));
        }
        org
    }

    fn org_ids(ids: &[i64]) -> BTreeSet<OrganizationId> {
        ids.iter().copied().map(OrganizationId::new).collect()
    }

    fn facility_ids(ids: &[i64]) -> BTreeSet<FacilityId> {
        ids.iter().copied().map(FacilityId::new).collect()
    }

    fn id(value: i64) -> OrganizationId {
        OrganizationId::new(value)
    }

    fn sample() -> HierarchyIndex {
        // 1 ─┬─ 2 ── 4
        //    └─ 3 (inactive) ── 5
        HierarchyIndex::build([
            org(1, None, &[10, 11]),
            org(2, Some(1), &[20]),
            org(3, Some(1), &[30]).inactive(),
            org(4, Some(2), &[40]),
            org(5, Some(3), &[50]),
        ])
        .unwrap()
    }

    #[test]
    fn test_descendants_include_self() {
        let index = sample();
        assert_eq!(index.descendants(id(2)).unwrap(), org_ids(&[2, 4]));
        assert_eq!(index.descendants(id(4)).unwrap(), org_ids(&[4]));
    }

    #[test]
    fn test_inactive_subtree_is_pruned() {
        let index = sample();
        assert_eq!(index.descendants(id(1)).unwrap(), org_ids(&[1, 2, 4]));
        assert!(index.descendants(id(3)).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_organization_is_empty() {
        let index = sample();
        assert!(index.descendants(id(99)).unwrap().is_empty());
        assert!(index.facility_union(id(99)).unwrap().is_empty());
    }

    #[test]
    fn test_facility_union() {
        let index = sample();
        assert_eq!(
            index.facility_union(id(1)).unwrap(),
            facility_ids(&[10, 11, 20, 40])
        );
        assert_eq!(index.facility_union(id(2)).unwrap(), facility_ids(&[20, 40]));
    }

    #[test]
    fn test_is_ancestor() {
        let index = sample();
        assert!(index.is_ancestor(id(1), id(4)).unwrap());
        assert!(index.is_ancestor(id(2), id(2)).unwrap());
        assert!(!index.is_ancestor(id(4), id(1)).unwrap());
        assert!(!index.is_ancestor(id(1), id(5)).unwrap());
    }

    #[test]
    fn test_cycle_is_detected() {
        let index = HierarchyIndex::build([org(1, Some(2), &[]), org(2, Some(1), &[])]).unwrap();

        let err = index.descendants(id(1)).unwrap_err();
        assert!(matches!(err, CoreError::HierarchyCycle { .. }));
    }

    #[test]
    fn test_self_parent_is_a_cycle() {
        let index = HierarchyIndex::build([org(1, Some(1), &[])]).unwrap();
        assert!(index.facility_union(id(1)).is_err());
    }

    #[test]
    fn test_depth_cap() {
        // Chain 0 <- 1 <- ... <- 11 is 11 levels below the root.
        let chain: Vec<Organization> = (0i64..=11)
            .map(|i| org(i, if i == 0 { None } else { Some(i - 1) }, &[]))
            .collect();
        let index = HierarchyIndex::build(chain).unwrap();

        let err = index.descendants(id(0)).unwrap_err();
        assert!(matches!(err, CoreError::HierarchyTooDeep { max_depth: 10, .. }));

        // Starting one level lower stays within the cap.
        assert_eq!(index.descendants(id(1)).unwrap().len(), 11);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = HierarchyIndex::build([org(1, None, &[]), org(1, None, &[])]).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateOrganization(_)));
    }

    #[test]
    fn test_validate_reports_cycles_and_depth() {
        assert!(sample().validate().is_empty());

        let index = HierarchyIndex::build([
            org(1, Some(2), &[]),
            org(2, Some(1), &[]),
            org(3, None, &[]),
        ])
        .unwrap();
        let issues = index.validate();
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(CoreError::is_hierarchy_corruption));
    }

    #[test]
    fn test_orphan_is_own_root() {
        let index = HierarchyIndex::build([org(7, Some(100), &[1])]).unwrap();
        assert_eq!(index.facility_union(id(7)).unwrap(), facility_ids(&[1]));
    }
}
