//! Hierarchy traversal properties over whole snapshots.

use std::collections::BTreeSet;

use rowscope_core::{CoreError, FacilityId, HierarchyIndex, Organization, OrganizationId};

fn org(id: i64, parent: Option<i64>, facilities: &[i64]) -> Organization {
    let mut org = Organization::new(OrganizationId::new(id))
        .with_facilities(facilities.iter().copied().map(FacilityId::new));
    if let Some(parent) = parent {
        org = org.with_parent(OrganizationId::new(parent));
    }
    org
}

fn facilities(ids: &[i64]) -> BTreeSet<FacilityId> {
    ids.iter().copied().map(FacilityId::new).collect()
}

/// A wide, moderately deep acyclic forest: every node `n > 0` hangs off
/// `(n - 1) / 3`, giving depth ~log3(n).
fn forest(size: i64) -> HierarchyIndex {
    HierarchyIndex::build((0..size).map(|n| {
        let parent = if n == 0 { None } else { Some((n - 1) / 3) };
        org(n, parent, &[n * 10])
    }))
    .unwrap()
}

#[test]
fn parent_with_child_scenario() {
    // Organization A (facilities {1,2}) has child B (facilities {3}).
    let index = HierarchyIndex::build([org(100, None, &[1, 2]), org(200, Some(100), &[3])]).unwrap();

    assert_eq!(
        index.facility_union(OrganizationId::new(100)).unwrap(),
        facilities(&[1, 2, 3])
    );
    assert_eq!(
        index.facility_union(OrganizationId::new(200)).unwrap(),
        facilities(&[3])
    );
}

#[test]
fn acyclic_descendants_terminate_and_include_self() {
    let index = forest(500);

    for n in 0..500 {
        let id = OrganizationId::new(n);
        let descendants = index.descendants(id).unwrap();
        assert!(descendants.contains(&id), "descendants of {n} must include itself");
        assert!(descendants.len() <= 500);
        for d in &descendants {
            assert!(index.is_ancestor(id, *d).unwrap());
        }
    }
}

#[test]
fn facility_union_matches_descendant_facilities() {
    let index = forest(120);

    for n in [0, 1, 4, 13, 40] {
        let id = OrganizationId::new(n);
        let expected: BTreeSet<FacilityId> = index
            .descendants(id)
            .unwrap()
            .into_iter()
            .map(|d| FacilityId::new(d.get() * 10))
            .collect();
        assert_eq!(index.facility_union(id).unwrap(), expected);
    }
}

#[test]
fn cycle_below_root_is_reported_not_looped() {
    // 1 -> 2 -> 3 -> 2 (3 claims 2 as child by being 2's parent)
    let index = HierarchyIndex::build([
        org(1, None, &[1]),
        org(2, Some(3), &[2]),
        org(3, Some(2), &[3]),
    ])
    .unwrap();

    // Root 1 cannot reach the cycle: 2's parent is 3, not 1.
    assert_eq!(
        index.facility_union(OrganizationId::new(1)).unwrap(),
        facilities(&[1])
    );

    let err = index.descendants(OrganizationId::new(2)).unwrap_err();
    assert!(matches!(err, CoreError::HierarchyCycle { .. }));
    assert!(err.is_hierarchy_corruption());
}
