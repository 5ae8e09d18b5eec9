//! End-to-end resolution: identity store -> resolver -> injector -> rows.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rowscope_auth::prelude::*;
use rowscope_auth::{CallerRecord, RecordingAuditSink, ResolutionOutcome, StaticIdentityStore};
use rowscope_core::{
    ColumnSpec, ColumnType, FacilityId, HierarchyIndex, Organization, OrganizationId,
    PractitionerId, ResultSet, SharedHierarchy,
};
use serde_json::{Value, json};

const ORG_A: i64 = 100;
const ORG_B: i64 = 200;

fn hierarchy() -> Arc<SharedHierarchy> {
    // A owns facilities {1,2}; its child B owns {3}.
    let index = HierarchyIndex::build([
        Organization::new(OrganizationId::new(ORG_A))
            .with_facilities([FacilityId::new(1), FacilityId::new(2)]),
        Organization::new(OrganizationId::new(ORG_B))
            .with_parent(OrganizationId::new(ORG_A))
            .with_facilities([FacilityId::new(3)]),
    ])
    .unwrap();
    Arc::new(SharedHierarchy::from_index(index, Duration::from_secs(300)))
}

fn record(caller_id: &str, memberships: &[i64], practitioner: Option<i64>, grants: &[&str]) -> CallerRecord {
    CallerRecord {
        caller_id: caller_id.to_string(),
        memberships: memberships.iter().copied().map(OrganizationId::new).collect(),
        practitioner_id: practitioner.map(PractitionerId::new),
        grants: grants.iter().map(|g| (*g).to_string()).collect(),
    }
}

fn identity() -> StaticIdentityStore {
    let store = StaticIdentityStore::new();
    store.insert(record("analyst-a", &[ORG_A], None, &["analytics:read:organization"]));
    store.insert(record("analyst-b", &[ORG_B], None, &["analytics:read:organization"]));
    store.insert(record(
        "dr-42",
        &[ORG_B],
        Some(42),
        &["analytics:read:own", "fhir:patient.read"],
    ));
    store.insert(record(
        "admin",
        &[ORG_B],
        None,
        &["analytics:read:organization", "analytics:read:all"],
    ));
    store.insert(record("confused", &[ORG_A], None, &["analytics:read:al"]));
    store
}

fn facility_set(ids: &[i64]) -> BTreeSet<FacilityId> {
    ids.iter().copied().map(FacilityId::new).collect()
}

/// Rows of a small encounters table: (facility, practitioner, visits).
fn encounters() -> Vec<HashMap<&'static str, Value>> {
    [
        (json!(1), json!(42), 5),
        (json!(2), json!(43), 7),
        (json!(3), Value::Null, 11),
        (json!(4), json!(42), 13),
    ]
    .into_iter()
    .map(|(facility, practitioner, visits)| {
        HashMap::from([
            ("facility_id", facility),
            ("practitioner_id", practitioner),
            ("visits", json!(visits)),
        ])
    })
    .collect()
}

#[tokio::test]
async fn organization_a_sees_its_subtree() {
    let resolver = PermissionResolver::new(hierarchy());
    let filter = resolver.resolve_caller(&identity(), "analyst-a").await.unwrap();
    assert_eq!(filter, EffectiveFilter::Facilities(facility_set(&[1, 2, 3])));
}

#[tokio::test]
async fn organization_b_sees_only_its_own_facility() {
    let resolver = PermissionResolver::new(hierarchy());
    let filter = resolver.resolve_caller(&identity(), "analyst-b").await.unwrap();
    assert_eq!(filter, EffectiveFilter::Facilities(facility_set(&[3])));
}

#[tokio::test]
async fn read_all_wins_over_organization_grant() {
    let resolver = PermissionResolver::new(hierarchy());
    let filter = resolver.resolve_caller(&identity(), "admin").await.unwrap();
    assert!(filter.is_unrestricted());
}

#[tokio::test]
async fn ambiguous_grant_is_denied_and_audited() {
    let audit = Arc::new(RecordingAuditSink::new());
    let resolver = PermissionResolver::with_audit_sink(hierarchy(), audit.clone());

    let err = resolver.resolve_caller(&identity(), "confused").await.unwrap_err();
    assert!(err.is_access_denied());
    assert_eq!(audit.events().len(), 1);
    assert_eq!(audit.events()[0].outcome, ResolutionOutcome::Error);
}

#[tokio::test]
async fn unknown_caller_is_denied() {
    let resolver = PermissionResolver::new(hierarchy());
    let filter = resolver.resolve_caller(&identity(), "nobody").await.unwrap();
    assert!(filter.is_deny_all());
}

#[tokio::test]
async fn practitioner_42_sees_own_and_unattributed_rows() {
    let resolver = PermissionResolver::new(hierarchy());
    let filter = resolver.resolve_caller(&identity(), "dr-42").await.unwrap();
    assert_eq!(filter, EffectiveFilter::Practitioner(PractitionerId::new(42)));

    // Warehouse side: the injected predicate evaluated row by row.
    let injector = FilterInjector::default();
    let query = injector.scope_query(
        AnalyticsQuery::new("encounters", ["facility_id", "practitioner_id", "visits"]),
        &filter,
    );
    let visible: Vec<i64> = encounters()
        .iter()
        .filter(|row| query.matches_row(&|c: &str| row.get(c)))
        .filter_map(|row| row["visits"].as_i64())
        .collect();
    assert_eq!(visible, vec![5, 11, 13]);

    // Cache side: re-filtering an unrestricted payload agrees.
    let mut payload = ResultSet::new(vec![
        ColumnSpec::new("facility_id", ColumnType::Integer),
        ColumnSpec::new("practitioner_id", ColumnType::Integer),
        ColumnSpec::new("visits", ColumnType::Integer),
    ]);
    for row in encounters() {
        payload
            .push_row(vec![
                row["facility_id"].clone(),
                row["practitioner_id"].clone(),
                row["visits"].clone(),
            ])
            .unwrap();
    }
    filter.apply(&mut payload, injector.columns());
    assert_eq!(payload.distinct_integers("visits"), vec![5, 11, 13]);
}

#[tokio::test]
async fn injected_facility_filter_matches_in_memory_filter() {
    let resolver = PermissionResolver::new(hierarchy());
    let filter = resolver.resolve_caller(&identity(), "analyst-b").await.unwrap();

    let injector = FilterInjector::default();
    let query = injector.scope_query(AnalyticsQuery::new("encounters", ["visits"]), &filter);
    let built = query.render().unwrap();
    assert_eq!(
        built.sql,
        "SELECT visits FROM encounters WHERE facility_id IN ($1)"
    );
    assert_eq!(built.params, vec![SqlValue::Integer(3)]);

    let matched: Vec<_> = encounters()
        .into_iter()
        .filter(|row| query.matches_row(&|c: &str| row.get(c)))
        .collect();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0]["visits"], json!(11));
}
