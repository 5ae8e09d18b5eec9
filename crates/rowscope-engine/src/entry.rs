//! Cache entries and scope fingerprints.
//!
//! An entry is immutable once written. Entries computed for an unrestricted
//! caller are shared by everyone; entries computed under a narrower filter
//! are keyed by that filter's fingerprint so they are only ever read back by
//! callers with the same scope.

use std::time::Duration;

use rowscope_auth::{EffectiveFilter, ScopeColumns};
use rowscope_core::{FacilityId, ResultSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::EngineResult;
use crate::dimension::{DimensionKey, IndexTerm};
use crate::error::EngineError;

/// Short, stable token identifying an effective filter inside entry ids.
pub fn scope_fingerprint(filter: &EffectiveFilter) -> String {
    match filter {
        EffectiveFilter::Unrestricted => "all".to_string(),
        EffectiveFilter::Practitioner(id) => format!("p{id}"),
        EffectiveFilter::Facilities(set) if !set.is_empty() => {
            let mut hasher = Sha256::new();
            for id in set {
                hasher.update(id.get().to_be_bytes());
            }
            let digest = hex::encode(hasher.finalize());
            format!("f{}", &digest[..16])
        }
        EffectiveFilter::Facilities(_) | EffectiveFilter::DenyAll => "none".to_string(),
    }
}

/// Entry id for a dimension digest under a scope.
pub fn entry_id(digest: &str, filter: &EffectiveFilter) -> String {
    format!("{digest}-{}", scope_fingerprint(filter))
}

/// A precomputed result with its scope and lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: DimensionKey,
    /// Filter the payload was computed under.
    pub scope: EffectiveFilter,
    /// Creation time in unix milliseconds.
    created_at_ms: i64,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub payload: ResultSet,
}

impl CacheEntry {
    pub fn new(
        key: DimensionKey,
        scope: EffectiveFilter,
        payload: ResultSet,
        ttl: Duration,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            key,
            scope,
            created_at_ms: unix_millis(now),
            ttl,
            payload,
        }
    }

    pub fn created_at(&self) -> OffsetDateTime {
        from_unix_millis(self.created_at_ms)
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.created_at() + self.ttl
    }

    /// Passive expiry check, done on every read.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at()
    }

    /// Id under which this entry is stored.
    pub fn entry_id(&self) -> EngineResult<String> {
        Ok(entry_id(&self.key.digest()?, &self.scope))
    }

    /// Index terms: the key's own terms plus every facility in the payload.
    pub fn terms(&self, columns: &ScopeColumns) -> Vec<IndexTerm> {
        let mut terms = self.key.terms();
        terms.extend(
            self.payload
                .distinct_integers(&columns.facility)
                .into_iter()
                .map(|f| IndexTerm::facility(FacilityId::new(f))),
        );
        terms
    }

    /// Payload narrowed to `filter`. The stored payload is never returned
    /// as-is to a scoped caller.
    pub fn scoped_payload(&self, filter: &EffectiveFilter, columns: &ScopeColumns) -> ResultSet {
        let mut rows = self.payload.clone();
        filter.apply(&mut rows, columns);
        rows
    }

    pub fn to_bytes(&self) -> EngineResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| EngineError::internal(e.to_string()))
    }

    /// Decode an entry read from `store_key`.
    pub fn from_bytes(store_key: &str, bytes: &[u8]) -> EngineResult<Self> {
        let entry: Self = serde_json::from_slice(bytes)
            .map_err(|e| EngineError::corrupt_entry(store_key, e.to_string()))?;
        entry
            .payload
            .validate()
            .map_err(|e| EngineError::corrupt_entry(store_key, e.to_string()))?;
        Ok(entry)
    }
}

pub(crate) fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_unix_millis(millis: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
