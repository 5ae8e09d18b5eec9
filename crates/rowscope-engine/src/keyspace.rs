//! Store key layout.
//!
//! ```text
//! {root}:{ns}:{ds}:entry:{entry_id}     cache entry (JSON)
//! {root}:{ns}:{ds}:idx:{term}           entry ids mentioning a term
//! {root}:{ns}:{ds}:idx:__all__          master index, every entry id
//! {root}:{ns}:{ds}:idx:__terms__        registry of terms with an index set
//! {root}:meta:{ds}:last_warmed          unix seconds of the last swap
//! {root}:meta:{ds}:epoch                invalidation epoch token
//! {root}:lease:{ds}                     warming lease, value is the job id
//! ```
//!
//! `{ns}` is `prod` or `shadow`. Index sets hold entry ids rather than full
//! keys so a shadow index merged into production points at production
//! entries.

use std::fmt;

use rowscope_core::DataSourceId;

use crate::dimension::IndexTerm;

/// Default key root.
pub const DEFAULT_KEY_ROOT: &str = "rowscope";

const MASTER_INDEX: &str = "__all__";
const TERM_REGISTRY: &str = "__terms__";

/// Production or shadow copy of a data source's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Production,
    Shadow,
}

impl Namespace {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "prod",
            Self::Shadow => "shadow",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds every store key the engine touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    root: String,
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_ROOT)
    }
}

impl Keyspace {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Prefix shared by every key of one namespace of one data source.
    pub fn namespace_prefix(&self, ns: Namespace, ds: &DataSourceId) -> String {
        format!("{}:{ns}:{ds}:", self.root)
    }

    pub fn entry(&self, ns: Namespace, ds: &DataSourceId, entry_id: &str) -> String {
        format!("{}entry:{entry_id}", self.namespace_prefix(ns, ds))
    }

    /// Prefix of every entry key, for scans.
    pub fn entry_prefix(&self, ns: Namespace, ds: &DataSourceId) -> String {
        format!("{}entry:", self.namespace_prefix(ns, ds))
    }

    pub fn index(&self, ns: Namespace, ds: &DataSourceId, term: &IndexTerm) -> String {
        format!("{}idx:{term}", self.namespace_prefix(ns, ds))
    }

    pub fn master_index(&self, ns: Namespace, ds: &DataSourceId) -> String {
        format!("{}idx:{MASTER_INDEX}", self.namespace_prefix(ns, ds))
    }

    pub fn term_registry(&self, ns: Namespace, ds: &DataSourceId) -> String {
        format!("{}idx:{TERM_REGISTRY}", self.namespace_prefix(ns, ds))
    }

    pub fn last_warmed(&self, ds: &DataSourceId) -> String {
        format!("{}:meta:{ds}:last_warmed", self.root)
    }

    pub fn epoch(&self, ds: &DataSourceId) -> String {
        format!("{}:meta:{ds}:epoch", self.root)
    }

    pub fn lease(&self, ds: &DataSourceId) -> String {
        format!("{}:lease:{ds}", self.root)
    }

    /// Entry id of an entry key, if `key` is one.
    pub fn entry_id_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.split_once(":entry:").map(|(_, id)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let ks = Keyspace::default();
        let ds = DataSourceId::parse("claims").unwrap();

        assert_eq!(
            ks.entry(Namespace::Shadow, &ds, "abc"),
            "rowscope:shadow:claims:entry:abc"
        );
        assert_eq!(
            ks.index(Namespace::Production, &ds, &IndexTerm::measure("volume")),
            "rowscope:prod:claims:idx:measure:volume"
        );
        assert_eq!(
            ks.master_index(Namespace::Production, &ds),
            "rowscope:prod:claims:idx:__all__"
        );
        assert_eq!(ks.lease(&ds), "rowscope:lease:claims");
        assert_eq!(ks.epoch(&ds), "rowscope:meta:claims:epoch");
    }

    #[test]
    fn test_namespaces_do_not_share_prefixes() {
        let ks = Keyspace::new("t");
        let ds = DataSourceId::parse("a").unwrap();
        let prod = ks.namespace_prefix(Namespace::Production, &ds);
        let shadow = ks.namespace_prefix(Namespace::Shadow, &ds);
        assert!(!prod.starts_with(&shadow) && !shadow.starts_with(&prod));

        // Data source "a" must not match data source "ab".
        let other = DataSourceId::parse("ab").unwrap();
        assert!(!ks.entry(Namespace::Production, &other, "x").starts_with(&prod));
    }

    #[test]
    fn test_entry_id_of() {
        let ks = Keyspace::default();
        let ds = DataSourceId::parse("claims").unwrap();
        let key = ks.entry(Namespace::Production, &ds, "d1-all");
        assert_eq!(ks.entry_id_of(&key), Some("d1-all"));
        assert_eq!(ks.entry_id_of("rowscope:lease:claims"), None);
    }
}
