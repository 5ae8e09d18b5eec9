//! In-process cache store.
//!
//! Single-instance backend used when Redis is disabled or unreachable, and as
//! the test double for the engine. All state sits behind one `RwLock`, which
//! makes [`CacheStore::atomic`] trivially all-or-nothing for readers: they
//! either run before the write guard is taken or after it is dropped.
//!
//! Expiry is passive: expired keys are treated as absent on access and
//! physically dropped the next time they are written.
//!
//! ## Fault injection
//!
//! [`InMemoryCacheStore::set_unavailable`] makes every call fail with
//! `StoreError::Unavailable`, and [`InMemoryCacheStore::fail_next_atomic_after`]
//! aborts the next atomic operation after a given number of steps have been
//! applied. The aborted steps are rolled back from an undo journal.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::traits::{AtomicOp, CacheStore};

#[derive(Debug, Clone)]
enum Stored {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Slot {
    fn bytes(value: Vec<u8>, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            value: Stored::Bytes(value),
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

type Keyspace = HashMap<String, Slot>;

fn live<'a>(data: &'a Keyspace, key: &str, now: Instant) -> Option<&'a Slot> {
    data.get(key).filter(|slot| slot.is_live(now))
}

fn live_set<'a>(data: &'a Keyspace, key: &str, now: Instant) -> StoreResult<Option<&'a BTreeSet<String>>> {
    match live(data, key, now).map(|slot| &slot.value) {
        None => Ok(None),
        Some(Stored::Set(set)) => Ok(Some(set)),
        Some(Stored::Bytes(_)) => Err(StoreError::wrong_type(key)),
    }
}

fn holds(data: &Keyspace, key: &str, expected: Option<&[u8]>, now: Instant) -> bool {
    match (live(data, key, now).map(|slot| &slot.value), expected) {
        (None, None) => true,
        (Some(Stored::Bytes(current)), Some(expected)) => current.as_slice() == expected,
        _ => false,
    }
}

/// Mutable access to a live set, creating it if absent.
fn set_entry<'a>(data: &'a mut Keyspace, key: &str, now: Instant) -> StoreResult<&'a mut BTreeSet<String>> {
    let replace = match data.get(key) {
        Some(slot) if slot.is_live(now) => false,
        _ => true,
    };
    if replace {
        data.insert(
            key.to_string(),
            Slot {
                value: Stored::Set(BTreeSet::new()),
                expires_at: None,
            },
        );
    }
    match data.get_mut(key).map(|slot| &mut slot.value) {
        Some(Stored::Set(set)) => Ok(set),
        _ => Err(StoreError::wrong_type(key)),
    }
}

/// Drop a set key that has become empty (Redis semantics).
fn drop_if_empty(data: &mut Keyspace, key: &str) {
    if matches!(data.get(key), Some(Slot { value: Stored::Set(set), .. }) if set.is_empty()) {
        data.remove(key);
    }
}

/// Prior values of every key touched by an atomic operation.
#[derive(Default)]
struct UndoJournal {
    seen: HashSet<String>,
    entries: Vec<(String, Option<Slot>)>,
}

impl UndoJournal {
    fn touch(&mut self, data: &Keyspace, key: &str) {
        if self.seen.insert(key.to_string()) {
            self.entries.push((key.to_string(), data.get(key).cloned()));
        }
    }

    fn rollback(self, data: &mut Keyspace) {
        for (key, previous) in self.entries.into_iter().rev() {
            match previous {
                Some(slot) => {
                    data.insert(key, slot);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
    }
}

fn apply(data: &mut Keyspace, op: AtomicOp, now: Instant, journal: &mut UndoJournal) -> StoreResult<()> {
    match op {
        AtomicOp::Rename { from, to } => {
            if live(data, &from, now).is_none() {
                return Err(StoreError::transaction_aborted(format!("no such key: {from}")));
            }
            journal.touch(data, &from);
            journal.touch(data, &to);
            if let Some(slot) = data.remove(&from) {
                data.insert(to, slot);
            }
        }
        AtomicOp::UnionInto {
            destination,
            source,
        } => {
            let members = live_set(data, &source, now)?.cloned().unwrap_or_default();
            journal.touch(data, &destination);
            set_entry(data, &destination, now)?.extend(members);
            drop_if_empty(data, &destination);
        }
        AtomicOp::Expect { .. } => {}
        AtomicOp::Delete { key } => {
            journal.touch(data, &key);
            data.remove(&key);
        }
        AtomicOp::Set { key, value, ttl } => {
            journal.touch(data, &key);
            data.insert(key, Slot::bytes(value, ttl, now));
        }
        AtomicOp::SetAdd { key, members } => {
            journal.touch(data, &key);
            set_entry(data, &key, now)?.extend(members);
            drop_if_empty(data, &key);
        }
        AtomicOp::SetRemove { key, members } => {
            journal.touch(data, &key);
            if live_set(data, &key, now)?.is_some() {
                let set = set_entry(data, &key, now)?;
                for member in &members {
                    set.remove(member);
                }
                drop_if_empty(data, &key);
            }
        }
    }
    Ok(())
}

/// Cache store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    data: RwLock<Keyspace>,
    unavailable: AtomicBool,
    atomic_fault: Mutex<Option<usize>>,
    atomic_commits: AtomicU64,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Abort the next atomic operation after `steps` of its operations have
    /// been applied. The applied steps are rolled back.
    pub fn fail_next_atomic_after(&self, steps: usize) {
        if let Ok(mut fault) = self.atomic_fault.lock() {
            *fault = Some(steps);
        }
    }

    /// Number of atomic operations committed so far.
    pub fn atomic_commits(&self) -> u64 {
        self.atomic_commits.load(Ordering::SeqCst)
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.data
            .read()
            .await
            .values()
            .filter(|slot| slot.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::unavailable("in-memory store marked unavailable"))
        } else {
            Ok(())
        }
    }

    fn take_atomic_fault(&self) -> Option<usize> {
        self.atomic_fault.lock().ok().and_then(|mut fault| fault.take())
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check_available()?;
        let data = self.data.read().await;
        match live(&data, key, Instant::now()).map(|slot| &slot.value) {
            None => Ok(None),
            Some(Stored::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(Stored::Set(_)) => Err(StoreError::wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.insert(key.to_string(), Slot::bytes(value, ttl, Instant::now()));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<usize> {
        self.check_available()?;
        let now = Instant::now();
        let mut data = self.data.write().await;
        let mut removed = 0;
        for key in keys {
            if let Some(slot) = data.remove(key)
                && slot.is_live(now)
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        let data = self.data.read().await;
        Ok(live(&data, key, Instant::now()).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut data = self.data.write().await;
        match data.get_mut(key) {
            Some(slot) if slot.is_live(now) => {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_add(&self, key: &str, members: &[String]) -> StoreResult<usize> {
        self.check_available()?;
        if members.is_empty() {
            return Ok(0);
        }
        let mut data = self.data.write().await;
        let set = set_entry(&mut data, key, Instant::now())?;
        Ok(members.iter().filter(|m| set.insert((*m).clone())).count())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> StoreResult<usize> {
        self.check_available()?;
        let now = Instant::now();
        let mut data = self.data.write().await;
        if live_set(&data, key, now)?.is_none() {
            return Ok(0);
        }
        let set = set_entry(&mut data, key, now)?;
        let removed = members.iter().filter(|m| set.remove(m.as_str())).count();
        drop_if_empty(&mut data, key);
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> StoreResult<BTreeSet<String>> {
        self.check_available()?;
        let data = self.data.read().await;
        Ok(live_set(&data, key, Instant::now())?.cloned().unwrap_or_default())
    }

    async fn set_union(&self, keys: &[String]) -> StoreResult<BTreeSet<String>> {
        self.check_available()?;
        let now = Instant::now();
        let data = self.data.read().await;
        let mut union = BTreeSet::new();
        for key in keys {
            if let Some(set) = live_set(&data, key, now)? {
                union.extend(set.iter().cloned());
            }
        }
        Ok(union)
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let now = Instant::now();
        let data = self.data.read().await;
        Ok(data
            .iter()
            .filter(|(key, slot)| key.starts_with(prefix) && slot.is_live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut data = self.data.write().await;
        if live(&data, key, now).is_some() {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            Slot::bytes(holder.as_bytes().to_vec(), Some(ttl), now),
        );
        Ok(true)
    }

    async fn renew_lease(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut data = self.data.write().await;
        match data.get_mut(key) {
            Some(slot)
                if slot.is_live(now)
                    && matches!(&slot.value, Stored::Bytes(b) if b == holder.as_bytes()) =>
            {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, key: &str, holder: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut data = self.data.write().await;
        let owned = matches!(
            live(&data, key, now).map(|slot| &slot.value),
            Some(Stored::Bytes(b)) if b == holder.as_bytes()
        );
        if owned {
            data.remove(key);
        }
        Ok(owned)
    }

    async fn lease_holder(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .get(key)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn atomic(&self, ops: Vec<AtomicOp>) -> StoreResult<()> {
        self.check_available()?;
        let now = Instant::now();
        let mut data = self.data.write().await;

        for op in &ops {
            if let Some(key) = op.required_key()
                && live(&data, key, now).is_none()
            {
                return Err(StoreError::transaction_aborted(format!("no such key: {key}")));
            }
            if let Some((key, expected)) = op.expected_value()
                && !holds(&data, key, expected, now)
            {
                return Err(StoreError::transaction_aborted(format!(
                    "unexpected value at {key}"
                )));
            }
        }

        let fault = self.take_atomic_fault();
        let mut journal = UndoJournal::default();
        for (step, op) in ops.into_iter().enumerate() {
            if fault == Some(step) {
                journal.rollback(&mut data);
                tracing::debug!(step, "Injected atomic fault; rolled back");
                return Err(StoreError::transaction_aborted(format!(
                    "injected fault after {step} steps"
                )));
            }
            if let Err(err) = apply(&mut data, op, now, &mut journal) {
                journal.rollback(&mut data);
                return Err(match err {
                    StoreError::TransactionAborted { .. } => err,
                    other => StoreError::transaction_aborted(other.to_string()),
                });
            }
        }

        self.atomic_commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
