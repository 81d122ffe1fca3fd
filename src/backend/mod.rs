//! This module provides the backend adapters: one implementation of the [`Backend`]
//! capability set per external store.
//!
//! Each adapter only has to provide the low-level key/value calls (`list`, `get`, `put`,
//! `delete`, and exact/range lookups on a secondary index) plus a health check and a renderer
//! for its native query text. The operation-level methods have default implementations that do
//! the work client-side on top of those calls, the way one would against a plain key-value
//! store. Adapters whose store can do better (server-side search, atomic increments,
//! aggregation pipelines) override them.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::command::Command;
use crate::model::{totals_by_sector, Index, IndexEntry, IndexValue, Person, SectorTotal, Sex, PEOPLE, SUMMARIES, SUMMARY_KEY};
use crate::pubsub::Subscription;
use crate::trace::Tracer;
use crate::{DbError, Result};

mod memory;
mod mongo;
mod redis;
mod riak;

pub use self::memory::MemoryBackend;
pub use self::mongo::MongoBackend;
pub use self::redis::RedisBackend;
pub use self::riak::RiakBackend;

/// The stores an operation can be routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// the Riak HTTP interface
    Riak,
    /// Redis with the RedisJSON and RediSearch modules
    Redis,
    /// a MongoDB database
    Mongo,
    /// the in-process store
    Memory,
}

impl BackendKind {
    /// every kind, in display order
    pub const ALL: [BackendKind; 4] = [BackendKind::Riak, BackendKind::Redis, BackendKind::Mongo, BackendKind::Memory];

    /// the lowercase name used in urls and on the command line
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Riak => "riak",
            BackendKind::Redis => "redis",
            BackendKind::Mongo => "mongo",
            BackendKind::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "riak" => Ok(BackendKind::Riak),
            "redis" => Ok(BackendKind::Redis),
            "mongo" | "mongodb" => Ok(BackendKind::Mongo),
            "memory" | "mem" => Ok(BackendKind::Memory),
            other => Err(DbError::Parsing(format!("'{}' as a backend, expected riak, redis, mongo or memory", other))),
        }
    }
}

/// A record ready to be written: its key, the JSON document and its secondary index values.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// primary key
    pub key: String,
    /// the JSON document
    pub value: Value,
    /// secondary index values written with the document
    pub indexes: Vec<IndexEntry>,
}

impl Record {
    /// a person, keyed by `dni`, with its three secondary index values
    pub fn person(p: &Person) -> Result<Record> {
        Ok(Record {
            key: p.national_id.clone(),
            value: p.to_record()?,
            indexes: p.index_entries(),
        })
    }
}

/// The capability set every store is driven through.
pub trait Backend: Send + Sync {
    /// which store this is
    fn kind(&self) -> BackendKind;

    /// checks the store is reachable, re-establishing the session if the adapter keeps one
    fn ping(&self) -> Result<()>;

    /// the native query text (or pseudo-code) that `cmd` executes on this store
    fn render(&self, cmd: &Command) -> String;

    /// every key in `bucket`
    fn list(&self, bucket: &str) -> Result<Vec<String>>;

    /// the record stored under `key`, `None` if absent
    fn get(&self, bucket: &str, key: &str) -> Result<Option<Value>>;

    /// writes `record` under `key`, replacing any previous value, with the given secondary
    /// index values. Stores that derive indexes from the document itself ignore `indexes`.
    fn put(&self, bucket: &str, key: &str, record: &Value, indexes: &[IndexEntry]) -> Result<()>;

    /// removes `key`, returning whether it existed (stores that cannot tell report `true`)
    fn delete(&self, bucket: &str, key: &str) -> Result<bool>;

    /// keys whose `index` equals `value`
    fn query_exact(&self, bucket: &str, index: Index, value: &IndexValue) -> Result<Vec<String>>;

    /// keys whose `index` lies within `[min, max]`
    fn query_range(&self, bucket: &str, index: Index, min: i64, max: i64) -> Result<Vec<String>>;

    /// dereferences `keys` into people, one `get` per key
    fn fetch_people(&self, keys: &[String], trace: &mut Tracer) -> Result<Vec<Person>> {
        let mut people = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get(PEOPLE, key)? {
                Some(record) => match Person::from_record(record) {
                    Ok(p) => people.push(p),
                    Err(e) => trace.warn(format!("skipping {}: {}", key, e)),
                },
                None => trace.warn(format!("{} vanished between lookup and fetch", key)),
            }
        }
        Ok(people)
    }

    /// every person, one `get` per listed key
    fn list_people(&self, trace: &mut Tracer) -> Result<Vec<Person>> {
        let keys = self.list(PEOPLE)?;
        trace.net(format!("{} keys listed, fetching each one", keys.len()));
        self.fetch_people(&keys, trace)
    }

    /// the person stored under `dni`, `None` if absent
    fn get_person(&self, dni: &str) -> Result<Option<Person>> {
        self.get(PEOPLE, dni)?.map(Person::from_record).transpose()
    }

    /// stores a new person
    ///
    /// # Errors
    /// `DbError::DuplicateKey` if the key is already taken
    fn insert_person(&self, person: &Person, _trace: &mut Tracer) -> Result<()> {
        if self.get(PEOPLE, &person.national_id)?.is_some() {
            return Err(DbError::DuplicateKey(person.national_id.clone()));
        }
        let record = Record::person(person)?;
        self.put(PEOPLE, &record.key, &record.value, &record.indexes)
    }

    /// adds `delta` to the stored income of `dni` and returns the updated person, `None` if
    /// there is no such person. Only the income field changes.
    fn increment_income(&self, dni: &str, delta: i64, trace: &mut Tracer) -> Result<Option<Person>> {
        let mut record = match self.get(PEOPLE, dni)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let current = Person::from_record(record.clone())?;
        record["ingresos"] = json!(incremented(&current, delta)?);
        let updated = Person::from_record(record.clone())?;
        trace.info("record fetched and modified in memory, writing it back with fresh index values");
        self.put(PEOPLE, dni, &record, &updated.index_entries())?;
        Ok(Some(updated))
    }

    /// removes the person stored under `dni`, returning whether it existed
    fn delete_person(&self, dni: &str) -> Result<bool> {
        self.delete(PEOPLE, dni)
    }

    /// rewrites every person so its secondary index values match the document
    fn reindex(&self, trace: &mut Tracer) -> Result<Value> {
        let keys = self.list(PEOPLE)?;
        let mut count = 0;
        for key in &keys {
            if let Some(record) = self.get(PEOPLE, key)? {
                let person = Person::from_record(record.clone())?;
                self.put(PEOPLE, key, &record, &person.index_entries())?;
                count += 1;
            }
        }
        trace.success(format!("indexes regenerated on {} records", count));
        Ok(json!({ "reindexed": count }))
    }

    /// people with `min <= income <= max`
    fn income_range(&self, min: i64, max: i64, trace: &mut Tracer) -> Result<Vec<Person>> {
        let keys = self.query_range(PEOPLE, Index::Income, min, max)?;
        trace.db(format!("index {} returned {} keys", Index::Income.riak_name(), keys.len()));
        self.fetch_people(&keys, trace)
    }

    /// people in `sector` with the given sex: an index lookup on the sector, then the sex is
    /// filtered client-side
    fn filter_sector_sex(&self, sector: u32, sex: Sex, trace: &mut Tracer) -> Result<Vec<Person>> {
        let keys = self.query_exact(PEOPLE, Index::Sector, &IndexValue::Int(i64::from(sector)))?;
        let candidates = self.fetch_people(&keys, trace)?;
        let found = candidates.len();
        let matched: Vec<Person> = candidates.into_iter().filter(|p| p.sex == sex).collect();
        trace.info(format!(
            "sector index matched {}, {} left after filtering sex == {} client-side",
            found,
            matched.len(),
            sex
        ));
        Ok(matched)
    }

    /// total income per sector over every person, persisted as the derived summary
    fn income_by_sector(&self, trace: &mut Tracer) -> Result<Vec<SectorTotal>> {
        let people = self.list_people(trace)?;
        let totals = totals_by_sector(&people);
        trace.info(format!("summed {} records client-side", people.len()));
        self.save_summary(&totals, trace)?;
        Ok(totals)
    }

    /// replaces the stored summary with `totals`
    fn save_summary(&self, totals: &[SectorTotal], trace: &mut Tracer) -> Result<()> {
        let summary: Map<String, Value> = totals
            .iter()
            .map(|t| (t.sector.to_string(), json!(t.total)))
            .collect();
        self.put(SUMMARIES, SUMMARY_KEY, &Value::Object(summary), &[])?;
        trace.db(format!("summary written to {}/{}", SUMMARIES, SUMMARY_KEY));
        Ok(())
    }

    /// publishes `message`, returning the number of receivers, or `None` when the store has
    /// no pub/sub of its own
    fn publish(&self, _channel: &str, _message: &str) -> Result<Option<usize>> {
        Ok(None)
    }

    /// subscribes to `channel`
    ///
    /// # Errors
    /// `DbError::Unsupported` unless the store has publish/subscribe
    fn subscribe(&self, _channel: &str) -> Result<Subscription> {
        Err(DbError::Unsupported(self.kind(), "publish/subscribe"))
    }

    /// drops search indexes ahead of a reload
    fn drop_indexes(&self, _trace: &mut Tracer) -> Result<()> {
        Ok(())
    }

    /// (re)creates the indexes queries depend on
    fn create_indexes(&self, _trace: &mut Tracer) -> Result<()> {
        Ok(())
    }

    /// deletes every record in `bucket`, returning how many were removed
    fn clear(&self, bucket: &str) -> Result<usize> {
        let keys = self.list(bucket)?;
        for key in &keys {
            self.delete(bucket, key)?;
        }
        Ok(keys.len())
    }

    /// writes all `records` into `bucket`
    fn put_batch(&self, bucket: &str, records: &[Record]) -> Result<usize> {
        for r in records {
            self.put(bucket, &r.key, &r.value, &r.indexes)?;
        }
        Ok(records.len())
    }

    /// number of records in `bucket`
    fn count(&self, bucket: &str) -> Result<usize> {
        Ok(self.list(bucket)?.len())
    }
}

/// the income of `person` raised by `delta`
///
/// # Errors
/// `DbError::MalformedQuery` if the result does not fit the income field
pub(crate) fn incremented(person: &Person, delta: i64) -> Result<i64> {
    person.income.checked_add(delta).ok_or_else(|| {
        DbError::MalformedQuery(format!(
            "ingresos of {} would overflow: {} + {}",
            person.national_id, person.income, delta
        ))
    })
}

/// The set of configured backends, one per [`BackendKind`].
#[derive(Clone, Default)]
pub struct Backends {
    inner: BTreeMap<BackendKind, Arc<dyn Backend>>,
}

impl Backends {
    /// an empty registry
    pub fn new() -> Self {
        Backends::default()
    }

    /// registers `backend`, replacing any previous backend of the same kind
    pub fn insert(&mut self, backend: Arc<dyn Backend>) {
        self.inner.insert(backend.kind(), backend);
    }

    /// builder form of [`Backends::insert`]
    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.insert(backend);
        self
    }

    /// the backend registered for `kind`
    pub fn get(&self, kind: BackendKind) -> Option<&Arc<dyn Backend>> {
        self.inner.get(&kind)
    }

    /// the registered backends, in [`BackendKind`] order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        self.inner.values()
    }

    /// kinds of the registered backends
    pub fn kinds(&self) -> Vec<BackendKind> {
        self.inner.keys().copied().collect()
    }

    /// `true` if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// pings every backend
    pub fn health(&self) -> BTreeMap<BackendKind, Result<()>> {
        self.inner.iter().map(|(kind, b)| (*kind, b.ping())).collect()
    }
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.inner.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse() {
        for kind in BackendKind::ALL.iter() {
            assert_eq!(kind.name().parse::<BackendKind>().unwrap(), *kind);
        }
        assert_eq!("MongoDB".parse::<BackendKind>().unwrap(), BackendKind::Mongo);
        assert!("cassandra".parse::<BackendKind>().is_err());
    }

    #[test]
    fn registry_is_keyed_by_kind() {
        let backends = Backends::new()
            .with(Arc::new(MemoryBackend::new()))
            .with(Arc::new(MemoryBackend::new()));
        assert_eq!(backends.kinds(), vec![BackendKind::Memory]);
        assert!(backends.get(BackendKind::Riak).is_none());
        assert!(backends.health()[&BackendKind::Memory].is_ok());
    }
}
