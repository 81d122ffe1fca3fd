use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Sender};
use dashmap::DashMap;
use serde_json::Value;

use super::{Backend, BackendKind};
use crate::command::Command;
use crate::model::{Index, IndexEntry, IndexValue};
use crate::pubsub::Subscription;
use crate::Result;

#[derive(Debug, Clone)]
struct Stored {
    value: Value,
    indexes: Vec<IndexEntry>,
}

/// An in-process store with the same model as the HTTP key-value store: opaque JSON values
/// under `(bucket, key)`, with secondary index values supplied at write time.
///
/// It needs no external service, which makes it the backend of choice for tests and for
/// running the demonstration offline. Publish/subscribe is delivered through in-process
/// channels.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: DashMap<(String, String), Stored>,
    channels: DashMap<String, Vec<Subscriber>>,
}

/// the sending end of one subscription, and the flag its handle sets when cancelled or dropped
#[derive(Debug)]
struct Subscriber {
    tx: Sender<String>,
    cancelled: Arc<AtomicBool>,
}

impl Subscriber {
    fn is_live(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst)
    }
}

impl MemoryBackend {
    /// creates an empty store
    pub fn new() -> Self {
        MemoryBackend::default()
    }

    fn keys_where<F>(&self, bucket: &str, pred: F) -> Vec<String>
    where
        F: Fn(&Stored) -> bool,
    {
        let mut keys: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == bucket && pred(entry.value()))
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn render(&self, cmd: &Command) -> String {
        match cmd {
            Command::List => "for key in store.keys(\"poblacion\"):\n    store.get(\"poblacion\", key)".to_string(),
            Command::Get { dni } => format!("store.get(\"poblacion\", \"{}\")", dni),
            Command::Insert { person } => format!(
                "store.put(\"poblacion\", \"{}\", person, indexes={{ingresos_int: {}, sector_int: {}, sexo_bin: {}}})",
                person.national_id, person.income, person.sector, person.sex
            ),
            Command::Update { dni, delta } => format!(
                "p = store.get(\"poblacion\", \"{}\")\np.ingresos += {}\nstore.put(\"poblacion\", \"{}\", p, indexes=...)",
                dni, delta, dni
            ),
            Command::Delete { dni } => format!("store.delete(\"poblacion\", \"{}\")", dni),
            Command::Reindex => "for key in store.keys(\"poblacion\"):\n    store.put(key, store.get(key), indexes=...)".to_string(),
            Command::RangeQuery { min, max } => format!("store.index_range(\"ingresos_int\", {}, {})", min, max),
            Command::FilterQuery { sector, sex } => format!(
                "store.index_exact(\"sector_int\", {})\n# then keep sexo == '{}' client-side",
                sector, sex
            ),
            Command::Aggregate { sector } => format!(
                "totals = sum(p.ingresos for p in store.values(\"poblacion\") group by p.sector)\nstore.put(\"resumenes\", \"resumen_sector\", totals)\n# report sector {}",
                sector
            ),
        }
    }

    fn list(&self, bucket: &str) -> Result<Vec<String>> {
        Ok(self.keys_where(bucket, |_| true))
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .records
            .get(&(bucket.to_string(), key.to_string()))
            .map(|stored| stored.value.clone()))
    }

    fn put(&self, bucket: &str, key: &str, record: &Value, indexes: &[IndexEntry]) -> Result<()> {
        self.records.insert(
            (bucket.to_string(), key.to_string()),
            Stored {
                value: record.clone(),
                indexes: indexes.to_vec(),
            },
        );
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.records.remove(&(bucket.to_string(), key.to_string())).is_some())
    }

    fn query_exact(&self, bucket: &str, index: Index, value: &IndexValue) -> Result<Vec<String>> {
        Ok(self.keys_where(bucket, |stored| {
            stored.indexes.iter().any(|(i, v)| *i == index && v == value)
        }))
    }

    fn query_range(&self, bucket: &str, index: Index, min: i64, max: i64) -> Result<Vec<String>> {
        Ok(self.keys_where(bucket, |stored| {
            stored.indexes.iter().any(|(i, v)| match v {
                IndexValue::Int(n) => *i == index && (min..=max).contains(n),
                IndexValue::Bin(_) => false,
            })
        }))
    }

    fn publish(&self, channel: &str, message: &str) -> Result<Option<usize>> {
        let delivered = match self.channels.get_mut(channel) {
            Some(mut subscribers) => {
                subscribers.retain(|sub| sub.is_live() && sub.tx.send(message.to_string()).is_ok());
                subscribers.len()
            }
            None => 0,
        };
        Ok(Some(delivered))
    }

    fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut subscribers = self.channels.entry(channel.to_string()).or_default();
        subscribers.retain(Subscriber::is_live);
        subscribers.push(Subscriber {
            tx,
            cancelled: cancelled.clone(),
        });
        Ok(Subscription::new(channel, rx, cancelled, None))
    }
}
