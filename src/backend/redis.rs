use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Sender};
use redis::{Client, Connection, RedisError, RedisResult};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::{incremented, Backend, BackendKind, Record};
use crate::command::Command;
use crate::model::{Index, IndexEntry, IndexValue, Person, SectorTotal, Sex, NEW_PERSON_CHANNEL, PEOPLE, SUMMARIES, SUMMARY_KEY};
use crate::pubsub::Subscription;
use crate::trace::Tracer;
use crate::{DbError, Result};

/// name of the search index over people
pub const INDEX_NAME: &str = "idx_poblacion";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
// how often a listener wakes up to look at its cancellation flag
const LISTEN_POLL: Duration = Duration::from_millis(200);
// upper bound on search results; the dataset is tiny
const SEARCH_LIMIT: usize = 10_000;

const SCHEMA: [&str; 22] = [
    "ON", "JSON", "PREFIX", "1", "poblacion:", "SCHEMA", "$.nombre", "AS", "nombre", "TEXT", "$.ingresos", "AS",
    "ingresos", "NUMERIC", "$.sector", "AS", "sector", "NUMERIC", "$.sexo", "AS", "sexo", "TAG",
];

/// `{bucket}:{key}`
fn doc_key(bucket: &str, key: &str) -> String {
    format!("{}:{}", bucket, key)
}

/// the RediSearch clause matching `index == value`
fn exact_clause(index: Index, value: &IndexValue) -> String {
    match value {
        IndexValue::Int(n) => format!("@{}:[{} {}]", index.field(), n, n),
        IndexValue::Bin(s) => format!("@{}:{{{}}}", index.field(), s),
    }
}

/// the RediSearch clause matching `min <= index <= max`
fn range_clause(index: Index, min: i64, max: i64) -> String {
    format!("@{}:[{} {}]", index.field(), min, max)
}

fn sector_sex_clause(sector: u32, sex: Sex) -> String {
    format!(
        "{} {}",
        exact_clause(Index::Sector, &IndexValue::Int(i64::from(sector))),
        exact_clause(Index::Sex, &IndexValue::Bin(sex.code().to_string()))
    )
}

fn unavailable(e: RedisError) -> DbError {
    DbError::Unavailable(BackendKind::Redis, e.to_string())
}

// errors after which the cached connection must not be reused
fn is_broken(e: &RedisError) -> bool {
    e.is_connection_dropped() || e.is_io_error() || e.is_timeout() || e.is_connection_refusal()
}

/// Adapter for Redis with the RedisJSON and RediSearch modules.
///
/// People are JSON documents under `poblacion:{dni}`; range and filter queries go through the
/// `idx_poblacion` search index, which must exist before they return anything. The adapter
/// holds one connection and re-dials on the next call after a connection-level failure.
pub struct RedisBackend {
    client: Client,
    session: Mutex<Option<Connection>>,
}

impl RedisBackend {
    /// creates an adapter for `url`, e.g. `redis://localhost:6379`. No connection is made until
    /// the first call.
    #[instrument]
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        Ok(RedisBackend {
            client,
            session: Mutex::new(None),
        })
    }

    fn connect(&self) -> Result<Connection> {
        debug!("dialing redis");
        self.client.get_connection_with_timeout(CONNECT_TIMEOUT).map_err(unavailable)
    }

    /// runs `f` on the session connection, dialing first if there is none
    fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> RedisResult<T>,
    {
        let mut session = self
            .session
            .lock()
            .map_err(|_| DbError::StringErr("redis session lock poisoned".to_string()))?;
        let mut con = match session.take() {
            Some(con) => con,
            None => self.connect()?,
        };
        match f(&mut con) {
            Ok(value) => {
                *session = Some(con);
                Ok(value)
            }
            Err(e) => {
                if is_broken(&e) {
                    warn!("dropping redis connection: {}", e);
                } else {
                    *session = Some(con);
                }
                Err(e.into())
            }
        }
    }

    /// keys (without prefix) of the people matching a RediSearch query
    fn search(&self, query: &str) -> Result<Vec<String>> {
        debug!("FT.SEARCH {} {}", INDEX_NAME, query);
        let reply: Vec<redis::Value> = self
            .with_conn(|con| {
                redis::cmd("FT.SEARCH")
                    .arg(INDEX_NAME)
                    .arg(query)
                    .arg("NOCONTENT")
                    .arg("LIMIT")
                    .arg(0)
                    .arg(SEARCH_LIMIT)
                    .query(con)
            })
            .map_err(|e| match e {
                DbError::Redis(e) if !is_broken(&e) => DbError::MalformedQuery(e.to_string()),
                other => other,
            })?;
        // first element is the total count, then one document id per hit
        let prefix = format!("{}:", PEOPLE);
        reply
            .iter()
            .skip(1)
            .map(|v| {
                let id: String = redis::from_redis_value(v)?;
                Ok(id.strip_prefix(&prefix).unwrap_or(&id).to_string())
            })
            .collect()
    }

    fn indexed_docs(&self) -> Result<u64> {
        let info: Vec<redis::Value> = self.with_conn(|con| redis::cmd("FT.INFO").arg(INDEX_NAME).query(con))?;
        for pair in info.chunks(2) {
            if let [name, value] = pair {
                let name: String = redis::from_redis_value(name)?;
                if name == "num_docs" {
                    if let redis::Value::Int(n) = value {
                        return Ok((*n).max(0) as u64);
                    }
                    let value: String = redis::from_redis_value(value)?;
                    return value
                        .parse::<f64>()
                        .map(|n| n as u64)
                        .map_err(|_| DbError::Parsing(format!("num_docs '{}'", value)));
                }
            }
        }
        Ok(0)
    }
}

impl Backend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    fn ping(&self) -> Result<()> {
        self.with_conn(|con| redis::cmd("PING").query::<String>(con))
            .map(|_| ())
            .map_err(|e| match e {
                DbError::Redis(e) => unavailable(e),
                other => other,
            })
    }

    fn render(&self, cmd: &Command) -> String {
        match cmd {
            Command::List => "SCAN 0 MATCH poblacion:*\n# then for every key:\nJSON.GET <key>".to_string(),
            Command::Get { dni } => format!("JSON.GET {}", doc_key(PEOPLE, dni)),
            Command::Insert { person } => format!(
                "JSON.SET {} $ '{}' NX\nPUBLISH {} \"{}\"",
                doc_key(PEOPLE, &person.national_id),
                serde_json::to_string(person).unwrap_or_default(),
                NEW_PERSON_CHANNEL,
                person.joined_message()
            ),
            Command::Update { dni, delta } => {
                format!("JSON.NUMINCRBY {} $.ingresos {}", doc_key(PEOPLE, dni), delta)
            }
            Command::Delete { dni } => format!("DEL {}", doc_key(PEOPLE, dni)),
            Command::Reindex => format!("FT.CREATE {} {}\nFT.INFO {}", INDEX_NAME, SCHEMA.join(" "), INDEX_NAME),
            Command::RangeQuery { min, max } => format!(
                "FT.SEARCH {} \"{}\" LIMIT 0 {}",
                INDEX_NAME,
                range_clause(Index::Income, *min, *max),
                SEARCH_LIMIT
            ),
            Command::FilterQuery { sector, sex } => {
                format!("FT.SEARCH {} \"{}\"", INDEX_NAME, sector_sex_clause(*sector, *sex))
            }
            Command::Aggregate { sector } => format!(
                "SCAN 0 MATCH poblacion:*\n# JSON.GET every key, sum ingresos per sector client-side (sector {})\nDEL {key}\nHSET {key} <sector> <total> ...",
                sector,
                key = SUMMARY_KEY
            ),
        }
    }

    fn list(&self, bucket: &str) -> Result<Vec<String>> {
        let pattern = format!("{}:*", bucket);
        let prefix = format!("{}:", bucket);
        let mut keys: Vec<String> = self.with_conn(|con| {
            redis::Commands::scan_match::<_, String>(con, &pattern).map(|iter| iter.collect())
        })?;
        keys.sort();
        keys.dedup();
        Ok(keys
            .into_iter()
            .map(|k| k.strip_prefix(&prefix).unwrap_or(&k).to_string())
            .collect())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Value>> {
        let doc: Option<String> =
            self.with_conn(|con| redis::cmd("JSON.GET").arg(doc_key(bucket, key)).query(con))?;
        match doc {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    fn put(&self, bucket: &str, key: &str, record: &Value, _indexes: &[IndexEntry]) -> Result<()> {
        let doc = serde_json::to_string(record)?;
        self.with_conn(|con| {
            redis::cmd("JSON.SET")
                .arg(doc_key(bucket, key))
                .arg("$")
                .arg(&doc)
                .query::<()>(con)
        })
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        let removed: i64 = self.with_conn(|con| redis::cmd("DEL").arg(doc_key(bucket, key)).query(con))?;
        Ok(removed > 0)
    }

    fn query_exact(&self, bucket: &str, index: Index, value: &IndexValue) -> Result<Vec<String>> {
        if bucket != PEOPLE {
            return Err(DbError::Unsupported(BackendKind::Redis, "index queries outside poblacion"));
        }
        self.search(&exact_clause(index, value))
    }

    fn query_range(&self, bucket: &str, index: Index, min: i64, max: i64) -> Result<Vec<String>> {
        if bucket != PEOPLE {
            return Err(DbError::Unsupported(BackendKind::Redis, "index queries outside poblacion"));
        }
        if index == Index::Sex {
            return Err(DbError::MalformedQuery("sexo is a TAG field and has no range".to_string()));
        }
        self.search(&range_clause(index, min, max))
    }

    fn insert_person(&self, person: &Person, trace: &mut Tracer) -> Result<()> {
        let doc = serde_json::to_string(person)?;
        let key = doc_key(PEOPLE, &person.national_id);
        let created: Option<String> = self.with_conn(|con| {
            redis::cmd("JSON.SET").arg(&key).arg("$").arg(&doc).arg("NX").query(con)
        })?;
        match created {
            Some(_) => {
                trace.db(format!("{} written", key));
                Ok(())
            }
            None => Err(DbError::DuplicateKey(person.national_id.clone())),
        }
    }

    fn increment_income(&self, dni: &str, delta: i64, trace: &mut Tracer) -> Result<Option<Person>> {
        let key = doc_key(PEOPLE, dni);
        let current = match self.get_person(dni)? {
            Some(person) => person,
            None => return Ok(None),
        };
        incremented(&current, delta)?;
        self.with_conn(|con| {
            redis::cmd("JSON.NUMINCRBY")
                .arg(&key)
                .arg("$.ingresos")
                .arg(delta)
                .query::<()>(con)
        })?;
        trace.db("income incremented in place, the search index follows the document");
        self.get_person(dni)
    }

    fn filter_sector_sex(&self, sector: u32, sex: Sex, trace: &mut Tracer) -> Result<Vec<Person>> {
        let keys = self.search(&sector_sex_clause(sector, sex))?;
        trace.db(format!("{} matched {} documents", INDEX_NAME, keys.len()));
        self.fetch_people(&keys, trace)
    }

    fn reindex(&self, trace: &mut Tracer) -> Result<Value> {
        trace.info("checking the search index");
        self.create_indexes(trace)?;
        let docs = self.indexed_docs()?;
        trace.success(format!("{} documents indexed", docs));
        Ok(json!({ "docs_indexed": docs, "index_name": INDEX_NAME }))
    }

    fn save_summary(&self, totals: &[SectorTotal], trace: &mut Tracer) -> Result<()> {
        self.with_conn(|con| {
            let mut pipe = redis::pipe();
            pipe.atomic().cmd("DEL").arg(SUMMARY_KEY).ignore();
            for t in totals {
                pipe.cmd("HSET").arg(SUMMARY_KEY).arg(t.sector).arg(t.total).ignore();
            }
            pipe.query::<()>(con)
        })?;
        trace.db(format!("summary hash {} rewritten", SUMMARY_KEY));
        Ok(())
    }

    fn publish(&self, channel: &str, message: &str) -> Result<Option<usize>> {
        let receivers: i64 = self.with_conn(|con| redis::cmd("PUBLISH").arg(channel).arg(message).query(con))?;
        Ok(Some(receivers.max(0) as usize))
    }

    fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let con = self.connect()?;
        let (tx, rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let name = channel.to_string();
        let listener = thread::Builder::new()
            .name(format!("redis-sub-{}", channel))
            .spawn(move || listen(con, name, tx, ready_tx, flag))?;

        // the listener is only handed out once it is actually subscribed
        match ready_rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(Ok(())) => Ok(Subscription::new(channel, rx, cancelled, Some(listener))),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                cancelled.store(true, Ordering::SeqCst);
                Err(DbError::Unavailable(BackendKind::Redis, format!("subscribing to {} timed out", channel)))
            }
        }
    }

    fn drop_indexes(&self, trace: &mut Tracer) -> Result<()> {
        match self.with_conn(|con| redis::cmd("FT.DROPINDEX").arg(INDEX_NAME).query::<()>(con)) {
            Ok(()) => trace.db(format!("search index {} dropped", INDEX_NAME)),
            Err(DbError::Redis(e)) if !is_broken(&e) => trace.warn(format!("no index to drop: {}", e)),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn create_indexes(&self, trace: &mut Tracer) -> Result<()> {
        match self.with_conn(|con| redis::cmd("FT.CREATE").arg(INDEX_NAME).arg(&SCHEMA[..]).query::<()>(con)) {
            Ok(()) => trace.success(format!("search index {} created", INDEX_NAME)),
            Err(DbError::Redis(e)) if e.to_string().contains("already exists") => {
                trace.warn(format!("search index {} already existed", INDEX_NAME))
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn clear(&self, bucket: &str) -> Result<usize> {
        let mut keys: Vec<String> = self.list(bucket)?.iter().map(|k| doc_key(bucket, k)).collect();
        if bucket == SUMMARIES {
            keys.push(SUMMARY_KEY.to_string());
        }
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: i64 = self.with_conn(|con| redis::cmd("DEL").arg(&keys).query(con))?;
        Ok(removed.max(0) as usize)
    }

    fn put_batch(&self, bucket: &str, records: &[Record]) -> Result<usize> {
        let mut docs = Vec::with_capacity(records.len());
        for r in records {
            docs.push((doc_key(bucket, &r.key), serde_json::to_string(&r.value)?));
        }
        self.with_conn(|con| {
            let mut pipe = redis::pipe();
            for (key, doc) in &docs {
                pipe.cmd("JSON.SET").arg(key).arg("$").arg(doc).ignore();
            }
            pipe.query::<()>(con)
        })?;
        Ok(records.len())
    }
}

/// body of a subscription's listener thread: forwards every message until cancelled, the
/// receiver goes away, or the connection fails
fn listen(
    mut con: Connection,
    channel: String,
    tx: Sender<String>,
    ready: Sender<RedisResult<()>>,
    cancelled: Arc<AtomicBool>,
) {
    let mut pubsub = con.as_pubsub();
    let subscribed = pubsub
        .subscribe(&channel)
        .and_then(|_| pubsub.set_read_timeout(Some(LISTEN_POLL)));
    let ok = subscribed.is_ok();
    let _ = ready.send(subscribed);
    if !ok {
        return;
    }
    debug!("listening on {}", channel);

    while !cancelled.load(Ordering::SeqCst) {
        match pubsub.get_message() {
            Ok(msg) => match msg.get_payload::<String>() {
                Ok(payload) => {
                    if tx.send(payload).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("unreadable message on {}: {}", channel, e),
            },
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!("listener on {} stopped: {}", channel, e);
                break;
            }
        }
    }
    debug!("listener on {} exiting", channel);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clauses_use_search_syntax() {
        assert_eq!(range_clause(Index::Income, 20000, 50000), "@ingresos:[20000 50000]");
        assert_eq!(exact_clause(Index::Sector, &IndexValue::Int(2)), "@sector:[2 2]");
        assert_eq!(exact_clause(Index::Sex, &IndexValue::Bin("M".into())), "@sexo:{M}");
        assert_eq!(sector_sex_clause(1, Sex::Male), "@sector:[1 1] @sexo:{H}");
    }

    #[test]
    fn renders_native_commands() {
        let r = RedisBackend::new("redis://127.0.0.1:6379").unwrap();
        assert_eq!(r.render(&Command::Get { dni: "7".into() }), "JSON.GET poblacion:7");
        assert_eq!(
            r.render(&Command::Update { dni: "7".into(), delta: 1000 }),
            "JSON.NUMINCRBY poblacion:7 $.ingresos 1000"
        );
        assert!(r
            .render(&Command::Reindex)
            .starts_with("FT.CREATE idx_poblacion ON JSON PREFIX 1 poblacion: SCHEMA"));
    }

    #[test]
    fn unreachable_server_is_a_connection_error() {
        let r = RedisBackend::new("redis://127.0.0.1:9").unwrap();
        assert_eq!(r.ping().unwrap_err().kind(), crate::error::ErrorKind::Connection);
    }
}
