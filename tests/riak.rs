use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use dbcmp::model::{PEOPLE, SUMMARIES, SUMMARY_KEY};
use dbcmp::{
    Backend, BackendKind, Backends, Dataset, DbError, Dispatcher, ErrorKind, Operation, Params, RiakBackend,
    DEFAULT_INCOME_DELTA,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// one stored object: its JSON body and the secondary index headers it was written with
#[derive(Debug, Clone)]
struct Stored {
    body: Value,
    indexes: BTreeMap<String, String>,
}

type Store = Arc<Mutex<BTreeMap<(String, String), Stored>>>;

/// the subset of the Riak HTTP interface the adapter uses, served from memory. GETs on the
/// `broken` bucket answer 500.
struct FakeRiak {
    addr: SocketAddr,
    store: Store,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FakeRiak {
    fn start() -> FakeRiak {
        let store = Store::default();
        let app = Router::new()
            .route("/ping", get(|| async { "OK" }))
            .route("/buckets/{bucket}/keys", get(list_keys))
            .route("/buckets/{bucket}/keys/{key}", get(fetch).put(store_object).delete(remove))
            .route("/buckets/{bucket}/index/{index}/{value}", get(index_exact))
            .route("/buckets/{bucket}/index/{index}/{min}/{max}", get(index_range))
            .with_state(store.clone());

        let (addr_tx, addr_rx) = mpsc::channel();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async move {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                addr_tx.send(listener.local_addr().unwrap()).unwrap();
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = stopped.await;
                    })
                    .await
                    .unwrap();
            });
        });
        FakeRiak {
            addr: addr_rx.recv().unwrap(),
            store,
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    fn backend(&self) -> RiakBackend {
        RiakBackend::new(&format!("http://{}", self.addr)).unwrap()
    }

    fn dispatcher(&self) -> Dispatcher {
        let backends = Backends::new().with(Arc::new(self.backend()));
        Dispatcher::new(backends, Dataset::builtin().unwrap(), DEFAULT_INCOME_DELTA)
    }

    fn stored(&self, bucket: &str, key: &str) -> Option<Stored> {
        self.store.lock().unwrap().get(&(bucket.to_string(), key.to_string())).cloned()
    }
}

impl Drop for FakeRiak {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn keys_where<F>(store: &Store, bucket: &str, pred: F) -> Json<Value>
where
    F: Fn(&Stored) -> bool,
{
    let keys: Vec<String> = store
        .lock()
        .unwrap()
        .iter()
        .filter(|((b, _), stored)| b == bucket && pred(stored))
        .map(|((_, k), _)| k.clone())
        .collect();
    Json(json!({ "keys": keys }))
}

async fn list_keys(State(store): State<Store>, Path(bucket): Path<String>) -> Json<Value> {
    keys_where(&store, &bucket, |_| true)
}

async fn fetch(State(store): State<Store>, Path((bucket, key)): Path<(String, String)>) -> Response {
    if bucket == "broken" {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let found = store.lock().unwrap().get(&(bucket, key)).map(|s| s.body.clone());
    match found {
        Some(body) => Json(body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn store_object(
    State(store): State<Store>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let indexes = headers
        .iter()
        .filter_map(|(name, value)| {
            name.as_str()
                .strip_prefix("x-riak-index-")
                .map(|index| (index.to_string(), value.to_str().unwrap_or_default().to_string()))
        })
        .collect();
    store.lock().unwrap().insert((bucket, key), Stored { body, indexes });
    StatusCode::NO_CONTENT
}

async fn remove(State(store): State<Store>, Path((bucket, key)): Path<(String, String)>) -> StatusCode {
    match store.lock().unwrap().remove(&(bucket, key)) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

async fn index_exact(
    State(store): State<Store>,
    Path((bucket, index, value)): Path<(String, String, String)>,
) -> Json<Value> {
    keys_where(&store, &bucket, |s| s.indexes.get(&index) == Some(&value))
}

async fn index_range(
    State(store): State<Store>,
    Path((bucket, index, min, max)): Path<(String, String, i64, i64)>,
) -> Json<Value> {
    keys_where(&store, &bucket, |s| {
        s.indexes
            .get(&index)
            .and_then(|v| v.parse::<i64>().ok())
            .map_or(false, |v| (min..=max).contains(&v))
    })
}

fn dnis(data: &Value) -> Vec<String> {
    let mut ids: Vec<String> = data
        .as_array()
        .expect("an array of people")
        .iter()
        .map(|p| p["dni"].as_str().unwrap().to_string())
        .collect();
    ids.sort();
    ids
}

fn run(d: &Dispatcher, op: Operation, params: &Params) -> dbcmp::Response {
    d.execute(op, BackendKind::Riak, params)
}

#[test]
fn insert_writes_index_headers_and_reads_back() {
    let riak = FakeRiak::start();
    let d = riak.dispatcher();
    let params = Params {
        dni: "555888999".to_string(),
        ..Params::default()
    };
    assert!(run(&d, Operation::Insert, &params).is_ok());

    let stored = riak.stored(PEOPLE, "555888999").unwrap();
    assert_eq!(stored.indexes["ingresos_int"], "30000");
    assert_eq!(stored.indexes["sector_int"], "2");
    assert_eq!(stored.indexes["sexo_bin"], "M");

    let get = run(&d, Operation::Get, &params);
    assert_eq!(
        get.data,
        json!({"dni": "555888999", "nombre": "Laura", "ingresos": 30000, "sector": 2, "sexo": "M"})
    );

    let again = run(&d, Operation::Insert, &params);
    assert_eq!(again.error.unwrap().kind, ErrorKind::DuplicateKey);
}

#[test]
fn deleted_key_reads_as_absent() {
    let riak = FakeRiak::start();
    let d = riak.dispatcher();
    let params = Params {
        dni: "42".to_string(),
        ..Params::default()
    };
    run(&d, Operation::Insert, &params);

    assert_eq!(run(&d, Operation::Delete, &params).data["deleted"], json!(true));
    let get = run(&d, Operation::Get, &params);
    assert!(get.is_ok());
    assert_eq!(get.data, Value::Null);
    assert_eq!(run(&d, Operation::Delete, &params).data["deleted"], json!(false));
}

#[test]
fn range_and_filter_go_through_secondary_indexes() {
    let riak = FakeRiak::start();
    let d = riak.dispatcher();
    assert!(d.load_all().msg.starts_with("dataset loaded into 1 of 1"));

    let expected: Vec<String> = {
        let mut ids: Vec<String> = Dataset::builtin()
            .unwrap()
            .people
            .iter()
            .filter(|p| (20000..=50000).contains(&p.income))
            .map(|p| p.national_id.clone())
            .collect();
        ids.sort();
        ids
    };
    let range = run(&d, Operation::RangeQuery, &Params::default());
    assert_eq!(dnis(&range.data), expected);

    let filter = run(&d, Operation::FilterQuery, &Params::default());
    assert_eq!(dnis(&filter.data), vec!["666777888", "666999333"]);
}

#[test]
fn aggregate_stores_the_summary_object() {
    let riak = FakeRiak::start();
    let d = riak.dispatcher();
    d.load_all();

    let resp = run(&d, Operation::Aggregate, &Params::default());
    assert!(resp.is_ok());
    let summary = riak.stored(SUMMARIES, SUMMARY_KEY).unwrap();
    assert_eq!(summary.body["2"], resp.data["total"]);
    assert!(summary.indexes.is_empty());
}

#[test]
fn keys_cannot_reach_other_buckets() {
    let riak = FakeRiak::start();
    let d = riak.dispatcher();
    d.load_all();

    let sneaky = Params {
        dni: "x/../../../sectores/keys/1".to_string(),
        ..Params::default()
    };
    let resp = run(&d, Operation::Delete, &sneaky);
    assert_eq!(resp.data["deleted"], json!(false));
    assert!(riak.stored("sectores", "1").is_some());

    let dots = Params {
        dni: "..".to_string(),
        ..Params::default()
    };
    assert_eq!(run(&d, Operation::Get, &dots).error.unwrap().kind, ErrorKind::MalformedQuery);
}

#[test]
fn http_statuses_map_onto_results() {
    let riak = FakeRiak::start();
    let backend = riak.backend();
    assert!(backend.ping().is_ok());
    assert_eq!(backend.get(PEOPLE, "nobody").unwrap(), None);
    assert!(!backend.delete(PEOPLE, "nobody").unwrap());
    assert!(backend.list(PEOPLE).unwrap().is_empty());

    let err = backend.get("broken", "1").unwrap_err();
    assert!(matches!(err, DbError::Status { status: 500, .. }), "{:?}", err);
    assert_eq!(err.kind(), ErrorKind::Other);
}
