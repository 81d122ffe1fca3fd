use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::{Html, Json};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::backend::BackendKind;
use crate::command::{LoadResponse, Response};
use crate::dispatch::Dispatcher;
use crate::model::NEW_PERSON_CHANNEL;
use crate::thread_pool::ThreadPool;
use crate::{DbError, Result};

const INDEX_HTML: &str = include_str!("../static/index.html");
const DEFAULT_WAIT_MS: u64 = 5_000;
const MAX_WAIT_MS: u64 = 30_000;

/// An HTTP front end over a [`Dispatcher`].
///
/// Requests are accepted on the async runtime, but the dispatcher work itself (which blocks on
/// the backends) is handed to a [`ThreadPool`] and the handler awaits its result. Every
/// endpoint except `/` answers JSON with status 200; failures are described inside the body.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use dbcmp::{Config, DemoServer};
/// use dbcmp::thread_pool::{SharedQueueThreadPool, ThreadPool};
/// # fn main() -> dbcmp::Result<()> {
/// let dispatcher = Arc::new(Config::default().dispatcher()?);
/// let server = DemoServer::new(dispatcher, SharedQueueThreadPool::new(4)?);
/// let rt = tokio::runtime::Runtime::new()?;
/// rt.block_on(server.run("127.0.0.1:8000".parse().unwrap()))?;
/// # Ok(())
/// # }
/// ```
pub struct DemoServer<P: ThreadPool> {
    dispatcher: Arc<Dispatcher>,
    pool: P,
}

struct AppState<P> {
    dispatcher: Arc<Dispatcher>,
    pool: P,
}

/// query parameters of `/events/{backend}`
#[derive(Debug, Default, Deserialize)]
struct EventParams {
    channel: Option<String>,
    timeout_ms: Option<u64>,
}

impl<P: ThreadPool + Send + Sync + 'static> DemoServer<P> {
    /// a server running `dispatcher` calls on `pool`
    pub fn new(dispatcher: Arc<Dispatcher>, pool: P) -> Self {
        DemoServer { dispatcher, pool }
    }

    /// the routes, ready to be served
    pub fn router(self) -> Router {
        let state = Arc::new(AppState {
            dispatcher: self.dispatcher,
            pool: self.pool,
        });
        Router::new()
            .route("/", get(index))
            .route("/load-data", get(load_data::<P>))
            .route("/execute/{operation}/{backend}", get(execute::<P>))
            .route("/events/{backend}", get(events::<P>))
            .route("/health", get(health::<P>))
            .with_state(state)
    }

    /// binds `addr` and serves until ctrl-c
    ///
    /// # Errors
    /// returns [`DbError::Io`] if the address cannot be bound
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// serves on an already bound `listener` until `shutdown` completes
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("could not listen for ctrl-c: {}", e);
    }
    info!("shutdown requested");
}

/// runs `job` on the pool and waits for its result without blocking the runtime
async fn offload<P, T, F>(pool: &P, job: F) -> Result<T>
where
    P: ThreadPool,
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    pool.spawn(move || {
        let _ = tx.send(job());
    });
    rx.await
        .map_err(|_| DbError::StringErr("the worker running the request went away".to_string()))
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn load_data<P: ThreadPool + Send + Sync + 'static>(State(state): State<Arc<AppState<P>>>) -> Json<LoadResponse> {
    let dispatcher = state.dispatcher.clone();
    match offload(&state.pool, move || dispatcher.load_all()).await {
        Ok(resp) => Json(resp),
        Err(e) => Json(LoadResponse {
            trace: vec![format!("[SYSTEM] [error] {}", e)],
            msg: "load aborted".to_string(),
        }),
    }
}

async fn execute<P: ThreadPool + Send + Sync + 'static>(
    State(state): State<Arc<AppState<P>>>,
    Path((operation, backend)): Path<(String, String)>,
    Query(pairs): Query<HashMap<String, String>>,
) -> Json<Response> {
    debug!("execute {} on {} with {:?}", operation, backend, pairs);
    let dispatcher = state.dispatcher.clone();
    let source = backend.clone();
    let job = move || dispatcher.execute_named(&operation, &backend, &pairs);
    match offload(&state.pool, job).await {
        Ok(resp) => Json(resp),
        Err(e) => Json(Response::rejected(&source, &e)),
    }
}

async fn events<P: ThreadPool + Send + Sync + 'static>(
    State(state): State<Arc<AppState<P>>>,
    Path(backend): Path<String>,
    Query(params): Query<EventParams>,
) -> Json<Response> {
    let kind = match backend.parse::<BackendKind>() {
        Ok(kind) => kind,
        Err(e) => return Json(Response::rejected(&backend, &e)),
    };
    let channel = params.channel.unwrap_or_else(|| NEW_PERSON_CHANNEL.to_string());
    let wait = wait_time(params.timeout_ms);
    let dispatcher = state.dispatcher.clone();
    match offload(&state.pool, move || dispatcher.listen(kind, &channel, wait)).await {
        Ok(resp) => Json(resp),
        Err(e) => Json(Response::rejected(kind.name(), &e)),
    }
}

async fn health<P: ThreadPool + Send + Sync + 'static>(
    State(state): State<Arc<AppState<P>>>,
) -> Json<BTreeMap<BackendKind, String>> {
    let dispatcher = state.dispatcher.clone();
    match offload(&state.pool, move || dispatcher.health()).await {
        Ok(status) => Json(status),
        Err(e) => Json(
            state
                .dispatcher
                .backends()
                .kinds()
                .into_iter()
                .map(|kind| (kind, e.to_string()))
                .collect(),
        ),
    }
}

/// how long an event request may wait, capped so a request cannot pin a worker indefinitely
fn wait_time(requested_ms: Option<u64>) -> Duration {
    Duration::from_millis(requested_ms.unwrap_or(DEFAULT_WAIT_MS).min(MAX_WAIT_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_waits_are_capped() {
        assert_eq!(wait_time(None), Duration::from_secs(5));
        assert_eq!(wait_time(Some(250)), Duration::from_millis(250));
        assert_eq!(wait_time(Some(600_000)), Duration::from_secs(30));
    }
}
