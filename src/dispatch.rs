//! Routes `(operation, backend, params)` to one adapter and assembles the response envelope.
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::backend::{Backend, BackendKind, Backends};
use crate::command::{Command, LoadResponse, Operation, Params, Response};
use crate::dataset::Dataset;
use crate::loader;
use crate::model::NEW_PERSON_CHANNEL;
use crate::trace::Tracer;
use crate::{DbError, Result};

/// default income increment applied by the update operation
pub const DEFAULT_INCOME_DELTA: i64 = 1000;

/// Runs operations against the configured backends.
///
/// Every call affects exactly one backend and never fails outright: errors end up in the
/// returned envelope, as an error-marked trace line and in its `error` field.
#[derive(Debug)]
pub struct Dispatcher {
    backends: Backends,
    dataset: Dataset,
    income_delta: i64,
}

impl Dispatcher {
    /// a dispatcher over `backends`; updates add `income_delta`
    pub fn new(backends: Backends, dataset: Dataset, income_delta: i64) -> Self {
        Dispatcher {
            backends,
            dataset,
            income_delta,
        }
    }

    /// the configured backends
    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    fn backend(&self, kind: BackendKind) -> Result<&dyn Backend> {
        self.backends
            .get(kind)
            .map(|b| b.as_ref())
            .ok_or_else(|| DbError::Unavailable(kind, "backend is not configured".to_string()))
    }

    /// runs `op` on `kind`
    #[instrument(skip(self, params))]
    pub fn execute(&self, op: Operation, kind: BackendKind, params: &Params) -> Response {
        let mut trace = Tracer::new(kind.name());
        let backend = match self.backend(kind) {
            Ok(backend) => backend,
            Err(e) => return Response::failed(trace, &e),
        };
        let cmd = match Command::build(op, params, self.income_delta) {
            Ok(cmd) => cmd,
            Err(e) => return Response::failed(trace, &e),
        };
        trace.query(backend.render(&cmd));
        trace.info(format!("running {}", op));

        match run(backend, &cmd, &mut trace) {
            Ok(data) => Response::ok(trace, data),
            Err(e) => {
                debug!("{} on {} failed: {}", op, kind, e);
                Response::failed(trace, &e)
            }
        }
    }

    /// like [`Dispatcher::execute`], but with the operation, backend and parameters still in
    /// their textual form, as they arrive from a URL or command line
    pub fn execute_named(&self, op: &str, backend: &str, pairs: &HashMap<String, String>) -> Response {
        let kind = match backend.parse::<BackendKind>() {
            Ok(kind) => kind,
            Err(e) => return Response::rejected(backend, &e),
        };
        let parsed = op
            .parse::<Operation>()
            .and_then(|op| Params::from_pairs(pairs).map(|params| (op, params)));
        match parsed {
            Ok((op, params)) => self.execute(op, kind, &params),
            Err(e) => Response::rejected(kind.name(), &e),
        }
    }

    /// seeds every configured backend with the dataset
    pub fn load_all(&self) -> LoadResponse {
        loader::load_all(&self.backends, &self.dataset)
    }

    /// subscribes to `channel` on `kind` and waits at most `timeout` for one message
    pub fn listen(&self, kind: BackendKind, channel: &str, timeout: Duration) -> Response {
        let mut trace = Tracer::new(kind.name());
        let backend = match self.backend(kind) {
            Ok(backend) => backend,
            Err(e) => return Response::failed(trace, &e),
        };
        trace.query(format!("SUBSCRIBE {}", channel));
        let mut sub = match backend.subscribe(channel) {
            Ok(sub) => sub,
            Err(e) => return Response::failed(trace, &e),
        };
        trace.pubsub(format!("subscribed to {}, waiting up to {} ms", channel, timeout.as_millis()));
        let received = sub.recv_timeout(timeout);
        sub.cancel();
        match received {
            Ok(Some(message)) => {
                trace.pubsub(format!("event received: {}", message));
                Response::ok(trace, json!({ "channel": channel, "message": message }))
            }
            Ok(None) => {
                trace.warn("no event arrived before the timeout");
                Response::ok(trace, Value::Null)
            }
            Err(e) => Response::failed(trace, &e),
        }
    }

    /// `"up"` or the health check error, per configured backend
    pub fn health(&self) -> BTreeMap<BackendKind, String> {
        self.backends
            .health()
            .into_iter()
            .map(|(kind, status)| {
                let status = match status {
                    Ok(()) => "up".to_string(),
                    Err(e) => e.to_string(),
                };
                (kind, status)
            })
            .collect()
    }
}

fn run(backend: &dyn Backend, cmd: &Command, trace: &mut Tracer) -> Result<Value> {
    match cmd {
        Command::List => {
            let people = backend.list_people(trace)?;
            trace.success(format!("{} records found", people.len()));
            Ok(serde_json::to_value(people)?)
        }
        Command::Get { dni } => match backend.get_person(dni)? {
            Some(person) => {
                trace.success(format!("{} found", dni));
                Ok(serde_json::to_value(person)?)
            }
            None => {
                trace.error(format!("{} not found", dni));
                Ok(Value::Null)
            }
        },
        Command::Insert { person } => {
            backend.insert_person(person, trace)?;
            trace.success(format!("{} inserted", person.national_id));
            announce(backend, &person.joined_message(), trace);
            Ok(json!({ "inserted": true, "record": person }))
        }
        Command::Update { dni, delta } => match backend.increment_income(dni, *delta, trace)? {
            Some(person) => {
                trace.success(format!("income of {} is now {}", dni, person.income));
                Ok(serde_json::to_value(person)?)
            }
            None => Err(DbError::NotFound(dni.clone())),
        },
        Command::Delete { dni } => {
            let removed = backend.delete_person(dni)?;
            if removed {
                trace.success(format!("{} deleted", dni));
            } else {
                trace.warn(format!("{} did not exist", dni));
            }
            Ok(json!({ "dni": dni, "deleted": removed }))
        }
        Command::Reindex => backend.reindex(trace),
        Command::RangeQuery { min, max } => {
            let people = backend.income_range(*min, *max, trace)?;
            trace.success(format!("{} records with income in [{}, {}]", people.len(), min, max));
            Ok(serde_json::to_value(people)?)
        }
        Command::FilterQuery { sector, sex } => {
            let people = backend.filter_sector_sex(*sector, *sex, trace)?;
            trace.success(format!("{} records in sector {} with sex {}", people.len(), sector, sex));
            Ok(serde_json::to_value(people)?)
        }
        Command::Aggregate { sector } => {
            let totals = backend.income_by_sector(trace)?;
            let total = totals
                .iter()
                .find(|t| t.sector == *sector)
                .map(|t| t.total)
                .unwrap_or(0);
            trace.success(format!("sector {} earns {} in total", sector, total));
            Ok(json!({ "sector": sector, "total": total, "by_sector": totals }))
        }
    }
}

/// publishes a new-person event; a failure here never fails the insert
fn announce(backend: &dyn Backend, message: &str, trace: &mut Tracer) {
    match backend.publish(NEW_PERSON_CHANNEL, message) {
        Ok(Some(receivers)) => trace.pubsub(format!(
            "'{}' published on {} to {} subscribers",
            message, NEW_PERSON_CHANNEL, receivers
        )),
        Ok(None) => trace.pubsub(format!("no native pub/sub, event '{}' not delivered", message)),
        Err(e) => trace.warn(format!("event could not be published: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::error::ErrorKind;
    use std::sync::Arc;

    fn dispatcher() -> Dispatcher {
        let backends = Backends::new().with(Arc::new(MemoryBackend::new()));
        Dispatcher::new(backends, Dataset::builtin().unwrap(), DEFAULT_INCOME_DELTA)
    }

    #[test]
    fn names_are_parsed_before_dispatch() {
        let d = dispatcher();
        let resp = d.execute_named("listar", "memory", &HashMap::new());
        assert!(resp.is_ok());
        assert_eq!(resp.data, json!([]));
        assert_eq!(resp.query_str.as_deref(), Some("for key in store.keys(\"poblacion\"):\n    store.get(\"poblacion\", key)"));

        let resp = d.execute_named("truncate", "memory", &HashMap::new());
        assert_eq!(resp.error.unwrap().kind, ErrorKind::MalformedQuery);
    }

    #[test]
    fn missing_backend_is_a_connection_error() {
        let resp = dispatcher().execute(Operation::List, BackendKind::Redis, &Params::default());
        assert_eq!(resp.error.unwrap().kind, ErrorKind::Connection);
        assert!(resp.trace[0].starts_with("[REDIS] [error]"));
    }

    #[test]
    fn health_reports_up() {
        assert_eq!(dispatcher().health()[&BackendKind::Memory], "up");
    }
}
