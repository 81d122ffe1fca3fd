//! Seeds every configured backend with the same dataset.
//!
//! Loading is destructive then additive: each backend has its search indexes dropped and its
//! buckets emptied before the sectors and people are written back, so running it twice leaves
//! the stores exactly as running it once. Backends are loaded one after the other; a backend
//! that fails its health check is skipped and the others are still loaded.
use tracing::{info, warn};

use crate::backend::{Backend, Backends, Record};
use crate::command::LoadResponse;
use crate::dataset::Dataset;
use crate::model::{PEOPLE, SECTORS, SUMMARIES};
use crate::trace::Tracer;
use crate::Result;

/// loads `dataset` into every backend of `backends`
pub fn load_all(backends: &Backends, dataset: &Dataset) -> LoadResponse {
    let mut trace = Tracer::new("system");
    trace.info(format!("loading into {} backends", backends.kinds().len()));

    let (sectors, people) = match records(dataset) {
        Ok(records) => records,
        Err(e) => {
            trace.error(format!("dataset could not be prepared: {}", e));
            let (trace, _, _) = trace.finish();
            return LoadResponse {
                trace,
                msg: "load aborted".to_string(),
            };
        }
    };

    let mut loaded = 0;
    for backend in backends.iter() {
        let kind = backend.kind();
        if let Err(e) = backend.ping() {
            warn!("skipping {}: {}", kind, e);
            trace.warn(format!("{} skipped: {}", kind, e));
            continue;
        }
        match load_one(backend.as_ref(), &sectors, &people, &mut trace) {
            Ok(count) => {
                info!("{} loaded with {} people", kind, count);
                trace.success(format!("{}: {} people and {} sectors loaded", kind, count, sectors.len()));
                loaded += 1;
            }
            Err(e) => trace.error(format!("{}: load failed: {}", kind, e)),
        }
    }

    let total = backends.kinds().len();
    let (trace, _, elapsed) = trace.finish();
    LoadResponse {
        trace,
        msg: format!("dataset loaded into {} of {} backends in {} ms", loaded, total, elapsed),
    }
}

/// the sectors keyed by code and the de-duplicated people keyed by national id
fn records(dataset: &Dataset) -> Result<(Vec<Record>, Vec<Record>)> {
    let sectors = dataset
        .sectors
        .iter()
        .map(|s| {
            Ok(Record {
                key: s.code.to_string(),
                value: serde_json::to_value(s)?,
                indexes: Vec::new(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let people = dataset
        .unique_people()
        .iter()
        .map(Record::person)
        .collect::<Result<Vec<_>>>()?;
    Ok((sectors, people))
}

fn load_one(backend: &dyn Backend, sectors: &[Record], people: &[Record], trace: &mut Tracer) -> Result<usize> {
    let kind = backend.kind();
    backend.drop_indexes(trace)?;
    for bucket in [PEOPLE, SECTORS, SUMMARIES] {
        let removed = backend.clear(bucket)?;
        trace.db(format!("{}: {} records removed from {}", kind, removed, bucket));
    }
    backend.put_batch(SECTORS, sectors)?;
    let written = backend.put_batch(PEOPLE, people)?;
    trace.net(format!("{}: {} people written", kind, written));
    backend.create_indexes(trace)?;
    backend.count(PEOPLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::sync::Arc;

    #[test]
    fn records_are_keyed_by_code_and_id() {
        let ds = Dataset::builtin().unwrap();
        let (sectors, people) = records(&ds).unwrap();
        assert_eq!(sectors.len(), 4);
        assert_eq!(sectors[0].key, ds.sectors[0].code.to_string());
        assert_eq!(people.len(), ds.unique_people().len());
        assert_eq!(people[0].indexes.len(), 3);
    }

    #[test]
    fn loader_reports_every_backend() {
        let mem = Arc::new(MemoryBackend::new());
        let backends = Backends::new().with(mem.clone());
        let resp = load_all(&backends, &Dataset::builtin().unwrap());
        assert!(resp.msg.starts_with("dataset loaded into 1 of 1 backends"));
        assert!(resp.trace.iter().all(|line| line.starts_with("[SYSTEM]")));
        assert_eq!(mem.count(PEOPLE).unwrap(), 19);
        assert_eq!(mem.count(SECTORS).unwrap(), 4);
    }
}
