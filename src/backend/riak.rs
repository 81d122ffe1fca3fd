use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{Backend, BackendKind};
use crate::command::Command;
use crate::model::{Index, IndexEntry, IndexValue};
use crate::{DbError, Result};

// liveness checks give up quickly, regular calls wait longer
const PING_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// body of the key listing and secondary index endpoints
#[derive(Debug, Deserialize)]
struct KeyList {
    #[serde(default)]
    keys: Vec<String>,
}

/// Adapter for a Riak node, spoken to over its HTTP interface.
///
/// Every call is one synchronous request. Secondary index values travel as
/// `x-riak-index-{name}` headers on writes, and index queries return bare keys, so reading the
/// matching records costs one extra GET per key.
#[derive(Debug, Clone)]
pub struct RiakBackend {
    base_url: Url,
    client: Client,
}

impl RiakBackend {
    /// creates an adapter for the node at `base_url`, e.g. `http://localhost:8098`
    ///
    /// # Errors
    /// `DbError::Parsing` if `base_url` is not an absolute http(s) url
    #[instrument]
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| DbError::Parsing(format!("'{}' as a Riak url", base_url)))?;
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        debug!("riak client ready");
        Ok(RiakBackend { base_url, client })
    }

    /// the base url followed by `segments`, each one percent-encoded so that `/`, `?` or `#`
    /// inside a key never change which resource is addressed
    fn url(&self, segments: &[&str]) -> Result<Url> {
        if let Some(bad) = segments.iter().find(|s| matches!(**s, "" | "." | "..")) {
            return Err(DbError::MalformedQuery(format!("'{}' is not a usable bucket or key", bad)));
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DbError::Parsing(format!("'{}' as a Riak url", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn key_url(&self, bucket: &str, key: &str) -> Result<Url> {
        self.url(&["buckets", bucket, "keys", key])
    }

    fn keys_url(&self, bucket: &str) -> Result<Url> {
        let mut url = self.url(&["buckets", bucket, "keys"])?;
        url.set_query(Some("keys=true"));
        Ok(url)
    }

    fn index_url(&self, bucket: &str, index: Index, value: &str) -> Result<Url> {
        self.url(&["buckets", bucket, "index", index.riak_name(), value])
    }

    fn range_url(&self, bucket: &str, index: Index, min: i64, max: i64) -> Result<Url> {
        self.url(&[
            "buckets",
            bucket,
            "index",
            index.riak_name(),
            &min.to_string(),
            &max.to_string(),
        ])
    }

    fn fetch_keys(&self, url: Url) -> Result<Vec<String>> {
        debug!("GET {}", url);
        let resp = check(self.client.get(url.clone()).send()?, &url)?;
        Ok(resp.json::<KeyList>()?.keys)
    }
}

/// a url for display in the rendered query text
fn shown(url: Result<Url>) -> String {
    match url {
        Ok(url) => url.to_string(),
        Err(e) => format!("<{}>", e),
    }
}

/// turns any non-success status into a typed error
fn check(resp: Response, url: &Url) -> Result<Response> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(DbError::Status {
            status: resp.status().as_u16(),
            url: url.to_string(),
        })
    }
}

/// the header carrying one secondary index value
fn index_header(index: Index) -> String {
    format!("x-riak-index-{}", index.riak_name())
}

impl Backend for RiakBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Riak
    }

    fn ping(&self) -> Result<()> {
        let url = self.url(&["ping"])?;
        let resp = self
            .client
            .get(url)
            .timeout(PING_TIMEOUT)
            .send()
            .map_err(|e| DbError::Unavailable(BackendKind::Riak, e.to_string()))?;
        if resp.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(DbError::Unavailable(
                BackendKind::Riak,
                format!("/ping answered {}", resp.status()),
            ))
        }
    }

    fn render(&self, cmd: &Command) -> String {
        let people = crate::model::PEOPLE;
        match cmd {
            Command::List => format!("GET {}\n# then GET every key", shown(self.keys_url(people))),
            Command::Get { dni } => format!("GET {}", shown(self.key_url(people, dni))),
            Command::Insert { person } => format!(
                "PUT {}\nContent-Type: application/json\n{}: {}\n{}: {}\n{}: {}",
                shown(self.key_url(people, &person.national_id)),
                index_header(Index::Income),
                person.income,
                index_header(Index::Sector),
                person.sector,
                index_header(Index::Sex),
                person.sex
            ),
            Command::Update { dni, delta } => format!(
                "GET {url}\n# ingresos += {delta} in memory\nPUT {url}  (with x-riak-index-* headers)",
                url = shown(self.key_url(people, dni)),
                delta = delta
            ),
            Command::Delete { dni } => format!("DELETE {}", shown(self.key_url(people, dni))),
            Command::Reindex => format!(
                "GET {}\n# for every key: GET, then PUT with x-riak-index-* headers",
                shown(self.keys_url(people))
            ),
            Command::RangeQuery { min, max } => format!(
                "GET {}\n# then GET every key",
                shown(self.range_url(people, Index::Income, *min, *max))
            ),
            Command::FilterQuery { sector, sex } => format!(
                "GET {}\n# then GET every key and keep sexo == '{}' client-side",
                shown(self.index_url(people, Index::Sector, &sector.to_string())),
                sex
            ),
            Command::Aggregate { sector } => format!(
                "GET {}\n# GET every key, sum ingresos per sector client-side (sector {})\nPUT {}",
                shown(self.keys_url(people)),
                sector,
                shown(self.key_url(crate::model::SUMMARIES, crate::model::SUMMARY_KEY))
            ),
        }
    }

    fn list(&self, bucket: &str) -> Result<Vec<String>> {
        self.fetch_keys(self.keys_url(bucket)?)
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Value>> {
        let url = self.key_url(bucket, key)?;
        debug!("GET {}", url);
        let resp = self.client.get(url.clone()).send()?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(resp, &url)?.json()?))
    }

    fn put(&self, bucket: &str, key: &str, record: &Value, indexes: &[IndexEntry]) -> Result<()> {
        let url = self.key_url(bucket, key)?;
        debug!("PUT {} with {} indexes", url, indexes.len());
        let mut req = self.client.put(url.clone()).json(record);
        for (index, value) in indexes {
            req = req.header(index_header(*index), value.to_string());
        }
        check(req.send()?, &url)?;
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        let url = self.key_url(bucket, key)?;
        debug!("DELETE {}", url);
        let resp = self.client.delete(url.clone()).send()?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(resp, &url)?;
        Ok(true)
    }

    fn query_exact(&self, bucket: &str, index: Index, value: &IndexValue) -> Result<Vec<String>> {
        self.fetch_keys(self.index_url(bucket, index, &value.to_string())?)
    }

    fn query_range(&self, bucket: &str, index: Index, min: i64, max: i64) -> Result<Vec<String>> {
        self.fetch_keys(self.range_url(bucket, index, min, max)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Person, Sex};

    fn riak() -> RiakBackend {
        RiakBackend::new("http://localhost:8098/").unwrap()
    }

    #[test]
    fn urls_follow_the_http_interface() {
        let r = riak();
        assert_eq!(
            r.key_url("poblacion", "1").unwrap().as_str(),
            "http://localhost:8098/buckets/poblacion/keys/1"
        );
        assert_eq!(
            r.keys_url("sectores").unwrap().as_str(),
            "http://localhost:8098/buckets/sectores/keys?keys=true"
        );
        assert_eq!(
            r.range_url("poblacion", Index::Income, 20000, 50000).unwrap().as_str(),
            "http://localhost:8098/buckets/poblacion/index/ingresos_int/20000/50000"
        );
        assert_eq!(
            r.index_url("poblacion", Index::Sex, "M").unwrap().as_str(),
            "http://localhost:8098/buckets/poblacion/index/sexo_bin/M"
        );
    }

    #[test]
    fn keys_stay_inside_their_path_segment() {
        let r = riak();
        let url = r.key_url("poblacion", "1?x=2").unwrap();
        assert_eq!(url.query(), None);
        assert_eq!(url.path_segments().unwrap().count(), 4);
        assert_eq!(url.path(), "/buckets/poblacion/keys/1%3Fx=2");

        let url = r.key_url("poblacion", "../sectores/keys/1").unwrap();
        assert_eq!(url.path(), "/buckets/poblacion/keys/..%2Fsectores%2Fkeys%2F1");

        assert_eq!(
            r.key_url("poblacion", "..").unwrap_err().kind(),
            crate::error::ErrorKind::MalformedQuery
        );
        assert!(r.key_url("poblacion", "").is_err());
    }

    #[test]
    fn base_url_may_carry_a_path_prefix() {
        let r = RiakBackend::new("http://db.local/riak/").unwrap();
        assert_eq!(
            r.key_url("poblacion", "7").unwrap().as_str(),
            "http://db.local/riak/buckets/poblacion/keys/7"
        );
        assert!(RiakBackend::new("not a url").is_err());
    }

    #[test]
    fn insert_renders_index_headers() {
        let cmd = Command::Insert {
            person: Person::new("9", "Ana", 1200, 3, Sex::Female),
        };
        let text = riak().render(&cmd);
        assert!(text.starts_with("PUT http://localhost:8098/buckets/poblacion/keys/9"));
        assert!(text.contains("x-riak-index-ingresos_int: 1200"));
        assert!(text.contains("x-riak-index-sexo_bin: M"));
    }

    #[test]
    fn unreachable_node_is_a_connection_error() {
        let r = RiakBackend::new("http://127.0.0.1:9").unwrap();
        let err = r.ping().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connection);
    }
}
