//! Command line / environment configuration shared by both binaries.
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Arg, ArgMatches};
use tracing::{info, warn};

use crate::backend::{Backend, BackendKind, Backends, MemoryBackend, MongoBackend, RedisBackend, RiakBackend};
use crate::dataset::Dataset;
use crate::dispatch::{Dispatcher, DEFAULT_INCOME_DELTA};
use crate::{DbError, Result};

/// backends used when none are given
pub const DEFAULT_BACKENDS: &str = "riak,redis,mongo";
/// default Riak HTTP endpoint
pub const DEFAULT_RIAK_URL: &str = "http://localhost:8098";
/// default Redis url
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
/// default MongoDB connection string
pub const DEFAULT_MONGO_URI: &str = "mongodb://localhost:27017/?serverSelectionTimeoutMS=3000";
/// default MongoDB database
pub const DEFAULT_MONGO_DB: &str = "practica_db";

/// Where the backends live and how operations behave.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// backends to register, in no particular order
    pub backends: Vec<BackendKind>,
    /// Riak HTTP endpoint
    pub riak_url: String,
    /// Redis url
    pub redis_url: String,
    /// MongoDB connection string
    pub mongo_uri: String,
    /// MongoDB database name
    pub mongo_db: String,
    /// amount the update operation adds to a person's income
    pub income_delta: i64,
    /// directory holding `poblacion.json` and `sectores.json`; the built-in dataset if `None`
    pub dataset_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backends: vec![BackendKind::Riak, BackendKind::Redis, BackendKind::Mongo],
            riak_url: DEFAULT_RIAK_URL.to_string(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            mongo_uri: DEFAULT_MONGO_URI.to_string(),
            mongo_db: DEFAULT_MONGO_DB.to_string(),
            income_delta: DEFAULT_INCOME_DELTA,
            dataset_dir: None,
        }
    }
}

impl Config {
    /// the arguments understood by [`Config::from_matches`]. Each one falls back to an
    /// environment variable, then to its default.
    pub fn args() -> Vec<Arg<'static, 'static>> {
        vec![
            Arg::with_name("backends")
                .long("backends")
                .value_name("LIST")
                .env("DBCMP_BACKENDS")
                .help("comma separated backends to use: riak, redis, mongo, memory")
                .default_value(DEFAULT_BACKENDS)
                .global(true),
            Arg::with_name("riak-url")
                .long("riak-url")
                .value_name("URL")
                .env("DBCMP_RIAK_URL")
                .help("base url of the Riak HTTP interface")
                .default_value(DEFAULT_RIAK_URL)
                .global(true),
            Arg::with_name("redis-url")
                .long("redis-url")
                .value_name("URL")
                .env("DBCMP_REDIS_URL")
                .help("Redis connection url")
                .default_value(DEFAULT_REDIS_URL)
                .global(true),
            Arg::with_name("mongo-uri")
                .long("mongo-uri")
                .value_name("URI")
                .env("DBCMP_MONGO_URI")
                .help("MongoDB connection string")
                .default_value(DEFAULT_MONGO_URI)
                .global(true),
            Arg::with_name("mongo-db")
                .long("mongo-db")
                .value_name("NAME")
                .env("DBCMP_MONGO_DB")
                .help("MongoDB database name")
                .default_value(DEFAULT_MONGO_DB)
                .global(true),
            Arg::with_name("income-delta")
                .long("income-delta")
                .value_name("AMOUNT")
                .env("DBCMP_INCOME_DELTA")
                .help("amount the update operation adds to the stored income")
                .default_value("1000")
                .global(true),
            Arg::with_name("dataset")
                .long("dataset")
                .value_name("DIR")
                .env("DBCMP_DATASET")
                .help("directory with poblacion.json and sectores.json, instead of the built-in dataset")
                .global(true),
        ]
    }

    /// builds a config out of parsed arguments
    ///
    /// # Errors
    /// returns [`DbError::Parsing`] if a backend name or the income delta is invalid
    pub fn from_matches(matches: &ArgMatches) -> Result<Config> {
        Config::from_layers(&[matches])
    }

    /// like [`Config::from_matches`], for arguments that may be given at several levels of a
    /// command line (before or after a subcommand). A value given explicitly on an earlier
    /// layer wins, otherwise the last layer's environment value or default applies.
    pub fn from_layers(layers: &[&ArgMatches]) -> Result<Config> {
        let lookup = |name: &str| -> Option<String> {
            layers
                .iter()
                .find(|m| m.occurrences_of(name) > 0)
                .or_else(|| layers.last())
                .and_then(|m| m.value_of(name))
                .map(str::to_string)
        };
        let defaults = Config::default();
        let backends = match lookup("backends") {
            Some(list) => parse_backends(&list)?,
            None => defaults.backends,
        };
        let income_delta = match lookup("income-delta") {
            Some(delta) => delta
                .trim()
                .parse()
                .map_err(|_| DbError::Parsing(format!("{} as an income delta", delta)))?,
            None => defaults.income_delta,
        };
        Ok(Config {
            backends,
            riak_url: lookup("riak-url").unwrap_or(defaults.riak_url),
            redis_url: lookup("redis-url").unwrap_or(defaults.redis_url),
            mongo_uri: lookup("mongo-uri").unwrap_or(defaults.mongo_uri),
            mongo_db: lookup("mongo-db").unwrap_or(defaults.mongo_db),
            income_delta,
            dataset_dir: lookup("dataset").map(PathBuf::from),
        })
    }

    /// the configured dataset, the built-in one unless a directory was given
    pub fn dataset(&self) -> Result<Dataset> {
        match &self.dataset_dir {
            Some(dir) => Dataset::from_dir(dir),
            None => Dataset::builtin(),
        }
    }

    /// creates and health-checks the configured backends. A backend that does not answer is
    /// still registered: its calls retry the connection and report the failure.
    ///
    /// # Errors
    /// only if a backend's url cannot be parsed
    pub fn connect(&self) -> Result<Backends> {
        let mut backends = Backends::new();
        for kind in &self.backends {
            let backend: Arc<dyn Backend> = match kind {
                BackendKind::Riak => Arc::new(RiakBackend::new(&self.riak_url)?),
                BackendKind::Redis => Arc::new(RedisBackend::new(&self.redis_url)?),
                BackendKind::Mongo => Arc::new(MongoBackend::new(&self.mongo_uri, &self.mongo_db)?),
                BackendKind::Memory => Arc::new(MemoryBackend::new()),
            };
            match backend.ping() {
                Ok(()) => info!("{} is up", kind),
                Err(e) => warn!("{} did not answer its health check: {}", kind, e),
            }
            backends.insert(backend);
        }
        Ok(backends)
    }

    /// a dispatcher over the connected backends
    pub fn dispatcher(&self) -> Result<Dispatcher> {
        Ok(Dispatcher::new(self.connect()?, self.dataset()?, self.income_delta))
    }
}

/// parses a comma separated list of backend names, ignoring blanks and repeats
pub fn parse_backends(list: &str) -> Result<Vec<BackendKind>> {
    let mut kinds = Vec::new();
    for name in list.split(',').filter(|s| !s.trim().is_empty()) {
        let kind = name.parse()?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    if kinds.is_empty() {
        return Err(DbError::Parsing(format!("'{}' as a backend list", list)));
    }
    Ok(kinds)
}
