#![deny(missing_docs)]
//! Runs one small CRUD and query workload against Riak, Redis and MongoDB, side by side, so the
//! way each store is driven can be compared.
//!
//! This crate provides the library itself, as well as a [`dbcmp-server`] executable serving
//! the operations over HTTP and a [`dbcmp`] executable running them from the command line.
//!
//! ## Operations
//! Every backend answers the same nine operations (see [`Operation`]):
//!
//! - `list`, `get`, `insert`, `update` and `delete` on people
//! - `reindex`, which (re)builds the secondary indexes the queries rely on
//! - `range_query` on income and `filter_query` on sector and sex
//! - `aggregate`, the total income of each sector, persisted as a derived summary
//!
//! The [`Dispatcher`] routes an operation to one backend and wraps the outcome in a
//! [`Response`]: the data, the native query text that was run, the elapsed time and a trace
//! of `[BACKEND] [category] message` lines narrating what happened. A failed operation still
//! produces a response, with its `error` field set.
//!
//! ## Backends
//! Each store implements the [`Backend`] trait:
//!
//! - [`RiakBackend`] talks to the Riak HTTP interface, writing secondary indexes as headers
//! - [`RedisBackend`] stores JSON documents and queries them with a RediSearch index
//! - [`MongoBackend`] uses collections, native query documents and an aggregation pipeline
//! - [`MemoryBackend`] keeps everything in process and needs no external service
//!
//! Operations a store cannot do natively (the key-value store has no server-side filter or
//! aggregation) fall back to default implementations that do the work client-side.
//!
//! ## Loading
//! [`load_all`] seeds every configured backend with the built-in [`Dataset`] of 19 people and
//! 4 sectors, clearing whatever was there first.
//!
//! [`dbcmp-server`]: ../dbcmp_server/index.html
//! [`dbcmp`]: ../dbcmp/index.html

pub use backend::{Backend, BackendKind, Backends, MemoryBackend, MongoBackend, Record, RedisBackend, RiakBackend};
pub use command::{Command, Failure, LoadResponse, Operation, Params, Response};
pub use config::Config;
pub use dataset::Dataset;
pub use dispatch::{Dispatcher, DEFAULT_INCOME_DELTA};
pub use error::{DbError, ErrorKind, Result};
pub use loader::load_all;
pub use model::{Person, Sector, SectorTotal, Sex};
pub use pubsub::Subscription;
pub use server::DemoServer;
pub use trace::{Category, Tracer};

pub mod backend;
mod command;
pub mod config;
mod dataset;
mod dispatch;
mod error;
mod loader;
pub mod model;
mod pubsub;
mod server;
pub mod thread_pool;
mod trace;
