use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;
use crate::model::{Person, Sex};
use crate::trace::Tracer;
use crate::{DbError, Result};

/// These are the operations the dispatcher can run against a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// every person
    List,
    /// one person by `dni`
    Get,
    /// a new person from the request parameters
    Insert,
    /// add the fixed delta to one person's income
    Update,
    /// remove one person
    Delete,
    /// rebuild the indexes queries rely on
    Reindex,
    /// people within an inclusive income range
    RangeQuery,
    /// people of one sector and sex
    FilterQuery,
    /// total income per sector
    Aggregate,
}

impl Operation {
    /// every operation, in the order they are usually demonstrated
    pub const ALL: [Operation; 9] = [
        Operation::List,
        Operation::Get,
        Operation::Insert,
        Operation::Update,
        Operation::Delete,
        Operation::Reindex,
        Operation::RangeQuery,
        Operation::FilterQuery,
        Operation::Aggregate,
    ];

    /// the canonical name, as used in urls
    pub fn name(self) -> &'static str {
        match self {
            Operation::List => "list",
            Operation::Get => "get",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Reindex => "reindex",
            Operation::RangeQuery => "range_query",
            Operation::FilterQuery => "filter_query",
            Operation::Aggregate => "aggregate",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = DbError;

    /// accepts the canonical names and the Spanish names used by the web UI
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "list" | "listar" => Ok(Operation::List),
            "get" | "leer" => Ok(Operation::Get),
            "insert" | "insertar" => Ok(Operation::Insert),
            "update" | "actualizar" => Ok(Operation::Update),
            "delete" | "borrar" => Ok(Operation::Delete),
            "reindex" | "indexar" => Ok(Operation::Reindex),
            "range_query" | "range" | "rango" => Ok(Operation::RangeQuery),
            "filter_query" | "filter" | "filtro" => Ok(Operation::FilterQuery),
            "aggregate" | "agregacion" => Ok(Operation::Aggregate),
            other => Err(DbError::Parsing(format!("'{}' as an operation", other))),
        }
    }
}

/// Caller supplied parameters. Every field has the default the demonstration UI uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Params {
    /// national id
    pub dni: String,
    /// name of an inserted person
    pub nombre: String,
    /// income of an inserted person
    pub ingresos: i64,
    /// lower bound of the income range
    pub min_val: i64,
    /// upper bound of the income range
    pub max_val: i64,
    /// sector code
    pub sector: u32,
    /// sex code, `H` or `M`
    pub sexo: String,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            dni: "123456789".to_string(),
            nombre: "Laura".to_string(),
            ingresos: 30000,
            min_val: 20000,
            max_val: 50000,
            sector: 2,
            sexo: "M".to_string(),
        }
    }
}

impl Params {
    /// overlays query-string pairs onto the defaults. Unknown keys are ignored; a value that
    /// does not parse is an error.
    pub fn from_pairs(pairs: &HashMap<String, String>) -> Result<Params> {
        let mut params = Params::default();
        for (key, value) in pairs {
            match key.as_str() {
                "dni" => params.dni = value.clone(),
                "nombre" => params.nombre = value.clone(),
                "ingresos" => params.ingresos = parse_num(key, value)?,
                "min_val" => params.min_val = parse_num(key, value)?,
                "max_val" => params.max_val = parse_num(key, value)?,
                "sector" => params.sector = parse_num(key, value)?,
                "sexo" => params.sexo = value.clone(),
                _ => {}
            }
        }
        Ok(params)
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DbError::Parsing(format!("{}={} as a number", key, value)))
}

/// A fully resolved operation, ready to be handed to a backend.
///
/// This is where the fixed semantics of each operation are decided: `Update` always carries
/// the configured income delta, `Insert` always builds the same five-field person.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// every person
    List,
    /// one person
    Get {
        /// national id
        dni: String,
    },
    /// a new person
    Insert {
        /// the person to create
        person: Person,
    },
    /// raise one person's income
    Update {
        /// national id
        dni: String,
        /// amount added to the income
        delta: i64,
    },
    /// remove one person
    Delete {
        /// national id
        dni: String,
    },
    /// rebuild the indexes
    Reindex,
    /// people with `min <= ingresos <= max`
    RangeQuery {
        /// inclusive lower bound
        min: i64,
        /// inclusive upper bound
        max: i64,
    },
    /// people of one sector and sex
    FilterQuery {
        /// sector code
        sector: u32,
        /// sex to keep
        sex: Sex,
    },
    /// total income per sector
    Aggregate {
        /// the sector reported on its own
        sector: u32,
    },
}

impl Command {
    /// resolves `op` with `params`
    ///
    /// # Errors
    /// `DbError::Parsing` for an invalid sex code, `DbError::MalformedQuery` when the range
    /// bounds are inverted
    pub fn build(op: Operation, params: &Params, income_delta: i64) -> Result<Command> {
        Ok(match op {
            Operation::List => Command::List,
            Operation::Get => Command::Get { dni: params.dni.clone() },
            Operation::Insert => Command::Insert {
                person: Person::new(
                    params.dni.clone(),
                    params.nombre.clone(),
                    params.ingresos,
                    params.sector,
                    params.sexo.parse()?,
                ),
            },
            Operation::Update => Command::Update {
                dni: params.dni.clone(),
                delta: income_delta,
            },
            Operation::Delete => Command::Delete { dni: params.dni.clone() },
            Operation::Reindex => Command::Reindex,
            Operation::RangeQuery => {
                if params.min_val > params.max_val {
                    return Err(DbError::MalformedQuery(format!(
                        "min_val {} is greater than max_val {}",
                        params.min_val, params.max_val
                    )));
                }
                Command::RangeQuery {
                    min: params.min_val,
                    max: params.max_val,
                }
            }
            Operation::FilterQuery => Command::FilterQuery {
                sector: params.sector,
                sex: params.sexo.parse()?,
            },
            Operation::Aggregate => Command::Aggregate { sector: params.sector },
        })
    }
}

/// Why an operation failed, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// coarse error category
    pub kind: ErrorKind,
    /// the error as text
    pub message: String,
}

impl From<&DbError> for Failure {
    fn from(e: &DbError) -> Self {
        Failure {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// The envelope returned for every dispatcher call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// rendered trace lines, oldest first
    pub trace: Vec<String>,
    /// the operation result, `null` on failure
    pub data: Value,
    /// elapsed milliseconds
    pub time_ms: f64,
    /// native query text the operation ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_str: Option<String>,
    /// set when the operation failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

impl Response {
    /// assembles a successful response, stopping the tracer's clock
    pub fn ok(trace: Tracer, data: Value) -> Self {
        let (trace, query_str, time_ms) = trace.finish();
        Response {
            trace,
            data,
            time_ms,
            query_str,
            error: None,
        }
    }

    /// assembles a failed response; the error is also logged into the trace
    pub fn failed(mut trace: Tracer, err: &DbError) -> Self {
        trace.error(err.to_string());
        let (trace, query_str, time_ms) = trace.finish();
        Response {
            trace,
            data: Value::Null,
            time_ms,
            query_str,
            error: Some(Failure::from(err)),
        }
    }

    /// a request that never reached a backend, e.g. because its parameters did not parse
    pub fn rejected(source: &str, err: &DbError) -> Self {
        Response::failed(Tracer::new(source), err)
    }

    /// `true` unless the operation failed
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// The envelope returned by the bulk loader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResponse {
    /// rendered trace lines of every backend
    pub trace: Vec<String>,
    /// one-line summary of the load
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_names_round_trip_and_accept_aliases() {
        for op in Operation::ALL.iter() {
            assert_eq!(op.name().parse::<Operation>().unwrap(), *op);
        }
        assert_eq!("rango".parse::<Operation>().unwrap(), Operation::RangeQuery);
        assert_eq!("AGREGACION".parse::<Operation>().unwrap(), Operation::Aggregate);
        assert!("drop_table".parse::<Operation>().is_err());
    }

    #[test]
    fn params_overlay_defaults() {
        let mut pairs = HashMap::new();
        pairs.insert("min_val".to_string(), "100".to_string());
        pairs.insert("sexo".to_string(), "H".to_string());
        pairs.insert("unused".to_string(), "x".to_string());
        let p = Params::from_pairs(&pairs).unwrap();
        assert_eq!(p.min_val, 100);
        assert_eq!(p.sexo, "H");
        assert_eq!(p.max_val, 50000);
        assert_eq!(p.dni, "123456789");
    }

    #[test]
    fn params_reject_non_numbers() {
        let mut pairs = HashMap::new();
        pairs.insert("sector".to_string(), "two".to_string());
        assert!(matches!(Params::from_pairs(&pairs), Err(DbError::Parsing(_))));
    }

    #[test]
    fn update_carries_fixed_delta() {
        let cmd = Command::build(Operation::Update, &Params::default(), 1000).unwrap();
        assert_eq!(
            cmd,
            Command::Update {
                dni: "123456789".into(),
                delta: 1000
            }
        );
    }

    #[test]
    fn inverted_range_is_malformed() {
        let params = Params {
            min_val: 10,
            max_val: 5,
            ..Params::default()
        };
        let err = Command::build(Operation::RangeQuery, &params, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedQuery);
    }

    #[test]
    fn failed_response_carries_error_and_trace() {
        let resp = Response::rejected("riak", &DbError::NotFound("1".into()));
        assert!(!resp.is_ok());
        assert_eq!(resp.error.as_ref().unwrap().kind, ErrorKind::NotFound);
        assert!(resp.trace[0].starts_with("[RIAK] [error]"));
        assert!(resp.time_ms >= 0.0);
    }
}
