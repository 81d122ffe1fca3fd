//! this binary runs the workload from the command line, without HTTP
//! to see the list of commands, type: `dbcmp --help`

use std::collections::HashMap;
use std::process::exit;
use std::time::Duration;

use clap::{crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};
use dbcmp::model::NEW_PERSON_CHANNEL;
use dbcmp::{BackendKind, Config, Dispatcher, Operation, Params, Response, Result};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// the query parameters `exec` accepts, as (parameter, flag) pairs
const PARAMS: [(&str, &str); 7] = [
    ("dni", "dni"),
    ("nombre", "nombre"),
    ("ingresos", "ingresos"),
    ("min_val", "min-val"),
    ("max_val", "max-val"),
    ("sector", "sector"),
    ("sexo", "sexo"),
];

const DEFAULT_LISTEN_MS: &str = "5000";
// the key inserted and then deleted by the walk-through; not part of the dataset
const DEMO_DNI: &str = "555888999";

fn main() {
    subscriber_config();

    let exec_params: Vec<Arg> = PARAMS
        .iter()
        .map(|&(name, flag)| Arg::with_name(name).long(flag).value_name("VALUE").takes_value(true))
        .collect();

    let matches = App::new("dbcmp")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("runs the same workload against Riak, Redis and MongoDB")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .args(&Config::args())
        .subcommand(SubCommand::with_name("load").about("clears every backend and loads the dataset"))
        .subcommand(
            SubCommand::with_name("exec")
                .about("runs one operation against one backend")
                .arg(
                    Arg::with_name("OPERATION")
                        .help("list, get, insert, update, delete, reindex, range_query, filter_query or aggregate")
                        .required(true)
                        .index(1),
                )
                .arg(Arg::with_name("BACKEND").help("riak, redis, mongo or memory").required(true).index(2))
                .args(&exec_params),
        )
        .subcommand(SubCommand::with_name("ping").about("health checks every configured backend"))
        .subcommand(
            SubCommand::with_name("listen")
                .about("waits for one event published on a channel")
                .arg(Arg::with_name("BACKEND").required(true).index(1))
                .arg(
                    Arg::with_name("channel")
                        .long("channel")
                        .value_name("NAME")
                        .default_value(NEW_PERSON_CHANNEL),
                )
                .arg(
                    Arg::with_name("timeout-ms")
                        .long("timeout-ms")
                        .value_name("MS")
                        .default_value(DEFAULT_LISTEN_MS),
                ),
        )
        .subcommand(
            SubCommand::with_name("demo")
                .about("loads the dataset into one backend and walks through every operation")
                .arg(Arg::with_name("BACKEND").required(true).index(1)),
        )
        .get_matches();

    match run(&matches) {
        Ok(true) => {}
        Ok(false) => exit(1),
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    }
}

/// runs the requested subcommand, returning whether it succeeded
fn run(matches: &ArgMatches) -> Result<bool> {
    let (name, m) = match matches.subcommand() {
        (name, Some(m)) => (name, m),
        _ => return Ok(false),
    };
    // shared arguments may come before or after the subcommand
    let config = Config::from_layers(&[m, matches])?;
    match name {
        "load" => {
            let resp = config.dispatcher()?.load_all();
            print_lines(&resp.trace);
            println!("{}", resp.msg);
            Ok(true)
        }
        "exec" => {
            // everything is validated before any backend is contacted
            let op: Operation = m.value_of("OPERATION").unwrap_or_default().parse()?;
            let kind: BackendKind = m.value_of("BACKEND").unwrap_or_default().parse()?;
            let pairs: HashMap<String, String> = PARAMS
                .iter()
                .filter_map(|&(name, _)| m.value_of(name).map(|v| (name.to_string(), v.to_string())))
                .collect();
            let params = Params::from_pairs(&pairs)?;
            let resp = config.dispatcher()?.execute(op, kind, &params);
            println!("{}", serde_json::to_string_pretty(&resp)?);
            Ok(resp.is_ok())
        }
        "ping" => {
            let health = config.dispatcher()?.health();
            for (kind, status) in &health {
                println!("{}: {}", kind, status);
            }
            Ok(health.values().all(|status| status == "up"))
        }
        "listen" => {
            let kind: BackendKind = m.value_of("BACKEND").unwrap_or_default().parse()?;
            let channel = m.value_of("channel").unwrap_or(NEW_PERSON_CHANNEL);
            let timeout = m.value_of("timeout-ms").unwrap_or(DEFAULT_LISTEN_MS);
            let timeout: u64 = timeout
                .parse()
                .map_err(|_| dbcmp::DbError::Parsing(format!("{} as milliseconds", timeout)))?;
            let resp = config.dispatcher()?.listen(kind, channel, Duration::from_millis(timeout));
            println!("{}", serde_json::to_string_pretty(&resp)?);
            Ok(resp.is_ok())
        }
        "demo" => {
            let kind: BackendKind = m.value_of("BACKEND").unwrap_or_default().parse()?;
            let config = Config {
                backends: vec![kind],
                ..config
            };
            demo(&config.dispatcher()?, kind);
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// loads the dataset, then runs every operation once and prints what happened
fn demo(dispatcher: &Dispatcher, kind: BackendKind) {
    let load = dispatcher.load_all();
    println!("== load ==");
    print_lines(&load.trace);
    println!("{}", load.msg);

    let defaults = Params::default();
    let new_person = Params {
        dni: DEMO_DNI.to_string(),
        ..Params::default()
    };
    let steps = [
        (Operation::Get, &defaults),
        (Operation::Update, &defaults),
        (Operation::Reindex, &defaults),
        (Operation::RangeQuery, &defaults),
        (Operation::FilterQuery, &defaults),
        (Operation::Aggregate, &defaults),
        (Operation::Insert, &new_person),
        (Operation::Delete, &new_person),
        (Operation::List, &defaults),
    ];
    for (op, params) in steps.iter() {
        let resp = dispatcher.execute(*op, kind, params);
        println!("\n== {} ==", op);
        print_response(&resp);
    }
}

fn print_response(resp: &Response) {
    if let Some(query) = &resp.query_str {
        println!("{}", query);
        println!("--");
    }
    print_lines(&resp.trace);
    match serde_json::to_string_pretty(&resp.data) {
        Ok(data) => println!("{}", data),
        Err(e) => eprintln!("data could not be printed: {}", e),
    }
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{}", line);
    }
}

/// configures a tracing subscriber that will log to STDERR, warnings only unless `RUST_LOG`
/// says otherwise
fn subscriber_config() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting tracing default subscriber failed: {}", e);
    }
}
