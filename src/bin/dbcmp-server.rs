//! this binary starts the HTTP front end over the configured backends
//! to see the list of options, type: `dbcmp-server --help`

use std::net::SocketAddr;
use std::process::exit;
use std::sync::Arc;

use clap::{crate_version, App, Arg, ArgMatches};
use dbcmp::thread_pool::{SharedQueueThreadPool, ThreadPool};
use dbcmp::{Config, DbError, DemoServer, Result};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const DEFAULT_ADDRESS: &str = "127.0.0.1:8000";
const DEFAULT_THREADS: &str = "4";

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    addr: SocketAddr,
    threads: u32,
    config: Config,
}

impl Opt {
    /// validates the command line arguments
    /// # Errors
    /// returns [`DbError::Parsing`] if one of the parameters is invalid
    fn build(matches: &ArgMatches) -> Result<Opt> {
        let addr = matches.value_of("addr").unwrap_or(DEFAULT_ADDRESS);
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| DbError::Parsing(format!("{} into an IP address and port", addr)))?;
        let threads = matches.value_of("threads").unwrap_or(DEFAULT_THREADS);
        let threads: u32 = match threads.parse() {
            Ok(n) if n > 0 => n,
            _ => return Err(DbError::Parsing(format!("{} as a number of worker threads", threads))),
        };
        Ok(Opt {
            addr,
            threads,
            config: Config::from_matches(matches)?,
        })
    }
}

fn main() {
    // set up a tracing subscriber to log to STDERR
    subscriber_config();

    let matches = App::new("dbcmp-server")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("serves the same workload against Riak, Redis and MongoDB over HTTP")
        .args(&Config::args())
        .arg(
            Arg::with_name("addr")
                .long("addr")
                .value_name("IP_ADDR:PORT")
                .help("sets the IP_ADDR:PORT that the server listens on")
                .default_value(DEFAULT_ADDRESS),
        )
        .arg(
            Arg::with_name("threads")
                .long("threads")
                .value_name("N")
                .help("number of worker threads running backend calls")
                .default_value(DEFAULT_THREADS),
        )
        .get_matches();

    let opt = match Opt::build(&matches) {
        Ok(opt) => opt,
        Err(err) => {
            eprintln!("{}", err);
            exit(1);
        }
    };

    if let Err(e) = run(opt) {
        eprintln!("{}", e);
        exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    info!("dbcmp-server {}", env!("CARGO_PKG_VERSION"));
    info!("Listening on {} with {} workers", opt.addr, opt.threads);

    // backends are connected before the runtime exists: their clients block
    let dispatcher = Arc::new(opt.config.dispatcher()?);
    info!("Backends: {:?}", dispatcher.backends());
    let pool = SharedQueueThreadPool::new(opt.threads)?;
    let server = DemoServer::new(dispatcher.clone(), pool);

    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(server.run(opt.addr))?;
    drop(rt);
    // the last reference goes away here, outside the runtime
    drop(dispatcher);
    Ok(())
}

/// configures a tracing subscriber that will log to STDERR, at the level given by `RUST_LOG`
fn subscriber_config() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting tracing default subscriber failed: {}", e);
    }
}
