#[macro_use] extern crate log;

use std::net::SocketAddr;
use std::path::PathBuf;

use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "paxos-server")]
struct Opt {
    /// Unique participant ID, indexing into the peer list
    #[structopt(short = "i", long = "id")]
    id: i32,

    /// Internal address of every participant, in ID order
    #[structopt(short = "p", long = "peers", use_delimiter = true, required = true)]
    peers: Vec<SocketAddr>,

    /// Address to listen on for client requests
    #[structopt(short = "c", long = "client")]
    client: SocketAddr,

    /// Directory holding the ledger file
    #[structopt(short = "d", long = "ledger-dir", default_value = ".", parse(from_os_str))]
    ledger_dir: PathBuf,

    /// Delay between reconnection attempts (in milliseconds)
    #[structopt(short = "t", long = "timeout", default_value = "1000")]
    timeout: u64,

    /// Logging verbosity, repeat for more
    #[structopt(short = "v", parse(from_occurrences))]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    if let Err(error) = multipaxos::logger::init(opt.verbose) {
        eprintln!("[ERROR]: failed to install logger: {}", error);
    }

    let config = multipaxos::Config::new(
            opt.id,
            opt.peers,
            opt.client,
        ).with_ledger_dir(
            opt.ledger_dir
        ).with_timeout(
            std::time::Duration::from_millis(opt.timeout)
        );

    if let Err(error) = config.run().await {
        error!("{}", error);
        std::process::exit(1);
    }
}
