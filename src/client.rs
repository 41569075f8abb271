#[macro_use] extern crate log;

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use structopt::StructOpt;
use tokio::net::TcpStream;

use multipaxos::message::{ClientRequest, ClientResponse, Message};
use multipaxos::socket;

#[derive(StructOpt)]
#[structopt(name = "paxos-client")]
struct Opt {
    /// Client address of the server to submit to
    #[structopt(short = "s", long = "server")]
    server: SocketAddr,

    /// Attempts per value after the first rejection
    #[structopt(short = "r", long = "retries", default_value = "5")]
    retries: usize,

    /// Base delay between attempts (in milliseconds)
    #[structopt(short = "b", long = "backoff", default_value = "100")]
    backoff: u64,

    /// Logging verbosity, repeat for more
    #[structopt(short = "v", parse(from_occurrences))]
    verbose: u8,

    /// Values to commit, in order
    #[structopt(allow_hyphen_values = true)]
    values: Vec<i64>,
}

#[derive(Debug)]
enum Outcome {
    Committed(ClientResponse),
    Rejected(usize),
    Disconnected,
}

async fn commit(
    rx: &mut socket::Rx,
    tx: &mut socket::Tx,
    request: ClientRequest,
    retries: usize,
    backoff: Duration,
) -> std::io::Result<Outcome> {
    for attempt in 0..=retries {
        tx.send(&Message::ClientRequest(request)).await?;
        let response = loop {
            match rx.recv().await {
            | Some(Message::ClientResponse(response)) => break response,
            | Some(message) => warn!("ignoring {} from server", message.name()),
            | None => return Ok(Outcome::Disconnected),
            }
        };
        if !response.is_rejected() {
            return Ok(Outcome::Committed(response))
        }
        debug!("attempt {} for {} rejected", attempt, request.requested_value);
        let delay = backoff.mul_f64(rand::thread_rng().gen_range(0.5..1.5));
        tokio::time::sleep(delay).await;
    }
    Ok(Outcome::Rejected(retries + 1))
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    if let Err(error) = multipaxos::logger::init(opt.verbose) {
        eprintln!("[ERROR]: failed to install logger: {}", error);
    }

    let stream = match TcpStream::connect(opt.server).await {
    | Ok(stream) => stream,
    | Err(error) => {
        eprintln!("[ERROR]: could not connect to {}: {}", opt.server, error);
        std::process::exit(1);
    }
    };
    info!("connected to {}", opt.server);

    let (mut rx, mut tx) = socket::split(stream);
    let backoff = Duration::from_millis(opt.backoff);
    for (correlation_id, value) in opt.values.iter().copied().enumerate() {
        let request = ClientRequest {
            correlation_id: correlation_id as i64,
            requested_value: value,
        };
        match commit(&mut rx, &mut tx, request, opt.retries, backoff).await {
        | Ok(Outcome::Committed(response)) => {
            println!("decree {} = {}", response.decree_num, response.value);
        }
        | Ok(Outcome::Rejected(attempts)) => {
            eprintln!("[ERROR]: {} rejected after {} attempts", value, attempts);
            std::process::exit(1);
        }
        | Ok(Outcome::Disconnected) => {
            eprintln!("[ERROR]: server closed the connection");
            std::process::exit(1);
        }
        | Err(error) => {
            eprintln!("[ERROR]: failed to send: {}", error);
            std::process::exit(1);
        }
        }
    }
}
