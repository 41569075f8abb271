//! # Summary
//!
//! This module wires a `Participant` into a running server process.
//!
//! Every other participant gets a dialer task owning the only outbound
//! connection to it, which is used for sending and nothing else. Inbound
//! peer connections are only ever read from. Clients connect to a separate
//! listener and get their responses on the connection they asked on.
//!
//! Handling an event syncs the ledger to disk while holding the participant
//! lock, so that work runs through `block_in_place` and the server needs the
//! multi-threaded runtime.

use std::convert::TryFrom;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::ledger::{Ledger, LedgerError};
use crate::message::{ClientResponse, Message};
use crate::participant::{self, Participant};
use crate::peer::{Peer, Remote};
use crate::socket;
use crate::types::ParticipantId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("participant id {id} is outside 0..{count}")]
    InvalidId {
        id: ParticipantId,
        count: usize,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Participant(#[from] participant::Error),
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Unique participant ID
    id: ParticipantId,

    /// Internal address of every participant, indexed by ID
    peers: Vec<SocketAddr>,

    /// Address for incoming client requests
    client_addr: SocketAddr,

    /// Directory holding the ledger file
    ledger_dir: PathBuf,

    /// Base delay between reconnection attempts
    timeout: Duration,

    /// Interval between attempts to start a client request
    tick: Duration,

    /// Messages buffered per peer while its connection is down or slow
    queue_capacity: usize,
}

impl Config {
    pub fn new(id: ParticipantId, peers: Vec<SocketAddr>, client_addr: SocketAddr) -> Self {
        Config {
            id,
            peers,
            client_addr,
            ledger_dir: PathBuf::from("."),
            timeout: Duration::from_secs(1),
            tick: Duration::from_millis(5),
            queue_capacity: 1024,
        }
    }

    pub fn with_ledger_dir<P: Into<PathBuf>>(mut self, ledger_dir: P) -> Self {
        self.ledger_dir = ledger_dir.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    pub fn ledger_name(&self) -> String {
        format!("ledger-{:>02}.paxos", self.id)
    }

    /// Runs the server until a fatal error.
    pub async fn run(self) -> Result<(), Error> {
        let count = self.peers.len();
        let internal_addr = usize::try_from(self.id)
            .ok()
            .and_then(|index| self.peers.get(index).copied())
            .ok_or(Error::InvalidId { id: self.id, count })?;

        let peer_listener = bind(internal_addr).await?;
        let client_listener = bind(self.client_addr).await?;

        let ledger = Ledger::create_if_not_existing(&self.ledger_dir, &self.ledger_name(), self.id)?;
        let participant = Arc::new(Participant::new(self.id, ledger));

        let mut remotes: Vec<Box<dyn Peer>> = Vec::with_capacity(count - 1);
        for (index, addr) in self.peers.iter().enumerate() {
            let peer_id = index as ParticipantId;
            if peer_id == self.id {
                continue
            }
            let (remote, rx) = Remote::new(peer_id, self.queue_capacity);
            remotes.push(Box::new(remote));
            tokio::spawn(dial(self.id, peer_id, *addr, rx, self.timeout));
        }
        participant.add_remotes(remotes)?;

        info!(
            "[{}] listening for peers on {} and clients on {}",
            self.id,
            internal_addr,
            self.client_addr,
        );

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_peers(peer_listener, participant.clone(), fatal_tx));
        tokio::spawn(accept_clients(client_listener, participant.clone()));

        let mut tick = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = tick.tick() => blocking(|| participant.pump_one_client_request())?,
                Some(error) = fatal_rx.recv() => return Err(Error::Participant(error)),
            }
        }
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, Error> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| Error::Bind { addr, source })
}

/// Runs participant work that may wait on the disk.
fn blocking<T, F: FnOnce() -> T>(work: F) -> T {
    tokio::task::block_in_place(work)
}

/// Delay before the next connection attempt, jittered around `timeout`.
fn backoff(timeout: Duration) -> Duration {
    timeout.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

/// Owns the outbound connection to `peer_id`, forwarding everything queued
/// on its `Remote` handle. Messages wait in the queue while disconnected,
/// up to its capacity.
async fn dial(
    self_id: ParticipantId,
    peer_id: ParticipantId,
    addr: SocketAddr,
    mut rx: mpsc::Receiver<Message>,
    timeout: Duration,
) {
    loop {
        let stream = match TcpStream::connect(addr).await {
        | Ok(stream) => stream,
        | Err(error) => {
            trace!("[{}] failed to reach {} at {}: {}", self_id, peer_id, addr, error);
            tokio::time::sleep(backoff(timeout)).await;
            continue
        }
        };
        stream.set_nodelay(true).ok();
        info!("[{}] connected to {}", self_id, peer_id);

        let (_, mut tx) = socket::split(stream);
        loop {
            // Participant is gone
            let message = match rx.recv().await {
            | Some(message) => message,
            | None => return,
            };
            trace!("[{}] writing {} to {}", self_id, message.name(), peer_id);
            if let Err(error) = tx.send(&message).await {
                warn!("[{}] dropped {} for {}: {}", self_id, message.name(), peer_id, error);
                break
            }
        }

        info!("[{}] disconnected from {}", self_id, peer_id);
        tokio::time::sleep(backoff(timeout)).await;
    }
}

async fn accept_peers(
    listener: TcpListener,
    participant: Arc<Participant>,
    fatal: mpsc::UnboundedSender<participant::Error>,
) {
    loop {
        match listener.accept().await {
        | Ok((stream, addr)) => {
            debug!("[{}] accepted peer connection from {}", participant.id(), addr);
            tokio::spawn(receive(stream, participant.clone(), fatal.clone()));
        }
        | Err(error) => warn!("[{}] failed to accept peer: {}", participant.id(), error),
        }
    }
}

/// Hands every message read from a peer connection to the participant.
async fn receive(
    stream: TcpStream,
    participant: Arc<Participant>,
    fatal: mpsc::UnboundedSender<participant::Error>,
) {
    let (mut rx, _) = socket::split(stream);
    while let Some(message) = rx.recv().await {
        if let Err(error) = blocking(|| participant.handle(message)) {
            error!("[{}] fatal: {}", participant.id(), error);
            fatal.send(error).ok();
            return
        }
    }
}

async fn accept_clients(listener: TcpListener, participant: Arc<Participant>) {
    loop {
        match listener.accept().await {
        | Ok((stream, addr)) => {
            info!("[{}] client {} connected", participant.id(), addr);
            tokio::spawn(serve_client(stream, addr, participant.clone()));
        }
        | Err(error) => warn!("[{}] failed to accept client: {}", participant.id(), error),
        }
    }
}

async fn serve_client(stream: TcpStream, addr: SocketAddr, participant: Arc<Participant>) {
    let (mut rx, mut tx) = socket::split(stream);
    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<ClientResponse>();
    loop {
        tokio::select! {
            message = rx.recv() => match message {
            | Some(Message::ClientRequest(request)) => {
                participant.submit_client_request(request, Box::new(response_tx.clone()));
            }
            | Some(message) => warn!("[{}] ignoring {} from client {}", participant.id(), message.name(), addr),
            | None => break,
            },
            Some(response) = response_rx.recv() => {
                trace!("[{}] responding {:?} to {}", participant.id(), response, addr);
                if let Err(error) = tx.send(&Message::ClientResponse(response)).await {
                    warn!("[{}] failed to respond to {}: {}", participant.id(), addr, error);
                    break
                }
            }
        }
    }
    info!("[{}] client {} disconnected", participant.id(), addr);
}
