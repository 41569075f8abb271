#[macro_use] extern crate derivative;
#[macro_use] extern crate log;

pub mod config;
pub mod ledger;
pub mod logger;
pub mod message;
pub mod participant;
pub mod peer;
pub mod socket;
pub mod types;

pub use crate::config::Config;
pub use crate::ledger::{Ledger, LedgerError};
pub use crate::message::{ClientRequest, ClientResponse, Message};
pub use crate::participant::{Participant, Status};
pub use crate::peer::{Inbox, Loopback, Peer, Remote, Respond};
pub use crate::types::{BallotNum, Decree, DecreeNum, ParticipantId, Value, Vote, MAX_DECREE_NUM, NOOP};
