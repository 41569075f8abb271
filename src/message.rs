//! # Summary
//!
//! This module defines every message exchanged between participants and
//! between a participant and its clients.
//!
//! On the wire a message is a version byte, a one byte message code, and
//! the `bincode` encoding of the payload (fixed-width little endian
//! integers). Decoding rejects unknown versions, unknown codes, truncated
//! payloads and trailing bytes, as well as decrees that name a slot
//! outside `0..=MAX_DECREE_NUM`.

use bincode::Options;
use serde_derive::{Deserialize, Serialize};

use crate::types::{BallotNum, Decree, DecreeNum, ParticipantId, Value, Vote};

/// Codec version written in front of every message.
pub const VERSION: u8 = 1;

/// Phase 1a: a proposer asks for promises on `ballot`.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NextBallot {
    pub ballot: BallotNum,
    pub sender_id: ParticipantId,
    pub sender_commit_num: DecreeNum,
}

/// Phase 1b: a promise, together with every outstanding vote of the sender
/// and every decree it knows to be committed past its commit frontier.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastVote {
    pub ballot: BallotNum,
    pub sender_id: ParticipantId,
    pub sender_commit_num: DecreeNum,
    pub votes: Vec<Vote>,
    pub committed_decrees: Vec<Decree>,
}

/// Phase 2a: the leader proposes `chosen_decrees` under `ballot`.
/// `committed_decrees` carries catch-up history for lagging acceptors.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BeginBallot {
    pub ballot: BallotNum,
    pub sender_id: ParticipantId,
    pub sender_commit_num: DecreeNum,
    pub chosen_decrees: Vec<Decree>,
    pub committed_decrees: Vec<Decree>,
}

/// The sender would vote for `ballot` but is missing committed history.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingVote {
    pub ballot: BallotNum,
    pub sender_id: ParticipantId,
    pub sender_commit_num: DecreeNum,
}

/// Phase 2b: `owner_id` voted for the proposals of `ballot` up to
/// `max_decree_num`.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Voted {
    pub ballot: BallotNum,
    pub owner_id: ParticipantId,
    pub max_decree_num: DecreeNum,
}

/// `ballot` is stale: the sender has already promised `observed_max_bal`.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nack {
    pub ballot: BallotNum,
    pub observed_max_bal: BallotNum,
    pub sender_id: ParticipantId,
}

/// Committed decrees, for learners.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Success {
    pub decrees: Vec<Decree>,
}

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClientRequest {
    pub correlation_id: i64,
    pub requested_value: Value,
}

/// Outcome of a client request. A `decree_num` of -1 means the request
/// could not be started and should be retried, possibly elsewhere.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClientResponse {
    pub decree_num: DecreeNum,
    pub value: Value,
}

impl ClientResponse {
    pub fn committed(decree: Decree) -> Self {
        ClientResponse {
            decree_num: decree.decree_num,
            value: decree.value,
        }
    }

    pub fn rejected(value: Value) -> Self {
        ClientResponse {
            decree_num: -1,
            value,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.decree_num < 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    NextBallot(NextBallot),
    LastVote(LastVote),
    BeginBallot(BeginBallot),
    PendingVote(PendingVote),
    Voted(Voted),
    Nack(Nack),
    Success(Success),
    ClientRequest(ClientRequest),
    ClientResponse(ClientResponse),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,

    #[error("unsupported codec version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message code {0}")]
    UnknownCode(u8),

    #[error("malformed {name} payload: {source}")]
    Malformed {
        name: &'static str,
        source: bincode::Error,
    },

    #[error("{name} names invalid decree {decree_num}")]
    InvalidDecree {
        name: &'static str,
        decree_num: DecreeNum,
    },
}

fn options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

fn parse<T: serde::de::DeserializeOwned>(name: &'static str, bytes: &[u8]) -> Result<T, DecodeError> {
    options()
        .deserialize(bytes)
        .map_err(|source| DecodeError::Malformed { name, source })
}

impl Message {
    pub const NEXT_BALLOT: u8 = 1;
    pub const LAST_VOTE: u8 = 2;
    pub const BEGIN_BALLOT: u8 = 3;
    pub const PENDING_VOTE: u8 = 4;
    pub const VOTED: u8 = 5;
    pub const NACK: u8 = 6;
    pub const SUCCESS: u8 = 7;
    pub const CLIENT_REQUEST: u8 = 8;
    pub const CLIENT_RESPONSE: u8 = 9;

    /// Message code written after the version byte.
    pub fn code(&self) -> u8 {
        match self {
        | Message::NextBallot(_) => Self::NEXT_BALLOT,
        | Message::LastVote(_) => Self::LAST_VOTE,
        | Message::BeginBallot(_) => Self::BEGIN_BALLOT,
        | Message::PendingVote(_) => Self::PENDING_VOTE,
        | Message::Voted(_) => Self::VOTED,
        | Message::Nack(_) => Self::NACK,
        | Message::Success(_) => Self::SUCCESS,
        | Message::ClientRequest(_) => Self::CLIENT_REQUEST,
        | Message::ClientResponse(_) => Self::CLIENT_RESPONSE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
        | Message::NextBallot(_) => "NextBallot",
        | Message::LastVote(_) => "LastVote",
        | Message::BeginBallot(_) => "BeginBallot",
        | Message::PendingVote(_) => "PendingVote",
        | Message::Voted(_) => "Voted",
        | Message::Nack(_) => "Nack",
        | Message::Success(_) => "Success",
        | Message::ClientRequest(_) => "ClientRequest",
        | Message::ClientResponse(_) => "ClientResponse",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        let mut bytes = vec![VERSION, self.code()];
        let payload = match self {
        | Message::NextBallot(m) => options().serialize(m),
        | Message::LastVote(m) => options().serialize(m),
        | Message::BeginBallot(m) => options().serialize(m),
        | Message::PendingVote(m) => options().serialize(m),
        | Message::Voted(m) => options().serialize(m),
        | Message::Nack(m) => options().serialize(m),
        | Message::Success(m) => options().serialize(m),
        | Message::ClientRequest(m) => options().serialize(m),
        | Message::ClientResponse(m) => options().serialize(m),
        }?;
        bytes.extend(payload);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (version, code, payload) = match bytes {
        | [version, code, payload @ ..] => (*version, *code, payload),
        | [version] if *version != VERSION => return Err(DecodeError::UnsupportedVersion(*version)),
        | _ => return Err(DecodeError::Empty),
        };
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion(version))
        }
        let message = match code {
        | Self::NEXT_BALLOT => parse("NextBallot", payload).map(Message::NextBallot),
        | Self::LAST_VOTE => parse("LastVote", payload).map(Message::LastVote),
        | Self::BEGIN_BALLOT => parse("BeginBallot", payload).map(Message::BeginBallot),
        | Self::PENDING_VOTE => parse("PendingVote", payload).map(Message::PendingVote),
        | Self::VOTED => parse("Voted", payload).map(Message::Voted),
        | Self::NACK => parse("Nack", payload).map(Message::Nack),
        | Self::SUCCESS => parse("Success", payload).map(Message::Success),
        | Self::CLIENT_REQUEST => parse("ClientRequest", payload).map(Message::ClientRequest),
        | Self::CLIENT_RESPONSE => parse("ClientResponse", payload).map(Message::ClientResponse),
        | unknown => Err(DecodeError::UnknownCode(unknown)),
        }?;
        message.validate()?;
        Ok(message)
    }

    /// Every decree a message carries must name an addressable slot.
    fn validate(&self) -> Result<(), DecodeError> {
        let name = self.name();
        let check = |decree: &Decree| match Decree::is_valid_num(decree.decree_num) {
        | true => Ok(()),
        | false => Err(DecodeError::InvalidDecree { name, decree_num: decree.decree_num }),
        };
        match self {
        | Message::LastVote(m) => {
            m.votes.iter().map(|vote| &vote.decree).try_for_each(check)?;
            m.committed_decrees.iter().try_for_each(check)
        }
        | Message::BeginBallot(m) => {
            m.chosen_decrees.iter().try_for_each(check)?;
            m.committed_decrees.iter().try_for_each(check)
        }
        | Message::Success(m) => m.decrees.iter().try_for_each(check),
        | _ => Ok(()),
        }
    }
}
