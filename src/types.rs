//! # Summary
//!
//! Identifiers and payloads shared by the ledger, the participant and
//! the wire messages. All of them are small `Copy` values.

use std::cmp::Ordering;

use serde_derive::{Deserialize, Serialize};

/// Unique participant ID, in `0..N`.
pub type ParticipantId = i32;

/// Replicated log slot.
pub type DecreeNum = i64;

/// Value agreed upon for a slot.
pub type Value = i64;

/// Sentinel value for a slot closed without any client effect.
pub const NOOP: Value = i64::MIN;

/// Highest slot a ledger will address.
pub const MAX_DECREE_NUM: DecreeNum = i32::MAX as DecreeNum;

/// Proposal attempt, ordered by proposal number and then by owner.
///
/// Any ballot with a negative proposal number is null, and all null
/// ballots are equal regardless of owner.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug)]
pub struct BallotNum {
    pub proposal_number: i64,
    pub owner_id: ParticipantId,
}

impl BallotNum {
    pub fn new(proposal_number: i64, owner_id: ParticipantId) -> Self {
        BallotNum { proposal_number, owner_id }
    }

    /// The null ballot, smaller than every ballot anyone can try.
    pub fn null() -> Self {
        BallotNum { proposal_number: -1, owner_id: -1 }
    }

    pub fn is_null(&self) -> bool {
        self.proposal_number < 0
    }
}

impl Default for BallotNum {
    fn default() -> Self {
        BallotNum::null()
    }
}

impl PartialEq for BallotNum {
    fn eq(&self, rhs: &Self) -> bool {
        self.cmp(rhs) == Ordering::Equal
    }
}

impl Eq for BallotNum {}

impl PartialOrd for BallotNum {
    fn partial_cmp(&self, rhs: &Self) -> Option<Ordering> {
        Some(self.cmp(rhs))
    }
}

impl Ord for BallotNum {
    fn cmp(&self, rhs: &Self) -> Ordering {
        match (self.is_null(), rhs.is_null()) {
        | (true, true) => Ordering::Equal,
        | (true, false) => Ordering::Less,
        | (false, true) => Ordering::Greater,
        | (false, false) => {
            (self.proposal_number, self.owner_id)
                .cmp(&(rhs.proposal_number, rhs.owner_id))
        }
        }
    }
}

impl std::fmt::Display for BallotNum {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_null() {
            write!(fmt, "(null)")
        } else {
            write!(fmt, "({}, {})", self.proposal_number, self.owner_id)
        }
    }
}

/// One slot of the replicated log together with its value.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Decree {
    pub decree_num: DecreeNum,
    pub value: Value,
}

impl Decree {
    pub fn new(decree_num: DecreeNum, value: Value) -> Self {
        Decree { decree_num, value }
    }

    pub fn is_noop(&self) -> bool {
        self.value == NOOP
    }

    /// Whether `decree_num` names an addressable slot.
    pub fn is_valid_num(decree_num: DecreeNum) -> bool {
        (0..=MAX_DECREE_NUM).contains(&decree_num)
    }
}

/// Participant `owner_id` voted for `decree` under `ballot`.
///
/// Votes compare by ballot, then by owner. The decree takes no part
/// in the ordering.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug)]
pub struct Vote {
    pub owner_id: ParticipantId,
    pub ballot: BallotNum,
    pub decree: Decree,
}

impl PartialEq for Vote {
    fn eq(&self, rhs: &Self) -> bool {
        self.cmp(rhs) == Ordering::Equal
    }
}

impl Eq for Vote {}

impl PartialOrd for Vote {
    fn partial_cmp(&self, rhs: &Self) -> Option<Ordering> {
        Some(self.cmp(rhs))
    }
}

impl Ord for Vote {
    fn cmp(&self, rhs: &Self) -> Ordering {
        self.ballot.cmp(&rhs.ballot)
            .then(self.owner_id.cmp(&rhs.owner_id))
    }
}
