//! # Summary
//!
//! This module abstracts over stable storage. To perform failure recovery, Paxos
//! requires that the promise register, the last attempted ballot, the commit
//! frontier and every vote persist between failures.
//!
//! The ledger file starts with a header page:
//!
//! ```text
//! { process_id: i32, last_tried: BallotNum, max_bal: BallotNum, commit_num: i64 }
//! ```
//!
//! padded with zeroes to `PAGE_SIZE`, followed by a dense array of decree
//! records at `PAGE_SIZE + decree_num * RECORD_SIZE`:
//!
//! ```text
//! { status: u8, value: i64, max_vbal: BallotNum }
//! ```
//!
//! Both are encoded with `bincode` using fixed-width little endian integers.
//! Every mutation is followed by `sync_data` before the call returns. Any
//! failure poisons the ledger: later calls fail with `LedgerError::Poisoned`.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bincode::Options;
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};

use crate::types::{BallotNum, Decree, DecreeNum, ParticipantId, Value};

/// Size of the header page.
pub const PAGE_SIZE: u64 = 8 * 1024;

/// Size of one encoded decree record.
pub const RECORD_SIZE: u64 = 1 + 8 + 12;

const HEADER_SIZE: usize = 4 + 12 + 12 + 8;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger encoding failure: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("ledger belongs to process {found}, expected {expected}")]
    ProcessMismatch {
        expected: ParticipantId,
        found: ParticipantId,
    },

    #[error("decree {0} is already committed")]
    AlreadyCommitted(DecreeNum),

    #[error("decree {decree_num} is committed as {committed}, refusing {proposed}")]
    ConflictingOutcome {
        decree_num: DecreeNum,
        committed: Value,
        proposed: Value,
    },

    #[error("invalid decree number {0}")]
    InvalidDecree(DecreeNum),

    #[error("corrupt record for decree {0}")]
    CorruptRecord(DecreeNum),

    #[error("corrupt ledger header")]
    CorruptHeader,

    #[error("ledger {0} already exists")]
    AlreadyExists(PathBuf),

    #[error("ledger {0} does not exist")]
    NotFound(PathBuf),

    #[error("ledger is unusable after an earlier failure")]
    Poisoned,
}

/// Lifecycle of a single decree record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Uninitialized,
    Committed,
    InBallot,
}

impl Status {
    fn to_byte(self) -> u8 {
        match self {
        | Status::Uninitialized => 0,
        | Status::Committed => 42,
        | Status::InBallot => 24,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
        | 0 => Some(Status::Uninitialized),
        | 42 => Some(Status::Committed),
        | 24 => Some(Status::InBallot),
        | _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug)]
struct Header {
    process_id: ParticipantId,
    last_tried: BallotNum,
    max_bal: BallotNum,
    commit_num: DecreeNum,
}

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug)]
struct Record {
    status: u8,
    value: Value,
    max_vbal: BallotNum,
}

impl Record {
    fn uninitialized() -> Self {
        Record {
            status: Status::Uninitialized.to_byte(),
            value: 0,
            max_vbal: BallotNum::null(),
        }
    }
}

fn options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
}

/// Durable consensus state of one process.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Ledger {
    path: PathBuf,
    #[derivative(Debug = "ignore")]
    inner: Mutex<Inner>,
}

struct Inner {
    file: fs::File,
    header: Header,
    poisoned: bool,
}

impl Inner {
    fn offset(decree_num: DecreeNum) -> Result<u64, LedgerError> {
        if !Decree::is_valid_num(decree_num) {
            return Err(LedgerError::InvalidDecree(decree_num))
        }
        (decree_num as u64)
            .checked_mul(RECORD_SIZE)
            .and_then(|offset| offset.checked_add(PAGE_SIZE))
            .ok_or(LedgerError::InvalidDecree(decree_num))
    }

    fn write_header(&mut self) -> Result<(), LedgerError> {
        let bytes = options().serialize(&self.header)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn read_record(&mut self, decree_num: DecreeNum) -> Result<(Status, Record), LedgerError> {
        let offset = Self::offset(decree_num)?;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut bytes = Vec::with_capacity(RECORD_SIZE as usize);
        Read::by_ref(&mut self.file).take(RECORD_SIZE).read_to_end(&mut bytes)?;

        // Past end of file, or a record whose write never completed
        if bytes.len() < RECORD_SIZE as usize {
            if !bytes.is_empty() {
                warn!("ignoring torn record for decree {}", decree_num);
            }
            return Ok((Status::Uninitialized, Record::uninitialized()))
        }

        let record: Record = options().deserialize(&bytes)?;
        let status = Status::from_byte(record.status)
            .ok_or(LedgerError::CorruptRecord(decree_num))?;
        Ok((status, record))
    }

    fn write_record(&mut self, decree_num: DecreeNum, record: &Record) -> Result<(), LedgerError> {
        let offset = Self::offset(decree_num)?;
        let bytes = options().serialize(record)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Number of complete records currently on disk.
    fn record_count(&self) -> Result<i64, LedgerError> {
        let len = self.file.metadata()?.len();
        Ok(len.saturating_sub(PAGE_SIZE) as i64 / RECORD_SIZE as i64)
    }
}

impl Ledger {
    /// Location of ledger `name` inside `dir`.
    pub fn path<P: AsRef<Path>>(dir: P, name: &str) -> PathBuf {
        dir.as_ref().join(name)
    }

    pub fn exists<P: AsRef<Path>>(dir: P, name: &str) -> bool {
        Self::path(dir, name).is_file()
    }

    /// Creates a fresh ledger owned by process `id`. Fails if one already exists.
    pub fn create<P: AsRef<Path>>(dir: P, name: &str, id: ParticipantId) -> Result<Self, LedgerError> {
        let path = Self::path(dir, name);
        let mut file = match fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
        | Ok(file) => file,
        | Err(ref error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(LedgerError::AlreadyExists(path))
        }
        | Err(error) => return Err(error.into()),
        };

        let header = Header {
            process_id: id,
            last_tried: BallotNum::null(),
            max_bal: BallotNum::null(),
            commit_num: -1,
        };
        let mut page = options().serialize(&header)?;
        page.resize(PAGE_SIZE as usize, 0);
        file.write_all(&page)?;
        file.sync_all()?;

        debug!("created ledger {:?} for process {}", path, id);
        Ok(Ledger {
            path,
            inner: Mutex::new(Inner {
                file,
                header,
                poisoned: false,
            }),
        })
    }

    /// Opens an existing ledger, checking that it belongs to process `id`.
    pub fn open<P: AsRef<Path>>(dir: P, name: &str, id: ParticipantId) -> Result<Self, LedgerError> {
        let path = Self::path(dir, name);
        let mut file = match fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
        {
        | Ok(file) => file,
        | Err(ref error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(LedgerError::NotFound(path))
        }
        | Err(error) => return Err(error.into()),
        };

        let mut bytes = [0u8; HEADER_SIZE];
        file.read_exact(&mut bytes).map_err(|error| {
            if error.kind() == std::io::ErrorKind::UnexpectedEof {
                LedgerError::CorruptHeader
            } else {
                LedgerError::Io(error)
            }
        })?;
        let header: Header = options().deserialize(&bytes)?;

        if header.process_id != id {
            error!("ledger {:?} belongs to process {}, not {}", path, header.process_id, id);
            return Err(LedgerError::ProcessMismatch {
                expected: id,
                found: header.process_id,
            })
        }

        debug!(
            "opened ledger {:?}: last tried {}, max bal {}, commit num {}",
            path,
            header.last_tried,
            header.max_bal,
            header.commit_num,
        );
        Ok(Ledger {
            path,
            inner: Mutex::new(Inner {
                file,
                header,
                poisoned: false,
            }),
        })
    }

    pub fn create_if_not_existing<P: AsRef<Path>>(dir: P, name: &str, id: ParticipantId) -> Result<Self, LedgerError> {
        if Self::exists(&dir, name) {
            Self::open(dir, name, id)
        } else {
            Self::create(dir, name, id)
        }
    }

    /// Flushes everything to stable media and releases the file.
    pub fn close(self) -> Result<(), LedgerError> {
        let inner = self.inner.into_inner();
        if inner.poisoned {
            return Err(LedgerError::Poisoned)
        }
        inner.file.sync_all()?;
        debug!("closed ledger {:?}", self.path);
        Ok(())
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    pub fn process_id(&self) -> ParticipantId {
        self.inner.lock().header.process_id
    }

    /// Runs `f` inside the ledger's critical section, poisoning on failure.
    fn with<T, F>(&self, f: F) -> Result<T, LedgerError>
        where F: FnOnce(&mut Inner) -> Result<T, LedgerError>
    {
        let mut inner = self.inner.lock();
        if inner.poisoned {
            return Err(LedgerError::Poisoned)
        }
        let result = f(&mut inner);
        if let Err(error) = &result {
            error!("ledger {:?} failed: {}", self.path, error);
            inner.poisoned = true;
        }
        result
    }

    pub fn set_last_tried(&self, ballot: BallotNum) -> Result<(), LedgerError> {
        self.with(|inner| {
            inner.header.last_tried = ballot;
            inner.write_header()
        })
    }

    pub fn last_tried(&self) -> BallotNum {
        self.inner.lock().header.last_tried
    }

    pub fn set_max_bal(&self, ballot: BallotNum) -> Result<(), LedgerError> {
        self.with(|inner| {
            inner.header.max_bal = ballot;
            inner.write_header()
        })
    }

    pub fn max_bal(&self) -> BallotNum {
        self.inner.lock().header.max_bal
    }

    pub fn commit_num(&self) -> DecreeNum {
        self.inner.lock().header.commit_num
    }

    pub fn status(&self, decree_num: DecreeNum) -> Result<Status, LedgerError> {
        self.with(|inner| inner.read_record(decree_num).map(|(status, _)| status))
    }

    /// Records a vote for `value` in slot `decree_num` under `ballot`.
    /// Committed decrees never accept votes.
    pub fn set_max_vbal(&self, ballot: BallotNum, decree_num: DecreeNum, value: Value) -> Result<(), LedgerError> {
        self.with(|inner| {
            let (status, _) = inner.read_record(decree_num)?;
            if status == Status::Committed {
                return Err(LedgerError::AlreadyCommitted(decree_num))
            }
            trace!("voting {} for decree {} under {}", value, decree_num, ballot);
            inner.write_record(decree_num, &Record {
                status: Status::InBallot.to_byte(),
                value,
                max_vbal: ballot,
            })
        })
    }

    /// Ballot of the current vote for `decree_num`, or null.
    pub fn max_vbal(&self, decree_num: DecreeNum) -> Result<BallotNum, LedgerError> {
        self.with(|inner| {
            let (status, record) = inner.read_record(decree_num)?;
            match status {
            | Status::InBallot => Ok(record.max_vbal),
            | _ => Ok(BallotNum::null()),
            }
        })
    }

    /// Decree of the current vote for `decree_num`, if any.
    pub fn max_val(&self, decree_num: DecreeNum) -> Result<Option<Decree>, LedgerError> {
        self.with(|inner| {
            let (status, record) = inner.read_record(decree_num)?;
            match status {
            | Status::InBallot => Ok(Some(Decree::new(decree_num, record.value))),
            | _ => Ok(None),
            }
        })
    }

    /// Commits `value` for `decree_num`, advancing the commit frontier over
    /// every consecutive committed decree. Re-committing the same value is a
    /// no-op; committing a different one is refused.
    pub fn set_outcome(&self, decree_num: DecreeNum, value: Value) -> Result<(), LedgerError> {
        self.with(|inner| {
            let (status, record) = inner.read_record(decree_num)?;
            if status == Status::Committed {
                if record.value == value {
                    return Ok(())
                }
                return Err(LedgerError::ConflictingOutcome {
                    decree_num,
                    committed: record.value,
                    proposed: value,
                })
            }

            inner.write_record(decree_num, &Record {
                status: Status::Committed.to_byte(),
                value,
                max_vbal: record.max_vbal,
            })?;

            if decree_num == inner.header.commit_num + 1 {
                let mut frontier = decree_num;
                while inner.read_record(frontier + 1)?.0 == Status::Committed {
                    frontier += 1;
                }
                inner.header.commit_num = frontier;
                inner.write_header()?;
                trace!("commit frontier advanced to {}", frontier);
            }
            Ok(())
        })
    }

    /// Committed value of `decree_num`, if any.
    pub fn outcome(&self, decree_num: DecreeNum) -> Result<Option<Value>, LedgerError> {
        self.with(|inner| {
            let (status, record) = inner.read_record(decree_num)?;
            match status {
            | Status::Committed => Ok(Some(record.value)),
            | _ => Ok(None),
            }
        })
    }

    /// Every vote past the commit frontier, in decree order.
    pub fn undecided_ballots(&self) -> Result<Vec<(BallotNum, Decree)>, LedgerError> {
        self.with(|inner| {
            let mut undecided = Vec::new();
            let count = inner.record_count()?;
            for decree_num in (inner.header.commit_num + 1)..count {
                let (status, record) = inner.read_record(decree_num)?;
                if status == Status::InBallot {
                    undecided.push((record.max_vbal, Decree::new(decree_num, record.value)));
                }
            }
            Ok(undecided)
        })
    }

    /// Committed decrees above the commit frontier, learned out of order.
    pub fn committed_past_frontier(&self) -> Result<Vec<Decree>, LedgerError> {
        self.with(|inner| {
            let mut decrees = Vec::new();
            let count = inner.record_count()?;
            for decree_num in (inner.header.commit_num + 1)..count {
                let (status, record) = inner.read_record(decree_num)?;
                if status == Status::Committed {
                    decrees.push(Decree::new(decree_num, record.value));
                }
            }
            Ok(decrees)
        })
    }

    /// Committed decrees in `(after, through]`, in decree order.
    pub fn committed_decrees(&self, after: DecreeNum, through: DecreeNum) -> Result<Vec<Decree>, LedgerError> {
        self.with(|inner| {
            let mut decrees = Vec::new();
            for decree_num in after.saturating_add(1).max(0)..=through {
                let (status, record) = inner.read_record(decree_num)?;
                if status == Status::Committed {
                    decrees.push(Decree::new(decree_num, record.value));
                }
            }
            Ok(decrees)
        })
    }
}
