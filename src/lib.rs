//! On-disk storage and chain-organization core for a Bitcoin-style full
//! node: memory-mapped record stores, the five coordinated databases
//! (block/tx/spend/history/stealth), the sequence-lock read path, and
//! the chain organizer that submits blocks through validation into the
//! persisted chain.

pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod metrics;
pub mod organizer;
pub mod pools;
pub mod priority_lock;
pub mod seqlock;
pub mod storage;
pub mod subscribers;
pub mod telemetry;
pub mod types;
pub mod validator;

pub use config::{Checkpoint, StoreConfig};
pub use db::DatabaseFacade;
pub use error::{Error, Result};
pub use organizer::{Organizer, SubmitOutcome};
pub use seqlock::SequenceLock;
pub use subscribers::{ReorganizeEvent, Subscribers, TransactionEvent};
