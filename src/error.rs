use thiserror::Error;

/// Errors surfaced by the storage substrate, the five databases, the
/// validator and the organizer.
///
/// The validation variants correspond one-to-one with the rule names in
/// the check/accept/connect pipeline so that a rejected block can be
/// reported back to its submitter without re-deriving which rule fired.
#[derive(Debug, Error)]
pub enum Error {
    #[error("service stopped")]
    ServiceStopped,

    #[error("not found")]
    NotFound,

    #[error("duplicate block")]
    DuplicateBlock,

    #[error("orphan block")]
    OrphanBlock,

    #[error("insufficient work")]
    InsufficientWork,

    #[error("empty transaction list or oversized block")]
    SizeLimits,

    #[error("proof of work does not satisfy declared target")]
    ProofOfWork,

    #[error("block timestamp too far in the future")]
    FuturisticTimestamp,

    #[error("first transaction is not a coinbase")]
    FirstNotCoinbase,

    #[error("more than one coinbase transaction")]
    ExtraCoinbases,

    #[error("merkle root mismatch")]
    MerkleMismatch,

    #[error("too many signature operations")]
    TooManySigs,

    #[error("bits field does not match required work")]
    IncorrectProofOfWork,

    #[error("timestamp not after median of previous 11 blocks")]
    TimestampTooEarly,

    #[error("transaction is not final at this height/time")]
    NonFinalTransaction,

    #[error("block fails a configured checkpoint")]
    CheckpointsFailed,

    #[error("block version too old for this height")]
    OldVersionBlock,

    #[error("coinbase script does not encode height (BIP34)")]
    CoinbaseHeightMismatch,

    #[error("transaction hash duplicates an unspent coinbase (BIP30)")]
    DuplicateOrSpent,

    #[error("script consensus validation failed")]
    ValidateInputsFailed,

    #[error("fees out of range")]
    FeesOutOfRange,

    #[error("coinbase output value exceeds subsidy plus fees")]
    CoinbaseTooLarge,

    #[error("referenced previous output not found")]
    InputNotFound,

    #[error("coinbase spent before maturity")]
    CoinbaseMaturity,

    #[error("double spend detected")]
    DoubleSpend,

    #[error("spend exceeds available value")]
    SpendExceedsValue,

    #[error("output value overflow")]
    OutputValueOverflow,

    #[error("invalid coinbase script length")]
    InvalidCoinbaseScriptSize,

    #[error("non-coinbase input references the null outpoint")]
    PreviousOutputNull,

    #[error("transaction has no inputs or no outputs")]
    EmptyTransaction,

    #[error("unexpected invariant break: {0}")]
    OperationFailed(String),

    #[error("store is corrupt: {0}")]
    Corrupt(String),

    #[error("database directory is already locked by another process")]
    AlreadyLocked,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
