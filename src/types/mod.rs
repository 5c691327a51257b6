pub mod block;
pub mod hash;
pub mod header;
pub mod primitives;
pub mod script;
pub mod transaction;
pub mod varint;

pub use block::Block;
pub use hash::Hash32;
pub use header::BlockHeader;
pub use primitives::{Height, Inpoint, Outpoint, NULL_OUTPOINT_INDEX};
pub use script::Script;
pub use transaction::{Transaction, TxIn, TxOut};
