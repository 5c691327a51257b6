//! The block/transaction/spend/history/stealth databases and the
//! façade that coordinates a block's push/pop across all five (spec
//! §4.6–§4.11).

pub mod block_db;
pub mod facade;
pub mod history_db;
pub mod spend_db;
pub mod stealth_db;
pub mod tx_db;

pub use block_db::BlockDb;
pub use facade::DatabaseFacade;
pub use history_db::HistoryDb;
pub use spend_db::SpendDb;
pub use stealth_db::StealthDb;
pub use tx_db::TxDb;
