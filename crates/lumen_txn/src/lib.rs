//! Broker-side XA resource manager: tracks live transactions by Xid,
//! records heuristic completions, and rolls back transactions that outlive
//! their timeout.

pub mod reaper;
pub mod resource_manager;
pub mod transaction;


pub use reaper::TimeoutReaper;
pub use resource_manager::{HeuristicCompletion, ReapReport, ResourceManager};
pub use transaction::{LocalTransaction, Transaction, TxState};
