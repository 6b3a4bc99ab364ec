// Consensus module - per (nym, notary) agreement on request numbers,
// transaction numbers and box hashes

mod context;
mod numbers;
mod repository;
mod statement;

pub use context::{
    ClientState, ConsensusContext, ConsensusError, ConsensusRole, PendingDelivery, ServerState,
};
pub use numbers::{NumberState, RequestNumber, TransactionNumber, TransactionNumberLedger};
pub use repository::{ContextGuard, ContextRepository};
pub use statement::{SignedStatement, TransactionStatement};
