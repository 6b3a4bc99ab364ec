// otnotary - notary-mediated ledger with signed receipts, transaction
// numbers and recurring cron agreements

pub mod client;
pub mod consensus;
pub mod cron;
pub mod identity;
pub mod instrument;
pub mod ledger;
pub mod notary;
pub mod protocol;
pub mod storage;
