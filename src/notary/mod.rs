// Notary module - the server engine
//
// Requests are verified, sequenced and dispatched under the requesting
// nym's context lock. Transactions run through one notarization pipeline
// that always answers with a signed response. Cron agreements are
// executed by `Notary::process_cron`.

mod agreements;
mod config;
mod contexts;
mod cron;
mod inbox;
mod notarize;
mod server;

pub use config::{NotaryConfig, NotaryError};
pub use cron::CronReport;
pub use server::{Notary, NotaryStats};
