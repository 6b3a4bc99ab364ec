// Cron module - agreements the notary re-evaluates on every tick
//
// Payment plans, market offers and smart contracts share one queue. The
// queue and the per-item schedules live here; `Notary::process_cron`
// executes them against accounts.

mod item;
mod queue;

pub use item::{ContractState, CronItem, CronKind, CronParty, CronStatus, OfferState, PlanSchedule, PlanState};
pub use queue::{CronError, CronQueue};
