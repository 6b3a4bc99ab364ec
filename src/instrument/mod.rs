// Instrument module - the signed documents nyms hand to the notary
//
// Transactions carry one operation plus a balance agreement. Cheques and
// vouchers travel between nyms out of band; cron agreements are signed by
// every party before the notary schedules them.

mod agreement;
mod builder;
mod cheque;
mod codec;
mod transaction;

pub use agreement::{
    BasketDirection, ContractParty, MarketOffer, MarketSide, PaymentPlan, PlanAction, RecurringPayment,
    SignedContract, SignedPlan, SmartContract,
};
pub use builder::{BuildError, TransactionBuilder};
pub use cheque::{Cheque, SignedCheque};
pub use codec::{Armored, CodecError};
pub use transaction::{
    BalanceAgreement, Operation, SignedResponse, SignedTransaction, Transaction, TransactionFailure,
    TransactionResponse,
};
