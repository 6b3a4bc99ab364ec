// Ledger module - accounts, the mailbox ledgers around them, and the
// wallet that hands out exclusive access to both

mod account;
mod boxes;
mod unit;
mod wallet;

pub use account::{Account, AccountType, LedgerError};
pub use boxes::{Attachment, BoxItem, BoxItemKind, BoxKind, Ledger, LedgerHash, LedgerOwner, Receipt};
pub use unit::{Basket, BasketComponent, UnitDefinition};
pub use wallet::{AccountGuard, AccountSet, LedgerGuard, LedgerSet, Wallet};
