// Identity module - keys, signatures and the identifiers of nyms, notaries,
// accounts and units

mod identifier;
mod keypair;
mod nym;
mod signer;

pub use identifier::{AccountId, IdentifierError, NotaryId, UnitId};
pub use keypair::{Keypair, KeypairError, PublicKey};
pub use nym::{NymError, NymId};
pub use signer::{Document, Signature, SignatureError, Signed, Signer};
