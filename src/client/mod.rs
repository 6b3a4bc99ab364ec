// Client module - a nym's side of the notary protocol
//
// A `ServerSession` keeps the nym's context with one notary in step with
// the notary's copy: it sequences requests, retries lost deliveries,
// repairs the nymbox when the notary asks for it and tracks outgoing
// payments until they complete.

mod channel;
mod session;
mod workflow;

pub use channel::{ChannelError, FlakyChannel, LocalChannel, NotaryChannel};
pub use session::{AccountCopy, DeliveryState, ServerSession, SessionConfig, SessionError};
pub use workflow::{PaymentKind, PaymentWorkflow, WorkflowError, WorkflowState};
