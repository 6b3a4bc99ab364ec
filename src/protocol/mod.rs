// Protocol module - OTX request/reply messages between nym and notary

mod message;

pub use message::{
    Command, CommandType, ProtocolError, Reply, ReplyPayload, ReplyStatus, Request, SignedReply, SignedRequest,
    MAX_MESSAGE_SIZE,
};
