//! # Loupe Protocol
//!
//! Wire formats spoken between an editor and the agent.
//!
//! ```text
//! editor ──> AgentRequest {Cookie, Action:{Name, Data}, Props?}   (json | cbor | msgpack)
//!        <── AgentResponse {Cookie, Error, State}
//!
//! editor ──> {"Method","Token"}<TAB>{payload}                     (legacy, one per line)
//!        <── {"token","error","tag","data"}
//! ```
//!
//! `Data` stays encoded in the request's codec ([`ActionData`]) until the
//! action registry knows which concrete type to decode it into.

mod codec;
mod error;
pub mod legacy;
mod wire;

pub use codec::Codec;
pub use error::{CodecError, Result};
pub use wire::{ActionCall, ActionData, AgentRequest, AgentResponse, ClientAction, ClientRequest};
