//! # Loupe Agent
//!
//! The editor-facing process: decodes requests, dispatches actions into a
//! [`loupe_store::Store`] and streams every new state back.
//!
//! ## Architecture
//!
//! ```text
//! stdin ──> AgentRequest::decode ──> ActionRegistry::create ──> Store::dispatch_with
//!                                                                     │
//!                                              EnvDefaults → Ready → user reducers
//!                                                                     │
//! stdout <── AgentResponse {Cookie, Error, State} <── subscriber <────┘
//! ```
//!
//! [`Broker`] serves the older line-oriented method-call protocol instead.
//!
//! ## Example
//!
//! ```rust,no_run
//! use loupe_agent::{Agent, AgentConfig};
//! use loupe_goimport::GoTypeCheck;
//!
//! # async fn demo() -> loupe_agent::Result<()> {
//! let agent = Agent::new(AgentConfig {
//!     codec: "cbor".to_string(),
//!     ..Default::default()
//! })?;
//! agent.use_reducer(GoTypeCheck::new());
//! agent.run().await
//! # }
//! ```

mod agent;
mod error;
mod legacy;
mod reducers;
mod settings;
mod stream;

pub use agent::{Agent, AgentConfig};
pub use error::{AgentError, Result};
pub use legacy::{Broker, BrokerStats, Method, MethodRegistry};
pub use reducers::{EnvDefaults, Ready};
pub use settings::AgentSettings;
pub use stream::{Input, Output};
