//! # Loupe Store
//!
//! Actions, state, and the reducer pipeline that turns one into the other.
//!
//! ## Architecture
//!
//! ```text
//! ActionRegistry ──(name, ActionData)──> Arc<dyn Action>
//!                                             │
//!                                   Store::dispatch (queued)
//!                                             │
//!                                     dispatcher task (one at a time)
//!                                             │
//!   State::reset_ephemeral ──> Ctx ──> for each Reducer, in order:
//!                                        init (once) → cond → mount/unmount
//!                                        → config → reduce
//!                                             │
//!                                     new State stored
//!                                             │
//!                                subscribers, in subscription order
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use loupe_store::{reducer_fn, Started, Store, StoreConfig};
//!
//! # async fn demo() {
//! let store = Store::new(StoreConfig::default());
//! store.use_reducer(reducer_fn("hello", |mx| {
//!     if mx.action_is::<Started>() {
//!         mx.state.clone().add_status(["hello"])
//!     } else {
//!         mx.state.clone()
//!     }
//! }));
//! store.start().unwrap();
//! store.dispatch(Started);
//! store.flush().await;
//! assert_eq!(store.state().status, vec!["hello".to_string()]);
//! # }
//! ```

mod action;
mod ctx;
mod env;
mod error;
mod profile;
mod reducer;
mod registry;
mod state;
mod store;
mod view;

pub use action::{
    Action, QueryCompletions, QueryIssues, QueryUserCmds, Restart, RunCmd, Shutdown, Started,
    Unmount, ViewActivated, ViewFmt, ViewLoaded, ViewModified, ViewPosChanged, ViewPreSave,
    ViewSaved,
};
pub use ctx::Ctx;
pub use env::EnvMap;
pub use error::{Result, StoreError};
pub use profile::{
    fmt_duration, profiling_enabled, set_profiling, Profile, ProfileGuard, ProfileNode,
};
pub use reducer::{reducer_fn, FnReducer, Reducer};
pub use registry::{ActionCreator, ActionRegistry};
pub use state::{Completion, EditorConfig, Issue, IssueTag, State, Tooltip, UserCmd};
pub use store::{Listener, Prepare, Store, StoreConfig};
pub use view::{byte_pos, row_col, src_hash, View};
