use crate::action::Action;
use crate::env::EnvMap;
use crate::profile::Profile;
use crate::state::State;
use crate::store::Store;
use crate::view::View;
use loupe_vfs::{Memo, Vfs};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The argument handed to every reducer: one state, one action, and the
/// services a reducer may use. It does not change during a reducer call.
#[derive(Clone)]
pub struct Ctx {
    pub state: State,
    pub action: Arc<dyn Action>,
    /// Cookie of the request that produced the action, if any.
    pub cookie: String,
    pub store: Store,
    pub profile: Arc<Profile>,
    /// Cancelled by [`Ctx::cancel`] or when the store shuts down. Each
    /// reduction gets its own token.
    pub cancel: CancellationToken,
    pub vfs: Vfs,
    kv: Arc<Memo>,
}

impl Ctx {
    pub(crate) fn new(store: &Store, state: State, action: Arc<dyn Action>, cookie: String) -> Self {
        Self {
            state,
            action,
            cookie,
            store: store.clone(),
            profile: store.profile(),
            cancel: store.cancel_token().child_token(),
            vfs: store.vfs().clone(),
            kv: store.kv(),
        }
    }

    pub fn env(&self) -> &EnvMap {
        &self.state.env
    }

    pub fn view(&self) -> &View {
        &self.state.view
    }

    pub fn action_is<T: Action>(&self) -> bool {
        self.action.is::<T>()
    }

    pub fn action_as<T: Action>(&self) -> Option<&T> {
        self.action.downcast_ref::<T>()
    }

    /// The store-wide key-value cache, e.g. for parsed files.
    pub fn kv(&self) -> &Memo {
        &self.kv
    }

    /// Queues `action` behind the current reduction.
    pub fn dispatch(&self, action: impl Action) {
        self.store.dispatch(action);
    }

    /// Aborts work started for this dispatch, such as a running build tool.
    /// Other dispatches are unaffected.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `<action>#<cookie>`, the label used in logs.
    pub fn label(&self) -> String {
        format!("{}#{}", self.action.name(), self.cookie)
    }
}

impl fmt::Debug for Ctx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx")
            .field("action", &self.action)
            .field("cookie", &self.cookie)
            .finish_non_exhaustive()
    }
}
