use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// A value dispatched to the store.
///
/// Implement it with [`crate::action!`] rather than by hand.
pub trait Action: Send + Sync + fmt::Debug + 'static {
    fn name(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
}

impl dyn Action {
    pub fn is<T: Action>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: Action>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Implements [`Action`] for one or more types, using the type name as the
/// action name.
#[macro_export]
macro_rules! action {
    ($($ty:ident),+ $(,)?) => {
        $(
            impl $crate::Action for $ty {
                fn name(&self) -> &str {
                    stringify!($ty)
                }

                fn as_any(&self) -> &dyn ::std::any::Any {
                    self
                }
            }
        )+
    };
}

macro_rules! unit_actions {
    ($($(#[$meta:meta])* $ty:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
            pub struct $ty;
        )+
        action!($($ty),+);
    };
}

unit_actions!(
    /// Dispatched once by the agent before the first client request.
    Started,
    /// Delivered to mounted reducers while the store shuts down.
    Unmount,
    QueryCompletions,
    QueryIssues,
    QueryUserCmds,
    Restart,
    /// Asks the agent to stop reading requests.
    Shutdown,
    ViewActivated,
    ViewFmt,
    ViewLoaded,
    ViewModified,
    ViewPosChanged,
    ViewPreSave,
    ViewSaved,
);

/// Runs a user command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RunCmd {
    pub name: String,
    pub args: Vec<String>,
    pub input: bool,
}

action!(RunCmd);
