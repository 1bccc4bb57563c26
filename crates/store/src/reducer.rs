use crate::ctx::Ctx;
use crate::state::{EditorConfig, State};

/// A unit of the reduction pipeline.
///
/// Only [`Reducer::reduce`] is required. The store calls the lifecycle hooks
/// in this order for every action: `init` (once per lifetime), `cond`,
/// then `mount` or `unmount` when the condition flips, `config` and `reduce`
/// while mounted. Every `mount` is eventually paired with an `unmount`.
pub trait Reducer: Send + 'static {
    fn label(&self) -> String {
        let name = std::any::type_name::<Self>();
        name.rsplit("::").next().unwrap_or(name).to_string()
    }

    fn init(&mut self, _mx: &Ctx) {}

    /// Whether the reducer should be mounted for this action.
    fn cond(&mut self, _mx: &Ctx) -> bool {
        true
    }

    fn mount(&mut self, _mx: &Ctx) {}

    fn unmount(&mut self, _mx: &Ctx) {}

    /// Config to install into the state before `reduce` runs.
    fn config(&mut self, _mx: &Ctx) -> Option<EditorConfig> {
        None
    }

    fn reduce(&mut self, mx: &Ctx) -> State;
}

/// A reducer backed by a closure.
pub struct FnReducer<F> {
    label: String,
    f: F,
}

/// Wraps `f` as a [`Reducer`] with no lifecycle hooks.
pub fn reducer_fn<F>(label: impl Into<String>, f: F) -> FnReducer<F>
where
    F: FnMut(&Ctx) -> State + Send + 'static,
{
    FnReducer {
        label: label.into(),
        f,
    }
}

impl<F> Reducer for FnReducer<F>
where
    F: FnMut(&Ctx) -> State + Send + 'static,
{
    fn label(&self) -> String {
        self.label.clone()
    }

    fn reduce(&mut self, mx: &Ctx) -> State {
        (self.f)(mx)
    }
}
