//! Page collaborator: everything the engine asks of the hosting page.

use doors_core::{ActionExecutor, Call, HookId, Outcome, PageState, Payload};
use serde_json::Value;

pub trait Page: Send + 'static {
    /// Run one delivered or hook-attached action.
    fn execute(&mut self, call: &Call, payload: &Payload) -> Outcome;

    fn indicator_start(&mut self, _hook: HookId, _indicator: &Value) {}

    fn indicator_end(&mut self, _hook: HookId) {}

    /// Full page reload after the instance is gone.
    fn reload(&mut self);

    /// Called once when the page turns dead.
    fn on_terminal(&mut self, _state: PageState) {}
}

/// Adapts a page to the core's executor seam.
pub(crate) struct Executor<'a>(pub &'a mut dyn Page);

impl ActionExecutor for Executor<'_> {
    fn execute(&mut self, call: &Call, payload: &Payload) -> Outcome {
        self.0.execute(call, payload)
    }
}
