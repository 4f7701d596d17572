//! Collection buffer that routes are registered into while a script runs.
//!
//! A script has no way to return its declarations, so the loader opens a
//! load session on a hook and the script's `route()` capability registers each
//! route it builds. Only one session may be open on a hook at a time.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::trace;

use crate::route::Route;

#[derive(Default)]
struct HookState {
    enabled: bool,
    routes: Vec<Route>,
}

#[derive(Default)]
pub struct RegistrationHook {
    state: Mutex<HookState>,
    sessions: Mutex<()>,
}

impl RegistrationHook {
    pub fn new() -> RegistrationHook {
        RegistrationHook::default()
    }

    /// The process-wide hook used by [`crate::script_loader::load_file`].
    pub fn global() -> Arc<RegistrationHook> {
        static HOOK: OnceLock<Arc<RegistrationHook>> = OnceLock::new();
        Arc::clone(HOOK.get_or_init(|| Arc::new(RegistrationHook::new())))
    }

    fn lock_state(&self) -> MutexGuard<'_, HookState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clears the buffer and starts capturing.
    ///
    /// # Panics
    ///
    /// Panics if the hook is already active. Nested or overlapping activations
    /// are a programming error; use [`RegistrationHook::open_session`] to wait
    /// for the running load instead.
    pub fn activate(&self) -> Activation<'_> {
        let mut state = self.lock_state();
        assert!(!state.enabled, "registration hook is already active");
        state.routes.clear();
        state.enabled = true;
        Activation { hook: self }
    }

    /// Waits until no other session is open on this hook, then activates it.
    pub fn open_session(&self) -> LoadSession<'_> {
        let exclusive = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        LoadSession {
            activation: self.activate(),
            _exclusive: exclusive,
        }
    }

    /// Captures `route` if the hook is active. Returns whether it was captured.
    pub fn register(&self, route: Route) -> bool {
        let mut state = self.lock_state();
        if !state.enabled {
            trace!(route = route.name(), "hook inactive, route not captured");
            return false;
        }
        state.routes.push(route);
        true
    }

    pub fn is_active(&self) -> bool {
        self.lock_state().enabled
    }
}

/// Scoped activation; deactivates the hook when dropped, on success or failure.
pub struct Activation<'a> {
    hook: &'a RegistrationHook,
}

impl Activation<'_> {
    /// Routes captured so far, in registration order.
    pub fn routes(&self) -> Vec<Route> {
        self.hook.lock_state().routes.clone()
    }

    /// Ends the activation and hands over the captured routes.
    pub fn finish(self) -> Vec<Route> {
        mem::take(&mut self.hook.lock_state().routes)
    }
}

impl Drop for Activation<'_> {
    fn drop(&mut self) {
        let mut state = self.hook.lock_state();
        state.enabled = false;
        state.routes.clear();
    }
}

/// An activation that also holds the hook's session lock.
pub struct LoadSession<'a> {
    // Dropped first so the hook is inactive before the next session may start.
    activation: Activation<'a>,
    _exclusive: MutexGuard<'a, ()>,
}

impl LoadSession<'_> {
    pub fn routes(&self) -> Vec<Route> {
        self.activation.routes()
    }

    pub fn finish(self) -> Vec<Route> {
        let LoadSession { activation, _exclusive } = self;
        activation.finish()
    }
}
