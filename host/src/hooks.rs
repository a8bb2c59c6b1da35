//! Server lifecycle hooks.
//!
//! One method per lifecycle boundary, default no-ops, so hosts implement
//! only what they observe. A panicking hook is caught and logged at warn
//! level; it never takes the server loop down.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Callbacks at the server lifecycle boundaries, in the order they fire:
/// `server_create`, `queue_create`, `bind`, `server_start`, `run`,
/// `shutdown`, `stopped`, `exit`. `bind` carries the bound port (the only
/// way an ephemeral port is surfaced) and fires before any accept can
/// complete; `exit` fires unconditionally on scope exit, errors included.
pub trait ServerHooks {
    fn on_server_create(&self) {}
    fn on_queue_create(&self) {}
    fn on_bind(&self, port: u16) {
        let _ = port;
    }
    fn on_server_start(&self) {}
    fn on_run(&self) {}
    fn on_shutdown(&self) {}
    fn on_stopped(&self) {}
    fn on_exit(&self) {}
}

/// The do-nothing hook set.
pub struct NoopHooks;

impl ServerHooks for NoopHooks {}

/// Run one hook, containing panics.
pub(crate) fn guarded(name: &'static str, hook: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(hook)) {
        tracing::warn!(hook = name, panic = %panic_message(&payload), "lifecycle hook panicked");
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Fires `on_exit` when dropped, covering every return path.
pub(crate) struct ExitGuard<'a> {
    hooks: &'a dyn ServerHooks,
}

impl<'a> ExitGuard<'a> {
    pub fn new(hooks: &'a dyn ServerHooks) -> Self {
        Self { hooks }
    }
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        guarded("exit", || self.hooks.on_exit());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn noop_hooks_do_nothing() {
        let hooks = NoopHooks;
        hooks.on_server_create();
        hooks.on_bind(1234);
        hooks.on_exit();
    }

    #[test]
    fn guarded_contains_panics() {
        guarded("test", || panic!("boom"));
        guarded("test", || panic!("{}", String::from("formatted")));
    }

    #[test]
    fn exit_guard_fires_on_drop() {
        struct Counting(AtomicU32);
        impl ServerHooks for Counting {
            fn on_exit(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hooks = Counting(AtomicU32::new(0));
        {
            let _guard = ExitGuard::new(&hooks);
        }
        assert_eq!(hooks.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exit_guard_fires_even_if_hook_panics() {
        struct Panicking;
        impl ServerHooks for Panicking {
            fn on_exit(&self) {
                panic!("exit hook panic");
            }
        }
        let hooks = Panicking;
        let guard = ExitGuard::new(&hooks);
        drop(guard);
    }
}
