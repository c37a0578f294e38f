//! Request-scoped script runtime on top of V8.
//!
//! An [`Engine`](engine::Engine) owns one isolate per worker thread. Each
//! request gets a [`Context`](context::Context) with its own V8 context,
//! builtins and superglobals, and talks to the outside world only through
//! its [`Host`](host::Host).

pub mod classify;
pub mod coerce;
pub mod config;
pub mod context;
mod conversion;
pub mod engine;
pub mod error;
pub mod host;
pub mod metadata;
mod ops;
mod request;
mod slot;
pub mod value;
mod watchdog;

use once_cell::sync::OnceCell;

/// V8 requires exactly one platform per process, set up before the first
/// isolate.
static V8_PLATFORM: OnceCell<v8::SharedRef<v8::Platform>> = OnceCell::new();

/// Process-wide setup shared by every engine. Safe to call repeatedly.
pub(crate) fn initialize_process_once() {
    V8_PLATFORM.get_or_init(|| {
        // a client hanging up must surface as a short write, not kill the process
        #[cfg(unix)]
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();
        tracing::debug!("v8 platform initialized");
        platform
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_initializes_once() {
        initialize_process_once();
        let first = V8_PLATFORM.get().map(|platform| platform as *const _);
        assert!(first.is_some());

        initialize_process_once();
        assert_eq!(V8_PLATFORM.get().map(|platform| platform as *const _), first);
    }
}
