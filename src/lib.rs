//! Request-scoped JavaScript execution for host processes.
//!
//! A host (typically an HTTP server) creates one [`Engine`] per worker thread
//! and drives each request through a [`Context`]:
//!
//! ```no_run
//! use jshost::{Context, Engine, EngineConfig, RequestMetadata, ResponseRecorder};
//!
//! let engine = Engine::init(EngineConfig::default())?;
//! let recorder = ResponseRecorder::new();
//! let metadata = RequestMetadata::from_pairs([("REQUEST_METHOD", "GET")]);
//!
//! let mut context = Context::new(&engine, Some(metadata), recorder.clone())?.startup()?;
//! context.eval("echo('hello')")?;
//! context.destroy();
//!
//! assert_eq!(recorder.body(), b"hello");
//! engine.shutdown();
//! # Ok::<(), jshost::Error>(())
//! ```
//!
//! Values cross the boundary as [`Value`], a dynamic type that mirrors the
//! script's own typing rules for numbers, strings and containers.

mod runtime;

pub use runtime::classify::{classify, Shape};
pub use runtime::config::EngineConfig;
pub use runtime::context::{Context, Stage};
pub use runtime::engine::{CompileMode, Engine};
pub use runtime::error::Error;
pub use runtime::host::{HeaderOp, Host, ResponseRecorder, SendStatus};
pub use runtime::metadata::RequestMetadata;
pub use runtime::value::{Cursor, Key, Kind, Object, Value};
