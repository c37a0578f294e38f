//! Engine configuration.
//!
//! Heap limits and the bootstrap script shape the isolate itself. The
//! remaining options are the request-level settings a host would otherwise
//! keep in an ini file; they are fixed for the life of the engine.

use super::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a single [`Engine`](super::engine::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum heap size in bytes (None = V8 default)
    pub max_heap_size: Option<usize>,

    /// Initial heap size in bytes (None = V8 default)
    pub initial_heap_size: Option<usize>,

    /// Script run once at engine init and again at the start of every request.
    pub bootstrap_script: Option<String>,

    /// Advertise the engine through an `X-Powered-By` response header.
    pub expose_version: bool,

    /// Render displayed errors as HTML instead of plain text.
    pub html_errors: bool,

    /// Write uncaught script errors into the response body.
    pub display_errors: bool,

    /// Publish `argv` and `argc` in `$_SERVER`.
    pub register_argc_argv: bool,

    /// Flush the host after every delivered write.
    pub implicit_flush: bool,

    /// Size in bytes of the base output buffer; `0` delivers writes directly.
    pub output_buffering: usize,

    /// Wall-clock limit for a single exec or eval (None = unlimited).
    pub max_execution_time: Option<Duration>,

    /// Wall-clock limit for reading the request body (None = unlimited).
    pub max_input_time: Option<Duration>,

    /// File that receives script error log lines. `None` routes them to the host.
    pub error_log: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_heap_size: None,
            initial_heap_size: None,
            bootstrap_script: None,
            expose_version: false,
            html_errors: false,
            display_errors: false,
            register_argc_argv: true,
            implicit_flush: true,
            output_buffering: 0,
            max_execution_time: None,
            max_input_time: None,
            error_log: None,
        }
    }
}

impl EngineConfig {
    pub fn with_heap_limits(mut self, initial: Option<usize>, max: usize) -> Self {
        self.initial_heap_size = initial;
        self.max_heap_size = Some(max);
        self
    }

    pub fn with_bootstrap(mut self, source: impl Into<String>) -> Self {
        self.bootstrap_script = Some(source.into());
        self
    }

    pub fn with_expose_version(mut self, expose: bool) -> Self {
        self.expose_version = expose;
        self
    }

    pub fn with_display_errors(mut self, display: bool, html: bool) -> Self {
        self.display_errors = display;
        self.html_errors = html;
        self
    }

    pub fn with_register_argc_argv(mut self, register: bool) -> Self {
        self.register_argc_argv = register;
        self
    }

    pub fn with_implicit_flush(mut self, flush: bool) -> Self {
        self.implicit_flush = flush;
        self
    }

    pub fn with_output_buffering(mut self, bytes: usize) -> Self {
        self.output_buffering = bytes;
        self
    }

    pub fn with_max_execution_time(mut self, limit: Duration) -> Self {
        self.max_execution_time = Some(limit);
        self
    }

    pub fn with_max_input_time(mut self, limit: Duration) -> Self {
        self.max_input_time = Some(limit);
        self
    }

    pub fn with_error_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.error_log = Some(path.into());
        self
    }

    /// Check option combinations V8 would reject or silently misapply.
    pub fn validate(&self) -> Result<()> {
        if self.initial_heap_size.is_some() && self.max_heap_size.is_none() {
            return Err(Error::Startup(
                "initial_heap_size requires max_heap_size to be set as well".to_string(),
            ));
        }

        if let (Some(initial), Some(max)) = (self.initial_heap_size, self.max_heap_size) {
            if initial > max {
                return Err(Error::Startup(format!(
                    "initial_heap_size ({}) cannot exceed max_heap_size ({})",
                    initial, max
                )));
            }
        }

        if self.max_execution_time == Some(Duration::ZERO) {
            return Err(Error::Startup(
                "max_execution_time must be positive; leave it unset for no limit".to_string(),
            ));
        }

        Ok(())
    }

    pub(crate) fn create_params(&self) -> v8::CreateParams {
        let params = v8::CreateParams::default();
        match self.max_heap_size {
            Some(max) => params.heap_limits(self.initial_heap_size.unwrap_or(0), max),
            None => params,
        }
    }
}
