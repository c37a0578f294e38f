//! The engine: one V8 isolate per worker thread.
//!
//! The engine owns the isolate and the active-request slot. Each request
//! runs in a fresh V8 context created by [`Engine::new_context`], so globals
//! never leak between requests while compiled code and the heap are shared.

use super::config::EngineConfig;
use super::conversion::{from_v8, set_property, v8_str};
use super::error::{Error, Result};
use super::initialize_process_once;
use super::ops;
use super::slot::ActiveSlot;
use super::value::Value;
use super::watchdog::Watchdog;
use std::cell::{Cell, RefCell};

thread_local! {
    static ENGINE_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

const BOOTSTRAP_ORIGIN: &str = "<bootstrap>";

/// How a source text is compiled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompileMode {
    /// A classic script. Top-level declarations become request globals.
    #[default]
    File,
    /// A function body. `return` yields the result and locals stay private.
    Eval,
}

/// Restores the engine's compile mode when dropped.
struct CompileModeGuard<'a> {
    cell: &'a Cell<CompileMode>,
    saved: CompileMode,
}

impl<'a> CompileModeGuard<'a> {
    fn enter(cell: &'a Cell<CompileMode>, mode: CompileMode) -> Self {
        let saved = cell.replace(mode);
        Self { cell, saved }
    }
}

impl Drop for CompileModeGuard<'_> {
    fn drop(&mut self) {
        self.cell.set(self.saved);
    }
}

pub struct Engine {
    isolate: RefCell<v8::OwnedIsolate>,
    config: EngineConfig,
    slot: ActiveSlot,
    compile_mode: Cell<CompileMode>,
}

impl Engine {
    /// Bring up the runtime for this thread.
    ///
    /// Fails with [`Error::Startup`] on an invalid configuration, when the
    /// bootstrap script fails, or when another engine is alive on this thread.
    pub fn init(config: EngineConfig) -> Result<Engine> {
        config.validate()?;

        if ENGINE_ACTIVE.with(|active| active.replace(true)) {
            return Err(Error::Startup(
                "an engine is already running on this thread".to_string(),
            ));
        }

        initialize_process_once();

        let mut isolate = v8::Isolate::new(config.create_params());
        isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
        let slot = ActiveSlot::default();
        isolate.set_slot(slot.clone());

        let engine = Engine {
            isolate: RefCell::new(isolate),
            config,
            slot,
            compile_mode: Cell::new(CompileMode::default()),
        };
        engine.check_bootstrap()?;

        tracing::info!(
            max_heap_size = ?engine.config.max_heap_size,
            bootstrap = engine.config.bootstrap_script.is_some(),
            "engine started"
        );
        Ok(engine)
    }

    /// Tear the runtime down. Contexts borrow the engine, so none can
    /// outlive this call.
    pub fn shutdown(self) {
        tracing::info!("engine shut down");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Mode of the compilation in progress, or the default between runs.
    pub fn compile_mode(&self) -> CompileMode {
        self.compile_mode.get()
    }

    pub fn has_active_context(&self) -> bool {
        self.slot.is_occupied()
    }

    pub(crate) fn slot(&self) -> &ActiveSlot {
        &self.slot
    }

    fn check_bootstrap(&self) -> Result<()> {
        let Some(source) = &self.config.bootstrap_script else {
            return Ok(());
        };
        let context = self
            .new_context(&[])
            .map_err(|err| Error::Startup(err.to_string()))?;
        self.execute(&context, BOOTSTRAP_ORIGIN, source, CompileMode::File)
            .map(drop)
            .map_err(|err| Error::Startup(format!("bootstrap script failed: {err}")))
    }

    /// Create a request context with the builtins and `globals` installed.
    pub(crate) fn new_context(&self, globals: &[(&str, Value)]) -> Result<v8::Global<v8::Context>> {
        let mut isolate = self.isolate.borrow_mut();
        let scope = &mut v8::HandleScope::new(&mut *isolate);
        let context = v8::Context::new(scope, Default::default());
        let scope = &mut v8::ContextScope::new(scope, context);
        let global = context.global(scope);

        ops::install(scope, global)?;
        for (name, value) in globals {
            set_property(scope, global, name, value)?;
        }
        Ok(v8::Global::new(scope, context))
    }

    /// Define or replace a global in `context`.
    pub(crate) fn set_global(
        &self,
        context: &v8::Global<v8::Context>,
        name: &str,
        value: &Value,
    ) -> Result<()> {
        let mut isolate = self.isolate.borrow_mut();
        let scope = &mut v8::HandleScope::with_context(&mut *isolate, context);
        let local = scope.get_current_context();
        let global = local.global(scope);
        set_property(scope, global, name, value)
    }

    /// Compile and run `source` in `context`.
    ///
    /// `File` runs return `Null`; `Eval` runs return the function's result,
    /// awaiting it when it is a settled promise.
    pub(crate) fn execute(
        &self,
        context: &v8::Global<v8::Context>,
        origin: &str,
        source: &str,
        mode: CompileMode,
    ) -> Result<Value> {
        let _mode = CompileModeGuard::enter(&self.compile_mode, mode);
        let mut isolate = self.isolate.borrow_mut();
        let watchdog = self
            .config
            .max_execution_time
            .map(|limit| Watchdog::arm(isolate.thread_safe_handle(), limit));

        let scope = &mut v8::HandleScope::with_context(&mut *isolate, context);
        let scope = &mut v8::TryCatch::new(scope);
        let source_text = v8_str(scope, source)?;

        let completion = match mode {
            CompileMode::File => {
                let Some(script) = v8::Script::compile(scope, source_text, None) else {
                    return Err(Error::CompileFailed(describe_exception(scope, origin)));
                };
                script.run(scope)
            }
            CompileMode::Eval => {
                let mut source = v8::script_compiler::Source::new(source_text, None);
                let Some(function) = v8::script_compiler::compile_function(
                    scope,
                    &mut source,
                    &[],
                    &[],
                    v8::script_compiler::CompileOptions::NoCompileOptions,
                    v8::script_compiler::NoCacheReason::NoReason,
                ) else {
                    return Err(Error::CompileFailed(describe_exception(scope, origin)));
                };
                let receiver = scope.get_current_context().global(scope);
                function.call(scope, receiver.into(), &[])
            }
        };
        if completion.is_some() {
            scope.perform_microtask_checkpoint();
        }

        let timed_out = watchdog.is_some_and(Watchdog::disarm);
        let terminated = scope.has_terminated();
        if terminated || timed_out {
            scope.cancel_terminate_execution();
        }
        if terminated {
            return Err(Error::ExecutionFailed(self.termination_reason(timed_out)));
        }
        let Some(completion) = completion else {
            return Err(Error::ExecutionFailed(describe_exception(scope, origin)));
        };

        match mode {
            CompileMode::File => Ok(Value::Null),
            CompileMode::Eval => {
                let settled = settle(scope, completion)?;
                from_v8(scope, settled)
            }
        }
    }

    fn termination_reason(&self, timed_out: bool) -> String {
        let fatal = self
            .slot
            .current()
            .and_then(|request| request.borrow_mut().take_fatal());
        match (fatal, self.config.max_execution_time) {
            (Some(message), _) => message,
            (None, Some(limit)) if timed_out => format!(
                "Maximum execution time of {} seconds exceeded",
                limit.as_secs_f64()
            ),
            _ => "script execution was terminated".to_string(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        ENGINE_ACTIVE.with(|active| active.set(false));
    }
}

/// Unwrap a promise result once the microtask queue has drained.
fn settle<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> Result<v8::Local<'s, v8::Value>> {
    let Ok(promise) = v8::Local::<v8::Promise>::try_from(value) else {
        return Ok(value);
    };
    match promise.state() {
        v8::PromiseState::Fulfilled => Ok(promise.result(scope)),
        v8::PromiseState::Rejected => {
            let reason = promise.result(scope);
            let reason = reason
                .to_string(scope)
                .map(|text| text.to_rust_string_lossy(scope))
                .unwrap_or_else(|| "unknown reason".to_string());
            Err(Error::ExecutionFailed(format!("Uncaught (in promise) {reason}")))
        }
        v8::PromiseState::Pending => {
            tracing::warn!("eval returned a promise that never settled");
            Ok(v8::undefined(scope).into())
        }
    }
}

fn describe_exception(scope: &mut v8::TryCatch<v8::HandleScope>, origin: &str) -> String {
    let Some(message) = scope.message() else {
        return match scope.exception() {
            Some(exception) => {
                let text = exception
                    .to_string(scope)
                    .map(|text| text.to_rust_string_lossy(scope))
                    .unwrap_or_else(|| "unknown error".to_string());
                format!("Uncaught {text} in {origin}")
            }
            None => format!("unknown error in {origin}"),
        };
    };
    let text = message.get(scope).to_rust_string_lossy(scope);
    match message.get_line_number(scope) {
        Some(line) => format!("{text} in {origin}:{line}"),
        None => format!("{text} in {origin}"),
    }
}
