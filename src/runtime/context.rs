//! One request's lifecycle on an [`Engine`].

use super::engine::{CompileMode, Engine};
use super::error::{Error, Result};
use super::host::{HeaderOp, Host};
use super::metadata::{parse_form, RequestMetadata};
use super::request::{OutputSettings, RequestState};
use super::slot::{ActiveGuard, SharedRequest};
use super::value::Value;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

const BOOTSTRAP_ORIGIN: &str = "<bootstrap>";
const EVAL_ORIGIN: &str = "<eval>";

/// Lifecycle stage of a [`Context`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Created,
    Started,
    /// `finishRequest` ran. Scripts may keep executing, output is dropped.
    Finished,
    Destroyed,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Started => "started",
            Stage::Finished => "finished",
            Stage::Destroyed => "destroyed",
        }
    }
}

/// A request running on an [`Engine`].
///
/// Created with [`Context::new`], which claims the engine's active slot, and
/// brought up with [`Context::startup`]. Dropping the context flushes the
/// response and releases the slot, exactly as [`Context::destroy`] does.
pub struct Context<'e> {
    engine: &'e Engine,
    metadata: Option<RequestMetadata>,
    request: SharedRequest,
    runtime_context: Option<v8::Global<v8::Context>>,
    guard: Option<ActiveGuard>,
    stage: Stage,
}

impl<'e> Context<'e> {
    /// Register a new request on `engine`.
    ///
    /// Without `metadata` the request sends no headers, which suits
    /// command-line style runs. Fails with [`Error::ContextBusy`] while
    /// another context is registered.
    pub fn new(
        engine: &'e Engine,
        metadata: Option<RequestMetadata>,
        host: impl Host + 'static,
    ) -> Result<Context<'e>> {
        let content_length = metadata.as_ref().and_then(|meta| meta.content_length);
        let request = Rc::new(RefCell::new(RequestState::new(
            Box::new(host),
            OutputSettings::from(engine.config()),
            metadata.is_none(),
            content_length,
        )));
        let guard = engine.slot().register(request.clone())?;

        tracing::debug!(
            method = ?metadata.as_ref().and_then(|meta| meta.request_method.as_deref()),
            "context registered"
        );
        Ok(Context {
            engine,
            metadata,
            request,
            runtime_context: None,
            guard: Some(guard),
            stage: Stage::Created,
        })
    }

    /// Publish the request to script and run the bootstrap script.
    ///
    /// A failure tears the context down and returns
    /// [`Error::RequestStartupFailed`].
    pub fn startup(mut self) -> Result<Self> {
        if self.stage != Stage::Created {
            return Err(self.invalid("start"));
        }
        match self.start() {
            Ok(()) => Ok(self),
            Err(err) => {
                tracing::warn!(error = %err, "request startup failed");
                self.request.borrow_mut().log(&format!("Request startup failed: {err}"));
                drop(self);
                Err(Error::RequestStartupFailed(err.to_string()))
            }
        }
    }

    fn start(&mut self) -> Result<()> {
        let globals = self.superglobals();
        self.runtime_context = Some(self.engine.new_context(&globals)?);

        if self.engine.config().expose_version {
            let line = format!("X-Powered-By: jshost/{}", env!("CARGO_PKG_VERSION"));
            self.request
                .borrow_mut()
                .header(HeaderOp::Replace, line.as_bytes());
        }

        if let Some(source) = &self.engine.config().bootstrap_script {
            self.run(BOOTSTRAP_ORIGIN, source, CompileMode::File)?;
        }
        self.stage = Stage::Started;
        Ok(())
    }

    fn superglobals(&self) -> [(&'static str, Value); 4] {
        let mut server = self
            .metadata
            .as_ref()
            .map(|meta| meta.server.clone())
            .unwrap_or_default();
        self.request.borrow_mut().register_variables(&mut server);

        if self.engine.config().register_argc_argv {
            let query = self
                .metadata
                .as_ref()
                .and_then(|meta| meta.query_string.as_deref())
                .unwrap_or_default();
            let argv: Vec<Value> = query
                .split('+')
                .filter(|arg| !arg.is_empty())
                .map(Value::from)
                .collect();
            server.insert("argc".to_string(), Value::from(argv.len() as i64));
            server.insert("argv".to_string(), Value::from(argv));
        }

        let (get, cookie, post) = match &self.metadata {
            Some(meta) => {
                let post = if meta.is_form_post() {
                    parse_form(self.request.borrow_mut().body())
                } else {
                    Value::Array(Vec::new())
                };
                (meta.query_params(), meta.cookies(), post)
            }
            None => (
                Value::Array(Vec::new()),
                Value::Array(Vec::new()),
                Value::Array(Vec::new()),
            ),
        };

        [
            ("$_SERVER", Value::from(server)),
            ("$_GET", get),
            ("$_POST", post),
            ("$_COOKIE", cookie),
        ]
    }

    /// Run the script file at `path` as a classic script.
    ///
    /// Top-level declarations stay visible to later runs in this request.
    /// Every failure, including a missing file, is reported to the request's
    /// error log and returned as [`Error::ExecutionFailed`].
    pub fn exec(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.require_running("exec")?;
        let path = path.as_ref();
        let origin = path.display().to_string();

        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                let message = format!("Failed opening '{origin}' for execution: {err}");
                self.request.borrow_mut().report_error(&message);
                return Err(Error::ExecutionFailed(message));
            }
        };

        tracing::debug!(path = %origin, "executing script");
        self.run(&origin, &source, CompileMode::File)
            .map(drop)
            .map_err(|err| match err {
                Error::CompileFailed(message) => Error::ExecutionFailed(message),
                other => other,
            })
    }

    /// Evaluate `source` as a function body and copy its result out.
    ///
    /// `return` yields the value, a body without one yields `Null`.
    pub fn eval(&mut self, source: &str) -> Result<Value> {
        self.require_running("eval")?;
        self.run(EVAL_ORIGIN, source, CompileMode::Eval)
    }

    fn run(&self, origin: &str, source: &str, mode: CompileMode) -> Result<Value> {
        let Some(context) = &self.runtime_context else {
            return Err(self.invalid("run"));
        };
        let result = self.engine.execute(context, origin, source, mode);
        if let Err(Error::CompileFailed(message) | Error::ExecutionFailed(message)) = &result {
            tracing::debug!(origin, error = %message, "script failed");
            self.request.borrow_mut().report_error(message);
        }
        result
    }

    /// Define a global visible to later scripts in this request.
    pub fn bind(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.require_running("bind")?;
        match &self.runtime_context {
            Some(context) => self.engine.set_global(context, name, &value.into()),
            None => Err(self.invalid("bind")),
        }
    }

    /// Flush headers and output, then close the response. True the first
    /// time only.
    pub fn finish_request(&mut self) -> Result<bool> {
        self.require_running("finish")?;
        Ok(self.request.borrow_mut().finish())
    }

    /// Raw `Cookie` header of the request.
    pub fn read_cookies(&self) -> Option<&str> {
        self.metadata.as_ref()?.http_cookie.as_deref()
    }

    pub fn metadata(&self) -> Option<&RequestMetadata> {
        self.metadata.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.request.borrow().is_finished()
    }

    /// Whether a short write cut the client off.
    pub fn connection_aborted(&self) -> bool {
        self.request.borrow().is_aborted()
    }

    pub fn stage(&self) -> Stage {
        match self.stage {
            Stage::Started if self.is_finished() => Stage::Finished,
            stage => stage,
        }
    }

    /// Flush the response and release the engine.
    pub fn destroy(self) {
        drop(self);
    }

    fn require_running(&self, operation: &'static str) -> Result<()> {
        match self.stage {
            Stage::Started => Ok(()),
            _ => Err(self.invalid(operation)),
        }
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            stage: self.stage().name(),
        }
    }

    fn teardown(&mut self) {
        if self.stage == Stage::Destroyed {
            return;
        }
        if self.stage == Stage::Started {
            self.request.borrow_mut().finish();
        }
        self.runtime_context.take();
        self.guard.take();
        self.stage = Stage::Destroyed;
        tracing::debug!("context destroyed");
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("stage", &self.stage())
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::config::EngineConfig;
    use crate::runtime::host::ResponseRecorder;
    use crate::runtime::value::Object;
    use std::io::Write as _;
    use std::time::Duration;

    fn engine() -> Engine {
        Engine::init(EngineConfig::default()).unwrap()
    }

    fn started<'e>(
        engine: &'e Engine,
        metadata: Option<RequestMetadata>,
        recorder: &ResponseRecorder,
    ) -> Context<'e> {
        Context::new(engine, metadata, recorder.clone())
            .unwrap()
            .startup()
            .unwrap()
    }

    fn get_request(query: &str, cookie: &str) -> RequestMetadata {
        RequestMetadata::from_pairs([
            ("REQUEST_METHOD", "GET"),
            ("QUERY_STRING", query),
            ("HTTP_COOKIE", cookie),
            ("SERVER_NAME", "example.test"),
        ])
    }

    #[test]
    fn request_metadata_reaches_script() {
        let engine = engine();
        let recorder = ResponseRecorder::new().with_variable("DOCUMENT_ROOT", "/srv/www");
        let mut context = started(
            &engine,
            Some(get_request("a=1&b=two", "session=abc; theme=dark")),
            &recorder,
        );

        assert_eq!(context.read_cookies(), Some("session=abc; theme=dark"));
        let seen = context
            .eval("return [$_COOKIE.session, $_SERVER.QUERY_STRING, $_GET.b, $_GET.a]")
            .unwrap();
        assert_eq!(
            seen,
            Value::from(vec![
                Value::from("abc"),
                Value::from("a=1&b=two"),
                Value::from("two"),
                Value::from("1"),
            ])
        );
        assert_eq!(
            context.eval("return $_SERVER.DOCUMENT_ROOT").unwrap(),
            Value::from("/srv/www")
        );
        assert_eq!(context.eval("return $_SERVER.argc").unwrap(), Value::Long(1));
        assert_eq!(
            context.eval("return $_POST").unwrap(),
            Value::Array(Vec::new())
        );
    }

    #[test]
    fn query_keys_are_plain_data() {
        let engine = engine();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, Some(get_request("__proto__=x&a=1", "")), &recorder);

        let seen = context
            .eval("return [Object.keys($_GET), Object.getPrototypeOf($_GET) === Object.prototype, $_GET.__proto__]")
            .unwrap();
        assert_eq!(
            seen,
            Value::from(vec![
                Value::from(vec!["__proto__", "a"]),
                Value::Bool(true),
                Value::from("x"),
            ])
        );
    }

    #[test]
    fn plain_get_scenario() {
        let engine = engine();
        let recorder = ResponseRecorder::new();
        let metadata = RequestMetadata::from_pairs([
            ("QUERY_STRING", "a=1"),
            ("REQUEST_METHOD", "GET"),
            ("HTTP_CONTENT_TYPE", "text/plain"),
            ("HTTP_CONTENT_LENGTH", "0"),
            ("HTTP_COOKIE", "sid=42"),
        ]);
        let mut context = started(&engine, Some(metadata), &recorder);

        assert_eq!(context.read_cookies(), Some("sid=42"));
        assert_eq!(
            context.eval("return $_SERVER.QUERY_STRING").unwrap(),
            Value::from("a=1")
        );
        assert_eq!(context.eval("return $_COOKIE.sid").unwrap(), Value::from("42"));
    }

    #[test]
    fn argv_follows_config() {
        let engine = Engine::init(EngineConfig::default().with_register_argc_argv(false)).unwrap();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, Some(get_request("x+y", "")), &recorder);
        assert_eq!(
            context.eval("return typeof $_SERVER.argv").unwrap(),
            Value::from("undefined")
        );
        context.destroy();
        engine.shutdown();

        let engine = self::engine();
        let mut context = started(&engine, Some(get_request("x+y", "")), &recorder);
        assert_eq!(
            context.eval("return $_SERVER.argv").unwrap(),
            Value::from(vec!["x", "y"])
        );
    }

    #[test]
    fn form_posts_are_decoded() {
        let engine = engine();
        let recorder = ResponseRecorder::new().with_post_body("name=ada&lang=en%20GB");
        let metadata = RequestMetadata::from_pairs([
            ("REQUEST_METHOD", Value::from("POST")),
            (
                "HTTP_CONTENT_TYPE",
                Value::from("application/x-www-form-urlencoded; charset=UTF-8"),
            ),
            ("HTTP_CONTENT_LENGTH", Value::from("21")),
        ]);
        let mut context = started(&engine, Some(metadata), &recorder);

        assert_eq!(context.eval("return $_POST.name").unwrap(), Value::from("ada"));
        assert_eq!(context.eval("return $_POST.lang").unwrap(), Value::from("en GB"));
        assert_eq!(
            context.eval("return requestBody()").unwrap(),
            Value::from("name=ada&lang=en%20GB")
        );
    }

    #[test]
    fn second_context_is_busy() {
        let engine = engine();
        let recorder = ResponseRecorder::new();
        let first = Context::new(&engine, None, recorder.clone()).unwrap();
        assert!(engine.has_active_context());
        assert!(matches!(
            Context::new(&engine, None, recorder.clone()),
            Err(Error::ContextBusy)
        ));

        first.destroy();
        assert!(!engine.has_active_context());
        let second = Context::new(&engine, None, recorder).unwrap();
        assert_eq!(second.stage(), Stage::Created);
    }

    #[test]
    fn eval_results_and_failures() {
        let engine = engine();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, None, &recorder);

        assert_eq!(context.eval("").unwrap(), Value::Null);
        assert_eq!(context.eval("return 1 + 1").unwrap(), Value::Long(2));
        assert!(matches!(
            context.eval("syntax ((("),
            Err(Error::CompileFailed(_))
        ));
        assert!(matches!(
            context.eval("missing.call()"),
            Err(Error::ExecutionFailed(message)) if message.contains("missing")
        ));
        // failures are recoverable
        assert_eq!(context.eval("return 'still here'").unwrap(), Value::from("still here"));
        assert_eq!(engine.compile_mode(), CompileMode::File);

        let logs = recorder.logs();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|line| line.starts_with("Fatal error: ")));
    }

    #[test]
    fn eval_locals_do_not_leak() {
        let engine = engine();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, None, &recorder);

        context.eval("let hidden = 1; globalThis.shared = 2;").unwrap();
        assert_eq!(
            context.eval("return typeof hidden").unwrap(),
            Value::from("undefined")
        );
        assert_eq!(context.eval("return shared").unwrap(), Value::Long(2));
    }

    #[test]
    fn bound_values_round_trip() {
        let engine = engine();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, None, &recorder);

        let samples = [
            Value::Null,
            Value::Long(42),
            Value::Double(0.25),
            Value::Bool(false),
            Value::from("text"),
            Value::from(vec![3, 2, 1]),
            Value::from_entries([("id", Value::Long(9)), ("tags", Value::from(vec!["a"]))]),
            Value::from(Object::new("Point").with_property("x", 1.5)),
        ];
        for sample in samples {
            context.bind("sample", sample.clone()).unwrap();
            let back = context.eval("return sample").unwrap();
            assert_eq!(back.kind(), sample.kind());
            assert_eq!(back, sample);
        }

        context.bind("fromJson", Value::from(serde_json::json!({"n": 2.0}))).unwrap();
        assert_eq!(
            context.eval("return fromJson.n").unwrap(),
            Value::Long(2)
        );
    }

    #[test]
    fn finish_request_once() {
        let engine = engine();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, Some(get_request("", "")), &recorder);

        context.eval("echo('done')").unwrap();
        assert_eq!(context.eval("return finishRequest()").unwrap(), Value::Bool(true));
        assert_eq!(context.stage(), Stage::Finished);
        assert!(!context.finish_request().unwrap());

        context.eval("echo(' ignored')").unwrap();
        assert_eq!(recorder.body_string(), "done");
        assert_eq!(recorder.header_sends(), 1);
    }

    #[test]
    fn headers_status_and_output() {
        let engine = engine();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, Some(get_request("", "")), &recorder);

        context
            .eval(
                "header('Content-Type: text/plain');
                 header('X-Trace: one');
                 header('X-Trace: two', false);
                 header('X-Gone: soon');
                 headerRemove('X-Gone');
                 httpResponseCode(201);",
            )
            .unwrap();
        assert_eq!(context.eval("return headersSent()").unwrap(), Value::Bool(false));
        context.eval("echo('hello', ' ', 42)").unwrap();
        assert_eq!(context.eval("return headersSent()").unwrap(), Value::Bool(true));
        assert_eq!(
            context.eval("return header('X-Late: 1')").unwrap(),
            Value::Bool(false)
        );
        context.destroy();

        assert_eq!(recorder.body_string(), "hello 42");
        assert_eq!(recorder.status(), Some(201));
        assert_eq!(recorder.header("content-type").as_deref(), Some("text/plain"));
        assert_eq!(recorder.header_values("X-Trace"), vec!["one", "two"]);
        assert_eq!(recorder.header("X-Gone"), None);
        assert_eq!(recorder.header("X-Late"), None);
        assert_eq!(recorder.header_sends(), 1);
        assert!(recorder
            .logs()
            .iter()
            .any(|line| line.contains("headers already sent")));
    }

    #[test]
    fn status_line_headers() {
        let engine = engine();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, Some(get_request("", "")), &recorder);
        context.eval("header('HTTP/1.1 404 Not Found')").unwrap();
        assert_eq!(
            context.eval("return httpResponseCode()").unwrap(),
            Value::Long(404)
        );
        assert!(matches!(
            context.eval("httpResponseCode(42)"),
            Err(Error::ExecutionFailed(_))
        ));
        context.destroy();
        assert_eq!(recorder.status(), Some(404));
    }

    #[test]
    fn output_buffers_nest() {
        let engine = engine();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, None, &recorder);

        let captured = context
            .eval(
                "obStart(); echo('inner'); obStart(); echo('deeper');
                 const level = obGetLevel();
                 const deeper = obGetClean();
                 obEndFlush();
                 return [level, deeper, obGetLevel(), obGetClean()];",
            )
            .unwrap();
        assert_eq!(
            captured,
            Value::from(vec![
                Value::Long(2),
                Value::from("deeper"),
                Value::Long(0),
                Value::Bool(false),
            ])
        );
        assert_eq!(recorder.body_string(), "inner");
    }

    #[test]
    fn pending_buffers_flush_on_destroy() {
        let engine = engine();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, Some(get_request("", "")), &recorder);
        context.eval("obStart(); echo('buffered')").unwrap();
        assert_eq!(recorder.body(), b"");
        assert_eq!(recorder.header_sends(), 0);

        drop(context);
        assert_eq!(recorder.body_string(), "buffered");
        assert_eq!(recorder.header_sends(), 1);
        assert!(!engine.has_active_context());
    }

    #[test]
    fn base_buffer_holds_small_output() {
        let engine = Engine::init(EngineConfig::default().with_output_buffering(16)).unwrap();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, None, &recorder);

        context.eval("echo('short')").unwrap();
        assert_eq!(recorder.body(), b"");
        context.eval("echo(' and then some more')").unwrap();
        assert_eq!(recorder.body_string(), "short and then some more");
    }

    #[test]
    fn short_write_aborts_output_but_not_script() {
        let engine = engine();
        let recorder = ResponseRecorder::new().with_write_capacity(3);
        let mut context = started(&engine, None, &recorder);

        let mut script = tempfile::NamedTempFile::new().unwrap();
        write!(script, "echo('hello'); echo('world'); var afterwards = connectionAborted();").unwrap();
        context.exec(script.path()).unwrap();

        assert!(context.connection_aborted());
        assert_eq!(context.eval("return afterwards").unwrap(), Value::Bool(true));
        assert_eq!(recorder.body_string(), "hel");
    }

    #[test]
    fn exec_runs_files() {
        let engine = engine();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, None, &recorder);

        let mut script = tempfile::NamedTempFile::new().unwrap();
        write!(script, "var greeting = 'hi'; echo(greeting);").unwrap();
        context.exec(script.path()).unwrap();
        assert_eq!(recorder.body_string(), "hi");
        assert_eq!(context.eval("return greeting").unwrap(), Value::from("hi"));

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        write!(broken, "function (").unwrap();
        assert!(matches!(
            context.exec(broken.path()),
            Err(Error::ExecutionFailed(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.js");
        assert!(matches!(
            context.exec(&missing),
            Err(Error::ExecutionFailed(message)) if message.contains("missing.js")
        ));
    }

    #[test]
    fn errors_are_displayed_when_enabled() {
        let engine = Engine::init(EngineConfig::default().with_display_errors(true, false)).unwrap();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, None, &recorder);
        assert!(context.eval("throw new Error('kaput')").is_err());
        assert!(recorder.body_string().contains("Fatal error: Uncaught Error: kaput"));
        context.destroy();
        engine.shutdown();

        let engine = Engine::init(EngineConfig::default().with_display_errors(true, true)).unwrap();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, None, &recorder);
        assert!(context.eval("throw new Error('kaput')").is_err());
        assert!(recorder.body_string().contains("<b>Fatal error</b>:  Uncaught Error: kaput"));
    }

    #[test]
    fn error_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("script.log");
        let engine = Engine::init(EngineConfig::default().with_error_log(&log)).unwrap();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, None, &recorder);

        assert_eq!(
            context.eval("return errorLog('custom line')").unwrap(),
            Value::Bool(true)
        );
        let _ = context.eval("throw new Error('logged')");

        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("custom line\n"));
        assert!(contents.contains("Fatal error: Uncaught Error: logged"));
        assert!(recorder.logs().is_empty());
    }

    #[test]
    fn execution_time_limit() {
        let config = EngineConfig::default().with_max_execution_time(Duration::from_millis(100));
        let engine = Engine::init(config).unwrap();
        let recorder = ResponseRecorder::new();
        let mut context = started(&engine, None, &recorder);

        assert!(matches!(
            context.eval("while (true) {}"),
            Err(Error::ExecutionFailed(message)) if message.contains("Maximum execution time")
        ));
        assert_eq!(context.eval("return 'recovered'").unwrap(), Value::from("recovered"));
    }

    struct ExplodingHost;

    impl Host for ExplodingHost {
        fn write(&mut self, _bytes: &[u8]) -> usize {
            panic!("socket exploded");
        }
    }

    #[test]
    fn host_panic_ends_the_script() {
        let engine = engine();
        let mut context = Context::new(&engine, None, ExplodingHost)
            .unwrap()
            .startup()
            .unwrap();

        assert!(matches!(
            context.eval("echo('boom'); return 1"),
            Err(Error::ExecutionFailed(message)) if message.contains("socket exploded")
        ));
        assert_eq!(context.eval("return 2").unwrap(), Value::Long(2));
    }

    #[test]
    fn startup_failure_releases_the_engine() {
        let config = EngineConfig::default().with_bootstrap(
            "if (typeof $_SERVER !== 'undefined' && $_SERVER.FAIL) throw new Error('refused');",
        );
        let engine = Engine::init(config).unwrap();
        let recorder = ResponseRecorder::new();
        let metadata = RequestMetadata::from_pairs([("FAIL", 1)]);

        let err = Context::new(&engine, Some(metadata), recorder.clone())
            .unwrap()
            .startup()
            .unwrap_err();
        assert!(matches!(err, Error::RequestStartupFailed(message) if message.contains("refused")));
        assert!(!engine.has_active_context());
        assert_eq!(recorder.header_sends(), 0);

        let mut context = started(&engine, None, &recorder);
        assert_eq!(context.eval("return 1").unwrap(), Value::Long(1));
    }

    #[test]
    fn bootstrap_globals_are_per_request() {
        let engine =
            Engine::init(EngineConfig::default().with_bootstrap("var hits = (globalThis.hits || 0) + 1;"))
                .unwrap();
        let recorder = ResponseRecorder::new();
        for _ in 0..2 {
            let mut context = started(&engine, None, &recorder);
            assert_eq!(context.eval("return hits").unwrap(), Value::Long(1));
        }
    }

    #[test]
    fn expose_version_header() {
        let engine = Engine::init(EngineConfig::default().with_expose_version(true)).unwrap();
        let recorder = ResponseRecorder::new();
        let context = started(&engine, Some(get_request("", "")), &recorder);
        context.destroy();
        let powered_by = recorder.header("X-Powered-By").unwrap();
        assert!(powered_by.starts_with("jshost/"));
    }

    #[test]
    fn operations_check_the_stage() {
        let engine = engine();
        let recorder = ResponseRecorder::new();
        let mut context = Context::new(&engine, None, recorder).unwrap();
        assert!(matches!(
            context.eval("return 1"),
            Err(Error::InvalidState { operation: "eval", stage: "created" })
        ));
        assert!(matches!(
            context.bind("x", 1),
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(
            context.finish_request(),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn context_reports_metadata() {
        let engine = engine();
        let recorder = ResponseRecorder::new();
        let context = started(&engine, Some(get_request("q=1", "")), &recorder);
        let metadata = context.metadata().unwrap();
        assert_eq!(metadata.request_method.as_deref(), Some("GET"));
        assert_eq!(metadata.server.get("SERVER_NAME"), Some(&Value::from("example.test")));
        assert_eq!(context.stage(), Stage::Started);
        assert!(!context.is_finished());
    }
}
