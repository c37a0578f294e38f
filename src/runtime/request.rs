//! Per-request output, header and logging state.
//!
//! Script output passes through a stack of script-level buffers, then the
//! optional base buffer sized by `output_buffering`, before reaching
//! [`Host::write`]. Headers are committed lazily: right before the first
//! delivered body byte, on `finishRequest`, or when the request ends.

use super::config::EngineConfig;
use super::error::{Error, Result};
use super::host::{HeaderOp, Host, SendStatus};
use super::value::{Value, MAX_VALUE_BYTES};
use indexmap::IndexMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 8 * 1024;
/// Cap on a request body whose length the host did not declare.
const MAX_UNDECLARED_BODY: usize = MAX_VALUE_BYTES;
const DEFAULT_STATUS: u16 = 200;

/// Request-level settings copied out of the engine configuration.
#[derive(Clone, Debug)]
pub(crate) struct OutputSettings {
    pub implicit_flush: bool,
    pub output_buffering: usize,
    pub display_errors: bool,
    pub html_errors: bool,
    pub error_log: Option<PathBuf>,
    pub max_input_time: Option<Duration>,
}

impl From<&EngineConfig> for OutputSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            implicit_flush: config.implicit_flush,
            output_buffering: config.output_buffering,
            display_errors: config.display_errors,
            html_errors: config.html_errors,
            error_log: config.error_log.clone(),
            max_input_time: config.max_input_time,
        }
    }
}

pub(crate) struct RequestState {
    host: Box<dyn Host>,
    settings: OutputSettings,
    /// No request metadata: headers are never sent to the host.
    no_headers: bool,
    content_length: Option<i64>,
    buffers: Vec<Vec<u8>>,
    base: Vec<u8>,
    status: u16,
    headers_sent: bool,
    finished: bool,
    aborted: bool,
    body: Option<Vec<u8>>,
    fatal: Option<String>,
}

impl RequestState {
    pub fn new(
        host: Box<dyn Host>,
        settings: OutputSettings,
        no_headers: bool,
        content_length: Option<i64>,
    ) -> Self {
        Self {
            host,
            settings,
            no_headers,
            content_length,
            buffers: Vec::new(),
            base: Vec::new(),
            status: DEFAULT_STATUS,
            headers_sent: false,
            finished: false,
            aborted: false,
            body: None,
            fatal: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Append script output. After the request finished, output is dropped.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.finished {
            tracing::debug!(bytes = bytes.len(), "discarding output after finish");
            return Ok(());
        }
        match self.buffers.last_mut() {
            Some(top) => {
                top.extend_from_slice(bytes);
                Ok(())
            }
            None => self.emit(bytes),
        }
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        if self.settings.output_buffering == 0 {
            return self.deliver(bytes);
        }
        self.base.extend_from_slice(bytes);
        if self.base.len() >= self.settings.output_buffering {
            self.flush_base()?;
        }
        Ok(())
    }

    fn flush_base(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.base);
        self.deliver(&pending)
    }

    fn deliver(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.aborted {
            return Err(Error::AbortedConnection);
        }
        self.send_headers();

        let written = self.host.write(bytes);
        if written < bytes.len() {
            self.aborted = true;
            tracing::warn!(
                offered = bytes.len(),
                written,
                "short write, suppressing further output"
            );
            return Err(Error::AbortedConnection);
        }
        if self.settings.implicit_flush {
            self.host.flush();
        }
        Ok(())
    }

    /// Commit the status and headers, once.
    pub fn send_headers(&mut self) {
        if self.headers_sent {
            return;
        }
        self.headers_sent = true;
        if self.no_headers {
            tracing::debug!("request has no metadata, skipping headers");
            return;
        }
        if self.host.send_headers(self.status) == SendStatus::Failed {
            tracing::warn!(status = self.status, "host failed to send headers");
        }
    }

    /// Forward a header line. Refused once headers have been sent.
    pub fn header(&mut self, op: HeaderOp, line: &[u8]) -> bool {
        if self.headers_sent {
            self.warn_headers_sent();
            return false;
        }
        self.host.set_header(op, line);
        true
    }

    /// Current status code; replaced by `code` while headers are pending.
    pub fn response_code(&mut self, code: Option<u16>) -> u16 {
        let previous = self.status;
        if let Some(code) = code {
            if self.headers_sent {
                self.warn_headers_sent();
            } else {
                self.status = code;
            }
        }
        previous
    }

    fn warn_headers_sent(&mut self) {
        tracing::warn!("header change after headers were sent");
        self.log("Cannot modify header information - headers already sent");
    }

    pub fn ob_start(&mut self) {
        self.buffers.push(Vec::new());
    }

    pub fn ob_level(&self) -> usize {
        self.buffers.len()
    }

    /// Remove the top buffer, returning its contents.
    pub fn ob_get_clean(&mut self) -> Option<Vec<u8>> {
        self.buffers.pop()
    }

    /// Remove the top buffer, passing its contents down a level.
    pub fn ob_end_flush(&mut self) -> Result<bool> {
        match self.buffers.pop() {
            Some(contents) => self.write(&contents).map(|()| true),
            None => Ok(false),
        }
    }

    /// Flush every buffer and the headers, then close the output. True the
    /// first time only.
    pub fn finish(&mut self) -> bool {
        if self.finished {
            return false;
        }

        let pending: Vec<u8> = self.buffers.drain(..).flatten().collect();
        let flushed = self.emit(&pending).and_then(|()| self.flush_base());
        if let Err(err) = flushed {
            tracing::debug!(error = %err, "output lost while finishing request");
        }
        self.send_headers();
        self.host.flush();
        self.finished = true;
        true
    }

    pub fn register_variables(&mut self, variables: &mut IndexMap<String, Value>) {
        self.host.register_variables(variables);
    }

    /// Request body, read from the host on first use.
    pub fn body(&mut self) -> &[u8] {
        if self.body.is_none() {
            let body = self.read_body();
            self.body = Some(body);
        }
        self.body.as_deref().unwrap_or_default()
    }

    fn read_body(&mut self) -> Vec<u8> {
        // a declared length is exact; zero or negative means no body at all
        let (limit, declared) = match self.content_length {
            Some(length) => (usize::try_from(length).unwrap_or(0), true),
            None => (MAX_UNDECLARED_BODY, false),
        };
        let deadline = self.settings.max_input_time.map(|max| Instant::now() + max);
        let mut body = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            if body.len() >= limit {
                if !declared && self.host.read_post(&mut chunk[..1]) > 0 {
                    tracing::warn!(limit, "undeclared request body too large, truncated");
                    self.log("Request body without a declared length exceeds the size limit");
                }
                break;
            }
            let want = READ_CHUNK.min(limit - body.len());
            let read = self.host.read_post(&mut chunk[..want]);
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read.min(want)]);
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                tracing::warn!(read = body.len(), "max_input_time exceeded, body truncated");
                self.log("Maximum input time exceeded while reading the request body");
                break;
            }
        }
        body
    }

    /// Append to the configured error log, or hand the line to the host.
    pub fn log(&mut self, message: &str) {
        if let Some(path) = &self.settings.error_log {
            let appended = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| writeln!(file, "{message}"));
            match appended {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "error log unavailable");
                }
            }
        }
        self.host.log(message);
    }

    /// Log an uncaught script error and, when enabled, render it into the
    /// response.
    pub fn report_error(&mut self, message: &str) {
        self.log(&format!("Fatal error: {message}"));
        if !self.settings.display_errors {
            return;
        }
        let rendered = if self.settings.html_errors {
            format!("<br />\n<b>Fatal error</b>:  {message}<br />\n")
        } else {
            format!("\nFatal error: {message}\n")
        };
        if let Err(err) = self.write(rendered.as_bytes()) {
            tracing::debug!(error = %err, "could not display error");
        }
    }

    /// Record a fatal host failure that ends the running script.
    pub fn set_fatal(&mut self, message: String) {
        self.fatal.get_or_insert(message);
    }

    pub fn take_fatal(&mut self) -> Option<String> {
        self.fatal.take()
    }
}
