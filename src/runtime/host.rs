//! Callbacks through which a running request talks to its host.
//!
//! The engine never touches sockets or files on behalf of a request; every
//! byte of output, every header and every byte of request body goes through
//! a [`Host`] supplied when the context is created.

use super::value::Value;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;

/// How a header line changes the pending response headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderOp {
    /// Append alongside existing values with the same name.
    Add,
    /// Drop existing values with the same name first.
    Replace,
    /// Remove the named header. The line holds only the name.
    Delete,
}

/// Outcome reported by [`Host::send_headers`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    Failed,
}

/// Host side of a request.
///
/// Only `write` is required. The remaining callbacks default to a host with
/// no headers, no request body and logging through `tracing`.
pub trait Host {
    /// Deliver body bytes, returning how many were accepted. Accepting fewer
    /// than offered marks the connection aborted for the rest of the request.
    fn write(&mut self, bytes: &[u8]) -> usize;

    /// Apply a raw `Name: value` header line.
    fn set_header(&mut self, _op: HeaderOp, _line: &[u8]) {}

    /// Commit the status line and pending headers. Called at most once.
    fn send_headers(&mut self, _status: u16) -> SendStatus {
        SendStatus::Sent
    }

    /// Fill `buf` with request body bytes, returning `0` at end of body.
    fn read_post(&mut self, _buf: &mut [u8]) -> usize {
        0
    }

    /// Merge host-specific entries into `$_SERVER` before it is published.
    fn register_variables(&mut self, _variables: &mut IndexMap<String, Value>) {}

    fn log(&mut self, message: &str) {
        tracing::info!(target: "jshost::script", "{message}");
    }

    fn flush(&mut self) {}
}

impl<H: Host + ?Sized> Host for Box<H> {
    fn write(&mut self, bytes: &[u8]) -> usize {
        (**self).write(bytes)
    }

    fn set_header(&mut self, op: HeaderOp, line: &[u8]) {
        (**self).set_header(op, line)
    }

    fn send_headers(&mut self, status: u16) -> SendStatus {
        (**self).send_headers(status)
    }

    fn read_post(&mut self, buf: &mut [u8]) -> usize {
        (**self).read_post(buf)
    }

    fn register_variables(&mut self, variables: &mut IndexMap<String, Value>) {
        (**self).register_variables(variables)
    }

    fn log(&mut self, message: &str) {
        (**self).log(message)
    }

    fn flush(&mut self) {
        (**self).flush()
    }
}

#[derive(Debug, Default)]
struct Recorded {
    body: Vec<u8>,
    headers: Vec<(String, String)>,
    status: Option<u16>,
    header_sends: usize,
    fail_header_send: bool,
    logs: Vec<String>,
    flushes: usize,
    post: Vec<u8>,
    post_offset: usize,
    write_capacity: Option<usize>,
    variables: Vec<(String, Value)>,
}

/// In-memory [`Host`] that records the response.
///
/// Clones share the same recording, so one clone can be handed to a
/// [`Context`](super::context::Context) while another is inspected.
#[derive(Clone, Debug, Default)]
pub struct ResponseRecorder {
    inner: Rc<RefCell<Recorded>>,
}

impl ResponseRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` to [`Host::read_post`].
    pub fn with_post_body(self, body: impl Into<Vec<u8>>) -> Self {
        self.inner.borrow_mut().post = body.into();
        self
    }

    /// Accept at most `bytes` body bytes in total, then report short writes.
    pub fn with_write_capacity(self, bytes: usize) -> Self {
        self.inner.borrow_mut().write_capacity = Some(bytes);
        self
    }

    /// Merge `name` into `$_SERVER` through [`Host::register_variables`].
    pub fn with_variable(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inner
            .borrow_mut()
            .variables
            .push((name.into(), value.into()));
        self
    }

    /// Report [`SendStatus::Failed`] from `send_headers`.
    pub fn failing_header_send(self) -> Self {
        self.inner.borrow_mut().fail_header_send = true;
        self
    }

    pub fn body(&self) -> Vec<u8> {
        self.inner.borrow().body.clone()
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.inner.borrow().body).into_owned()
    }

    /// Status passed to the first `send_headers` call, if any.
    pub fn status(&self) -> Option<u16> {
        self.inner.borrow().status
    }

    pub fn header_sends(&self) -> usize {
        self.inner.borrow().header_sends
    }

    /// First value recorded for `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<String> {
        self.header_values(name).into_iter().next()
    }

    pub fn header_values(&self, name: &str) -> Vec<String> {
        self.inner
            .borrow()
            .headers
            .iter()
            .filter(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        self.inner.borrow().headers.clone()
    }

    pub fn logs(&self) -> Vec<String> {
        self.inner.borrow().logs.clone()
    }

    pub fn flushes(&self) -> usize {
        self.inner.borrow().flushes
    }
}

fn split_header(line: &[u8]) -> (String, String) {
    let line = String::from_utf8_lossy(line);
    match line.split_once(':') {
        Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
        None => (line.trim().to_string(), String::new()),
    }
}

impl Host for ResponseRecorder {
    fn write(&mut self, bytes: &[u8]) -> usize {
        let mut recorded = self.inner.borrow_mut();
        let accepted = match recorded.write_capacity {
            Some(capacity) => bytes.len().min(capacity.saturating_sub(recorded.body.len())),
            None => bytes.len(),
        };
        recorded.body.extend_from_slice(&bytes[..accepted]);
        accepted
    }

    fn set_header(&mut self, op: HeaderOp, line: &[u8]) {
        let (name, value) = split_header(line);
        if name.is_empty() {
            return;
        }
        let mut recorded = self.inner.borrow_mut();
        match op {
            HeaderOp::Replace if !value.is_empty() => {
                recorded
                    .headers
                    .retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
                recorded.headers.push((name, value));
            }
            HeaderOp::Add if !value.is_empty() => recorded.headers.push((name, value)),
            HeaderOp::Delete => recorded
                .headers
                .retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name)),
            HeaderOp::Replace | HeaderOp::Add => {}
        }
    }

    fn send_headers(&mut self, status: u16) -> SendStatus {
        let mut recorded = self.inner.borrow_mut();
        recorded.header_sends += 1;
        if recorded.fail_header_send {
            return SendStatus::Failed;
        }
        recorded.status.get_or_insert(status);
        SendStatus::Sent
    }

    fn read_post(&mut self, buf: &mut [u8]) -> usize {
        let mut recorded = self.inner.borrow_mut();
        let start = recorded.post_offset.min(recorded.post.len());
        let count = buf.len().min(recorded.post.len() - start);
        buf[..count].copy_from_slice(&recorded.post[start..start + count]);
        recorded.post_offset = start + count;
        count
    }

    fn register_variables(&mut self, variables: &mut IndexMap<String, Value>) {
        for (name, value) in &self.inner.borrow().variables {
            variables.insert(name.clone(), value.clone());
        }
    }

    fn log(&mut self, message: &str) {
        self.inner.borrow_mut().logs.push(message.to_string());
    }

    fn flush(&mut self) {
        self.inner.borrow_mut().flushes += 1;
    }
}
