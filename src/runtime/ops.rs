//! Builtin functions through which scripts reach the running request.
//!
//! Every builtin resolves the request through the [`ActiveSlot`] stored in
//! the isolate. Host callbacks run inside `catch_unwind`: a panicking host
//! terminates the script instead of unwinding through V8 frames, and the
//! engine reports the recorded failure as an execution error.

use super::conversion::v8_str;
use super::error::{Error, Result};
use super::host::HeaderOp;
use super::request::RequestState;
use super::slot::ActiveSlot;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Names of the functions [`install`] defines on the global object.
pub(crate) const BUILTINS: &[&str] = &[
    "echo",
    "header",
    "headerRemove",
    "headersSent",
    "httpResponseCode",
    "errorLog",
    "obStart",
    "obGetClean",
    "obEndFlush",
    "obGetLevel",
    "finishRequest",
    "requestBody",
    "connectionAborted",
];

pub(crate) fn install<'s>(
    scope: &mut v8::HandleScope<'s>,
    global: v8::Local<'s, v8::Object>,
) -> Result<()> {
    set_function(scope, global, "echo", echo)?;
    set_function(scope, global, "header", header)?;
    set_function(scope, global, "headerRemove", header_remove)?;
    set_function(scope, global, "headersSent", headers_sent)?;
    set_function(scope, global, "httpResponseCode", http_response_code)?;
    set_function(scope, global, "errorLog", error_log)?;
    set_function(scope, global, "obStart", ob_start)?;
    set_function(scope, global, "obGetClean", ob_get_clean)?;
    set_function(scope, global, "obEndFlush", ob_end_flush)?;
    set_function(scope, global, "obGetLevel", ob_get_level)?;
    set_function(scope, global, "finishRequest", finish_request)?;
    set_function(scope, global, "requestBody", request_body)?;
    set_function(scope, global, "connectionAborted", connection_aborted)?;
    Ok(())
}

fn set_function<'s>(
    scope: &mut v8::HandleScope<'s>,
    target: v8::Local<'s, v8::Object>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) -> Result<()> {
    let key = v8_str(scope, name)?;
    let function = v8::Function::new(scope, callback)
        .ok_or_else(|| Error::Allocation(format!("builtin {name}")))?;
    target
        .set(scope, key.into(), function.into())
        .ok_or_else(|| Error::Allocation(format!("global {name}")))?;
    Ok(())
}

/// Run `f` against the active request, shielding V8 from host panics.
fn with_request<R>(
    scope: &mut v8::HandleScope,
    operation: &str,
    f: impl FnOnce(&mut RequestState) -> R,
) -> Option<R> {
    let Some(request) = scope.get_slot::<ActiveSlot>().and_then(ActiveSlot::current) else {
        throw_error(scope, &format!("{operation}() called outside of a request"));
        return None;
    };

    match panic::catch_unwind(AssertUnwindSafe(|| f(&mut request.borrow_mut()))) {
        Ok(result) => Some(result),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(operation, %message, "host callback panicked");
            if let Ok(mut state) = request.try_borrow_mut() {
                state.set_fatal(format!("{operation}() failed: {message}"));
            }
            scope.terminate_execution();
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "host callback panicked".to_string()
    }
}

fn throw_error(scope: &mut v8::HandleScope, message: &str) {
    if let Some(message) = v8::String::new(scope, message) {
        let exception = v8::Exception::error(scope, message);
        scope.throw_exception(exception);
    }
}

fn throw_type_error(scope: &mut v8::HandleScope, message: &str) {
    if let Some(message) = v8::String::new(scope, message) {
        let exception = v8::Exception::type_error(scope, message);
        scope.throw_exception(exception);
    }
}

/// String form of argument `index`, or `None` when it is missing or its
/// conversion threw.
fn string_arg(
    scope: &mut v8::HandleScope,
    args: &v8::FunctionCallbackArguments,
    index: i32,
) -> Option<String> {
    if index >= args.length() {
        return None;
    }
    let text = args.get(index).to_string(scope)?;
    Some(text.to_rust_string_lossy(scope))
}

fn set_bytes(scope: &mut v8::HandleScope, rv: &mut v8::ReturnValue, bytes: &[u8]) {
    match v8::String::new_from_utf8(scope, bytes, v8::NewStringType::Normal) {
        Some(text) => rv.set(text.into()),
        None => throw_error(scope, "output too large for a string"),
    }
}

/// Status code carried by an `HTTP/1.1 404 Not Found` style line.
fn status_line(line: &str) -> Option<u16> {
    let rest = line.strip_prefix("HTTP/")?;
    rest.split_whitespace().nth(1)?.parse().ok()
}

fn echo(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let mut output = Vec::new();
    for index in 0..args.length() {
        let Some(text) = args.get(index).to_string(scope) else {
            return;
        };
        output.extend_from_slice(text.to_rust_string_lossy(scope).as_bytes());
    }
    with_request(scope, "echo", |request| {
        if let Err(err) = request.write(&output) {
            tracing::debug!(error = %err, "echo output dropped");
        }
    });
}

fn header(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let Some(line) = string_arg(scope, &args, 0) else {
        return throw_type_error(scope, "header() expects a header line");
    };
    let replace = args.length() < 2 || args.get(1).boolean_value(scope);
    let op = if replace {
        HeaderOp::Replace
    } else {
        HeaderOp::Add
    };

    let accepted = with_request(scope, "header", |request| match status_line(&line) {
        Some(code) => {
            let pending = !request.headers_sent();
            request.response_code(Some(code));
            pending
        }
        None => request.header(op, line.as_bytes()),
    });
    if let Some(accepted) = accepted {
        rv.set_bool(accepted);
    }
}

fn header_remove(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let Some(name) = string_arg(scope, &args, 0) else {
        return throw_type_error(scope, "headerRemove() expects a header name");
    };
    if let Some(accepted) = with_request(scope, "headerRemove", |request| {
        request.header(HeaderOp::Delete, name.as_bytes())
    }) {
        rv.set_bool(accepted);
    }
}

fn headers_sent(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    if let Some(sent) = with_request(scope, "headersSent", |request| request.headers_sent()) {
        rv.set_bool(sent);
    }
}

fn http_response_code(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let code = if args.length() > 0 && !args.get(0).is_undefined() {
        let requested = args.get(0).integer_value(scope).unwrap_or(0);
        match u16::try_from(requested) {
            Ok(code) if (100..=599).contains(&code) => Some(code),
            _ => {
                return throw_type_error(
                    scope,
                    &format!("httpResponseCode() expects a status between 100 and 599, got {requested}"),
                );
            }
        }
    } else {
        None
    };

    if let Some(previous) = with_request(scope, "httpResponseCode", |request| {
        request.response_code(code)
    }) {
        rv.set_int32(i32::from(previous));
    }
}

fn error_log(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let Some(message) = string_arg(scope, &args, 0) else {
        return throw_type_error(scope, "errorLog() expects a message");
    };
    if with_request(scope, "errorLog", |request| request.log(&message)).is_some() {
        rv.set_bool(true);
    }
}

fn ob_start(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    if with_request(scope, "obStart", RequestState::ob_start).is_some() {
        rv.set_bool(true);
    }
}

fn ob_get_clean(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    match with_request(scope, "obGetClean", RequestState::ob_get_clean) {
        Some(Some(contents)) => set_bytes(scope, &mut rv, &contents),
        Some(None) => rv.set_bool(false),
        None => {}
    }
}

fn ob_end_flush(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let flushed = with_request(scope, "obEndFlush", |request| match request.ob_end_flush() {
        Ok(flushed) => flushed,
        Err(err) => {
            tracing::debug!(error = %err, "flushed buffer dropped");
            true
        }
    });
    if let Some(flushed) = flushed {
        rv.set_bool(flushed);
    }
}

fn ob_get_level(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    if let Some(level) = with_request(scope, "obGetLevel", |request| request.ob_level()) {
        rv.set_int32(i32::try_from(level).unwrap_or(i32::MAX));
    }
}

fn finish_request(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    if let Some(first) = with_request(scope, "finishRequest", RequestState::finish) {
        rv.set_bool(first);
    }
}

fn request_body(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    if let Some(body) = with_request(scope, "requestBody", |request| request.body().to_vec()) {
        set_bytes(scope, &mut rv, &body);
    }
}

fn connection_aborted(
    scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    if let Some(aborted) = with_request(scope, "connectionAborted", |request| request.is_aborted()) {
        rv.set_bool(aborted);
    }
}
