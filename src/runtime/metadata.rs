//! Request metadata captured when a context is created.

use super::value::{Key, Value};
use indexmap::IndexMap;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Fields extracted from the server-variable map, plus the map itself.
///
/// Captured once per context and never modified afterwards.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestMetadata {
    pub query_string: Option<String>,
    pub request_method: Option<String>,
    pub content_type: Option<String>,
    /// Declared body length. `None` when the host did not declare one.
    pub content_length: Option<i64>,
    /// Raw `Cookie` header, only when supplied as a string.
    pub http_cookie: Option<String>,
    pub server: IndexMap<String, Value>,
}

impl RequestMetadata {
    pub fn from_server_vars(server: IndexMap<String, Value>) -> Self {
        let text = |name: &str| match server.get(name) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.to_string_lossy()),
        };

        let http_cookie = match server.get("HTTP_COOKIE") {
            Some(Value::String(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        };

        Self {
            query_string: text("QUERY_STRING"),
            request_method: text("REQUEST_METHOD"),
            content_type: text("HTTP_CONTENT_TYPE"),
            content_length: server
                .get("HTTP_CONTENT_LENGTH")
                .filter(|length| !length.is_null())
                .map(Value::to_long),
            http_cookie,
            server,
        }
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::from_server_vars(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }

    /// Whether the body should be decoded into `$_POST`.
    pub fn is_form_post(&self) -> bool {
        let is_post = self
            .request_method
            .as_deref()
            .is_some_and(|method| method.eq_ignore_ascii_case("POST"));
        let is_form = self.content_type.as_deref().is_some_and(|content_type| {
            content_type
                .split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
        });
        is_post && is_form
    }

    /// Decoded query string, the contents of `$_GET`.
    pub fn query_params(&self) -> Value {
        parse_form(self.query_string.as_deref().unwrap_or_default().as_bytes())
    }

    /// Decoded cookie header, the contents of `$_COOKIE`.
    pub fn cookies(&self) -> Value {
        parse_cookies(self.http_cookie.as_deref().unwrap_or_default())
    }
}

/// Decode `a=1&b=2` pairs. A repeated name keeps its last value.
pub fn parse_form(bytes: &[u8]) -> Value {
    let mut entries: IndexMap<Key, Value> = IndexMap::new();
    for (name, value) in url::form_urlencoded::parse(bytes) {
        if name.is_empty() {
            continue;
        }
        entries.insert(Key::parse(&name), Value::from(value.into_owned()));
    }
    Value::from_entries(entries)
}

/// Decode a `Cookie` header. A repeated name keeps its first value.
pub fn parse_cookies(header: &str) -> Value {
    let mut entries: IndexMap<Key, Value> = IndexMap::new();
    for pair in header.split(';') {
        let pair = pair.trim();
        if let Some((name, value)) = url::form_urlencoded::parse(pair.as_bytes()).next() {
            let key = Key::parse(name.trim());
            if name.trim().is_empty() || entries.contains_key(&key) {
                continue;
            }
            entries.insert(key, Value::from(value.into_owned()));
        }
    }
    Value::from_entries(entries)
}
