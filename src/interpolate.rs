//! Scripted-body template expansion.
//!
//! A single left-to-right scan with a fixed token table, not a general
//! parser. Expansions are never re-scanned, so values containing token
//! syntax pass through untouched.
//!
//! | Token | Expansion |
//! |---|---|
//! | `:name` | value bound by route parameter `name` |
//! | `[request.body]` | request body as UTF-8 |
//! | `[request.method]` | HTTP method |
//! | `[request.path]` | request path, no query |
//! | `[request.query]` | raw query string |
//! | `[request.time]` | epoch milliseconds at expansion time |
//! | `[request.major]` / `[request.minor]` | HTTP version parts |
//! | `[request.target]` | path plus `?query` if any |
//! | `[request?name]` | request parameter `name` (query or form body) |
//! | `[request$Header]` | request header, case-insensitive |
//! | `{name}` | session attribute `name` |
//!
//! Unresolvable tokens expand to the empty string, with one exception:
//! `{name}` is preserved literally when no valid session exists, which keeps
//! broken stateful flows visible in response bodies.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::request::Request;

/// Expands all tokens in `template` against `request`.
pub(crate) fn interpolate(template: &str, request: &Request) -> String {
    // Longest name first, so `:idx` is never clipped to `:id` + "x".
    let mut param_names: Vec<&str> = request.params().keys().map(String::as_str).collect();
    param_names.sort_by_key(|n| std::cmp::Reverse(n.len()));

    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(idx) = rest.find(['[', '{', ':']) {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];

        let consumed = match rest.as_bytes()[0] {
            b'[' => expand_bracket(rest, request, &mut out),
            b'{' => expand_session(rest, request, &mut out),
            _ => expand_param(rest, request, &param_names, &mut out),
        };
        match consumed {
            Some(n) => rest = &rest[n..],
            None => {
                // Not a token after all; emit the sigil and move on.
                out.push_str(&rest[..1]);
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// `[request.X]`, `[request?name]`, `[request$Header]`.
fn expand_bracket(rest: &str, request: &Request, out: &mut String) -> Option<usize> {
    let close = rest.find(']')?;
    let inner = &rest[1..close];

    if let Some(field) = inner.strip_prefix("request.") {
        let value = match field {
            "body" => request.body_as_string(),
            "method" => request.method().to_string(),
            "path" => request.path().to_owned(),
            "query" => request.query().to_owned(),
            "time" => epoch_millis().to_string(),
            "major" => request.version().0.to_string(),
            "minor" => request.version().1.to_string(),
            "target" => request.target(),
            _ => return None,
        };
        out.push_str(&value);
        return Some(close + 1);
    }
    if let Some(name) = inner.strip_prefix("request?") {
        out.push_str(&request.request_param(name).unwrap_or_default());
        return Some(close + 1);
    }
    if let Some(name) = inner.strip_prefix("request$") {
        out.push_str(request.header(name).unwrap_or_default());
        return Some(close + 1);
    }
    None
}

/// `{name}` — session attribute, or the literal token without a valid session.
fn expand_session(rest: &str, request: &Request, out: &mut String) -> Option<usize> {
    let close = rest.find('}')?;
    let name = &rest[1..close];
    if name.is_empty() {
        return None;
    }
    match request.session().filter(|s| s.is_valid()) {
        Some(session) => out.push_str(&session.get(name).unwrap_or_default()),
        None => out.push_str(&rest[..close + 1]),
    }
    Some(close + 1)
}

/// `:name` — recognized only for parameters the matched route declared.
fn expand_param(
    rest: &str,
    request: &Request,
    param_names: &[&str],
    out: &mut String,
) -> Option<usize> {
    let after = &rest[1..];
    for &name in param_names {
        if after.starts_with(name) {
            out.push_str(request.param(name).unwrap_or_default());
            return Some(1 + name.len());
        }
    }
    None
}

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
