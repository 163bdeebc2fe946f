//! The handler-visible view of an incoming HTTP request.

use std::collections::HashMap;

use bytes::Bytes;

use crate::method::Method;
use crate::session::Session;

/// An incoming HTTP request, as seen by handlers and hooks.
///
/// Carries the parsed request plus whatever dispatch attached to it: the
/// path-parameter bindings of the matched route and the client's session,
/// if a valid one exists. Clones are cheap and share the body buffer;
/// trigger broadcasts clone the triggering request once per subscriber.
#[derive(Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: String,
    major: u8,
    minor: u8,
    headers: Vec<(String, String)>,
    body: Bytes,
    params: HashMap<String, String>,
    session: Option<Session>,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: Method,
        path: String,
        query: String,
        major: u8,
        minor: u8,
        headers: Vec<(String, String)>,
        body: Bytes,
        params: HashMap<String, String>,
        session: Option<Session>,
    ) -> Self {
        Self { method, path, query, major, minor, headers, body, params, session }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string, without the leading `?`. Empty if none was sent.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Request-target: the path plus `?query` when a query was sent.
    pub fn target(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// HTTP version as `(major, minor)`.
    pub fn version(&self) -> (u8, u8) {
        (self.major, self.minor)
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Request body decoded as UTF-8, lossily.
    pub fn body_as_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Returns the path parameter bound by the matched route.
    ///
    /// For a route `/users/:id`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// All path-parameter bindings of the matched route.
    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// Returns a request parameter: the query string is consulted first,
    /// then the body when it is `application/x-www-form-urlencoded`.
    pub fn request_param(&self, name: &str) -> Option<String> {
        self.request_params()
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// All request parameters, query-string pairs before form-body pairs.
    pub fn request_params(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(self.query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if self.is_form_encoded() {
            pairs.extend(
                url::form_urlencoded::parse(&self.body)
                    .map(|(k, v)| (k.into_owned(), v.into_owned())),
            );
        }
        pairs
    }

    fn is_form_encoded(&self) -> bool {
        self.header("Content-Type")
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
    }

    /// The client's session, when a valid one accompanied the request or a
    /// session hook installed one.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub(crate) fn set_session(&mut self, session: Session) {
        self.session = Some(session);
    }
}
