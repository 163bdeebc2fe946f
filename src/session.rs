//! Server-side sessions keyed by an opaque cookie.
//!
//! A session is created by a [`SessionHook`] attached to a handler and
//! travels back to the client as the `Fixd-Session` cookie. Subsequent
//! requests carrying the cookie get the session attached to their
//! [`Request`] view, where scripted bodies can read it through `{name}`
//! tokens and custom handlers can mutate or invalidate it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use uuid::Uuid;

use crate::request::Request;

/// Name of the cookie carrying the session ID.
pub(crate) const SESSION_COOKIE: &str = "Fixd-Session";

/// A per-client key/value store.
///
/// Cheap to clone; clones share state. Attribute access takes a short
/// internal lock, and `invalidate` is atomic: once it returns, no request
/// observing the session sees it as valid.
#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    id: String,
    valid: AtomicBool,
    attributes: Mutex<HashMap<String, String>>,
}

impl Session {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(SessionInner {
                // 128 bits of entropy, hex-encoded: safe inside a cookie.
                id: Uuid::new_v4().simple().to_string(),
                valid: AtomicBool::new(true),
                attributes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The opaque session ID, as carried by the `Fixd-Session` cookie.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.attributes().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes().insert(name.into(), value.into());
    }

    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// Marks the session invalid. The store evicts it on the next request
    /// that presents its cookie.
    pub fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::Release);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.attributes().is_empty()
    }

    // A panicking user handler must not wedge the session for every later
    // request; a poisoned lock is taken anyway.
    fn attributes(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.inner.attributes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Concurrent session store, keyed by session ID.
#[derive(Debug, Default)]
pub(crate) struct SessionStore {
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    pub(crate) fn insert(&self, session: Session) {
        self.sessions.insert(session.id().to_owned(), session);
    }

    /// Looks up a session by ID. An invalidated session is evicted here and
    /// reported as absent.
    pub(crate) fn find_valid(&self, id: &str) -> Option<Session> {
        let session = self.sessions.get(id)?.clone();
        if session.is_valid() {
            Some(session)
        } else {
            self.sessions.remove(id);
            None
        }
    }
}

/// Populates a freshly created session from the request that triggered it.
///
/// Runs on every request that resolves to the owning handler. The dispatcher
/// registers the session and sets the cookie only when the hook stored at
/// least one attribute.
pub trait SessionHook: Send + Sync {
    fn on_create(&self, request: &Request, session: &Session);
}

impl<F> SessionHook for F
where
    F: Fn(&Request, &Session) + Send + Sync,
{
    fn on_create(&self, request: &Request, session: &Session) {
        self(request, session)
    }
}

/// Copies all path-parameter bindings into the session.
pub struct PathParamHook;

impl SessionHook for PathParamHook {
    fn on_create(&self, request: &Request, session: &Session) {
        for (name, value) in request.params() {
            session.set(name.clone(), value.clone());
        }
    }
}

/// Copies all request parameters (query string and form body) into the session.
pub struct RequestParamHook;

impl SessionHook for RequestParamHook {
    fn on_create(&self, request: &Request, session: &Session) {
        for (name, value) in request.request_params() {
            session.set(name, value);
        }
    }
}
