//! The per-request dispatch pipeline.
//!
//! Every request flows: capture, resolve, trigger broadcast, session hook,
//! body, reply. Unroutable requests produce 404, method or content-type
//! mismatches 405, and anything that goes wrong past resolution (a handler
//! with no status code, a panicking custom handler, an unbuildable
//! response) produces 500. All three carry an empty `text/plain` body. The
//! request is captured before resolution, so tests can assert on traffic
//! the fixture had no script for.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, SET_COOKIE};
use http::StatusCode;
use http_body_util::BodyExt;
use tokio::sync::oneshot;

use crate::capture::{CaptureRing, CapturedRequest};
use crate::engine::AsyncEngine;
use crate::handler::{Handler, HandlerKey, HandlerScript, ScriptView, Timing};
use crate::method::Method;
use crate::request::Request;
use crate::response::{channel_body, full_body, HttpResponse, ReplyBody};
use crate::route::{Route, RouteMap};
use crate::session::{Session, SessionStore, SESSION_COOKIE};

pub(crate) struct Dispatcher {
    route_map: RwLock<RouteMap>,
    handlers: RwLock<HashMap<HandlerKey, Arc<RwLock<HandlerScript>>>>,
    triggers: RwLock<HashSet<HandlerKey>>,
    sessions: SessionStore,
    captures: CaptureRing,
    engine: AsyncEngine,
}

enum Resolved {
    Handler {
        key: HandlerKey,
        script: Arc<RwLock<HandlerScript>>,
        params: HashMap<String, String>,
    },
    NotFound,
    MethodNotAllowed,
}

impl Dispatcher {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            route_map: RwLock::new(RouteMap::new()),
            handlers: RwLock::new(HashMap::new()),
            triggers: RwLock::new(HashSet::new()),
            sessions: SessionStore::default(),
            captures: CaptureRing::default(),
            engine: AsyncEngine::new(workers),
        }
    }

    pub(crate) fn add_handler(
        self: &Arc<Self>,
        method: Method,
        resource: &str,
        content_type: Option<String>,
    ) -> Handler {
        let route = Route::new(resource);
        let key = HandlerKey::new(method, route.clone(), content_type);
        let script = Arc::new(RwLock::new(HandlerScript::new()));
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).insert(key, Arc::clone(&script));
        self.route_map.write().unwrap_or_else(PoisonError::into_inner).add(route);
        Handler::new(script, Arc::clone(self))
    }

    /// Registers the synthetic handler backing a trigger route and records
    /// the trigger key. Idempotent per key.
    pub(crate) fn register_trigger(
        &self,
        method: Method,
        resource: &str,
        content_type: Option<String>,
    ) -> HandlerKey {
        let route = Route::new(resource);
        let key = HandlerKey::new(method, route.clone(), content_type);
        {
            let mut triggers = self.triggers.write().unwrap_or_else(PoisonError::into_inner);
            if !triggers.insert(key.clone()) {
                return key;
            }
        }
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), Arc::new(RwLock::new(HandlerScript::trigger_stub())));
        self.route_map.write().unwrap_or_else(PoisonError::into_inner).add(route);
        key
    }

    pub(crate) fn captured_requests(&self) -> Vec<CapturedRequest> {
        self.captures.snapshot()
    }

    pub(crate) fn next_captured_request(&self) -> Option<CapturedRequest> {
        self.captures.next()
    }

    pub(crate) fn set_max_captured_requests(&self, limit: usize) {
        self.captures.set_limit(limit);
    }

    pub(crate) fn shutdown(&self) {
        self.engine.shutdown();
    }

    /// Handles one request end to end.
    pub(crate) async fn dispatch(
        self: Arc<Self>,
        req: http::Request<hyper::body::Incoming>,
    ) -> http::Response<ReplyBody> {
        let (parts, body) = req.into_parts();
        let method_name = parts.method.as_str().to_owned();
        let path = parts.uri.path().to_owned();
        let query = parts.uri.query().unwrap_or_default().to_owned();
        let (major, minor) = version_parts(parts.version);
        let headers: Vec<(String, String)> = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (name.as_str().to_owned(), String::from_utf8_lossy(value.as_bytes()).into_owned())
            })
            .collect();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::error!("failed to read request body: {e}");
                return plain_reply(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        // Captured before resolution: unroutable traffic is recorded too.
        self.captures.push(CapturedRequest::new(
            &method_name,
            &path,
            &query,
            major,
            minor,
            headers.clone(),
            body.clone(),
        ));

        let content_type = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.trim().to_owned());

        let (key, script, params) = match self.resolve(&method_name, &path, content_type) {
            Resolved::Handler { key, script, params } => (key, script, params),
            Resolved::NotFound => return plain_reply(StatusCode::NOT_FOUND),
            Resolved::MethodNotAllowed => return plain_reply(StatusCode::METHOD_NOT_ALLOWED),
        };

        let view = script.read().unwrap_or_else(PoisonError::into_inner).view();

        let session = session_cookie(&headers).and_then(|id| self.sessions.find_valid(&id));
        let mut request = Request::new(
            key.method(),
            path,
            query,
            major,
            minor,
            headers,
            body,
            params,
            session,
        );

        // A trigger request fans out to subscribers, then still gets its own
        // scripted (stub) response below.
        if self.triggers.read().unwrap_or_else(PoisonError::into_inner).contains(&key) {
            self.engine.broadcast(&key, &request);
        }

        let mut set_cookie = None;
        if let Some(hook) = &view.session_hook {
            let session = Session::new();
            hook.on_create(&request, &session);
            // Only a populated session is worth a cookie.
            if !session.is_empty() {
                self.sessions.insert(session.clone());
                set_cookie = Some(format!("{SESSION_COOKIE}={}; Path=/", session.id()));
                request.set_session(session);
            }
        }

        self.reply(view, request, set_cookie).await
    }

    async fn reply(
        &self,
        view: ScriptView,
        request: Request,
        set_cookie: Option<String>,
    ) -> http::Response<ReplyBody> {
        let mut status = view.status;
        let mut content_type = view.content_type.clone();
        let mut body = view.body.clone();

        // Subscription handlers write nothing now; their body is rendered
        // per broadcast, against the triggering request.
        if view.upon.is_none() {
            if let Some(custom) = &view.custom {
                let mut response = HttpResponse::default();
                let outcome =
                    catch_unwind(AssertUnwindSafe(|| custom.handle(&request, &mut response)));
                if outcome.is_err() {
                    tracing::error!("custom handler panicked");
                    return plain_reply(StatusCode::INTERNAL_SERVER_ERROR);
                }
                status = response.status.or(status);
                content_type = response.content_type.or(content_type);
                if let Some(scripted) = response.body {
                    body = scripted.to_script();
                }
            }
        }

        let Some(status) = status else {
            tracing::error!("handler has no response status code");
            return plain_reply(StatusCode::INTERNAL_SERVER_ERROR);
        };
        let content_type = content_type
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| "text/plain".to_owned());

        if let Some(trigger) = view.upon {
            // Status withheld: released as `status` by the first broadcast,
            // or as 408 by the subscription deadline.
            let (gate_tx, gate_rx) = oneshot::channel();
            let (tx, reply_body) = channel_body();
            self.engine.subscribe(trigger, status, body, view.timeout, gate_tx, tx);
            let status = gate_rx.await.unwrap_or(500);
            return assemble(status, &content_type, &view.headers, set_cookie, reply_body);
        }

        match view.timing {
            Timing::Once => {
                let bytes = body.render(&request).unwrap_or_default();
                assemble(status, &content_type, &view.headers, set_cookie, full_body(bytes))
            }
            Timing::After(delay) => {
                let (tx, reply_body) = channel_body();
                self.engine.spawn_after(delay, body, request, tx);
                assemble(status, &content_type, &view.headers, set_cookie, reply_body)
            }
            Timing::Every { period, count } => {
                let (tx, reply_body) = channel_body();
                self.engine.spawn_every(period, count, body, request, tx);
                assemble(status, &content_type, &view.headers, set_cookie, reply_body)
            }
        }
    }

    fn resolve(&self, method_name: &str, path: &str, content_type: Option<String>) -> Resolved {
        let route = {
            let route_map = self.route_map.read().unwrap_or_else(PoisonError::into_inner);
            match route_map.route_for(path) {
                Some(route) => route.clone(),
                None => {
                    tracing::error!(path, "no route for request");
                    return Resolved::NotFound;
                }
            }
        };
        let params = route.matches(path).unwrap_or_default();

        let Ok(method) = Method::from_str(method_name) else {
            tracing::error!(method = method_name, "unknown request method");
            return Resolved::MethodNotAllowed;
        };
        let key = HandlerKey::new(method, route, content_type);
        match self.handlers.read().unwrap_or_else(PoisonError::into_inner).get(&key) {
            Some(script) => Resolved::Handler { key, script: Arc::clone(script), params },
            None => {
                tracing::error!(method = method_name, path, "no handler for request");
                Resolved::MethodNotAllowed
            }
        }
    }
}

/// Status plus empty `text/plain` body: the shape of every error reply.
fn plain_reply(status: StatusCode) -> http::Response<ReplyBody> {
    let mut response = http::Response::new(full_body(Bytes::new()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn assemble(
    status: u16,
    content_type: &str,
    headers: &[(String, String)],
    set_cookie: Option<String>,
    body: ReplyBody,
) -> http::Response<ReplyBody> {
    let Ok(status) = StatusCode::from_u16(status) else {
        tracing::error!(status, "scripted status code is not a valid HTTP status");
        return plain_reply(StatusCode::INTERNAL_SERVER_ERROR);
    };
    let mut builder = http::Response::builder().status(status).header(CONTENT_TYPE, content_type);
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(cookie) = set_cookie {
        builder = builder.header(SET_COOKIE, cookie);
    }
    match builder.body(body) {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("failed to assemble response: {e}");
            plain_reply(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn session_cookie(headers: &[(String, String)]) -> Option<String> {
    headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("cookie"))
        .flat_map(|(_, value)| value.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE).then(|| value.to_owned())
        })
}

fn version_parts(version: http::Version) -> (u8, u8) {
    match version {
        http::Version::HTTP_09 => (0, 9),
        http::Version::HTTP_10 => (1, 0),
        http::Version::HTTP_2 => (2, 0),
        http::Version::HTTP_3 => (3, 0),
        _ => (1, 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_found_among_other_cookies() {
        let headers = vec![(
            "Cookie".to_owned(),
            "theme=dark; Fixd-Session=abc123; lang=en".to_owned(),
        )];
        assert_eq!(session_cookie(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn session_cookie_absent() {
        let headers = vec![("Cookie".to_owned(), "theme=dark".to_owned())];
        assert_eq!(session_cookie(&headers), None);
        assert_eq!(session_cookie(&[]), None);
    }

    #[test]
    fn version_maps_to_major_minor() {
        assert_eq!(version_parts(http::Version::HTTP_11), (1, 1));
        assert_eq!(version_parts(http::Version::HTTP_10), (1, 0));
    }

    #[test]
    fn trigger_registration_is_idempotent() {
        let dispatcher = Arc::new(Dispatcher::new(2));
        let a = dispatcher.register_trigger(Method::Get, "/broadcast/:message", None);
        let b = dispatcher.register_trigger(Method::Get, "/broadcast/:message", None);
        assert_eq!(a, b);
        assert_eq!(dispatcher.handlers.read().unwrap().len(), 1);
    }

    #[test]
    fn resolution_distinguishes_404_from_405() {
        let dispatcher = Arc::new(Dispatcher::new(2));
        dispatcher.add_handler(Method::Get, "/known", None);

        assert!(matches!(dispatcher.resolve("GET", "/unknown", None), Resolved::NotFound));
        assert!(matches!(
            dispatcher.resolve("PUT", "/known", None),
            Resolved::MethodNotAllowed
        ));
        assert!(matches!(
            dispatcher.resolve("GET", "/known", None),
            Resolved::Handler { .. }
        ));
    }

    #[test]
    fn content_type_mismatch_does_not_fall_back() {
        let dispatcher = Arc::new(Dispatcher::new(2));
        dispatcher.add_handler(Method::Get, "/resource", Some("text/plain".to_owned()));

        // No handler without a content-type was registered, and a typed
        // handler never matches a differently-typed request.
        assert!(matches!(
            dispatcher.resolve("GET", "/resource", Some("application/json".to_owned())),
            Resolved::MethodNotAllowed
        ));
        assert!(matches!(
            dispatcher.resolve("GET", "/resource", None),
            Resolved::MethodNotAllowed
        ));
        assert!(matches!(
            dispatcher.resolve("GET", "/resource", Some("text/plain".to_owned())),
            Resolved::Handler { .. }
        ));
    }
}
