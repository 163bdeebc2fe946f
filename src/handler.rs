//! Handler scripts and the fluent registration handle.
//!
//! `Server::handle` returns a [`Handler`]: a cheap clone of the registered
//! script that mutates it in place. Scripts live behind an `RwLock`; the
//! dispatcher takes a frozen view per request, so scripting a handler after
//! registration can never tear an in-flight response.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::dispatch::Dispatcher;
use crate::method::Method;
use crate::request::Request;
use crate::response::{BodyScript, HttpResponse, ResponseBody};
use crate::route::Route;
use crate::session::SessionHook;

/// Key under which a handler is registered: method, route, and the optional
/// content-type discriminator. Handlers registered with distinct
/// content-types are distinct handlers.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct HandlerKey {
    method: Method,
    route: Route,
    content_type: Option<String>,
}

impl HandlerKey {
    pub(crate) fn new(method: Method, route: Route, content_type: Option<String>) -> Self {
        Self { method, route, content_type }
    }

    pub(crate) fn method(&self) -> Method {
        self.method
    }

    pub(crate) fn route(&self) -> &Route {
        &self.route
    }
}

/// When a handler writes its body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Timing {
    /// Written inline; the response is committed before dispatch returns.
    Once,
    /// Headers now, body after the delay.
    After(Duration),
    /// One chunk per period; `count` bounds the ticks, `None` streams until
    /// the client disconnects or the fixture stops.
    Every { period: Duration, count: Option<u64> },
}

/// User-supplied response logic, invoked per request.
///
/// Implemented for any `Fn(&Request, &mut HttpResponse)` closure.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &Request, response: &mut HttpResponse);
}

impl<F> RequestHandler for F
where
    F: Fn(&Request, &mut HttpResponse) + Send + Sync,
{
    fn handle(&self, request: &Request, response: &mut HttpResponse) {
        self(request, response)
    }
}

/// The stored, mutable handler script.
pub(crate) struct HandlerScript {
    status: Option<u16>,
    content_type: Option<String>,
    body: ResponseBody,
    headers: Vec<(String, String)>,
    session_hook: Option<Arc<dyn SessionHook>>,
    timing: Timing,
    upon: Option<HandlerKey>,
    timeout: Option<Duration>,
    custom: Option<Arc<dyn RequestHandler>>,
}

impl HandlerScript {
    pub(crate) fn new() -> Self {
        Self {
            status: None,
            content_type: None,
            body: ResponseBody::Empty,
            headers: Vec::new(),
            session_hook: None,
            timing: Timing::Once,
            upon: None,
            timeout: None,
            custom: None,
        }
    }

    /// The synthetic script registered at a trigger route: `200 text/plain`,
    /// empty body, so the trigger URL is a valid request target in its own
    /// right.
    pub(crate) fn trigger_stub() -> Self {
        let mut script = Self::new();
        script.status = Some(200);
        script.content_type = Some("text/plain".to_owned());
        script.body = ResponseBody::Interpreted(String::new());
        script
    }

    /// Freezes the script into the per-request view the dispatcher works
    /// from. `Reader` bodies are drained here, on first use.
    pub(crate) fn view(&self) -> ScriptView {
        ScriptView {
            status: self.status,
            content_type: self.content_type.clone(),
            headers: self.headers.clone(),
            session_hook: self.session_hook.clone(),
            custom: self.custom.clone(),
            body: self.body.to_script(),
            timing: self.timing,
            upon: self.upon.clone(),
            timeout: self.timeout,
        }
    }
}

/// A frozen per-request view of one handler script.
pub(crate) struct ScriptView {
    pub(crate) status: Option<u16>,
    pub(crate) content_type: Option<String>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) session_hook: Option<Arc<dyn SessionHook>>,
    pub(crate) custom: Option<Arc<dyn RequestHandler>>,
    pub(crate) body: BodyScript,
    pub(crate) timing: Timing,
    pub(crate) upon: Option<HandlerKey>,
    pub(crate) timeout: Option<Duration>,
}

/// Fluent handle over a registered handler script.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use stunt::{Method, Server};
///
/// # async fn doc(server: &Server) {
/// server.handle(Method::Get, "/echo/:message")
///     .with(200, "text/plain", "message: :message")
///     .every(Duration::from_millis(200), 2);
/// # }
/// ```
#[derive(Clone)]
pub struct Handler {
    script: Arc<RwLock<HandlerScript>>,
    dispatcher: Arc<Dispatcher>,
}

impl Handler {
    pub(crate) fn new(script: Arc<RwLock<HandlerScript>>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { script, dispatcher }
    }

    fn edit(self, f: impl FnOnce(&mut HandlerScript)) -> Self {
        f(&mut self.script.write().unwrap_or_else(PoisonError::into_inner));
        self
    }

    /// Scripts the response: status, content type, and an interpolated body.
    pub fn with(self, status: u16, content_type: impl Into<String>, body: impl Into<String>) -> Self {
        let (content_type, body) = (content_type.into(), body.into());
        self.edit(|s| {
            s.status = Some(status);
            s.content_type = Some(content_type);
            s.body = ResponseBody::Interpreted(body);
        })
    }

    /// Delegates the response to user code.
    pub fn with_handler(self, handler: impl RequestHandler + 'static) -> Self {
        let handler: Arc<dyn RequestHandler> = Arc::new(handler);
        self.edit(|s| s.custom = Some(handler))
    }

    /// Appends a response header. Duplicates are allowed and sent in order.
    pub fn with_header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let header = (name.into(), value.into());
        self.edit(|s| s.headers.push(header))
    }

    /// Attaches a session hook, run on every request that resolves here.
    pub fn with_session_handler(self, hook: impl SessionHook + 'static) -> Self {
        let hook: Arc<dyn SessionHook> = Arc::new(hook);
        self.edit(|s| s.session_hook = Some(hook))
    }

    /// Withholds the body until `delay` has elapsed. Headers are committed
    /// immediately.
    pub fn after(self, delay: Duration) -> Self {
        self.edit(|s| s.timing = Timing::After(delay))
    }

    /// Streams one body chunk per `period`. Pass a count to close the
    /// response after that many chunks, or `None` to stream until the client
    /// disconnects or the fixture stops.
    pub fn every(self, period: Duration, count: impl Into<Option<u64>>) -> Self {
        let count = count.into();
        self.edit(|s| s.timing = Timing::Every { period, count })
    }

    /// Subscribes this handler to a trigger route: the response stays open
    /// and the scripted body is written once per request to the trigger,
    /// interpolated against the triggering request.
    pub fn upon(self, method: Method, resource: &str) -> Self {
        self.subscribe(method, resource, None)
    }

    /// Like [`upon`](Self::upon), for a content-type-qualified trigger.
    pub fn upon_content_type(self, method: Method, resource: &str, content_type: &str) -> Self {
        self.subscribe(method, resource, Some(content_type.to_owned()))
    }

    fn subscribe(self, method: Method, resource: &str, content_type: Option<String>) -> Self {
        let key = self.dispatcher.register_trigger(method, resource, content_type);
        self.edit(|s| s.upon = Some(key))
    }

    /// Deadline for an `upon` subscription: with no broadcast by then, the
    /// subscriber receives `408 Request Timeout`.
    pub fn with_timeout(self, deadline: Duration) -> Self {
        self.edit(|s| s.timeout = Some(deadline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_distinguish_content_types() {
        let a = HandlerKey::new(Method::Get, Route::new("/r"), None);
        let b = HandlerKey::new(Method::Get, Route::new("/r"), Some("text/plain".into()));
        let c = HandlerKey::new(Method::Get, Route::new("/r"), Some("text/plain".into()));
        assert_ne!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn keys_distinguish_methods_and_routes() {
        let a = HandlerKey::new(Method::Get, Route::new("/r"), None);
        let b = HandlerKey::new(Method::Put, Route::new("/r"), None);
        let c = HandlerKey::new(Method::Get, Route::new("/other"), None);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn scripts_start_unset_and_synchronous() {
        let view = HandlerScript::new().view();
        assert_eq!(view.status, None);
        assert_eq!(view.timing, Timing::Once);
        assert!(view.upon.is_none());
    }

    #[test]
    fn views_carry_timing_and_trigger_binding() {
        let mut script = HandlerScript::new();
        script.timing = Timing::After(Duration::from_millis(1));
        assert_eq!(script.view().timing, Timing::After(Duration::from_millis(1)));

        let mut script = HandlerScript::new();
        let trigger = HandlerKey::new(Method::Get, Route::new("/t"), None);
        script.upon = Some(trigger.clone());
        assert_eq!(script.view().upon, Some(trigger));
    }

    #[test]
    fn trigger_stub_is_a_complete_script() {
        let view = HandlerScript::trigger_stub().view();
        assert_eq!(view.status, Some(200));
        assert_eq!(view.content_type.as_deref(), Some("text/plain"));
        assert_eq!(view.timing, Timing::Once);
        assert!(view.upon.is_none());
    }
}
