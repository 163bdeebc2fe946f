//! Scripted response bodies and the reply types handed to hyper.
//!
//! Bodies are a tagged variant dispatched by `match`, not a trait object:
//! the set of body kinds is closed and the dispatcher picks a write
//! strategy per variant. Sync replies use a `Full` body; async replies
//! (`after`, `every`, `upon`) use a channel-backed stream the engine feeds.

use std::convert::Infallible;
use std::io::Read;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::interpolate::interpolate;
use crate::request::Request;

/// The response body type served to hyper.
pub(crate) type ReplyBody = BoxBody<Bytes, Infallible>;

/// A complete body, known up front.
pub(crate) fn full_body(bytes: Bytes) -> ReplyBody {
    Full::new(bytes).boxed()
}

/// A streaming body fed through a channel. Dropping the sender ends the
/// stream; a failed send means the client went away.
pub(crate) fn channel_body() -> (mpsc::Sender<Bytes>, ReplyBody) {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let stream = ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)));
    (tx, StreamBody::new(stream).boxed())
}

/// A scripted response body, as declared on a handler or set by a custom
/// handler.
///
/// `Interpreted` bodies run through the interpolator at send time; all
/// others are passed through verbatim. `Reader` bodies are drained once,
/// on first use.
pub(crate) enum ResponseBody {
    Empty,
    Bytes(Bytes),
    Text(String),
    Interpreted(String),
    Reader(Mutex<Option<Box<dyn Read + Send>>>),
}

impl ResponseBody {
    /// Reduces the declared body to something renderable per response:
    /// fixed bytes, or a template to expand against each request.
    pub(crate) fn to_script(&self) -> BodyScript {
        match self {
            Self::Empty => BodyScript::None,
            Self::Bytes(b) => BodyScript::Fixed(b.clone()),
            Self::Text(s) => BodyScript::Fixed(Bytes::from(s.clone())),
            Self::Interpreted(t) => BodyScript::Template(t.clone()),
            Self::Reader(slot) => {
                let reader = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                match reader {
                    Some(mut r) => {
                        let mut buf = Vec::new();
                        match r.read_to_end(&mut buf) {
                            Ok(_) => BodyScript::Fixed(Bytes::from(buf)),
                            Err(e) => {
                                tracing::error!("failed to read stream body: {e}");
                                BodyScript::None
                            }
                        }
                    }
                    None => BodyScript::None,
                }
            }
        }
    }
}

/// A body reduced to its per-request write form.
#[derive(Clone, Debug)]
pub(crate) enum BodyScript {
    None,
    Fixed(Bytes),
    Template(String),
}

impl BodyScript {
    /// Renders the body against `request`. `None` means the handler
    /// declared no content.
    pub(crate) fn render(&self, request: &Request) -> Option<Bytes> {
        match self {
            Self::None => None,
            Self::Fixed(bytes) => Some(bytes.clone()),
            Self::Template(template) => Some(Bytes::from(interpolate(template, request))),
        }
    }
}

/// The mutable reply a custom handler fills in.
///
/// ```rust,no_run
/// use stunt::{Method, Server};
///
/// # async fn doc(server: &Server) {
/// server.handle(Method::Get, "/clear").with_handler(|req: &stunt::Request, res: &mut stunt::HttpResponse| {
///     if let Some(session) = req.session() {
///         session.invalidate();
///     }
///     res.set_status_code(200);
///     res.set_content_type("text/plain");
///     res.set_body("OK");
/// });
/// # }
/// ```
#[derive(Default)]
pub struct HttpResponse {
    pub(crate) status: Option<u16>,
    pub(crate) content_type: Option<String>,
    pub(crate) body: Option<ResponseBody>,
}

impl HttpResponse {
    pub fn set_status_code(&mut self, status: u16) {
        self.status = Some(status);
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    /// Sets a literal string body. Not interpolated; use
    /// [`set_interpreted_body`](Self::set_interpreted_body) for that.
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = Some(ResponseBody::Text(body.into()));
    }

    /// Sets a raw byte body.
    pub fn set_body_bytes(&mut self, body: impl Into<Bytes>) {
        self.body = Some(ResponseBody::Bytes(body.into()));
    }

    /// Sets a body drained from a reader at send time.
    pub fn set_body_reader(&mut self, reader: impl Read + Send + 'static) {
        self.body = Some(ResponseBody::Reader(Mutex::new(Some(Box::new(reader)))));
    }

    /// Sets a scripted body: interpolation tokens are expanded against the
    /// current request before the body is written.
    pub fn set_interpreted_body(&mut self, body: impl Into<String>) {
        self.body = Some(ResponseBody::Interpreted(body.into()));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::method::Method;

    fn request() -> Request {
        Request::new(
            Method::Get,
            "/".into(),
            String::new(),
            1,
            1,
            vec![],
            Bytes::new(),
            HashMap::from([("name".to_owned(), "Tim".to_owned())]),
            None,
        )
    }

    #[test]
    fn text_bodies_pass_through_verbatim() {
        let body = ResponseBody::Text("Hello :name".into());
        let rendered = body.to_script().render(&request()).unwrap();
        assert_eq!(&rendered[..], b"Hello :name");
    }

    #[test]
    fn interpreted_bodies_expand() {
        let body = ResponseBody::Interpreted("Hello :name".into());
        let rendered = body.to_script().render(&request()).unwrap();
        assert_eq!(&rendered[..], b"Hello Tim");
    }

    #[test]
    fn reader_bodies_drain_once() {
        let body = ResponseBody::Reader(Mutex::new(Some(Box::new(&b"Hello Tim"[..]))));
        let first = body.to_script().render(&request()).unwrap();
        assert_eq!(&first[..], b"Hello Tim");
        // The reader was consumed; a second snapshot has no content.
        assert!(body.to_script().render(&request()).is_none());
    }

    #[test]
    fn empty_body_renders_nothing() {
        assert!(ResponseBody::Empty.to_script().render(&request()).is_none());
    }
}
