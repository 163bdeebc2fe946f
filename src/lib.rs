//! # stunt
//!
//! A scriptable HTTP server fixture for integration tests. Your services'
//! stunt double.
//!
//! ## The contract
//!
//! The program under test talks to real HTTP services. In a test, it talks
//! to a stunt instead: a real HTTP/1.1 endpoint on a port you choose, whose
//! every response you scripted, and which remembers every request it was
//! sent. stunt is a test fixture, not a web framework, and it deliberately
//! skips TLS, authentication, HTTP/2, and anything else a production edge
//! would own.
//!
//! What a stunt does:
//!
//! - **Scripted routes** — `/users/:id<[0-9]+>` patterns with status,
//!   headers, and a templated body interpolating the live request
//! - **Request capture** — a bounded FIFO of everything the fixture saw,
//!   for after-the-fact assertions
//! - **Sessions** — cookie-backed server-side state for stateful flows
//! - **Async scripts** — delayed bodies (`after`), periodic chunks
//!   (`every`), and publish/subscribe streams (`upon`) driven by trigger
//!   requests
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use stunt::{Method, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new(8080);
//!     server.start().await.unwrap();
//!
//!     server.handle(Method::Get, "/name/:name")
//!         .with(200, "text/plain", "Hello :name");
//!
//!     // ... drive the program under test against the fixture;
//!     // GET /name/Tim answers 200 "Hello Tim" ...
//!
//!     // then assert on what it actually sent:
//!     while let Some(captured) = server.request() {
//!         println!("{}", captured.request_line());
//!     }
//!     server.stop().await;
//! }
//! ```

mod capture;
mod dispatch;
mod engine;
mod error;
mod handler;
mod interpolate;
mod method;
mod request;
mod response;
mod route;
mod server;
mod session;

pub use capture::CapturedRequest;
pub use error::Error;
pub use handler::{Handler, RequestHandler};
pub use method::Method;
pub use request::Request;
pub use response::HttpResponse;
pub use server::Server;
pub use session::{PathParamHook, RequestParamHook, Session, SessionHook};
