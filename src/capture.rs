//! Captured requests and the bounded capture ring.
//!
//! Every incoming request is snapshotted before resolution, so unroutable
//! requests are recorded too. Tests drain the ring afterwards to assert on
//! exactly what the program under test sent.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use bytes::Bytes;

/// An immutable snapshot of one observed request.
#[derive(Clone, Debug)]
pub struct CapturedRequest {
    request_line: String,
    method: String,
    path: String,
    query: String,
    headers: Vec<(String, String)>,
    body: Bytes,
    received_at: SystemTime,
}

impl CapturedRequest {
    pub(crate) fn new(
        method: &str,
        path: &str,
        query: &str,
        major: u8,
        minor: u8,
        headers: Vec<(String, String)>,
        body: Bytes,
    ) -> Self {
        let target = if query.is_empty() {
            path.to_owned()
        } else {
            format!("{path}?{query}")
        };
        Self {
            request_line: format!("{method} {target} HTTP/{major}.{minor}"),
            method: method.to_owned(),
            path: path.to_owned(),
            query: query.to_owned(),
            headers,
            body,
            received_at: SystemTime::now(),
        }
    }

    /// The request line as it appeared on the wire, e.g.
    /// `"GET /say-hello HTTP/1.1"`.
    pub fn request_line(&self) -> &str {
        &self.request_line
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }
}

/// Bounded FIFO of captured requests.
///
/// Unbounded until a limit is set. Append and trim happen under one lock so
/// the `len <= limit` invariant holds at every observable point.
#[derive(Debug, Default)]
pub(crate) struct CaptureRing {
    state: Mutex<RingState>,
}

#[derive(Debug, Default)]
struct RingState {
    queue: VecDeque<CapturedRequest>,
    limit: Option<usize>,
}

impl CaptureRing {
    pub(crate) fn push(&self, captured: CapturedRequest) {
        let mut state = self.lock();
        state.queue.push_back(captured);
        if let Some(limit) = state.limit {
            while state.queue.len() > limit {
                state.queue.pop_front();
            }
        }
    }

    pub(crate) fn set_limit(&self, limit: usize) {
        let mut state = self.lock();
        state.limit = Some(limit);
        while state.queue.len() > limit {
            state.queue.pop_front();
        }
    }

    /// Snapshot of the ring, oldest first.
    pub(crate) fn snapshot(&self) -> Vec<CapturedRequest> {
        self.lock().queue.iter().cloned().collect()
    }

    /// Removes and returns the oldest captured request.
    pub(crate) fn next(&self) -> Option<CapturedRequest> {
        self.lock().queue.pop_front()
    }

    // No mutation inside the lock can leave the queue inconsistent, so a
    // poisoned guard is taken rather than panicking the dispatch path.
    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn captured(path: &str) -> CapturedRequest {
        CapturedRequest::new("GET", path, "", 1, 1, vec![], Bytes::new())
    }

    #[test]
    fn request_line_round_trips() {
        let c = CapturedRequest::new("PUT", "/name/Tim", "", 1, 1, vec![], Bytes::new());
        assert_eq!(c.request_line(), "PUT /name/Tim HTTP/1.1");
    }

    #[test]
    fn request_line_includes_query() {
        let c = CapturedRequest::new("GET", "/greeting", "name=Tim", 1, 1, vec![], Bytes::new());
        assert_eq!(c.request_line(), "GET /greeting?name=Tim HTTP/1.1");
    }

    #[test]
    fn drains_in_arrival_order() {
        let ring = CaptureRing::default();
        ring.push(captured("/1"));
        ring.push(captured("/2"));
        assert_eq!(ring.next().unwrap().path(), "/1");
        assert_eq!(ring.next().unwrap().path(), "/2");
        assert!(ring.next().is_none());
    }

    #[test]
    fn limit_evicts_oldest() {
        let ring = CaptureRing::default();
        ring.set_limit(2);
        ring.push(captured("/1"));
        ring.push(captured("/2"));
        ring.push(captured("/3"));
        let paths: Vec<_> = ring.snapshot().iter().map(|c| c.path().to_owned()).collect();
        assert_eq!(paths, vec!["/2", "/3"]);
    }

    #[test]
    fn lowering_limit_trims_immediately() {
        let ring = CaptureRing::default();
        for p in ["/1", "/2", "/3"] {
            ring.push(captured(p));
        }
        ring.set_limit(1);
        let paths: Vec<_> = ring.snapshot().iter().map(|c| c.path().to_owned()).collect();
        assert_eq!(paths, vec!["/3"]);
    }

    #[test]
    fn zero_limit_keeps_nothing() {
        let ring = CaptureRing::default();
        ring.set_limit(0);
        ring.push(captured("/1"));
        assert!(ring.snapshot().is_empty());
    }
}
