//! Timers, subscriptions, and trigger broadcast.
//!
//! Every async response mode funnels through here: `after` arms a one-shot
//! timer, `every` a fixed-period ticker, and `upon` registers a subscription
//! under its trigger key. Body writes always run on engine tasks and each
//! holds a worker-pool permit, so a fixture never runs more concurrent
//! writes than it was configured for.
//!
//! Ordering: `broadcast` walks a trigger's subscribers in registration order
//! and enqueues the triggering request on each subscription's job queue
//! under one short lock. Each subscription drains its queue from a single
//! writer task, so every subscriber sees sequential broadcasts in the order
//! the server received them. Writes to distinct responses interleave freely.
//!
//! Cancellation: a failed body-channel send means the client disconnected;
//! the writer deregisters silently. `shutdown` fans out over a watch channel
//! and stops every timer and subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::time::Instant;

use crate::handler::HandlerKey;
use crate::request::Request;
use crate::response::BodyScript;

type Registry = Arc<Mutex<HashMap<HandlerKey, Vec<Subscriber>>>>;

/// One live `upon` subscription, as seen by `broadcast`.
struct Subscriber {
    id: u64,
    jobs: mpsc::UnboundedSender<Request>,
}

pub(crate) struct AsyncEngine {
    workers: Arc<Semaphore>,
    registry: Registry,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl AsyncEngine {
    pub(crate) fn new(workers: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            workers: Arc::new(Semaphore::new(workers)),
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Stops every timer and subscription. Held-open responses end their
    /// streams, which lets in-flight connections drain.
    pub(crate) fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.registry.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// `after`: write the body once `delay` has elapsed, then end the stream.
    pub(crate) fn spawn_after(
        &self,
        delay: Duration,
        body: BodyScript,
        request: Request,
        tx: mpsc::Sender<Bytes>,
    ) {
        let workers = Arc::clone(&self.workers);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    let Ok(_permit) = workers.acquire().await else { return };
                    if let Some(bytes) = body.render(&request) {
                        let _ = tx.send(bytes).await;
                    }
                }
                _ = shutdown.changed() => {}
            }
        });
    }

    /// `every`: write one body chunk per tick, at a fixed period from
    /// dispatch. Closes after `count` chunks; streams until disconnect or
    /// shutdown when `count` is `None`.
    pub(crate) fn spawn_every(
        &self,
        period: Duration,
        count: Option<u64>,
        body: BodyScript,
        request: Request,
        tx: mpsc::Sender<Bytes>,
    ) {
        let workers = Arc::clone(&self.workers);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            if *shutdown.borrow() || count == Some(0) {
                return;
            }
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            let mut written = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Ok(_permit) = workers.acquire().await else { break };
                        let chunk = body.render(&request).unwrap_or_default();
                        if !chunk.is_empty() && tx.send(chunk).await.is_err() {
                            break;
                        }
                        written += 1;
                        if count.is_some_and(|n| written >= n) {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    /// `upon`: register a subscription under `trigger` and hold the response
    /// open for broadcasts.
    ///
    /// The status line is withheld behind `gate`: the first broadcast
    /// releases it with the handler's scripted `status`, a deadline with no
    /// broadcast releases it as 408 and closes. Once the first chunk is out
    /// the deadline is moot.
    pub(crate) fn subscribe(
        &self,
        trigger: HandlerKey,
        status: u16,
        body: BodyScript,
        timeout: Option<Duration>,
        gate: oneshot::Sender<u16>,
        tx: mpsc::Sender<Bytes>,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<Request>();
        {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry
                .entry(trigger.clone())
                .or_default()
                .push(Subscriber { id, jobs: jobs_tx });
        }

        let workers = Arc::clone(&self.workers);
        let registry = Arc::clone(&self.registry);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut gate = Some(gate);
            let has_deadline = timeout.is_some();
            let deadline = Instant::now() + timeout.unwrap_or(Duration::ZERO);

            // Copy the flag out; holding the watch ref across an await would
            // block shutdown itself.
            let already_stopped = *shutdown.borrow();
            if !already_stopped {
                loop {
                    tokio::select! {
                        job = jobs_rx.recv() => match job {
                            Some(request) => {
                                let Ok(_permit) = workers.acquire().await else { break };
                                if let Some(open) = gate.take() {
                                    let _ = open.send(status);
                                }
                                let chunk = body.render(&request).unwrap_or_default();
                                if !chunk.is_empty() && tx.send(chunk).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        () = tokio::time::sleep_until(deadline), if has_deadline && gate.is_some() => {
                            tracing::debug!(subscription = id, "subscription timed out");
                            if let Some(open) = gate.take() {
                                let _ = open.send(408);
                            }
                            break;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }
            deregister(&registry, &trigger, id);
        });
    }

    /// Fans one trigger request out to every live subscriber of `key`, in
    /// registration order. Subscribers whose writer has gone away are pruned
    /// here.
    pub(crate) fn broadcast(&self, key: &HandlerKey, request: &Request) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = registry.get_mut(key) else {
            return;
        };
        subscribers.retain(|sub| sub.jobs.send(request.clone()).is_ok());
        tracing::debug!(
            trigger = %key.route(),
            subscribers = subscribers.len(),
            "broadcast"
        );
        if subscribers.is_empty() {
            registry.remove(key);
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, key: &HandlerKey) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, Vec::len)
    }
}

fn deregister(registry: &Registry, key: &HandlerKey, id: u64) {
    let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(subscribers) = registry.get_mut(key) {
        subscribers.retain(|sub| sub.id != id);
        if subscribers.is_empty() {
            registry.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Method;
    use crate::route::Route;

    fn engine() -> AsyncEngine {
        AsyncEngine::new(10)
    }

    fn request(params: &[(&str, &str)]) -> Request {
        Request::new(
            Method::Get,
            "/".into(),
            String::new(),
            1,
            1,
            vec![],
            Bytes::new(),
            params.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect(),
            None,
        )
    }

    fn trigger_key() -> HandlerKey {
        HandlerKey::new(Method::Get, Route::new("/broadcast/:message"), None)
    }

    #[tokio::test]
    async fn after_writes_once_then_closes() {
        let engine = engine();
        let (tx, mut rx) = mpsc::channel(8);
        engine.spawn_after(
            Duration::from_millis(10),
            BodyScript::Template("hi".into()),
            request(&[]),
            tx,
        );
        assert_eq!(rx.recv().await.as_deref(), Some(&b"hi"[..]));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn every_writes_exactly_count_chunks() {
        let engine = engine();
        let (tx, mut rx) = mpsc::channel(8);
        engine.spawn_every(
            Duration::from_millis(10),
            Some(3),
            BodyScript::Template("tick".into()),
            request(&[]),
            tx,
        );
        for _ in 0..3 {
            assert_eq!(rx.recv().await.as_deref(), Some(&b"tick"[..]));
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn every_stops_when_client_disconnects() {
        let engine = engine();
        let (tx, mut rx) = mpsc::channel(8);
        engine.spawn_every(
            Duration::from_millis(5),
            None,
            BodyScript::Template("tick".into()),
            request(&[]),
            tx,
        );
        assert!(rx.recv().await.is_some());
        drop(rx);
        // Nothing to assert on directly; the writer task exits on its next
        // failed send. Give it a tick to do so.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn broadcasts_arrive_in_order_with_trigger_context() {
        let engine = engine();
        let key = trigger_key();
        let (gate_tx, gate_rx) = oneshot::channel();
        let (tx, mut rx) = mpsc::channel(8);
        engine.subscribe(
            key.clone(),
            200,
            BodyScript::Template("message: :message".into()),
            None,
            gate_tx,
            tx,
        );

        engine.broadcast(&key, &request(&[("message", "hello0")]));
        engine.broadcast(&key, &request(&[("message", "hello1")]));

        assert_eq!(gate_rx.await, Ok(200));
        assert_eq!(rx.recv().await.as_deref(), Some(&b"message: hello0"[..]));
        assert_eq!(rx.recv().await.as_deref(), Some(&b"message: hello1"[..]));
    }

    #[tokio::test]
    async fn every_subscriber_receives_each_broadcast() {
        let engine = engine();
        let key = trigger_key();
        let mut gates = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..2 {
            let (gate_tx, gate_rx) = oneshot::channel();
            let (tx, rx) = mpsc::channel(8);
            engine.subscribe(
                key.clone(),
                200,
                BodyScript::Template(":message".into()),
                None,
                gate_tx,
                tx,
            );
            gates.push(gate_rx);
            receivers.push(rx);
        }

        engine.broadcast(&key, &request(&[("message", "hello")]));

        for gate in gates {
            assert_eq!(gate.await, Ok(200));
        }
        for mut rx in receivers {
            assert_eq!(rx.recv().await.as_deref(), Some(&b"hello"[..]));
        }
    }

    #[tokio::test]
    async fn deadline_releases_408_and_deregisters() {
        let engine = engine();
        let key = trigger_key();
        let (gate_tx, gate_rx) = oneshot::channel();
        let (tx, mut rx) = mpsc::channel(8);
        engine.subscribe(
            key.clone(),
            200,
            BodyScript::Template(":message".into()),
            Some(Duration::from_millis(20)),
            gate_tx,
            tx,
        );
        assert_eq!(engine.subscriber_count(&key), 1);

        assert_eq!(gate_rx.await, Ok(408));
        assert!(rx.recv().await.is_none());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.subscriber_count(&key), 0);
    }

    #[tokio::test]
    async fn disconnected_subscriber_is_pruned_on_broadcast() {
        let engine = engine();
        let key = trigger_key();
        let (gate_tx, _gate_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(8);
        engine.subscribe(
            key.clone(),
            200,
            BodyScript::Template(":message".into()),
            None,
            gate_tx,
            tx,
        );
        drop(rx);

        engine.broadcast(&key, &request(&[("message", "x")]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.broadcast(&key, &request(&[("message", "y")]));
        assert_eq!(engine.subscriber_count(&key), 0);
    }

    #[tokio::test]
    async fn shutdown_ends_open_subscriptions() {
        let engine = engine();
        let key = trigger_key();
        let (gate_tx, gate_rx) = oneshot::channel();
        let (tx, mut rx) = mpsc::channel(8);
        engine.subscribe(key.clone(), 200, BodyScript::None, None, gate_tx, tx);

        engine.shutdown();
        // The writer exits without ever releasing the gate.
        assert!(gate_rx.await.is_err());
        assert!(rx.recv().await.is_none());
    }
}
