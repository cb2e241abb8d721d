//! Discovery sessions and the session registry.
//!
//! One [`DiscoverySession`] exists per session key (driver, normalised service
//! type) while it has subscribers. The first subscriber spawns the session's
//! pump task, the last one to leave sends it `Stop`. The pump owns everything
//! that touches the driver: it acquires the shared handle, starts discovery,
//! feeds found services through the [`ResolveBacklog`], fans events out to
//! subscribers and tears everything down again.
//!
//! Registry entries and subscriber sets are only mutated while the DashMap
//! entry for the key is held, so a last unsubscribe and a concurrent first
//! subscribe cannot both own the transition. A new session for a key waits
//! for its predecessor's teardown before starting the driver.

use crate::backlog::ResolveBacklog;
use crate::driver::{Driver, DriverSink, ResolveReply};
use crate::guard::{HandleLease, SharedResourceGuard};
use crate::metrics::DiscoveryMetrics;
use crate::stream::{DiscoveryStream, Subscription};
use bonjour_core::{DiscoveryError, DiscoveryEvent, ServiceRecord};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type EventSender = mpsc::UnboundedSender<Result<DiscoveryEvent, DiscoveryError>>;

/// Identity of a shared discovery session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub driver: String,
    pub service_type: String,
}

impl SessionKey {
    pub fn new(driver: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            service_type: service_type.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.driver, self.service_type)
    }
}

/// Work items for a session's pump task. Driver callbacks arrive here through
/// [`DriverSink`] and [`ResolveReply`].
#[derive(Debug)]
pub(crate) enum SessionSignal {
    Start,
    Stop,
    Found(ServiceRecord),
    Lost(ServiceRecord),
    StartFailed(i32),
    StopFailed(i32),
    Resolved(ServiceRecord),
    ResolveFailed(i32),
}

/// A running discovery for one session key.
pub struct DiscoverySession {
    id: u64,
    key: SessionKey,
    subscribers: Mutex<HashMap<u64, EventSender>>,
    signals: async_channel::Sender<SessionSignal>,
    done: CancellationToken,
}

impl DiscoverySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn broadcast(&self, event: DiscoveryEvent) {
        for subscriber in self.subscribers.lock().values() {
            let _ = subscriber.send(Ok(event.clone()));
        }
    }

    fn signal(&self, signal: SessionSignal) {
        if self.signals.try_send(signal).is_err() {
            debug!(session = %self.key, "Session pump already gone");
        }
    }
}

/// Live and retiring sessions for one driver.
pub(crate) struct SessionRegistry<D: Driver> {
    driver: Arc<D>,
    guard: Arc<SharedResourceGuard<D>>,
    backlog_capacity: usize,
    runtime: Handle,
    metrics: Arc<DiscoveryMetrics>,
    sessions: DashMap<SessionKey, Arc<DiscoverySession>>,
    retiring: DashMap<SessionKey, (u64, CancellationToken)>,
    next_session_id: AtomicU64,
    next_subscriber_id: AtomicU64,
}

/// Removes a subscriber from its session. Implemented by the registry so
/// streams need not know the driver type.
pub(crate) trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, key: &SessionKey, session_id: u64, subscriber_id: u64);
}

impl<D: Driver> SessionRegistry<D> {
    pub(crate) fn new(
        driver: Arc<D>,
        guard: Arc<SharedResourceGuard<D>>,
        backlog_capacity: usize,
        runtime: Handle,
        metrics: Arc<DiscoveryMetrics>,
    ) -> Self {
        Self {
            driver,
            guard,
            backlog_capacity,
            runtime,
            metrics,
            sessions: DashMap::new(),
            retiring: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Adds a subscriber for `service_type` (already normalised). Never blocks
    /// and never touches the driver directly.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        service_type: &str,
        context: &CancellationToken,
    ) -> DiscoveryStream {
        if context.is_cancelled() {
            debug!(service_type, "Subscribe with stale context");
            return DiscoveryStream::failed(DiscoveryError::StaleContext);
        }

        let key = SessionKey::new(self.driver.name(), service_type);
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let session = match self.sessions.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let session = entry.get().clone();
                session.subscribers.lock().insert(subscriber_id, tx);
                session
            }
            Entry::Vacant(entry) => {
                let session = self.spawn_session(key.clone());
                session.subscribers.lock().insert(subscriber_id, tx);
                session.signal(SessionSignal::Start);
                entry.insert(session.clone());
                session
            }
        };

        debug!(
            session = %key,
            subscriber = subscriber_id,
            subscribers = session.subscriber_count(),
            "Subscribed"
        );

        let registry: Arc<dyn Unsubscribe> = self.clone();
        DiscoveryStream::new(
            rx,
            Subscription::new(registry, key, session.id, subscriber_id),
        )
    }

    /// Normalised types of the sessions currently registered.
    pub(crate) fn active_service_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().service_type.clone())
            .collect();
        types.sort();
        types
    }

    pub(crate) fn session(&self, service_type: &str) -> Option<Arc<DiscoverySession>> {
        let key = SessionKey::new(self.driver.name(), service_type);
        self.sessions.get(&key).map(|entry| entry.value().clone())
    }

    /// Waits until every session that has lost its last subscriber has
    /// finished tearing down.
    pub(crate) async fn wait_retired(&self) {
        let pending: Vec<CancellationToken> = self
            .retiring
            .iter()
            .map(|entry| entry.value().1.clone())
            .collect();

        for done in pending {
            done.cancelled().await;
        }
    }

    fn spawn_session(self: &Arc<Self>, key: SessionKey) -> Arc<DiscoverySession> {
        let (signals_tx, signals_rx) = async_channel::unbounded();
        let session = Arc::new(DiscoverySession {
            id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            key: key.clone(),
            subscribers: Mutex::new(HashMap::new()),
            signals: signals_tx,
            done: CancellationToken::new(),
        });

        let predecessor = self.retiring.get(&key).map(|entry| entry.value().1.clone());
        let pump = SessionPump {
            registry: self.clone(),
            session: session.clone(),
            signals: signals_rx,
            predecessor,
        };
        self.runtime.spawn(pump.run());

        session
    }

    /// Drops a failed session from the registry. The entry is only removed if
    /// it still belongs to `session`.
    fn retire_failed(&self, session: &DiscoverySession) {
        if let Entry::Occupied(entry) = self.sessions.entry(session.key.clone()) {
            if entry.get().id == session.id {
                self.retiring
                    .insert(session.key.clone(), (session.id, session.done.clone()));
                entry.remove();
            }
        }
    }

    fn finish_retiring(&self, session: &DiscoverySession) {
        session.done.cancel();
        self.retiring
            .remove_if(&session.key, |_, (id, _)| *id == session.id);
    }
}

impl<D: Driver> Unsubscribe for SessionRegistry<D> {
    fn unsubscribe(&self, key: &SessionKey, session_id: u64, subscriber_id: u64) {
        let Entry::Occupied(entry) = self.sessions.entry(key.clone()) else {
            return;
        };
        if entry.get().id != session_id {
            return;
        }

        let remaining = {
            let mut subscribers = entry.get().subscribers.lock();
            subscribers.remove(&subscriber_id);
            subscribers.len()
        };
        debug!(session = %key, subscriber = subscriber_id, remaining, "Unsubscribed");

        if remaining == 0 {
            let session = entry.get().clone();
            self.retiring
                .insert(key.clone(), (session.id, session.done.clone()));
            entry.remove();
            session.signal(SessionSignal::Stop);
        }
    }
}

/// Driver-side state of a session between a successful start and teardown.
struct ActiveDiscovery<H> {
    lease: HandleLease<H>,
    backlog: ResolveBacklog<ServiceRecord>,
}

struct SessionPump<D: Driver> {
    registry: Arc<SessionRegistry<D>>,
    session: Arc<DiscoverySession>,
    signals: async_channel::Receiver<SessionSignal>,
    predecessor: Option<CancellationToken>,
}

impl<D: Driver> SessionPump<D> {
    async fn run(mut self) {
        let mut active: Option<ActiveDiscovery<D::Handle>> = None;

        while let Ok(signal) = self.signals.recv().await {
            match signal {
                SessionSignal::Start => {
                    if let Some(predecessor) = self.predecessor.take() {
                        predecessor.cancelled().await;
                    }
                    match self.activate().await {
                        Ok(discovery) => active = Some(discovery),
                        Err(err) => {
                            self.fail(err);
                            break;
                        }
                    }
                }
                SessionSignal::Stop => break,
                SessionSignal::Found(service) => {
                    let Some(discovery) = &active else { continue };
                    if let Err(err) = discovery.backlog.submit(service) {
                        self.registry.metrics.record_backlog_rejection();
                        warn!(session = %self.session.key, error = %err, "Found service dropped");
                    }
                }
                SessionSignal::Lost(service) => {
                    if active.is_some() {
                        debug!(session = %self.session.key, service = service.name(), "Service lost");
                        self.session.broadcast(DiscoveryEvent::Removed(service));
                    }
                }
                SessionSignal::Resolved(service) => {
                    let Some(discovery) = &active else { continue };
                    debug!(session = %self.session.key, service = %service, "Service resolved");
                    self.registry.metrics.record_resolve_completed();
                    self.session.broadcast(DiscoveryEvent::Added(service));
                    discovery.backlog.advance();
                }
                SessionSignal::ResolveFailed(code) => {
                    let Some(discovery) = &active else { continue };
                    debug!(session = %self.session.key, code, "Resolve failed");
                    self.registry.metrics.record_resolve_failed();
                    discovery.backlog.advance();
                }
                SessionSignal::StartFailed(code) | SessionSignal::StopFailed(code) => {
                    self.fail(DiscoveryError::discovery_failed(
                        self.registry.driver.name(),
                        &self.session.key.service_type,
                        code,
                    ));
                    break;
                }
            }
        }

        self.teardown(active);
        self.registry.finish_retiring(&self.session);
    }

    async fn activate(&self) -> Result<ActiveDiscovery<D::Handle>, DiscoveryError> {
        let registry = &self.registry;
        let driver_name = registry.driver.name().to_string();
        let service_type = self.session.key.service_type.clone();

        let guard = registry.guard.clone();
        let lease = tokio::task::spawn_blocking(move || guard.acquire())
            .await
            .map_err(|e| DiscoveryError::resource_unavailable(&driver_name, e.to_string()))??;

        let driver = registry.driver.clone();
        let handle = lease.handle().clone();
        let replies = self.session.signals.clone();
        let backlog = ResolveBacklog::new(
            format!("resolve-{service_type}"),
            registry.backlog_capacity,
            move |service| driver.resolve(&handle, service, ResolveReply::new(replies.clone())),
        );
        let backlog = match backlog {
            Ok(backlog) => backlog,
            Err(e) => {
                registry.guard.release(lease);
                return Err(DiscoveryError::resource_unavailable(driver_name, e.to_string()));
            }
        };

        let sink = DriverSink::new(self.session.signals.clone());
        if let Err(e) = registry.driver.start(lease.handle(), &service_type, sink) {
            backlog.stop();
            registry.guard.release(lease);
            return Err(DiscoveryError::discovery_failed(
                driver_name,
                service_type,
                e.code,
            ));
        }

        registry.metrics.record_session_started();
        info!(session = %self.session.key, "Discovery started");
        Ok(ActiveDiscovery { lease, backlog })
    }

    /// Ends the stream of every current subscriber with `err` and removes the
    /// session from the registry.
    fn fail(&self, err: DiscoveryError) {
        warn!(session = %self.session.key, error = %err, "Discovery session failed");
        self.registry
            .metrics
            .record_session_failed(self.registry.driver.name());

        self.registry.retire_failed(&self.session);
        let subscribers = std::mem::take(&mut *self.session.subscribers.lock());
        for subscriber in subscribers.values() {
            let _ = subscriber.send(Err(err.clone()));
        }
    }

    fn teardown(&self, active: Option<ActiveDiscovery<D::Handle>>) {
        let Some(ActiveDiscovery { lease, backlog }) = active else {
            return;
        };

        let registry = &self.registry;
        if let Err(e) = registry
            .driver
            .stop(lease.handle(), &self.session.key.service_type)
        {
            debug!(session = %self.session.key, error = %e, "Ignoring driver stop error");
        }
        backlog.stop();
        registry.guard.release(lease);

        registry.metrics.record_session_stopped();
        info!(session = %self.session.key, "Discovery stopped");
    }
}
