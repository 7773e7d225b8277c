//! Device Client
//!
//! Owns one device session: the link lifecycle and reconnect loop, the status
//! subscription feeding the reconciler, and the public API. Protocol exchanges
//! live in `commands`, motion sequencing and navigation in `control`.

use crate::domain::models::{
    DeviceEvent, DeviceState, EventKind, Field, LinkState, Page, PatternDescriptor,
};
use crate::domain::reconcile::{ReconcileOutcome, StatusReconciler};
use crate::domain::settings::ClientSettings;
use crate::error::{ClientError, Result};
use crate::infrastructure::bluetooth::connection::{
    BleConnection, ConnectionConfig, DeviceCharacteristics,
};
use crate::infrastructure::bluetooth::commands::exchange;
use crate::infrastructure::bluetooth::protocol::{self, Command};
use crate::infrastructure::bluetooth::queue::{CancelSignal, SerialTaskQueue};
use crate::infrastructure::bluetooth::transport::{NotifyHandler, Transport};
use crate::infrastructure::events::{EventHub, ListenerId};
use crate::infrastructure::lock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

pub(crate) struct ClientInner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) settings: ClientSettings,
    pub(crate) queue: SerialTaskQueue,
    pub(crate) events: EventHub,
    pub(crate) reconciler: Mutex<StatusReconciler>,
    pub(crate) characteristics: Mutex<Option<DeviceCharacteristics>>,
    pub(crate) patterns: Mutex<Option<Vec<PatternDescriptor>>>,
    /// Depth last commanded by the absolute position controller
    pub(crate) last_position: Mutex<Option<u32>>,
    link: Mutex<LinkState>,
    /// Bumped on every link loss, under the `link` lock
    link_epoch: AtomicU64,
    auto_reconnect: AtomicBool,
    reconnecting: AtomicBool,
    runtime: Handle,
}

/// Releases pending targets when the command that registered them ends
pub(crate) struct PendingGuard<'a> {
    reconciler: &'a Mutex<StatusReconciler>,
    fields: Vec<Field>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut reconciler = lock(self.reconciler);
        for field in &self.fields {
            reconciler.clear_target(*field);
        }
    }
}

impl ClientInner {
    pub(crate) fn link_state(&self) -> LinkState {
        *lock(&self.link)
    }

    fn set_link_state(&self, state: LinkState) -> LinkState {
        std::mem::replace(&mut *lock(&self.link), state)
    }

    /// Enter `Connecting` and return the epoch the attempt belongs to
    fn start_connecting(&self) -> u64 {
        let mut link = lock(&self.link);
        *link = LinkState::Connecting;
        self.link_epoch.load(Ordering::SeqCst)
    }

    /// Mark the link gone; any connect attempt in flight can no longer
    /// become ready
    fn mark_lost(&self) -> LinkState {
        let mut link = lock(&self.link);
        self.link_epoch.fetch_add(1, Ordering::SeqCst);
        *lock(&self.characteristics) = None;
        std::mem::replace(&mut *link, LinkState::Disconnected)
    }

    /// Enter `Ready` unless the link was lost since `epoch`
    fn mark_ready(&self, epoch: u64) -> Result<()> {
        let mut link = lock(&self.link);
        if self.link_epoch.load(Ordering::SeqCst) != epoch {
            return Err(ClientError::Transport(
                "link lost while connecting".to_string(),
            ));
        }
        *link = LinkState::Ready;
        Ok(())
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.link_state() == LinkState::Ready
    }

    /// Characteristics of the live link, or `NotReady`
    pub(crate) fn characteristics(&self) -> Result<DeviceCharacteristics> {
        if !self.is_ready() {
            return Err(ClientError::NotReady);
        }
        lock(&self.characteristics).ok_or(ClientError::NotReady)
    }

    pub(crate) fn ensure_ready(&self) -> Result<()> {
        self.characteristics().map(|_| ())
    }

    pub(crate) fn cached_state(&self) -> Option<DeviceState> {
        lock(&self.reconciler).cached().cloned()
    }

    pub(crate) fn cached_value(&self, field: Field) -> Option<u32> {
        lock(&self.reconciler).cached().map(|s| s.get(field))
    }

    pub(crate) fn current_page(&self) -> Option<Page> {
        lock(&self.reconciler).cached().and_then(DeviceState::page)
    }

    fn last_push(&self) -> Option<Instant> {
        lock(&self.reconciler).last_push()
    }

    pub(crate) fn register_targets(&self, targets: &[(Field, u32)]) -> PendingGuard<'_> {
        let mut reconciler = lock(&self.reconciler);
        for (field, value) in targets {
            reconciler.register_target(*field, *value);
        }
        PendingGuard {
            reconciler: &self.reconciler,
            fields: targets.iter().map(|(f, _)| *f).collect(),
        }
    }

    fn handle_status_push(&self, bytes: &[u8]) {
        let state = match protocol::parse_status(bytes) {
            Ok(state) => state,
            Err(e) => {
                warn!("Ignoring malformed status push: {}", e);
                return;
            }
        };

        let outcome = lock(&self.reconciler).reconcile(state, Instant::now());
        match outcome {
            ReconcileOutcome::Published(state) => {
                debug!("State changed: {:?}", state);
                self.events.fire(DeviceEvent::StateChanged(state));
            }
            ReconcileOutcome::Transitional(field) => {
                trace!("Waiting for {} to settle", field);
            }
            ReconcileOutcome::Withheld => trace!("Status withheld, targets pending"),
            ReconcileOutcome::Unchanged => {}
        }
    }

    /// Open the link as one queued unit. Reports `Ready` only if the link
    /// survived the whole attempt.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }

        self.queue.clear_queue("connecting");
        let epoch = self.start_connecting();
        let unobserved_since = self.last_push();

        let inner = self.clone();
        let result = self
            .queue
            .enqueue_with_timeout(
                move |signal| async move {
                    let connection = BleConnection::new(
                        inner.transport.clone(),
                        ConnectionConfig::from(&inner.settings),
                    );
                    let weak = Arc::downgrade(&inner);
                    let on_status: NotifyHandler = Arc::new(move |bytes: Vec<u8>| {
                        if let Some(inner) = weak.upgrade() {
                            inner.handle_status_push(&bytes);
                        }
                    });
                    let characteristics = connection.open(&signal, on_status).await?;
                    inner
                        .stop_if_unobserved(&signal, &characteristics, unobserved_since)
                        .await?;
                    *lock(&inner.characteristics) = Some(characteristics);
                    Ok(())
                },
                self.settings.connect_timeout(),
            )
            .await
            .and_then(|()| self.mark_ready(epoch));

        match result {
            Ok(()) => {
                info!("Device ready");
                self.events.fire(DeviceEvent::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_link_state(LinkState::Disconnected);
                *lock(&self.characteristics) = None;
                Err(e)
            }
        }
    }

    /// Motion must not continue unsupervised: if status went quiet for longer
    /// than the safety window, stop before the link is reported ready.
    async fn stop_if_unobserved(
        &self,
        signal: &CancelSignal,
        characteristics: &DeviceCharacteristics,
        unobserved_since: Option<Instant>,
    ) -> Result<()> {
        let Some(last) = unobserved_since else {
            return Ok(());
        };
        let gap = last.elapsed();
        if gap <= self.settings.safety_stop_after() {
            return Ok(());
        }
        warn!(
            "No status for {} ms, issuing emergency stop",
            gap.as_millis()
        );
        let _guard = self.register_targets(&[(Field::Speed, 0)]);
        exchange(
            self.transport.as_ref(),
            &characteristics.command,
            &Command::STOP.text(),
            false,
            self.settings.command_settle(),
            signal,
        )
        .await
    }

    fn handle_link_loss(self: &Arc<Self>) {
        let previous = self.mark_lost();
        warn!("Link to device lost (was {:?})", previous);

        if previous == LinkState::Ready {
            self.events.fire(DeviceEvent::Disconnected);
        }
        if self.auto_reconnect.load(Ordering::SeqCst) {
            self.spawn_reconnect_loop();
        }
    }

    /// Retry `connect` with a fixed backoff while auto-reconnect is on and
    /// the link is not ready. At most one loop runs at a time.
    fn spawn_reconnect_loop(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);

        self.runtime.spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let wanted = inner.auto_reconnect.load(Ordering::SeqCst);
                if !wanted || inner.is_ready() {
                    inner.reconnecting.store(false, Ordering::SeqCst);
                    // A loss landing before the store saw the flag still set
                    // and left the work to this loop.
                    let still_needed =
                        inner.auto_reconnect.load(Ordering::SeqCst) && !inner.is_ready();
                    if !still_needed || inner.reconnecting.swap(true, Ordering::SeqCst) {
                        return;
                    }
                }

                attempt += 1;
                let backoff = match inner.connect().await {
                    Ok(()) => {
                        info!("Connected after {} attempt(s)", attempt);
                        attempt = 0;
                        continue;
                    }
                    Err(e) => {
                        debug!("Connect attempt {} failed: {}", attempt, e);
                        inner.settings.reconnect_backoff()
                    }
                };
                drop(inner);
                tokio::time::sleep(backoff).await;
            }
        });
    }

    /// Emergency stop: drop the backlog and send `set:speed:0` ahead of it
    pub(crate) async fn stop(&self) -> Result<()> {
        info!("Emergency stop");
        self.queue.clear_queue("emergency stop");
        let _guard = self.register_targets(&[(Field::Speed, 0)]);
        self.send_command(Command::STOP.text(), false).await
    }

    async fn end(&self) -> Result<()> {
        info!("Ending session");
        self.auto_reconnect.store(false, Ordering::SeqCst);
        self.queue.clear_queue("session ending");

        if self.is_ready() {
            if let Err(e) = self.stop().await {
                warn!("Stop before disconnect failed: {}", e);
            }
        }

        let previous = self.mark_lost();
        let result = self.transport.disconnect().await;
        if previous == LinkState::Ready {
            self.events.fire(DeviceEvent::Disconnected);
        }
        result
    }

    /// Poll `check` every poll interval until it yields a value
    pub(crate) async fn poll_until<T>(
        &self,
        timeout: Option<Duration>,
        what: &str,
        mut check: impl FnMut() -> Option<T>,
    ) -> Result<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(value) = check() {
                return Ok(value);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(ClientError::Timeout(format!("waiting for {}", what)));
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }
}

/// Client for one device session.
///
/// Must be created inside a tokio runtime; the task queue worker and the
/// reconnect loop run on it.
#[derive(Clone)]
pub struct DeviceClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl DeviceClient {
    pub fn new(transport: Arc<dyn Transport>, settings: ClientSettings) -> Self {
        let inner = Arc::new(ClientInner {
            transport,
            settings,
            queue: SerialTaskQueue::new(),
            events: EventHub::new(),
            reconciler: Mutex::new(StatusReconciler::new()),
            characteristics: Mutex::new(None),
            patterns: Mutex::new(None),
            last_position: Mutex::new(None),
            link: Mutex::new(LinkState::Disconnected),
            link_epoch: AtomicU64::new(0),
            auto_reconnect: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            runtime: Handle::current(),
        });

        let weak = Arc::downgrade(&inner);
        inner.transport.on_unsolicited_disconnect(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_link_loss();
            }
        }));

        Self { inner }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    /// Enable auto-reconnect and start connecting in the background
    pub fn begin(&self) {
        info!("Starting session");
        self.inner.auto_reconnect.store(true, Ordering::SeqCst);
        self.inner.spawn_reconnect_loop();
    }

    /// Connect once; no-op when already ready
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// Disable auto-reconnect, stop the device if possible and disconnect
    pub async fn end(&self) -> Result<()> {
        self.inner.end().await
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.link_state()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// `None` waits forever
    pub async fn wait_for_ready(&self, timeout: Option<Duration>) -> Result<()> {
        let inner = &self.inner;
        inner
            .poll_until(timeout, "device ready", || inner.is_ready().then_some(()))
            .await
    }

    /// Last published snapshot, without waiting
    pub fn state(&self) -> Option<DeviceState> {
        self.inner.cached_state()
    }

    /// Wait for the first status push if none arrived yet
    pub async fn get_state(&self, timeout: Option<Duration>) -> Result<DeviceState> {
        let inner = &self.inner;
        inner
            .poll_until(timeout, "device state", || inner.cached_state())
            .await
    }

    /// Wait until the status equals `status` or is one of its sub-states
    pub async fn wait_for_status(
        &self,
        status: &str,
        timeout: Option<Duration>,
    ) -> Result<DeviceState> {
        let inner = &self.inner;
        let prefix = format!("{}.", status);
        inner
            .poll_until(timeout, status, || {
                inner
                    .cached_state()
                    .filter(|s| s.status == status || s.status.starts_with(&prefix))
            })
            .await
    }

    pub fn current_page(&self) -> Option<Page> {
        self.inner.current_page()
    }

    /// Emergency stop, ahead of anything queued
    pub async fn stop(&self) -> Result<()> {
        self.inner.stop().await
    }

    pub fn add_event_listener(
        &self,
        kind: EventKind,
        listener: impl Fn(DeviceEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.events.add_listener(kind, Arc::new(listener))
    }

    pub fn remove_event_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        self.inner.events.remove_listener(kind, id)
    }
}
