//! Engine session lifecycle management
//!
//! A [`SessionManager`] owns at most one live engine handle per key. The
//! handle is launched lazily on the first render, shared by every request
//! for that key (each in its own isolated context), and released once the
//! session has been idle for the configured budget.
//!
//! Idle time is counted by a single pending tick per session. Ticks are not
//! rescheduled by renders: a render only arms a tick when none is pending,
//! and each tick either re-arms itself or evicts the engine. All state for a
//! key, handle and timer alike, sits behind one mutex so a render can never
//! observe a handle that is being torn down.

use crate::{
    Capture, Config, DocumentSettings, EngineHandle, Metrics, RenderContext, RenderEngine,
    RenderError, RenderOutput, RenderPage, RenderRequest, Renderer, SessionSettings,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Settings and counters shared between the manager and its timer tasks.
struct Lifecycle {
    tick_interval: Duration,
    idle_budget: Duration,
    launches: AtomicUsize,
    evictions: AtomicUsize,
    metrics: Arc<Metrics>,
}

struct Session {
    key: String,
    state: Mutex<SessionState>,
    lifecycle: Arc<Lifecycle>,
}

#[derive(Default)]
struct SessionState {
    handle: Option<Arc<dyn EngineHandle>>,
    /// Accumulated idle time, reset on every render.
    idle: Duration,
    in_flight: usize,
    pending_tick: Option<PendingTick>,
}

struct PendingTick {
    fires_at: Instant,
    task: JoinHandle<()>,
}

impl Session {
    fn new(key: &str, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            key: key.to_string(),
            state: Mutex::new(SessionState::default()),
            lifecycle,
        }
    }

    /// Returns a usable handle, launching one if the session has none or the
    /// current one has disconnected. Marks a render as in flight.
    async fn acquire(
        &self,
        engine: &dyn RenderEngine,
    ) -> Result<Arc<dyn EngineHandle>, RenderError> {
        let mut state = self.state.lock().await;

        let disconnected = state
            .handle
            .as_ref()
            .is_some_and(|handle| !handle.is_connected());

        if disconnected {
            warn!("Engine for session '{}' disconnected, relaunching", self.key);
            if let Some(stale) = state.handle.take() {
                self.close_handle(stale, "disconnected").await;
            }
        }

        let handle = match state.handle.clone() {
            Some(handle) => handle,
            None => match engine.launch().await {
                Ok(handle) => {
                    self.lifecycle.launches.fetch_add(1, Ordering::Relaxed);
                    self.lifecycle.metrics.record_launch(true);
                    info!("Launched engine for session '{}'", self.key);
                    state.handle = Some(handle.clone());
                    handle
                }
                Err(e) => {
                    self.lifecycle.metrics.record_launch(false);
                    error!("Failed to launch engine for session '{}': {}", self.key, e);
                    return Err(e);
                }
            },
        };

        state.idle = Duration::ZERO;
        state.in_flight += 1;

        Ok(handle)
    }

    /// Ends an in-flight render and makes sure an idle tick is pending.
    async fn release(self: &Arc<Self>) {
        let mut state = self.state.lock().await;

        state.in_flight = state.in_flight.saturating_sub(1);
        state.idle = Duration::ZERO;

        if state.handle.is_some() && state.pending_tick.is_none() {
            self.schedule_tick(&mut state);
        }
    }

    fn schedule_tick(self: &Arc<Self>, state: &mut SessionState) {
        let fires_at = Instant::now() + self.lifecycle.tick_interval;
        let session = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            sleep_until(fires_at).await;
            if let Some(session) = Weak::upgrade(&session) {
                session.on_idle_tick().await;
            }
        });

        state.pending_tick = Some(PendingTick { fires_at, task });
    }

    /// Accounts one tick of idle time and either re-arms or evicts.
    ///
    /// Safe to run more than once per scheduled tick: the decision is
    /// recomputed from the accumulated idle time and the current handle.
    async fn on_idle_tick(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        state.pending_tick = None;

        if state.handle.is_none() {
            return;
        }

        if state.in_flight > 0 {
            state.idle = Duration::ZERO;
            self.schedule_tick(&mut state);
            return;
        }

        state.idle += self.lifecycle.tick_interval;

        if state.idle < self.lifecycle.idle_budget {
            debug!(
                "Session '{}' idle for {:?}, keeping engine alive",
                self.key, state.idle
            );
            self.schedule_tick(&mut state);
            return;
        }

        state.idle = Duration::ZERO;
        if let Some(handle) = state.handle.take() {
            self.close_handle(handle, "idle budget exhausted").await;
        }
    }

    /// Best-effort shutdown. The session counts as evicted even if close fails.
    async fn close_handle(&self, handle: Arc<dyn EngineHandle>, reason: &str) {
        self.lifecycle.evictions.fetch_add(1, Ordering::Relaxed);

        match handle.close().await {
            Ok(()) => {
                self.lifecycle.metrics.record_eviction(true);
                info!("Evicted engine for session '{}' ({})", self.key, reason);
            }
            Err(e) => {
                self.lifecycle.metrics.record_eviction(false);
                warn!(
                    "Engine shutdown for session '{}' failed ({}): {}",
                    self.key, reason, e
                );
            }
        }
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;

        if let Some(pending) = state.pending_tick.take() {
            pending.task.abort();
        }

        if let Some(handle) = state.handle.take() {
            self.close_handle(handle, "shutdown").await;
        }
    }
}

/// Holds a session's in-flight slot for the duration of one render.
///
/// Released explicitly once the render task has cleaned up. If that task
/// panics instead, the slot is released from a spawned task.
struct RenderLease {
    session: Option<Arc<Session>>,
}

impl RenderLease {
    async fn release(mut self) {
        if let Some(session) = self.session.take() {
            session.release().await;
        }
    }
}

impl Drop for RenderLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            tokio::spawn(async move {
                session.release().await;
            });
        }
    }
}

/// Observed state of one session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub key: String,
    pub connected: bool,
    pub idle: Duration,
    pub in_flight: usize,
    pub scheduled_tick: Option<Instant>,
}

impl SessionInfo {
    pub fn is_live(&self) -> bool {
        self.connected
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub live_sessions: usize,
    pub pending_ticks: usize,
    pub in_flight: usize,
    pub total_launches: usize,
    pub total_evictions: usize,
}

/// Everything a render needs besides the engine handle and the request.
struct RenderSettings {
    timeout: Duration,
    forwarded_headers: HashMap<String, String>,
    document: DocumentSettings,
}

impl RenderSettings {
    /// Runs one render in its own context.
    ///
    /// Context creation, page creation and page work share one deadline.
    /// Page and context are closed on every exit path, each bounded by a
    /// fresh timeout so a render that ran out of time still cleans up.
    async fn render(
        &self,
        handle: &dyn EngineHandle,
        request: &RenderRequest,
    ) -> Result<RenderOutput, RenderError> {
        let deadline = Instant::now() + self.timeout;

        let context = self.bounded(deadline, handle.new_context()).await?;
        let result = self
            .render_in_context(context.as_ref(), request, deadline)
            .await;

        if let Err(e) = self.bounded(Instant::now() + self.timeout, context.close()).await {
            warn!("Failed to close render context: {}", e);
        }

        result
    }

    async fn render_in_context(
        &self,
        context: &dyn RenderContext,
        request: &RenderRequest,
        deadline: Instant,
    ) -> Result<RenderOutput, RenderError> {
        let page = self.bounded(deadline, context.new_page()).await?;
        let result = self
            .bounded(deadline, self.drive_page(page.as_ref(), request))
            .await;

        if let Err(e) = self.bounded(Instant::now() + self.timeout, page.close()).await {
            warn!("Failed to close page: {}", e);
        }

        result
    }

    async fn bounded<T>(
        &self,
        deadline: Instant,
        step: impl Future<Output = Result<T, RenderError>>,
    ) -> Result<T, RenderError> {
        match timeout_at(deadline, step).await {
            Ok(result) => result,
            Err(_) => Err(RenderError::Timeout(self.timeout)),
        }
    }

    async fn drive_page(
        &self,
        page: &dyn RenderPage,
        request: &RenderRequest,
    ) -> Result<RenderOutput, RenderError> {
        if !self.forwarded_headers.is_empty() {
            page.set_extra_headers(&self.forwarded_headers).await?;
        }

        page.set_viewport(request.width, request.height, request.scale)
            .await?;
        page.goto(&request.target_url).await?;

        let data = page.capture(&self.capture_for(request)).await?;

        Ok(RenderOutput {
            data,
            content_type: request.content_type().to_string(),
        })
    }

    fn capture_for(&self, request: &RenderRequest) -> Capture {
        if request.output_format.is_document() {
            Capture::Document {
                paper_width: self.document.paper_width,
                paper_height: self.document.paper_height,
                margin: self.document.margin,
                print_background: self.document.print_background,
            }
        } else {
            Capture::Clip {
                width: request.width,
                height: request.height,
            }
        }
    }
}

pub struct SessionManager {
    engine: Arc<dyn RenderEngine>,
    sessions: DashMap<String, Arc<Session>>,
    lifecycle: Arc<Lifecycle>,
    render: Arc<RenderSettings>,
    is_shutting_down: AtomicBool,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn RenderEngine>, config: &Config, metrics: Arc<Metrics>) -> Self {
        let forwarded_headers = config
            .forwarded_auth
            .iter()
            .map(|auth| (auth.header.clone(), auth.value.clone()))
            .collect();

        Self::with_settings(
            engine,
            &config.session,
            forwarded_headers,
            config.document.clone(),
            metrics,
        )
    }

    pub fn with_settings(
        engine: Arc<dyn RenderEngine>,
        settings: &SessionSettings,
        forwarded_headers: HashMap<String, String>,
        document: DocumentSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            engine,
            sessions: DashMap::new(),
            lifecycle: Arc::new(Lifecycle {
                tick_interval: settings.tick_interval,
                idle_budget: settings.idle_budget,
                launches: AtomicUsize::new(0),
                evictions: AtomicUsize::new(0),
                metrics,
            }),
            render: Arc::new(RenderSettings {
                timeout: settings.render_timeout,
                forwarded_headers,
                document,
            }),
            is_shutting_down: AtomicBool::new(false),
        }
    }

    /// Renders `request` with the engine owned by `key`, starting it if needed.
    ///
    /// Once an engine is acquired the render runs as its own task. Dropping
    /// the returned future detaches it but does not stop it, so the page,
    /// the context and the in-flight slot are always released.
    ///
    /// Failures are returned to the caller as-is; nothing is retried here.
    pub async fn acquire_and_render(
        &self,
        key: &str,
        request: &RenderRequest,
    ) -> Result<RenderOutput, RenderError> {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return Err(RenderError::EngineUnavailable(
                "session manager is shutting down".to_string(),
            ));
        }

        let session = self.session(key);
        let handle = session.acquire(self.engine.as_ref()).await?;
        let lease = RenderLease {
            session: Some(session),
        };

        let settings = self.render.clone();
        let metrics = self.lifecycle.metrics.clone();
        let request = request.clone();
        let key = key.to_string();

        let job = tokio::spawn(async move {
            let started = std::time::Instant::now();
            let result = settings.render(handle.as_ref(), &request).await;
            lease.release().await;

            metrics.record_render(started.elapsed(), result.is_ok());

            match &result {
                Ok(output) => debug!(
                    "Rendered {} for session '{}' ({} bytes in {:?})",
                    request.target_url,
                    key,
                    output.data.len(),
                    started.elapsed()
                ),
                Err(e) => warn!(
                    "Render of {} for session '{}' failed: {}",
                    request.target_url, key, e
                ),
            }

            result
        });

        match job.await {
            Ok(result) => result,
            Err(e) => {
                error!("Render task failed: {}", e);
                Err(RenderError::Aborted(e.to_string()))
            }
        }
    }

    fn session(&self, key: &str) -> Arc<Session> {
        if let Some(session) = self.sessions.get(key) {
            return session.value().clone();
        }

        self.sessions
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Session::new(key, self.lifecycle.clone())))
            .value()
            .clone()
    }

    /// When the pending idle tick for `key` fires, if one is scheduled.
    pub async fn scheduled_tick(&self, key: &str) -> Option<Instant> {
        self.session_info(key).await?.scheduled_tick
    }

    pub async fn session_info(&self, key: &str) -> Option<SessionInfo> {
        let session = self.sessions.get(key).map(|s| s.value().clone())?;
        let state = session.state.lock().await;

        Some(SessionInfo {
            key: session.key.clone(),
            connected: state.handle.as_ref().is_some_and(|h| h.is_connected()),
            idle: state.idle,
            in_flight: state.in_flight,
            scheduled_tick: state.pending_tick.as_ref().map(|p| p.fires_at),
        })
    }

    pub async fn stats(&self) -> SessionStats {
        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|s| s.value().clone()).collect();

        let mut stats = SessionStats {
            total_launches: self.lifecycle.launches.load(Ordering::Relaxed),
            total_evictions: self.lifecycle.evictions.load(Ordering::Relaxed),
            ..Default::default()
        };

        for session in sessions {
            let state = session.state.lock().await;
            if state.handle.is_some() {
                stats.live_sessions += 1;
            }
            if state.pending_tick.is_some() {
                stats.pending_ticks += 1;
            }
            stats.in_flight += state.in_flight;
        }

        stats
    }

    /// Cancels pending ticks and closes every engine handle.
    pub async fn shutdown(&self) {
        info!("Shutting down session manager...");
        self.is_shutting_down.store(true, Ordering::Relaxed);

        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|s| s.value().clone()).collect();

        for session in sessions {
            session.shutdown().await;
        }

        info!("Session manager shutdown complete");
    }
}

#[async_trait]
impl Renderer for SessionManager {
    async fn render(
        &self,
        key: &str,
        request: &RenderRequest,
    ) -> Result<RenderOutput, RenderError> {
        self.acquire_and_render(key, request).await
    }
}
