#[cfg(test)]
mod integration_tests {
    use crate::{
        CacheAsideGateway, Capture, Config, EngineHandle, ForwardedAuth, MemoryCache, Metrics,
        OutputFormat, RenderContext, RenderEngine, RenderError, RenderPage, RenderRequest,
        RequestParser, SessionManager,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    const KEY: &str = "default";

    /// Counters and recordings shared by every object the fake engine hands out.
    #[derive(Default)]
    struct EngineCounters {
        launch_attempts: AtomicUsize,
        live_handles: AtomicUsize,
        max_live_handles: AtomicUsize,
        closed_handles: AtomicUsize,
        open_contexts: AtomicUsize,
        max_open_contexts: AtomicUsize,
        open_pages: AtomicUsize,
        navigations: Mutex<Vec<String>>,
        viewports: Mutex<Vec<(u32, u32, u8)>>,
        headers: Mutex<Vec<HashMap<String, String>>>,
        captures: Mutex<Vec<Capture>>,
        handles: Mutex<Vec<Arc<FakeHandle>>>,
    }

    impl EngineCounters {
        fn navigations(&self) -> Vec<String> {
            self.navigations.lock().unwrap().clone()
        }

        fn last_handle(&self) -> Arc<FakeHandle> {
            self.handles.lock().unwrap().last().cloned().unwrap()
        }
    }

    fn raise_max(max: &AtomicUsize, current: usize) {
        max.fetch_max(current, Ordering::SeqCst);
    }

    #[derive(Default)]
    struct FakeBehavior {
        failing_launches: AtomicUsize,
        fail_navigation: AtomicBool,
        fail_close: AtomicBool,
        context_delay: Mutex<Duration>,
        navigation_delay: Mutex<Duration>,
    }

    #[derive(Default)]
    struct FakeEngine {
        counters: Arc<EngineCounters>,
        behavior: Arc<FakeBehavior>,
    }

    #[async_trait]
    impl RenderEngine for FakeEngine {
        async fn launch(&self) -> Result<Arc<dyn EngineHandle>, RenderError> {
            self.counters.launch_attempts.fetch_add(1, Ordering::SeqCst);

            let failing = self.behavior.failing_launches.load(Ordering::SeqCst);
            if failing > 0 {
                self.behavior
                    .failing_launches
                    .store(failing - 1, Ordering::SeqCst);
                return Err(RenderError::EngineUnavailable("chrome not found".to_string()));
            }

            let live = self.counters.live_handles.fetch_add(1, Ordering::SeqCst) + 1;
            raise_max(&self.counters.max_live_handles, live);

            let handle = Arc::new(FakeHandle {
                counters: self.counters.clone(),
                behavior: self.behavior.clone(),
                connected: AtomicBool::new(true),
            });
            self.counters.handles.lock().unwrap().push(handle.clone());
            Ok(handle)
        }
    }

    struct FakeHandle {
        counters: Arc<EngineCounters>,
        behavior: Arc<FakeBehavior>,
        connected: AtomicBool,
    }

    impl FakeHandle {
        fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl EngineHandle for FakeHandle {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn new_context(&self) -> Result<Box<dyn RenderContext>, RenderError> {
            let delay = *self.behavior.context_delay.lock().unwrap();
            if !delay.is_zero() {
                sleep(delay).await;
            }

            let open = self.counters.open_contexts.fetch_add(1, Ordering::SeqCst) + 1;
            raise_max(&self.counters.max_open_contexts, open);

            Ok(Box::new(FakeContext {
                counters: self.counters.clone(),
                behavior: self.behavior.clone(),
            }))
        }

        async fn close(&self) -> Result<(), RenderError> {
            self.connected.store(false, Ordering::SeqCst);
            self.counters.live_handles.fetch_sub(1, Ordering::SeqCst);
            self.counters.closed_handles.fetch_add(1, Ordering::SeqCst);

            if self.behavior.fail_close.load(Ordering::SeqCst) {
                return Err(RenderError::EvictionFailure("browser hung".to_string()));
            }
            Ok(())
        }
    }

    struct FakeContext {
        counters: Arc<EngineCounters>,
        behavior: Arc<FakeBehavior>,
    }

    #[async_trait]
    impl RenderContext for FakeContext {
        async fn new_page(&self) -> Result<Box<dyn RenderPage>, RenderError> {
            self.counters.open_pages.fetch_add(1, Ordering::SeqCst);

            Ok(Box::new(FakePage {
                counters: self.counters.clone(),
                behavior: self.behavior.clone(),
            }))
        }

        async fn close(self: Box<Self>) -> Result<(), RenderError> {
            self.counters.open_contexts.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakePage {
        counters: Arc<EngineCounters>,
        behavior: Arc<FakeBehavior>,
    }

    #[async_trait]
    impl RenderPage for FakePage {
        async fn set_extra_headers(
            &self,
            headers: &HashMap<String, String>,
        ) -> Result<(), RenderError> {
            self.counters.headers.lock().unwrap().push(headers.clone());
            Ok(())
        }

        async fn set_viewport(
            &self,
            width: u32,
            height: u32,
            scale: u8,
        ) -> Result<(), RenderError> {
            self.counters
                .viewports
                .lock()
                .unwrap()
                .push((width, height, scale));
            Ok(())
        }

        async fn goto(&self, url: &str) -> Result<(), RenderError> {
            let delay = *self.behavior.navigation_delay.lock().unwrap();
            if !delay.is_zero() {
                sleep(delay).await;
            }

            if self.behavior.fail_navigation.load(Ordering::SeqCst) {
                return Err(RenderError::Navigation(format!("net::ERR_FAILED {url}")));
            }

            self.counters.navigations.lock().unwrap().push(url.to_string());
            Ok(())
        }

        async fn capture(&self, capture: &Capture) -> Result<Vec<u8>, RenderError> {
            self.counters.captures.lock().unwrap().push(capture.clone());
            Ok(capture.format().extension().as_bytes().to_vec())
        }

        async fn close(self: Box<Self>) -> Result<(), RenderError> {
            self.counters.open_pages.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager_with(engine: FakeEngine, config: &Config) -> (Arc<SessionManager>, Arc<EngineCounters>) {
        let counters = engine.counters.clone();
        let manager = Arc::new(SessionManager::new(
            Arc::new(engine),
            config,
            Arc::new(Metrics::new()),
        ));
        (manager, counters)
    }

    fn manager() -> (Arc<SessionManager>, Arc<EngineCounters>, Arc<FakeBehavior>) {
        let engine = FakeEngine::default();
        let behavior = engine.behavior.clone();
        let (manager, counters) = manager_with(engine, &Config::default());
        (manager, counters, behavior)
    }

    fn request(path: &str) -> RenderRequest {
        RequestParser::default()
            .parse(&format!("https://example.com/screenshot{path}"))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_render_launches_and_later_renders_reuse() {
        let (manager, counters, _) = manager();

        let output = manager.acquire_and_render(KEY, &request("/a")).await.unwrap();
        assert_eq!(output.data, b"png");
        assert_eq!(output.content_type, "image/png");

        manager.acquire_and_render(KEY, &request("/b")).await.unwrap();

        assert_eq!(counters.launch_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(
            counters.navigations(),
            vec!["https://example.com/a", "https://example.com/b"]
        );

        let stats = manager.stats().await;
        assert_eq!(stats.live_sessions, 1);
        assert_eq!(stats.total_launches, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_arms_single_tick_without_rescheduling() {
        let (manager, _, _) = manager();
        let start = Instant::now();

        manager.acquire_and_render(KEY, &request("/a")).await.unwrap();

        let info = manager.session_info(KEY).await.unwrap();
        assert_eq!(info.idle, Duration::ZERO);
        assert_eq!(info.scheduled_tick, Some(start + Duration::from_secs(10)));

        sleep(Duration::from_secs(3)).await;
        manager.acquire_and_render(KEY, &request("/b")).await.unwrap();

        assert_eq!(
            manager.scheduled_tick(KEY).await,
            Some(start + Duration::from_secs(10))
        );
        assert_eq!(manager.stats().await.pending_ticks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_ticks_extend_then_evict() {
        let (manager, counters, _) = manager();
        manager.acquire_and_render(KEY, &request("/a")).await.unwrap();

        sleep(Duration::from_secs(35)).await;
        let info = manager.session_info(KEY).await.unwrap();
        assert!(info.is_live());
        assert_eq!(info.idle, Duration::from_secs(30));

        sleep(Duration::from_secs(20)).await;
        let info = manager.session_info(KEY).await.unwrap();
        assert!(info.is_live());
        assert_eq!(info.idle, Duration::from_secs(50));
        assert!(info.scheduled_tick.is_some());

        sleep(Duration::from_secs(10)).await;
        let info = manager.session_info(KEY).await.unwrap();
        assert!(!info.is_live());
        assert!(info.scheduled_tick.is_none());
        assert_eq!(counters.closed_handles.load(Ordering::SeqCst), 1);
        assert_eq!(counters.live_handles.load(Ordering::SeqCst), 0);

        // Nothing is rescheduled after eviction
        sleep(Duration::from_secs(60)).await;
        let stats = manager.stats().await;
        assert_eq!(stats.pending_ticks, 0);
        assert_eq!(stats.total_evictions, 1);
        assert_eq!(counters.closed_handles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_session_is_recreated_lazily() {
        let (manager, counters, _) = manager();
        manager.acquire_and_render(KEY, &request("/a")).await.unwrap();

        sleep(Duration::from_secs(70)).await;
        assert_eq!(manager.stats().await.live_sessions, 0);

        manager.acquire_and_render(KEY, &request("/a")).await.unwrap();
        assert_eq!(counters.launch_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(manager.stats().await.live_sessions, 1);
        assert!(manager.scheduled_tick(KEY).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_resets_idle_time() {
        let (manager, counters, _) = manager();
        manager.acquire_and_render(KEY, &request("/a")).await.unwrap();

        sleep(Duration::from_secs(35)).await;
        assert_eq!(
            manager.session_info(KEY).await.unwrap().idle,
            Duration::from_secs(30)
        );

        manager.acquire_and_render(KEY, &request("/b")).await.unwrap();
        assert_eq!(manager.session_info(KEY).await.unwrap().idle, Duration::ZERO);

        // Ticks continue at 40s, 50s, ... and now need six more to exhaust the budget
        sleep(Duration::from_secs(50)).await;
        assert!(manager.session_info(KEY).await.unwrap().is_live());

        sleep(Duration::from_secs(10)).await;
        assert!(!manager.session_info(KEY).await.unwrap().is_live());
        assert_eq!(counters.launch_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_render_is_never_evicted() {
        let engine = FakeEngine::default();
        let behavior = engine.behavior.clone();
        let config = Config {
            session: crate::SessionSettings {
                render_timeout: Duration::from_secs(300),
                ..Default::default()
            },
            ..Default::default()
        };
        let (manager, counters) = manager_with(engine, &config);

        manager.acquire_and_render(KEY, &request("/warm")).await.unwrap();

        *behavior.navigation_delay.lock().unwrap() = Duration::from_secs(125);
        manager.acquire_and_render(KEY, &request("/slow")).await.unwrap();

        assert_eq!(counters.closed_handles.load(Ordering::SeqCst), 0);
        assert_eq!(counters.launch_attempts.load(Ordering::SeqCst), 1);

        let info = manager.session_info(KEY).await.unwrap();
        assert!(info.is_live());
        assert_eq!(info.idle, Duration::ZERO);
        assert_eq!(info.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_failure_leaves_no_session_and_next_call_retries() {
        let (manager, counters, behavior) = manager();
        behavior.failing_launches.store(1, Ordering::SeqCst);

        let err = manager
            .acquire_and_render(KEY, &request("/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::EngineUnavailable(_)));
        assert_eq!(err.status_code(), 503);

        let stats = manager.stats().await;
        assert_eq!(stats.live_sessions, 0);
        assert_eq!(stats.pending_ticks, 0);

        manager.acquire_and_render(KEY, &request("/a")).await.unwrap();
        assert_eq!(counters.launch_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(manager.stats().await.live_sessions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_failure_keeps_handle_and_cleans_up() {
        let (manager, counters, behavior) = manager();
        behavior.fail_navigation.store(true, Ordering::SeqCst);

        let err = manager
            .acquire_and_render(KEY, &request("/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Navigation(_)));
        assert_eq!(counters.open_pages.load(Ordering::SeqCst), 0);
        assert_eq!(counters.open_contexts.load(Ordering::SeqCst), 0);

        let info = manager.session_info(KEY).await.unwrap();
        assert!(info.is_live());
        assert!(info.scheduled_tick.is_some());

        behavior.fail_navigation.store(false, Ordering::SeqCst);
        manager.acquire_and_render(KEY, &request("/a")).await.unwrap();
        assert_eq!(counters.launch_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_navigation_times_out_and_cleans_up() {
        let (manager, counters, behavior) = manager();
        *behavior.navigation_delay.lock().unwrap() = Duration::from_secs(600);

        let err = manager
            .acquire_and_render(KEY, &request("/hung"))
            .await
            .unwrap_err();

        assert!(matches!(err, RenderError::Timeout(d) if d == Duration::from_secs(30)));
        assert_eq!(counters.open_pages.load(Ordering::SeqCst), 0);
        assert_eq!(counters.open_contexts.load(Ordering::SeqCst), 0);
        assert!(manager.session_info(KEY).await.unwrap().is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_handle_is_replaced() {
        let (manager, counters, _) = manager();
        manager.acquire_and_render(KEY, &request("/a")).await.unwrap();

        counters.last_handle().disconnect();
        manager.acquire_and_render(KEY, &request("/b")).await.unwrap();

        assert_eq!(counters.launch_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(counters.live_handles.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed_handles.load(Ordering::SeqCst), 1);
        assert!(manager.session_info(KEY).await.unwrap().is_live());

        let stats = manager.stats().await;
        assert_eq!(stats.total_launches, 2);
        assert_eq!(stats.total_evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_render_still_cleans_up() {
        let (manager, counters, behavior) = manager();
        *behavior.navigation_delay.lock().unwrap() = Duration::from_secs(5);

        let caller = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire_and_render(KEY, &request("/slow")).await })
        };

        sleep(Duration::from_secs(1)).await;
        assert_eq!(counters.open_contexts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.open_pages.load(Ordering::SeqCst), 1);

        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        // The detached render finishes on its own and releases everything
        sleep(Duration::from_secs(10)).await;
        assert_eq!(counters.open_pages.load(Ordering::SeqCst), 0);
        assert_eq!(counters.open_contexts.load(Ordering::SeqCst), 0);
        assert_eq!(counters.navigations(), vec!["https://example.com/slow"]);

        let info = manager.session_info(KEY).await.unwrap();
        assert_eq!(info.in_flight, 0);
        assert!(info.scheduled_tick.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_context_creation_times_out() {
        let (manager, counters, behavior) = manager();
        *behavior.context_delay.lock().unwrap() = Duration::from_secs(600);
        let start = Instant::now();

        let err = manager
            .acquire_and_render(KEY, &request("/a"))
            .await
            .unwrap_err();

        assert!(matches!(err, RenderError::Timeout(d) if d == Duration::from_secs(30)));
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(31));
        assert_eq!(counters.open_contexts.load(Ordering::SeqCst), 0);
        assert!(counters.navigations().is_empty());

        let info = manager.session_info(KEY).await.unwrap();
        assert!(info.is_live());
        assert_eq!(info.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_engine() {
        let (manager, counters, behavior) = manager();
        *behavior.navigation_delay.lock().unwrap() = Duration::from_millis(200);

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .acquire_and_render(KEY, &request(&format!("/page/{i}")))
                        .await
                })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }

        assert_eq!(counters.launch_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.max_live_handles.load(Ordering::SeqCst), 1);
        // Each request gets its own context and they overlap on the shared engine
        assert!(counters.max_open_contexts.load(Ordering::SeqCst) > 1);
        assert_eq!(counters.open_contexts.load(Ordering::SeqCst), 0);
        assert_eq!(counters.navigations().len(), 16);
        assert_eq!(manager.stats().await.pending_ticks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_own_separate_engines() {
        let (manager, counters, _) = manager();

        manager.acquire_and_render("tenant-a", &request("/a")).await.unwrap();
        manager.acquire_and_render("tenant-b", &request("/b")).await.unwrap();
        manager.acquire_and_render("tenant-a", &request("/c")).await.unwrap();

        assert_eq!(counters.launch_attempts.load(Ordering::SeqCst), 2);
        let stats = manager.stats().await;
        assert_eq!(stats.live_sessions, 2);
        assert_eq!(stats.pending_ticks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_options_follow_request() {
        let engine = FakeEngine::default();
        let config = Config {
            forwarded_auth: Some(ForwardedAuth {
                header: "Authorization".to_string(),
                value: "Bearer secret".to_string(),
            }),
            ..Default::default()
        };
        let (manager, counters) = manager_with(engine, &config);

        manager
            .acquire_and_render(KEY, &request("/600x400/doc@2x.pdf"))
            .await
            .unwrap();
        let output = manager
            .acquire_and_render(KEY, &request("/320x240/img@3x.png"))
            .await
            .unwrap();
        assert_eq!(output.content_type, "image/png");

        let captures = counters.captures.lock().unwrap().clone();
        assert!(matches!(captures[0], Capture::Document { margin, .. } if margin == 0.4));
        assert_eq!(
            captures[1],
            Capture::Clip {
                width: 320,
                height: 240
            }
        );
        assert_eq!(
            counters.viewports.lock().unwrap().clone(),
            vec![(600, 400, 2), (320, 240, 3)]
        );

        let headers = counters.headers.lock().unwrap().clone();
        assert_eq!(headers.len(), 2);
        assert_eq!(
            headers[0].get("Authorization").map(String::as_str),
            Some("Bearer secret")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_headers_sent_without_forwarded_auth() {
        let (manager, counters, _) = manager();
        manager.acquire_and_render(KEY, &request("/a")).await.unwrap();
        assert!(counters.headers.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_failure_still_evicts() {
        let (manager, counters, behavior) = manager();
        behavior.fail_close.store(true, Ordering::SeqCst);

        manager.acquire_and_render(KEY, &request("/a")).await.unwrap();
        sleep(Duration::from_secs(65)).await;

        let stats = manager.stats().await;
        assert_eq!(stats.live_sessions, 0);
        assert_eq!(stats.total_evictions, 1);
        assert_eq!(counters.closed_handles.load(Ordering::SeqCst), 1);

        manager.acquire_and_render(KEY, &request("/a")).await.unwrap();
        assert_eq!(counters.launch_attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_engines_and_cancels_ticks() {
        let (manager, counters, _) = manager();
        manager.acquire_and_render("a", &request("/a")).await.unwrap();
        manager.acquire_and_render("b", &request("/b")).await.unwrap();

        manager.shutdown().await;

        let stats = manager.stats().await;
        assert_eq!(stats.live_sessions, 0);
        assert_eq!(stats.pending_ticks, 0);
        assert_eq!(counters.live_handles.load(Ordering::SeqCst), 0);

        let err = manager
            .acquire_and_render("a", &request("/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::EngineUnavailable(_)));

        sleep(Duration::from_secs(120)).await;
        assert_eq!(counters.closed_handles.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_end_to_end() {
        let (manager, counters, _) = manager();
        let cache = Arc::new(MemoryCache::new());
        let gateway = CacheAsideGateway::new(
            RequestParser::default(),
            manager.clone(),
            cache.clone(),
            KEY,
            Arc::new(Metrics::new()),
        );

        let url = "https://example.com/screenshot/600x400/foo/bar@2x.pdf?x=1";
        let first = gateway.handle(url).await;
        assert_eq!(first.status, 200);
        assert_eq!(first.body, b"pdf");
        assert_eq!(first.header("Content-Type"), Some(OutputFormat::Pdf.content_type()));

        while cache.is_empty() {
            tokio::task::yield_now().await;
        }

        let second = gateway.handle(url).await;
        assert_eq!(second, first);
        assert_eq!(counters.navigations(), vec!["https://example.com/foo/bar?x=1"]);

        gateway.handle("https://example.com/screenshots/other").await;
        assert_eq!(counters.navigations().len(), 2);
        assert_eq!(counters.launch_attempts.load(Ordering::SeqCst), 1);

        let rejected = gateway.handle("https://example.com/notscreenshot/bar").await;
        assert_eq!(rejected.status, 400);
        assert_eq!(counters.navigations().len(), 2);
    }
}
