//! Bounded-concurrency dispatcher executing adapter calls.
//!
//! The dispatcher owns four worker pools with distinct purposes — request
//! execution, retry execution, health probes, and background monitoring — so a
//! burst of retries cannot starve fresh requests. Synchronous calls resolve a
//! [`DispatchFuture`]; streaming calls hand back a channel owned by a dedicated
//! engine task. Pool saturation surfaces as a `resource-exhausted` record
//! instead of blocking, and retries follow [`RetryPolicy`] — adapters never
//! retry on their own.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, warn};

use crate::adapter::ProviderAdapter;
use crate::config::ProviderConfig;
use crate::engine::{DELTA_CHANNEL_CAPACITY, DeltaStream, StreamEngine, collect_stream_text};
use crate::error::{ErrorKind, ErrorRecord};
use crate::http::DynHttpTransport;
use crate::retry::RetryPolicy;
use crate::types::{
    CompletionRequest, EmbeddingsRequest, EmbeddingsResponse, Response, StreamItem,
};

mod pool;

use pool::WorkerPool;

/// Pool sizes, retry policy, and timing knobs for a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub request_workers: usize,
    pub retry_workers: usize,
    /// Slots in each pool's job queue.
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    /// Per-attempt timeout raced against the transport call.
    pub call_timeout: Option<Duration>,
    /// Total budget across attempts; exceeding it surfaces the last error.
    pub overall_deadline: Option<Duration>,
    pub health_interval: Duration,
    pub monitor_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_workers: 8,
            retry_workers: 2,
            queue_capacity: 64,
            retry: RetryPolicy::default(),
            call_timeout: Some(Duration::from_secs(120)),
            overall_deadline: Some(Duration::from_secs(300)),
            health_interval: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Liveness snapshot for one watched provider endpoint.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// 取消信号 notify_one 的许可语义保证设置后再等待也能观察到
#[derive(Default)]
struct CancelToken {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }
}

/// Completion handle for a synchronous dispatch.
///
/// Resolves to the canonical response or a classified error record. Dropping or
/// aborting the future cancels the in-flight transport call.
pub struct DispatchFuture<T = Response> {
    receiver: oneshot::Receiver<Result<T, ErrorRecord>>,
    cancel: Arc<CancelToken>,
    finished: bool,
}

impl<T> DispatchFuture<T> {
    fn pending(receiver: oneshot::Receiver<Result<T, ErrorRecord>>, cancel: Arc<CancelToken>) -> Self {
        Self {
            receiver,
            cancel,
            finished: false,
        }
    }

    fn resolved(result: Result<T, ErrorRecord>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self {
            receiver,
            cancel: Arc::new(CancelToken::default()),
            finished: false,
        }
    }

    /// Cancels the call; the in-flight transport request is aborted.
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

impl<T> Future for DispatchFuture<T> {
    type Output = Result<T, ErrorRecord>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.finished = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                this.finished = true;
                Poll::Ready(Err(ErrorRecord::new(
                    ErrorKind::InternalError,
                    "tsumugi",
                    "dispatcher dropped the call before completion",
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for DispatchFuture<T> {
    fn drop(&mut self) {
        // 未完成即被丢弃视为取消
        if !self.finished {
            self.cancel.cancel();
        }
    }
}

/// 一次可重试调用的请求/解析差异 chat 与 embeddings 共用执行管线
trait CallSpec: Clone + Send + Sync + 'static {
    type Output: Send + 'static;

    fn parts(
        &self,
        adapter: &'static dyn ProviderAdapter,
        config: &ProviderConfig,
    ) -> Result<crate::http::HttpRequest, ErrorRecord>;

    fn parse(
        adapter: &'static dyn ProviderAdapter,
        body: &str,
    ) -> Result<Self::Output, ErrorRecord>;
}

#[derive(Clone)]
struct ChatCall(CompletionRequest);

impl CallSpec for ChatCall {
    type Output = Response;

    fn parts(
        &self,
        adapter: &'static dyn ProviderAdapter,
        config: &ProviderConfig,
    ) -> Result<crate::http::HttpRequest, ErrorRecord> {
        adapter.request_parts(&self.0, config, false)
    }

    fn parse(
        adapter: &'static dyn ProviderAdapter,
        body: &str,
    ) -> Result<Self::Output, ErrorRecord> {
        adapter.transform_response(body)
    }
}

#[derive(Clone)]
struct EmbeddingsCall(EmbeddingsRequest);

impl CallSpec for EmbeddingsCall {
    type Output = EmbeddingsResponse;

    fn parts(
        &self,
        adapter: &'static dyn ProviderAdapter,
        config: &ProviderConfig,
    ) -> Result<crate::http::HttpRequest, ErrorRecord> {
        adapter.embeddings_parts(&self.0, config)
    }

    fn parse(
        adapter: &'static dyn ProviderAdapter,
        body: &str,
    ) -> Result<Self::Output, ErrorRecord> {
        adapter.transform_embeddings_response(body)
    }
}

struct DispatcherInner {
    transport: DynHttpTransport,
    config: DispatcherConfig,
    request_pool: WorkerPool,
    retry_pool: WorkerPool,
    health_pool: WorkerPool,
    monitor_pool: WorkerPool,
    watched: StdMutex<Vec<ProviderConfig>>,
    health: RwLock<HashMap<&'static str, ProviderHealth>>,
    shutting_down: AtomicBool,
    shutdown_notify: Notify,
}

/// Executes adapter calls on bounded worker pools.
///
/// One dispatcher instance is constructed once and shared by reference across
/// all concurrent calls; provider configuration flows in per call and is only
/// ever read.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use tsumugi::adapter::ProviderKind;
/// # use tsumugi::config::{Credential, ProviderConfig};
/// # use tsumugi::dispatcher::{Dispatcher, DispatcherConfig};
/// # use tsumugi::http::reqwest::default_dyn_transport;
/// # use tsumugi::types::{CompletionRequest, Message};
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let dispatcher = Dispatcher::new(default_dyn_transport()?, DispatcherConfig::default());
/// let config = ProviderConfig::new(
///     ProviderKind::OpenAi,
///     Credential::ApiKey { key: "sk-...".into() },
/// )
/// .with_model("gpt-4o-mini");
///
/// let request = CompletionRequest {
///     messages: vec![Message::user("hello")],
///     ..CompletionRequest::default()
/// };
/// let response = dispatcher.dispatch(request, config).await?;
/// println!("{:?}", response.content());
/// # Ok(())
/// # }
/// ```
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Creates a dispatcher and spawns its worker pools.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(transport: DynHttpTransport, config: DispatcherConfig) -> Self {
        let inner = Arc::new(DispatcherInner {
            request_pool: WorkerPool::new(
                "request",
                config.request_workers,
                config.queue_capacity,
            ),
            retry_pool: WorkerPool::new("retry", config.retry_workers, config.queue_capacity),
            health_pool: WorkerPool::new("health", 1, 4),
            monitor_pool: WorkerPool::new("monitor", 1, 4),
            transport,
            config,
            watched: StdMutex::new(Vec::new()),
            health: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        });

        DispatcherInner::spawn_health_loop(&inner);
        DispatcherInner::spawn_monitor_loop(&inner);

        Self { inner }
    }

    /// Submits a synchronous chat call.
    ///
    /// Validation failures, queue saturation, and transport failures all
    /// resolve the returned future with an [`ErrorRecord`]; it never panics
    /// across the boundary.
    pub fn dispatch(
        &self,
        request: CompletionRequest,
        config: ProviderConfig,
    ) -> DispatchFuture<Response> {
        let adapter = config.provider.adapter();
        if let Err(record) = adapter.validate_request(&request) {
            return DispatchFuture::resolved(Err(record));
        }
        self.submit_call(ChatCall(request), config)
    }

    /// Submits an embeddings call; gated on the provider's embeddings support.
    pub fn dispatch_embeddings(
        &self,
        request: EmbeddingsRequest,
        config: ProviderConfig,
    ) -> DispatchFuture<EmbeddingsResponse> {
        let adapter = config.provider.adapter();
        if !adapter.capabilities().supports_embeddings {
            return DispatchFuture::resolved(Err(ErrorRecord::unsupported(
                adapter.name(),
                "embeddings",
            )));
        }
        self.submit_call(EmbeddingsCall(request), config)
    }

    /// Opens a streaming call.
    ///
    /// Failures before the stream opens (validation, transform, queue
    /// saturation) are returned synchronously; every failure after that is
    /// delivered in-band as a terminal [`StreamItem::Error`].
    pub fn dispatch_stream(
        &self,
        request: CompletionRequest,
        config: ProviderConfig,
    ) -> Result<DeltaStream, ErrorRecord> {
        let adapter = config.provider.adapter();
        adapter.validate_request(&request)?;
        let parts = adapter.request_parts(&request, &config, true)?;

        let permit = self.inner.request_pool.reserve()?;
        let (sender, receiver) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        let inner = Arc::clone(&self.inner);

        permit.submit(async move {
            match inner.transport.send_stream(parts).await {
                Ok(response) if response.is_success() => {
                    StreamEngine::new(adapter, response.body, sender).run().await;
                }
                Ok(response) => {
                    // 打开流之后的失败一律走带内 error 项
                    let status = response.status;
                    let retry_after = response.retry_after();
                    let body = collect_stream_text(response.body, adapter.name())
                        .await
                        .unwrap_or_default();
                    let record = adapter.classify_error(status, &body, retry_after);
                    let _ = sender.send(StreamItem::Error(record)).await;
                }
                Err(record) => {
                    let _ = sender
                        .send(StreamItem::Error(record.for_provider(adapter.name())))
                        .await;
                }
            }
        });

        Ok(DeltaStream::new(receiver))
    }

    /// Registers a provider config for periodic health probes.
    pub fn watch(&self, config: ProviderConfig) {
        self.inner
            .watched
            .lock()
            .expect("watched lock")
            .push(config);
    }

    /// Latest health snapshot per watched provider.
    pub fn health(&self) -> HashMap<&'static str, ProviderHealth> {
        self.inner.health.read().expect("health lock").clone()
    }

    /// Pending jobs per pool, for observability.
    pub fn queue_depths(&self) -> HashMap<&'static str, usize> {
        let inner = &self.inner;
        [
            &inner.request_pool,
            &inner.retry_pool,
            &inner.health_pool,
            &inner.monitor_pool,
        ]
        .into_iter()
        .map(|pool| (pool.name(), pool.queue_depth()))
        .collect()
    }

    /// Drains each pool up to the configured timeout, then aborts what remains.
    ///
    /// Monitoring and health pools stop first so teardown cannot produce
    /// false-negative health signals.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown_notify.notify_waiters();
        let timeout = self.inner.config.shutdown_timeout;

        self.inner.monitor_pool.shutdown(timeout).await;
        self.inner.health_pool.shutdown(timeout).await;
        self.inner.request_pool.shutdown(timeout).await;
        self.inner.retry_pool.shutdown(timeout).await;
        debug!("dispatcher shut down");
    }

    fn submit_call<C: CallSpec>(&self, call: C, config: ProviderConfig) -> DispatchFuture<C::Output> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return DispatchFuture::resolved(Err(ErrorRecord::new(
                ErrorKind::InternalError,
                "tsumugi",
                "dispatcher is shutting down",
            )));
        }

        let (sender, receiver) = oneshot::channel();
        let cancel = Arc::new(CancelToken::default());
        let future = DispatchFuture::pending(receiver, Arc::clone(&cancel));

        match self.inner.request_pool.reserve() {
            Ok(permit) => {
                let inner = Arc::clone(&self.inner);
                let started = Instant::now();
                permit.submit(async move {
                    inner.run_attempt(0, call, config, sender, cancel, started).await;
                });
            }
            Err(record) => {
                let _ = sender.send(Err(record));
            }
        }

        future
    }
}

impl DispatcherInner {
    /// 单次尝试 + 失败后按策略调度下一次尝试到 retry 池
    fn run_attempt<C: CallSpec>(
        self: Arc<Self>,
        attempt: u32,
        call: C,
        config: ProviderConfig,
        sender: oneshot::Sender<Result<C::Output, ErrorRecord>>,
        cancel: Arc<CancelToken>,
        started: Instant,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let adapter = config.provider.adapter();
            if cancel.is_cancelled() {
                let _ = sender.send(Err(aborted_record(adapter.name())));
                return;
            }

            match self.execute_once(adapter, &call, &config, &cancel).await {
                Ok(output) => {
                    let _ = sender.send(Ok(output));
                }
                Err(record) => {
                    if !self.config.retry.should_retry(attempt, &record) {
                        let _ = sender.send(Err(record));
                        return;
                    }

                    let delay = self.config.retry.delay(attempt, &record);
                    // 睡过总预算截止点时放弃重试 呈现最后一次错误
                    if let Some(deadline) = self.config.overall_deadline {
                        if started.elapsed() + delay >= deadline {
                            debug!(
                                provider = adapter.name(),
                                attempt,
                                "retry budget exhausted, surfacing last error"
                            );
                            let _ = sender.send(Err(record));
                            return;
                        }
                    }

                    match self.retry_pool.reserve() {
                        Ok(permit) => {
                            debug!(
                                provider = adapter.name(),
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                kind = %record.kind,
                                "retrying after recoverable error"
                            );
                            let inner = Arc::clone(&self);
                            permit.submit(async move {
                                tokio::time::sleep(delay).await;
                                inner
                                    .run_attempt(attempt + 1, call, config, sender, cancel, started)
                                    .await;
                            });
                        }
                        Err(_saturated) => {
                            warn!(
                                provider = adapter.name(),
                                "retry pool saturated, surfacing original error"
                            );
                            let _ = sender.send(Err(record));
                        }
                    }
                }
            }
        })
    }

    async fn execute_once<C: CallSpec>(
        &self,
        adapter: &'static dyn ProviderAdapter,
        call: &C,
        config: &ProviderConfig,
        cancel: &CancelToken,
    ) -> Result<C::Output, ErrorRecord> {
        let parts = call.parts(adapter, config)?;

        let perform = async {
            let response = self
                .transport
                .send(parts)
                .await
                .map_err(|record| record.for_provider(adapter.name()))?;

            if response.is_success() {
                let body = response
                    .into_string()
                    .map_err(|record| record.for_provider(adapter.name()))?;
                C::parse(adapter, &body)
            } else {
                let status = response.status;
                let retry_after = response.retry_after();
                let body = response.into_string().unwrap_or_default();
                Err(adapter.classify_error(status, &body, retry_after))
            }
        };

        // 超时在 dispatch 边界统一竞速 adapter 内部不做超时
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(aborted_record(adapter.name())),
            outcome = async {
                match self.config.call_timeout {
                    Some(limit) => match tokio::time::timeout(limit, perform).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ErrorRecord::timeout(
                            adapter.name(),
                            format!("call exceeded {}ms", limit.as_millis()),
                        )),
                    },
                    None => perform.await,
                }
            } => outcome,
        }
    }

    fn spawn_health_loop(inner: &Arc<Self>) {
        if let Ok(permit) = inner.health_pool.reserve() {
            let weak = Arc::downgrade(inner);
            permit.submit(async move {
                Self::health_loop(weak).await;
            });
        }
    }

    /// 周期探活 记录每个被 watch 的 provider 的连通性与时延
    async fn health_loop(weak: Weak<Self>) {
        loop {
            let Some(inner) = weak.upgrade() else { return };
            if inner.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            let watched: Vec<ProviderConfig> =
                inner.watched.lock().expect("watched lock").clone();
            for config in watched {
                let adapter = config.provider.adapter();
                let Some(request) = adapter.health_request(&config) else {
                    continue;
                };
                let started = Instant::now();
                let status = match inner.transport.send(request).await {
                    // 任何 HTTP 响应都证明端点可达 状态码不判定健康
                    Ok(_) => ProviderHealth {
                        healthy: true,
                        latency_ms: Some(started.elapsed().as_millis() as u64),
                        error: None,
                    },
                    Err(record) => ProviderHealth {
                        healthy: false,
                        latency_ms: None,
                        error: Some(record.to_string()),
                    },
                };
                inner
                    .health
                    .write()
                    .expect("health lock")
                    .insert(adapter.name(), status);
            }

            let interval = inner.config.health_interval;
            let wait = async {
                tokio::time::sleep(interval).await;
            };
            tokio::select! {
                _ = inner.shutdown_notify.notified() => return,
                _ = wait => {}
            }
        }
    }

    fn spawn_monitor_loop(inner: &Arc<Self>) {
        if let Ok(permit) = inner.monitor_pool.reserve() {
            let weak = Arc::downgrade(inner);
            permit.submit(async move {
                Self::monitor_loop(weak).await;
            });
        }
    }

    /// 周期记录各池队列深度
    async fn monitor_loop(weak: Weak<Self>) {
        loop {
            let Some(inner) = weak.upgrade() else { return };
            if inner.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            debug!(
                request = inner.request_pool.queue_depth(),
                retry = inner.retry_pool.queue_depth(),
                "pool queue depths"
            );

            let interval = inner.config.monitor_interval;
            let wait = async {
                tokio::time::sleep(interval).await;
            };
            tokio::select! {
                _ = inner.shutdown_notify.notified() => return,
                _ = wait => {}
            }
        }
    }
}

fn aborted_record(provider: &'static str) -> ErrorRecord {
    ErrorRecord::new(
        ErrorKind::InternalError,
        provider,
        "call aborted by caller",
    )
}
