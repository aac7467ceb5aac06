//! 동기 API를 제공하는 플랫폼 파사드.
//!
//! 모든 I/O는 전용 스레드(`td365-io`)의 단일 스레드 tokio 런타임에서 실행됩니다.
//! 공개 메서드는 작업을 그 런타임에 올리고 결과가 올 때까지 호출 스레드를 멈춥니다.
//! 틱은 별도 전달 스레드(`td365-ticks`)에서 도착 순서대로 콜백에 전달되므로
//! 콜백이 I/O 스레드를 막지 않습니다.
//!
//! # 사용 예제
//!
//! ```rust,ignore
//! let platform = Platform::new(AppConfig::default())?;
//! platform.connect_demo()?;
//! platform.subscribe(4021)?;
//! platform.main_loop(|tick| println!("{}", tick))?;
//! ```

use crate::auth::{self, AccountDetail, Authenticator};
use crate::error::{FeedError, FeedResult};
use crate::http::SessionClient;
use crate::websocket::{StreamClient, StreamCredentials, StreamState, Termination};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use secrecy::SecretString;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use td365_core::config::AppConfig;
use td365_core::types::{Market, MarketGroup, Tick};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 전달 스레드가 종료 플래그를 확인하는 주기.
const DELIVERY_POLL: Duration = Duration::from_millis(100);

/// I/O 런타임을 돌리는 백그라운드 스레드.
struct IoThread {
    handle: Handle,
    stop_tx: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl IoThread {
    fn spawn() -> FeedResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("td365-io".to_string())
            .spawn(move || {
                debug!("I/O thread started");
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
                runtime.shutdown_timeout(Duration::from_secs(1));
                debug!("I/O thread stopped");
            })?;

        Ok(Self {
            handle,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// 작업을 I/O 스레드에 올리고 끝날 때까지 호출 스레드를 멈춥니다.
    ///
    /// 비동기 컨텍스트 안에서 호출하면 안 됩니다.
    fn run<F, T>(&self, fut: F) -> FeedResult<T>
    where
        F: Future<Output = FeedResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(fut.await);
        });
        rx.blocking_recv().map_err(|_| FeedError::Shutdown)?
    }

    fn spawn_task<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut)
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("I/O thread panicked");
            }
        }
    }
}

/// 활성 연결: 세션, 스트림, 세션 갱신 타이머.
struct Connection {
    session: Arc<tokio::sync::Mutex<SessionClient>>,
    stream: Arc<StreamClient>,
    refresh: JoinHandle<()>,
}

/// 세션 하나와 스트림 연결 하나를 관리하는 동기 파사드.
pub struct Platform {
    config: AppConfig,
    io: IoThread,
    connection: Mutex<Option<Connection>>,
    shutdown: Arc<AtomicBool>,
    /// I/O 스레드 쪽 작업의 종료 신호. 연결 중인 스트림도 이 토큰의 자식을 가짐
    cancel: CancellationToken,
    tick_tx: Sender<Tick>,
    tick_rx: Receiver<Tick>,
}

impl Platform {
    /// I/O 스레드를 시작합니다. 연결은 아직 하지 않습니다.
    pub fn new(config: AppConfig) -> FeedResult<Self> {
        let io = IoThread::spawn()?;
        let (tick_tx, tick_rx) = unbounded();

        Ok(Self {
            config,
            io,
            connection: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            tick_tx,
            tick_rx,
        })
    }

    /// 원클릭 데모 계정으로 접속합니다.
    pub fn connect_demo(&self) -> FeedResult<()> {
        self.connect_with(auth::authenticate_demo())
    }

    /// 사용자 계정으로 인증한 뒤 접속합니다.
    pub fn connect_with_credentials(
        &self,
        username: &str,
        password: SecretString,
        account_id: &str,
    ) -> FeedResult<()> {
        let authenticator = Authenticator::new(self.config.auth.clone(), self.config.http.clone());
        let username = username.to_string();
        let account_id = account_id.to_string();

        let detail = self.run_until_shutdown(async move {
            authenticator
                .authenticate(&username, &password, &account_id)
                .await
        })?;
        self.connect_with(detail)
    }

    /// 이미 확인된 계정 정보로 접속합니다.
    pub fn connect_with(&self, detail: AccountDetail) -> FeedResult<()> {
        let session = SessionClient::new(detail.platform_url.host.clone(), self.config.http.clone());
        self.connect_with_session(session, detail)
    }

    /// 미리 만든 세션 클라이언트로 로그인하고 스트림을 시작합니다.
    ///
    /// 첫 Ready까지 기다리며, 인증이 거부되면 `Auth` 에러를 반환합니다.
    /// 기다리는 중에 [`Platform::shutdown`]이 호출되면 `Shutdown`을 반환합니다.
    pub fn connect_with_session(
        &self,
        mut session: SessionClient,
        detail: AccountDetail,
    ) -> FeedResult<()> {
        self.check_running()?;
        if self.lock_connection()?.is_some() {
            return Err(FeedError::Protocol("already connected".to_string()));
        }

        info!(
            host = %detail.platform_url.host,
            sock_host = %detail.sock_host,
            account_type = ?detail.account_type,
            "Connecting"
        );

        let stream = Arc::new(StreamClient::with_cancel(
            self.config.stream.clone(),
            self.cancel.child_token(),
        ));
        let tick_tx = self.tick_tx.clone();
        let starting = stream.clone();

        let session = self.run_until_shutdown(async move {
            let token = session.login(&detail.platform_url.path).await?;
            let credentials = StreamCredentials {
                login_id: detail.login_id,
                token,
            };
            starting
                .start(&detail.sock_host, credentials, tick_tx)
                .await?;
            Ok(session)
        })?;

        let session = Arc::new(tokio::sync::Mutex::new(session));
        let refresh = self.io.spawn_task(refresh_session(
            session.clone(),
            self.config.http.session_refresh_interval(),
            self.cancel.child_token(),
        ));

        // shutdown()은 플래그를 먼저 세우고 잠금을 잡으므로 잠금 안에서 다시 확인
        let mut connection = self.lock_connection()?;
        if self.is_shutdown() {
            refresh.abort();
            stream.shutdown();
            return Err(FeedError::Shutdown);
        }
        *connection = Some(Connection {
            session,
            stream,
            refresh,
        });
        info!("Connected");
        Ok(())
    }

    /// 종목 시세를 구독합니다.
    pub fn subscribe(&self, quote_id: u32) -> FeedResult<()> {
        let stream = self.stream()?;
        self.io.run(async move { stream.subscribe(quote_id).await })
    }

    /// 종목 시세 구독을 해지합니다.
    pub fn unsubscribe(&self, quote_id: u32) -> FeedResult<()> {
        let stream = self.stream()?;
        self.io.run(async move { stream.unsubscribe(quote_id).await })
    }

    /// 현재 스트림 상태. 연결 전이면 `Disconnected`.
    pub fn stream_state(&self) -> StreamState {
        self.stream()
            .map(|s| s.state())
            .unwrap_or(StreamState::Disconnected)
    }

    /// 스트림이 끝날 때까지 틱을 콜백으로 전달합니다.
    ///
    /// 콜백은 전달 스레드에서 도착 순서대로 호출됩니다. 명시적 종료면 `Ok`,
    /// 인증 거부나 복구 불가능한 에러로 끝나면 그 에러를 반환합니다.
    ///
    /// 스트림이 스스로 끝나면 이미 받은 틱을 모두 전달한 뒤 반환합니다.
    /// [`Platform::shutdown`]으로 끝나면 대기열에 남은 틱은 전달하지 않고 버립니다.
    pub fn main_loop<F>(&self, callback: F) -> FeedResult<()>
    where
        F: FnMut(Tick) + Send + 'static,
    {
        let stream = self.stream()?;
        let done = Arc::new(AtomicBool::new(false));

        let worker = spawn_delivery(
            self.tick_rx.clone(),
            self.shutdown.clone(),
            done.clone(),
            callback,
        )?;

        let termination = self
            .io
            .run(async move { Ok(stream.wait_for_disconnect().await) })
            .unwrap_or(Termination::Closed);

        done.store(true, Ordering::SeqCst);
        if worker.join().is_err() {
            error!("Tick callback panicked");
        }

        info!(reason = %termination, "Main loop finished");
        if termination.is_failure() {
            Err(termination.into_error())
        } else {
            Ok(())
        }
    }

    /// close 프레임을 보내고 연결을 정리합니다.
    pub fn disconnect(&self) -> FeedResult<()> {
        let Some(connection) = self.lock_connection()?.take() else {
            return Ok(());
        };
        connection.refresh.abort();
        let stream = connection.stream.clone();
        self.io.run(async move { stream.close().await })
    }

    /// 모든 루프에 종료를 알립니다. 다른 스레드에서 호출해도 됩니다.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutdown requested");
        self.cancel.cancel();

        if let Ok(guard) = self.connection.lock() {
            if let Some(connection) = guard.as_ref() {
                connection.refresh.abort();
                connection.stream.shutdown();
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// 최상위 마켓 그룹 목록.
    pub fn get_market_super_group(&self) -> FeedResult<Vec<MarketGroup>> {
        let session = self.session()?;
        self.io
            .run(async move { session.lock().await.get_market_super_group().await })
    }

    /// 슈퍼 그룹 아래의 마켓 그룹 목록.
    pub fn get_market_group(&self, super_group_id: u32) -> FeedResult<Vec<MarketGroup>> {
        let session = self.session()?;
        self.io
            .run(async move { session.lock().await.get_market_group(super_group_id).await })
    }

    /// 그룹 안의 종목 목록.
    pub fn get_market_quote(&self, group_id: u32) -> FeedResult<Vec<Market>> {
        let session = self.session()?;
        self.io
            .run(async move { session.lock().await.get_market_quote(group_id).await })
    }

    /// 작업을 I/O 스레드에서 실행하되 종료 요청이 오면 `Shutdown`으로 끝냅니다.
    fn run_until_shutdown<F, T>(&self, fut: F) -> FeedResult<T>
    where
        F: Future<Output = FeedResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.io.run(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(FeedError::Shutdown),
                result = fut => result,
            }
        })
    }

    fn check_running(&self) -> FeedResult<()> {
        if self.is_shutdown() {
            Err(FeedError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn lock_connection(&self) -> FeedResult<std::sync::MutexGuard<'_, Option<Connection>>> {
        self.connection
            .lock()
            .map_err(|_| FeedError::Protocol("connection state poisoned".to_string()))
    }

    fn stream(&self) -> FeedResult<Arc<StreamClient>> {
        self.check_running()?;
        self.lock_connection()?
            .as_ref()
            .map(|c| c.stream.clone())
            .ok_or_else(|| FeedError::Protocol("not connected".to_string()))
    }

    fn session(&self) -> FeedResult<Arc<tokio::sync::Mutex<SessionClient>>> {
        self.check_running()?;
        self.lock_connection()?
            .as_ref()
            .map(|c| c.session.clone())
            .ok_or_else(|| FeedError::Protocol("not connected".to_string()))
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_delivery<F>(
    rx: Receiver<Tick>,
    shutdown: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
    mut callback: F,
) -> FeedResult<thread::JoinHandle<()>>
where
    F: FnMut(Tick) + Send + 'static,
{
    let worker = thread::Builder::new()
        .name("td365-ticks".to_string())
        .spawn(move || {
            let mut delivered: u64 = 0;
            loop {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match rx.recv_timeout(DELIVERY_POLL) {
                    Ok(tick) => {
                        callback(tick);
                        delivered += 1;
                    }
                    // 스트림이 끝났으면 남은 틱을 모두 전달한 뒤 종료
                    Err(RecvTimeoutError::Timeout) if done.load(Ordering::SeqCst) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(delivered, "Delivery thread stopped");
        })?;
    Ok(worker)
}

/// 주기적으로 서버 측 세션을 연장합니다. 실패는 로그만 남기고 다음 주기에 재시도합니다.
async fn refresh_session(
    session: Arc<tokio::sync::Mutex<SessionClient>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // 첫 tick은 즉시 발생
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = session.lock().await.update_session_token().await {
            warn!(error = %e, "Session refresh failed, retrying next interval");
        }
    }
}
