//! # ブローカー接続スーパーバイザー
//!
//! プロセスで唯一のブローカー接続とチャネルを所有し、切断を検知して再接続する。
//!
//! ## 設計方針
//!
//! - **上限付き再接続**: 固定間隔で最大 N 回試行する。指数バックオフは行わない
//! - **世代番号**: 再接続のたびに [`ChannelHandle`] の世代番号が進む。
//!   古い世代の切断通知は無視する
//! - **再接続は重ならない**: 再接続ループは同時に 1 つだけ走る。
//!   切断通知は進行中の接続処理の完了を待ってから状態を確認し直す
//! - **閉じたチャネルは公開しない**: フック実行中に閉じたチャネルは失敗した試行として扱う
//! - **再接続フック**: 新しいチャネルを公開する前に [`ReconnectHook`] を登録順に実行する
//!   （トポロジー再宣言 → コンシューマ再登録）
//! - **上限到達は致命的**: [`BrokerSupervisor::wait_fatal`] が解決し、プロセスは終了する

use std::{
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_shared::{
    event_log::{error as error_context, event},
    log_business_event,
};
use tokio::sync::watch;
use url::Url;

use super::{BrokerChannel, BrokerConnector, ChannelHandle};
use crate::error::InfraError;

/// 既定の prefetch 数
pub const DEFAULT_PREFETCH: u16 = 1;
/// 既定の再接続間隔
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// 既定の再接続上限回数
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// ブローカー接続設定
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// ブローカー URL（`amqp://` / `amqps://`）
    pub url: Option<String>,
    /// チャネルあたりの未 ack メッセージ上限
    pub prefetch: u16,
    /// 再接続試行の間隔
    pub reconnect_delay: Duration,
    /// 連続失敗で諦めるまでの試行回数
    pub max_reconnect_attempts: u32,
}

impl BrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_reconnect(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_attempts = max_attempts;
        self
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            prefetch: DEFAULT_PREFETCH,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// 接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// スーパーバイザーの観測用スナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub state:              ConnectionState,
    /// 進行中の再接続で何回目の試行か（接続成功で 0 に戻る）
    pub reconnect_attempts: u32,
    /// 現在のチャネルの世代番号（未接続なら直近の値）
    pub generation:         u64,
    /// 再接続の上限に達したか
    pub exhausted:          bool,
}

impl SupervisorStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// 再接続時に新しいチャネルで実行される処理
///
/// エラーを返すとその試行は失敗として数えられる。
#[async_trait]
pub trait ReconnectHook: Send + Sync {
    async fn on_reconnect(&self, channel: &ChannelHandle) -> Result<(), InfraError>;
}

struct Inner {
    state:              ConnectionState,
    handle:             Option<ChannelHandle>,
    reconnect_attempts: u32,
    generation:         u64,
    exhausted:          bool,
    shutting_down:      bool,
}

/// ブローカー接続スーパーバイザー
///
/// `Arc` で共有し、[`TopologyManager`](super::TopologyManager)、
/// [`Publisher`](super::Publisher)、[`Consumer`](super::Consumer) に渡す。
pub struct BrokerSupervisor {
    connector:      Arc<dyn BrokerConnector>,
    config:         BrokerConfig,
    inner:          Mutex<Inner>,
    generations:    AtomicU64,
    reconnect_lock: tokio::sync::Mutex<()>,
    hooks:          Mutex<Vec<Weak<dyn ReconnectHook>>>,
    fatal_tx:       watch::Sender<bool>,
}

impl BrokerSupervisor {
    pub fn new(connector: Arc<dyn BrokerConnector>, config: BrokerConfig) -> Arc<Self> {
        let (fatal_tx, _) = watch::channel(false);
        Arc::new(Self {
            connector,
            config,
            inner: Mutex::new(Inner {
                state:              ConnectionState::Disconnected,
                handle:             None,
                reconnect_attempts: 0,
                generation:         0,
                exhausted:          false,
                shutting_down:      false,
            }),
            generations: AtomicU64::new(0),
            reconnect_lock: tokio::sync::Mutex::new(()),
            hooks: Mutex::new(Vec::new()),
            fatal_tx,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// 接続とチャネルを確立する
    ///
    /// 接続済みなら何もしない。URL の未設定・不正は `Configuration`、
    /// ブローカーに到達できない場合は `Connection` エラー。
    #[tracing::instrument(skip_all, level = "debug")]
    pub async fn connect(self: &Arc<Self>) -> Result<(), InfraError> {
        let _guard = self.reconnect_lock.lock().await;

        {
            let mut inner = self.inner();
            if inner.state == ConnectionState::Connected {
                return Ok(());
            }
            if inner.exhausted {
                return Err(InfraError::reconnect_exhausted(
                    self.config.max_reconnect_attempts,
                ));
            }
            inner.state = ConnectionState::Connecting;
        }

        match self.open().await {
            Ok(handle) => {
                let generation = handle.generation();
                self.commit(handle);
                log_business_event!(
                    event.category = event::category::BROKER,
                    event.action = event::action::BROKER_CONNECTED,
                    event.result = event::result::SUCCESS,
                    broker.generation = generation,
                    "ブローカーに接続しました"
                );
                Ok(())
            }
            Err(e) => {
                self.inner().state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// 上限付きで再接続する
    ///
    /// 再接続ループが既に走っている場合は何もせずに戻る（切断検知からの再接続は待ち合わせる）。
    /// 上限に達した後は試行せずに `ReconnectExhausted` を返す。
    #[tracing::instrument(skip_all, level = "debug")]
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), InfraError> {
        let max_attempts = self.config.max_reconnect_attempts;

        if self.inner().exhausted {
            return Err(InfraError::reconnect_exhausted(max_attempts));
        }

        let Ok(guard) = self.reconnect_lock.try_lock() else {
            tracing::debug!("再接続は既に進行中");
            return Ok(());
        };

        self.reconnect_locked(guard).await
    }

    /// 再接続ループ本体。`reconnect_lock` を保持した状態で呼ぶ
    async fn reconnect_locked(
        self: &Arc<Self>,
        _guard: tokio::sync::MutexGuard<'_, ()>,
    ) -> Result<(), InfraError> {
        let max_attempts = self.config.max_reconnect_attempts;

        if self.inner().exhausted {
            return Err(InfraError::reconnect_exhausted(max_attempts));
        }

        let url = self.broker_url()?;

        for attempt in 1..=max_attempts {
            tokio::time::sleep(self.config.reconnect_delay).await;

            {
                let mut inner = self.inner();
                if inner.shutting_down {
                    return Err(InfraError::connection("シャットダウン中のため再接続を中止しました"));
                }
                if inner.state == ConnectionState::Connected {
                    return Ok(());
                }
                inner.state = ConnectionState::Connecting;
                inner.reconnect_attempts = attempt;
            }

            tracing::info!(attempt, max_attempts, "ブローカーへの再接続を試行します");

            let handle = match self.establish(&url).await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        error.category = error_context::category::INFRASTRUCTURE,
                        error.kind = error_context::kind::CONNECTION,
                        "再接続に失敗しました: {}",
                        e
                    );
                    continue;
                }
            };

            if let Err(e) = self.run_hooks(&handle).await {
                tracing::warn!(
                    attempt,
                    max_attempts,
                    error.category = error_context::category::INFRASTRUCTURE,
                    error.kind = error_context::kind::TOPOLOGY,
                    "再接続後の復元処理に失敗しました: {}",
                    e
                );
                close_quietly(&handle).await;
                continue;
            }

            if !handle.is_open() {
                tracing::warn!(
                    attempt,
                    max_attempts,
                    error.category = error_context::category::INFRASTRUCTURE,
                    error.kind = error_context::kind::CONNECTION,
                    generation = handle.generation(),
                    "再接続中にチャネルが閉じられました"
                );
                continue;
            }

            let generation = handle.generation();
            self.commit(handle);
            log_business_event!(
                event.category = event::category::BROKER,
                event.action = event::action::BROKER_RECONNECTED,
                event.result = event::result::SUCCESS,
                broker.generation = generation,
                broker.attempt = attempt,
                "ブローカーに再接続しました"
            );
            return Ok(());
        }

        {
            let mut inner = self.inner();
            inner.state = ConnectionState::Disconnected;
            inner.exhausted = true;
        }
        self.fatal_tx.send_replace(true);

        log_business_event!(
            event.category = event::category::BROKER,
            event.action = event::action::BROKER_RECONNECT_EXHAUSTED,
            event.result = event::result::FAILURE,
            broker.attempt = max_attempts,
            "ブローカーへの再接続を断念しました"
        );

        Err(InfraError::reconnect_exhausted(max_attempts))
    }

    /// 現在のチャネルを借りる
    ///
    /// 切断中は `ChannelUnavailable`。返したハンドルは再接続をまたいで保持しないこと。
    pub fn channel(&self) -> Result<ChannelHandle, InfraError> {
        let inner = self.inner();
        match &inner.handle {
            Some(handle) if inner.state == ConnectionState::Connected && handle.is_open() => {
                Ok(handle.clone())
            }
            _ => Err(InfraError::channel_unavailable()),
        }
    }

    /// ハンドルが現在の世代か
    pub fn is_current(&self, handle: &ChannelHandle) -> bool {
        let inner = self.inner();
        inner.state == ConnectionState::Connected && inner.generation == handle.generation()
    }

    pub fn status(&self) -> SupervisorStatus {
        let inner = self.inner();
        SupervisorStatus {
            state:              inner.state,
            reconnect_attempts: inner.reconnect_attempts,
            generation:         inner.generation,
            exhausted:          inner.exhausted,
        }
    }

    /// 再接続フックを登録する
    ///
    /// 弱参照で保持するため、フックの所有者が破棄されると自動的に外れる。
    pub fn register_hook<H>(&self, hook: &Arc<H>)
    where
        H: ReconnectHook + 'static,
    {
        let hook: Arc<dyn ReconnectHook> = hook.clone();
        let weak = Arc::downgrade(&hook);
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(weak);
    }

    /// 再接続の上限到達まで待つ
    pub async fn wait_fatal(&self) -> InfraError {
        let mut rx = self.fatal_tx.subscribe();
        // Sender は self が保持しているため wait_for は閉じられない
        let _ = rx.wait_for(|exhausted| *exhausted).await;
        InfraError::reconnect_exhausted(self.config.max_reconnect_attempts)
    }

    /// 再接続を止め、チャネルを閉じる
    pub async fn shutdown(&self) {
        let handle = {
            let mut inner = self.inner();
            inner.shutting_down = true;
            inner.state = ConnectionState::Disconnected;
            inner.handle.take()
        };

        if let Some(handle) = handle {
            close_quietly(&handle).await;
            log_business_event!(
                event.category = event::category::BROKER,
                event.action = event::action::BROKER_DISCONNECTED,
                event.result = event::result::SUCCESS,
                broker.generation = handle.generation(),
                "ブローカーとの接続を閉じました"
            );
        }
    }

    // ===== 内部処理 =====

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broker_url(&self) -> Result<Url, InfraError> {
        let raw = self
            .config
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| InfraError::configuration("ブローカー URL が設定されていません"))?;

        let url = Url::parse(raw)
            .map_err(|e| InfraError::configuration(format!("ブローカー URL が不正です: {e}")))?;

        match url.scheme() {
            "amqp" | "amqps" => Ok(url),
            other => Err(InfraError::configuration(format!(
                "ブローカー URL のスキームが不正です: {other}"
            ))),
        }
    }

    /// 初回接続: URL 検証 → 接続確立 → フック実行 → チャネルの生存確認
    async fn open(&self) -> Result<ChannelHandle, InfraError> {
        let url = self.broker_url()?;
        let handle = self.establish(&url).await?;
        if let Err(e) = self.run_hooks(&handle).await {
            close_quietly(&handle).await;
            return Err(e);
        }
        if !handle.is_open() {
            return Err(InfraError::connection(
                "接続の確立中にチャネルが閉じられました",
            ));
        }
        Ok(handle)
    }

    async fn establish(&self, url: &Url) -> Result<ChannelHandle, InfraError> {
        let channel: Arc<dyn BrokerChannel> = self.connector.connect(url).await?;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = ChannelHandle::new(generation, channel);

        if let Err(e) = handle.set_prefetch(self.config.prefetch).await {
            close_quietly(&handle).await;
            return Err(e);
        }

        Ok(handle)
    }

    async fn run_hooks(&self, handle: &ChannelHandle) -> Result<(), InfraError> {
        let hooks: Vec<Arc<dyn ReconnectHook>> = {
            let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
            hooks.retain(|hook| hook.strong_count() > 0);
            hooks.iter().filter_map(Weak::upgrade).collect()
        };

        for hook in hooks {
            hook.on_reconnect(handle).await?;
        }
        Ok(())
    }

    fn commit(self: &Arc<Self>, handle: ChannelHandle) {
        {
            let mut inner = self.inner();
            inner.state = ConnectionState::Connected;
            inner.generation = handle.generation();
            inner.reconnect_attempts = 0;
            inner.handle = Some(handle.clone());
        }
        self.spawn_watcher(handle);
    }

    fn spawn_watcher(self: &Arc<Self>, handle: ChannelHandle) {
        let supervisor = Arc::downgrade(self);
        tokio::spawn(async move {
            handle.closed().await;
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.on_connection_lost(handle.generation()).await;
            }
        });
    }

    async fn on_connection_lost(self: &Arc<Self>, generation: u64) {
        {
            let mut inner = self.inner();
            if inner.shutting_down || inner.exhausted || inner.generation != generation {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.handle = None;
        }

        log_business_event!(
            event.category = event::category::BROKER,
            event.action = event::action::BROKER_DISCONNECTED,
            event.result = event::result::FAILURE,
            broker.generation = generation,
            "ブローカーとの接続が失われました"
        );

        // 進行中の connect / reconnect が終わるまで待ち、その結果を見て判断する
        let guard = self.reconnect_lock.lock().await;
        {
            let inner = self.inner();
            if inner.shutting_down || inner.exhausted {
                return;
            }
            let restored = inner.state == ConnectionState::Connected
                && inner.generation != generation
                && inner.handle.as_ref().is_some_and(|handle| handle.is_open());
            if restored {
                tracing::debug!(
                    generation = inner.generation,
                    "接続は既に復旧済みのため再接続しません"
                );
                return;
            }
        }

        if let Err(e) = self.reconnect_locked(guard).await {
            tracing::error!(
                error.category = error_context::category::INFRASTRUCTURE,
                error.kind = error_context::kind::CONNECTION,
                "ブローカーへの再接続に失敗しました: {}",
                e
            );
        }
    }
}

async fn close_quietly(handle: &ChannelHandle) {
    if let Err(e) = handle.close().await {
        tracing::debug!(error = %e, generation = handle.generation(), "チャネルのクローズに失敗");
    }
}
