//! # ディスパッチャ
//!
//! ブローカー接続 → トポロジー宣言 → コンシューマ登録までの起動手順をまとめる。
//!
//! ## 設計方針
//!
//! - **再接続フックの順序**: トポロジー → コンシューマの順に登録し、
//!   再接続時にキューが宣言されてから購読を張り直す
//! - **所有権**: フックはスーパーバイザーに弱参照で登録されるため、
//!   [`Dispatcher`] が `TopologyManager` と `Consumer` を保持し続ける

use std::sync::Arc;

use courier_domain::topology::{AUTH_EMAIL_QUEUE, ORDER_EMAIL_QUEUE, Route, Topology};
use courier_infra::{
    InfraError,
    broker::{BrokerSupervisor, Consumer, TopologyManager},
};

use crate::usecase::{AuthEmailHandler, NotificationService, OrderEmailHandler};

/// ディスパッチャの起動設定
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// 認証メールのエクスチェンジ名
    pub auth_exchange:  String,
    /// 注文メールのエクスチェンジ名
    pub order_exchange: String,
    /// 確認リンクのベース URL
    pub client_url:     String,
}

impl DispatchSettings {
    /// 宣言するトポロジー
    pub fn topology(&self) -> Topology {
        Topology::new()
            .with_route(Route::auth_email(&self.auth_exchange))
            .with_route(Route::order_email(&self.order_exchange))
    }
}

/// 起動済みのディスパッチャ
pub struct Dispatcher {
    supervisor: Arc<BrokerSupervisor>,
    topology:   Arc<TopologyManager>,
    consumer:   Arc<Consumer>,
}

impl Dispatcher {
    /// ブローカーに接続し、トポロジーを宣言して両キューの購読を開始する
    ///
    /// いずれかの段階で失敗した場合はエラーを返す（起動失敗として扱う）。
    pub async fn start(
        supervisor: Arc<BrokerSupervisor>,
        settings: &DispatchSettings,
        service: Arc<NotificationService>,
    ) -> Result<Self, InfraError> {
        supervisor.connect().await?;

        let topology = Arc::new(TopologyManager::new(
            supervisor.clone(),
            settings.topology(),
        ));
        topology.declare_all().await?;

        let consumer = Arc::new(Consumer::new(supervisor.clone()));
        supervisor.register_hook(&topology);
        supervisor.register_hook(&consumer);

        consumer
            .consume(
                AUTH_EMAIL_QUEUE,
                Arc::new(AuthEmailHandler::new(
                    service.clone(),
                    &settings.client_url,
                )),
            )
            .await?;
        consumer
            .consume(ORDER_EMAIL_QUEUE, Arc::new(OrderEmailHandler::new(service)))
            .await?;

        let queues = consumer.subscriptions().await;
        tracing::info!(?queues, "メッセージの購読を開始しました");

        Ok(Self {
            supervisor,
            topology,
            consumer,
        })
    }

    pub fn supervisor(&self) -> &Arc<BrokerSupervisor> {
        &self.supervisor
    }

    pub fn topology(&self) -> &Topology {
        self.topology.topology()
    }

    pub fn consumer(&self) -> &Arc<Consumer> {
        &self.consumer
    }

    /// 全ての購読を解除し、ブローカー接続を閉じる
    pub async fn stop(&self) {
        self.consumer.cancel_all().await;
        self.supervisor.shutdown().await;
        tracing::info!("ディスパッチャを停止しました");
    }
}
