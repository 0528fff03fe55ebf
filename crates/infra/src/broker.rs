//! # メッセージブローカー
//!
//! AMQP ブローカーとの接続・トポロジー宣言・パブリッシュ・コンシュームを担当する。
//!
//! ## 設計方針
//!
//! - **trait による抽象化**: [`BrokerConnector`] / [`BrokerChannel`] でクライアントを抽象化し、
//!   本番は lapin（[`AmqpConnector`]）、テストはインメモリのスタブブローカーを使う
//! - **接続はスーパーバイザーが所有**: 他のコンポーネントは [`BrokerSupervisor`] から
//!   [`ChannelHandle`] を借りる。ハンドルは世代番号を持ち、再接続のたびに変わる
//! - **1 プロセス 1 チャネル**: パブリッシャーと全コンシューマが同じチャネルを共有する
//!
//! ## 制御フロー
//!
//! ```text
//! BrokerSupervisor::connect
//!        ↓
//! TopologyManager::declare_all   （再接続時は ReconnectHook から再実行）
//!        ↓
//! Consumer::consume × キュー数    （再接続時は ReconnectHook から再登録）
//!        ↓
//! 配信ごとに JSON デコード → ハンドラ → ack / reject（再キューなし）
//! ```

mod amqp;
mod consumer;
mod publisher;
mod supervisor;
mod topology;

use std::{fmt, ops::Deref, sync::Arc};

pub use amqp::AmqpConnector;
use async_trait::async_trait;
pub use consumer::{Consumer, MessageHandler, process_delivery};
use courier_domain::topology::{Binding, ExchangeKind};
use futures_util::stream::BoxStream;
pub use publisher::Publisher;
pub use supervisor::{
    BrokerConfig,
    BrokerSupervisor,
    ConnectionState,
    ReconnectHook,
    SupervisorStatus,
};
pub use topology::TopologyManager;
use url::Url;

use crate::error::InfraError;

/// 配信ストリーム
///
/// ストリームの終了はチャネルの喪失またはコンシューマのキャンセルを意味する。
pub type DeliveryStream = BoxStream<'static, Result<IncomingDelivery, InfraError>>;

/// ブローカーへの接続を確立する
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// 接続とチャネルを確立する
    ///
    /// 到達不能・ハンドシェイク拒否は `Connection` エラー。
    async fn connect(&self, url: &Url) -> Result<Arc<dyn BrokerChannel>, InfraError>;
}

/// ブローカー上の論理チャネル
///
/// 宣言系の操作はすべて冪等（同一引数での再宣言はエラーにならず、重複も作らない）。
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// durable なエクスチェンジを宣言する
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), InfraError>;

    /// durable かつ非 auto-delete のキューを宣言する
    async fn declare_queue(&self, name: &str) -> Result<(), InfraError>;

    /// キューをエクスチェンジにバインドする
    async fn bind_queue(&self, binding: &Binding) -> Result<(), InfraError>;

    /// 未 ack メッセージの上限（prefetch）を設定する
    async fn set_prefetch(&self, count: u16) -> Result<(), InfraError>;

    /// 永続化フラグ付きでパブリッシュする
    ///
    /// 戻り値は送信バッファが受け付けたかどうか（ブローカー側の永続化確認ではない）。
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<bool, InfraError>;

    /// キューの購読を開始する
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, InfraError>;

    /// 購読を解除する
    async fn cancel(&self, consumer_tag: &str) -> Result<(), InfraError>;

    /// チャネルと接続が開いているか
    fn is_open(&self) -> bool;

    /// 接続またはチャネルが失われるまで待つ
    async fn closed(&self);

    /// チャネルと接続を閉じる
    async fn close(&self) -> Result<(), InfraError>;
}

/// 配信メッセージの ack / reject
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), InfraError>;

    /// 再キューせずに reject する
    async fn reject(&self) -> Result<(), InfraError>;
}

/// ブローカーから配信された 1 メッセージ
pub struct IncomingDelivery {
    delivery_tag: u64,
    payload:      Vec<u8>,
    acker:        Box<dyn DeliveryAcker>,
}

impl IncomingDelivery {
    pub fn new(delivery_tag: u64, payload: Vec<u8>, acker: impl DeliveryAcker + 'static) -> Self {
        Self {
            delivery_tag,
            payload,
            acker: Box::new(acker),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub async fn ack(&self) -> Result<(), InfraError> {
        self.acker.ack().await
    }

    pub async fn reject(&self) -> Result<(), InfraError> {
        self.acker.reject().await
    }
}

impl fmt::Debug for IncomingDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// 世代番号付きのチャネルハンドル
///
/// 再接続のたびに世代番号が進む。古いハンドルを保持していないかは
/// [`BrokerSupervisor::is_current`] で確認する。
#[derive(Clone)]
pub struct ChannelHandle {
    generation: u64,
    channel:    Arc<dyn BrokerChannel>,
}

impl ChannelHandle {
    pub(crate) fn new(generation: u64, channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            generation,
            channel,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for ChannelHandle {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("generation", &self.generation)
            .field("open", &self.channel.is_open())
            .finish()
    }
}
