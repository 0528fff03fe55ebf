//! # テスト用モック
//!
//! ブローカーとメール送信のインメモリ実装。
//! `test-utils` feature を有効にすることで、他クレートからも利用可能。
//!
//! ```toml
//! [dev-dependencies]
//! courier-infra = { workspace = true, features = ["test-utils"] }
//! ```
//!
//! [`InMemoryBroker`] は direct ルーティングのみを再現する。prefetch は記録するが
//! 配信の制限には使わない。切断時の未 ack メッセージの再配信も行わない。

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use courier_domain::{
    notification::{EmailMessage, NotificationError},
    topology::{Binding, ExchangeKind},
};
use futures_util::{StreamExt as _, stream};
use tokio::sync::{mpsc, watch};
use url::Url;

use crate::{
    broker::{BrokerChannel, BrokerConnector, DeliveryAcker, DeliveryStream, IncomingDelivery},
    error::InfraError,
    notification::NotificationSender,
};

// ===== InMemoryBroker =====

/// インメモリのスタブブローカー
///
/// `Clone` は同じブローカー状態を共有する。[`BrokerConnector`] として
/// スーパーバイザーに渡し、テストからは状態の検査と障害の注入に使う。
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    available:         bool,
    publish_accepts:   bool,
    connect_attempts:  usize,
    declare_calls:     usize,
    prefetch:          Option<u16>,
    exchanges:         Vec<(String, ExchangeKind)>,
    queues:            Vec<QueueState>,
    bindings:          Vec<Binding>,
    channels:          Vec<Arc<watch::Sender<bool>>>,
    next_delivery_tag: u64,
    acked:             Vec<Vec<u8>>,
    rejected:          Vec<Vec<u8>>,
}

struct QueueState {
    name:      String,
    ready:     VecDeque<Vec<u8>>,
    consumers: Vec<ConsumerSlot>,
}

struct ConsumerSlot {
    tag: String,
    tx:  mpsc::UnboundedSender<IncomingDelivery>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available:         true,
                publish_accepts:   true,
                connect_attempts:  0,
                declare_calls:     0,
                prefetch:          None,
                exchanges:         Vec::new(),
                queues:            Vec::new(),
                bindings:          Vec::new(),
                channels:          Vec::new(),
                next_delivery_tag: 0,
                acked:             Vec::new(),
                rejected:          Vec::new(),
            })),
        }
    }

    // ===== 障害の注入 =====

    /// 接続を受け付けるか（`false` で到達不能を模す）
    pub fn set_available(&self, available: bool) {
        self.state.lock().unwrap().available = available;
    }

    /// パブリッシュを送信バッファが受け付けるか
    pub fn set_publish_accepts(&self, accepts: bool) {
        self.state.lock().unwrap().publish_accepts = accepts;
    }

    /// 全ての接続を切断する
    ///
    /// 各チャネルの `closed()` が解決し、配信ストリームが終了する。
    pub fn drop_connections(&self) {
        let mut state = self.state.lock().unwrap();
        for lost in state.channels.drain(..) {
            lost.send_replace(true);
        }
        for queue in &mut state.queues {
            queue.consumers.clear();
        }
    }

    /// キュー削除などでブローカー側から購読が取り消された状態を模す
    ///
    /// チャネルは開いたまま、該当キューの配信ストリームだけが終了する。
    pub fn cancel_consumers(&self, queue: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(target) = state.queues.iter_mut().find(|q| q.name == queue) {
            target.consumers.clear();
        }
    }

    /// ブローカー再起動で宣言が失われた状態を模す
    pub fn reset_topology(&self) {
        let mut state = self.state.lock().unwrap();
        state.exchanges.clear();
        state.queues.clear();
        state.bindings.clear();
    }

    /// プロデューサーとして生のバイト列をパブリッシュする
    ///
    /// 不正な JSON を流し込むテストで使う。ルーティング先がなければ `false`。
    pub fn publish_raw(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> bool {
        let mut state = self.state.lock().unwrap();
        route(&mut state, &self.state, exchange, routing_key, payload) > 0
    }

    // ===== 状態の検査 =====

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().unwrap().connect_attempts
    }

    /// エクスチェンジ / キュー / バインディングの宣言呼び出し回数の合計
    pub fn declare_calls(&self) -> usize {
        self.state.lock().unwrap().declare_calls
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.state.lock().unwrap().prefetch
    }

    pub fn exchanges(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.exchanges.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn queues(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.queues.iter().map(|q| q.name.clone()).collect()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.state.lock().unwrap().bindings.clone()
    }

    /// コンシューマに配信されずにキューに残っているメッセージ
    pub fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .queues
            .iter()
            .find(|q| q.name == queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .queues
            .iter()
            .find(|q| q.name == queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// ack されたメッセージのペイロード
    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().acked.clone()
    }

    /// reject されたメッセージのペイロード
    pub fn rejected(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().rejected.clone()
    }
}

/// direct ルーティングでキューに配る。配った先のキュー数を返す
fn route(
    state: &mut BrokerState,
    shared: &Arc<Mutex<BrokerState>>,
    exchange: &str,
    routing_key: &str,
    payload: &[u8],
) -> usize {
    let targets: Vec<String> = state
        .bindings
        .iter()
        .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
        .map(|b| b.queue.clone())
        .collect();

    for queue in &targets {
        enqueue(state, shared, queue, payload.to_vec());
    }
    targets.len()
}

fn enqueue(
    state: &mut BrokerState,
    shared: &Arc<Mutex<BrokerState>>,
    queue: &str,
    payload: Vec<u8>,
) {
    let Some(position) = state.queues.iter().position(|q| q.name == queue) else {
        return;
    };
    if state.queues[position].consumers.is_empty() {
        state.queues[position].ready.push_back(payload);
        return;
    }

    // 配信タグはコンシューマに渡すメッセージにだけ割り当てる
    state.next_delivery_tag += 1;
    let delivery_tag = state.next_delivery_tag;
    let target = &mut state.queues[position];

    let mut delivery = IncomingDelivery::new(
        delivery_tag,
        payload.clone(),
        InMemoryAcker {
            state: Arc::clone(shared),
            payload,
        },
    );

    // 受信側が閉じたコンシューマは取り除いて次に回す
    loop {
        let Some(slot) = target.consumers.first() else {
            target.ready.push_back(delivery.payload().to_vec());
            return;
        };
        match slot.tx.send(delivery) {
            Ok(()) => break,
            Err(mpsc::error::SendError(returned)) => {
                target.consumers.remove(0);
                delivery = returned;
            }
        }
    }

    // 複数コンシューマ間で順番に配る
    if target.consumers.len() > 1 {
        target.consumers.rotate_left(1);
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self, _url: &Url) -> Result<Arc<dyn BrokerChannel>, InfraError> {
        let mut state = self.state.lock().unwrap();
        state.connect_attempts += 1;
        if !state.available {
            return Err(InfraError::connection("ブローカーに到達できません（スタブ）"));
        }

        let lost = Arc::new(watch::channel(false).0);
        state.channels.push(Arc::clone(&lost));

        Ok(Arc::new(InMemoryChannel {
            broker: self.clone(),
            lost,
        }))
    }
}

struct InMemoryChannel {
    broker: InMemoryBroker,
    lost:   Arc<watch::Sender<bool>>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), InfraError> {
        if *self.lost.borrow() {
            return Err(InfraError::connection("チャネルは閉じられています（スタブ）"));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), InfraError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().unwrap();
        state.declare_calls += 1;

        match state.exchanges.iter().find(|(existing, _)| existing == name) {
            Some((_, existing_kind)) if *existing_kind != kind => Err(InfraError::unexpected(
                format!("PRECONDITION_FAILED - エクスチェンジ {name} の種別が異なります"),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.push((name.to_string(), kind));
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str) -> Result<(), InfraError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().unwrap();
        state.declare_calls += 1;

        if !state.queues.iter().any(|q| q.name == name) {
            state.queues.push(QueueState {
                name:      name.to_string(),
                ready:     VecDeque::new(),
                consumers: Vec::new(),
            });
        }
        Ok(())
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), InfraError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().unwrap();
        state.declare_calls += 1;

        if !state.queues.iter().any(|q| q.name == binding.queue) {
            return Err(InfraError::unexpected(format!(
                "NOT_FOUND - キュー {} が存在しません",
                binding.queue
            )));
        }
        if !state.exchanges.iter().any(|(name, _)| *name == binding.exchange) {
            return Err(InfraError::unexpected(format!(
                "NOT_FOUND - エクスチェンジ {} が存在しません",
                binding.exchange
            )));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), InfraError> {
        self.ensure_open()?;
        self.broker.state.lock().unwrap().prefetch = Some(count);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<bool, InfraError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().unwrap();

        if !state.exchanges.iter().any(|(name, _)| name == exchange) {
            return Err(InfraError::unexpected(format!(
                "NOT_FOUND - エクスチェンジ {exchange} が存在しません"
            )));
        }
        if !state.publish_accepts {
            return Ok(false);
        }

        route(&mut state, &self.broker.state, exchange, routing_key, payload);
        Ok(true)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, InfraError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut state = self.broker.state.lock().unwrap();
            let Some(queue_state) = state.queues.iter_mut().find(|q| q.name == queue) else {
                return Err(InfraError::unexpected(format!(
                    "NOT_FOUND - キュー {queue} が存在しません"
                )));
            };
            queue_state.consumers.push(ConsumerSlot {
                tag: consumer_tag.to_string(),
                tx,
            });

            let ready: Vec<Vec<u8>> = queue_state.ready.drain(..).collect();
            for payload in ready {
                enqueue(&mut state, &self.broker.state, queue, payload);
            }
        }

        let deliveries = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        });
        Ok(deliveries.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), InfraError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().unwrap();
        for queue in &mut state.queues {
            queue.consumers.retain(|slot| slot.tag != consumer_tag);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !*self.lost.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.lost.subscribe();
        let _ = rx.wait_for(|lost| *lost).await;
    }

    async fn close(&self) -> Result<(), InfraError> {
        self.lost.send_replace(true);
        let mut state = self.broker.state.lock().unwrap();
        state.channels.retain(|lost| !Arc::ptr_eq(lost, &self.lost));
        Ok(())
    }
}

struct InMemoryAcker {
    state:   Arc<Mutex<BrokerState>>,
    payload: Vec<u8>,
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(&self) -> Result<(), InfraError> {
        self.state.lock().unwrap().acked.push(self.payload.clone());
        Ok(())
    }

    async fn reject(&self) -> Result<(), InfraError> {
        self.state.lock().unwrap().rejected.push(self.payload.clone());
        Ok(())
    }
}

// ===== MockNotificationSender =====

/// 送信したメールを記録するモック送信
#[derive(Clone, Default)]
pub struct MockNotificationSender {
    sent: Arc<Mutex<Vec<EmailMessage>>>,
    fail: Arc<AtomicBool>,
}

impl MockNotificationSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// 常に送信に失敗するモックを作成する
    pub fn failing() -> Self {
        let sender = Self::default();
        sender.set_failing(true);
        sender
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// 送信されたメール
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSender for MockNotificationSender {
    async fn send_email(&self, email: &EmailMessage) -> Result<(), NotificationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotificationError::SendFailed(
                "SMTP 送信失敗（モック）".to_string(),
            ));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt as _;
    use pretty_assertions::assert_eq;

    use super::*;

    const EXCHANGE: &str = "order-ex";
    const QUEUE: &str = "order-email-queue";
    const ROUTING_KEY: &str = "order-email";

    async fn open_channel(broker: &InMemoryBroker) -> Arc<dyn BrokerChannel> {
        let url = Url::parse("amqp://localhost:5672").unwrap();
        let channel = broker.connect(&url).await.unwrap();
        channel
            .declare_exchange(EXCHANGE, ExchangeKind::Direct)
            .await
            .unwrap();
        channel.declare_queue(QUEUE).await.unwrap();
        channel
            .bind_queue(&Binding {
                queue:       QUEUE.to_string(),
                exchange:    EXCHANGE.to_string(),
                routing_key: ROUTING_KEY.to_string(),
            })
            .await
            .unwrap();
        channel
    }

    #[tokio::test]
    async fn 配信されなかったメッセージは配信タグを消費しない() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;

        // ルーティング先がないメッセージと、コンシューマ不在で滞留するメッセージ
        assert!(!broker.publish_raw(EXCHANGE, "unknown-key", b"lost"));
        assert!(broker.publish_raw(EXCHANGE, ROUTING_KEY, b"first"));
        assert!(broker.publish_raw(EXCHANGE, ROUTING_KEY, b"second"));
        assert_eq!(broker.ready_messages(QUEUE).len(), 2);

        let mut deliveries = channel.consume(QUEUE, "ctag-1").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        let second = deliveries.next().await.unwrap().unwrap();

        assert_eq!(first.payload(), b"first");
        assert_eq!(first.delivery_tag(), 1);
        assert_eq!(second.payload(), b"second");
        assert_eq!(second.delivery_tag(), 2);
        assert!(broker.ready_messages(QUEUE).is_empty());
    }
}
