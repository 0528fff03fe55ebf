//! # コンシューマ
//!
//! キューを購読し、配信されたメッセージを JSON デコードしてハンドラに渡す。
//!
//! ## ack ポリシー
//!
//! | 状況 | 結果 |
//! |------|------|
//! | デコード失敗（ポイズンメッセージ） | reject（再キューなし）。ハンドラは呼ばない |
//! | ハンドラ成功 | ack |
//! | ハンドラ失敗 | reject（再キューなし） |
//!
//! 1 つの購読の配信は 1 タスクで逐次処理する。ハンドラが完了するまで次の配信は処理せず、
//! 未 ack のメッセージ数は prefetch で制限される。
//!
//! チャネルが開いたまま配信ストリームが終わった購読（キュー削除などによるブローカー側の取り消し）は
//! 再接続まで張り直されない。[`Consumer::stalled_subscriptions`] で検出できる。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use courier_domain::DeliveryOutcome;
use courier_shared::{
    event_log::{error as error_context, event},
    log_business_event,
};
use futures_util::StreamExt as _;
use serde::de::DeserializeOwned;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::Instrument as _;
use uuid::Uuid;

use super::{BrokerSupervisor, ChannelHandle, DeliveryStream, IncomingDelivery, ReconnectHook};
use crate::error::InfraError;

/// メッセージハンドラ
///
/// デコード済みのメッセージを受け取り、成功か失敗かを返す。
/// 失敗したメッセージは再キューされずに破棄される。
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// デコード先の型
    type Message: DeserializeOwned + Send;
    /// 失敗の理由（ログに出力される）
    type Error: fmt::Display + Send;

    async fn handle(&self, message: Self::Message) -> Result<(), Self::Error>;
}

/// 1 メッセージを処理し、ack するか reject するかを決める
///
/// ブローカーとは独立しているため、ack / reject の判定を単体で検証できる。
pub async fn process_delivery<H>(handler: &H, payload: &[u8]) -> DeliveryOutcome
where
    H: MessageHandler,
{
    let message: H::Message = match serde_json::from_slice(payload) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(
                error.category = error_context::category::INFRASTRUCTURE,
                error.kind = error_context::kind::DECODE,
                payload_len = payload.len(),
                "メッセージをデコードできないため破棄します: {}",
                e
            );
            return DeliveryOutcome::RejectedDiscard;
        }
    };

    match handler.handle(message).await {
        Ok(()) => DeliveryOutcome::Acknowledged,
        Err(e) => {
            tracing::error!(
                error.category = error_context::category::EXTERNAL_SERVICE,
                error.kind = error_context::kind::HANDLER,
                "ハンドラが失敗したためメッセージを破棄します: {}",
                e
            );
            DeliveryOutcome::RejectedDiscard
        }
    }
}

/// ハンドラの型を消去した処理器
#[async_trait]
trait DeliveryProcessor: Send + Sync {
    async fn process(&self, payload: &[u8]) -> DeliveryOutcome;
}

struct HandlerProcessor<H>(Arc<H>);

#[async_trait]
impl<H> DeliveryProcessor for HandlerProcessor<H>
where
    H: MessageHandler,
{
    async fn process(&self, payload: &[u8]) -> DeliveryOutcome {
        process_delivery(self.0.as_ref(), payload).await
    }
}

struct Subscription {
    queue:        String,
    consumer_tag: String,
    processor:    Arc<dyn DeliveryProcessor>,
    /// クライアント側から購読を解除したか
    cancelled:    Arc<AtomicBool>,
    task:         JoinHandle<()>,
}

/// コンシューマ
///
/// キューごとに 1 つの購読を持つ。同じキューへの再登録は既存の購読を置き換える。
/// [`ReconnectHook`] として登録すると、再接続時に全ての購読を新しいチャネルで張り直す。
pub struct Consumer {
    supervisor:    Arc<BrokerSupervisor>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Consumer {
    pub fn new(supervisor: Arc<BrokerSupervisor>) -> Self {
        Self {
            supervisor,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// キューにハンドラを登録する
    ///
    /// 購読を開始したらすぐに戻る。配信はバックグラウンドタスクで処理される。
    #[tracing::instrument(skip(self, handler), level = "debug")]
    pub async fn consume<H>(&self, queue: &str, handler: Arc<H>) -> Result<(), InfraError>
    where
        H: MessageHandler,
    {
        let channel = self.supervisor.channel()?;
        let processor: Arc<dyn DeliveryProcessor> = Arc::new(HandlerProcessor(handler));

        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(index) = subscriptions.iter().position(|s| s.queue == queue) {
            let previous = subscriptions.remove(index);
            stop(&channel, previous).await;
        }

        let subscription = subscribe(&channel, queue, processor).await?;
        subscriptions.push(subscription);
        Ok(())
    }

    /// キューの購読を解除する
    ///
    /// 処理中のメッセージは完了まで処理される。購読がなかった場合は `false`。
    pub async fn cancel(&self, queue: &str) -> bool {
        let mut subscriptions = self.subscriptions.lock().await;
        let Some(index) = subscriptions.iter().position(|s| s.queue == queue) else {
            return false;
        };
        let subscription = subscriptions.remove(index);

        match self.supervisor.channel() {
            Ok(channel) => stop(&channel, subscription).await,
            Err(_) => subscription.task.abort(),
        }
        true
    }

    /// 全ての購読を解除する
    pub async fn cancel_all(&self) {
        let subscriptions: Vec<Subscription> = self.subscriptions.lock().await.drain(..).collect();
        let channel = self.supervisor.channel().ok();

        for subscription in subscriptions {
            match &channel {
                Some(channel) => stop(channel, subscription).await,
                None => subscription.task.abort(),
            }
        }
    }

    /// 購読中のキュー名
    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .await
            .iter()
            .map(|s| s.queue.clone())
            .collect()
    }

    /// 配信ストリームが終了したまま張り直されていない購読のキュー名
    ///
    /// 切断中は全ての購読が該当する。接続中に該当するものは
    /// ブローカー側で購読が取り消されたことを示す。
    pub async fn stalled_subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .await
            .iter()
            .filter(|s| s.task.is_finished())
            .map(|s| s.queue.clone())
            .collect()
    }
}

#[async_trait]
impl ReconnectHook for Consumer {
    async fn on_reconnect(&self, channel: &ChannelHandle) -> Result<(), InfraError> {
        let mut subscriptions = self.subscriptions.lock().await;

        for subscription in subscriptions.iter_mut() {
            // 旧チャネルのストリームは既に終わっている
            subscription.task.abort();
            let renewed =
                subscribe(channel, &subscription.queue, subscription.processor.clone()).await?;
            *subscription = renewed;
        }

        if !subscriptions.is_empty() {
            tracing::info!(
                generation = channel.generation(),
                count = subscriptions.len(),
                "コンシューマを再登録しました"
            );
        }
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        for subscription in self.subscriptions.get_mut().iter() {
            subscription.task.abort();
        }
    }
}

async fn subscribe(
    channel: &ChannelHandle,
    queue: &str,
    processor: Arc<dyn DeliveryProcessor>,
) -> Result<Subscription, InfraError> {
    let consumer_tag = format!("courier.{queue}.{}", Uuid::now_v7());
    let stream = channel.consume(queue, &consumer_tag).await?;
    let cancelled = Arc::new(AtomicBool::new(false));

    let task = tokio::spawn(run_deliveries(
        queue.to_string(),
        channel.clone(),
        stream,
        processor.clone(),
        cancelled.clone(),
    ));

    tracing::debug!(
        queue,
        consumer_tag = %consumer_tag,
        generation = channel.generation(),
        "購読を開始しました"
    );

    Ok(Subscription {
        queue: queue.to_string(),
        consumer_tag,
        processor,
        cancelled,
        task,
    })
}

async fn stop(channel: &ChannelHandle, subscription: Subscription) {
    subscription.cancelled.store(true, Ordering::SeqCst);
    if let Err(e) = channel.cancel(&subscription.consumer_tag).await {
        tracing::warn!(
            queue = %subscription.queue,
            consumer_tag = %subscription.consumer_tag,
            "購読の解除に失敗しました: {}",
            e
        );
        subscription.task.abort();
    }
}

async fn run_deliveries(
    queue: String,
    channel: ChannelHandle,
    mut stream: DeliveryStream,
    processor: Arc<dyn DeliveryProcessor>,
    cancelled: Arc<AtomicBool>,
) {
    let generation = channel.generation();

    while let Some(next) = stream.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                tracing::warn!(
                    error.category = error_context::category::INFRASTRUCTURE,
                    error.kind = error_context::kind::CONNECTION,
                    queue = %queue,
                    "配信ストリームでエラーが発生しました: {}",
                    e
                );
                break;
            }
        };

        let span = tracing::info_span!(
            "delivery",
            queue = %queue,
            delivery_tag = delivery.delivery_tag(),
            generation
        );
        handle_delivery(&queue, &delivery, processor.as_ref())
            .instrument(span)
            .await;
    }

    if channel.is_open() && !cancelled.load(Ordering::SeqCst) {
        tracing::warn!(
            error.category = error_context::category::INFRASTRUCTURE,
            error.kind = error_context::kind::CONSUMER_CANCELLED,
            queue = %queue,
            generation,
            "ブローカーにより購読が取り消されました。再接続まで配信を受け取りません"
        );
    } else {
        tracing::debug!(queue = %queue, generation, "配信ストリームが終了しました");
    }
}

async fn handle_delivery(
    queue: &str,
    delivery: &IncomingDelivery,
    processor: &dyn DeliveryProcessor,
) {
    let outcome = processor.process(delivery.payload()).await;

    let settled = match outcome {
        DeliveryOutcome::Acknowledged => delivery.ack().await,
        DeliveryOutcome::RejectedDiscard => delivery.reject().await,
    };

    if let Err(e) = settled {
        tracing::error!(
            error.category = error_context::category::INFRASTRUCTURE,
            error.kind = error_context::kind::ACKNOWLEDGEMENT,
            outcome = %outcome,
            "ack / reject を送信できませんでした: {}",
            e
        );
        return;
    }

    if outcome.is_acknowledged() {
        log_business_event!(
            event.category = event::category::MESSAGE,
            event.action = event::action::MESSAGE_ACKNOWLEDGED,
            event.result = event::result::SUCCESS,
            message.queue = queue,
            "メッセージを処理しました"
        );
    } else {
        log_business_event!(
            event.category = event::category::MESSAGE,
            event.action = event::action::MESSAGE_REJECTED,
            event.result = event::result::FAILURE,
            message.queue = queue,
            "メッセージを破棄しました"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use courier_domain::topology::{Route, Topology};
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    use super::*;
    use crate::{
        broker::{BrokerConfig, Publisher, TopologyManager},
        mock::InMemoryBroker,
    };

    #[derive(Debug, Deserialize)]
    struct Ping {
        fail: bool,
    }

    #[derive(Default)]
    struct RecordingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        type Message = Ping;
        type Error = String;

        async fn handle(&self, message: Ping) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if message.fail {
                Err("送信失敗".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn ハンドラ成功でacknowledged() {
        let handler = RecordingHandler::default();

        let outcome = process_delivery(&handler, br#"{"fail":false}"#).await;

        assert_eq!(outcome, DeliveryOutcome::Acknowledged);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ハンドラ失敗でrejected_discard() {
        let handler = RecordingHandler::default();

        let outcome = process_delivery(&handler, br#"{"fail":true}"#).await;

        assert_eq!(outcome, DeliveryOutcome::RejectedDiscard);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn 不正なjsonはハンドラを呼ばずにrejected_discard() {
        let handler = RecordingHandler::default();

        let outcome = process_delivery(&handler, b"not json").await;

        assert_eq!(outcome, DeliveryOutcome::RejectedDiscard);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    // ===== ブローカー経由 =====

    const QUEUE: &str = "order-email-queue";

    async fn setup(broker: &InMemoryBroker) -> (Arc<BrokerSupervisor>, Arc<TopologyManager>) {
        let supervisor = BrokerSupervisor::new(
            Arc::new(broker.clone()),
            BrokerConfig::new("amqp://localhost")
                .with_reconnect(Duration::from_millis(5), 3),
        );
        supervisor.connect().await.unwrap();
        let topology = Arc::new(TopologyManager::new(
            supervisor.clone(),
            Topology::new().with_route(Route::order_email("order-ex")),
        ));
        topology.declare_all().await.unwrap();
        (supervisor, topology)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn 配信されたメッセージをackとrejectに振り分ける() {
        let broker = InMemoryBroker::new();
        let (supervisor, _topology) = setup(&broker).await;
        let consumer = Consumer::new(supervisor.clone());
        let handler = Arc::new(RecordingHandler::default());
        consumer.consume(QUEUE, handler.clone()).await.unwrap();

        broker.publish_raw("order-ex", "order-email", br#"{"fail":false}"#);
        broker.publish_raw("order-ex", "order-email", br#"{"fail":true}"#);
        broker.publish_raw("order-ex", "order-email", b"{broken");
        wait_until(|| broker.acked().len() + broker.rejected().len() == 3).await;

        assert_eq!(broker.acked(), vec![br#"{"fail":false}"#.to_vec()]);
        assert_eq!(broker.rejected().len(), 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn 同じキューへの再登録は購読を置き換える() {
        let broker = InMemoryBroker::new();
        let (supervisor, _topology) = setup(&broker).await;
        let consumer = Consumer::new(supervisor);
        let first = Arc::new(RecordingHandler::default());
        let second = Arc::new(RecordingHandler::default());

        consumer.consume(QUEUE, first.clone()).await.unwrap();
        consumer.consume(QUEUE, second.clone()).await.unwrap();
        broker.publish_raw("order-ex", "order-email", br#"{"fail":false}"#);
        wait_until(|| broker.acked().len() == 1).await;

        assert_eq!(consumer.subscriptions().await, vec![QUEUE.to_string()]);
        assert_eq!(broker.consumer_count(QUEUE), 1);
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn 登録前にキューに溜まったメッセージも処理する() {
        let broker = InMemoryBroker::new();
        let (supervisor, _topology) = setup(&broker).await;
        let publisher = Publisher::new(supervisor.clone());
        publisher
            .publish("order-ex", "order-email", &serde_json::json!({ "fail": false }))
            .await
            .unwrap();

        let consumer = Consumer::new(supervisor);
        consumer
            .consume(QUEUE, Arc::new(RecordingHandler::default()))
            .await
            .unwrap();
        wait_until(|| broker.acked().len() == 1).await;

        assert!(broker.ready_messages(QUEUE).is_empty());
    }

    #[tokio::test]
    async fn cancel後は配信されない() {
        let broker = InMemoryBroker::new();
        let (supervisor, _topology) = setup(&broker).await;
        let consumer = Consumer::new(supervisor);
        let handler = Arc::new(RecordingHandler::default());
        consumer.consume(QUEUE, handler.clone()).await.unwrap();

        assert!(consumer.cancel(QUEUE).await);
        assert!(!consumer.cancel(QUEUE).await);
        broker.publish_raw("order-ex", "order-email", br#"{"fail":false}"#);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(broker.ready_messages(QUEUE).len(), 1);
        assert!(consumer.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn ブローカー側で取り消された購読は停止中として報告される() {
        let broker = InMemoryBroker::new();
        let (supervisor, _topology) = setup(&broker).await;
        let consumer = Consumer::new(supervisor.clone());
        consumer
            .consume(QUEUE, Arc::new(RecordingHandler::default()))
            .await
            .unwrap();
        assert!(consumer.stalled_subscriptions().await.is_empty());

        broker.cancel_consumers(QUEUE);
        tokio::time::timeout(Duration::from_secs(5), async {
            while consumer.stalled_subscriptions().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        assert!(supervisor.status().is_connected());
        assert_eq!(consumer.stalled_subscriptions().await, vec![QUEUE.to_string()]);
        assert_eq!(consumer.subscriptions().await, vec![QUEUE.to_string()]);
    }

    #[tokio::test]
    async fn 再登録すると停止中の購読は解消される() {
        let broker = InMemoryBroker::new();
        let (supervisor, _topology) = setup(&broker).await;
        let consumer = Consumer::new(supervisor);
        let handler = Arc::new(RecordingHandler::default());
        consumer.consume(QUEUE, handler.clone()).await.unwrap();
        broker.cancel_consumers(QUEUE);
        tokio::time::sleep(Duration::from_millis(20)).await;

        consumer.consume(QUEUE, handler.clone()).await.unwrap();
        broker.publish_raw("order-ex", "order-email", br#"{"fail":false}"#);
        wait_until(|| broker.acked().len() == 1).await;

        assert!(consumer.stalled_subscriptions().await.is_empty());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn 再接続後も新しいチャネルで配信を受け取る() {
        let broker = InMemoryBroker::new();
        let (supervisor, topology) = setup(&broker).await;
        let consumer = Arc::new(Consumer::new(supervisor.clone()));
        supervisor.register_hook(&topology);
        supervisor.register_hook(&consumer);
        let handler = Arc::new(RecordingHandler::default());
        consumer.consume(QUEUE, handler.clone()).await.unwrap();

        broker.drop_connections();
        wait_until(|| supervisor.status().generation == 2).await;
        broker.publish_raw("order-ex", "order-email", br#"{"fail":false}"#);
        wait_until(|| broker.acked().len() == 1).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.consumer_count(QUEUE), 1);
    }
}
