//! lapin による AMQP 実装
//!
//! 1 接続につき 1 チャネルを開き、[`BrokerChannel`] として公開する。
//! 接続・チャネルのエラー通知は `watch` チャネルで [`BrokerChannel::closed`] に伝える。

use std::sync::Arc;

use async_trait::async_trait;
use courier_domain::topology::{Binding, ExchangeKind};
use futures_util::StreamExt as _;
use lapin::{
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    acker::Acker,
    options::{
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        BasicQosOptions,
        BasicRejectOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
};
use tokio::sync::watch;
use url::Url;

use super::{BrokerChannel, BrokerConnector, DeliveryAcker, DeliveryStream, IncomingDelivery};
use crate::error::InfraError;

/// AMQP の delivery-mode: 永続化
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// lapin でブローカーに接続するコネクタ
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, url: &Url) -> Result<Arc<dyn BrokerChannel>, InfraError> {
        let connection = Connection::connect(url.as_str(), ConnectionProperties::default())
            .await
            .map_err(|e| InfraError::connection(format!("ブローカーに接続できません: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| InfraError::connection(format!("チャネルを作成できません: {e}")))?;

        let lost = Arc::new(watch::channel(false).0);

        let on_connection_error = Arc::clone(&lost);
        connection.on_error(move |e| {
            tracing::warn!(error = %e, "AMQP 接続エラー");
            on_connection_error.send_replace(true);
        });

        let on_channel_error = Arc::clone(&lost);
        channel.on_error(move |e| {
            tracing::warn!(error = %e, "AMQP チャネルエラー");
            on_channel_error.send_replace(true);
        });

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            lost,
        }))
    }
}

/// lapin の接続とチャネルの組
struct AmqpChannel {
    connection: Connection,
    channel:    Channel,
    lost:       Arc<watch::Sender<bool>>,
}

fn to_lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), InfraError> {
        self.channel
            .exchange_declare(
                name,
                to_lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), InfraError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), InfraError> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), InfraError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<bool, InfraError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_content_type("application/json".into());

        // publisher confirms は有効にしていないため、confirm は待たない
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?;

        Ok(true)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, InfraError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(|delivery| {
                    IncomingDelivery::new(
                        delivery.delivery_tag,
                        delivery.data,
                        AmqpAcker(delivery.acker),
                    )
                })
                .map_err(InfraError::from)
        });

        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), InfraError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        !*self.lost.borrow()
            && self.connection.status().connected()
            && self.channel.status().connected()
    }

    async fn closed(&self) {
        let mut rx = self.lost.subscribe();
        let _ = rx.wait_for(|lost| *lost).await;
    }

    async fn close(&self) -> Result<(), InfraError> {
        self.lost.send_replace(true);
        if self.channel.status().connected() {
            self.channel.close(200, "OK").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(200, "OK").await?;
        }
        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> Result<(), InfraError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self) -> Result<(), InfraError> {
        self.0.reject(BasicRejectOptions { requeue: false }).await?;
        Ok(())
    }
}
