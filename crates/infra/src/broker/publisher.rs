//! パブリッシャー
//!
//! ペイロードを JSON にシリアライズし、永続化フラグ付きでエクスチェンジに送る。

use std::sync::Arc;

use serde::Serialize;

use super::BrokerSupervisor;
use crate::error::InfraError;

/// パブリッシャー
#[derive(Clone)]
pub struct Publisher {
    supervisor: Arc<BrokerSupervisor>,
}

impl Publisher {
    pub fn new(supervisor: Arc<BrokerSupervisor>) -> Self {
        Self { supervisor }
    }

    /// メッセージをパブリッシュする
    ///
    /// 戻り値は送信バッファが受け付けたか（`false` はバックプレッシャー）。
    /// ブローカー側での永続化は保証しない。
    ///
    /// シリアライズできない場合は `Serialization`、切断中は `ChannelUnavailable`。
    #[tracing::instrument(skip(self, payload), level = "debug")]
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<bool, InfraError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let body = serde_json::to_vec(payload)?;
        let channel = self.supervisor.channel()?;

        let accepted = channel.publish(exchange, routing_key, &body).await?;
        if !accepted {
            tracing::warn!(
                exchange,
                routing_key,
                "送信バッファが満杯のためメッセージが受け付けられませんでした"
            );
        }
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use courier_domain::{
        EmailEnvelope,
        topology::{Route, Topology},
    };
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        broker::{BrokerConfig, TopologyManager},
        error::InfraErrorKind,
        mock::InMemoryBroker,
    };

    async fn connected(broker: &InMemoryBroker) -> Arc<BrokerSupervisor> {
        let supervisor = BrokerSupervisor::new(
            Arc::new(broker.clone()),
            BrokerConfig::new("amqp://localhost")
                .with_reconnect(Duration::from_millis(5), 3),
        );
        supervisor.connect().await.unwrap();
        TopologyManager::new(
            supervisor.clone(),
            Topology::new().with_route(Route::order_email("order-ex")),
        )
        .declare_all()
        .await
        .unwrap();
        supervisor
    }

    #[tokio::test]
    async fn publishしたメッセージがバインドされたキューに入る() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(connected(&broker).await);
        let envelope = EmailEnvelope::raw("a@x.com", "S", "<p>H</p>");

        let accepted = publisher
            .publish("order-ex", "order-email", &envelope)
            .await
            .unwrap();

        assert!(accepted);
        let ready = broker.ready_messages("order-email-queue");
        assert_eq!(ready.len(), 1);
        let decoded: EmailEnvelope = serde_json::from_slice(&ready[0]).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[tokio::test]
    async fn 送信バッファが満杯ならfalseを返す() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(connected(&broker).await);
        broker.set_publish_accepts(false);

        let accepted = publisher
            .publish("order-ex", "order-email", &EmailEnvelope::raw("a@x.com", "S", "H"))
            .await
            .unwrap();

        assert!(!accepted);
    }

    #[tokio::test]
    async fn 切断中はchannel_unavailable() {
        let broker = InMemoryBroker::new();
        let supervisor = BrokerSupervisor::new(
            Arc::new(broker.clone()),
            BrokerConfig::new("amqp://localhost"),
        );
        let publisher = Publisher::new(supervisor);

        let err = publisher
            .publish("order-ex", "order-email", &EmailEnvelope::raw("a@x.com", "S", "H"))
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), InfraErrorKind::ChannelUnavailable));
    }

    #[tokio::test]
    async fn シリアライズできないペイロードはserializationエラー() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(connected(&broker).await);
        // JSON のオブジェクトキーは文字列でなければならない
        let mut payload = BTreeMap::new();
        payload.insert((1, 2), "value");

        let err = publisher
            .publish("order-ex", "order-email", &payload)
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), InfraErrorKind::Serialization(_)));
        assert!(broker.ready_messages("order-email-queue").is_empty());
    }
}
