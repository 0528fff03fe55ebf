//! # トポロジー管理
//!
//! エクスチェンジ / キュー / バインディングを冪等に宣言する。
//! 再接続のたびに [`ReconnectHook`] として同じトポロジーを再宣言する。

use std::sync::Arc;

use async_trait::async_trait;
use courier_domain::topology::{Binding, ExchangeKind, Topology};

use super::{BrokerSupervisor, ChannelHandle, ReconnectHook};
use crate::error::InfraError;

/// トポロジー管理
pub struct TopologyManager {
    supervisor: Arc<BrokerSupervisor>,
    topology:   Topology,
}

impl TopologyManager {
    pub fn new(supervisor: Arc<BrokerSupervisor>, topology: Topology) -> Self {
        Self {
            supervisor,
            topology,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// durable なエクスチェンジを宣言する
    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), InfraError> {
        let channel = self.current_channel()?;
        declare_exchange_on(&channel, name, kind).await
    }

    /// durable かつ非 auto-delete のキューを宣言する
    pub async fn declare_queue(&self, name: &str) -> Result<(), InfraError> {
        let channel = self.current_channel()?;
        declare_queue_on(&channel, name).await
    }

    /// キューをエクスチェンジにバインドする
    pub async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), InfraError> {
        let channel = self.current_channel()?;
        let binding = Binding {
            queue:       queue.to_string(),
            exchange:    exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        bind_on(&channel, &binding).await
    }

    /// 保持しているトポロジーを全て宣言する
    #[tracing::instrument(skip_all, level = "debug")]
    pub async fn declare_all(&self) -> Result<(), InfraError> {
        let channel = self.current_channel()?;
        self.declare_all_on(&channel).await
    }

    async fn declare_all_on(&self, channel: &ChannelHandle) -> Result<(), InfraError> {
        for (name, kind) in self.topology.exchanges() {
            declare_exchange_on(channel, name, kind).await?;
        }
        for queue in self.topology.queues() {
            declare_queue_on(channel, queue).await?;
        }
        for binding in self.topology.bindings() {
            bind_on(channel, &binding).await?;
        }

        tracing::info!(
            generation = channel.generation(),
            routes = self.topology.routes().len(),
            "トポロジーを宣言しました"
        );
        Ok(())
    }

    fn current_channel(&self) -> Result<ChannelHandle, InfraError> {
        self.supervisor
            .channel()
            .map_err(|e| InfraError::topology(format!("チャネルが利用できません: {e}")))
    }
}

#[async_trait]
impl ReconnectHook for TopologyManager {
    async fn on_reconnect(&self, channel: &ChannelHandle) -> Result<(), InfraError> {
        self.declare_all_on(channel).await
    }
}

fn ensure_named(entity: &str, name: &str) -> Result<(), InfraError> {
    if name.trim().is_empty() {
        return Err(InfraError::topology(format!("{entity}名が空です")));
    }
    Ok(())
}

async fn declare_exchange_on(
    channel: &ChannelHandle,
    name: &str,
    kind: ExchangeKind,
) -> Result<(), InfraError> {
    ensure_named("エクスチェンジ", name)?;
    channel
        .declare_exchange(name, kind)
        .await
        .map_err(|e| InfraError::topology(format!("エクスチェンジ {name} の宣言に失敗: {e}")))
}

async fn declare_queue_on(channel: &ChannelHandle, name: &str) -> Result<(), InfraError> {
    ensure_named("キュー", name)?;
    channel
        .declare_queue(name)
        .await
        .map_err(|e| InfraError::topology(format!("キュー {name} の宣言に失敗: {e}")))
}

async fn bind_on(channel: &ChannelHandle, binding: &Binding) -> Result<(), InfraError> {
    ensure_named("キュー", &binding.queue)?;
    ensure_named("エクスチェンジ", &binding.exchange)?;
    ensure_named("ルーティングキー", &binding.routing_key)?;
    channel.bind_queue(binding).await.map_err(|e| {
        InfraError::topology(format!(
            "バインディング {} → {} ({}) に失敗: {e}",
            binding.exchange, binding.queue, binding.routing_key
        ))
    })
}
