//! # 注文メールハンドラ
//!
//! `order-email-queue` のメッセージをそのまま通知サービスに渡す。

use std::sync::Arc;

use async_trait::async_trait;
use courier_domain::{EmailEnvelope, NotificationError};
use courier_infra::broker::MessageHandler;

use crate::usecase::notification::NotificationService;

/// 注文メールハンドラ
pub struct OrderEmailHandler {
    service: Arc<NotificationService>,
}

impl OrderEmailHandler {
    pub fn new(service: Arc<NotificationService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl MessageHandler for OrderEmailHandler {
    type Message = EmailEnvelope;
    type Error = NotificationError;

    #[tracing::instrument(skip_all, fields(template = message.template_name().unwrap_or("-")))]
    async fn handle(&self, message: EmailEnvelope) -> Result<(), NotificationError> {
        self.service.deliver(&message).await
    }
}
