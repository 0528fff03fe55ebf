//! # 通知サービス
//!
//! コンテンツ解決 → メール送信 → ビジネスイベント記録を統合するサービス。
//!
//! ## 設計方針
//!
//! - **失敗は呼び出し元へ返す**: 送信に失敗したメッセージはコンシューマ境界で reject する
//! - **依存性注入**: `NotificationSender` と `TemplateRenderer` は trait で抽象化
//! - **送信元は固定**: 送信元アドレスは設定値（`SENDER_EMAIL`）を使う

use std::sync::Arc;

use courier_domain::{EmailEnvelope, EmailMessage, NotificationError};
use courier_infra::notification::NotificationSender;
use courier_shared::{
    event_log::{error as error_context, event},
    log_business_event,
};

use super::ContentResolver;

/// 通知サービス
pub struct NotificationService {
    sender:       Arc<dyn NotificationSender>,
    resolver:     ContentResolver,
    from_address: String,
}

impl NotificationService {
    pub fn new(
        sender: Arc<dyn NotificationSender>,
        resolver: ContentResolver,
        from_address: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            resolver,
            from_address: from_address.into(),
        }
    }

    /// エンベロープの内容でメールを 1 通送信する
    pub async fn deliver(&self, envelope: &EmailEnvelope) -> Result<(), NotificationError> {
        let template = envelope.template_name().unwrap_or("-");

        let content = match self.resolver.resolve(envelope) {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(
                    error.category = error_context::category::EXTERNAL_SERVICE,
                    error.kind = error_context::kind::TEMPLATE,
                    notification.template = template,
                    "メール本文の決定に失敗: {}",
                    e
                );
                return Err(e);
            }
        };

        let email = EmailMessage::new(&self.from_address, &envelope.to, content);

        match self.sender.send_email(&email).await {
            Ok(()) => {
                log_business_event!(
                    event.category = event::category::NOTIFICATION,
                    event.action = event::action::NOTIFICATION_SENT,
                    event.result = event::result::SUCCESS,
                    notification.template = template,
                    notification.recipient = %email.to,
                    "通知メール送信成功"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    error.category = error_context::category::EXTERNAL_SERVICE,
                    error.kind = error_context::kind::MAIL_TRANSPORT,
                    notification.recipient = %email.to,
                    "通知メール送信失敗: {}",
                    e
                );
                log_business_event!(
                    event.category = event::category::NOTIFICATION,
                    event.action = event::action::NOTIFICATION_FAILED,
                    event.result = event::result::FAILURE,
                    notification.template = template,
                    notification.recipient = %email.to,
                    "通知メール送信失敗"
                );
                Err(e)
            }
        }
    }
}
