//! # 認証メールハンドラ
//!
//! `auth-email-queue` のメッセージを処理する。
//!
//! ## 設計方針
//!
//! - **種別の検証**: `type` が `EMAIL_VERIFY` 以外のメッセージは送信せずに成功扱い（ack）とする
//! - **確認リンクの注入**: `<CLIENT_URL>/verify-email?token=<token>` を
//!   レンダリングコンテキストの `verifyLink` に追加する。トークンはパーセントエンコードする
//! - **エンベロープは変更しない**: リンクを追加した派生コピーで送信する

use std::sync::Arc;

use async_trait::async_trait;
use courier_domain::{EmailEnvelope, NotificationError, envelope::message_type};
use courier_infra::broker::MessageHandler;
use courier_shared::{event_log::event, log_business_event};

use crate::usecase::notification::NotificationService;

/// 確認リンクを格納するコンテキストキー
pub const VERIFY_LINK_KEY: &str = "verifyLink";

/// 認証メールハンドラ
pub struct AuthEmailHandler {
    service:    Arc<NotificationService>,
    client_url: String,
}

impl AuthEmailHandler {
    pub fn new(service: Arc<NotificationService>, client_url: impl Into<String>) -> Self {
        Self {
            service,
            client_url: client_url.into(),
        }
    }

    /// 確認リンクを組み立てる
    fn verify_link(&self, token: &str) -> String {
        format!(
            "{}/verify-email?token={}",
            self.client_url.trim_end_matches('/'),
            urlencoding::encode(token)
        )
    }
}

#[async_trait]
impl MessageHandler for AuthEmailHandler {
    type Message = EmailEnvelope;
    type Error = NotificationError;

    #[tracing::instrument(skip_all, fields(message_type = message.kind.as_deref().unwrap_or("-")))]
    async fn handle(&self, message: EmailEnvelope) -> Result<(), NotificationError> {
        if !message.is_kind(message_type::EMAIL_VERIFY) {
            tracing::warn!(
                expected = message_type::EMAIL_VERIFY,
                "未対応のメッセージ種別のため送信をスキップします"
            );
            log_business_event!(
                event.category = event::category::NOTIFICATION,
                event.action = event::action::NOTIFICATION_SKIPPED,
                event.result = event::result::SUCCESS,
                notification.recipient = %message.to,
                "認証メールの送信をスキップ"
            );
            return Ok(());
        }

        let token = message
            .email_verification_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                NotificationError::InvalidEnvelope(
                    "emailVerificationToken がありません".to_string(),
                )
            })?;

        let enriched = message.with_data(VERIFY_LINK_KEY, self.verify_link(token));
        self.service.deliver(&enriched).await
    }
}
