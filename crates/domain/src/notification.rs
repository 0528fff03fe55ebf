//! # 通知
//!
//! メール通知のレンダリング結果と送信メッセージ、メッセージ単位のエラーを定義する。
//!
//! ## 設計方針
//!
//! - **メッセージ単位のエラー**: [`NotificationError`] はいずれもプロセスを止めない。
//!   コンシューマ境界で reject（再キューなし）に変換される
//! - **送信元は設定値**: `from` はエンベロープではなくサービス設定から与える

use thiserror::Error;

/// テンプレートの件名が得られなかった場合の既定の件名
pub const DEFAULT_SUBJECT: &str = "Notification";

/// 通知処理エラー
#[derive(Debug, Error)]
pub enum NotificationError {
    /// エンベロープの内容が不正
    #[error("エンベロープが不正です: {0}")]
    InvalidEnvelope(String),

    /// テンプレートがテンプレートストアに存在しない
    #[error("テンプレートが見つかりません: {0}")]
    TemplateNotFound(String),

    /// テンプレートレンダリングに失敗
    #[error("テンプレートレンダリングに失敗: {0}")]
    TemplateFailed(String),

    /// メール送信に失敗
    #[error("メール送信に失敗: {0}")]
    SendFailed(String),
}

/// 件名と HTML 本文の組
///
/// コンテンツリゾルバの出力。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    /// 件名
    pub subject: String,
    /// HTML 本文
    pub html:    String,
}

impl RenderedContent {
    pub fn new(subject: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            html:    html.into(),
        }
    }
}

/// メールメッセージ
///
/// メール送信トランスポートに渡される。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    /// 送信元メールアドレス
    pub from:      String,
    /// 送信先メールアドレス
    pub to:        String,
    /// 件名
    pub subject:   String,
    /// HTML 本文
    pub html_body: String,
}

impl EmailMessage {
    /// レンダリング結果から送信メッセージを組み立てる
    pub fn new(from: impl Into<String>, to: impl Into<String>, content: RenderedContent) -> Self {
        Self {
            from:      from.into(),
            to:        to.into(),
            subject:   content.subject,
            html_body: content.html,
        }
    }
}
