//! # メッセージエンベロープ
//!
//! キューを流れる「メールを送信せよ」という作業単位を定義する。
//!
//! ## ワイヤ形式
//!
//! UTF-8 の JSON。プロデューサーはキャメルケースのフィールド名で送信する:
//!
//! ```json
//! {
//!   "to": "a@example.com",
//!   "subject": "件名",
//!   "html": "<p>本文</p>",
//!   "template": "verify",
//!   "data": { "username": "alice" },
//!   "type": "EMAIL_VERIFY",
//!   "emailVerificationToken": "tok123"
//! }
//! ```
//!
//! ## 不変条件
//!
//! - `template` が指定されていれば `subject` / `html` より優先される
//! - `template` が空文字列の場合は未指定として扱う
//! - エンベロープは変更しない。ハンドラ固有の値は [`EmailEnvelope::with_data`]
//!   で派生コピーに載せる

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::notification::NotificationError;

/// `type` フィールドの既知の値
pub mod message_type {
    /// メールアドレス確認メール
    pub const EMAIL_VERIFY: &str = "EMAIL_VERIFY";
}

/// メッセージエンベロープ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailEnvelope {
    /// 宛先メールアドレス
    pub to: String,
    /// 件名（`template` 未指定時に必須）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// HTML 本文（`template` 未指定時に必須）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    /// テンプレート名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// テンプレートのレンダリングコンテキスト
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    /// メッセージ種別（例: `EMAIL_VERIFY`）
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// メールアドレス確認トークン（認証メール用）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verification_token: Option<String>,
}

/// 本文の生成元
///
/// [`EmailEnvelope::content_source`] で決定する。
#[derive(Debug, Clone, PartialEq)]
pub enum ContentSource {
    /// テンプレート名とレンダリングコンテキスト
    Template {
        name: String,
        data: Map<String, Value>,
    },
    /// エンベロープに直接指定された件名と本文
    Raw { subject: String, html: String },
}

impl EmailEnvelope {
    /// 件名と本文を直接指定したエンベロープを作成する
    pub fn raw(to: impl Into<String>, subject: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            to:                       to.into(),
            subject:                  Some(subject.into()),
            html:                     Some(html.into()),
            template:                 None,
            data:                     None,
            kind:                     None,
            email_verification_token: None,
        }
    }

    /// テンプレートを指定したエンベロープを作成する
    pub fn templated(
        to: impl Into<String>,
        template: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            to:                       to.into(),
            subject:                  None,
            html:                     None,
            template:                 Some(template.into()),
            data:                     Some(data),
            kind:                     None,
            email_verification_token: None,
        }
    }

    /// 有効なテンプレート名を返す（空文字列は未指定扱い）
    pub fn template_name(&self) -> Option<&str> {
        self.template.as_deref().filter(|name| !name.is_empty())
    }

    /// 本文の生成元を決定する
    ///
    /// `template` が優先される。`template` がなく `subject` / `html` の
    /// どちらかが欠けている場合は [`NotificationError::InvalidEnvelope`]。
    pub fn content_source(&self) -> Result<ContentSource, NotificationError> {
        if let Some(name) = self.template_name() {
            return Ok(ContentSource::Template {
                name: name.to_string(),
                data: self.data.clone().unwrap_or_default(),
            });
        }

        match (&self.subject, &self.html) {
            (Some(subject), Some(html)) => Ok(ContentSource::Raw {
                subject: subject.clone(),
                html:    html.clone(),
            }),
            _ => Err(NotificationError::InvalidEnvelope(
                "template がない場合は subject と html が必要です".to_string(),
            )),
        }
    }

    /// レンダリングコンテキストに値を追加した派生コピーを返す
    ///
    /// `self` は変更しない。同じキーが既にあれば上書きする。
    pub fn with_data(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut enriched = self.clone();
        enriched
            .data
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        enriched
    }

    /// メッセージ種別が一致するか
    pub fn is_kind(&self, expected: &str) -> bool {
        self.kind.as_deref() == Some(expected)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn キャメルケースのjsonからデシリアライズできる() {
        let body = json!({
            "to": "a@example.com",
            "template": "verify",
            "data": { "username": "alice" },
            "type": "EMAIL_VERIFY",
            "emailVerificationToken": "tok123"
        });

        let envelope: EmailEnvelope = serde_json::from_value(body).unwrap();

        assert_eq!(envelope.to, "a@example.com");
        assert_eq!(envelope.template.as_deref(), Some("verify"));
        assert_eq!(envelope.kind.as_deref(), Some("EMAIL_VERIFY"));
        assert_eq!(envelope.email_verification_token.as_deref(), Some("tok123"));
        assert!(envelope.subject.is_none());
    }

    #[test]
    fn toがないjsonはデシリアライズに失敗する() {
        let body = json!({ "subject": "S", "html": "<p>H</p>" });

        let result = serde_json::from_value::<EmailEnvelope>(body);

        assert!(result.is_err());
    }

    #[test]
    fn templateなしの場合はsubjectとhtmlをそのまま使う() {
        let envelope = EmailEnvelope::raw("a@x.com", "S", "<p>H</p>");

        let source = envelope.content_source().unwrap();

        assert_eq!(
            source,
            ContentSource::Raw {
                subject: "S".to_string(),
                html:    "<p>H</p>".to_string(),
            }
        );
    }

    #[test]
    fn templateはsubjectとhtmlより優先される() {
        let mut envelope = EmailEnvelope::raw("a@x.com", "S", "<p>H</p>");
        envelope.template = Some("verify".to_string());

        let source = envelope.content_source().unwrap();

        assert_eq!(
            source,
            ContentSource::Template {
                name: "verify".to_string(),
                data: Map::new(),
            }
        );
    }

    #[test]
    fn 空文字列のtemplateは未指定として扱う() {
        let mut envelope = EmailEnvelope::raw("a@x.com", "S", "<p>H</p>");
        envelope.template = Some(String::new());

        assert!(envelope.template_name().is_none());
        assert!(matches!(
            envelope.content_source().unwrap(),
            ContentSource::Raw { .. }
        ));
    }

    #[test]
    fn templateもhtmlもない場合はinvalid_envelope() {
        let mut envelope = EmailEnvelope::raw("a@x.com", "S", "");
        envelope.html = None;

        let result = envelope.content_source();

        assert!(matches!(result, Err(NotificationError::InvalidEnvelope(_))));
    }

    #[test]
    fn with_dataは元のエンベロープを変更しない() {
        let original = EmailEnvelope::templated("a@x.com", "verify", Map::new());

        let enriched = original.with_data("verifyLink", "http://localhost/verify-email?token=t");

        assert_eq!(original.data, Some(Map::new()));
        assert_eq!(
            enriched.data.unwrap().get("verifyLink"),
            Some(&json!("http://localhost/verify-email?token=t"))
        );
    }

    #[test]
    fn dataがない場合もwith_dataでコンテキストが作られる() {
        let original = EmailEnvelope::raw("a@x.com", "S", "<p>H</p>");

        let enriched = original.with_data("key", 1);

        assert!(original.data.is_none());
        assert_eq!(enriched.data.unwrap().get("key"), Some(&json!(1)));
    }

    #[test]
    fn シリアライズで未指定のフィールドは出力されない() {
        let envelope = EmailEnvelope::raw("a@x.com", "S", "<p>H</p>");

        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(
            json,
            json!({ "to": "a@x.com", "subject": "S", "html": "<p>H</p>" })
        );
    }
}
