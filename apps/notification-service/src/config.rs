//! # Notification Service 設定
//!
//! 環境変数から Notification Service の設定を読み込む。
//!
//! 数値として解釈できない値（`BROKER_PREFETCH=0` を含む）は警告を出して既定値にフォールバックする。
//! `RABBITMQ_ENDPOINT` の未設定はここではエラーにせず、接続時に
//! `Configuration` エラーとして扱う。

use std::{env, num::NonZeroU16, path::PathBuf, str::FromStr, time::Duration};

use courier_domain::topology::{DEFAULT_AUTH_EMAIL_EXCHANGE, DEFAULT_ORDER_EMAIL_EXCHANGE};
use courier_infra::{broker::BrokerConfig, notification::SmtpCredentials};

/// 既定の HTTP ポート
const DEFAULT_PORT: u16 = 4101;

/// Notification Service の設定
#[derive(Debug, Clone)]
pub struct NotificationServiceConfig {
    /// バインドアドレス
    pub host:           String,
    /// ポート番号
    pub port:           u16,
    /// ブローカー設定
    pub broker:         BrokerConfig,
    /// 認証メールのエクスチェンジ名
    pub auth_exchange:  String,
    /// 注文メールのエクスチェンジ名
    pub order_exchange: String,
    /// メール送信設定
    pub mail:           MailConfig,
    /// テンプレートストアのルートディレクトリ
    pub templates_dir:  PathBuf,
}

/// メール送信の設定
///
/// `NOTIFICATION_BACKEND` 環境変数で送信バックエンドを切り替える:
/// - `smtp`: Mailpit（開発）/ SMTP サーバー経由で送信
/// - `noop`: 送信しない（ログ出力のみ）
#[derive(Debug, Clone)]
pub struct MailConfig {
    /// 送信バックエンド（"smtp" | "noop"）
    pub backend:          String,
    /// SMTP ホスト（backend=smtp の場合に使用）
    pub smtp_host:        String,
    /// SMTP ポート（backend=smtp の場合に使用）
    pub smtp_port:        u16,
    /// SMTP 認証情報（ユーザー名とパスワードの両方が設定された場合のみ）
    pub smtp_credentials: Option<SmtpCredentials>,
    /// 送信元メールアドレス
    pub sender_email:     String,
    /// フロントエンド URL（確認メール内リンク用）
    pub client_url:       String,
}

impl NotificationServiceConfig {
    /// 環境変数から設定を読み込む
    pub fn from_env() -> Self {
        let broker = BrokerConfig {
            url:                    env::var("RABBITMQ_ENDPOINT").ok(),
            // 0 は無制限を意味するため受け付けない
            prefetch:               parse_or("BROKER_PREFETCH", NonZeroU16::MIN).get(),
            reconnect_delay:        Duration::from_millis(parse_or(
                "BROKER_RECONNECT_DELAY_MS",
                5_000,
            )),
            max_reconnect_attempts: parse_or("BROKER_MAX_RECONNECT_ATTEMPTS", 10),
        };

        Self {
            host: env::var("NOTIFICATION_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_or("NOTIFICATION_PORT", DEFAULT_PORT),
            broker,
            auth_exchange: env::var("AUTH_EMAIL_EXCHANGE")
                .unwrap_or_else(|_| DEFAULT_AUTH_EMAIL_EXCHANGE.to_string()),
            order_exchange: env::var("ORDER_EMAIL_EXCHANGE")
                .unwrap_or_else(|_| DEFAULT_ORDER_EMAIL_EXCHANGE.to_string()),
            mail: MailConfig::from_env(),
            templates_dir: env::var("TEMPLATES_DIR").map_or_else(
                |_| PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/templates")),
                PathBuf::from,
            ),
        }
    }
}

impl MailConfig {
    /// 環境変数からメール送信設定を読み込む
    fn from_env() -> Self {
        let smtp_credentials = match (env::var("SMTP_USERNAME"), env::var("SMTP_PASSWORD")) {
            (Ok(username), Ok(password)) => Some(SmtpCredentials { username, password }),
            _ => None,
        };

        Self {
            backend: env::var("NOTIFICATION_BACKEND").unwrap_or_else(|_| "noop".to_string()),
            smtp_host: env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
            smtp_port: parse_or("SMTP_PORT", 1025),
            smtp_credentials,
            sender_email: env::var("SENDER_EMAIL")
                .unwrap_or_else(|_| "noreply@jobber.example.com".to_string()),
            client_url: env::var("CLIENT_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        }
    }
}

/// 環境変数を数値として読む。未設定・不正な値は既定値
fn parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_value<T>(key: &str, raw: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    raw.trim().parse().unwrap_or_else(|_| {
        tracing::warn!(
            key,
            value = raw,
            default = %default,
            "有効な数値として解釈できないため既定値を使用します"
        );
        default
    })
}
