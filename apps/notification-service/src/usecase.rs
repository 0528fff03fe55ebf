//! # ユースケース層
//!
//! Notification Service のメッセージ処理ロジックを実装する。
//!
//! ## 設計方針
//!
//! - **依存性注入**: 送信とテンプレートは `Arc<dyn Trait>` で外部から注入
//! - **薄いハンドラ**: キューごとのハンドラは薄く保ち、送信処理は通知サービスに集約
//!
//! ## モジュール構成
//!
//! - `notification`: メール内容の決定と送信
//! - `dispatch`: キューごとのメッセージハンドラ

pub mod dispatch;
pub mod notification;

pub use dispatch::{AuthEmailHandler, OrderEmailHandler};
pub use notification::{ContentResolver, NotificationService, TeraTemplateRenderer};
