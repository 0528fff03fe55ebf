//! # 通知ユースケース
//!
//! エンベロープからメール内容を決定し、送信とイベント記録までを統合する。
//!
//! ## モジュール構成
//!
//! - [`template_renderer`] - tera テンプレートエンジンによるメール生成
//! - [`content_resolver`] - テンプレート / 生の本文の選択とフォールバック
//! - [`service`] - コンテンツ解決 + 送信 + ビジネスイベント記録の統合サービス

pub mod content_resolver;
pub mod service;
pub mod template_renderer;

pub use content_resolver::ContentResolver;
pub use service::NotificationService;
pub use template_renderer::{RenderError, TemplateRenderer, TeraTemplateRenderer};
