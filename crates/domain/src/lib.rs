//! # Courier ドメイン層
//!
//! メール通知ディスパッチャのドメインモデルを定義する。
//!
//! ## 設計方針
//!
//! - **ブローカー非依存**: AMQP クライアントや SMTP などの I/O 型には依存しない
//! - **不変のメッセージ**: 受信したエンベロープは書き換えず、派生コピーを作る
//! - **エラーの分類**: メッセージ単位で回復不能なエラーは [`NotificationError`]
//!   で表現し、コンシューマ境界で破棄（reject）に変換される
//!
//! ## 依存関係の方向
//!
//! ```text
//! notification-service → infra → domain
//! ```
//!
//! ## モジュール構成
//!
//! - [`envelope`] - キューを流れるメッセージエンベロープ
//! - [`notification`] - レンダリング結果、送信メール、通知エラー
//! - [`topology`] - エクスチェンジ / キュー / バインディングの宣言
//! - [`delivery`] - 1 回の消費試行の結果

pub mod delivery;
pub mod envelope;
pub mod notification;
pub mod topology;

pub use delivery::DeliveryOutcome;
pub use envelope::{ContentSource, EmailEnvelope};
pub use notification::{EmailMessage, NotificationError, RenderedContent};
