//! # ディスパッチハンドラ
//!
//! キューごとの [`MessageHandler`](courier_infra::broker::MessageHandler) 実装。
//!
//! - [`auth`] - `auth-email-queue`: メールアドレス確認メール
//! - [`order`] - `order-email-queue`: 注文関連メール

pub mod auth;
pub mod order;

pub use auth::AuthEmailHandler;
pub use order::OrderEmailHandler;
