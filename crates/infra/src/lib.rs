//! # Courier インフラ層
//!
//! メッセージブローカーとメール送信との接続・通信を担当するインフラストラクチャ層。
//!
//! ## 責務
//!
//! - **ブローカー接続の監督**: 単一接続の確立と、上限付きの自動再接続
//! - **トポロジー宣言**: エクスチェンジ / キュー / バインディングの冪等な宣言
//! - **パブリッシュ / コンシューム**: JSON エンベロープの送信と、ack / reject を伴う消費
//! - **メール送信**: SMTP / Noop の送信実装
//!
//! ## 依存関係
//!
//! ```text
//! notification-service → infra → domain
//!                          ↘
//!                           shared
//! ```
//!
//! ## モジュール構成
//!
//! - [`broker`] - ブローカー接続・トポロジー・パブリッシャー・コンシューマ
//! - [`notification`] - メール送信
//! - [`error`] - インフラ層エラー定義
//! - `mock` - テスト用インメモリブローカー（`test-utils` feature）

pub mod broker;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod notification;

pub use error::{InfraError, InfraErrorKind};
