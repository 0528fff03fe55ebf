//! # Notification Service ライブラリ
//!
//! バイナリ（`main.rs`）と統合テストが共有する構成要素。
//!
//! - [`config`] - 環境変数からの設定読み込み
//! - [`dispatcher`] - 接続・トポロジー宣言・購読開始の起動手順
//! - [`handler`] - ヘルスチェックの HTTP ハンドラ
//! - [`usecase`] - コンテンツ解決、送信、キューごとのハンドラ

pub mod config;
pub mod dispatcher;
pub mod handler;
pub mod usecase;
