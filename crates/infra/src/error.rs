//! # インフラ層エラー定義
//!
//! メッセージブローカーとの通信やトポロジー宣言で発生するエラーを表現する。
//!
//! ## 構造
//!
//! `std::io::Error` と同じ struct + enum パターンを採用:
//! - [`InfraError`]: エラー種別（[`InfraErrorKind`]）と [`SpanTrace`] を保持するラッパー
//! - [`InfraErrorKind`]: エラーの具体的な種別（Configuration, Connection, Topology 等）
//!
//! ## 致命度
//!
//! | 種別 | 扱い |
//! |------|------|
//! | `Configuration` / `Connection` / `ReconnectExhausted` / `Topology` | 起動・接続レベル。プロセス終了へ伝播する |
//! | `Serialization` / `ChannelUnavailable` / `Amqp` | 呼び出し単位。呼び出し元が判断する |

use std::fmt;

use derive_more::Display;
use thiserror::Error;
use tracing_error::SpanTrace;

/// インフラ層で発生するエラー
///
/// エラー種別（[`InfraErrorKind`]）と [`SpanTrace`]（呼び出し経路）を保持する。
/// `From<lapin::Error>` 等の変換や convenience constructor でエラーを生成すると、
/// その時点のスパン情報が自動的にキャプチャされる。
#[derive(Display)]
#[display("{kind}")]
pub struct InfraError {
    kind:       InfraErrorKind,
    span_trace: SpanTrace,
}

/// インフラ層エラーの種別
#[derive(Debug, Error)]
pub enum InfraErrorKind {
    /// 設定エラー
    ///
    /// ブローカー URL が未設定・不正な場合など。起動時に致命的。
    #[error("設定エラー: {0}")]
    Configuration(String),

    /// ブローカー接続エラー
    ///
    /// ブローカーに到達できない、またはハンドシェイクが拒否された。
    #[error("ブローカー接続エラー: {0}")]
    Connection(String),

    /// 再接続の上限回数に到達
    #[error("ブローカーへの再接続が上限回数（{attempts} 回）に達しました")]
    ReconnectExhausted {
        /// 試行した回数
        attempts: u32,
    },

    /// トポロジー宣言エラー
    ///
    /// エクスチェンジ / キュー / バインディングの宣言に失敗した。
    #[error("トポロジー宣言エラー: {0}")]
    Topology(String),

    /// シリアライズ/デシリアライズエラー
    #[error("シリアライズエラー: {0}")]
    Serialization(#[source] serde_json::Error),

    /// 切断中のためチャネルが利用できない
    #[error("チャネルが利用できません（ブローカー未接続）")]
    ChannelUnavailable,

    /// AMQP プロトコルエラー
    #[error("AMQP エラー: {0}")]
    Amqp(#[source] lapin::Error),

    /// 予期しないエラー
    #[error("予期しないエラー: {0}")]
    Unexpected(String),
}

// ===== InfraError のメソッド =====

impl InfraError {
    /// エラー種別を取得する
    pub fn kind(&self) -> &InfraErrorKind {
        &self.kind
    }

    /// SpanTrace を取得する
    pub fn span_trace(&self) -> &SpanTrace {
        &self.span_trace
    }

    /// InfraError を分解して InfraErrorKind と SpanTrace を取り出す
    pub fn into_parts(self) -> (InfraErrorKind, SpanTrace) {
        (self.kind, self.span_trace)
    }

    /// 再接続の上限到達か
    pub fn is_reconnect_exhausted(&self) -> bool {
        matches!(self.kind, InfraErrorKind::ReconnectExhausted { .. })
    }

    // ===== Convenience constructors =====

    fn new(kind: InfraErrorKind) -> Self {
        Self {
            kind,
            span_trace: SpanTrace::capture(),
        }
    }

    /// 設定エラーを生成する
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::new(InfraErrorKind::Configuration(msg.into()))
    }

    /// 接続エラーを生成する
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(InfraErrorKind::Connection(msg.into()))
    }

    /// 再接続上限エラーを生成する
    pub fn reconnect_exhausted(attempts: u32) -> Self {
        Self::new(InfraErrorKind::ReconnectExhausted { attempts })
    }

    /// トポロジー宣言エラーを生成する
    pub fn topology(msg: impl Into<String>) -> Self {
        Self::new(InfraErrorKind::Topology(msg.into()))
    }

    /// チャネル利用不可エラーを生成する
    pub fn channel_unavailable() -> Self {
        Self::new(InfraErrorKind::ChannelUnavailable)
    }

    /// 予期しないエラーを生成する
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::new(InfraErrorKind::Unexpected(msg.into()))
    }
}

// ===== トレイト実装 =====

impl fmt::Debug for InfraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfraError")
            .field("kind", &self.kind)
            .field("span_trace", &self.span_trace)
            .finish()
    }
}

impl std::error::Error for InfraError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}

// ===== From 実装（SpanTrace 自動キャプチャ） =====

impl From<lapin::Error> for InfraError {
    fn from(source: lapin::Error) -> Self {
        Self::new(InfraErrorKind::Amqp(source))
    }
}

impl From<serde_json::Error> for InfraError {
    fn from(source: serde_json::Error) -> Self {
        Self::new(InfraErrorKind::Serialization(source))
    }
}
