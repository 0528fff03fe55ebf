//! # 消費結果
//!
//! 1 回の消費試行の結果。永続化はしない。
//!
//! 失敗したメッセージは再キューせずに破棄する（1 回限りの試行）。
//! デッドレターエクスチェンジやリトライキューは持たない。

use strum::IntoStaticStr;

/// 消費試行の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryOutcome {
    /// ハンドラが成功し、ack した
    Acknowledged,
    /// デコードまたはハンドラが失敗し、再キューなしで reject した
    RejectedDiscard,
}

impl DeliveryOutcome {
    pub fn is_acknowledged(self) -> bool {
        matches!(self, Self::Acknowledged)
    }
}
