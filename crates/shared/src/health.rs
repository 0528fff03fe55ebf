//! # ヘルスチェック共通型
//!
//! ヘルスチェックエンドポイントで使用されるレスポンス型を提供する。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// ヘルスチェックレスポンス
///
/// ## 使用例
///
/// ```
/// use courier_shared::HealthResponse;
///
/// let response = HealthResponse::ok("Notification Service is up and running");
/// assert_eq!(response.status, "OK");
/// ```
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// 人が読むためのメッセージ
    pub response: String,
    /// 稼働状態（`"OK"`）
    pub status:   String,
}

impl HealthResponse {
    pub fn ok(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            status:   "OK".to_string(),
        }
    }
}

/// 個別チェックの結果ステータス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// チェック成功
    Ok,
    /// チェック失敗
    Error,
}

/// Readiness 全体のステータス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStatus {
    /// 全依存サービスが利用可能
    Ready,
    /// 一部の依存サービスが利用不可
    NotReady,
}

/// Readiness Check レスポンス
///
/// `status` は全体のステータス、`checks` は個別チェック結果、
/// `reconnect_attempts` はブローカーへの再接続試行回数を示す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    /// 全体のステータス
    pub status:             ReadinessStatus,
    /// 個別チェック結果（キー: チェック名、値: ステータス）
    pub checks:             HashMap<String, CheckStatus>,
    /// 現在の再接続試行回数
    pub reconnect_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_responseのserializeで正しいjson形状にする() {
        let response = HealthResponse::ok("Notification Service is up and running");
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "response": "Notification Service is up and running",
                "status": "OK"
            })
        );
    }

    #[test]
    fn test_readiness_status_not_readyのserialize結果() {
        let json = serde_json::to_value(ReadinessStatus::NotReady).unwrap();
        assert_eq!(json, serde_json::json!("not_ready"));
    }

    #[test]
    fn test_readiness_response_not_readyのserialize結果() {
        let mut checks = HashMap::new();
        checks.insert("broker".to_string(), CheckStatus::Error);
        let response = ReadinessResponse {
            status: ReadinessStatus::NotReady,
            checks,
            reconnect_attempts: 3,
        };
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["status"], "not_ready");
        assert_eq!(json["checks"]["broker"], "error");
        assert_eq!(json["reconnect_attempts"], 3);
    }
}
