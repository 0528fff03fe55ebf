//! # ヘルスチェックハンドラ
//!
//! - `/api/health`: Liveness Check（常に `"OK"` を返す）
//! - `/api/health/ready`: Readiness Check（ブローカーの接続状態と購読の状態を確認）
//!
//! レスポンス型は [`courier_shared::HealthResponse`] / [`courier_shared::ReadinessResponse`] を参照。

use std::{collections::HashMap, sync::Arc};

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use courier_infra::broker::{BrokerSupervisor, Consumer};
use courier_shared::{CheckStatus, HealthResponse, ReadinessResponse, ReadinessStatus};

/// Liveness Check
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse::ok("Notification Service is up and running"))
}

/// Readiness Check 用の State
pub struct ReadinessState {
    pub supervisor: Arc<BrokerSupervisor>,
    /// 設定されていれば購読の停止も検査する
    pub consumer:   Option<Arc<Consumer>>,
}

impl ReadinessState {
    pub fn new(supervisor: Arc<BrokerSupervisor>) -> Self {
        Self {
            supervisor,
            consumer: None,
        }
    }

    pub fn with_consumer(mut self, consumer: Arc<Consumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }
}

/// Readiness Check
///
/// ブローカーに接続済みなら 200、未接続・再接続中・再接続上限到達なら 503。
/// 接続中でもブローカー側で取り消された購読があれば 503。
#[tracing::instrument(skip_all)]
pub async fn readiness_check(State(state): State<Arc<ReadinessState>>) -> impl IntoResponse {
    let status = state.supervisor.status();

    let broker = if status.is_connected() {
        CheckStatus::Ok
    } else {
        tracing::warn!(
            state = %status.state,
            reconnect_attempts = status.reconnect_attempts,
            "readiness check: broker is not connected"
        );
        CheckStatus::Error
    };

    let mut checks = HashMap::new();
    checks.insert("broker".to_string(), broker);

    if let Some(consumer) = &state.consumer {
        let stalled = consumer.stalled_subscriptions().await;
        let consumers = if stalled.is_empty() {
            CheckStatus::Ok
        } else {
            tracing::warn!(?stalled, "readiness check: some subscriptions are not consuming");
            CheckStatus::Error
        };
        checks.insert("consumers".to_string(), consumers);
    }

    let all_ok = checks.values().all(|s| matches!(s, CheckStatus::Ok));
    let (http_status, readiness) = if all_ok {
        (StatusCode::OK, ReadinessStatus::Ready)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, ReadinessStatus::NotReady)
    };

    (
        http_status,
        Json(ReadinessResponse {
            status: readiness,
            checks,
            reconnect_attempts: status.reconnect_attempts,
        }),
    )
}
