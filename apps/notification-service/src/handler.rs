//! # HTTP リクエストハンドラ
//!
//! axum のルートに対応するハンドラ関数を定義する。
//!
//! - 各ハンドラはサブモジュールに配置
//! - 親モジュール（この `handler.rs`）で re-export し、フラットな API を提供

pub mod health;

use std::sync::Arc;

use axum::{Router, routing::get};
pub use health::{ReadinessState, health_check, readiness_check};
use tower_http::trace::TraceLayer;

/// HTTP ルーターを構築する
pub fn router(readiness: ReadinessState) -> Router {
    let readiness_state = Arc::new(readiness);

    Router::new()
        .route("/api/health", get(health_check))
        .merge(
            Router::new()
                .route("/api/health/ready", get(readiness_check))
                .with_state(readiness_state),
        )
        .layer(TraceLayer::new_for_http())
}
