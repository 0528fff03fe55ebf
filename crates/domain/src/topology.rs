//! # ブローカートポロジー
//!
//! エクスチェンジ・キュー・バインディングの宣言を値として表現する。
//!
//! ## 設計方針
//!
//! - **direct ルーティングのみ**: ルーティングキーが完全一致するキューへ配送する
//! - **キューは常に durable / 非 auto-delete**: 宣言値に持たせず固定とする
//! - **1 キュー 1 バインディング**: [`Route`] が 3 つの宣言をまとめて表す
//! - **再実行可能**: [`Topology`] は起動時と再接続時に同じ内容で宣言される

use strum::IntoStaticStr;

/// 認証メールのキュー名
pub const AUTH_EMAIL_QUEUE: &str = "auth-email-queue";
/// 認証メールのルーティングキー
pub const AUTH_EMAIL_ROUTING_KEY: &str = "auth-email";
/// 認証メールの既定エクスチェンジ名
pub const DEFAULT_AUTH_EMAIL_EXCHANGE: &str = "jobber-email-notification";

/// 注文メールのキュー名
pub const ORDER_EMAIL_QUEUE: &str = "order-email-queue";
/// 注文メールのルーティングキー
pub const ORDER_EMAIL_ROUTING_KEY: &str = "order-email";
/// 注文メールの既定エクスチェンジ名
pub const DEFAULT_ORDER_EMAIL_EXCHANGE: &str = "order-email-notification";

/// エクスチェンジ種別
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    IntoStaticStr,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum ExchangeKind {
    /// ルーティングキーの完全一致で配送する
    #[default]
    Direct,
}

/// バインディング（queue, exchange, routing key の組）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue:       String,
    pub exchange:    String,
    pub routing_key: String,
}

/// エクスチェンジ → キューの 1 経路
///
/// エクスチェンジ宣言・キュー宣言・バインディングを 1 組で表す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub exchange:      String,
    pub exchange_kind: ExchangeKind,
    pub queue:         String,
    pub routing_key:   String,
}

impl Route {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange:      exchange.into(),
            exchange_kind: ExchangeKind::Direct,
            queue:         queue.into(),
            routing_key:   routing_key.into(),
        }
    }

    /// 認証メールの経路（エクスチェンジ名のみ設定可能）
    pub fn auth_email(exchange: impl Into<String>) -> Self {
        Self::new(exchange, AUTH_EMAIL_QUEUE, AUTH_EMAIL_ROUTING_KEY)
    }

    /// 注文メールの経路（エクスチェンジ名のみ設定可能）
    pub fn order_email(exchange: impl Into<String>) -> Self {
        Self::new(exchange, ORDER_EMAIL_QUEUE, ORDER_EMAIL_ROUTING_KEY)
    }

    pub fn binding(&self) -> Binding {
        Binding {
            queue:       self.queue.clone(),
            exchange:    self.exchange.clone(),
            routing_key: self.routing_key.clone(),
        }
    }
}

/// 宣言するトポロジー全体
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    routes: Vec<Route>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// 経路を追加する（同一の経路は重複させない）
    pub fn with_route(mut self, route: Route) -> Self {
        if !self.routes.contains(&route) {
            self.routes.push(route);
        }
        self
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// 宣言すべきエクスチェンジ（名前の重複を除いた宣言順）
    pub fn exchanges(&self) -> Vec<(&str, ExchangeKind)> {
        let mut exchanges: Vec<(&str, ExchangeKind)> = Vec::new();
        for route in &self.routes {
            if !exchanges.iter().any(|(name, _)| *name == route.exchange) {
                exchanges.push((route.exchange.as_str(), route.exchange_kind));
            }
        }
        exchanges
    }

    /// 宣言すべきキュー（重複を除いた宣言順）
    pub fn queues(&self) -> Vec<&str> {
        let mut queues: Vec<&str> = Vec::new();
        for route in &self.routes {
            if !queues.contains(&route.queue.as_str()) {
                queues.push(route.queue.as_str());
            }
        }
        queues
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.routes.iter().map(Route::binding).collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn 既定の経路は認証と注文のキューを持つ() {
        let auth = Route::auth_email(DEFAULT_AUTH_EMAIL_EXCHANGE);
        let order = Route::order_email(DEFAULT_ORDER_EMAIL_EXCHANGE);

        assert_eq!(auth.queue, "auth-email-queue");
        assert_eq!(auth.routing_key, "auth-email");
        assert_eq!(auth.exchange, "jobber-email-notification");
        assert_eq!(order.queue, "order-email-queue");
        assert_eq!(order.routing_key, "order-email");
        assert_eq!(order.exchange, "order-email-notification");
    }

    #[test]
    fn 同じ経路を追加しても重複しない() {
        let topology = Topology::new()
            .with_route(Route::auth_email("ex"))
            .with_route(Route::auth_email("ex"));

        assert_eq!(topology.routes().len(), 1);
        assert_eq!(topology.bindings().len(), 1);
    }

    #[test]
    fn エクスチェンジを共有する経路ではエクスチェンジを1回だけ宣言する() {
        let topology = Topology::new()
            .with_route(Route::auth_email("shared"))
            .with_route(Route::order_email("shared"));

        assert_eq!(topology.exchanges(), vec![("shared", ExchangeKind::Direct)]);
        assert_eq!(
            topology.queues(),
            vec!["auth-email-queue", "order-email-queue"]
        );
        assert_eq!(topology.bindings().len(), 2);
    }

    #[rstest]
    #[case(ExchangeKind::Direct, "direct")]
    fn exchange_kindは小文字で表示される(#[case] kind: ExchangeKind, #[case] expected: &str) {
        assert_eq!(kind.to_string(), expected);
        let name: &'static str = kind.into();
        assert_eq!(name, expected);
    }
}
