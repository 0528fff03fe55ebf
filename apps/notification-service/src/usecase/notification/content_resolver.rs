//! # コンテンツリゾルバ
//!
//! エンベロープから最終的な件名と本文を決定する。
//!
//! ## 解決順序
//!
//! 1. `template` がなければ `subject` / `html` をそのまま返す
//! 2. テンプレートの一括レンダリング（件名 + 本文）
//! 3. 失敗したら本文のみをレンダリングし、件名はフォールバック件名ファイルから得る。
//!    件名が得られなければ既定の件名（`"Notification"`）を使う
//! 4. 本文も存在しなければ `TemplateNotFound`
//!
//! エンベロープは変更しない。

use std::sync::Arc;

use courier_domain::{
    ContentSource,
    EmailEnvelope,
    NotificationError,
    RenderedContent,
    notification::DEFAULT_SUBJECT,
};
use serde_json::{Map, Value};

use super::template_renderer::{RenderError, TemplateRenderer};

/// コンテンツリゾルバ
#[derive(Clone)]
pub struct ContentResolver {
    renderer: Arc<dyn TemplateRenderer>,
}

impl ContentResolver {
    pub fn new(renderer: Arc<dyn TemplateRenderer>) -> Self {
        Self { renderer }
    }

    /// 件名と本文を決定する
    pub fn resolve(&self, envelope: &EmailEnvelope) -> Result<RenderedContent, NotificationError> {
        match envelope.content_source()? {
            ContentSource::Raw { subject, html } => Ok(RenderedContent::new(subject, html)),
            ContentSource::Template { name, data } => self.render_template(&name, &data),
        }
    }

    fn render_template(
        &self,
        name: &str,
        data: &Map<String, Value>,
    ) -> Result<RenderedContent, NotificationError> {
        let primary = match self.renderer.render_all(name, data) {
            Ok(content) => return Ok(content),
            Err(e) => e,
        };
        tracing::debug!(
            template = name,
            "一括レンダリングに失敗したため本文のみでレンダリングします: {}",
            primary
        );

        let html = self.renderer.render_html(name, data).map_err(|e| match e {
            RenderError::NotFound(name) => NotificationError::TemplateNotFound(name),
            RenderError::Failed(message) => NotificationError::TemplateFailed(message),
        })?;

        let subject = self
            .renderer
            .fallback_subject(name, data)
            .filter(|subject| !subject.is_empty())
            .unwrap_or_else(|| {
                tracing::debug!(template = name, "件名が得られないため既定の件名を使用します");
                DEFAULT_SUBJECT.to_string()
            });

        Ok(RenderedContent::new(subject, html))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    /// 経路ごとの結果を固定したスタブレンダラー
    struct StubRenderer {
        all:     Result<RenderedContent, fn() -> RenderError>,
        html:    Result<String, fn() -> RenderError>,
        subject: Option<String>,
        calls:   Mutex<Vec<(String, Map<String, Value>)>>,
    }

    impl StubRenderer {
        fn new(
            all: Result<RenderedContent, fn() -> RenderError>,
            html: Result<String, fn() -> RenderError>,
            subject: Option<&str>,
        ) -> Arc<Self> {
            Arc::new(Self {
                all,
                html,
                subject: subject.map(str::to_string),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl TemplateRenderer for StubRenderer {
        fn render_all(
            &self,
            name: &str,
            data: &Map<String, Value>,
        ) -> Result<RenderedContent, RenderError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), data.clone()));
            self.all.clone().map_err(|make| make())
        }

        fn render_html(
            &self,
            _name: &str,
            _data: &Map<String, Value>,
        ) -> Result<String, RenderError> {
            self.html.clone().map_err(|make| make())
        }

        fn fallback_subject(&self, _name: &str, _data: &Map<String, Value>) -> Option<String> {
            self.subject.clone()
        }
    }

    fn not_found() -> RenderError {
        RenderError::NotFound("verify".to_string())
    }

    fn failed() -> RenderError {
        RenderError::Failed("構文エラー".to_string())
    }

    fn templated() -> EmailEnvelope {
        let data = json!({ "username": "alice" });
        let Value::Object(data) = data else {
            unreachable!()
        };
        EmailEnvelope::templated("a@x.com", "verify", data)
    }

    #[test]
    fn templateなしはsubjectとhtmlをそのまま返す() {
        let renderer = StubRenderer::new(Err(failed), Err(failed), None);
        let resolver = ContentResolver::new(renderer.clone());
        let envelope = EmailEnvelope::raw("a@x.com", "S", "<p>H</p>");

        let content = resolver.resolve(&envelope).unwrap();

        assert_eq!(content, RenderedContent::new("S", "<p>H</p>"));
        assert!(renderer.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn 一括レンダリングの結果をそのまま返す() {
        let rendered = RenderedContent::new("ようこそ", "<p>alice</p>");
        let renderer = StubRenderer::new(Ok(rendered.clone()), Err(failed), None);
        let resolver = ContentResolver::new(renderer.clone());

        let content = resolver.resolve(&templated()).unwrap();

        assert_eq!(content, rendered);
        let calls = renderer.calls.lock().unwrap();
        assert_eq!(calls[0].0, "verify");
        assert_eq!(calls[0].1["username"], "alice");
    }

    #[test]
    fn 一括レンダリング失敗で件名ファイルもなければ既定の件名() {
        let renderer = StubRenderer::new(Err(failed), Ok("<p>本文</p>".to_string()), None);
        let resolver = ContentResolver::new(renderer);

        let content = resolver.resolve(&templated()).unwrap();

        assert_eq!(content, RenderedContent::new("Notification", "<p>本文</p>"));
    }

    #[test]
    fn 一括レンダリング失敗時は件名ファイルの件名を使う() {
        let renderer =
            StubRenderer::new(Err(not_found), Ok("<p>本文</p>".to_string()), Some("ご注文"));
        let resolver = ContentResolver::new(renderer);

        let content = resolver.resolve(&templated()).unwrap();

        assert_eq!(content, RenderedContent::new("ご注文", "<p>本文</p>"));
    }

    #[test]
    fn 空の件名ファイルは既定の件名になる() {
        let renderer = StubRenderer::new(Err(failed), Ok("<p>本文</p>".to_string()), Some(""));
        let resolver = ContentResolver::new(renderer);

        let content = resolver.resolve(&templated()).unwrap();

        assert_eq!(content.subject, "Notification");
    }

    #[test]
    fn 両方の経路でテンプレートがなければtemplate_not_found() {
        let renderer = StubRenderer::new(Err(not_found), Err(not_found), Some("件名"));
        let resolver = ContentResolver::new(renderer);

        let err = resolver.resolve(&templated()).unwrap_err();

        assert!(matches!(err, NotificationError::TemplateNotFound(name) if name == "verify"));
    }

    #[test]
    fn 本文のレンダリング失敗はtemplate_failed() {
        let renderer = StubRenderer::new(Err(failed), Err(failed), None);
        let resolver = ContentResolver::new(renderer);

        let err = resolver.resolve(&templated()).unwrap_err();

        assert!(matches!(err, NotificationError::TemplateFailed(_)));
    }

    #[test]
    fn templateもsubjectもないエンベロープはinvalid_envelope() {
        let renderer = StubRenderer::new(Err(failed), Err(failed), None);
        let resolver = ContentResolver::new(renderer);
        let mut envelope = EmailEnvelope::raw("a@x.com", "S", "H");
        envelope.subject = None;

        let err = resolver.resolve(&envelope).unwrap_err();

        assert!(matches!(err, NotificationError::InvalidEnvelope(_)));
    }

    #[test]
    fn resolveはエンベロープを変更しない() {
        let renderer = StubRenderer::new(Err(failed), Ok("<p>本文</p>".to_string()), None);
        let resolver = ContentResolver::new(renderer);
        let envelope = templated();
        let before = envelope.clone();

        let _ = resolver.resolve(&envelope);

        assert_eq!(envelope, before);
    }
}
