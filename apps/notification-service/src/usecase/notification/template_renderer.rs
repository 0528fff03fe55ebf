//! # テンプレートレンダラー
//!
//! tera テンプレートエンジンでテンプレートストアのメールを生成する。
//!
//! ## テンプレートストアの構成
//!
//! ```text
//! <TEMPLATES_DIR>/
//! └── <テンプレート名>/
//!     ├── html.tera      本文（必須）
//!     ├── subject.tera   件名（あれば一括レンダリングで使用）
//!     └── subject.txt    件名のフォールバック（一括レンダリング失敗時に読む）
//! ```
//!
//! ## 設計方針
//!
//! - **起動時に読み込み**: `*.tera` は起動時に一括登録する
//! - **`subject.txt` は都度読む**: フォールバック時のみディスクから読み、
//!   tera の one-off レンダリングで展開する
//! - **件名は前後の空白を除く**

use std::{error::Error as _, fs, path::PathBuf};

use courier_domain::RenderedContent;
use serde_json::{Map, Value};
use tera::{Context, Tera};
use thiserror::Error;

/// 本文テンプレートのファイル名
const HTML_TEMPLATE: &str = "html.tera";
/// 件名テンプレートのファイル名
const SUBJECT_TEMPLATE: &str = "subject.tera";
/// フォールバック件名のファイル名
const SUBJECT_FALLBACK: &str = "subject.txt";

/// テンプレートレンダリングエラー
#[derive(Debug, Error)]
pub enum RenderError {
    /// テンプレートがテンプレートストアに存在しない
    #[error("テンプレートが見つかりません: {0}")]
    NotFound(String),

    /// テンプレートは存在するがレンダリングに失敗した
    #[error("レンダリングに失敗: {0}")]
    Failed(String),
}

/// テンプレートレンダリング機能
///
/// 件名と本文の一括レンダリングと、本文のみ + 件名ファイルのフォールバック経路を持つ。
pub trait TemplateRenderer: Send + Sync {
    /// 件名と本文を一括でレンダリングする
    fn render_all(
        &self,
        name: &str,
        data: &Map<String, Value>,
    ) -> Result<RenderedContent, RenderError>;

    /// 本文のみをレンダリングする
    fn render_html(&self, name: &str, data: &Map<String, Value>) -> Result<String, RenderError>;

    /// フォールバック用の件名を得る
    ///
    /// 件名ファイルがない・読めない・展開できない場合は `None`。
    fn fallback_subject(&self, name: &str, data: &Map<String, Value>) -> Option<String>;
}

/// tera によるテンプレートレンダラー
pub struct TeraTemplateRenderer {
    engine: Tera,
    root:   PathBuf,
}

impl TeraTemplateRenderer {
    /// テンプレートストアを読み込む
    ///
    /// ディレクトリが存在しない、またはテンプレートの構文が不正な場合はエラー。
    pub fn from_dir(root: impl Into<PathBuf>) -> Result<Self, RenderError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(RenderError::Failed(format!(
                "テンプレートディレクトリが存在しません: {}",
                root.display()
            )));
        }

        let pattern = format!("{}/**/*.tera", root.display());
        let mut engine = Tera::new(&pattern).map_err(|e| RenderError::Failed(e.to_string()))?;
        engine.autoescape_on(vec![HTML_TEMPLATE]);

        tracing::debug!(
            root = %root.display(),
            templates = engine.get_template_names().count(),
            "テンプレートを読み込みました"
        );

        Ok(Self { engine, root })
    }

    fn template_path(name: &str, file: &str) -> String {
        format!("{name}/{file}")
    }

    fn has_template(&self, path: &str) -> bool {
        self.engine.get_template_names().any(|registered| registered == path)
    }

    fn render_file(
        &self,
        name: &str,
        file: &str,
        context: &Context,
    ) -> Result<String, RenderError> {
        let path = Self::template_path(name, file);
        if !is_safe_name(name) || !self.has_template(&path) {
            return Err(RenderError::NotFound(name.to_string()));
        }
        self.engine
            .render(&path, context)
            .map_err(|e| RenderError::Failed(format!("{path}: {}", error_chain(&e))))
    }
}

impl TemplateRenderer for TeraTemplateRenderer {
    fn render_all(
        &self,
        name: &str,
        data: &Map<String, Value>,
    ) -> Result<RenderedContent, RenderError> {
        let context = to_context(data)?;
        let subject = self.render_file(name, SUBJECT_TEMPLATE, &context)?;
        let html = self.render_file(name, HTML_TEMPLATE, &context)?;
        Ok(RenderedContent::new(subject.trim(), html))
    }

    fn render_html(&self, name: &str, data: &Map<String, Value>) -> Result<String, RenderError> {
        let context = to_context(data)?;
        self.render_file(name, HTML_TEMPLATE, &context)
    }

    fn fallback_subject(&self, name: &str, data: &Map<String, Value>) -> Option<String> {
        if !is_safe_name(name) {
            return None;
        }

        let path = self.root.join(name).join(SUBJECT_FALLBACK);
        let source = match fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "件名ファイルを読めません");
                return None;
            }
        };

        let context = to_context(data).ok()?;
        match Tera::one_off(&source, &context, false) {
            Ok(subject) => Some(subject.trim().to_string()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "件名ファイルを展開できません");
                None
            }
        }
    }
}

/// ディレクトリ走査に使えないテンプレート名を拒否する
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains(['/', '\\'])
        && name != "."
        && name != ".."
}

fn to_context(data: &Map<String, Value>) -> Result<Context, RenderError> {
    Context::from_serialize(data).map_err(|e| RenderError::Failed(e.to_string()))
}

/// tera のエラーは原因が source に入るため連結して表示する
fn error_chain(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn bundled() -> TeraTemplateRenderer {
        TeraTemplateRenderer::from_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/templates")).unwrap()
    }

    fn data(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("オブジェクトを渡すこと"),
        }
    }

    #[test]
    fn verifyは件名と本文を一括でレンダリングできる() {
        let renderer = bundled();
        let data = data(json!({
            "username": "alice",
            "verifyLink": "http://localhost:3000/verify-email?token=tok123"
        }));

        let content = renderer.render_all("verify", &data).unwrap();

        assert_eq!(content.subject, "メールアドレスの確認");
        assert!(content.html.contains("alice"));
        assert!(content
            .html
            .contains("http://localhost:3000/verify-email?token=tok123"));
    }

    #[test]
    fn 件名テンプレートがないと一括レンダリングはnot_found() {
        let renderer = bundled();

        let result = renderer.render_all("order-receipt", &Map::new());

        assert!(matches!(result, Err(RenderError::NotFound(_))));
    }

    #[test]
    fn 件名ファイルはデータで展開され前後の空白が除かれる() {
        let renderer = bundled();
        let data = data(json!({ "orderId": "JO-1001" }));

        let subject = renderer.fallback_subject("order-receipt", &data);

        assert_eq!(subject.as_deref(), Some("ご注文ありがとうございます（JO-1001）"));
    }

    #[test]
    fn 件名ファイルがなければnone() {
        let renderer = bundled();

        assert_eq!(renderer.fallback_subject("verify", &Map::new()), None);
    }

    #[test]
    fn 存在しないテンプレートはnot_found() {
        let renderer = bundled();

        let result = renderer.render_html("missing", &Map::new());

        assert!(matches!(result, Err(RenderError::NotFound(name)) if name == "missing"));
    }

    #[test]
    fn パスを含むテンプレート名はnot_found() {
        let renderer = bundled();

        assert!(matches!(
            renderer.render_html("../verify", &Map::new()),
            Err(RenderError::NotFound(_))
        ));
        assert_eq!(renderer.fallback_subject("..", &Map::new()), None);
    }

    #[test]
    fn 本文のユーザー入力はエスケープされる() {
        let renderer = bundled();
        let data = data(json!({ "username": "<script>", "verifyLink": "http://x" }));

        let html = renderer.render_html("verify", &data).unwrap();

        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[test]
    fn 存在しないディレクトリはエラー() {
        let result = TeraTemplateRenderer::from_dir("/nonexistent/courier/templates");

        assert!(matches!(result, Err(RenderError::Failed(_))));
    }
}
