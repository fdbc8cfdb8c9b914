//! render_document：把块、图片与总结渲染为 Markdown 文档，版本号递增

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::{RuntimeState, ToolOutput};
use crate::itinerary::{render_markdown, RenderedDocument};
use crate::tools::{names, parse_args, Tool, ToolError};

const DEFAULT_TITLE: &str = "Trip itinerary";

#[derive(Deserialize)]
struct Args {
    #[serde(default)]
    title: Option<String>,
}

pub struct RenderDocumentTool {
    /// 预览文件目录，如 `previews/<session>`
    preview_root: String,
}

impl RenderDocumentTool {
    pub fn new(preview_root: impl Into<String>) -> Self {
        Self {
            preview_root: preview_root.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Tool for RenderDocumentTool {
    fn name(&self) -> &str {
        names::RENDER_DOCUMENT
    }

    fn description(&self) -> &str {
        "Render the itinerary, images and summary into a Markdown document. Args: {\"title\"?: string}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "title": { "type": "string" } }
        })
    }

    async fn execute(
        &self,
        args: Value,
        state: &mut RuntimeState,
        _cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let args: Args = parse_args(args)?;
        if state.blocks().is_empty() {
            return Err(ToolError::Precondition(
                "nothing to render; call extract_itinerary first".to_string(),
            ));
        }
        let title = args
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| state.title().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());
        let images = state.images().map(|s| s.images.as_slice()).unwrap_or(&[]);
        let markdown = render_markdown(&title, state.blocks(), images, state.summary());

        let version = state.next_document_version();
        let doc = RenderedDocument {
            version,
            title,
            markdown,
            image_mode: state.images().map(|s| s.mode),
            preview_path: format!("{}/v{version}.md", self.preview_root),
            rendered_at: Utc::now(),
        };
        state.set_document(doc.clone());
        tracing::info!(version, path = %doc.preview_path, "Document rendered");
        Ok(ToolOutput::RenderDocument(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::state_with_spots;

    #[tokio::test]
    async fn test_versions_increase() {
        let tool = RenderDocumentTool::new("previews/s1/");
        let mut state = state_with_spots(&[("Gion", "Gion, Kyoto")]);
        let token = CancellationToken::new();

        let first = tool.execute(json!({}), &mut state, &token).await.unwrap();
        let second = tool
            .execute(json!({"title": "Kyoto weekend"}), &mut state, &token)
            .await
            .unwrap();
        let (ToolOutput::RenderDocument(a), ToolOutput::RenderDocument(b)) = (first, second) else {
            panic!("unexpected output");
        };
        assert_eq!(a.version, 1);
        assert_eq!(a.preview_path, "previews/s1/v1.md");
        assert_eq!(b.version, 2);
        assert!(b.markdown.starts_with("# Kyoto weekend"));
        assert_eq!(state.document().map(|d| d.version), Some(2));
        assert!(b.image_mode.is_none());
    }

    #[tokio::test]
    async fn test_empty_itinerary_is_rejected() {
        let tool = RenderDocumentTool::new("previews/local");
        let mut state = RuntimeState::new();
        let err = tool
            .execute(json!({}), &mut state, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Precondition(_)));
    }
}
