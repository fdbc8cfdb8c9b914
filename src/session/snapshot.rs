//! 会话快照与局部补丁
//!
//! 每个会话一行快照，按「读取后合并」写入：context 与 tool_outputs 做浅合并，
//! 其余字段有值才覆盖。document_version 只增不减，只有产生新文档时才前进。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::itinerary::{Block, RenderedDocument, SpotBlock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub spot_blocks: Vec<SpotBlock>,
    #[serde(default)]
    pub tool_outputs: Map<String, Value>,
    #[serde(default)]
    pub rendered_document: Option<RenderedDocument>,
    #[serde(default)]
    pub document_version: u32,
    #[serde(default)]
    pub preview_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            context: Map::new(),
            blocks: Vec::new(),
            spot_blocks: Vec::new(),
            tool_outputs: Map::new(),
            rendered_document: None,
            document_version: 0,
            preview_path: None,
            updated_at: Utc::now(),
        }
    }
}

/// 一次写入的局部补丁；None 表示不动该字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPatch {
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
    #[serde(default)]
    pub blocks: Option<Vec<Block>>,
    #[serde(default)]
    pub spot_blocks: Option<Vec<SpotBlock>>,
    #[serde(default)]
    pub tool_outputs: Option<Map<String, Value>>,
    #[serde(default)]
    pub rendered_document: Option<RenderedDocument>,
}

impl SnapshotPatch {
    pub fn is_empty(&self) -> bool {
        self.context.is_none()
            && self.blocks.is_none()
            && self.spot_blocks.is_none()
            && self.tool_outputs.is_none()
            && self.rendered_document.is_none()
    }
}

impl SessionSnapshot {
    /// 把补丁合并进已有快照（不存在则从空快照开始）
    pub fn merge(existing: Option<SessionSnapshot>, patch: SnapshotPatch) -> SessionSnapshot {
        let mut snap = existing.unwrap_or_default();

        if let Some(context) = patch.context {
            for (k, v) in context {
                snap.context.insert(k, v);
            }
        }
        if let Some(outputs) = patch.tool_outputs {
            for (k, v) in outputs {
                snap.tool_outputs.insert(k, v);
            }
        }
        if let Some(blocks) = patch.blocks {
            snap.blocks = blocks;
        }
        if let Some(spots) = patch.spot_blocks {
            snap.spot_blocks = spots;
        }
        if let Some(doc) = patch.rendered_document {
            if doc.version > snap.document_version {
                snap.document_version = doc.version;
                snap.preview_path = Some(doc.preview_path.clone());
                snap.rendered_document = Some(doc);
            }
        }

        snap.updated_at = Utc::now();
        snap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(version: u32) -> RenderedDocument {
        RenderedDocument {
            version,
            title: "Trip".into(),
            markdown: format!("v{version}"),
            image_mode: None,
            preview_path: format!("previews/s/v{version}.md"),
            rendered_at: Utc::now(),
        }
    }

    #[test]
    fn test_shallow_merge_keeps_unrelated_fields() {
        let mut first = SnapshotPatch::default();
        first.context = Some(json!({"summary": "a", "title": "T"}).as_object().cloned().unwrap());
        first.tool_outputs = Some(json!({"fetch_video": {"id": "v1"}}).as_object().cloned().unwrap());
        let snap = SessionSnapshot::merge(None, first);

        let mut second = SnapshotPatch::default();
        second.context = Some(json!({"summary": "b"}).as_object().cloned().unwrap());
        second.tool_outputs = Some(json!({"summarize_trip": {"summary": "b"}}).as_object().cloned().unwrap());
        let snap = SessionSnapshot::merge(Some(snap), second);

        assert_eq!(snap.context["summary"], "b");
        assert_eq!(snap.context["title"], "T");
        assert!(snap.tool_outputs.contains_key("fetch_video"));
        assert!(snap.tool_outputs.contains_key("summarize_trip"));
    }

    #[test]
    fn test_document_version_only_increases() {
        let snap = SessionSnapshot::merge(
            None,
            SnapshotPatch {
                rendered_document: Some(doc(2)),
                ..Default::default()
            },
        );
        assert_eq!(snap.document_version, 2);
        assert_eq!(snap.preview_path.as_deref(), Some("previews/s/v2.md"));

        // 重复写同一版本或更旧版本不会回退
        let snap = SessionSnapshot::merge(
            Some(snap),
            SnapshotPatch {
                rendered_document: Some(doc(1)),
                ..Default::default()
            },
        );
        assert_eq!(snap.document_version, 2);
        assert_eq!(snap.rendered_document.as_ref().map(|d| d.markdown.as_str()), Some("v2"));
    }

    #[test]
    fn test_no_document_means_no_preview() {
        let snap = SessionSnapshot::merge(None, SnapshotPatch::default());
        assert!(snap.preview_path.is_none());
        assert_eq!(snap.document_version, 0);
    }
}
