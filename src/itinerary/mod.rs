//! 行程领域类型：来源视频、行程块、景点子集、图片与渲染文档
//!
//! 景点子集（SpotBlock）始终可由块列表重新推导：`spots_of(blocks)` 是 type = spot 的过滤映射。

pub mod render;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use render::render_markdown;

/// 视频元数据（fetch_video 的结果，按 id 与 url 缓存）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    pub provider: String,
}

/// 当前行程对应的视频描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoContext {
    pub source_id: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
}

impl From<&SourceRecord> for VideoContext {
    fn from(record: &SourceRecord) -> Self {
        Self {
            source_id: record.id.clone(),
            url: record.url.clone(),
            title: record.title.clone(),
            author: record.author.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Spot,
    Meal,
    Lodging,
    Transit,
    Note,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// 行程块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub day: u32,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub place_query: Option<String>,
    #[serde(default)]
    pub time_hint: Option<String>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

/// 景点视图：由 type = spot 的块映射而来
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotBlock {
    pub block_id: String,
    pub day: u32,
    pub title: String,
    pub place_query: String,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

impl SpotBlock {
    pub fn is_resolved(&self) -> bool {
        self.location.is_some()
    }
}

/// 从块列表推导景点子集
pub fn spots_of(blocks: &[Block]) -> Vec<SpotBlock> {
    blocks
        .iter()
        .filter(|b| b.block_type == BlockType::Spot)
        .map(|b| SpotBlock {
            block_id: b.id.clone(),
            day: b.day,
            title: b.title.clone(),
            place_query: b.place_query.clone().unwrap_or_else(|| b.title.clone()),
            location: b.location,
        })
        .collect()
}

/// 每个景点都有坐标（无景点时为 true）
pub fn all_resolved(spots: &[SpotBlock]) -> bool {
    spots.iter().all(SpotBlock::is_resolved)
}

/// 单张图片的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Stock,
    Synthesized,
}

/// 图片集由哪个工具产生
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageMode {
    Searched,
    Generated,
}

impl ImageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageMode::Searched => "searched",
            ImageMode::Generated => "generated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAsset {
    pub block_id: String,
    pub url: String,
    pub source: ImageSource,
    /// 图库检索词或生成提示词
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub attribution: Option<String>,
}

/// 一次图片工具的完整产出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSet {
    pub mode: ImageMode,
    pub images: Vec<ImageAsset>,
}

impl ImageSet {
    pub fn count(&self, source: ImageSource) -> usize {
        self.images.iter().filter(|i| i.source == source).count()
    }

    /// 图片集是否与当前块列表对应（每张图都指向现存的景点块）
    pub fn matches_blocks(&self, blocks: &[Block]) -> bool {
        self.images
            .iter()
            .all(|img| blocks.iter().any(|b| b.id == img.block_id))
    }
}

/// 渲染结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedDocument {
    pub version: u32,
    pub title: String,
    pub markdown: String,
    #[serde(default)]
    pub image_mode: Option<ImageMode>,
    pub preview_path: String,
    pub rendered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(id: &str, block_type: BlockType, location: Option<GeoPoint>) -> Block {
        Block {
            id: id.into(),
            block_type,
            day: 1,
            title: format!("title {id}"),
            description: None,
            place_query: None,
            time_hint: None,
            location,
        }
    }

    #[test]
    fn test_spots_are_filtered_view() {
        let blocks = vec![
            block("b1", BlockType::Spot, Some(GeoPoint { lat: 1.0, lng: 2.0 })),
            block("b2", BlockType::Meal, None),
            block("b3", BlockType::Spot, None),
        ];
        let spots = spots_of(&blocks);
        assert_eq!(spots.len(), 2);
        assert_eq!(spots[1].block_id, "b3");
        assert_eq!(spots[1].place_query, "title b3");
        assert!(!all_resolved(&spots));
        assert!(all_resolved(&spots[..1]));
    }

    #[test]
    fn test_block_type_serializes_as_type() {
        let v = serde_json::to_value(block("b1", BlockType::Spot, None)).unwrap();
        assert_eq!(v["type"], "spot");
    }
}
