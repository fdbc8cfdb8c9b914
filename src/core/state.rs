//! 回合运行时状态
//!
//! 一个回合内由入口独占、按引用交给每个工具的可变聚合：来源缓存、行程块与景点子集、
//! 图片集、渲染文档、各工具最近一次输出与错误。替换块列表时同步重算景点子集、
//! 重置坐标标记并清掉旧图片集，过期的派生数据不会比其来源活得更久。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::itinerary::{
    all_resolved, spots_of, Block, GeoPoint, ImageMode, ImageSet, RenderedDocument, SourceRecord,
    SpotBlock, VideoContext,
};
use crate::session::{SessionSnapshot, SnapshotPatch};
use crate::tools::names;

/// 水合时两套图片集都存在且无法按文档判断时的优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImagePrecedence {
    #[default]
    Generated,
    Searched,
}

/// extract_itinerary 的输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItineraryOutput {
    pub title: String,
    pub count: usize,
    pub blocks: Vec<Block>,
}

/// resolve_locations 的输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    pub resolved: usize,
    /// 仍无坐标的块 id
    pub unresolved: Vec<String>,
    pub spots: Vec<SpotBlock>,
}

/// summarize_trip 的输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripSummary {
    pub summary: String,
}

/// 工具输出的和类型：每个已知工具一个变体，未知工具走 Opaque
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    FetchVideo(SourceRecord),
    ExtractItinerary(ItineraryOutput),
    ResolveLocations(LocationReport),
    SearchImages(ImageSet),
    GenerateImages(ImageSet),
    SummarizeTrip(TripSummary),
    RenderDocument(RenderedDocument),
    Opaque(Value),
}

impl ToolOutput {
    /// 按工具名解析持久化的 JSON；结构不符时保留为 Opaque
    pub fn from_value(tool: &str, value: Value) -> ToolOutput {
        fn typed<T: serde::de::DeserializeOwned>(
            value: Value,
            wrap: fn(T) -> ToolOutput,
        ) -> ToolOutput {
            match serde_json::from_value::<T>(value.clone()) {
                Ok(v) => wrap(v),
                Err(_) => ToolOutput::Opaque(value),
            }
        }
        match tool {
            names::FETCH_VIDEO => typed(value, ToolOutput::FetchVideo),
            names::EXTRACT_ITINERARY => typed(value, ToolOutput::ExtractItinerary),
            names::RESOLVE_LOCATIONS => typed(value, ToolOutput::ResolveLocations),
            names::SEARCH_IMAGES => typed(value, ToolOutput::SearchImages),
            names::GENERATE_IMAGES => typed(value, ToolOutput::GenerateImages),
            names::SUMMARIZE_TRIP => typed(value, ToolOutput::SummarizeTrip),
            names::RENDER_DOCUMENT => typed(value, ToolOutput::RenderDocument),
            _ => ToolOutput::Opaque(value),
        }
    }

    pub fn to_value(&self) -> Value {
        let encoded = match self {
            ToolOutput::FetchVideo(v) => serde_json::to_value(v),
            ToolOutput::ExtractItinerary(v) => serde_json::to_value(v),
            ToolOutput::ResolveLocations(v) => serde_json::to_value(v),
            ToolOutput::SearchImages(v) | ToolOutput::GenerateImages(v) => serde_json::to_value(v),
            ToolOutput::SummarizeTrip(v) => serde_json::to_value(v),
            ToolOutput::RenderDocument(v) => serde_json::to_value(v),
            ToolOutput::Opaque(v) => Ok(v.clone()),
        };
        encoded.unwrap_or(Value::Null)
    }

    pub fn image_set(&self) -> Option<&ImageSet> {
        match self {
            ToolOutput::SearchImages(set) | ToolOutput::GenerateImages(set) => Some(set),
            _ => None,
        }
    }
}

/// 快照 context 中的行程上下文
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TripContext {
    #[serde(default)]
    pub video: Option<VideoContext>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub conversation_summary: Option<String>,
    #[serde(default)]
    pub image_mode: Option<ImageMode>,
}

/// 回合运行时状态
#[derive(Debug, Default)]
pub struct RuntimeState {
    sources_by_id: HashMap<String, SourceRecord>,
    sources_by_url: HashMap<String, SourceRecord>,
    blocks: Vec<Block>,
    spots: Vec<SpotBlock>,
    locations_resolved: bool,
    context: TripContext,
    images: Option<ImageSet>,
    document: Option<RenderedDocument>,
    document_version: u32,
    cancelled: Arc<AtomicBool>,
    tool_outputs: BTreeMap<String, ToolOutput>,
    tool_errors: BTreeMap<String, String>,
    /// 已失效的工具输出，下次快照写 null 覆盖
    cleared_outputs: BTreeSet<String>,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从最近快照水合
    pub fn from_snapshot(snapshot: &SessionSnapshot, precedence: ImagePrecedence) -> Self {
        let mut state = Self::new();

        if let Ok(context) = serde_json::from_value::<TripContext>(Value::Object(snapshot.context.clone())) {
            state.context = context;
        }
        if let Some(sources) = snapshot.context.get("sources") {
            if let Ok(records) = serde_json::from_value::<Vec<SourceRecord>>(sources.clone()) {
                for record in records {
                    state.cache_source(record);
                }
            }
        }

        state.blocks = snapshot.blocks.clone();
        state.spots = spots_of(&state.blocks);
        state.locations_resolved = all_resolved(&state.spots);

        for (tool, value) in &snapshot.tool_outputs {
            if value.is_null() {
                continue;
            }
            state
                .tool_outputs
                .insert(tool.clone(), ToolOutput::from_value(tool, value.clone()));
        }

        state.document = snapshot.rendered_document.clone();
        state.document_version = snapshot.document_version;
        state.images = state.pick_image_set(precedence);
        state.context.image_mode = state.images.as_ref().map(|s| s.mode);
        state
    }

    /// 文档记录的模式优先，其次按配置的优先级
    fn pick_image_set(&self, precedence: ImagePrecedence) -> Option<ImageSet> {
        let searched = self
            .tool_outputs
            .get(names::SEARCH_IMAGES)
            .and_then(ToolOutput::image_set);
        let generated = self
            .tool_outputs
            .get(names::GENERATE_IMAGES)
            .and_then(ToolOutput::image_set);

        let by_document = self
            .document
            .as_ref()
            .and_then(|d| d.image_mode)
            .and_then(|mode| match mode {
                ImageMode::Searched => searched,
                ImageMode::Generated => generated,
            });

        let chosen = by_document.or_else(|| match precedence {
            ImagePrecedence::Generated => generated.or(searched),
            ImagePrecedence::Searched => searched.or(generated),
        });
        chosen.filter(|set| set.matches_blocks(&self.blocks)).cloned()
    }

    // ---- 取消 ----

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    // ---- 来源缓存 ----

    /// 按 id 与 url 缓存，后写覆盖先写
    pub fn cache_source(&mut self, record: SourceRecord) {
        self.sources_by_url.insert(record.url.clone(), record.clone());
        self.sources_by_id.insert(record.id.clone(), record);
    }

    pub fn source_by_id(&self, id: &str) -> Option<&SourceRecord> {
        self.sources_by_id.get(id)
    }

    pub fn source_by_url(&self, url: &str) -> Option<&SourceRecord> {
        self.sources_by_url.get(url)
    }

    /// 当前视频对应的来源
    pub fn current_source(&self) -> Option<&SourceRecord> {
        self.context
            .video
            .as_ref()
            .and_then(|v| self.sources_by_id.get(&v.source_id))
    }

    pub fn set_video(&mut self, video: VideoContext) {
        self.context.video = Some(video);
    }

    // ---- 行程 ----

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn spots(&self) -> &[SpotBlock] {
        &self.spots
    }

    pub fn locations_resolved(&self) -> bool {
        self.locations_resolved
    }

    /// 替换块列表：重算景点子集、重置坐标标记、丢弃旧图片集
    pub fn replace_blocks(&mut self, blocks: Vec<Block>, title: Option<String>) {
        self.blocks = blocks;
        self.spots = spots_of(&self.blocks);
        self.locations_resolved = false;
        if title.is_some() {
            self.context.title = title;
        }
        self.clear_images();
        for tool in [names::RESOLVE_LOCATIONS, names::SEARCH_IMAGES, names::GENERATE_IMAGES] {
            self.invalidate_output(tool);
        }
    }

    /// 写入地理编码结果（None 表示该块仍无坐标）
    pub fn apply_locations(&mut self, updates: &[(String, Option<GeoPoint>)]) {
        for (block_id, point) in updates {
            if let Some(block) = self.blocks.iter_mut().find(|b| &b.id == block_id) {
                block.location = *point;
            }
        }
        self.spots = spots_of(&self.blocks);
        self.locations_resolved = all_resolved(&self.spots);
    }

    // ---- 图片 ----

    pub fn images(&self) -> Option<&ImageSet> {
        self.images.as_ref()
    }

    /// 新图片集替换旧的，另一模式的工具输出随之失效
    pub fn set_images(&mut self, set: ImageSet) {
        self.clear_images();
        let stale = match set.mode {
            ImageMode::Searched => names::GENERATE_IMAGES,
            ImageMode::Generated => names::SEARCH_IMAGES,
        };
        self.invalidate_output(stale);
        self.context.image_mode = Some(set.mode);
        self.images = Some(set);
    }

    fn clear_images(&mut self) {
        self.images = None;
        self.context.image_mode = None;
    }

    // ---- 上下文与文档 ----

    pub fn context(&self) -> &TripContext {
        &self.context
    }

    pub fn title(&self) -> Option<&str> {
        self.context
            .title
            .as_deref()
            .or_else(|| self.context.video.as_ref().map(|v| v.title.as_str()))
    }

    pub fn summary(&self) -> Option<&str> {
        self.context.summary.as_deref()
    }

    pub fn set_summary(&mut self, summary: String) {
        self.context.summary = Some(summary);
    }

    pub fn conversation_summary(&self) -> Option<&str> {
        self.context.conversation_summary.as_deref()
    }

    pub fn set_conversation_summary(&mut self, summary: String) {
        self.context.conversation_summary = Some(summary).filter(|s| !s.is_empty());
    }

    pub fn document(&self) -> Option<&RenderedDocument> {
        self.document.as_ref()
    }

    pub fn next_document_version(&self) -> u32 {
        self.document_version + 1
    }

    pub fn set_document(&mut self, doc: RenderedDocument) {
        self.document_version = self.document_version.max(doc.version);
        self.document = Some(doc);
    }

    // ---- 工具输出 ----

    pub fn record_output(&mut self, tool: &str, output: ToolOutput) {
        self.cleared_outputs.remove(tool);
        self.tool_errors.remove(tool);
        self.tool_outputs.insert(tool.to_string(), output);
    }

    pub fn record_error(&mut self, tool: &str, message: String) {
        self.tool_errors.insert(tool.to_string(), message);
    }

    pub fn output(&self, tool: &str) -> Option<&ToolOutput> {
        self.tool_outputs.get(tool)
    }

    pub fn last_error(&self, tool: &str) -> Option<&str> {
        self.tool_errors.get(tool).map(String::as_str)
    }

    fn invalidate_output(&mut self, tool: &str) {
        if self.tool_outputs.remove(tool).is_some() {
            self.cleared_outputs.insert(tool.to_string());
        }
    }

    /// 当前状态的完整补丁（context 与 tool_outputs 由存储端浅合并）
    pub fn to_patch(&self) -> SnapshotPatch {
        let mut context = match serde_json::to_value(&self.context) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let mut sources: Vec<&SourceRecord> = self.sources_by_id.values().collect();
        sources.sort_by(|a, b| a.id.cmp(&b.id));
        if let Ok(v) = serde_json::to_value(sources) {
            context.insert("sources".to_string(), v);
        }

        let mut outputs = Map::new();
        for tool in &self.cleared_outputs {
            outputs.insert(tool.clone(), Value::Null);
        }
        for (tool, output) in &self.tool_outputs {
            outputs.insert(tool.clone(), output.to_value());
        }

        SnapshotPatch {
            context: Some(context),
            blocks: Some(self.blocks.clone()),
            spot_blocks: Some(self.spots.clone()),
            tool_outputs: Some(outputs),
            rendered_document: self.document.clone(),
        }
    }
}
