//! extract_itinerary：结构化任务 + 业务规则校验，从视频元数据抽取行程块

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::{ItineraryOutput, RuntimeState, ToolOutput};
use crate::itinerary::{Block, BlockType, SourceRecord};
use crate::llm::{TaskExecutor, TaskName};
use crate::tools::{names, parse_args, Tool, ToolError};

pub const MAX_BLOCKS: usize = 60;

/// 模型产出的行程
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExtractedItinerary {
    /// Short trip title
    pub title: String,
    /// Blocks in chronological order
    pub blocks: Vec<DraftBlock>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DraftBlock {
    #[serde(rename = "type")]
    pub block_type: BlockType,
    /// 1-based day number
    pub day: u32,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Search query for the geocoder; required for spot blocks
    #[serde(default)]
    pub place_query: Option<String>,
    /// e.g. "morning", "19:00"
    #[serde(default)]
    pub time_hint: Option<String>,
}

/// 业务规则：非空、标题非空、景点必须有 place_query、天数从 1 开始且不递减、块数上限
pub fn validate_itinerary(itinerary: &ExtractedItinerary) -> Vec<String> {
    let mut errors = Vec::new();
    if itinerary.title.trim().is_empty() {
        errors.push("title is empty".to_string());
    }
    if itinerary.blocks.is_empty() {
        errors.push("itinerary has no blocks".to_string());
        return errors;
    }
    if itinerary.blocks.len() > MAX_BLOCKS {
        errors.push(format!(
            "too many blocks ({} > {MAX_BLOCKS}); merge minor stops",
            itinerary.blocks.len()
        ));
    }

    let mut prev_day = 1;
    for (i, block) in itinerary.blocks.iter().enumerate() {
        let n = i + 1;
        if block.title.trim().is_empty() {
            errors.push(format!("block {n}: title is empty"));
        }
        if block.block_type == BlockType::Spot
            && block.place_query.as_deref().map_or(true, |q| q.trim().is_empty())
        {
            errors.push(format!("block {n} ({}): spot blocks need a place_query", block.title));
        }
        if block.day == 0 {
            errors.push(format!("block {n}: day must be >= 1"));
        } else if block.day < prev_day {
            errors.push(format!(
                "block {n}: day {} comes after day {prev_day}; days must not decrease",
                block.day
            ));
        } else {
            prev_day = block.day;
        }
    }
    errors
}

fn to_blocks(drafts: Vec<DraftBlock>) -> Vec<Block> {
    drafts
        .into_iter()
        .enumerate()
        .map(|(i, d)| Block {
            id: format!("b{}", i + 1),
            block_type: d.block_type,
            day: d.day,
            title: d.title.trim().to_string(),
            description: d.description.filter(|s| !s.trim().is_empty()),
            place_query: d.place_query.map(|q| q.trim().to_string()).filter(|q| !q.is_empty()),
            time_hint: d.time_hint.filter(|s| !s.trim().is_empty()),
            location: None,
        })
        .collect()
}

fn build_prompt(source: &SourceRecord, instructions: Option<&str>) -> String {
    let mut prompt = format!(
        "Turn this travel video into a day-by-day itinerary.\n\n\
         Video title: {}\nURL: {}\n",
        source.title, source.url
    );
    if let Some(author) = &source.author {
        prompt.push_str(&format!("Author: {author}\n"));
    }
    if let Some(desc) = &source.description {
        prompt.push_str(&format!("Description:\n{desc}\n"));
    }
    prompt.push_str(
        "\nUse block types spot, meal, lodging, transit and note. \
         Every spot needs a place_query precise enough for a geocoder (name, city, country). \
         Days start at 1 and never go backwards.",
    );
    if let Some(extra) = instructions.filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("\n\nUser instructions: {extra}"));
    }
    prompt
}

#[derive(Deserialize)]
struct Args {
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default)]
    instructions: Option<String>,
}

pub struct ExtractItineraryTool {
    executor: Arc<TaskExecutor>,
}

impl ExtractItineraryTool {
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for ExtractItineraryTool {
    fn name(&self) -> &str {
        names::EXTRACT_ITINERARY
    }

    fn description(&self) -> &str {
        "Extract a day-by-day itinerary from the fetched video. Replaces any existing blocks. \
         Args: {\"source_id\"?: string, \"instructions\"?: string}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "source_id": { "type": "string", "description": "Id of a fetched video; defaults to the current one" },
                "instructions": { "type": "string", "description": "Extra user preferences" }
            }
        })
    }

    async fn execute(
        &self,
        args: Value,
        state: &mut RuntimeState,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let args: Args = parse_args(args)?;
        let source = match args.source_id.as_deref() {
            Some(id) => state
                .source_by_id(id)
                .ok_or_else(|| ToolError::InvalidArgs(format!("unknown source_id '{id}'")))?,
            None => state.current_source().ok_or_else(|| {
                ToolError::Precondition("no video fetched yet; call fetch_video first".to_string())
            })?,
        };
        let prompt = build_prompt(source, args.instructions.as_deref());

        let outcome = self
            .executor
            .run_structured::<ExtractedItinerary>(
                TaskName::ExtractItinerary,
                &prompt,
                Some(&validate_itinerary),
                cancel,
            )
            .await?;
        tracing::info!(
            model = %outcome.model_used.label,
            attempts = outcome.attempt_count,
            blocks = outcome.result.blocks.len(),
            "Itinerary extracted"
        );

        let title = outcome.result.title.trim().to_string();
        let blocks = to_blocks(outcome.result.blocks);
        state.replace_blocks(blocks.clone(), Some(title.clone()));
        Ok(ToolOutput::ExtractItinerary(ItineraryOutput {
            title,
            count: blocks.len(),
            blocks,
        }))
    }
}
