//! generate_images：先由结构化任务撰写逐景点提示词，再逐景点生成图片；生成失败的分支回退到图库

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::{RuntimeState, TaskError, TaskScheduler, ToolOutput};
use crate::itinerary::{ImageMode, ImageSet, ImageSource, SpotBlock};
use crate::llm::{TaskExecutor, TaskName};
use crate::providers::Providers;
use crate::tools::images::{default_prompt, fan_out_images, target, Preference};
use crate::tools::{names, parse_args, Tool, ToolError};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ImagePromptSet {
    pub prompts: Vec<ImagePrompt>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ImagePrompt {
    /// Id of the spot block this prompt illustrates
    pub block_id: String,
    /// One-sentence image generation prompt
    pub prompt: String,
}

#[derive(Deserialize)]
struct Args {
    #[serde(default)]
    style: Option<String>,
}

fn build_prompt(spots: &[SpotBlock], style: Option<&str>) -> String {
    let mut prompt = String::from(
        "Write one vivid image generation prompt per spot of this trip. \
         Describe the place, the mood and the light; never ask for text in the image.\n\n",
    );
    for spot in spots {
        prompt.push_str(&format!(
            "- block_id={} day={} title={} place={}\n",
            spot.block_id, spot.day, spot.title, spot.place_query
        ));
    }
    if let Some(style) = style.filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("\nVisual style: {style}"));
    }
    prompt
}

pub struct GenerateImagesTool {
    executor: Arc<TaskExecutor>,
    providers: Providers,
    scheduler: Arc<TaskScheduler>,
}

impl GenerateImagesTool {
    pub fn new(executor: Arc<TaskExecutor>, providers: Providers, scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            executor,
            providers,
            scheduler,
        }
    }

    /// 模型撰写的提示词；缺失的景点用默认提示词，模型不可用时全部用默认
    async fn prompts(
        &self,
        spots: &[SpotBlock],
        style: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, String>, ToolError> {
        let written = match self
            .executor
            .run_structured::<ImagePromptSet>(TaskName::ImagePrompts, &build_prompt(spots, style), None, cancel)
            .await
        {
            Ok(outcome) => outcome.result.prompts,
            Err(e @ (TaskError::Cancelled | TaskError::Configuration(_))) => return Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, "Image prompt task failed, using default prompts");
                Vec::new()
            }
        };
        let mut prompts: HashMap<String, String> = written
            .into_iter()
            .filter(|p| !p.prompt.trim().is_empty())
            .map(|p| (p.block_id, p.prompt.trim().to_string()))
            .collect();
        for spot in spots {
            prompts
                .entry(spot.block_id.clone())
                .or_insert_with(|| default_prompt(spot, style));
        }
        Ok(prompts)
    }
}

#[async_trait]
impl Tool for GenerateImagesTool {
    fn name(&self) -> &str {
        names::GENERATE_IMAGES
    }

    fn description(&self) -> &str {
        "Generate an illustration for every spot of the itinerary (replaces any previous image set). \
         Args: {\"style\"?: string}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "style": { "type": "string", "description": "Visual style, e.g. watercolor" }
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
        let spots = state.spots().to_vec();
        if spots.is_empty() {
            return Err(ToolError::Precondition(
                "no spots to illustrate; call extract_itinerary first".to_string(),
            ));
        }
        let mut prompts = self.prompts(&spots, args.style.as_deref(), cancel).await?;
        let targets: Vec<_> = spots
            .iter()
            .map(|s| {
                let prompt = prompts
                    .remove(&s.block_id)
                    .unwrap_or_else(|| default_prompt(s, args.style.as_deref()));
                target(s, prompt)
            })
            .collect();

        let images = fan_out_images(
            &self.scheduler,
            &self.providers,
            targets,
            Preference::SynthesisFirst,
            cancel,
        )
        .await?;

        let set = ImageSet {
            mode: ImageMode::Generated,
            images,
        };
        tracing::info!(
            synthesized = set.count(ImageSource::Synthesized),
            stock = set.count(ImageSource::Stock),
            "Images generated"
        );
        state.set_images(set.clone());
        Ok(ToolOutput::GenerateImages(set))
    }
}
