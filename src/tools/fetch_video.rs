//! fetch_video：读取视频元数据并按 id / url 缓存

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::{RuntimeState, ToolOutput};
use crate::itinerary::VideoContext;
use crate::providers::VideoSource;
use crate::tools::{names, parse_args, Tool, ToolError};

#[derive(Deserialize)]
struct Args {
    url: String,
}

pub struct FetchVideoTool {
    source: Arc<dyn VideoSource>,
}

impl FetchVideoTool {
    pub fn new(source: Arc<dyn VideoSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Tool for FetchVideoTool {
    fn name(&self) -> &str {
        names::FETCH_VIDEO
    }

    fn description(&self) -> &str {
        "Fetch title, author and thumbnail of a travel video. Args: {\"url\": string}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "url": { "type": "string", "description": "Video URL" } },
            "required": ["url"]
        })
    }

    async fn execute(
        &self,
        args: Value,
        state: &mut RuntimeState,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let args: Args = parse_args(args)?;
        let url = args.url.trim();
        if url.is_empty() {
            return Err(ToolError::InvalidArgs("url must not be empty".to_string()));
        }

        let record = match state.source_by_url(url) {
            Some(cached) => {
                tracing::debug!(url, id = %cached.id, "Video served from cache");
                cached.clone()
            }
            None => {
                let record = self.source.fetch(url, cancel).await?;
                state.cache_source(record.clone());
                record
            }
        };
        state.set_video(VideoContext::from(&record));
        Ok(ToolOutput::FetchVideo(record))
    }
}
