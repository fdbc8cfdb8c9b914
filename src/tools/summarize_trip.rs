//! summarize_trip：文本任务，生成写入上下文的行程总结

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{RuntimeState, ToolOutput, TripSummary};
use crate::itinerary::Block;
use crate::llm::{TaskExecutor, TaskName, TextRequest};
use crate::tools::{names, Tool, ToolError};

const SYSTEM: &str = "You write short, friendly trip summaries for travelers. \
                      Plain prose, at most two paragraphs, no headings.";

fn build_prompt(title: Option<&str>, blocks: &[Block]) -> String {
    let mut prompt = format!("Summarize this trip: {}\n\n", title.unwrap_or("Untitled trip"));
    for block in blocks {
        let kind = serde_json::to_value(block.block_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        prompt.push_str(&format!("Day {} [{kind}] {}", block.day, block.title));
        if let Some(desc) = &block.description {
            prompt.push_str(&format!(": {desc}"));
        }
        prompt.push('\n');
    }
    prompt
}

pub struct SummarizeTripTool {
    executor: Arc<TaskExecutor>,
}

impl SummarizeTripTool {
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for SummarizeTripTool {
    fn name(&self) -> &str {
        names::SUMMARIZE_TRIP
    }

    fn description(&self) -> &str {
        "Write a short summary of the current itinerary. No args."
    }

    async fn execute(
        &self,
        _args: Value,
        state: &mut RuntimeState,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        if state.blocks().is_empty() {
            return Err(ToolError::Precondition(
                "no itinerary yet; call extract_itinerary first".to_string(),
            ));
        }
        let request = TextRequest::new(build_prompt(state.title(), state.blocks())).with_system(SYSTEM);
        let outcome = self
            .executor
            .run_text(TaskName::SummarizeTrip, &request, cancel)
            .await?;
        let summary = outcome.result;
        state.set_summary(summary.clone());
        Ok(ToolOutput::SummarizeTrip(TripSummary { summary }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::tools::testing::{mock_executor, state_with_spots};
    use serde_json::json;

    #[tokio::test]
    async fn test_summary_is_stored() {
        let llm = Arc::new(MockLlmClient::new());
        llm.push_text("  Two days of temples and food.  ");
        let tool = SummarizeTripTool::new(mock_executor(llm.clone()));
        let mut state = state_with_spots(&[("Gion", "Gion, Kyoto")]);

        tool.execute(json!({}), &mut state, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.summary(), Some("Two days of temples and food."));
        let call = &llm.calls()[0];
        assert!(call.last_user_text().contains("Day 1 [spot] Gion"));
        assert!(call.system_text().contains("trip summaries"));
    }
}
