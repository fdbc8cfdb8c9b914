//! search_images：逐景点图库检索，失败或无结果的分支单独回退到图片生成

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{RuntimeState, TaskScheduler, ToolOutput};
use crate::itinerary::{ImageMode, ImageSet, ImageSource};
use crate::providers::Providers;
use crate::tools::images::{default_prompt, fan_out_images, target, Preference};
use crate::tools::{names, Tool, ToolError};

pub struct SearchImagesTool {
    providers: Providers,
    scheduler: Arc<TaskScheduler>,
}

impl SearchImagesTool {
    pub fn new(providers: Providers, scheduler: Arc<TaskScheduler>) -> Self {
        Self { providers, scheduler }
    }
}

#[async_trait]
impl Tool for SearchImagesTool {
    fn name(&self) -> &str {
        names::SEARCH_IMAGES
    }

    fn description(&self) -> &str {
        "Find a stock photo for every spot of the itinerary (replaces any previous image set). No args."
    }

    async fn execute(
        &self,
        _args: Value,
        state: &mut RuntimeState,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        if state.spots().is_empty() {
            return Err(ToolError::Precondition(
                "no spots to illustrate; call extract_itinerary first".to_string(),
            ));
        }
        let targets: Vec<_> = state
            .spots()
            .iter()
            .map(|s| target(s, default_prompt(s, None)))
            .collect();

        let images = fan_out_images(
            &self.scheduler,
            &self.providers,
            targets,
            Preference::StockFirst,
            cancel,
        )
        .await?;

        let set = ImageSet {
            mode: ImageMode::Searched,
            images,
        };
        tracing::info!(
            stock = set.count(ImageSource::Stock),
            synthesized = set.count(ImageSource::Synthesized),
            "Images searched"
        );
        state.set_images(set.clone());
        Ok(ToolOutput::SearchImages(set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MockImageSynthesizer, MockPhotoSearch};
    use crate::tools::testing::{providers_with, state_with_spots};
    use serde_json::json;

    #[tokio::test]
    async fn test_two_failed_lookups_fall_back_to_synthesis() {
        let photos = Arc::new(
            MockPhotoSearch::new()
                .failing("Gion, Kyoto")
                .failing("Arashiyama, Kyoto"),
        );
        let images = Arc::new(MockImageSynthesizer::new());
        let tool = SearchImagesTool::new(
            providers_with(photos.clone(), images.clone()),
            Arc::new(TaskScheduler::new(3)),
        );
        let mut state = state_with_spots(&[
            ("Fushimi Inari", "Fushimi Inari Taisha, Kyoto"),
            ("Gion", "Gion, Kyoto"),
            ("Kinkaku-ji", "Kinkaku-ji, Kyoto"),
            ("Arashiyama", "Arashiyama, Kyoto"),
            ("Nishiki Market", "Nishiki Market, Kyoto"),
        ]);

        let out = tool
            .execute(json!({}), &mut state, &CancellationToken::new())
            .await
            .unwrap();
        let ToolOutput::SearchImages(set) = out else {
            panic!("unexpected output");
        };
        assert_eq!(set.images.len(), 5);
        assert_eq!(set.count(ImageSource::Stock), 3);
        assert_eq!(set.count(ImageSource::Synthesized), 2);
        // 汇合结果按景点顺序
        let ids: Vec<&str> = set.images.iter().map(|i| i.block_id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2", "b3", "b4", "b5"]);
        assert_eq!(set.images[1].source, ImageSource::Synthesized);
        assert_eq!(photos.calls().len(), 5);
        assert_eq!(images.calls().len(), 2);
        assert_eq!(state.images().map(|s| s.mode), Some(ImageMode::Searched));
    }

    #[tokio::test]
    async fn test_requires_spots() {
        let tool = SearchImagesTool::new(
            providers_with(Arc::new(MockPhotoSearch::new()), Arc::new(MockImageSynthesizer::new())),
            Arc::new(TaskScheduler::default()),
        );
        let mut state = RuntimeState::new();
        let err = tool
            .execute(json!({}), &mut state, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Precondition(_)));
    }
}
