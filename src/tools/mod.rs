//! 工具层：注册表、步骤信封与七个行程工具
//!
//! 工具集按回合构建（预览目录随会话变化），所有调用都经过 StepEnvelope。

pub mod executor;
pub mod extract_itinerary;
pub mod fetch_video;
pub mod generate_images;
pub(crate) mod images;
pub mod registry;
pub mod render_document;
pub mod resolve_locations;
pub mod search_images;
pub mod summarize_trip;

use std::sync::Arc;

use crate::core::TaskScheduler;
use crate::llm::TaskExecutor;
use crate::providers::Providers;

pub use executor::{SessionBinding, StepEnvelope};
pub use extract_itinerary::{validate_itinerary, DraftBlock, ExtractItineraryTool, ExtractedItinerary};
pub use fetch_video::FetchVideoTool;
pub use generate_images::{GenerateImagesTool, ImagePrompt, ImagePromptSet};
pub use registry::{parse_args, Tool, ToolError, ToolRegistry};
pub use render_document::RenderDocumentTool;
pub use resolve_locations::ResolveLocationsTool;
pub use search_images::SearchImagesTool;
pub use summarize_trip::SummarizeTripTool;

/// 工具名（也是快照 tool_outputs 的键）
pub mod names {
    pub const FETCH_VIDEO: &str = "fetch_video";
    pub const EXTRACT_ITINERARY: &str = "extract_itinerary";
    pub const RESOLVE_LOCATIONS: &str = "resolve_locations";
    pub const SEARCH_IMAGES: &str = "search_images";
    pub const GENERATE_IMAGES: &str = "generate_images";
    pub const SUMMARIZE_TRIP: &str = "summarize_trip";
    pub const RENDER_DOCUMENT: &str = "render_document";
}

/// 工具共享的协作方
#[derive(Clone)]
pub struct ToolDeps {
    pub executor: Arc<TaskExecutor>,
    pub providers: Providers,
    pub scheduler: Arc<TaskScheduler>,
}

/// 本回合的完整工具集
pub fn itinerary_tools(deps: &ToolDeps, preview_root: &str) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(FetchVideoTool::new(deps.providers.video.clone()));
    registry.register(ExtractItineraryTool::new(deps.executor.clone()));
    registry.register(ResolveLocationsTool::new(
        deps.providers.geocoder.clone(),
        deps.scheduler.clone(),
    ));
    registry.register(SearchImagesTool::new(deps.providers.clone(), deps.scheduler.clone()));
    registry.register(GenerateImagesTool::new(
        deps.executor.clone(),
        deps.providers.clone(),
        deps.scheduler.clone(),
    ));
    registry.register(SummarizeTripTool::new(deps.executor.clone()));
    registry.register(RenderDocumentTool::new(preview_root));
    registry
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::core::RuntimeState;
    use crate::itinerary::{Block, BlockType, SourceRecord, VideoContext};
    use crate::llm::{LlmBackends, MockLlmClient, ModelTaskRouter, TaskExecutor};
    use crate::providers::{
        MockGeocoder, MockImageSynthesizer, MockPhotoSearch, MockVideoSource, Providers,
    };

    pub fn mock_executor(llm: Arc<MockLlmClient>) -> Arc<TaskExecutor> {
        let router = ModelTaskRouter::defaults().with_provider("mock");
        let backends = LlmBackends::new().with("mock", llm);
        Arc::new(TaskExecutor::new(Arc::new(router), Arc::new(backends)))
    }

    pub fn kyoto_source() -> SourceRecord {
        SourceRecord {
            id: "kyoto1".into(),
            url: "https://youtu.be/kyoto1".into(),
            title: "48 hours in Kyoto".into(),
            author: Some("Wanderer".into()),
            description: Some("Temples, markets and ramen".into()),
            thumbnail_url: None,
            provider: "YouTube".into(),
        }
    }

    pub fn state_with_video() -> RuntimeState {
        let mut state = RuntimeState::new();
        let source = kyoto_source();
        state.set_video(VideoContext::from(&source));
        state.cache_source(source);
        state
    }

    /// 每个 (title, place_query) 生成一个 day 1 的景点块，id 为 b1..
    pub fn state_with_spots(spots: &[(&str, &str)]) -> RuntimeState {
        let mut state = state_with_video();
        let blocks = spots
            .iter()
            .enumerate()
            .map(|(i, (title, place))| Block {
                id: format!("b{}", i + 1),
                block_type: BlockType::Spot,
                day: 1,
                title: title.to_string(),
                description: None,
                place_query: Some(place.to_string()),
                time_hint: None,
                location: None,
            })
            .collect();
        state.replace_blocks(blocks, Some("Kyoto".into()));
        state
    }

    pub fn providers_with(
        photos: Arc<MockPhotoSearch>,
        images: Arc<MockImageSynthesizer>,
    ) -> Providers {
        Providers {
            video: Arc::new(MockVideoSource::new().with_record(kyoto_source())),
            geocoder: Arc::new(MockGeocoder::new()),
            photos,
            images,
        }
    }

    #[test]
    fn test_registry_has_all_tools() {
        let deps = super::ToolDeps {
            executor: mock_executor(Arc::new(MockLlmClient::new())),
            providers: providers_with(Arc::new(MockPhotoSearch::new()), Arc::new(MockImageSynthesizer::new())),
            scheduler: Arc::new(crate::core::TaskScheduler::default()),
        };
        let registry = super::itinerary_tools(&deps, "previews/local");
        assert_eq!(registry.tool_names().len(), 7);
        assert!(registry.get(super::names::RENDER_DOCUMENT).is_some());
    }
}
