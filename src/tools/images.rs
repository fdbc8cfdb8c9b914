//! 图片工具共用的逐景点扇出：每个分支先走首选来源，失败时单独回退到另一来源

use tokio_util::sync::CancellationToken;

use crate::core::TaskScheduler;
use crate::itinerary::{ImageAsset, ImageSource, SpotBlock};
use crate::providers::{ProviderError, Providers};
use crate::tools::ToolError;

/// 单个景点的取图目标
#[derive(Debug, Clone)]
pub(crate) struct ImageTarget {
    pub block_id: String,
    /// 图库检索词
    pub query: String,
    /// 生成提示词
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Preference {
    StockFirst,
    SynthesisFirst,
}

pub(crate) fn default_prompt(spot: &SpotBlock, style: Option<&str>) -> String {
    let style = style
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("natural light, travel photography");
    format!(
        "A photo of {} ({}), {style}, no text or watermark",
        spot.title, spot.place_query
    )
}

pub(crate) fn target(spot: &SpotBlock, prompt: String) -> ImageTarget {
    ImageTarget {
        block_id: spot.block_id.clone(),
        query: spot.place_query.clone(),
        prompt,
    }
}

async fn stock(
    providers: &Providers,
    target: &ImageTarget,
    cancel: &CancellationToken,
) -> Result<ImageAsset, ProviderError> {
    let photo = providers.photos.search(&target.query, cancel).await?;
    Ok(ImageAsset {
        block_id: target.block_id.clone(),
        url: photo.url,
        source: ImageSource::Stock,
        prompt: Some(target.query.clone()),
        attribution: photo.attribution,
    })
}

async fn synthesized(
    providers: &Providers,
    target: &ImageTarget,
    cancel: &CancellationToken,
) -> Result<ImageAsset, ProviderError> {
    let url = providers.images.synthesize(&target.prompt, cancel).await?;
    Ok(ImageAsset {
        block_id: target.block_id.clone(),
        url,
        source: ImageSource::Synthesized,
        prompt: Some(target.prompt.clone()),
        attribution: None,
    })
}

/// 一个分支：首选来源失败（非取消）时回退到另一来源
async fn fetch_one(
    providers: &Providers,
    target: ImageTarget,
    preference: Preference,
    cancel: &CancellationToken,
) -> Result<ImageAsset, ProviderError> {
    let first = match preference {
        Preference::StockFirst => stock(providers, &target, cancel).await,
        Preference::SynthesisFirst => synthesized(providers, &target, cancel).await,
    };
    match first {
        Ok(asset) => Ok(asset),
        Err(ProviderError::Cancelled) => Err(ProviderError::Cancelled),
        Err(e) => {
            tracing::debug!(block = %target.block_id, error = %e, ?preference, "Image source failed, falling back");
            let second = match preference {
                Preference::StockFirst => synthesized(providers, &target, cancel).await,
                Preference::SynthesisFirst => stock(providers, &target, cancel).await,
            };
            if let Err(e2) = &second {
                tracing::warn!(block = %target.block_id, error = %e2, "No image for block");
            }
            second
        }
    }
}

/// 扇出取图并汇合；任一分支被取消则整体取消，全部失败时报最后一个错误
pub(crate) async fn fan_out_images(
    scheduler: &TaskScheduler,
    providers: &Providers,
    targets: Vec<ImageTarget>,
    preference: Preference,
    cancel: &CancellationToken,
) -> Result<Vec<ImageAsset>, ToolError> {
    let total = targets.len();
    let results = scheduler
        .fan_out(targets, |t| fetch_one(providers, t, preference, cancel))
        .await;

    if cancel.is_cancelled() || results.iter().any(|r| matches!(r, Err(e) if e.is_cancelled())) {
        return Err(ToolError::Cancelled);
    }
    let mut images = Vec::with_capacity(total);
    let mut last_error = None;
    for result in results {
        match result {
            Ok(asset) => images.push(asset),
            Err(e) => last_error = Some(e),
        }
    }
    match last_error {
        Some(e) if images.is_empty() => Err(ToolError::Provider(e)),
        _ => Ok(images),
    }
}
