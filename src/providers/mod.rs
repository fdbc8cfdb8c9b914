//! 外部领域提供方：视频元数据、地理编码、图库搜索、图片生成
//!
//! 每个提供方都是接受取消令牌的异步调用，返回类型化结果或 ProviderError。

pub mod http;
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::ProvidersSection;
use crate::itinerary::{GeoPoint, SourceRecord};

pub use http::{NominatimGeocoder, OEmbedVideoSource, OpenAiImageSynthesizer, UnsplashPhotoSearch};
pub use mock::{MockGeocoder, MockImageSynthesizer, MockPhotoSearch, MockVideoSource};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("nothing found for '{0}'")]
    NotFound(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("missing credentials for {0}")]
    MissingCredentials(String),

    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

/// 图库搜索命中
#[derive(Debug, Clone, PartialEq)]
pub struct StockPhoto {
    pub url: String,
    pub attribution: Option<String>,
}

#[async_trait]
pub trait VideoSource: Send + Sync {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<SourceRecord, ProviderError>;
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// 无结果时返回 NotFound
    async fn geocode(&self, query: &str, cancel: &CancellationToken) -> Result<GeoPoint, ProviderError>;
}

#[async_trait]
pub trait PhotoSearch: Send + Sync {
    async fn search(&self, query: &str, cancel: &CancellationToken) -> Result<StockPhoto, ProviderError>;
}

#[async_trait]
pub trait ImageSynthesizer: Send + Sync {
    /// 返回生成图片的 URL（或 data URL）
    async fn synthesize(&self, prompt: &str, cancel: &CancellationToken) -> Result<String, ProviderError>;
}

/// 一个回合可用的全部提供方
#[derive(Clone)]
pub struct Providers {
    pub video: Arc<dyn VideoSource>,
    pub geocoder: Arc<dyn Geocoder>,
    pub photos: Arc<dyn PhotoSearch>,
    pub images: Arc<dyn ImageSynthesizer>,
}

impl Providers {
    /// 基于 reqwest 的真实提供方
    pub fn http(cfg: &ProvidersSection) -> Self {
        let client = http::build_client(cfg);
        Self {
            video: Arc::new(OEmbedVideoSource::new(client.clone(), &cfg.oembed_url)),
            geocoder: Arc::new(NominatimGeocoder::new(client.clone(), &cfg.geocoder_url)),
            photos: Arc::new(UnsplashPhotoSearch::new(
                client.clone(),
                &cfg.unsplash_url,
                cfg.unsplash_access_key.clone(),
            )),
            images: Arc::new(OpenAiImageSynthesizer::new(
                client,
                &cfg.image_base_url,
                &cfg.image_model,
                cfg.image_api_key
                    .clone()
                    .or_else(|| std::env::var("OPENAI_API_KEY").ok()),
            )),
        }
    }
}

/// 在取消令牌约束下等待请求
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ProviderError>
where
    F: std::future::Future<Output = Result<T, ProviderError>>,
{
    if cancel.is_cancelled() {
        return Err(ProviderError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        out = fut => out,
    }
}
