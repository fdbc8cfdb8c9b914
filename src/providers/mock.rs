//! Mock 提供方（用于测试，无需网络）
//!
//! 记录每次调用的参数；可指定失败的查询，也可设置延迟来观察取消。

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::itinerary::{GeoPoint, SourceRecord};
use crate::providers::{
    cancellable, Geocoder, ImageSynthesizer, PhotoSearch, ProviderError, StockPhoto, VideoSource,
};

fn slug(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

async fn pause(delay: Option<Duration>, cancel: &CancellationToken) -> Result<(), ProviderError> {
    match delay {
        Some(d) => cancellable(cancel, async move {
            tokio::time::sleep(d).await;
            Ok::<(), ProviderError>(())
        })
        .await,
        None if cancel.is_cancelled() => Err(ProviderError::Cancelled),
        None => Ok(()),
    }
}

fn record<T: Clone>(log: &Mutex<Vec<T>>, item: T) {
    if let Ok(mut l) = log.lock() {
        l.push(item);
    }
}

fn snapshot<T: Clone>(log: &Mutex<Vec<T>>) -> Vec<T> {
    log.lock().map(|l| l.clone()).unwrap_or_default()
}

/// 视频源：按 url 返回预置记录
#[derive(Default)]
pub struct MockVideoSource {
    records: HashMap<String, SourceRecord>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockVideoSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(mut self, record: SourceRecord) -> Self {
        self.records.insert(record.url.clone(), record);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        snapshot(&self.calls)
    }
}

#[async_trait]
impl VideoSource for MockVideoSource {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<SourceRecord, ProviderError> {
        record(&self.calls, url.to_string());
        pause(self.delay, cancel).await?;
        self.records
            .get(url)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(url.to_string()))
    }
}

/// 地理编码：按查询返回预置坐标，未知查询返回 NotFound
#[derive(Default)]
pub struct MockGeocoder {
    places: HashMap<String, GeoPoint>,
    failing: HashSet<String>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_place(mut self, query: &str, lat: f64, lng: f64) -> Self {
        self.places.insert(query.to_string(), GeoPoint { lat, lng });
        self
    }

    pub fn failing(mut self, query: &str) -> Self {
        self.failing.insert(query.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        snapshot(&self.calls)
    }
}

#[async_trait]
impl Geocoder for MockGeocoder {
    async fn geocode(&self, query: &str, cancel: &CancellationToken) -> Result<GeoPoint, ProviderError> {
        record(&self.calls, query.to_string());
        pause(self.delay, cancel).await?;
        if self.failing.contains(query) {
            return Err(ProviderError::Transport(format!("geocoder unavailable for '{query}'")));
        }
        self.places
            .get(query)
            .copied()
            .ok_or_else(|| ProviderError::NotFound(query.to_string()))
    }
}

/// 图库搜索：默认命中，指定的查询失败
#[derive(Default)]
pub struct MockPhotoSearch {
    failing: HashSet<String>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockPhotoSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, query: &str) -> Self {
        self.failing.insert(query.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        snapshot(&self.calls)
    }
}

#[async_trait]
impl PhotoSearch for MockPhotoSearch {
    async fn search(&self, query: &str, cancel: &CancellationToken) -> Result<StockPhoto, ProviderError> {
        record(&self.calls, query.to_string());
        pause(self.delay, cancel).await?;
        if self.failing.contains(query) {
            return Err(ProviderError::Transport(format!("stock search failed for '{query}'")));
        }
        Ok(StockPhoto {
            url: format!("https://stock.example/{}.jpg", slug(query)),
            attribution: Some("Photo by Mock".to_string()),
        })
    }
}

/// 图片生成：默认成功；提示词包含指定片段时失败
#[derive(Default)]
pub struct MockImageSynthesizer {
    failing_fragments: Vec<String>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockImageSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_when_contains(mut self, fragment: &str) -> Self {
        self.failing_fragments.push(fragment.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        snapshot(&self.calls)
    }
}

#[async_trait]
impl ImageSynthesizer for MockImageSynthesizer {
    async fn synthesize(&self, prompt: &str, cancel: &CancellationToken) -> Result<String, ProviderError> {
        record(&self.calls, prompt.to_string());
        pause(self.delay, cancel).await?;
        if self.failing_fragments.iter().any(|f| prompt.contains(f.as_str())) {
            return Err(ProviderError::Transport("synthesis failed".to_string()));
        }
        Ok(format!("https://synth.example/{}.png", slug(prompt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_geocoder() {
        let geo = MockGeocoder::new().with_place("Kyoto Tower", 34.98, 135.75).failing("Down");
        let token = CancellationToken::new();
        assert!(geo.geocode("Kyoto Tower", &token).await.is_ok());
        assert!(matches!(geo.geocode("Nowhere", &token).await, Err(ProviderError::NotFound(_))));
        assert!(matches!(geo.geocode("Down", &token).await, Err(ProviderError::Transport(_))));
        assert_eq!(geo.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_delay_observes_cancel() {
        let photos = MockPhotoSearch::new().with_delay(Duration::from_secs(5));
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = photos.search("temple", &token).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Fushimi Inari, Kyoto!"), "fushimi-inari-kyoto");
    }
}
