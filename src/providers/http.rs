//! reqwest 实现：YouTube oEmbed、Nominatim、Unsplash、OpenAI 兼容图片生成

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::ProvidersSection;
use crate::itinerary::{GeoPoint, SourceRecord};
use crate::providers::{
    cancellable, Geocoder, ImageSynthesizer, PhotoSearch, ProviderError, StockPhoto, VideoSource,
};

pub(crate) fn build_client(cfg: &ProvidersSection) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(cfg.request_timeout_secs.max(1)))
        .user_agent(cfg.geocoder_user_agent.clone())
        .build()
        .unwrap_or_default()
}

fn check_status(resp: &reqwest::Response) -> Result<(), ProviderError> {
    let status = resp.status();
    if status.is_success() {
        Ok(())
    } else if status == reqwest::StatusCode::NOT_FOUND {
        Err(ProviderError::NotFound(resp.url().to_string()))
    } else if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        Err(ProviderError::MissingCredentials(resp.url().host_str().unwrap_or("provider").to_string()))
    } else {
        Err(ProviderError::Transport(format!("HTTP {status}")))
    }
}

/// 从常见视频链接中取出视频 id（youtu.be/ID、watch?v=ID、shorts/ID）
pub fn video_id_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?.trim_start_matches("www.").to_lowercase();
    let id = if host == "youtu.be" {
        parsed.path_segments()?.next().map(str::to_string)
    } else if let Some((_, v)) = parsed.query_pairs().find(|(k, _)| k == "v") {
        Some(v.into_owned())
    } else {
        let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            ["shorts", id, ..] | ["embed", id, ..] | ["live", id, ..] => Some(id.to_string()),
            _ => None,
        }
    };
    id.filter(|s| !s.is_empty())
}

// ---- oEmbed ----

#[derive(Deserialize)]
struct OEmbedResponse {
    title: String,
    #[serde(default)]
    author_name: Option<String>,
    #[serde(default)]
    provider_name: Option<String>,
    #[serde(default)]
    thumbnail_url: Option<String>,
}

pub struct OEmbedVideoSource {
    client: Client,
    endpoint: String,
}

impl OEmbedVideoSource {
    pub fn new(client: Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
        }
    }

    async fn request(&self, url: &str, id: String) -> Result<SourceRecord, ProviderError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("url", url), ("format", "json")])
            .send()
            .await?;
        check_status(&resp)?;
        let body: OEmbedResponse = resp.json().await?;
        Ok(SourceRecord {
            id,
            url: url.to_string(),
            title: body.title,
            author: body.author_name,
            description: None,
            thumbnail_url: body.thumbnail_url,
            provider: body.provider_name.unwrap_or_else(|| "oembed".to_string()),
        })
    }
}

#[async_trait]
impl VideoSource for OEmbedVideoSource {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<SourceRecord, ProviderError> {
        let id = video_id_from_url(url)
            .ok_or_else(|| ProviderError::NotFound(format!("no video id in {url}")))?;
        cancellable(cancel, self.request(url, id)).await
    }
}

// ---- Nominatim ----

#[derive(Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

pub struct NominatimGeocoder {
    client: Client,
    endpoint: String,
}

impl NominatimGeocoder {
    pub fn new(client: Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
        }
    }

    async fn request(&self, query: &str) -> Result<GeoPoint, ProviderError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
            .send()
            .await?;
        check_status(&resp)?;
        let places: Vec<NominatimPlace> = resp.json().await?;
        let place = places
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::NotFound(query.to_string()))?;
        match (place.lat.parse::<f64>(), place.lon.parse::<f64>()) {
            (Ok(lat), Ok(lng)) => Ok(GeoPoint { lat, lng }),
            _ => Err(ProviderError::InvalidResponse(format!(
                "bad coordinates for '{query}': {}, {}",
                place.lat, place.lon
            ))),
        }
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str, cancel: &CancellationToken) -> Result<GeoPoint, ProviderError> {
        cancellable(cancel, self.request(query)).await
    }
}

// ---- Unsplash ----

#[derive(Deserialize)]
struct UnsplashSearch {
    results: Vec<UnsplashPhoto>,
}

#[derive(Deserialize)]
struct UnsplashPhoto {
    urls: UnsplashUrls,
    #[serde(default)]
    user: Option<UnsplashUser>,
}

#[derive(Deserialize)]
struct UnsplashUrls {
    regular: String,
}

#[derive(Deserialize)]
struct UnsplashUser {
    name: String,
}

pub struct UnsplashPhotoSearch {
    client: Client,
    endpoint: String,
    access_key: Option<String>,
}

impl UnsplashPhotoSearch {
    pub fn new(client: Client, endpoint: &str, access_key: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            access_key: access_key.filter(|k| !k.trim().is_empty()),
        }
    }

    async fn request(&self, query: &str, key: &str) -> Result<StockPhoto, ProviderError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .header("Authorization", format!("Client-ID {key}"))
            .query(&[("query", query), ("per_page", "1"), ("orientation", "landscape")])
            .send()
            .await?;
        check_status(&resp)?;
        let body: UnsplashSearch = resp.json().await?;
        let photo = body
            .results
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::NotFound(query.to_string()))?;
        Ok(StockPhoto {
            url: photo.urls.regular,
            attribution: photo.user.map(|u| format!("Photo by {} on Unsplash", u.name)),
        })
    }
}

#[async_trait]
impl PhotoSearch for UnsplashPhotoSearch {
    async fn search(&self, query: &str, cancel: &CancellationToken) -> Result<StockPhoto, ProviderError> {
        let key = self
            .access_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingCredentials("unsplash".to_string()))?;
        cancellable(cancel, self.request(query, key)).await
    }
}

// ---- 图片生成 ----

#[derive(Deserialize)]
struct ImagesResponse {
    data: Vec<ImageDatum>,
}

#[derive(Deserialize)]
struct ImageDatum {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
}

pub struct OpenAiImageSynthesizer {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiImageSynthesizer {
    pub fn new(client: Client, base_url: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    async fn request(&self, prompt: &str, key: &str) -> Result<String, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(key)
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "n": 1,
                "size": "1024x1024",
            }))
            .send()
            .await?;
        check_status(&resp)?;
        let body: ImagesResponse = resp.json().await?;
        let datum = body
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("no image returned".to_string()))?;
        match (datum.url, datum.b64_json) {
            (Some(url), _) => Ok(url),
            (None, Some(b64)) => Ok(format!("data:image/png;base64,{b64}")),
            (None, None) => Err(ProviderError::InvalidResponse("image without url".to_string())),
        }
    }
}

#[async_trait]
impl ImageSynthesizer for OpenAiImageSynthesizer {
    async fn synthesize(&self, prompt: &str, cancel: &CancellationToken) -> Result<String, ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingCredentials("image synthesis".to_string()))?;
        cancellable(cancel, self.request(prompt, key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_id_from_url() {
        assert_eq!(video_id_from_url("https://youtu.be/abc123?t=5").as_deref(), Some("abc123"));
        assert_eq!(
            video_id_from_url("https://www.youtube.com/watch?v=xyz&list=1").as_deref(),
            Some("xyz")
        );
        assert_eq!(
            video_id_from_url("https://youtube.com/shorts/s42").as_deref(),
            Some("s42")
        );
        assert!(video_id_from_url("not a url").is_none());
        assert!(video_id_from_url("https://example.com/").is_none());
    }

    #[tokio::test]
    async fn test_missing_unsplash_key_is_credentials_error() {
        let search = UnsplashPhotoSearch::new(Client::new(), "http://127.0.0.1:9", None);
        let err = search.search("kyoto", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProviderError::MissingCredentials(_)));
    }
}
