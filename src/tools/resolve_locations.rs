//! resolve_locations：并发地理编码全部未解析景点；每个分支失败后用简化查询再试一次

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;

use crate::core::{LocationReport, RuntimeState, TaskScheduler, ToolOutput};
use crate::itinerary::{GeoPoint, SpotBlock};
use crate::providers::{Geocoder, ProviderError};
use crate::tools::{names, Tool, ToolError};

/// 去掉括号内容后取第一个逗号前的部分；与原查询相同时退回景点标题
pub(crate) fn simplify_query(query: &str, title: &str) -> Option<String> {
    let mut stripped = String::with_capacity(query.len());
    let mut depth = 0usize;
    for c in query.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => stripped.push(c),
            _ => {}
        }
    }
    let original = query.trim();
    let head = stripped.split(',').next().unwrap_or("").trim();
    let candidate = if !head.is_empty() && head != original {
        head
    } else {
        title.trim()
    };
    (!candidate.is_empty() && candidate != original).then(|| candidate.to_string())
}

async fn geocode_spot(
    geocoder: &dyn Geocoder,
    spot: SpotBlock,
    cancel: &CancellationToken,
) -> Result<(String, Option<GeoPoint>), ProviderError> {
    match geocoder.geocode(&spot.place_query, cancel).await {
        Ok(point) => return Ok((spot.block_id, Some(point))),
        Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
        Err(e) => tracing::debug!(block = %spot.block_id, query = %spot.place_query, error = %e, "Geocode failed"),
    }
    let Some(simpler) = simplify_query(&spot.place_query, &spot.title) else {
        return Ok((spot.block_id, None));
    };
    match geocoder.geocode(&simpler, cancel).await {
        Ok(point) => Ok((spot.block_id, Some(point))),
        Err(ProviderError::Cancelled) => Err(ProviderError::Cancelled),
        Err(e) => {
            tracing::warn!(block = %spot.block_id, query = %simpler, error = %e, "Spot left unresolved");
            Ok((spot.block_id, None))
        }
    }
}

pub struct ResolveLocationsTool {
    geocoder: Arc<dyn Geocoder>,
    scheduler: Arc<TaskScheduler>,
}

impl ResolveLocationsTool {
    pub fn new(geocoder: Arc<dyn Geocoder>, scheduler: Arc<TaskScheduler>) -> Self {
        Self { geocoder, scheduler }
    }
}

#[async_trait]
impl Tool for ResolveLocationsTool {
    fn name(&self) -> &str {
        names::RESOLVE_LOCATIONS
    }

    fn description(&self) -> &str {
        "Look up coordinates for every spot of the current itinerary that has none yet. No args."
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
        let pending: Vec<SpotBlock> = state
            .spots()
            .iter()
            .filter(|s| !s.is_resolved())
            .cloned()
            .collect();

        if !pending.is_empty() {
            let geocoder = self.geocoder.as_ref();
            let results = self
                .scheduler
                .fan_out(pending, |spot| geocode_spot(geocoder, spot, cancel))
                .await;
            if cancel.is_cancelled() || results.iter().any(Result::is_err) {
                return Err(ToolError::Cancelled);
            }
            let updates: Vec<(String, Option<GeoPoint>)> =
                results.into_iter().filter_map(Result::ok).collect();
            state.apply_locations(&updates);
        }

        let spots = state.spots().to_vec();
        let unresolved: Vec<String> = spots
            .iter()
            .filter(|s| !s.is_resolved())
            .map(|s| s.block_id.clone())
            .collect();
        tracing::info!(
            spots = spots.len(),
            unresolved = unresolved.len(),
            "Locations resolved"
        );
        Ok(ToolOutput::ResolveLocations(LocationReport {
            resolved: spots.len() - unresolved.len(),
            unresolved,
            spots,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockGeocoder;
    use crate::tools::testing::state_with_spots;
    use serde_json::json;

    #[test]
    fn test_simplify_query() {
        assert_eq!(
            simplify_query("Fushimi Inari Taisha, Kyoto, Japan", "Fushimi Inari").as_deref(),
            Some("Fushimi Inari Taisha")
        );
        assert_eq!(
            simplify_query("Kiyomizu-dera (Otowa falls)", "Kiyomizu Temple").as_deref(),
            Some("Kiyomizu-dera")
        );
        assert_eq!(
            simplify_query("Kiyomizu-dera", "Kiyomizu Temple").as_deref(),
            Some("Kiyomizu Temple")
        );
        assert_eq!(simplify_query("Nishiki", "Nishiki"), None);
    }

    #[tokio::test]
    async fn test_resolve_with_simplified_retry() {
        let geocoder = Arc::new(
            MockGeocoder::new()
                .with_place("Kinkaku-ji", 35.03, 135.72)
                .with_place("Gion, Kyoto", 35.0, 135.77),
        );
        let tool = ResolveLocationsTool::new(geocoder.clone(), Arc::new(TaskScheduler::new(2)));
        let mut state = state_with_spots(&[
            ("Kinkaku-ji", "Kinkaku-ji, Kyoto"),
            ("Gion", "Gion, Kyoto"),
            ("Secret Bar", "Unknown alley"),
        ]);

        let out = tool
            .execute(json!({}), &mut state, &CancellationToken::new())
            .await
            .unwrap();
        let ToolOutput::ResolveLocations(report) = out else {
            panic!("unexpected output");
        };
        assert_eq!(report.resolved, 2);
        assert_eq!(report.unresolved, vec!["b3".to_string()]);
        assert!(!state.locations_resolved());
        // 第一个景点原查询失败后用简化查询命中
        assert!(geocoder.calls().contains(&"Kinkaku-ji".to_string()));
        // 未命中的景点：原查询 + 标题各一次
        assert_eq!(geocoder.calls().iter().filter(|q| q.as_str() == "Secret Bar").count(), 1);
    }

    #[tokio::test]
    async fn test_resolved_spots_are_skipped() {
        let geocoder = Arc::new(MockGeocoder::new().with_place("Gion, Kyoto", 35.0, 135.77));
        let tool = ResolveLocationsTool::new(geocoder.clone(), Arc::new(TaskScheduler::default()));
        let mut state = state_with_spots(&[("Gion", "Gion, Kyoto")]);
        let token = CancellationToken::new();
        tool.execute(json!({}), &mut state, &token).await.unwrap();
        tool.execute(json!({}), &mut state, &token).await.unwrap();
        assert_eq!(geocoder.calls().len(), 1);
        assert!(state.locations_resolved());
    }

    #[tokio::test]
    async fn test_cancel_aborts_resolution() {
        let geocoder = Arc::new(MockGeocoder::new().with_delay(std::time::Duration::from_secs(5)));
        let tool = ResolveLocationsTool::new(geocoder, Arc::new(TaskScheduler::default()));
        let mut state = state_with_spots(&[("Gion", "Gion, Kyoto")]);
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = tool.execute(json!({}), &mut state, &token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(state.spots()[0].location.is_none());
    }
}
