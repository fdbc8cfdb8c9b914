//! Markdown 渲染：按天分节，景点附坐标与图片，末尾附行程总结

use std::fmt::Write;

use crate::itinerary::{Block, BlockType, ImageAsset, ImageSource};

fn type_label(t: BlockType) -> &'static str {
    match t {
        BlockType::Spot => "Spot",
        BlockType::Meal => "Meal",
        BlockType::Lodging => "Stay",
        BlockType::Transit => "Transit",
        BlockType::Note => "Note",
    }
}

pub fn render_markdown(
    title: &str,
    blocks: &[Block],
    images: &[ImageAsset],
    summary: Option<&str>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}\n", title.trim());

    if let Some(summary) = summary.map(str::trim).filter(|s| !s.is_empty()) {
        let _ = writeln!(out, "{summary}\n");
    }

    let mut current_day = 0;
    for block in blocks {
        if block.day != current_day {
            current_day = block.day;
            let _ = writeln!(out, "## Day {current_day}\n");
        }
        let mut heading = format!("### {}: {}", type_label(block.block_type), block.title.trim());
        if let Some(time) = block.time_hint.as_deref().filter(|t| !t.trim().is_empty()) {
            let _ = write!(heading, " ({})", time.trim());
        }
        let _ = writeln!(out, "{heading}\n");

        if let Some(desc) = block.description.as_deref().filter(|d| !d.trim().is_empty()) {
            let _ = writeln!(out, "{}\n", desc.trim());
        }
        if let Some(loc) = block.location {
            let _ = writeln!(out, "Location: {:.5}, {:.5}\n", loc.lat, loc.lng);
        }
        for img in images.iter().filter(|i| i.block_id == block.id) {
            let caption = match img.source {
                ImageSource::Stock => img.attribution.as_deref().unwrap_or("Photo"),
                ImageSource::Synthesized => "Illustration",
            };
            let _ = writeln!(out, "![{}]({})\n", caption, img.url);
        }
    }

    if blocks.is_empty() {
        out.push_str("_No itinerary yet._\n");
    }
    out.trim_end().to_string() + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itinerary::GeoPoint;

    #[test]
    fn test_render_groups_by_day() {
        let blocks = vec![
            Block {
                id: "b1".into(),
                block_type: BlockType::Spot,
                day: 1,
                title: "Fushimi Inari".into(),
                description: Some("Go early.".into()),
                place_query: Some("Fushimi Inari Taisha".into()),
                time_hint: Some("07:00".into()),
                location: Some(GeoPoint { lat: 34.96714, lng: 135.77267 }),
            },
            Block {
                id: "b2".into(),
                block_type: BlockType::Meal,
                day: 2,
                title: "Nishiki Market".into(),
                description: None,
                place_query: None,
                time_hint: None,
                location: None,
            },
        ];
        let images = vec![ImageAsset {
            block_id: "b1".into(),
            url: "https://img/1.jpg".into(),
            source: ImageSource::Stock,
            prompt: None,
            attribution: Some("Photo by A".into()),
        }];
        let md = render_markdown("Kyoto", &blocks, &images, Some("Two days."));
        assert!(md.starts_with("# Kyoto\n\nTwo days."));
        assert!(md.contains("## Day 1"));
        assert!(md.contains("### Spot: Fushimi Inari (07:00)"));
        assert!(md.contains("![Photo by A](https://img/1.jpg)"));
        assert!(md.contains("## Day 2"));
        assert!(md.contains("### Meal: Nishiki Market"));
    }

    #[test]
    fn test_render_empty() {
        assert!(render_markdown("T", &[], &[], None).contains("No itinerary yet"));
    }
}
