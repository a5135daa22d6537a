//! Readers for the two XML config entries Bambu Studio writes into a sliced
//! archive: `Metadata/slice_info.config` (one `<plate>` per sliced plate) and
//! `Metadata/model_settings.config` (plate names).
//!
//! Both files are flat, machine generated and attribute based, so a tag
//! scanner is enough here.

use std::{collections::HashMap, sync::LazyLock};

use regex::Regex;

use crate::status::bambu_status::normalize_color;

use super::{plate::PlateFilament, ProjectError};

/// Highest filament slot a slicer project can use
pub const MAX_FILAMENTS: u32 = 32;

static RE_PLATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<plate\b[^>]*>(.*?)</plate>").unwrap());
static RE_METADATA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<metadata\b([^>]*?)/?>").unwrap());
static RE_FILAMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<filament\b([^>]*?)/?>").unwrap());
static RE_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z_][\w\-]*)\s*=\s*"([^"]*)""#).unwrap());

/// A `<plate>` block from `slice_info.config`, before it is matched against
/// the archive contents
#[derive(Debug, Clone, PartialEq)]
pub struct SlicedPlate {
    pub index: u32,
    pub prediction: u64,
    pub weight: f64,
    pub filaments: Vec<PlateFilament>,
}

pub fn parse_slice_info(xml: &str) -> Result<Vec<SlicedPlate>, ProjectError> {
    let mut out = vec![];
    for plate in RE_PLATE.captures_iter(xml) {
        let body = &plate[1];
        let meta = metadata_map(body);

        let Some(index) = meta.get("index").and_then(|v| v.parse::<u32>().ok()) else {
            tracing::warn!("slice_info plate without a usable index, skipping");
            continue;
        };
        let prediction = meta
            .get("prediction")
            .and_then(|v| v.parse::<f64>().ok())
            .map(|v| v.max(0.0).round() as u64)
            .unwrap_or(0);
        let weight = meta
            .get("weight")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);

        let mut filaments = vec![];
        for c in RE_FILAMENT.captures_iter(body) {
            if let Some(f) = parse_filament(&attributes(&c[1]))? {
                filaments.push(f);
            }
        }

        out.push(SlicedPlate {
            index,
            prediction,
            weight,
            filaments,
        });
    }
    out.sort_by_key(|p| p.index);
    Ok(out)
}

/// Plate index -> user given plate name
pub fn parse_plate_names(xml: &str) -> HashMap<u32, String> {
    let mut out = HashMap::new();
    for plate in RE_PLATE.captures_iter(xml) {
        let meta = metadata_map(&plate[1]);
        let Some(id) = meta.get("plater_id").and_then(|v| v.parse::<u32>().ok()) else {
            continue;
        };
        if let Some(name) = meta.get("plater_name").filter(|n| !n.trim().is_empty()) {
            out.insert(id, name.trim().to_string());
        }
    }
    out
}

/// `None` for entries without a numeric id
fn parse_filament(attrs: &HashMap<String, String>) -> Result<Option<PlateFilament>, ProjectError> {
    let Some(id) = attrs.get("id").and_then(|v| v.parse::<u64>().ok()) else {
        return Ok(None);
    };
    if id == 0 || id > MAX_FILAMENTS as u64 {
        return Err(ProjectError::InvalidFilament(id));
    }
    let num = |k: &str| {
        attrs
            .get(k)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0)
    };
    Ok(Some(PlateFilament {
        id: id as u32,
        filament_type: attrs.get("type").cloned().unwrap_or_default(),
        color: attrs
            .get("color")
            .map(|c| normalize_color(c))
            .unwrap_or_default(),
        used_m: num("used_m"),
        used_g: num("used_g"),
    }))
}

/// First value wins; nested blocks (model instances) repeat some keys
fn metadata_map(body: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for m in RE_METADATA.captures_iter(body) {
        let attrs = attributes(&m[1]);
        if let (Some(k), Some(v)) = (attrs.get("key"), attrs.get("value")) {
            out.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    out
}

fn attributes(s: &str) -> HashMap<String, String> {
    RE_ATTR
        .captures_iter(s)
        .map(|c| (c[1].to_string(), unescape(&c[2])))
        .collect()
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
