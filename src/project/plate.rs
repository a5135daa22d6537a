use serde::Serialize;

/// One sliced build plate inside a project archive
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plate {
    /// 1-based, as numbered inside the archive
    pub index: u32,
    pub name: String,
    /// predicted print time in seconds
    pub prediction: u64,
    /// grams
    pub weight: f64,
    pub filaments: Vec<PlateFilament>,
    /// archive entry holding the PNG preview
    pub thumbnail: String,
}

impl Plate {
    pub fn gcode_path(&self) -> String {
        Self::gcode_path_for(self.index)
    }

    pub fn gcode_path_for(index: u32) -> String {
        format!("Metadata/plate_{}.gcode", index)
    }

    pub fn thumbnail_path_for(index: u32) -> String {
        format!("Metadata/plate_{}.png", index)
    }

    pub fn prediction_text(&self) -> String {
        format_time(self.prediction)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateFilament {
    /// 1-based filament slot in the slicer project
    pub id: u32,
    pub filament_type: String,
    /// `RRGGBB`, upper case
    pub color: String,
    pub used_m: f64,
    pub used_g: f64,
}

/// `1h 05m`, `12m 03s`
pub fn format_time(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else {
        format!("{}m {:02}s", minutes, secs)
    }
}
