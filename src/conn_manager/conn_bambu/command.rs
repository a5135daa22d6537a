use std::sync::atomic::{AtomicU64, Ordering};

static SEQUENCE_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_sequence_id() -> String {
    SEQUENCE_ID.fetch_add(1, Ordering::Relaxed).to_string()
}

/// A print request for one printer, built from the selected plate, the
/// operator's options and that printer's filament mapping
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPpf {
    /// name of the archive on the printer's storage
    pub filename: String,
    pub plate_idx: u32,
    pub use_ams: bool,
    pub timelapse: bool,
    pub bed_levelling: bool,
    pub flow_calibration: bool,
    pub vibration_calibration: bool,
    /// global AMS tray index per project filament slot
    pub ams_mapping: Vec<i64>,
}

impl CommandPpf {
    pub fn url(&self) -> String {
        format!("file:///sdcard/{}", self.filename)
    }

    pub fn param(&self) -> String {
        crate::project::Plate::gcode_path_for(self.plate_idx)
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    PushAll,
    ProjectFile(CommandPpf),
}

impl Command {
    pub fn get_payload(&self) -> String {
        self.to_json(&next_sequence_id()).to_string()
    }

    /// The printer echoes `sequence_id` in its answer
    pub fn to_json(&self, sequence_id: &str) -> serde_json::Value {
        match self {
            Command::PushAll => serde_json::json!({
                "pushing": {
                    "sequence_id": sequence_id,
                    "command": "pushall",
                    "version": 1,
                    "push_target": 1,
                }
            }),
            Command::ProjectFile(ppf) => serde_json::json!({
                "print": {
                    "sequence_id": sequence_id,
                    "command": "project_file",
                    "param": ppf.param(),
                    "url": ppf.url(),
                    "subtask_name": ppf.filename,
                    "md5": "",
                    "project_id": "0",
                    "profile_id": "0",
                    "task_id": "0",
                    "subtask_id": "0",
                    "timelapse": ppf.timelapse,
                    "bed_type": "auto",
                    "bed_levelling": ppf.bed_levelling,
                    "flow_cali": ppf.flow_calibration,
                    "vibration_cali": ppf.vibration_calibration,
                    "layer_inspect": true,
                    "use_ams": ppf.use_ams,
                    "ams_mapping": ppf.ams_mapping,
                }
            }),
        }
    }
}
