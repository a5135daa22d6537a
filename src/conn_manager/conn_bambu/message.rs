use serde::Deserialize;

/// Anything published on `device/{serial}/report`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Print(PrintMessage),
    Info(InfoMessage),
    System(SystemMessage),
    #[serde(skip)]
    Unknown(Option<String>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrintMessage {
    pub print: PrintData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfoMessage {
    pub info: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemMessage {
    pub system: serde_json::Value,
}

/// The subset of the `print` report this crate reads. P1/A1 printers only
/// send changed fields, so everything is optional.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PrintData {
    pub command: Option<String>,
    pub sequence_id: Option<String>,
    pub result: Option<String>,
    pub reason: Option<String>,

    pub gcode_state: Option<String>,
    pub subtask_name: Option<String>,
    pub mc_percent: Option<i64>,
    /// minutes
    pub mc_remaining_time: Option<i64>,

    pub ams: Option<Ams>,
    pub vt_tray: Option<VirtualTray>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ams {
    pub ams: Option<Vec<AmsUnit>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AmsUnit {
    pub id: Option<String>,
    pub tray: Option<Vec<AmsTray>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AmsTray {
    pub id: Option<String>,
    pub tray_type: Option<String>,
    pub tray_color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualTray {
    pub id: Option<String>,
    pub tray_type: Option<String>,
    pub tray_color: Option<String>,
}

impl PrintData {
    pub fn is_command(&self, command: &str) -> bool {
        self.command.as_deref() == Some(command)
    }
}
