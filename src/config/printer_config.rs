use serde::{Deserialize, Serialize};

use super::printer_id::PrinterId;

/// LAN connection details for one Bambu printer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterConfigBambu {
    #[serde(default = "PrinterId::generate")]
    pub id: PrinterId,
    pub serial: String,
    pub name: String,
    pub host: String,
    pub access_code: String,
}

impl PrinterConfigBambu {
    pub fn from_id(
        serial: String,
        name: String,
        host: String,
        access_code: String,
        id: PrinterId,
    ) -> Self {
        Self {
            id,
            serial,
            name,
            host,
            access_code,
        }
    }

    pub fn topic_device_report(&self) -> String {
        format!("device/{}/report", &self.serial)
    }

    pub fn topic_device_request(&self) -> String {
        format!("device/{}/request", &self.serial)
    }
}
