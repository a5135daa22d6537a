use crate::status::{GcodeState, GenericPrinterState};

/// Progress of the last batch job sent to one printer
#[derive(Debug, Default, Clone, PartialEq)]
pub enum BulkStatus {
    #[default]
    Idle,
    Queued,
    /// archive upload and start command in flight
    Uploading,
    Sent(String),
    Printing(String),
    Finished(String),
    Failed(String),
}

impl BulkStatus {
    pub fn text(&self) -> String {
        match self {
            BulkStatus::Idle => String::new(),
            BulkStatus::Queued => "Queued".to_string(),
            BulkStatus::Uploading => "Uploading".to_string(),
            BulkStatus::Sent(file) => format!("Sent {}", file),
            BulkStatus::Printing(file) => format!("Printing {}", file),
            BulkStatus::Finished(file) => format!("Finished {}", file),
            BulkStatus::Failed(msg) => format!("Failed: {}", msg),
        }
    }

    /// Next status given the printer's latest report, `None` if unchanged
    pub fn reconcile(&self, state: &GenericPrinterState) -> Option<BulkStatus> {
        let is_job = |file: &str| state.subtask_name.as_deref() == Some(file);
        match self {
            BulkStatus::Sent(file) if is_job(file) && state.state.is_printing() => {
                Some(BulkStatus::Printing(file.clone()))
            }
            BulkStatus::Printing(file) if is_job(file) => {
                match &state.state {
                    GcodeState::Finish => Some(BulkStatus::Finished(file.clone())),
                    GcodeState::Failed => {
                        Some(BulkStatus::Failed(format!("{} failed on printer", file)))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}
