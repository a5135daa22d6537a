use crate::status::{
    bambu_status::{AmsSlot, AmsStatus, AmsUnit, AMS_SLOTS},
    GcodeState, GenericPrinterStateUpdate, PrinterStateUpdate,
};

use super::conn_bambu::message::{self, PrintData};

/// messages from a printer worker to PrinterConnManager
#[derive(Debug, Clone)]
pub enum WorkerMsg {
    StatusUpdate(GenericPrinterStateUpdate),

    Connected,
    Disconnected,
}

impl WorkerMsg {
    /// Folds one `print` report into a status update. Only fields present in
    /// the report produce an update.
    pub fn from_print_data(print: &PrintData) -> Self {
        let mut out = vec![];

        if let Some(s) = print.gcode_state.as_deref() {
            out.push(PrinterStateUpdate::State(GcodeState::from_report(s)));
        }
        if let Some(p) = print.mc_percent {
            out.push(PrinterStateUpdate::Progress(p as f32 / 100.0));
        }
        if let Some(m) = print.mc_remaining_time {
            // reported in minutes
            out.push(PrinterStateUpdate::TimeRemaining(chrono::Duration::minutes(
                m,
            )));
        }
        if let Some(s) = print.subtask_name.as_ref() {
            out.push(PrinterStateUpdate::SubtaskName(s.clone()));
        }
        if let Some(ams) = print.ams.as_ref().and_then(convert_ams) {
            out.push(PrinterStateUpdate::Ams(ams));
        }
        if let Some(vt) = print.vt_tray.as_ref() {
            let slot = match vt.tray_type.as_deref() {
                Some(t) if !t.is_empty() => Some(AmsSlot::new(
                    t,
                    vt.tray_color.as_deref().unwrap_or_default(),
                )),
                _ => None,
            };
            out.push(PrinterStateUpdate::ExternalSpool(slot));
        }

        WorkerMsg::StatusUpdate(GenericPrinterStateUpdate(out))
    }
}

/// `None` when the report carries no unit list, which P1 printers do for
/// partial updates
fn convert_ams(ams: &message::Ams) -> Option<AmsStatus> {
    let units = ams.ams.as_ref()?;
    let mut out = AmsStatus::default();

    for (i, unit) in units.iter().enumerate() {
        let id = unit
            .id
            .as_deref()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(i as i64);
        let mut slots: [Option<AmsSlot>; AMS_SLOTS] = Default::default();
        for tray in unit.tray.iter().flatten() {
            let Some(tray_id) = tray.id.as_deref().and_then(|s| s.parse::<usize>().ok()) else {
                continue;
            };
            if tray_id >= AMS_SLOTS {
                continue;
            }
            let Some(material) = tray.tray_type.as_deref().filter(|t| !t.is_empty()) else {
                continue;
            };
            slots[tray_id] = Some(AmsSlot::new(
                material,
                tray.tray_color.as_deref().unwrap_or_default(),
            ));
        }
        out.units.insert(id, AmsUnit { id, slots });
    }

    Some(out)
}
