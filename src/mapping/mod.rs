pub mod bulk_status;
pub mod filament;

use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::{
    config::printer_id::PrinterId,
    conn_manager::{
        conn_bambu::command::CommandPpf, PrinterConnCmd, PrinterDetail, PrinterRegistry,
    },
    project::{Plate, ProjectFile},
};

pub use self::bulk_status::BulkStatus;
pub use self::filament::{map_filaments, FilamentMapping, FilamentSource};

/// Calibration and recording flags applied to every printer in a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintOptions {
    pub timelapse: bool,
    pub bed_levelling: bool,
    pub flow_calibration: bool,
    pub vibration_calibration: bool,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            timelapse: true,
            bed_levelling: true,
            flow_calibration: true,
            vibration_calibration: true,
        }
    }
}

/// Binds one printer to the session's plate selection.
///
/// Clones share the bulk status, so a dispatch task can report back into the
/// row the operator is looking at. The filament mapping is always derived from
/// the printer's latest report.
#[derive(Clone)]
pub struct PrinterMapping {
    registry: PrinterRegistry,
    id: PrinterId,
    name: String,
    plate: Option<Plate>,
    bulk_status: Arc<Mutex<BulkStatus>>,
}

impl std::fmt::Debug for PrinterMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrinterMapping")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("plate", &self.plate.as_ref().map(|p| p.index))
            .field("bulk_status", &*self.bulk_status.lock())
            .finish()
    }
}

impl PrinterMapping {
    pub fn setup(registry: PrinterRegistry, detail: &PrinterDetail) -> Self {
        Self {
            registry,
            id: detail.id.clone(),
            name: detail.name.clone(),
            plate: None,
            bulk_status: Arc::new(Mutex::new(BulkStatus::Idle)),
        }
    }

    pub fn id(&self) -> &PrinterId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn detail(&self) -> Option<PrinterDetail> {
        self.registry.printer_detail(&self.id)
    }

    pub fn is_running(&self) -> bool {
        self.detail().is_some_and(|d| d.is_running())
    }

    /// Connected and in a state that accepts a new job
    pub fn is_ready(&self) -> bool {
        self.detail()
            .is_some_and(|d| d.is_running() && d.state.state.is_ready())
    }

    pub fn status_text(&self) -> String {
        self.detail()
            .map(|d| d.status_text().to_string())
            .unwrap_or_else(|| "Offline".to_string())
    }

    pub fn plate(&self) -> Option<&Plate> {
        self.plate.as_ref()
    }

    pub fn set_plate(&mut self, plate: Option<&Plate>) {
        self.plate = plate.cloned();
    }

    /// `None` without a plate, or until the printer has reported its AMS or
    /// external spool
    pub fn filament_mapping(&self) -> Option<FilamentMapping> {
        let plate = self.plate.as_ref()?;
        let detail = self.detail()?;
        if !detail.state.filaments_reported {
            return None;
        }
        Some(map_filaments(
            plate,
            detail.state.ams.as_ref(),
            detail.state.external_spool.as_ref(),
        ))
    }

    pub fn filament_status_text(&self) -> String {
        match (&self.plate, self.filament_mapping()) {
            (_, Some(m)) => m.status_text(),
            (Some(_), None) => "Waiting for AMS report".to_string(),
            (None, None) => String::new(),
        }
    }

    /// Asks the printer for a full report
    pub fn refresh(&self) {
        if let Err(e) = self.registry.send(PrinterConnCmd::Refresh(self.id.clone())) {
            warn!("refresh {}: {}", self.name, e);
        }
    }

    pub fn can_print(&self) -> bool {
        self.is_ready() && self.filament_mapping().is_some_and(|m| m.is_complete())
    }

    pub fn bulk_status(&self) -> BulkStatus {
        self.bulk_status.lock().clone()
    }

    pub fn set_bulk_status(&self, status: BulkStatus) {
        trace!("bulk status {}: {:?}", self.name, status);
        *self.bulk_status.lock() = status;
    }

    pub fn set_queued(&self) {
        self.set_bulk_status(BulkStatus::Queued);
    }

    /// Moves the bulk status along with what the printer reports
    pub fn update_bulk_status(&self) {
        let Some(detail) = self.detail() else {
            return;
        };
        let mut status = self.bulk_status.lock();
        if let Some(next) = status.reconcile(&detail.state) {
            debug!("{}: {:?} -> {:?}", self.name, *status, next);
            *status = next;
        }
    }

    pub fn build_command(&self, project: &ProjectFile, options: PrintOptions) -> Result<CommandPpf> {
        let plate = self.plate.as_ref().context("no plate selected")?;
        ensure!(
            project.plate(plate.index).is_some(),
            "plate {} is not part of {}",
            plate.index,
            project.filename()
        );
        let mapping = self
            .filament_mapping()
            .context("filaments not mapped, waiting for AMS report")?;
        if !mapping.is_complete() {
            bail!("{}", mapping.status_text());
        }

        Ok(CommandPpf {
            filename: project.filename().to_string(),
            plate_idx: plate.index,
            use_ams: mapping.use_ams,
            timelapse: options.timelapse,
            bed_levelling: options.bed_levelling,
            flow_calibration: options.flow_calibration,
            vibration_calibration: options.vibration_calibration,
            ams_mapping: mapping.ams_mapping(),
        })
    }

    /// Uploads the project and starts the selected plate on this printer
    pub async fn send_print(&self, project: Arc<ProjectFile>, options: PrintOptions) -> Result<()> {
        let res = self._send_print(project, options).await;
        match &res {
            Ok(file) => {
                info!("sent {} to {}", file, self.name);
                self.set_bulk_status(BulkStatus::Sent(file.clone()));
            }
            Err(e) => {
                error!("print on {} failed: {:#}", self.name, e);
                self.set_bulk_status(BulkStatus::Failed(format!("{:#}", e)));
            }
        }
        res.map(|_| ())
    }

    async fn _send_print(&self, project: Arc<ProjectFile>, options: PrintOptions) -> Result<String> {
        let command = self.build_command(&project, options)?;
        let filename = command.filename.clone();

        self.set_bulk_status(BulkStatus::Uploading);
        let (reply, rx) = oneshot::channel();
        self.registry.send(PrinterConnCmd::SendPrint {
            id: self.id.clone(),
            project,
            command,
            reply,
        })?;
        rx.await
            .map_err(|_| anyhow!("printer connection dropped the request"))??;
        Ok(filename)
    }
}


#[cfg(test)]
mod tests {
    use super::test_fleet::{printer, printer_unreported, printer_with_ams, registry};
    use super::*;
    use crate::{project::test_archive::sliced_archive, status::GcodeState};

    fn mapping(registry: &PrinterRegistry, id: &str) -> PrinterMapping {
        let detail = registry.printer_detail(&PrinterId::from_id(id)).unwrap();
        PrinterMapping::setup(registry.clone(), &detail)
    }

    fn project() -> Arc<ProjectFile> {
        let data = sliced_archive(&[(1, &[("PLA", "#FFFFFF")]), (2, &[("TPU", "#000000")])]);
        Arc::new(ProjectFile::setup("parts.3mf", data).unwrap())
    }

    #[test]
    fn can_print_needs_ready_printer_and_mapping() {
        let project = project();
        let (registry, _rx) = registry(vec![
            printer("a", "A", GcodeState::Idle),
            printer("b", "B", GcodeState::Running),
        ]);

        let mut a = mapping(&registry, "a");
        assert!(!a.can_print());
        a.set_plate(project.plate(1));
        assert!(a.can_print());
        a.set_plate(project.plate(2));
        assert!(!a.can_print());
        assert_eq!(a.filament_status_text(), "Unmapped: TPU #000000");

        let mut b = mapping(&registry, "b");
        b.set_plate(project.plate(1));
        assert!(!b.is_ready());
        assert!(!b.can_print());
    }

    #[test]
    fn mapping_follows_the_latest_ams_report() {
        let data = sliced_archive(&[(1, &[("PETG", "#000000")])]);
        let project = ProjectFile::setup("petg.3mf", data).unwrap();
        let (registry, _rx) = registry(vec![printer_unreported("a", "A", GcodeState::Idle)]);

        let mut m = mapping(&registry, "a");
        m.set_plate(project.plate(1));
        assert!(m.filament_mapping().is_none());
        assert_eq!(m.filament_status_text(), "Waiting for AMS report");
        assert!(!m.can_print());
        assert!(m.build_command(&project, PrintOptions::default()).is_err());

        registry.insert(printer_with_ams("a", "A", GcodeState::Idle, &[("PLA", "FFFFFF")]));
        assert!(!m.can_print());
        assert_eq!(m.filament_status_text(), "Unmapped: PETG #000000");

        registry.insert(printer_with_ams(
            "a",
            "A",
            GcodeState::Idle,
            &[("PLA", "FFFFFF"), ("PETG", "000000")],
        ));
        assert!(m.can_print());
        let cmd = m.build_command(&project, PrintOptions::default()).unwrap();
        assert_eq!(cmd.ams_mapping, vec![1]);
    }

    #[test]
    fn command_carries_options_and_mapping() {
        let project = project();
        let (registry, _rx) = registry(vec![printer("a", "A", GcodeState::Finish)]);
        let mut m = mapping(&registry, "a");
        m.set_plate(project.plate(1));

        let options = PrintOptions {
            timelapse: false,
            ..Default::default()
        };
        let cmd = m.build_command(&project, options).unwrap();
        assert_eq!(cmd.filename, "parts.3mf");
        assert_eq!(cmd.plate_idx, 1);
        assert!(cmd.use_ams);
        assert!(!cmd.timelapse);
        assert!(cmd.bed_levelling);
        assert_eq!(cmd.ams_mapping, vec![0]);
    }

    #[tokio::test]
    async fn send_print_reports_into_bulk_status() {
        let project = project();
        let (registry, mut rx) = registry(vec![printer("a", "A", GcodeState::Idle)]);
        let mut m = mapping(&registry, "a");
        m.set_plate(project.plate(1));

        let row = m.clone();
        let task =
            tokio::spawn(async move { m.send_print(project, PrintOptions::default()).await });

        match rx.recv().await.unwrap() {
            PrinterConnCmd::SendPrint { id, reply, .. } => {
                assert_eq!(id.as_str(), "a");
                assert_eq!(row.bulk_status(), BulkStatus::Uploading);
                reply.send(Ok(())).unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }
        task.await.unwrap().unwrap();
        assert_eq!(row.bulk_status(), BulkStatus::Sent("parts.3mf".to_string()));
    }

    #[tokio::test]
    async fn failed_send_is_recorded() {
        let project = project();
        let (registry, mut rx) = registry(vec![printer("a", "A", GcodeState::Idle)]);
        let mut m = mapping(&registry, "a");
        m.set_plate(project.plate(1));

        let row = m.clone();
        let task =
            tokio::spawn(async move { m.send_print(project, PrintOptions::default()).await });

        if let Some(PrinterConnCmd::SendPrint { reply, .. }) = rx.recv().await {
            reply.send(Err(anyhow!("ftps refused"))).unwrap();
        }
        assert!(task.await.unwrap().is_err());
        assert!(matches!(row.bulk_status(), BulkStatus::Failed(msg) if msg.contains("ftps refused")));
    }
}
