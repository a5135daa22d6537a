use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use bytes::Bytes;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::task::JoinHandle;

use crate::{
    config::{printer_id::PrinterId, AppConfig},
    conn_manager::PrinterRegistry,
    dispatch::{BatchDispatcher, DispatchError, DispatchReport},
    filter::FilterSet,
    mapping::{PrintOptions, PrinterMapping},
    project::{Plate, ProjectError, ProjectFile},
};

pub const COLUMN_NAME: &str = "Name";
pub const COLUMN_STATUS: &str = "Printer Status";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error("No sliced plates found")]
    NoSlicedPlates,
    #[error("No project file loaded")]
    NoProject,
    #[error("Unknown plate: {0}")]
    UnknownPlate(u32),
}

/// One operator's batch print workflow: load a project, pick a plate and
/// options, pick printers, print.
pub struct BatchPrintSession {
    registry: PrinterRegistry,
    dispatcher: BatchDispatcher,
    max_upload_size: u64,
    refresh_interval: Duration,
    project: Option<Arc<ProjectFile>>,
    plate: Option<u32>,
    options: PrintOptions,
    mappings: Vec<PrinterMapping>,
    filters: FilterSet<PrinterMapping>,
    selected: BTreeSet<PrinterId>,
}

impl BatchPrintSession {
    pub fn new(registry: PrinterRegistry, dispatcher: BatchDispatcher, max_upload_size: u64) -> Self {
        let filters = FilterSet::new()
            .with_column(COLUMN_NAME, |m: &PrinterMapping| m.name().to_string())
            .with_column(COLUMN_STATUS, |m: &PrinterMapping| m.status_text());
        Self {
            registry,
            dispatcher,
            max_upload_size,
            refresh_interval: AppConfig::empty().refresh_interval(),
            project: None,
            plate: None,
            options: PrintOptions::default(),
            mappings: vec![],
            filters,
            selected: BTreeSet::new(),
        }
    }

    pub fn from_config(
        registry: PrinterRegistry,
        dispatcher: BatchDispatcher,
        config: &AppConfig,
    ) -> Self {
        let mut out = Self::new(registry, dispatcher, config.max_upload_size());
        out.refresh_interval = config.refresh_interval();
        out
    }

    /// How often bulk status should be reconciled
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// One row per connected printer, ordered by name
    pub fn configure(&mut self) {
        let plate = self.plate().cloned();
        self.mappings = self
            .registry
            .printers_detail()
            .iter()
            .filter(|d| d.is_running())
            .map(|d| {
                let mut m = PrinterMapping::setup(self.registry.clone(), d);
                m.set_plate(plate.as_ref());
                m
            })
            .collect();

        let ids: BTreeSet<PrinterId> = self.mappings.iter().map(|m| m.id().clone()).collect();
        self.selected.retain(|id| ids.contains(id));
        debug!("configured {} printer rows", self.mappings.len());
    }

    /// Replaces the current project. The previous one is released first, so
    /// a failed load leaves no project loaded.
    pub fn load_project_file(
        &mut self,
        filename: &str,
        data: impl Into<Bytes>,
    ) -> Result<&ProjectFile, SessionError> {
        self.close();

        let data: Bytes = data.into();
        if data.len() as u64 > self.max_upload_size {
            return Err(ProjectError::TooLarge {
                size: data.len() as u64,
                max: self.max_upload_size,
            }
            .into());
        }

        let project = ProjectFile::setup(filename, data)?;
        let Some(first) = project.plates().first().map(|p| p.index) else {
            warn!("{} has no sliced plates", filename);
            return Err(SessionError::NoSlicedPlates);
        };

        self.project = Some(Arc::new(project));
        self.select_plate(first)?;
        self.project().ok_or(SessionError::NoProject)
    }

    pub fn project(&self) -> Option<&ProjectFile> {
        self.project.as_deref()
    }

    pub fn project_arc(&self) -> Option<&Arc<ProjectFile>> {
        self.project.as_ref()
    }

    pub fn plates(&self) -> &[Plate] {
        self.project().map(|p| p.plates()).unwrap_or_default()
    }

    pub fn plate(&self) -> Option<&Plate> {
        let index = self.plate?;
        self.project()?.plate(index)
    }

    pub fn select_plate(&mut self, index: u32) -> Result<(), SessionError> {
        let project = self.project.as_ref().ok_or(SessionError::NoProject)?;
        let plate = project
            .plate(index)
            .ok_or(SessionError::UnknownPlate(index))?;
        for m in self.mappings.iter_mut() {
            m.set_plate(Some(plate));
        }
        self.plate = Some(index);
        debug!("selected plate {} of {}", index, project.filename());
        Ok(())
    }

    pub fn options(&self) -> PrintOptions {
        self.options
    }

    pub fn options_mut(&mut self) -> &mut PrintOptions {
        &mut self.options
    }

    pub fn mappings(&self) -> &[PrinterMapping] {
        &self.mappings
    }

    pub fn mapping(&self, id: &PrinterId) -> Option<&PrinterMapping> {
        self.mappings.iter().find(|m| m.id() == id)
    }

    pub fn set_filter(&mut self, column: &str, value: &str) -> Result<()> {
        self.filters.set_filter(column, value)
    }

    pub fn visible_rows(&self) -> Vec<&PrinterMapping> {
        self.filters.apply(&self.mappings)
    }

    /// Returns false if there is no row for `id`
    pub fn select(&mut self, id: &PrinterId) -> bool {
        if self.mapping(id).is_none() {
            return false;
        }
        self.selected.insert(id.clone());
        true
    }

    pub fn deselect(&mut self, id: &PrinterId) {
        self.selected.remove(id);
    }

    pub fn clear_selection(&mut self) {
        self.selected.clear();
    }

    pub fn selected(&self) -> Vec<&PrinterMapping> {
        self.mappings
            .iter()
            .filter(|m| self.selected.contains(m.id()))
            .collect()
    }

    /// Asks every printer for a full report
    pub fn refresh(&self) {
        for m in self.mappings.iter() {
            m.refresh();
        }
    }

    pub fn update_bulk_status(&self) {
        for m in self.mappings.iter() {
            m.update_bulk_status();
        }
    }

    /// Reconciles bulk status every `interval` for the current rows. Rows
    /// added by a later `configure` need a new task.
    pub fn spawn_status_refresh(&self, interval: Duration) -> JoinHandle<()> {
        let mappings = self.mappings.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                for m in mappings.iter() {
                    m.update_bulk_status();
                }
            }
        })
    }

    pub fn print_selected(&self, operator: &str) -> Result<DispatchReport, DispatchError> {
        let selected: Vec<PrinterMapping> = self.selected().into_iter().cloned().collect();
        if self.plate.is_none() && !selected.is_empty() {
            return Err(DispatchError::NoProject);
        }
        self.dispatcher
            .dispatch(&selected, self.project.as_ref(), self.options, operator)
    }

    /// Releases the project. Jobs already dispatched keep their own handle on
    /// it until they finish.
    pub fn close(&mut self) {
        if let Some(project) = self.project.take() {
            debug!("closing project file {}", project.filename());
        }
        self.plate = None;
        for m in self.mappings.iter_mut() {
            m.set_plate(None);
        }
    }
}

impl Drop for BatchPrintSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conn_manager::PrinterConnCmd,
        mapping::{
            test_fleet::{printer, registry},
            BulkStatus,
        },
        project::test_archive::sliced_archive,
        status::GcodeState,
    };

    fn session(registry: PrinterRegistry) -> BatchPrintSession {
        let mut s = BatchPrintSession::new(registry, BatchDispatcher::current(), 1024 * 1024);
        s.configure();
        s
    }

    fn archive() -> Vec<u8> {
        sliced_archive(&[(1, &[("PLA", "#FFFFFF")]), (2, &[("PLA", "#FF0000")])])
    }

    #[tokio::test]
    async fn loading_releases_previous_project() {
        let (registry, _rx) = registry(vec![]);
        let mut s = session(registry);

        s.load_project_file("first.3mf", archive()).unwrap();
        let first = Arc::downgrade(s.project_arc().unwrap());

        let project = s.load_project_file("second.3mf", archive()).unwrap();
        assert_eq!(project.filename(), "second.3mf");
        assert!(first.upgrade().is_none());
        assert_eq!(s.plate().unwrap().index, 1);
    }

    #[tokio::test]
    async fn failed_load_leaves_nothing_loaded() {
        let (registry, _rx) = registry(vec![]);
        let mut s = session(registry);
        s.load_project_file("first.3mf", archive()).unwrap();

        let err = s
            .load_project_file("broken.3mf", b"garbage".to_vec())
            .unwrap_err();
        assert!(matches!(err, SessionError::Project(ProjectError::Archive(_))));
        assert!(s.project().is_none());
        assert!(s.plate().is_none());
    }

    #[tokio::test]
    async fn empty_project_is_reported() {
        let (registry, _rx) = registry(vec![]);
        let mut s = session(registry);
        let err = s
            .load_project_file("empty.3mf", sliced_archive(&[]))
            .unwrap_err();
        assert!(matches!(err, SessionError::NoSlicedPlates));
        assert_eq!(err.to_string(), "No sliced plates found");
        assert!(s.project().is_none());
        assert!(s.plates().is_empty());
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let (registry, _rx) = registry(vec![]);
        let mut s = BatchPrintSession::new(registry, BatchDispatcher::current(), 16);
        let err = s.load_project_file("big.3mf", archive()).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Project(ProjectError::TooLarge { max: 16, .. })
        ));
    }

    #[tokio::test]
    async fn plate_selection_reaches_every_row() {
        let (registry, _rx) = registry(vec![
            printer("a", "A", GcodeState::Idle),
            printer("b", "B", GcodeState::Idle),
        ]);
        let mut s = session(registry);
        s.load_project_file("parts.3mf", archive()).unwrap();

        assert!(s.mappings().iter().all(|m| m.can_print()));
        s.select_plate(2).unwrap();
        assert!(s.mappings().iter().all(|m| m.plate().unwrap().index == 2));
        // red PLA is not loaded, white is used instead
        assert!(s.mappings().iter().all(|m| m.can_print()));
        assert!(matches!(s.select_plate(7), Err(SessionError::UnknownPlate(7))));
    }

    #[tokio::test]
    async fn only_connected_printers_get_rows() {
        let mut offline = printer("b", "B", GcodeState::Idle);
        offline.running = false;
        let (registry, _rx) = registry(vec![printer("a", "A", GcodeState::Idle), offline]);
        let s = session(registry);
        assert_eq!(s.mappings().len(), 1);
        assert_eq!(s.mappings()[0].name(), "A");
    }

    #[tokio::test]
    async fn filters_limit_visible_rows() {
        let (registry, _rx) = registry(vec![
            printer("a", "Garage X1C", GcodeState::Idle),
            printer("b", "Garage P1S", GcodeState::Running),
            printer("c", "Office A1", GcodeState::Idle),
        ]);
        let mut s = session(registry);

        s.set_filter(COLUMN_NAME, "garage").unwrap();
        s.set_filter(COLUMN_STATUS, "idle").unwrap();
        let rows: Vec<_> = s.visible_rows().iter().map(|m| m.name().to_string()).collect();
        assert_eq!(rows, vec!["Garage X1C"]);

        s.set_filter(COLUMN_STATUS, "").unwrap();
        assert_eq!(s.visible_rows().len(), 2);
    }

    #[tokio::test]
    async fn status_refresh_follows_printer_reports() {
        let (registry, _rx) = registry(vec![printer("a", "A", GcodeState::Idle)]);
        let s = session(registry.clone());
        let row = s.mappings()[0].clone();
        row.set_bulk_status(BulkStatus::Sent("parts.3mf".to_string()));

        let mut detail = registry.printer_detail(row.id()).unwrap();
        detail.state.state = GcodeState::Running;
        detail.state.subtask_name = Some("parts.3mf".to_string());
        registry.insert(detail);

        let task = s.spawn_status_refresh(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();
        assert_eq!(row.bulk_status(), BulkStatus::Printing("parts.3mf".to_string()));
    }

    #[tokio::test]
    async fn print_selected_requires_a_selection() {
        let (registry, mut rx) = registry(vec![printer("a", "A", GcodeState::Idle)]);
        let mut s = session(registry);
        s.load_project_file("parts.3mf", archive()).unwrap();

        assert!(matches!(
            s.print_selected("op"),
            Err(DispatchError::NothingSelected)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispatched_jobs_outlive_the_session_project() {
        let (registry, mut rx) = registry(vec![
            printer("a", "A", GcodeState::Idle),
            printer("b", "B", GcodeState::Idle),
        ]);
        let mut s = session(registry);
        s.load_project_file("parts.3mf", archive()).unwrap();
        s.options_mut().timelapse = false;
        assert!(s.select(&PrinterId::from_id("a")));
        assert!(s.select(&PrinterId::from_id("b")));
        assert!(!s.select(&PrinterId::from_id("zzz")));

        let report = s.print_selected("alice").unwrap();
        assert_eq!(report.queued, 2);

        s.load_project_file("other.3mf", archive()).unwrap();

        for _ in 0..2 {
            let Some(PrinterConnCmd::SendPrint {
                project,
                command,
                reply,
                ..
            }) = rx.recv().await
            else {
                panic!("expected a print command");
            };
            assert_eq!(project.filename(), "parts.3mf");
            assert!(!project.data().is_empty());
            assert!(!command.timelapse);
            reply.send(Ok(())).unwrap();
        }
        for h in report.handles {
            h.await.unwrap().unwrap();
        }
    }
}
