use anyhow::Result;
use tracing::{debug, error, info, trace, warn};

use std::sync::Arc;
use tokio::{runtime::Handle, task::JoinHandle};

use crate::{
    mapping::{PrintOptions, PrinterMapping},
    project::ProjectFile,
};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DispatchError {
    #[error("Nothing selected")]
    NothingSelected,
    #[error("No project file or plate selected")]
    NoProject,
    #[error("Please ensure printers are idle and filaments are mapped: {}", .0.join(", "))]
    NotReady(Vec<String>),
}

/// What was handed to the runtime. Each handle resolves to that printer's
/// own outcome; nothing is aggregated.
#[derive(Debug)]
pub struct DispatchReport {
    pub queued: usize,
    pub handles: Vec<JoinHandle<Result<()>>>,
}

/// Fans a print out to a set of printers, one task per printer
#[derive(Debug, Clone)]
pub struct BatchDispatcher {
    handle: Handle,
}

impl BatchDispatcher {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Dispatcher on the runtime of the calling task
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// All or nothing: if any printer cannot take the job, no printer gets it.
    /// Returns once every task is spawned, without waiting on any of them.
    pub fn dispatch(
        &self,
        selected: &[PrinterMapping],
        project: Option<&Arc<ProjectFile>>,
        options: PrintOptions,
        operator: &str,
    ) -> Result<DispatchReport, DispatchError> {
        if selected.is_empty() {
            return Err(DispatchError::NothingSelected);
        }
        let project = project.ok_or(DispatchError::NoProject)?;
        if selected.iter().any(|m| m.plate().is_none()) {
            return Err(DispatchError::NoProject);
        }

        let not_ready: Vec<String> = selected
            .iter()
            .filter(|m| !m.can_print())
            .map(|m| m.name().to_string())
            .collect();
        if !not_ready.is_empty() {
            warn!("batch rejected, not ready: {}", not_ready.join(", "));
            return Err(DispatchError::NotReady(not_ready));
        }

        let names: Vec<&str> = selected.iter().map(|m| m.name()).collect();
        info!(
            "operator[{}] printing file[{}] plate[{}] on printers[{}] options[{:?}]",
            operator,
            project.filename(),
            selected[0].plate().map(|p| p.index).unwrap_or_default(),
            names.join(", "),
            options
        );

        let handles = selected
            .iter()
            .map(|m| {
                m.set_queued();
                let mapping = m.clone();
                let project = project.clone();
                self.handle.spawn(async move {
                    debug!("print task started for {}", mapping.name());
                    mapping.send_print(project, options).await
                })
            })
            .collect::<Vec<_>>();

        Ok(DispatchReport {
            queued: handles.len(),
            handles,
        })
    }
}
