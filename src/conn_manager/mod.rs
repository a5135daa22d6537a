pub mod conn_bambu;
pub mod worker_message;

use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use dashmap::DashMap;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, oneshot};

use crate::{
    config::{printer_id::PrinterId, AppConfig},
    project::ProjectFile,
    status::{GcodeState, GenericPrinterState},
};

use self::{
    conn_bambu::bambu_proto::BambuClient, conn_bambu::command::CommandPpf,
    worker_message::WorkerMsg,
};

/// messages from PrinterConnManager to the session
#[derive(Debug, Clone, PartialEq)]
pub enum PrinterConnMsg {
    Connected(PrinterId),
    Disconnected(PrinterId),
    StatusUpdated(PrinterId),
}

/// messages from the session to PrinterConnManager
#[derive(Debug)]
pub enum PrinterConnCmd {
    /// Upload `project` and start `command` on printer `id`. The outcome is
    /// sent on `reply` once the printer accepted the command or the attempt
    /// failed.
    SendPrint {
        id: PrinterId,
        project: Arc<ProjectFile>,
        command: CommandPpf,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Ask a printer for a full status report
    Refresh(PrinterId),
}

/// messages from PrinterConnManager to a printer worker
#[derive(Debug)]
pub enum WorkerCmd {
    PushAll,
    Print {
        project: Arc<ProjectFile>,
        command: CommandPpf,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Live view of one configured printer
#[derive(Debug, Clone)]
pub struct PrinterDetail {
    pub id: PrinterId,
    pub name: String,
    pub host: String,
    /// worker alive and connected to the printer
    pub running: bool,
    pub state: GenericPrinterState,
}

impl PrinterDetail {
    pub fn new(id: PrinterId, name: &str, host: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            host: host.to_string(),
            running: false,
            state: GenericPrinterState::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn status_text(&self) -> &str {
        if self.running {
            self.state.state.description()
        } else {
            GcodeState::Offline.description()
        }
    }
}

/// Shared, cloneable handle on the printers known to the manager
#[derive(Clone)]
pub struct PrinterRegistry {
    states: Arc<DashMap<PrinterId, PrinterDetail>>,
    cmd_tx: mpsc::UnboundedSender<PrinterConnCmd>,
}

impl PrinterRegistry {
    pub fn new(cmd_tx: mpsc::UnboundedSender<PrinterConnCmd>) -> Self {
        Self {
            states: Arc::new(DashMap::new()),
            cmd_tx,
        }
    }

    pub fn insert(&self, detail: PrinterDetail) {
        self.states.insert(detail.id.clone(), detail);
    }

    /// All printers, ordered by name
    pub fn printers_detail(&self) -> Vec<PrinterDetail> {
        let mut out: Vec<PrinterDetail> = self.states.iter().map(|v| v.value().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn printer_detail(&self, id: &PrinterId) -> Option<PrinterDetail> {
        self.states.get(id).map(|v| v.value().clone())
    }

    pub fn find_by_name(&self, name: &str) -> Option<PrinterDetail> {
        self.states
            .iter()
            .find(|v| v.name.eq_ignore_ascii_case(name) || v.id.as_str() == name)
            .map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn send(&self, cmd: PrinterConnCmd) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| anyhow!("printer connection manager is not running"))
    }

    fn update<F: FnOnce(&mut PrinterDetail)>(&self, id: &PrinterId, f: F) -> bool {
        match self.states.get_mut(id) {
            Some(mut detail) => {
                f(detail.value_mut());
                true
            }
            None => false,
        }
    }
}

struct WorkerHandle {
    cmd_tx: mpsc::UnboundedSender<WorkerCmd>,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Owns one connection worker per configured printer and routes commands and
/// reports between them and the registry
pub struct PrinterConnManager {
    config: AppConfig,
    registry: PrinterRegistry,
    workers: HashMap<PrinterId, WorkerHandle>,
    cmd_rx: mpsc::UnboundedReceiver<PrinterConnCmd>,
    msg_tx: mpsc::UnboundedSender<PrinterConnMsg>,
    worker_msg_tx: mpsc::UnboundedSender<(PrinterId, WorkerMsg)>,
    worker_msg_rx: mpsc::UnboundedReceiver<(PrinterId, WorkerMsg)>,
}

impl PrinterConnManager {
    pub fn new(
        config: AppConfig,
        cmd_tx: mpsc::UnboundedSender<PrinterConnCmd>,
        cmd_rx: mpsc::UnboundedReceiver<PrinterConnCmd>,
        msg_tx: mpsc::UnboundedSender<PrinterConnMsg>,
    ) -> Self {
        let (worker_msg_tx, worker_msg_rx) = mpsc::unbounded_channel();
        Self {
            config,
            registry: PrinterRegistry::new(cmd_tx),
            workers: HashMap::new(),
            cmd_rx,
            msg_tx,
            worker_msg_tx,
            worker_msg_rx,
        }
    }

    pub fn registry(&self) -> PrinterRegistry {
        self.registry.clone()
    }

    /// Registers every configured printer and starts its worker. A printer
    /// that cannot be started stays listed as offline.
    pub async fn init(&mut self) -> Result<()> {
        for id in self.config.printer_ids() {
            if let Err(e) = self.start_printer(id.clone()).await {
                error!("failed to start printer {}: {:?}", id, e);
            }
        }
        info!(
            "started {}/{} printer workers",
            self.workers.len(),
            self.config.len()
        );
        Ok(())
    }

    async fn start_printer(&mut self, id: PrinterId) -> Result<()> {
        let printer_cfg = self
            .config
            .get_printer(&id)
            .with_context(|| format!("printer not found: {}", id))?;
        {
            let cfg = printer_cfg.read().await;
            self.registry
                .insert(PrinterDetail::new(id.clone(), &cfg.name, &cfg.host));
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        let mut client = BambuClient::new_and_init(
            printer_cfg,
            self.worker_msg_tx.clone(),
            cmd_rx,
            kill_rx,
        )
        .await?;

        tokio::spawn(async move {
            if let Err(e) = client.run().await {
                error!("printer worker exited: {:?}", e);
            }
        });

        self.workers.insert(
            id,
            WorkerHandle {
                cmd_tx,
                kill_tx: Some(kill_tx),
            },
        );
        Ok(())
    }

    /// Routes commands and worker reports until every command sender is gone
    pub async fn run(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!("command channel closed");
                        break;
                    }
                },
                Some((id, msg)) = self.worker_msg_rx.recv() => {
                    self.handle_worker_msg(id, msg);
                }
            }
        }
        self.shutdown();
        Ok(())
    }

    fn handle_command(&mut self, cmd: PrinterConnCmd) {
        match cmd {
            PrinterConnCmd::SendPrint {
                id,
                project,
                command,
                reply,
            } => {
                let Some(worker) = self.workers.get(&id) else {
                    let _ = reply.send(Err(anyhow!("printer {} has no connection", id)));
                    return;
                };
                let cmd = WorkerCmd::Print {
                    project,
                    command,
                    reply,
                };
                if let Err(mpsc::error::SendError(cmd)) = worker.cmd_tx.send(cmd) {
                    if let WorkerCmd::Print { reply, .. } = cmd {
                        let _ = reply.send(Err(anyhow!("printer {} worker has stopped", id)));
                    }
                }
            }
            PrinterConnCmd::Refresh(id) => {
                if let Some(worker) = self.workers.get(&id) {
                    if worker.cmd_tx.send(WorkerCmd::PushAll).is_err() {
                        warn!("printer {} worker has stopped", id);
                    }
                }
            }
        }
    }

    fn handle_worker_msg(&mut self, id: PrinterId, msg: WorkerMsg) {
        let out = match msg {
            WorkerMsg::Connected => {
                info!("printer {} connected", id);
                self.registry.update(&id, |d| d.running = true);
                PrinterConnMsg::Connected(id.clone())
            }
            WorkerMsg::Disconnected => {
                warn!("printer {} disconnected", id);
                self.registry.update(&id, |d| d.running = false);
                PrinterConnMsg::Disconnected(id.clone())
            }
            WorkerMsg::StatusUpdate(update) => {
                if !self.registry.update(&id, |d| d.state.update(update)) {
                    trace!("status for unknown printer {}", id);
                    return;
                }
                PrinterConnMsg::StatusUpdated(id.clone())
            }
        };
        if self.msg_tx.send(out).is_err() {
            trace!("no listener for printer messages");
        }
    }

    pub fn shutdown(&mut self) {
        for (id, mut worker) in self.workers.drain() {
            debug!("stopping worker for {}", id);
            if let Some(kill_tx) = worker.kill_tx.take() {
                let _ = kill_tx.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{GenericPrinterStateUpdate, PrinterStateUpdate};

    fn manager() -> (
        PrinterConnManager,
        mpsc::UnboundedReceiver<PrinterConnMsg>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let manager = PrinterConnManager::new(AppConfig::empty(), cmd_tx, cmd_rx, msg_tx);
        (manager, msg_rx)
    }

    #[test]
    fn printers_are_listed_by_name() {
        let (manager, _) = manager();
        let registry = manager.registry();
        registry.insert(PrinterDetail::new(PrinterId::from_id("b"), "Zed", "10.0.0.2"));
        registry.insert(PrinterDetail::new(PrinterId::from_id("a"), "Alpha", "10.0.0.1"));

        let names: Vec<_> = registry
            .printers_detail()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["Alpha", "Zed"]);
        assert_eq!(registry.find_by_name("zed").unwrap().host, "10.0.0.2");
    }

    #[test]
    fn worker_messages_update_registry() {
        let (mut manager, mut msg_rx) = manager();
        let id = PrinterId::from_id("p1");
        let registry = manager.registry();
        registry.insert(PrinterDetail::new(id.clone(), "P1", "10.0.0.1"));

        manager.handle_worker_msg(id.clone(), WorkerMsg::Connected);
        manager.handle_worker_msg(
            id.clone(),
            WorkerMsg::StatusUpdate(GenericPrinterStateUpdate(vec![
                PrinterStateUpdate::State(GcodeState::Idle),
            ])),
        );

        let detail = registry.printer_detail(&id).unwrap();
        assert!(detail.is_running());
        assert_eq!(detail.status_text(), "Idle");
        assert_eq!(msg_rx.try_recv().unwrap(), PrinterConnMsg::Connected(id.clone()));
        assert_eq!(msg_rx.try_recv().unwrap(), PrinterConnMsg::StatusUpdated(id.clone()));

        manager.handle_worker_msg(id.clone(), WorkerMsg::Disconnected);
        let detail = registry.printer_detail(&id).unwrap();
        assert!(!detail.is_running());
        assert_eq!(detail.status_text(), "Offline");
    }

    #[tokio::test]
    async fn print_to_unconnected_printer_fails() {
        let (mut manager, _) = manager();
        let data = crate::project::test_archive::sliced_archive(&[(1, &[("PLA", "#FFFFFF")])]);
        let project = Arc::new(ProjectFile::setup("a.3mf", data).unwrap());
        let (reply, rx) = oneshot::channel();

        manager.handle_command(PrinterConnCmd::SendPrint {
            id: PrinterId::from_id("missing"),
            project,
            command: CommandPpf {
                filename: "a.3mf".to_string(),
                plate_idx: 1,
                use_ams: false,
                timelapse: true,
                bed_levelling: true,
                flow_calibration: true,
                vibration_calibration: true,
                ams_mapping: vec![],
            },
            reply,
        });

        assert!(rx.await.unwrap().is_err());
    }
}
