use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use dashmap::DashMap;
use rumqttc::{tokio_rustls::rustls, AsyncClient, EventLoop, MqttOptions};
use std::{sync::Arc, time::Duration};
use tokio::sync::{oneshot, RwLock};

use crate::{
    config::{printer_config::PrinterConfigBambu, printer_id::PrinterId},
    conn_manager::{worker_message::WorkerMsg, WorkerCmd},
    project::ProjectFile,
};

use super::{
    bambu_listener::BambuListener,
    command::{next_sequence_id, Command, CommandPpf},
    ftps::FtpsClient,
    message::PrintData,
};

pub const MQTT_PORT: u16 = 8883;
pub const LAN_USER: &str = "bblp";

/// How long a printer gets to answer a `project_file` request
pub const PRINT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// scary, insecure, do not allow outside of local network
#[derive(Debug)]
pub struct NoCertificateVerification {}

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        intermediates: &[rustls::pki_types::CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        ocsp_response: &[u8],
        now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA1,
            rustls::SignatureScheme::ECDSA_SHA1_Legacy,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ED448,
        ]
    }
}

/// TLS settings shared by MQTT and FTPS. Printers present a self-signed
/// certificate, so nothing is verified.
pub fn insecure_tls_config() -> Arc<rustls::ClientConfig> {
    let client_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification {}))
        .with_no_client_auth();
    Arc::new(client_config)
}

/// `project_file` requests waiting for the printer's answer, by sequence id
#[derive(Clone, Default)]
pub struct PendingAcks(Arc<DashMap<String, oneshot::Sender<Result<()>>>>);

impl PendingAcks {
    pub fn register(&self, sequence_id: &str) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.0.insert(sequence_id.to_string(), tx);
        rx
    }

    pub fn cancel(&self, sequence_id: &str) {
        self.0.remove(sequence_id);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Completes the request `print` answers. Returns false when `print` is
    /// not an answer to a pending request.
    pub fn resolve(&self, print: &PrintData) -> bool {
        if !print.is_command("project_file") {
            return false;
        }
        let (Some(seq), Some(result)) = (print.sequence_id.as_deref(), print.result.as_deref())
        else {
            return false;
        };
        let Some((_, tx)) = self.0.remove(seq) else {
            return false;
        };
        let res = if result.eq_ignore_ascii_case("success") {
            Ok(())
        } else {
            Err(anyhow!(
                "printer rejected the print: {}",
                print.reason.as_deref().unwrap_or(result)
            ))
        };
        let _ = tx.send(res);
        true
    }

    /// Waits for the answer registered under `sequence_id`
    pub async fn wait(
        &self,
        sequence_id: &str,
        rx: oneshot::Receiver<Result<()>>,
        timeout: Duration,
    ) -> Result<()> {
        let res = tokio::time::timeout(timeout, rx).await;
        self.0.remove(sequence_id);
        match res {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => bail!("connection closed before the printer answered"),
            Err(_) => bail!("printer did not answer within {:?}", timeout),
        }
    }
}

pub struct BambuClient {
    id: PrinterId,
    config: Arc<RwLock<PrinterConfigBambu>>,
    client: rumqttc::AsyncClient,
    tx: tokio::sync::mpsc::UnboundedSender<(PrinterId, WorkerMsg)>,
    cmd_rx: tokio::sync::mpsc::UnboundedReceiver<WorkerCmd>,
    tls: Arc<rustls::ClientConfig>,
    acks: PendingAcks,
    topic_device_request: String,
    topic_device_report: String,
}

impl BambuClient {
    pub async fn new_and_init(
        printer_cfg: Arc<RwLock<PrinterConfigBambu>>,
        tx: tokio::sync::mpsc::UnboundedSender<(PrinterId, WorkerMsg)>,
        cmd_rx: tokio::sync::mpsc::UnboundedReceiver<WorkerCmd>,
        kill_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<Self> {
        debug!("init lan mqtt listener");
        let client_id = format!("batch-printer-{}", nanoid::nanoid!(8));

        let printer = printer_cfg.read().await;

        if printer.host.is_empty() {
            bail!("missing host");
        }

        let tls = insecure_tls_config();

        let mut mqttoptions = MqttOptions::new(client_id, &printer.host, MQTT_PORT);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        mqttoptions.set_credentials(LAN_USER, &printer.access_code);
        mqttoptions.set_transport(rumqttc::Transport::tls_with_config(
            rumqttc::TlsConfiguration::Rustls(tls.clone()),
        ));
        mqttoptions.set_max_packet_size(100 * 1024, 100 * 1024);

        debug!("connecting, printer = {}", &printer.name);
        let (client, eventloop) = AsyncClient::new(mqttoptions, 10);

        let mut out = Self {
            id: printer.id.clone(),
            config: printer_cfg.clone(),
            client,
            tx,
            cmd_rx,
            tls,
            acks: PendingAcks::default(),
            topic_device_request: printer.topic_device_request(),
            topic_device_report: printer.topic_device_report(),
        };
        drop(printer);
        out.init(eventloop, kill_rx).await?;

        Ok(out)
    }

    pub async fn init(
        &mut self,
        eventloop: EventLoop,
        mut kill_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let mut listener = BambuListener::new(
            self.id.clone(),
            self.client.clone(),
            eventloop,
            self.tx.clone(),
            self.acks.clone(),
            self.topic_device_report.clone(),
            self.topic_device_request.clone(),
        );

        tokio::task::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut kill_rx => {
                        debug!("Listener task got kill command");
                        break;
                    }
                    event = listener.poll_eventloop() => {
                        if let Err(e) = event {
                            error!("Error in listener: {:?}", e);
                            if listener.tx.send((listener.id.clone(), WorkerMsg::Disconnected)).is_err() {
                                break;
                            }
                        }
                        listener.eventloop.clean();
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        debug!("Reconnecting...");
                    }
                }
            }
            if let Err(e) = listener.client.try_disconnect() {
                trace!("disconnect: {:?}", e);
            }
        });
        Ok(())
    }

    /// Handles commands until the manager drops its sender
    pub async fn run(&mut self) -> Result<()> {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                WorkerCmd::PushAll => {
                    if let Err(e) = self.publish(Command::PushAll).await {
                        warn!("pushall failed: {:?}", e);
                    }
                }
                WorkerCmd::Print {
                    project,
                    command,
                    reply,
                } => {
                    let res = self.print(&project, command).await;
                    if let Err(e) = &res {
                        error!("print on {} failed: {:?}", self.id, e);
                    }
                    let _ = reply.send(res);
                }
            }
        }
        debug!("command channel closed, printer = {}", self.id);
        Ok(())
    }

    /// Uploads the archive, asks the printer to start the plate and waits for
    /// it to accept
    async fn print(&self, project: &ProjectFile, command: CommandPpf) -> Result<()> {
        let (host, access_code) = {
            let cfg = self.config.read().await;
            (cfg.host.clone(), cfg.access_code.clone())
        };

        let ftps = FtpsClient::new(&host, &access_code, self.tls.clone());
        ftps.upload(&command.filename, project.data())
            .await
            .with_context(|| format!("uploading {}", command.filename))?;

        debug!(
            "starting plate {} of {} on {}",
            command.plate_idx, command.filename, self.id
        );
        let seq = next_sequence_id();
        let rx = self.acks.register(&seq);
        let payload = Command::ProjectFile(command).to_json(&seq).to_string();
        if let Err(e) = self.publish_payload(payload).await {
            self.acks.cancel(&seq);
            return Err(e);
        }
        self.acks.wait(&seq, rx, PRINT_ACK_TIMEOUT).await
    }

    pub async fn publish(&self, command: Command) -> Result<()> {
        self.publish_payload(command.get_payload()).await
    }

    async fn publish_payload(&self, payload: String) -> Result<()> {
        let qos = rumqttc::QoS::AtMostOnce;
        self.client
            .publish(&self.topic_device_request, qos, false, payload)
            .await?;

        Ok(())
    }
}
