use anyhow::{anyhow, bail, ensure, Context, Result};
use rumqttc::Incoming;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::printer_id::PrinterId,
    conn_manager::{
        conn_bambu::{bambu_proto::PendingAcks, command::Command, message::Message},
        worker_message::WorkerMsg,
    },
};

pub(super) struct BambuListener {
    pub(super) id: PrinterId,
    pub(super) client: rumqttc::AsyncClient,
    pub(super) eventloop: rumqttc::EventLoop,
    pub(super) tx: tokio::sync::mpsc::UnboundedSender<(PrinterId, WorkerMsg)>,
    pub(super) acks: PendingAcks,
    pub(super) topic_device_report: String,
    pub(super) topic_device_request: String,
}

impl BambuListener {
    pub fn new(
        id: PrinterId,
        client: rumqttc::AsyncClient,
        eventloop: rumqttc::EventLoop,
        tx: tokio::sync::mpsc::UnboundedSender<(PrinterId, WorkerMsg)>,
        acks: PendingAcks,
        topic_device_report: String,
        topic_device_request: String,
    ) -> Self {
        Self {
            id,
            client,
            eventloop,
            tx,
            acks,
            topic_device_report,
            topic_device_request,
        }
    }

    /// MARK: main event handler
    /// Only returns on a connection error
    pub(super) async fn poll_eventloop(&mut self) -> Result<()> {
        use rumqttc::Event;
        loop {
            let event = self.eventloop.poll().await?;
            match event {
                Event::Outgoing(_) => {}
                Event::Incoming(Incoming::PingResp) => {}
                Event::Incoming(Incoming::ConnAck(c)) => {
                    debug!("got ConnAck: {:?}", c.code);
                    if c.code == rumqttc::ConnectReturnCode::Success {
                        self.client
                            .subscribe(&self.topic_device_report, rumqttc::QoS::AtMostOnce)
                            .await?;
                        debug!("sent subscribe to topic");
                        self.send(WorkerMsg::Connected)?;
                    } else {
                        bail!("Failed to connect to MQTT: {:?}", c.code);
                    }
                }
                Event::Incoming(Incoming::SubAck(s)) => {
                    debug!("got SubAck");
                    if s.return_codes
                        .iter()
                        .any(|&r| r == rumqttc::SubscribeReasonCode::Failure)
                    {
                        error!("Failed to subscribe to topic");
                    } else {
                        debug!("sending pushall");
                        self.send_pushall().await?;
                    }
                }
                Event::Incoming(Incoming::Publish(p)) => {
                    let msg = crate::conn_manager::conn_bambu::parse::parse_message(&p);
                    self.handle_message(msg)?;
                }
                Event::Incoming(event) => {
                    debug!("incoming other event: {:?}", event);
                }
            }
        }
    }

    fn handle_message(&self, msg: Message) -> Result<()> {
        match msg {
            Message::Print(p) => {
                if p.print.is_command("project_file") {
                    let resolved = self.acks.resolve(&p.print);
                    debug!(
                        "project_file answer from {}: {:?} {:?}, pending = {}",
                        self.id, p.print.result, p.print.reason, resolved
                    );
                }
                let update = WorkerMsg::from_print_data(&p.print);
                self.send(update)
            }
            Message::Info(_) | Message::System(_) => Ok(()),
            Message::Unknown(Some(s)) => {
                trace!("unknown message from {}: {}", self.id, s);
                Ok(())
            }
            Message::Unknown(None) => Ok(()),
        }
    }

    fn send(&self, msg: WorkerMsg) -> Result<()> {
        self.tx
            .send((self.id.clone(), msg))
            .map_err(|_| anyhow!("worker message channel closed"))
    }

    pub(super) async fn send_pushall(&mut self) -> Result<()> {
        let payload = Command::PushAll.get_payload();

        let qos = rumqttc::QoS::AtMostOnce;
        self.client
            .publish(&self.topic_device_request, qos, false, payload)
            .await?;

        Ok(())
    }
}
