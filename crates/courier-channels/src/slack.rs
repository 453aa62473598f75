mod envelope;
mod web;

pub use web::{DEFAULT_API_BASE, SlackApiError, SlackWebClient};

use crate::backoff::Backoff;
use anyhow::{Context, Result};
use async_trait::async_trait;
use courier_core::{Channel, ChannelHealth, InboundMessage, OutboundMessage, OutboundSender};
use envelope::Frame;
use futures::{SinkExt, StreamExt};
use secrecy::SecretString;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

type HealthState = Arc<Mutex<ChannelHealth>>;

#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub bot_token: SecretString,
    pub app_token: SecretString,
    pub api_base: String,
}

/// Slack over Socket Mode: one WebSocket for inbound events, Web API posts
/// for outbound messages.
#[derive(Debug)]
pub struct SlackChannel {
    id: String,
    self_user_id: String,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    outbound: Arc<SlackOutbound>,
    health: HealthState,
}

impl SlackChannel {
    /// Resolve the bot identity, then start the socket and sender tasks.
    ///
    /// Identity lookup is retried with backoff until it succeeds. Only a
    /// token Slack rejects outright is returned as an error. The socket
    /// connects in the background and reconnects on its own.
    pub async fn connect(config: SlackConfig) -> Result<Self> {
        let web = SlackWebClient::new(config.bot_token).with_base_url(config.api_base);
        let self_user_id = resolve_identity(&web, &mut Backoff::default()).await?;
        info!(self_user_id = %self_user_id, "slack bot identity resolved");

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let health: HealthState = Arc::new(Mutex::new(ChannelHealth::Degraded(
            "slack socket connecting".to_owned(),
        )));

        tokio::spawn(receive_task(
            web.clone(),
            config.app_token,
            inbound_tx,
            Arc::clone(&health),
        ));
        tokio::spawn(send_task(web, outbound_rx));

        Ok(Self {
            id: "slack".to_owned(),
            self_user_id,
            inbound_rx,
            outbound: Arc::new(SlackOutbound { tx: outbound_tx }),
            health,
        })
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn self_user_id(&self) -> Option<&str> {
        Some(&self.self_user_id)
    }

    async fn recv(&mut self) -> Result<InboundMessage> {
        self.inbound_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("slack channel closed"))
    }

    fn sender(&self) -> Arc<dyn OutboundSender> {
        Arc::clone(&self.outbound) as Arc<dyn OutboundSender>
    }

    async fn probe(&self) -> ChannelHealth {
        self.health
            .lock()
            .expect("slack health lock poisoned")
            .clone()
    }
}

async fn resolve_identity(web: &SlackWebClient, backoff: &mut Backoff) -> Result<String> {
    loop {
        match web.auth_test().await {
            Ok(user_id) => return Ok(user_id),
            Err(error)
                if error
                    .downcast_ref::<SlackApiError>()
                    .is_some_and(SlackApiError::is_auth_failure) =>
            {
                return Err(error.context("failed to resolve slack bot identity"));
            }
            Err(error) => {
                let delay = backoff.next_delay();
                warn!(
                    error = %format!("{error:#}"),
                    delay_ms = delay.as_millis(),
                    "slack identity lookup failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

struct OutboundRequest {
    message: OutboundMessage,
    done: oneshot::Sender<Result<()>>,
}

/// Shared send handle. Every post goes through the single sender task, so
/// writes never interleave and each caller learns its own outcome.
#[derive(Debug)]
struct SlackOutbound {
    tx: mpsc::Sender<OutboundRequest>,
}

#[async_trait]
impl OutboundSender for SlackOutbound {
    async fn send(&self, msg: OutboundMessage) -> Result<()> {
        let (done, result) = oneshot::channel();
        self.tx
            .send(OutboundRequest { message: msg, done })
            .await
            .map_err(|_| anyhow::anyhow!("slack sender task stopped"))?;
        result
            .await
            .map_err(|_| anyhow::anyhow!("slack sender task dropped the request"))?
    }
}

enum ConnectionEnd {
    /// Nobody is receiving inbound messages any more; stop for good.
    ReceiverClosed,
    Dropped(String),
}

async fn receive_task(
    web: SlackWebClient,
    app_token: SecretString,
    inbound_tx: mpsc::Sender<InboundMessage>,
    health: HealthState,
) {
    let mut backoff = Backoff::default();

    loop {
        match run_connection(&web, &app_token, &inbound_tx, &health, &mut backoff).await {
            Ok(ConnectionEnd::ReceiverClosed) => {
                set_health(
                    &health,
                    ChannelHealth::Unhealthy("slack receiver stopped".to_owned()),
                );
                return;
            }
            Ok(ConnectionEnd::Dropped(reason)) => {
                info!(reason = %reason, "slack socket closed");
                set_health(&health, ChannelHealth::Degraded(reason));
            }
            Err(error) => {
                warn!(error = %format!("{error:#}"), "slack socket failed");
                set_health(
                    &health,
                    ChannelHealth::Degraded(format!("slack socket failed: {error}")),
                );
            }
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis(), "reconnecting slack socket");
        tokio::time::sleep(delay).await;
    }
}

async fn run_connection(
    web: &SlackWebClient,
    app_token: &SecretString,
    inbound_tx: &mpsc::Sender<InboundMessage>,
    health: &HealthState,
    backoff: &mut Backoff,
) -> Result<ConnectionEnd> {
    let url = web.open_socket_url(app_token).await?;
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .context("slack socket handshake failed")?;
    let (mut writer, mut reader) = socket.split();

    while let Some(message) = reader.next().await {
        match message.context("slack socket read failed")? {
            Message::Text(text) => match envelope::parse_frame(text.as_str()) {
                Ok(Frame::Hello) => {
                    backoff.reset();
                    set_health(health, ChannelHealth::Healthy);
                    info!("slack socket connected");
                }
                Ok(Frame::Disconnect { reason }) => {
                    return Ok(ConnectionEnd::Dropped(format!(
                        "disconnect requested: {}",
                        reason.as_deref().unwrap_or("unspecified")
                    )));
                }
                Ok(Frame::Envelope {
                    envelope_id,
                    message,
                }) => {
                    // Ack before anything else; the outcome downstream is irrelevant.
                    writer
                        .send(Message::Text(envelope::ack_payload(&envelope_id).into()))
                        .await
                        .context("failed to acknowledge slack envelope")?;
                    if let Some(message) = message {
                        debug!(event_id = %message.event_id, envelope_id = %envelope_id, "slack event received");
                        if inbound_tx.send(*message).await.is_err() {
                            return Ok(ConnectionEnd::ReceiverClosed);
                        }
                    }
                }
                Ok(Frame::Unknown(kind)) => debug!(kind = %kind, "ignoring slack frame"),
                Err(error) => warn!(error = %error, "unparseable slack frame"),
            },
            Message::Ping(data) => writer
                .send(Message::Pong(data))
                .await
                .context("failed to answer slack ping")?,
            Message::Close(frame) => {
                return Ok(ConnectionEnd::Dropped(format!("closed by server: {frame:?}")));
            }
            _ => {}
        }
    }

    Ok(ConnectionEnd::Dropped("slack socket stream ended".to_owned()))
}

async fn send_task(web: SlackWebClient, mut outbound_rx: mpsc::Receiver<OutboundRequest>) {
    while let Some(OutboundRequest { message, done }) = outbound_rx.recv().await {
        let result = web.post_message(&message).await;
        if let Err(error) = &result {
            warn!(error = %format!("{error:#}"), channel = %message.channel, "failed to send slack message");
        }
        let _ = done.send(result);
    }
}

fn set_health(health: &HealthState, state: ChannelHealth) {
    *health.lock().expect("slack health lock poisoned") = state;
}
