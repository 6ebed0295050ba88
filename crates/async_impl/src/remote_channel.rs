use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, mpsc::error::TrySendError, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, trace, warn};

use common::{Backoff, HealthCell, LinkError, LinkHealth, OutboundEvent, RemoteCommand, SharedDiagnostics};

use crate::event::{ControllerEvent, EventSender};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const OUTBOUND_CAPACITY: usize = 64;

pub type TextSink = Pin<Box<dyn Sink<String, Error = LinkError> + Send>>;
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LinkError>> + Send>>;

/// One established text-message session with the cloud.
pub struct RemoteConnection {
    pub outbound: TextSink,
    pub inbound: TextStream,
}

pub trait RemoteConnector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<RemoteConnection, LinkError>> + Send;
}

/// Websocket connector authenticating with a bearer token.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    token: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
        }
    }
}

impl RemoteConnector for WsConnector {
    async fn connect(&self) -> Result<RemoteConnection, LinkError> {
        let handshake = |e: &dyn std::fmt::Display| LinkError::Handshake(e.to_string());
        let mut request = self.url.as_str().into_client_request().map_err(|e| handshake(&e))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token)).map_err(|e| handshake(&e))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, _response) = connect_async(request).await.map_err(|e| handshake(&e))?;
        info!(url = %self.url, "websocket connected");

        let (sink, stream) = ws.split();
        let outbound = sink
            .with(|text: String| future::ready(Ok::<_, tungstenite::Error>(Message::Text(text))))
            .sink_map_err(|e| LinkError::Io(e.to_string()));
        let inbound = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "websocket close frame");
                    Some(Err(LinkError::Closed))
                }
                Ok(_) => None,
                Err(e) => Some(Err(LinkError::Io(e.to_string()))),
            })
        });
        Ok(RemoteConnection {
            outbound: Box::pin(outbound),
            inbound: Box::pin(inbound),
        })
    }
}

/// What the controller needs from the remote channel.
pub trait ReportSink: Send {
    /// Queues `event` for the cloud. Never blocks; drops when disconnected.
    fn send(&self, event: OutboundEvent) -> Result<(), LinkError>;
}

#[derive(Clone)]
pub struct RemoteHandle {
    outbound: mpsc::Sender<OutboundEvent>,
    health: Arc<HealthCell>,
    diagnostics: Arc<SharedDiagnostics>,
}

impl RemoteHandle {
    pub fn health(&self) -> LinkHealth {
        self.health.get()
    }

    fn drop_report(&self, event: &OutboundEvent, error: LinkError) -> Result<(), LinkError> {
        error!(event = event.name(), %error, "dropping outbound message");
        self.diagnostics.record_dropped_report();
        Err(error)
    }
}

impl ReportSink for RemoteHandle {
    fn send(&self, event: OutboundEvent) -> Result<(), LinkError> {
        if !self.health().is_connected() {
            return self.drop_report(&event, LinkError::NotConnected);
        }
        match self.outbound.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => self.drop_report(&event, LinkError::QueueFull),
            Err(TrySendError::Closed(event)) => self.drop_report(&event, LinkError::NotConnected),
        }
    }
}

/// Keeps one session with the cloud alive, reconnecting with capped
/// exponential backoff, and forwards decoded commands to the controller.
pub struct RemoteChannel {
    handle: RemoteHandle,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RemoteChannel {
    pub fn spawn<C: RemoteConnector>(connector: C, events: EventSender, diagnostics: Arc<SharedDiagnostics>) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (stop, stop_rx) = watch::channel(false);
        let health = Arc::new(HealthCell::new(LinkHealth::Disconnected));
        let worker = Worker {
            events,
            health: health.clone(),
            diagnostics: diagnostics.clone(),
            outbound: outbound_rx,
            stop: stop_rx,
        };
        let task = tokio::spawn(worker.run(connector));
        Self {
            handle: RemoteHandle {
                outbound,
                health,
                diagnostics,
            },
            stop,
            task,
        }
    }

    pub fn handle(&self) -> RemoteHandle {
        self.handle.clone()
    }

    /// Closes the session, abandoning it after `grace`.
    pub async fn shutdown(self, grace: Duration) {
        let RemoteChannel { stop, mut task, .. } = self;
        let _ = stop.send(true);
        match timeout(grace, &mut task).await {
            Ok(_) => info!("remote channel stopped"),
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "remote channel did not stop in time, abandoning");
                task.abort();
            }
        }
    }
}

enum SessionEnd {
    Lost,
    Shutdown,
}

struct Worker {
    events: EventSender,
    health: Arc<HealthCell>,
    diagnostics: Arc<SharedDiagnostics>,
    outbound: mpsc::Receiver<OutboundEvent>,
    stop: watch::Receiver<bool>,
}

impl Worker {
    async fn run<C: RemoteConnector>(mut self, connector: C) {
        let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);
        loop {
            self.set_health(LinkHealth::Reconnecting).await;
            let attempt = tokio::select! {
                _ = self.stop.changed() => break,
                result = timeout(CONNECT_TIMEOUT, connector.connect()) => result,
            };
            match attempt {
                Ok(Ok(connection)) => {
                    backoff.reset();
                    self.set_health(LinkHealth::Connected).await;
                    let end = self.session(connection).await;
                    self.set_health(LinkHealth::Disconnected).await;
                    self.discard_queued();
                    if let SessionEnd::Shutdown = end {
                        break;
                    }
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "remote connect failed");
                    self.set_health(LinkHealth::Disconnected).await;
                }
                Err(_) => {
                    warn!(timeout_s = CONNECT_TIMEOUT.as_secs(), "remote connect timed out");
                    self.set_health(LinkHealth::Disconnected).await;
                }
            }

            let delay = backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, attempt = backoff.attempts(), "remote reconnect scheduled");
            tokio::select! {
                _ = self.stop.changed() => break,
                _ = sleep(delay) => {}
            }
        }
        self.set_health(LinkHealth::Disconnected).await;
        self.discard_queued();
    }

    async fn session(&mut self, connection: RemoteConnection) -> SessionEnd {
        let RemoteConnection {
            mut outbound,
            mut inbound,
        } = connection;
        loop {
            tokio::select! {
                _ = self.stop.changed() => {
                    let _ = timeout(CLOSE_TIMEOUT, outbound.close()).await;
                    return SessionEnd::Shutdown;
                }
                message = self.outbound.recv() => {
                    let Some(event) = message else {
                        return SessionEnd::Shutdown;
                    };
                    debug!(event = event.name(), "remote tx");
                    if let Err(err) = outbound.send(event.encode()).await {
                        error!(event = event.name(), error = %err, "remote send failed, message dropped");
                        self.diagnostics.record_dropped_report();
                        return SessionEnd::Lost;
                    }
                }
                frame = inbound.next() => match frame {
                    Some(Ok(text)) => {
                        trace!(len = text.len(), "remote rx");
                        if let Some(command) = RemoteCommand::decode(&text) {
                            info!(?command, "remote command received");
                            if !self.events.send(ControllerEvent::Remote(command)).await {
                                return SessionEnd::Shutdown;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "remote session lost");
                        return SessionEnd::Lost;
                    }
                    None => {
                        warn!("remote session closed by peer");
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }

    async fn set_health(&self, health: LinkHealth) {
        if self.health.set(health) != health {
            debug!(%health, "remote health changed");
            self.events.send(ControllerEvent::RemoteHealth(health)).await;
        }
    }

    /// Messages queued for a session that is gone are not replayed.
    fn discard_queued(&mut self) {
        while let Ok(event) = self.outbound.try_recv() {
            error!(event = event.name(), "remote disconnected, message dropped");
            self.diagnostics.record_dropped_report();
        }
    }
}
