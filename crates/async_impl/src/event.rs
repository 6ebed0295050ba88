use tokio::sync::mpsc;
use tracing::trace;

use common::{Command, LinkError, LinkHealth, RemoteCommand, SensorMessage};

/// Capacity of the controller queue. Producers wait when it is full.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Everything the controller reacts to, in arrival order.
#[derive(Debug)]
pub enum ControllerEvent {
    Sensor(SensorMessage),
    SensorHealth(LinkHealth),
    /// A command could not be written to the sensor link.
    SensorWriteFailed { command: Command, error: LinkError },
    Remote(RemoteCommand),
    RemoteHealth(LinkHealth),
    /// The auto-close deadline armed as `generation` expired.
    AutoCloseDue { generation: u64 },
    Tick,
}

impl ControllerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerEvent::Sensor(_) => "sensor",
            ControllerEvent::SensorHealth(_) => "sensor_health",
            ControllerEvent::SensorWriteFailed { .. } => "sensor_write_failed",
            ControllerEvent::Remote(_) => "remote",
            ControllerEvent::RemoteHealth(_) => "remote_health",
            ControllerEvent::AutoCloseDue { .. } => "auto_close",
            ControllerEvent::Tick => "tick",
        }
    }
}

/// Producer half of the controller queue, cloned into every task.
#[derive(Debug, Clone)]
pub struct EventSender(mpsc::Sender<ControllerEvent>);

impl EventSender {
    pub async fn send(&self, event: ControllerEvent) -> bool {
        let kind = event.kind();
        if self.0.send(event).await.is_err() {
            trace!(kind, "controller queue closed, event dropped");
            return false;
        }
        true
    }

    /// Non-async enqueue for contexts that cannot await.
    pub fn try_send(&self, event: ControllerEvent) -> bool {
        self.0.try_send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

pub type EventReceiver = mpsc::Receiver<ControllerEvent>;

pub fn event_queue() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    (EventSender(tx), rx)
}
