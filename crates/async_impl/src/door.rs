use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info};

use common::DoorState;

use crate::event::{ControllerEvent, EventSender};

/// Drives the physical door. Implementations must return promptly;
/// slow hardware work belongs on its own thread or task.
pub trait DoorActuator: Send {
    fn drive(&mut self, state: DoorState);
}

/// Actuator used when no hardware driver is attached.
#[derive(Debug, Default)]
pub struct LoggingActuator;

impl DoorActuator for LoggingActuator {
    fn drive(&mut self, state: DoorState) {
        info!(door = %state, "actuator command");
    }
}

/// Door state plus the single auto-close deadline.
///
/// The deadline never touches the state directly: when it expires it enqueues
/// `AutoCloseDue { generation }` and the controller calls [`on_deadline`].
/// Re-arming bumps the generation, so a deadline that fired just before being
/// replaced is recognized as stale.
///
/// [`on_deadline`]: DoorAutomation::on_deadline
pub struct DoorAutomation {
    state: DoorState,
    delay: Duration,
    generation: u64,
    pending: Option<JoinHandle<()>>,
    events: EventSender,
    actuator: Box<dyn DoorActuator>,
}

impl DoorAutomation {
    pub fn new(delay: Duration, events: EventSender, actuator: Box<dyn DoorActuator>) -> Self {
        Self {
            state: DoorState::Closed,
            delay,
            generation: 0,
            pending: None,
            events,
            actuator,
        }
    }

    pub fn state(&self) -> DoorState {
        self.state
    }

    pub fn has_pending_deadline(&self) -> bool {
        self.pending.is_some()
    }

    /// Opens the door (if closed) and restarts the auto-close deadline.
    /// Returns whether the state changed.
    pub fn open(&mut self) -> bool {
        self.cancel_deadline();
        let changed = self.state != DoorState::Open;
        self.state = DoorState::Open;
        if changed {
            self.actuator.drive(DoorState::Open);
        }

        self.generation += 1;
        let generation = self.generation;
        let delay = self.delay;
        let events = self.events.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            events.send(ControllerEvent::AutoCloseDue { generation }).await;
        }));
        debug!(generation, delay_ms = delay.as_millis() as u64, "auto-close armed");
        changed
    }

    /// Closes the door and cancels any pending deadline. Returns whether the state changed.
    pub fn close(&mut self) -> bool {
        self.cancel_deadline();
        let changed = self.state != DoorState::Closed;
        self.state = DoorState::Closed;
        if changed {
            self.actuator.drive(DoorState::Closed);
        }
        changed
    }

    /// Handles an expired deadline. Returns true if it closed the door.
    pub fn on_deadline(&mut self, generation: u64) -> bool {
        if self.pending.is_none() || generation != self.generation {
            debug!(generation, current = self.generation, "ignoring stale auto-close");
            return false;
        }
        self.pending = None;
        info!(generation, "auto-close deadline reached");
        self.close();
        true
    }

    /// Cancels the deadline without moving the door; no deadline fires afterwards.
    pub fn shutdown(&mut self) {
        self.cancel_deadline();
        self.generation += 1;
    }

    fn cancel_deadline(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for DoorAutomation {
    fn drop(&mut self) {
        self.cancel_deadline();
    }
}
