pub mod controller;
pub mod door;
pub mod event;
pub mod remote_channel;
pub mod sensor_link;

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{info, warn};

use common::{ControllerConfig, DiagnosticsSnapshot, LinkError, MetricsRecorder, SharedDiagnostics};

pub use controller::Controller;
pub use door::{DoorActuator, DoorAutomation, LoggingActuator};
pub use event::{event_queue, ControllerEvent, EventReceiver, EventSender};
pub use remote_channel::{RemoteChannel, RemoteConnection, RemoteConnector, ReportSink, WsConnector};
pub use sensor_link::{SensorLink, SensorOpener, SensorPort, SerialOpener};

/// Period of the housekeeping tick (window expiry, reply deadlines, reattach, status).
pub const TICK_INTERVAL: Duration = Duration::from_millis(200);
/// How long each component gets to stop before it is abandoned.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Everything the controller loop runs against.
pub struct ControllerParts {
    pub sensor: SensorLink,
    pub remote: RemoteChannel,
    pub events: EventSender,
    pub receiver: EventReceiver,
    pub diagnostics: Arc<SharedDiagnostics>,
    pub actuator: Box<dyn DoorActuator>,
}

/// Opens the serial sensor, connects the cloud channel and runs the
/// controller until `shutdown` resolves.
///
/// Only failing to open the serial device is an error; everything after
/// that is handled as link health.
pub async fn run_controller<F>(config: ControllerConfig, shutdown: F) -> Result<DiagnosticsSnapshot, LinkError>
where
    F: Future<Output = ()>,
{
    let diagnostics = Arc::new(SharedDiagnostics::default());
    let (events, receiver) = event_queue();

    let sensor = SensorLink::open(
        &config.serial_port,
        config.serial_baudrate,
        config.serial_timeout(),
        events.clone(),
        diagnostics.clone(),
    )
    .await?;
    let remote = RemoteChannel::spawn(
        WsConnector::new(config.ws_server_url.as_str(), config.device_token.as_str()),
        events.clone(),
        diagnostics.clone(),
    );

    let parts = ControllerParts {
        sensor,
        remote,
        events,
        receiver,
        diagnostics,
        actuator: Box::new(LoggingActuator),
    };
    Ok(run_with_parts(&config, parts, shutdown).await)
}

/// Runs the controller loop over already started links, then stops the
/// auto-close timer, the sensor link and the remote channel in that order.
pub async fn run_with_parts<F>(config: &ControllerConfig, parts: ControllerParts, shutdown: F) -> DiagnosticsSnapshot
where
    F: Future<Output = ()>,
{
    let ControllerParts {
        sensor,
        remote,
        events,
        receiver,
        diagnostics,
        actuator,
    } = parts;

    let door = DoorAutomation::new(config.auto_close_delay(), events.clone(), actuator);
    let mut controller = Controller::new(
        config,
        Box::new(sensor.handle()),
        Box::new(remote.handle()),
        door,
        diagnostics.clone(),
        Instant::now(),
    );
    let metrics = config.metrics_csv.as_ref().map(|_| MetricsRecorder::new());
    if let Some(recorder) = &metrics {
        controller = controller.with_metrics(recorder.clone());
    }

    let ticker = spawn_ticker(events, TICK_INTERVAL);
    controller.run(receiver, shutdown).await;

    info!("shutting down");
    ticker.abort();
    drop(controller);
    sensor.shutdown(SHUTDOWN_GRACE).await;
    remote.shutdown(SHUTDOWN_GRACE).await;

    if let (Some(recorder), Some(path)) = (&metrics, &config.metrics_csv) {
        info!(missed = recorder.missed_deadlines(), "event deadline misses");
        if let Err(err) = recorder.save_to_csv(path) {
            warn!(error = %err, path = %path, "could not write event metrics");
        }
    }

    let snapshot = diagnostics.snapshot();
    info!(
        frame_errors = snapshot.frame_errors,
        decisions = snapshot.decisions,
        rejects = snapshot.rejects,
        dropped_reports = snapshot.dropped_reports,
        sensor_disconnects = snapshot.sensor_disconnects,
        "diagnostics"
    );
    snapshot
}

/// Pushes `Tick` every `period` until the controller queue closes.
/// A tick that finds the queue full is skipped, not queued.
pub fn spawn_ticker(events: EventSender, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut next_tick = Instant::now();
        while !events.is_closed() {
            next_tick += period;
            sleep_until(next_tick).await;
            events.try_send(ControllerEvent::Tick);
        }
    })
}
