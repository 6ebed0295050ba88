use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::channel::{mpsc, oneshot};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use async_impl::{
    event_queue, run_with_parts, ControllerParts, DoorActuator, RemoteChannel, RemoteConnection, RemoteConnector,
    SensorLink, SensorOpener,
};
use common::codec::{frame_event, frame_reply};
use common::{ControllerConfig, DiagnosticsSnapshot, DoorState, LinkError, SharedDiagnostics};

const WAIT: Duration = Duration::from_secs(5);

/// Hands out pre-made streams for reattach; fails once they run out.
struct QueuedOpener(Mutex<VecDeque<DuplexStream>>);

impl SensorOpener for QueuedOpener {
    type Stream = DuplexStream;

    async fn open(&self) -> Result<DuplexStream, LinkError> {
        self.0.lock().unwrap().pop_front().ok_or_else(|| LinkError::Open {
            endpoint: "test".into(),
            reason: "unplugged".into(),
        })
    }
}

struct OneSession(Mutex<Option<RemoteConnection>>);

impl RemoteConnector for OneSession {
    async fn connect(&self) -> Result<RemoteConnection, LinkError> {
        self.0.lock().unwrap().take().ok_or(LinkError::Closed)
    }
}

#[derive(Clone, Default)]
struct RecordingDoor(Arc<Mutex<Vec<DoorState>>>);

impl DoorActuator for RecordingDoor {
    fn drive(&mut self, state: DoorState) {
        self.0.lock().unwrap().push(state);
    }
}

struct Rig {
    module: DuplexStream,
    cloud_rx: mpsc::UnboundedReceiver<String>,
    cloud_tx: mpsc::UnboundedSender<Result<String, LinkError>>,
    door: RecordingDoor,
    stop: oneshot::Sender<()>,
    task: JoinHandle<DiagnosticsSnapshot>,
}

fn start(spare_streams: Vec<DuplexStream>) -> Rig {
    let config = ControllerConfig {
        device_token: "secret".into(),
        ..ControllerConfig::default()
    };
    let diagnostics = Arc::new(SharedDiagnostics::default());
    let (events, receiver) = event_queue();

    let (local, module) = tokio::io::duplex(1024);
    let opener = QueuedOpener(Mutex::new(spare_streams.into()));
    let sensor = SensorLink::spawn(opener, Some(local), events.clone(), diagnostics.clone());

    let (out_tx, cloud_rx) = mpsc::unbounded::<String>();
    let (cloud_tx, in_rx) = mpsc::unbounded::<Result<String, LinkError>>();
    let connection = RemoteConnection {
        outbound: Box::pin(out_tx.sink_map_err(|_| LinkError::Closed)),
        inbound: Box::pin(in_rx),
    };
    let remote = RemoteChannel::spawn(OneSession(Mutex::new(Some(connection))), events.clone(), diagnostics.clone());

    let door = RecordingDoor::default();
    let parts = ControllerParts {
        sensor,
        remote,
        events,
        receiver,
        diagnostics,
        actuator: Box::new(door.clone()),
    };
    let (stop, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        run_with_parts(&config, parts, async {
            let _ = stop_rx.await;
        })
        .await
    });
    Rig {
        module,
        cloud_rx,
        cloud_tx,
        door,
        stop,
        task,
    }
}

async fn read_frame(module: &mut DuplexStream) -> String {
    let mut frame = Vec::new();
    loop {
        let byte = timeout(WAIT, module.read_u8()).await.expect("frame in time").expect("open stream");
        frame.push(byte);
        if byte == b'#' {
            return String::from_utf8(frame).unwrap();
        }
    }
}

async fn write(module: &mut DuplexStream, frame: String) {
    module.write_all(frame.as_bytes()).await.unwrap();
}

async fn ack(module: &mut DuplexStream) {
    write(module, frame_reply("OK", &["done"])).await;
}

fn recognition(user: &str, score: u8) -> String {
    frame_event("08", &["10", "20", "30", "40", user, &score.to_string()])
}

/// Reads cloud messages until one contains `needle`.
async fn cloud_until(rx: &mut mpsc::UnboundedReceiver<String>, needle: &str) -> Vec<String> {
    let mut seen = Vec::new();
    loop {
        let message = timeout(WAIT, rx.next())
            .await
            .unwrap_or_else(|_| panic!("no cloud message containing {needle}, saw {seen:?}"))
            .expect("cloud channel open");
        let done = message.contains(needle);
        seen.push(message);
        if done {
            return seen;
        }
    }
}

async fn boot(rig: &mut Rig) {
    assert_eq!(read_frame(&mut rig.module).await, "$CMD,START,6#");
    ack(&mut rig.module).await;
    cloud_until(&mut rig.cloud_rx, r#""data":"CLOSED""#).await;
}

#[tokio::test]
async fn recognized_face_opens_and_remote_close_shuts() {
    let mut rig = start(Vec::new());
    boot(&mut rig).await;

    write(&mut rig.module, frame_event("06", &["1", "2", "3", "4"])).await;
    assert_eq!(read_frame(&mut rig.module).await, "$CMD,START,8#");
    ack(&mut rig.module).await;

    write(&mut rig.module, recognition("user001", 85)).await;
    write(&mut rig.module, recognition("user001", 60)).await;
    write(&mut rig.module, recognition("user001", 90)).await;

    let seen = cloud_until(&mut rig.cloud_rx, "recognized user001").await;
    assert!(seen.contains(&r#"{"event":"door_status","data":"OPEN"}"#.to_string()));

    rig.cloud_tx
        .unbounded_send(Ok(r#"{"event":"command","data":{"cmd":"CLOSE"}}"#.into()))
        .unwrap();
    let seen = cloud_until(&mut rig.cloud_rx, "remote close").await;
    let closed = seen.iter().filter(|m| m.contains(r#""door_status","data":"CLOSED""#)).count();
    assert_eq!(closed, 1);
    assert_eq!(*rig.door.0.lock().unwrap(), vec![DoorState::Open, DoorState::Closed]);

    rig.stop.send(()).unwrap();
    let diagnostics = timeout(WAIT, rig.task).await.unwrap().unwrap();
    assert_eq!(diagnostics.decisions, 1);
    assert_eq!(diagnostics.rejects, 0);
}

#[tokio::test]
async fn sensor_loss_discards_the_window_until_reattached() {
    let (spare, mut module2) = tokio::io::duplex(1024);
    let mut rig = start(vec![spare]);
    boot(&mut rig).await;

    write(&mut rig.module, frame_event("06", &["1", "2", "3", "4"])).await;
    assert_eq!(read_frame(&mut rig.module).await, "$CMD,START,8#");
    ack(&mut rig.module).await;
    write(&mut rig.module, recognition("user001", 95)).await;

    // unplug; the controller asks for a reattach after its first backoff step
    drop(rig.module);
    assert_eq!(read_frame(&mut module2).await, "$CMD,START,8#");
    ack(&mut module2).await;

    // one sample after reconnecting is not enough: the earlier one was dropped
    write(&mut module2, recognition("user001", 95)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rig.door.0.lock().unwrap().is_empty());

    write(&mut module2, recognition("user001", 93)).await;
    cloud_until(&mut rig.cloud_rx, "recognized user001 (score 95%)").await;
    assert_eq!(*rig.door.0.lock().unwrap(), vec![DoorState::Open]);

    rig.stop.send(()).unwrap();
    let diagnostics = timeout(WAIT, rig.task).await.unwrap().unwrap();
    assert_eq!(diagnostics.sensor_disconnects, 1);
    assert_eq!(diagnostics.decisions, 1);
}

#[tokio::test]
async fn malformed_frames_are_counted_not_fatal() {
    let mut rig = start(Vec::new());
    boot(&mut rig).await;

    write(&mut rig.module, "$5,06,1,2#".to_string()).await;
    write(&mut rig.module, "$12,42,x#".to_string()).await;
    write(&mut rig.module, frame_event("06", &["1", "2", "3", "4"])).await;
    assert_eq!(read_frame(&mut rig.module).await, "$CMD,START,8#");

    rig.stop.send(()).unwrap();
    let diagnostics = timeout(WAIT, rig.task).await.unwrap().unwrap();
    assert_eq!(diagnostics.frame_errors, 2);
}
