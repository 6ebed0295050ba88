use std::future::Future;
use std::io::ErrorKind;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_serial::{DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info, trace, warn};

use common::{Command, FrameCodec, HealthCell, LinkError, LinkHealth, SharedDiagnostics};

use crate::event::{ControllerEvent, EventSender};

const REQUEST_QUEUE_CAPACITY: usize = 32;
const READ_CHUNK: usize = 512;
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Something that can (re)open the byte channel to the sensor module.
pub trait SensorOpener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn open(&self) -> impl Future<Output = Result<Self::Stream, LinkError>> + Send;
}

/// 8N1 serial port opener.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    endpoint: String,
    baud: u32,
    timeout: Duration,
}

impl SerialOpener {
    pub fn new(endpoint: impl Into<String>, baud: u32, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            baud,
            timeout,
        }
    }
}

impl SensorOpener for SerialOpener {
    type Stream = SerialStream;

    async fn open(&self) -> Result<SerialStream, LinkError> {
        let open_error = |reason: String| LinkError::Open {
            endpoint: self.endpoint.clone(),
            reason,
        };
        let port = tokio_serial::new(&self.endpoint, self.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| open_error(e.to_string()))?;
        port.clear(tokio_serial::ClearBuffer::All)
            .map_err(|e| open_error(e.to_string()))?;
        info!(endpoint = %self.endpoint, baud = self.baud, "serial port opened");
        Ok(port)
    }
}

enum LinkRequest {
    Send(Command),
    Attach,
    Shutdown,
}

/// What the controller needs from the sensor link.
pub trait SensorPort: Send {
    /// Queues `command` for writing; never waits for the device.
    fn send(&self, command: Command) -> Result<(), LinkError>;
    /// Asks a detached link to reopen its channel.
    fn attach(&self) -> Result<(), LinkError>;
}

/// Cloneable handle to a running sensor link.
#[derive(Clone)]
pub struct SensorHandle {
    requests: mpsc::Sender<LinkRequest>,
    health: Arc<HealthCell>,
}

impl SensorHandle {
    pub fn health(&self) -> LinkHealth {
        self.health.get()
    }

    fn request(&self, request: LinkRequest) -> Result<(), LinkError> {
        self.requests.try_send(request).map_err(|err| match err {
            TrySendError::Full(_) => LinkError::QueueFull,
            TrySendError::Closed(_) => LinkError::NotConnected,
        })
    }
}

impl SensorPort for SensorHandle {
    fn send(&self, command: Command) -> Result<(), LinkError> {
        if !self.health().is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.request(LinkRequest::Send(command))
    }

    fn attach(&self) -> Result<(), LinkError> {
        self.request(LinkRequest::Attach)
    }
}

/// Owns the sensor byte channel: one read loop plus a write path, both
/// feeding the controller queue. Losing the channel emits
/// `SensorHealth(Disconnected)`; reopening only happens on `attach`.
pub struct SensorLink {
    handle: SensorHandle,
    task: JoinHandle<()>,
}

impl SensorLink {
    /// Opens the serial device immediately, failing if it cannot be acquired.
    pub async fn open(
        endpoint: &str,
        baud: u32,
        read_timeout: Duration,
        events: EventSender,
        diagnostics: Arc<SharedDiagnostics>,
    ) -> Result<Self, LinkError> {
        let opener = SerialOpener::new(endpoint, baud, read_timeout);
        let stream = opener.open().await?;
        Ok(Self::spawn(opener, Some(stream), events, diagnostics))
    }

    /// Starts the link task. With `initial` the link is attached at once,
    /// otherwise it waits for [`SensorPort::attach`].
    pub fn spawn<O: SensorOpener>(
        opener: O,
        initial: Option<O::Stream>,
        events: EventSender,
        diagnostics: Arc<SharedDiagnostics>,
    ) -> Self {
        let (requests, rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let health = Arc::new(HealthCell::new(LinkHealth::Disconnected));
        let task = tokio::spawn(supervise(opener, initial, rx, events, health.clone(), diagnostics));
        Self {
            handle: SensorHandle { requests, health },
            task,
        }
    }

    pub fn handle(&self) -> SensorHandle {
        self.handle.clone()
    }

    /// Stops the read loop and closes the channel, abandoning it after `grace`.
    pub async fn shutdown(self, grace: Duration) {
        let SensorLink { handle, mut task } = self;
        let _ = timeout(grace, handle.requests.send(LinkRequest::Shutdown)).await;
        match timeout(grace, &mut task).await {
            Ok(_) => info!("sensor link stopped"),
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "sensor link did not stop in time, abandoning");
                task.abort();
            }
        }
    }
}

enum SessionEnd {
    Lost(LinkError),
    Shutdown,
}

async fn supervise<O: SensorOpener>(
    opener: O,
    mut initial: Option<O::Stream>,
    mut requests: mpsc::Receiver<LinkRequest>,
    events: EventSender,
    health: Arc<HealthCell>,
    diagnostics: Arc<SharedDiagnostics>,
) {
    loop {
        let stream = match initial.take() {
            Some(stream) => stream,
            None => {
                if !wait_for_attach(&mut requests, &events).await {
                    return;
                }
                match opener.open().await {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(error = %err, "sensor reattach failed");
                        events.send(ControllerEvent::SensorHealth(LinkHealth::Disconnected)).await;
                        continue;
                    }
                }
            }
        };

        health.set(LinkHealth::Connected);
        info!("sensor link connected");
        events.send(ControllerEvent::SensorHealth(LinkHealth::Connected)).await;

        let end = run_session(stream, &mut requests, &events, &diagnostics).await;
        health.set(LinkHealth::Disconnected);
        match end {
            SessionEnd::Shutdown => return,
            SessionEnd::Lost(err) => {
                warn!(error = %err, "sensor link lost");
                diagnostics.record_sensor_disconnect();
                events.send(ControllerEvent::SensorHealth(LinkHealth::Disconnected)).await;
            }
        }
    }
}

/// Waits while detached. Returns false on shutdown.
async fn wait_for_attach(requests: &mut mpsc::Receiver<LinkRequest>, events: &EventSender) -> bool {
    loop {
        match requests.recv().await {
            Some(LinkRequest::Attach) => return true,
            Some(LinkRequest::Send(command)) => {
                events
                    .send(ControllerEvent::SensorWriteFailed {
                        command,
                        error: LinkError::NotConnected,
                    })
                    .await;
            }
            Some(LinkRequest::Shutdown) | None => return false,
        }
    }
}

async fn run_session<S>(
    stream: S,
    requests: &mut mpsc::Receiver<LinkRequest>,
    events: &EventSender,
    diagnostics: &Arc<SharedDiagnostics>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut read_task = tokio::spawn(read_loop(reader, events.clone(), diagnostics.clone()));

    let end = loop {
        tokio::select! {
            result = &mut read_task => {
                break SessionEnd::Lost(match result {
                    Ok(err) => err,
                    Err(join) => LinkError::Io(join.to_string()),
                });
            }
            request = requests.recv() => match request {
                Some(LinkRequest::Send(command)) => {
                    let frame = FrameCodec::encode(&command);
                    debug!(%command, "sensor tx");
                    let write = async {
                        writer.write_all(&frame).await?;
                        writer.flush().await
                    };
                    let result = match timeout(WRITE_TIMEOUT, write).await {
                        Ok(result) => result.map_err(LinkError::from),
                        Err(_) => Err(LinkError::Timeout),
                    };
                    if let Err(error) = result {
                        events
                            .send(ControllerEvent::SensorWriteFailed { command, error: error.clone() })
                            .await;
                        break SessionEnd::Lost(error);
                    }
                }
                Some(LinkRequest::Attach) => trace!("attach ignored, already connected"),
                Some(LinkRequest::Shutdown) | None => break SessionEnd::Shutdown,
            }
        }
    };
    read_task.abort();
    end
}

/// Reads until the channel fails, forwarding each decoded message.
async fn read_loop<R>(mut reader: R, events: EventSender, diagnostics: Arc<SharedDiagnostics>) -> LinkError
where
    R: AsyncRead + Unpin,
{
    let mut codec = FrameCodec::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return LinkError::Closed,
            Ok(n) => n,
            Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                continue
            }
            Err(err) => return err.into(),
        };
        trace!(bytes = n, "sensor rx");

        let errors_before = codec.frame_errors();
        let messages: Vec<_> = codec.feed(&buf[..n]).collect();
        let new_errors = codec.frame_errors() - errors_before;
        if new_errors > 0 {
            diagnostics.record_frame_errors(new_errors);
        }
        for message in messages {
            if !events.send(ControllerEvent::Sensor(message)).await {
                return LinkError::Closed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{event_queue, EventReceiver};
    use common::codec::{frame_event, frame_reply};
    use common::{BoundingBox, FeatureId, SensorMessage};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    struct DuplexOpener(Mutex<VecDeque<DuplexStream>>);

    impl SensorOpener for DuplexOpener {
        type Stream = DuplexStream;

        async fn open(&self) -> Result<DuplexStream, LinkError> {
            self.0.lock().unwrap().pop_front().ok_or_else(|| LinkError::Open {
                endpoint: "duplex".into(),
                reason: "no stream left".into(),
            })
        }
    }

    async fn next_event(rx: &mut EventReceiver) -> ControllerEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("queue open")
    }

    fn start(spare: Vec<DuplexStream>) -> (SensorLink, DuplexStream, EventReceiver, Arc<SharedDiagnostics>) {
        let (local, remote) = tokio::io::duplex(256);
        let (tx, rx) = event_queue();
        let diagnostics = Arc::new(SharedDiagnostics::default());
        let opener = DuplexOpener(Mutex::new(spare.into()));
        let link = SensorLink::spawn(opener, Some(local), tx, diagnostics.clone());
        (link, remote, rx, diagnostics)
    }

    #[tokio::test]
    async fn split_frames_reach_the_controller_in_order() {
        let (link, mut module, mut rx, diagnostics) = start(Vec::new());
        assert!(matches!(next_event(&mut rx).await, ControllerEvent::SensorHealth(LinkHealth::Connected)));

        let stream = format!("{}$5,06,1,2#{}", frame_event("06", &["1", "2", "3", "4"]), frame_reply("OK", &["Started:8"]));
        let (a, b) = stream.as_bytes().split_at(7);
        module.write_all(a).await.unwrap();
        module.write_all(b).await.unwrap();

        match next_event(&mut rx).await {
            ControllerEvent::Sensor(SensorMessage::Detection(bbox)) => {
                assert_eq!(bbox, BoundingBox { x: 1, y: 2, w: 3, h: 4 })
            }
            other => panic!("unexpected {other:?}"),
        }
        match next_event(&mut rx).await {
            ControllerEvent::Sensor(SensorMessage::Ack { data }) => assert_eq!(data, vec!["Started:8"]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(diagnostics.snapshot().frame_errors, 1);
        link.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn commands_are_written_bit_exact() {
        let (link, mut module, mut rx, _) = start(Vec::new());
        next_event(&mut rx).await;

        let handle = link.handle();
        handle.send(Command::Start(FeatureId::Detect)).unwrap();
        handle.send(Command::Ping).unwrap();

        let expected = b"$CMD,START,6#$CMD,PING#";
        let mut got = vec![0u8; expected.len()];
        module.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, expected);
        link.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn lost_link_waits_for_attach() {
        let (spare_local, mut spare_remote) = tokio::io::duplex(256);
        let (link, module, mut rx, diagnostics) = start(vec![spare_local]);
        next_event(&mut rx).await;

        drop(module);
        assert!(matches!(next_event(&mut rx).await, ControllerEvent::SensorHealth(LinkHealth::Disconnected)));
        let handle = link.handle();
        assert_eq!(handle.health(), LinkHealth::Disconnected);
        assert_eq!(handle.send(Command::Ping), Err(LinkError::NotConnected));
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err(), "no self-reconnect");

        handle.attach().unwrap();
        assert!(matches!(next_event(&mut rx).await, ControllerEvent::SensorHealth(LinkHealth::Connected)));
        handle.send(Command::Stop).unwrap();
        let mut got = vec![0u8; b"$CMD,STOP#".len()];
        spare_remote.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"$CMD,STOP#");
        assert_eq!(diagnostics.snapshot().sensor_disconnects, 1);
        link.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failed_reattach_reports_disconnected_again() {
        let (link, module, mut rx, _) = start(Vec::new());
        next_event(&mut rx).await;
        drop(module);
        next_event(&mut rx).await;

        link.handle().attach().unwrap();
        assert!(matches!(next_event(&mut rx).await, ControllerEvent::SensorHealth(LinkHealth::Disconnected)));
        link.shutdown(Duration::from_secs(1)).await;
    }
}
