//! The single consumer of the controller event queue.
//!
//! Every state change (door, recognition window, pending sensor commands)
//! happens inside [`Controller::handle_event`], one event at a time, so none
//! of it needs locking.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use common::metrics::CycleResult;
use common::{
    Backoff, Command, CommandError, ControllerConfig, ControllerState, DoorState, FeatureId, LinkError, LinkHealth,
    LogType, MetricsRecorder, OutboundEvent, RecognitionAggregator, RecognitionEvent, RemoteCommand, Report,
    SensorMessage, SharedDiagnostics, UserId, WindowOutcome,
};

use crate::door::DoorAutomation;
use crate::event::{ControllerEvent, EventReceiver};
use crate::remote_channel::ReportSink;
use crate::sensor_link::SensorPort;

pub const REATTACH_BASE: Duration = Duration::from_secs(1);
pub const REATTACH_MAX: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct PendingCommand {
    command: Command,
    deadline: Instant,
}

pub struct Controller {
    state: ControllerState,
    /// Boot handshake done; decides where the door-open state falls back to.
    booted: bool,
    boot_retry_due: bool,
    sensor: Box<dyn SensorPort>,
    remote: Box<dyn ReportSink>,
    aggregator: RecognitionAggregator,
    door: DoorAutomation,
    pending: VecDeque<PendingCommand>,
    active_feature: Option<FeatureId>,
    recognizing_since: Option<Instant>,
    sensor_health: LinkHealth,
    remote_health: LinkHealth,
    reattach: Backoff,
    next_reattach: Option<Instant>,
    status_interval: Duration,
    next_status: Instant,
    diagnostics: Arc<SharedDiagnostics>,
    metrics: Option<MetricsRecorder>,
    cycle: u64,
}

impl Controller {
    pub fn new(
        config: &ControllerConfig,
        sensor: Box<dyn SensorPort>,
        remote: Box<dyn ReportSink>,
        door: DoorAutomation,
        diagnostics: Arc<SharedDiagnostics>,
        now: Instant,
    ) -> Self {
        let status_interval = config.status_interval();
        Self {
            state: ControllerState::Booting,
            booted: false,
            boot_retry_due: false,
            sensor,
            remote,
            aggregator: RecognitionAggregator::new(config.window()),
            door,
            pending: VecDeque::new(),
            active_feature: None,
            recognizing_since: None,
            sensor_health: LinkHealth::Disconnected,
            remote_health: LinkHealth::Disconnected,
            reattach: Backoff::new(REATTACH_BASE, REATTACH_MAX),
            next_reattach: None,
            status_interval,
            next_status: now + status_interval,
            diagnostics,
            metrics: None,
            cycle: 0,
        }
    }

    /// Times every handled event into `recorder`.
    pub fn with_metrics(mut self, recorder: MetricsRecorder) -> Self {
        self.metrics = Some(recorder);
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn door_state(&self) -> DoorState {
        self.door.state()
    }

    pub fn active_feature(&self) -> Option<FeatureId> {
        self.active_feature
    }

    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    /// Consumes events until `shutdown` resolves or every producer is gone,
    /// then cancels the auto-close deadline.
    pub async fn run<F>(&mut self, mut events: EventReceiver, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("controller running");
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("controller shutdown requested");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("controller queue closed");
                        break;
                    };
                    let kind = event.kind();
                    let started = std::time::Instant::now();
                    self.handle_event(event, Instant::now());
                    if let Some(metrics) = &self.metrics {
                        metrics.record(CycleResult::new(self.cycle, kind, started.elapsed()));
                    }
                    self.cycle += 1;
                }
            }
        }
        self.door.shutdown();
    }

    pub fn handle_event(&mut self, event: ControllerEvent, now: Instant) {
        trace!(kind = event.kind(), state = ?self.state, "event");
        match event {
            ControllerEvent::Sensor(message) => self.on_sensor_message(message, now),
            ControllerEvent::SensorHealth(health) => self.on_sensor_health(health, now),
            ControllerEvent::SensorWriteFailed { command, error } => self.on_write_failed(command, error),
            ControllerEvent::Remote(command) => self.on_remote_command(command, now),
            ControllerEvent::RemoteHealth(health) => self.on_remote_health(health),
            ControllerEvent::AutoCloseDue { generation } => {
                if self.door.on_deadline(generation) {
                    self.door_closed();
                }
            }
            ControllerEvent::Tick => self.on_tick(now),
        }
    }

    fn transition(&mut self, next: ControllerState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "controller state");
            self.state = next;
        }
    }

    fn idle_state(&self) -> ControllerState {
        if self.booted {
            ControllerState::IdleWatching
        } else {
            ControllerState::Booting
        }
    }

    // ---- sensor side ----

    fn on_sensor_message(&mut self, message: SensorMessage, now: Instant) {
        match message {
            SensorMessage::Detection(bbox) => {
                trace!(?bbox, "face detected");
                match self.state {
                    ControllerState::IdleWatching => {
                        self.start_recognition(now);
                    }
                    ControllerState::Recognizing => {
                        self.aggregator.on_detection();
                    }
                    ControllerState::Booting | ControllerState::DoorOpen => {}
                }
            }
            SensorMessage::Recognition(event) => self.on_recognition(event, now),
            SensorMessage::StatusReply { mode, detail } => {
                info!(mode, detail = %detail, "sensor status");
            }
            SensorMessage::Registration { user, saved, detail } => {
                // the $RSP reply to REGCAM settles the pending command
                info!(user = %user, saved, detail = %detail, "sensor registration result");
            }
            SensorMessage::Fault { code, message } => {
                error!(code, message = %message, "sensor fault");
                self.report(LogType::System, format!("sensor fault {code}: {message}"));
            }
            reply if reply.is_reply() => self.on_reply(reply),
            other => warn!(?other, "unhandled sensor message"),
        }
    }

    fn on_recognition(&mut self, event: RecognitionEvent, now: Instant) {
        debug!(user = %event.label, score = event.score, "recognition sample");
        match self.state {
            ControllerState::Recognizing => {}
            // the module is still in recognition mode after the last window
            ControllerState::IdleWatching if self.active_feature == Some(FeatureId::Recognize) => {
                if !self.start_recognition(now) {
                    return;
                }
            }
            _ => return,
        }
        // an elapsed window and the one this sample opens can both close here
        for outcome in self.aggregator.observe(&event, now.into_std()) {
            self.on_window_outcome(outcome, now);
        }
    }

    fn on_window_outcome(&mut self, outcome: WindowOutcome, now: Instant) {
        match outcome {
            WindowOutcome::Accepted(decision) => {
                self.diagnostics.record_decision();
                info!(user = %decision.identity, score = decision.confidence, "access granted");
                self.open_door();
                self.report(
                    LogType::Success,
                    format!("recognized {} (score {}%)", decision.identity, decision.confidence),
                );
            }
            WindowOutcome::Rejected { attempts } => {
                self.diagnostics.record_reject();
                info!(attempts, "recognition rejected");
                self.report(LogType::Reject, format!("recognition failed after {attempts} attempts"));
                if self.aggregator.is_open() {
                    // the sample that closed the old window opened a new one
                    self.recognizing_since = Some(now);
                } else {
                    self.recognizing_since = None;
                    self.transition(ControllerState::IdleWatching);
                }
            }
        }
    }

    /// Enters `Recognizing`, asking the module for recognition if needed.
    /// Returns false while the sensor link is down.
    fn start_recognition(&mut self, now: Instant) -> bool {
        if !self.sensor_health.is_connected() {
            debug!("sensor disconnected, not starting recognition");
            return false;
        }
        if self.active_feature != Some(FeatureId::Recognize) {
            self.issue(Command::Start(FeatureId::Recognize), now);
        }
        self.recognizing_since = Some(now);
        self.transition(ControllerState::Recognizing);
        true
    }

    fn on_reply(&mut self, reply: SensorMessage) {
        let Some(pending) = self.pending.pop_front() else {
            warn!(?reply, "reply with no command awaiting it");
            return;
        };
        let command = pending.command;
        let result = match reply {
            SensorMessage::Ack { data } => Ok(data.join(",")),
            SensorMessage::Pong { info } => Ok(info.join(",")),
            SensorMessage::Error { message } => Err(CommandError::Rejected {
                command: command.to_string(),
                message,
            }),
            other => {
                warn!(?other, "unexpected message treated as reply");
                Ok(String::new())
            }
        };
        self.command_finished(command, result);
    }

    fn on_write_failed(&mut self, command: Command, error: LinkError) {
        if let Some(index) = self.pending.iter().position(|p| p.command == command) {
            self.pending.remove(index);
        }
        let failure = CommandError::Link {
            command: command.to_string(),
            source: error,
        };
        self.command_finished(command, Err(failure));
    }

    fn on_sensor_health(&mut self, health: LinkHealth, now: Instant) {
        let previous = std::mem::replace(&mut self.sensor_health, health);
        match health {
            LinkHealth::Connected => {
                info!("sensor link up");
                self.reattach.reset();
                self.next_reattach = None;
                if self.booted {
                    self.issue(Command::Start(FeatureId::Recognize), now);
                } else {
                    // this is the handshake a failed one was waiting to retry
                    self.boot_retry_due = false;
                    self.issue(Command::Start(FeatureId::Detect), now);
                }
            }
            LinkHealth::Disconnected | LinkHealth::Reconnecting => {
                if previous.is_connected() {
                    warn!("sensor link down");
                }
                self.active_feature = None;
                self.fail_pending(|command| CommandError::Link {
                    command,
                    source: LinkError::NotConnected,
                });
                if self.state == ControllerState::Recognizing {
                    self.aggregator.reset();
                    self.recognizing_since = None;
                    self.transition(ControllerState::IdleWatching);
                }
                if self.next_reattach.is_none() {
                    let delay = self.reattach.next_delay();
                    info!(delay_ms = delay.as_millis() as u64, "sensor reattach scheduled");
                    self.next_reattach = Some(now + delay);
                }
            }
        }
    }

    /// Sends `command` and remembers it until its reply or deadline.
    fn issue(&mut self, command: Command, now: Instant) {
        match self.sensor.send(command.clone()) {
            Ok(()) => {
                debug!(%command, "command sent");
                if let Command::Start(feature) = command {
                    self.active_feature = Some(feature);
                }
                let deadline = now + Duration::from_millis(command.reply_timeout_ms());
                self.pending.push_back(PendingCommand { command, deadline });
            }
            Err(error) => {
                let failure = CommandError::Link {
                    command: command.to_string(),
                    source: error,
                };
                self.command_finished(command, Err(failure));
            }
        }
    }

    fn command_finished(&mut self, command: Command, result: Result<String, CommandError>) {
        match (&command, result) {
            (Command::Start(feature), Ok(_)) => {
                self.active_feature = Some(*feature);
                if !self.booted && *feature == FeatureId::Detect {
                    info!("sensor ready, watching for faces");
                    self.booted = true;
                    self.boot_retry_due = false;
                    if self.state == ControllerState::Booting {
                        self.transition(ControllerState::IdleWatching);
                    }
                }
            }
            (Command::Stop, Ok(_)) => self.active_feature = None,
            (Command::RegisterFace(user), Ok(_)) => {
                info!(user = %user, "face registered");
                self.report(LogType::System, format!("registration succeeded: {user}"));
            }
            (Command::RegisterFace(user), Err(failure)) => {
                error!(user = %user, error = %failure, "face registration failed");
                self.report(LogType::System, format!("registration failed for {user}: {failure}"));
            }
            (_, Ok(data)) => debug!(%command, data = %data, "command acknowledged"),
            (_, Err(failure)) => {
                warn!(%command, error = %failure, "command failed");
                if let Command::Start(feature) = &command {
                    let feature = *feature;
                    if self.active_feature == Some(feature) {
                        self.active_feature = None;
                    }
                    if !self.booted && feature == FeatureId::Detect {
                        self.boot_retry_due = true;
                    }
                }
                self.report(LogType::System, format!("{failure}"));
            }
        }
    }

    fn fail_pending<F>(&mut self, make_error: F)
    where
        F: Fn(String) -> CommandError,
    {
        let failed: Vec<_> = self.pending.drain(..).collect();
        for pending in failed {
            let failure = make_error(pending.command.to_string());
            self.command_finished(pending.command, Err(failure));
        }
    }

    // ---- remote side ----

    fn on_remote_command(&mut self, command: RemoteCommand, now: Instant) {
        info!(?command, state = ?self.state, "remote command");
        match command {
            RemoteCommand::Open => {
                self.open_door();
                self.report(LogType::System, "remote open");
            }
            RemoteCommand::Close => {
                if self.door.close() {
                    self.door_closed();
                } else if self.state == ControllerState::DoorOpen {
                    self.transition(self.idle_state());
                }
                self.report(LogType::System, "remote close");
            }
            RemoteCommand::RegisterFace(raw) => self.register_face(raw, now),
            RemoteCommand::Refresh => {
                self.send_remote(OutboundEvent::DoorStatus(self.door.state()));
                if self.state == ControllerState::IdleWatching {
                    self.start_recognition(now);
                }
            }
        }
    }

    fn register_face(&mut self, raw: String, now: Instant) {
        let user = match UserId::new(raw) {
            Ok(user) => user,
            Err(err) => {
                warn!(error = %err, "registration refused");
                self.report(LogType::System, format!("registration failed: {err}"));
                return;
            }
        };
        if !self.sensor_health.is_connected() {
            self.report(
                LogType::System,
                format!("registration failed for {user}: sensor link unavailable"),
            );
            return;
        }
        info!(user = %user, "registration started");
        self.report(LogType::System, format!("registration started: {user}"));
        if self.state == ControllerState::Recognizing {
            self.aggregator.reset();
            self.recognizing_since = None;
            self.transition(ControllerState::IdleWatching);
        }
        self.issue(Command::Stop, now);
        self.issue(Command::RegisterFace(user), now);
        self.issue(Command::Start(FeatureId::Recognize), now);
    }

    fn on_remote_health(&mut self, health: LinkHealth) {
        let previous = std::mem::replace(&mut self.remote_health, health);
        if previous == health {
            return;
        }
        info!(%health, "remote channel");
        if health.is_connected() {
            self.send_remote(OutboundEvent::DoorStatus(self.door.state()));
        }
    }

    fn report(&mut self, kind: LogType, msg: impl Into<String>) {
        self.send_remote(OutboundEvent::Report(Report::new(kind, msg)));
    }

    fn send_remote(&mut self, event: OutboundEvent) {
        // the channel logs and counts drops itself
        let _ = self.remote.send(event);
    }

    // ---- door ----

    fn open_door(&mut self) {
        if self.state == ControllerState::Recognizing {
            self.aggregator.reset();
            self.recognizing_since = None;
        }
        let changed = self.door.open();
        self.transition(ControllerState::DoorOpen);
        if changed {
            self.send_remote(OutboundEvent::DoorStatus(DoorState::Open));
        }
    }

    fn door_closed(&mut self) {
        self.send_remote(OutboundEvent::DoorStatus(DoorState::Closed));
        if self.state == ControllerState::DoorOpen {
            self.transition(self.idle_state());
        }
    }

    // ---- housekeeping ----

    fn on_tick(&mut self, now: Instant) {
        if self.state == ControllerState::Recognizing {
            if let Some(outcome) = self.aggregator.poll(now.into_std()) {
                self.on_window_outcome(outcome, now);
            } else if !self.aggregator.is_open() {
                let idle_for = self.recognizing_since.map(|since| now.saturating_duration_since(since));
                if idle_for.is_some_and(|idle| idle >= self.aggregator.config().duration) {
                    debug!("no recognition samples, back to watching");
                    self.recognizing_since = None;
                    self.transition(ControllerState::IdleWatching);
                }
            }
        }

        self.expire_pending(now);

        if let Some(due) = self.next_reattach {
            if now >= due && !self.sensor_health.is_connected() {
                self.next_reattach = None;
                info!(attempt = self.reattach.attempts(), "requesting sensor reattach");
                if let Err(err) = self.sensor.attach() {
                    warn!(error = %err, "sensor reattach request failed");
                    self.next_reattach = Some(now + self.reattach.next_delay());
                }
            }
        }

        if self.boot_retry_due && self.sensor_health.is_connected() {
            info!("retrying boot handshake");
            self.boot_retry_due = false;
            self.issue(Command::Start(FeatureId::Detect), now);
        }

        if now >= self.next_status {
            self.next_status = now + self.status_interval;
            if self.remote_health.is_connected() {
                self.send_remote(OutboundEvent::DoorStatus(self.door.state()));
            }
        }
    }

    fn expire_pending(&mut self, now: Instant) {
        if !self.pending.iter().any(|p| p.deadline <= now) {
            return;
        }
        let (expired, waiting): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|p| p.deadline <= now);
        self.pending = waiting.into();
        for pending in expired {
            let failure = CommandError::Timeout(pending.command.to_string());
            self.command_finished(pending.command, Err(failure));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::door::LoggingActuator;
    use crate::event::event_queue;
    use common::BoundingBox;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct MockSensor {
        sent: Arc<Mutex<Vec<Command>>>,
        attaches: Arc<Mutex<usize>>,
    }

    impl MockSensor {
        fn take(&self) -> Vec<String> {
            self.sent.lock().unwrap().drain(..).map(|c| c.to_string()).collect()
        }
    }

    impl SensorPort for MockSensor {
        fn send(&self, command: Command) -> Result<(), LinkError> {
            self.sent.lock().unwrap().push(command);
            Ok(())
        }

        fn attach(&self) -> Result<(), LinkError> {
            *self.attaches.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct MockRemote(Arc<Mutex<Vec<OutboundEvent>>>);

    impl MockRemote {
        fn take(&self) -> Vec<OutboundEvent> {
            self.0.lock().unwrap().drain(..).collect()
        }
    }

    impl ReportSink for MockRemote {
        fn send(&self, event: OutboundEvent) -> Result<(), LinkError> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct Harness {
        controller: Controller,
        sensor: MockSensor,
        remote: MockRemote,
        events: EventReceiver,
        t0: Instant,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(config())
        }

        fn with_config(config: ControllerConfig) -> Self {
            let (tx, events) = event_queue();
            let sensor = MockSensor::default();
            let remote = MockRemote::default();
            let t0 = Instant::now();
            let door = DoorAutomation::new(config.auto_close_delay(), tx, Box::new(LoggingActuator));
            let controller = Controller::new(
                &config,
                Box::new(sensor.clone()),
                Box::new(remote.clone()),
                door,
                Arc::new(SharedDiagnostics::default()),
                t0,
            );
            Self {
                controller,
                sensor,
                remote,
                events,
                t0,
            }
        }

        fn at(&self, ms: u64) -> Instant {
            self.t0 + Duration::from_millis(ms)
        }

        fn feed(&mut self, event: ControllerEvent, ms: u64) {
            let now = self.at(ms);
            self.controller.handle_event(event, now);
        }

        fn ack(&mut self, ms: u64) {
            self.feed(ControllerEvent::Sensor(SensorMessage::Ack { data: vec!["OK".into()] }), ms);
        }

        /// Boot handshake plus remote connection, with outputs cleared.
        fn booted() -> Self {
            Self::booted_with(config())
        }

        fn booted_with(config: ControllerConfig) -> Self {
            let mut h = Self::with_config(config);
            h.feed(ControllerEvent::RemoteHealth(LinkHealth::Connected), 0);
            h.feed(ControllerEvent::SensorHealth(LinkHealth::Connected), 0);
            h.ack(10);
            h.sensor.take();
            h.remote.take();
            h
        }

        fn recognition(&mut self, user: &str, score: u8, ms: u64) {
            let event = RecognitionEvent {
                bbox: BoundingBox { x: 0, y: 0, w: 10, h: 10 },
                label: user.into(),
                score,
            };
            self.feed(ControllerEvent::Sensor(SensorMessage::Recognition(event)), ms);
        }

        fn detection(&mut self, ms: u64) {
            let bbox = BoundingBox { x: 1, y: 2, w: 3, h: 4 };
            self.feed(ControllerEvent::Sensor(SensorMessage::Detection(bbox)), ms);
        }
    }

    fn config() -> ControllerConfig {
        ControllerConfig {
            device_token: "token".into(),
            ..ControllerConfig::default()
        }
    }

    fn door_reports(events: &[OutboundEvent]) -> Vec<DoorState> {
        events
            .iter()
            .filter_map(|e| match e {
                OutboundEvent::DoorStatus(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn reports(events: &[OutboundEvent], kind: LogType) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                OutboundEvent::Report(r) if r.kind == kind => Some(r.msg.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn boot_waits_for_start_acknowledgement() {
        let mut h = Harness::new();
        assert_eq!(h.controller.state(), ControllerState::Booting);

        h.feed(ControllerEvent::SensorHealth(LinkHealth::Connected), 0);
        assert_eq!(h.sensor.take(), vec!["START(6)"]);
        assert_eq!(h.controller.state(), ControllerState::Booting);

        h.ack(50);
        assert_eq!(h.controller.state(), ControllerState::IdleWatching);
        assert_eq!(h.controller.active_feature(), Some(FeatureId::Detect));
        assert_eq!(h.controller.pending_commands(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_boot_start_is_retried() {
        let mut h = Harness::new();
        h.feed(ControllerEvent::SensorHealth(LinkHealth::Connected), 0);
        h.sensor.take();

        h.feed(ControllerEvent::Tick, 9_000);
        assert!(h.sensor.take().is_empty());
        h.feed(ControllerEvent::Tick, 10_000);
        assert_eq!(h.sensor.take(), vec!["START(6)"], "timeout then retry in one tick");
        assert_eq!(h.controller.state(), ControllerState::Booting);

        h.feed(ControllerEvent::Sensor(SensorMessage::Error { message: "busy".into() }), 10_100);
        h.feed(ControllerEvent::Tick, 10_200);
        assert_eq!(h.sensor.take(), vec!["START(6)"]);
        h.ack(10_300);
        assert_eq!(h.controller.state(), ControllerState::IdleWatching);
    }

    #[tokio::test(start_paused = true)]
    async fn detection_then_recognition_opens_the_door() {
        let mut h = Harness::booted();

        h.detection(100);
        assert_eq!(h.sensor.take(), vec!["START(8)"]);
        assert_eq!(h.controller.state(), ControllerState::Recognizing);
        h.ack(200);

        h.recognition("user001", 85, 500);
        h.recognition("user001", 60, 1_000);
        assert_eq!(h.controller.state(), ControllerState::Recognizing);
        h.recognition("user001", 90, 2_000);

        assert_eq!(h.controller.state(), ControllerState::DoorOpen);
        assert_eq!(h.controller.door_state(), DoorState::Open);
        let sent = h.remote.take();
        assert_eq!(door_reports(&sent), vec![DoorState::Open]);
        assert_eq!(reports(&sent, LogType::Success), vec!["recognized user001 (score 90%)"]);

        // samples while the door is open are ignored
        h.recognition("user001", 99, 2_100);
        h.recognition("user001", 99, 2_200);
        assert!(h.remote.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_close_returns_to_watching() {
        let mut h = Harness::booted();
        h.feed(ControllerEvent::Remote(RemoteCommand::Open), 0);
        assert_eq!(h.controller.state(), ControllerState::DoorOpen);
        h.remote.take();

        tokio::time::sleep(Duration::from_secs(6)).await;
        let event = h.events.recv().await.unwrap();
        assert!(matches!(event, ControllerEvent::AutoCloseDue { .. }));
        h.feed(event, 6_000);

        assert_eq!(h.controller.state(), ControllerState::IdleWatching);
        assert_eq!(door_reports(&h.remote.take()), vec![DoorState::Closed]);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_cancels_the_deadline_and_reports_once() {
        let mut h = Harness::booted();
        h.feed(ControllerEvent::Remote(RemoteCommand::Open), 0);
        h.remote.take();

        h.feed(ControllerEvent::Remote(RemoteCommand::Close), 1_000);
        assert_eq!(h.controller.door_state(), DoorState::Closed);
        assert_eq!(h.controller.state(), ControllerState::IdleWatching);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.events.try_recv().is_err(), "deadline was cancelled");

        h.feed(ControllerEvent::Remote(RemoteCommand::Close), 2_000);
        let sent = h.remote.take();
        assert_eq!(door_reports(&sent), vec![DoorState::Closed]);
        assert_eq!(reports(&sent, LogType::System), vec!["remote close", "remote close"]);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_window_without_match_is_rejected() {
        let mut h = Harness::booted();
        h.detection(0);
        h.ack(10);
        h.recognition("user002", 50, 100);
        h.recognition("unknown", 99, 200);

        h.feed(ControllerEvent::Tick, 4_000);
        assert_eq!(h.controller.state(), ControllerState::Recognizing);
        h.feed(ControllerEvent::Tick, 5_200);

        assert_eq!(h.controller.state(), ControllerState::IdleWatching);
        assert_eq!(h.controller.door_state(), DoorState::Closed);
        let sent = h.remote.take();
        assert_eq!(reports(&sent, LogType::Reject), vec!["recognition failed after 2 attempts"]);
        assert!(door_reports(&sent).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_loss_while_recognizing_blocks_decisions() {
        let mut h = Harness::booted();
        h.detection(0);
        h.ack(10);
        h.recognition("user001", 95, 100);

        h.feed(ControllerEvent::SensorHealth(LinkHealth::Disconnected), 200);
        assert_eq!(h.controller.state(), ControllerState::IdleWatching);
        assert_eq!(h.controller.active_feature(), None);

        h.sensor.take();
        h.detection(300);
        h.recognition("user001", 95, 400);
        h.recognition("user001", 95, 500);
        assert!(h.sensor.take().is_empty(), "no START while disconnected");
        assert_eq!(h.controller.state(), ControllerState::IdleWatching);
        assert_eq!(h.controller.door_state(), DoorState::Closed);

        h.feed(ControllerEvent::SensorHealth(LinkHealth::Connected), 2_000);
        assert_eq!(h.sensor.take(), vec!["START(8)"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_backs_off() {
        let mut h = Harness::booted();
        h.feed(ControllerEvent::SensorHealth(LinkHealth::Disconnected), 0);

        h.feed(ControllerEvent::Tick, 900);
        assert_eq!(*h.sensor.attaches.lock().unwrap(), 0);
        h.feed(ControllerEvent::Tick, 1_000);
        assert_eq!(*h.sensor.attaches.lock().unwrap(), 1);

        // attempt failed; the next one waits twice as long
        h.feed(ControllerEvent::SensorHealth(LinkHealth::Disconnected), 1_100);
        h.feed(ControllerEvent::Tick, 2_500);
        assert_eq!(*h.sensor.attaches.lock().unwrap(), 1);
        h.feed(ControllerEvent::Tick, 3_100);
        assert_eq!(*h.sensor.attaches.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn registration_runs_stop_regcam_start() {
        let mut h = Harness::booted();

        h.feed(ControllerEvent::Remote(RemoteCommand::RegisterFace("  ".into())), 0);
        assert!(h.sensor.take().is_empty());
        assert_eq!(
            reports(&h.remote.take(), LogType::System),
            vec!["registration failed: user id must not be empty"]
        );

        h.feed(ControllerEvent::Remote(RemoteCommand::RegisterFace("alice".into())), 100);
        assert_eq!(h.sensor.take(), vec!["STOP", "REGCAM(alice)", "START(8)"]);
        h.ack(200);
        h.ack(3_000);
        h.ack(3_500);
        assert_eq!(h.controller.pending_commands(), 0);
        assert_eq!(h.controller.active_feature(), Some(FeatureId::Recognize));
        assert_eq!(
            reports(&h.remote.take(), LogType::System),
            vec!["registration started: alice", "registration succeeded: alice"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refused_registration_is_reported() {
        let mut h = Harness::booted();
        h.feed(ControllerEvent::Remote(RemoteCommand::RegisterFace("bob".into())), 0);
        h.ack(100);
        h.feed(ControllerEvent::Sensor(SensorMessage::Error { message: "no face".into() }), 200);
        let system = reports(&h.remote.take(), LogType::System);
        assert_eq!(system.len(), 2);
        assert!(system[1].starts_with("registration failed for bob"));
        assert!(system[1].contains("no face"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_reports_status_and_starts_recognition() {
        let mut h = Harness::booted();
        h.feed(ControllerEvent::Remote(RemoteCommand::Refresh), 0);
        assert_eq!(door_reports(&h.remote.take()), vec![DoorState::Closed]);
        assert_eq!(h.sensor.take(), vec!["START(8)"]);
        assert_eq!(h.controller.state(), ControllerState::Recognizing);

        // nothing recognized within one window
        h.ack(10);
        h.feed(ControllerEvent::Tick, 5_100);
        assert_eq!(h.controller.state(), ControllerState::IdleWatching);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_status_only_when_remote_is_up() {
        let mut h = Harness::booted();
        h.feed(ControllerEvent::Tick, 30_000);
        assert_eq!(door_reports(&h.remote.take()), vec![DoorState::Closed]);

        h.feed(ControllerEvent::RemoteHealth(LinkHealth::Reconnecting), 31_000);
        h.feed(ControllerEvent::Tick, 60_000);
        assert!(h.remote.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn late_sample_after_reject_keeps_its_window_polled() {
        let mut h = Harness::booted();
        h.detection(0);
        h.ack(10);
        h.recognition("user002", 50, 100);

        // the window elapsed at 5.1 s; this sample lands before the next tick
        h.recognition("unknown", 99, 5_150);
        assert_eq!(h.controller.state(), ControllerState::Recognizing);
        assert_eq!(
            reports(&h.remote.take(), LogType::Reject),
            vec!["recognition failed after 1 attempts"]
        );

        let mut ms = 5_200;
        while ms <= 600_000 {
            h.feed(ControllerEvent::Tick, ms);
            ms += 200;
        }
        assert_eq!(h.controller.state(), ControllerState::IdleWatching);
        assert_eq!(
            reports(&h.remote.take(), LogType::Reject),
            vec!["recognition failed after 1 attempts"]
        );

        // ten minutes later one sample opens a fresh window and decides nothing
        h.recognition("alice", 95, 600_000);
        assert_eq!(h.controller.state(), ControllerState::Recognizing);
        assert_eq!(h.controller.door_state(), DoorState::Closed);
        assert!(reports(&h.remote.take(), LogType::Success).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn window_opened_by_late_sample_decides_on_time() {
        let mut h = Harness::booted();
        h.detection(0);
        h.ack(10);
        h.recognition("user002", 50, 100);
        h.recognition("alice", 95, 5_150);
        assert_eq!(h.controller.state(), ControllerState::Recognizing);

        h.feed(ControllerEvent::Tick, 10_000);
        assert_eq!(h.controller.door_state(), DoorState::Closed);
        h.feed(ControllerEvent::Tick, 10_200);
        assert_eq!(h.controller.state(), ControllerState::DoorOpen);
        assert_eq!(
            reports(&h.remote.take(), LogType::Success),
            vec!["recognized alice (score 95%)"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_sample_can_reject_and_accept_at_once() {
        let mut h = Harness::booted_with(ControllerConfig {
            face_early_accept: 1,
            ..config()
        });
        h.detection(0);
        h.ack(10);
        h.recognition("user002", 50, 100);
        h.recognition("alice", 95, 5_150);

        let sent = h.remote.take();
        assert_eq!(reports(&sent, LogType::Reject), vec!["recognition failed after 1 attempts"]);
        assert_eq!(reports(&sent, LogType::Success), vec!["recognized alice (score 95%)"]);
        assert_eq!(door_reports(&sent), vec![DoorState::Open]);
        assert_eq!(h.controller.state(), ControllerState::DoorOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn module_events_never_settle_pending_commands() {
        let mut h = Harness::new();
        h.feed(ControllerEvent::RemoteHealth(LinkHealth::Connected), 0);
        h.feed(ControllerEvent::SensorHealth(LinkHealth::Connected), 0);
        h.remote.take();

        let fault = SensorMessage::Fault { code: 3, message: "camera fault".into() };
        h.feed(ControllerEvent::Sensor(fault), 50);
        assert_eq!(h.controller.pending_commands(), 1);
        assert_eq!(h.controller.state(), ControllerState::Booting);
        assert_eq!(
            reports(&h.remote.take(), LogType::System),
            vec!["sensor fault 3: camera fault"]
        );

        h.ack(100);
        assert_eq!(h.controller.state(), ControllerState::IdleWatching);

        // REGCAM result event alongside its $RSP reply
        h.feed(ControllerEvent::Remote(RemoteCommand::RegisterFace("bob".into())), 200);
        h.ack(300);
        let result = SensorMessage::Registration {
            user: "bob".into(),
            saved: true,
            detail: "saved".into(),
        };
        h.feed(ControllerEvent::Sensor(result), 2_900);
        assert_eq!(h.controller.pending_commands(), 2);
        h.ack(3_000);
        h.ack(3_500);
        assert_eq!(h.controller.pending_commands(), 0);
        assert_eq!(h.controller.active_feature(), Some(FeatureId::Recognize));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_during_boot_sends_one_handshake() {
        let mut h = Harness::new();
        h.feed(ControllerEvent::SensorHealth(LinkHealth::Connected), 0);
        h.feed(ControllerEvent::SensorHealth(LinkHealth::Disconnected), 100);
        h.feed(ControllerEvent::SensorHealth(LinkHealth::Connected), 1_000);
        assert_eq!(h.sensor.take(), vec!["START(6)", "START(6)"]);

        h.feed(ControllerEvent::Tick, 1_200);
        assert!(h.sensor.take().is_empty());
        assert_eq!(h.controller.pending_commands(), 1);
        h.ack(1_300);
        assert_eq!(h.controller.state(), ControllerState::IdleWatching);
    }
}
