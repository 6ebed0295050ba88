use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use async_impl::{event_queue, Controller, ControllerEvent, DoorAutomation, LoggingActuator, ReportSink, SensorPort};
use common::codec::{frame_event, frame_reply};
use common::metrics::CycleResult;
use common::{
    Command, ControllerConfig, FrameCodec, LinkError, LinkHealth, MetricsRecorder, OutboundEvent,
    RecognitionAggregator, SensorMessage, SharedDiagnostics,
};
use criterion::{black_box, Criterion};
use tokio::time::{Duration, Instant};

const USERS: [&str; 4] = ["user001", "user002", "user003", "unknown"];

struct NullSensor;

impl SensorPort for NullSensor {
    fn send(&self, _command: Command) -> Result<(), LinkError> {
        Ok(())
    }

    fn attach(&self) -> Result<(), LinkError> {
        Ok(())
    }
}

struct NullRemote;

impl ReportSink for NullRemote {
    fn send(&self, _event: OutboundEvent) -> Result<(), LinkError> {
        Ok(())
    }
}

/// Deterministic sensor traffic: a detection, the START reply, then a burst
/// of recognition samples with scores that wander around the threshold.
fn synthetic_traffic(rounds: usize) -> Vec<u8> {
    let mut stream = String::new();
    for round in 0..rounds {
        stream.push_str(&frame_event("06", &["120", "80", "64", "64"]));
        stream.push_str(&frame_reply("OK", &["Started:8"]));
        for sample in 0..6 {
            let user = USERS[(round + sample / 3) % USERS.len()];
            let score = 60 + ((round * 7 + sample * 13) % 40);
            stream.push_str(&frame_event("08", &["120", "80", "64", "64", user, &score.to_string()]));
        }
        if round % 10 == 0 {
            // line noise and a length mismatch now and then
            stream.push_str("~~$5,06,1,2#");
        }
    }
    stream.into_bytes()
}

fn decode_all(bytes: &[u8], chunk: usize) -> Vec<SensorMessage> {
    let mut codec = FrameCodec::new();
    bytes.chunks(chunk).flat_map(|c| codec.feed(c).collect::<Vec<_>>()).collect()
}

fn run_aggregator(messages: &[SensorMessage], config: &ControllerConfig) -> usize {
    let mut aggregator = RecognitionAggregator::new(config.window());
    let start = std::time::Instant::now();
    let mut outcomes = 0;
    for (i, message) in messages.iter().enumerate() {
        if let SensorMessage::Recognition(event) = message {
            let now = start + Duration::from_millis(i as u64 * 40);
            outcomes += aggregator.observe(event, now).len();
        }
    }
    outcomes
}

/// Replays `messages` through a controller, timing each handled event.
fn run_controller(messages: &[SensorMessage], config: &ControllerConfig) -> MetricsRecorder {
    let recorder = MetricsRecorder::new();
    let (events, _receiver) = event_queue();
    let door = DoorAutomation::new(config.auto_close_delay(), events, Box::new(LoggingActuator));
    let t0 = Instant::now();
    let mut controller = Controller::new(
        config,
        Box::new(NullSensor),
        Box::new(NullRemote),
        door,
        Arc::new(SharedDiagnostics::default()),
        t0,
    );

    let mut feed = |cycle: u64, event: ControllerEvent, now: Instant| {
        let kind = event.kind();
        let started = std::time::Instant::now();
        controller.handle_event(event, now);
        recorder.record(CycleResult::new(cycle, kind, started.elapsed()));
    };

    feed(0, ControllerEvent::SensorHealth(LinkHealth::Connected), t0);
    feed(1, ControllerEvent::Sensor(SensorMessage::Ack { data: vec!["Started:6".into()] }), t0);
    for (i, message) in messages.iter().enumerate() {
        let now = t0 + Duration::from_millis(i as u64 * 40);
        let cycle = i as u64 + 2;
        feed(cycle, ControllerEvent::Sensor(message.clone()), now);
        if i % 25 == 0 {
            feed(cycle, ControllerEvent::Tick, now);
        }
        if i % 200 == 0 {
            feed(cycle, ControllerEvent::Remote(common::RemoteCommand::Close), now);
        }
    }
    recorder
}

fn analyze_results_detailed(results: &[CycleResult], name: &str) {
    if results.is_empty() {
        println!("{}: No results to analyze", name);
        return;
    }

    let total = results.len();
    let missed_deadlines = results.iter().filter(|r| !r.deadline_met).count();
    let deadline_rate = (1.0 - (missed_deadlines as f64 / total as f64)) * 100.0;

    let processing_times: Vec<f64> = results
        .iter()
        .map(|r| r.processing_time_ns as f64 / 1000.0) // μs
        .collect();

    println!("\n=== {} Detailed Analysis ===", name);
    println!("Total events: {}", total);
    println!("Deadline compliance: {:.2}% ({} missed)", deadline_rate, missed_deadlines);

    let avg_proc = processing_times.iter().sum::<f64>() / processing_times.len() as f64;
    let min_proc = processing_times.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max_proc = processing_times.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    println!("Processing time (μs): avg={:.2}, min={:.2}, max={:.2}", avg_proc, min_proc, max_proc);

    let max_lateness = results.iter().map(|r| r.lateness_ns).max().unwrap_or(0);
    println!("Max lateness: {} ns", max_lateness);

    let by_kind: HashMap<&str, Vec<&CycleResult>> = results.iter().fold(HashMap::new(), |mut acc, r| {
        acc.entry(r.event).or_insert_with(Vec::new).push(r);
        acc
    });

    println!("\nPer event kind:");
    let mut kinds: Vec<_> = by_kind.into_iter().collect();
    kinds.sort_by_key(|(kind, _)| *kind);
    for (kind, events) in kinds {
        let missed = events.iter().filter(|r| !r.deadline_met).count();
        let avg = events.iter().map(|r| r.processing_time_ns as f64 / 1000.0).sum::<f64>() / events.len() as f64;
        println!(
            "  {}: {} events, {:.2}% deadline met, avg {:.2} μs",
            kind,
            events.len(),
            (1.0 - (missed as f64 / events.len() as f64)) * 100.0,
            avg
        );
    }
}

fn benchmark_codec(c: &mut Criterion, traffic: &[u8]) {
    c.bench_function("codec_feed_64b_chunks", |b| {
        b.iter(|| black_box(decode_all(black_box(traffic), 64).len()));
    });
}

fn benchmark_aggregator(c: &mut Criterion, messages: &[SensorMessage], config: &ControllerConfig) {
    c.bench_function("aggregator_windows", |b| {
        b.iter(|| black_box(run_aggregator(black_box(messages), config)));
    });
}

fn benchmark_controller(c: &mut Criterion, messages: &[SensorMessage], config: &ControllerConfig, rt: &tokio::runtime::Runtime) {
    let _guard = rt.enter();
    c.bench_function("controller_replay", |b| {
        b.iter(|| black_box(run_controller(black_box(messages), config).get_results().len()));
    });
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--help") {
        eprintln!("Usage: benchmark_runner [rounds] [--csv <file>] [--criterion]");
        eprintln!("Example: benchmark_runner 500 --csv controller_events.csv");
        std::process::exit(1);
    }

    let rounds = args
        .get(1)
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(500);
    let csv_path = args
        .iter()
        .position(|a| a == "--csv")
        .and_then(|i| args.get(i + 1))
        .cloned();
    let use_criterion = args.contains(&"--criterion".to_string());

    let config = ControllerConfig {
        device_token: "benchmark".into(),
        ..ControllerConfig::default()
    };
    let traffic = synthetic_traffic(rounds);

    println!("========================================");
    println!("Smart Door Edge Benchmark");
    println!("========================================");
    println!("Rounds: {}", rounds);
    println!("Traffic: {} bytes", traffic.len());
    println!("Window: {:.1} s, threshold {}", config.face_window_secs, config.face_score_threshold);
    println!("========================================\n");

    let rt = tokio::runtime::Runtime::new().expect("Failed to build runtime");

    if use_criterion {
        let messages = decode_all(&traffic, traffic.len().max(1));
        let mut criterion = Criterion::default()
            .sample_size(20)
            .measurement_time(std::time::Duration::from_secs(10));

        println!("Running statistical benchmarks...");
        benchmark_codec(&mut criterion, &traffic);
        benchmark_aggregator(&mut criterion, &messages, &config);
        benchmark_controller(&mut criterion, &messages, &config, &rt);

        println!("\n========================================");
        println!("Criterion statistical analysis complete!");
        println!("Check the target/criterion directory for detailed HTML reports.");
        println!("========================================");
        return;
    }

    let start = std::time::Instant::now();
    let whole = decode_all(&traffic, traffic.len().max(1));
    let chunked = decode_all(&traffic, 7);
    println!(
        "Codec: {} messages in {:.2} ms (chunked decode identical: {})",
        whole.len(),
        start.elapsed().as_secs_f64() * 1000.0,
        whole == chunked
    );

    let start = std::time::Instant::now();
    let outcomes = run_aggregator(&whole, &config);
    println!(
        "Aggregator: {} window outcomes in {:.2} ms",
        outcomes,
        start.elapsed().as_secs_f64() * 1000.0
    );

    let recorder = {
        let _guard = rt.enter();
        run_controller(&whole, &config)
    };
    analyze_results_detailed(&recorder.get_results(), "CONTROLLER");

    if let Some(path) = csv_path {
        recorder.save_to_csv(&path).expect("Failed to save CSV");
        println!("Results saved to {}", path);
    }

    println!("\n========================================");
    println!("Benchmark complete!");
    println!("========================================");
}
