//! Capture loop behaviour against the simulated device link.
//!
//! Run: `cargo test --test frame_source`

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use futures_util::{pin_mut, StreamExt};

use qc_edge::capture::sim::{SimStep, TestPattern};
use qc_edge::capture::{
    CaptureSettings, DeviceDescriptor, DeviceLink, DeviceSession, FrameSource, PixelFormat,
    RawFrame, ScratchBuffer, SimulatedLink,
};
use qc_edge::control::ControlSurface;
use qc_edge::error::DeviceError;
use qc_edge::pipeline::stream::StreamSettings;
use qc_edge::pipeline::{FrameCache, StreamMultiplexer};

// ── Shared helpers ───────────────────────────────────────────────────

fn settings(width: u32, height: u32) -> CaptureSettings {
    CaptureSettings {
        device: None,
        read_timeout: Duration::from_millis(50),
        failure_backoff: Duration::from_millis(1),
        failure_report_every: 100,
        scratch_bytes: (width * height) as usize,
    }
}

fn source(link: SimulatedLink, width: u32, height: u32) -> FrameSource {
    FrameSource::new(
        Box::new(link),
        settings(width, height),
        Arc::new(ControlSurface::new()),
        Arc::new(FrameCache::new()),
    )
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn small_link() -> SimulatedLink {
    SimulatedLink::new(32, 24).with_frame_interval(Duration::from_millis(1))
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[test]
fn dim_frames_are_normalized_and_published() {
    let link = SimulatedLink::new(640, 480)
        .with_pattern(TestPattern::Dim(40))
        .with_frame_interval(Duration::from_millis(2));
    let source = source(link, 640, 480);
    assert!(source.snapshot().is_none());

    source.start().expect("start");
    assert!(source.is_running());
    wait_until("first frame", || source.cache().latest_sequence() >= 1);

    let entry = source.snapshot().expect("frame");
    assert_eq!(entry.frame.width(), 640);
    assert_eq!(entry.frame.height(), 480);
    assert_eq!(entry.frame.max_sample(), 255);

    source.stop();
    assert!(!source.is_running());
}

#[test]
fn absent_device_leaves_source_stopped() {
    let source = source(SimulatedLink::absent(), 32, 24);
    assert!(matches!(source.start(), Err(DeviceError::Unavailable(_))));
    assert!(!source.is_running());
    assert!(source.active_device().is_none());
    assert!(source.snapshot().is_none());
}

#[test]
fn unknown_selector_is_unavailable() {
    let source = FrameSource::new(
        Box::new(small_link()),
        CaptureSettings {
            device: Some("/dev/video9".into()),
            ..settings(32, 24)
        },
        Arc::new(ControlSurface::new()),
        Arc::new(FrameCache::new()),
    );
    assert!(matches!(source.start(), Err(DeviceError::Unavailable(_))));
    assert!(!source.is_running());
}

#[test]
fn busy_device_is_closed_after_failed_start() {
    let link = small_link().busy();
    let probe = link.probe();
    let source = source(link, 32, 24);

    assert!(matches!(source.start(), Err(DeviceError::Busy(_))));
    assert!(!source.is_running());
    assert_eq!(probe.opened.load(Ordering::Relaxed), 1);
    assert_eq!(probe.closed.load(Ordering::Relaxed), 1);
}

#[test]
fn stop_is_idempotent_and_closes_session() {
    let link = small_link();
    let probe = link.probe();
    let source = source(link, 32, 24);

    source.stop();
    source.start().expect("start");
    assert_eq!(source.active_device().map(|d| d.id), Some("sim0".to_owned()));
    source.stop();
    source.stop();

    assert!(!source.is_running());
    assert!(source.active_device().is_none());
    assert_eq!(probe.closed.load(Ordering::Relaxed), 1);
}

#[test]
fn second_start_keeps_single_loop() {
    let link = small_link();
    let probe = link.probe();
    let source = source(link, 32, 24);

    source.start().expect("start");
    source.start().expect("second start is a no-op");
    assert_eq!(probe.opened.load(Ordering::Relaxed), 1);

    source.stop();
    source.start().expect("restart");
    assert_eq!(probe.opened.load(Ordering::Relaxed), 2);
    wait_until("frame after restart", || source.stats().frames_published >= 1);
}

#[test]
fn last_frame_survives_stop() {
    let source = source(small_link(), 32, 24);
    source.start().expect("start");
    wait_until("frame", || source.cache().latest_sequence() >= 1);
    source.stop();

    let held = source.cache().latest_sequence();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(source.cache().latest_sequence(), held);
    assert!(source.snapshot().is_some());
}

// ── Fault tolerance ──────────────────────────────────────────────────

#[test]
fn recovers_after_99_failures_without_reporting() {
    let script = (0..99).map(|i| if i % 2 == 0 { SimStep::Timeout } else { SimStep::IoError });
    let link = small_link().with_script(script);
    let source = source(link, 32, 24);

    source.start().expect("start");
    wait_until("frame after failures", || source.stats().frames_published >= 1);
    source.stop();

    let stats = source.stats();
    assert_eq!(stats.read_failures, 99);
    assert_eq!(stats.failure_reports, 0);
    assert!(source.snapshot().is_some());
}

#[test]
fn reports_once_per_hundred_consecutive_failures() {
    let link = small_link().with_script(std::iter::repeat(SimStep::Timeout).take(250));
    let source = source(link, 32, 24);

    source.start().expect("start");
    wait_until("frame after failures", || source.stats().frames_published >= 1);
    source.stop();

    let stats = source.stats();
    assert_eq!(stats.read_failures, 250);
    assert_eq!(stats.failure_reports, 2);
}

#[test]
fn bad_geometry_is_a_soft_failure() {
    let link = small_link().with_script([SimStep::Truncated, SimStep::Truncated, SimStep::Frame]);
    let source = source(link, 32, 24);

    source.start().expect("start");
    wait_until("frame after bad geometry", || source.stats().frames_published >= 1);
    source.stop();

    let stats = source.stats();
    assert_eq!(stats.decode_failures, 2);
    assert_eq!(stats.read_failures, 0);
}

#[test]
fn unknown_format_with_matching_length_is_published() {
    let link = small_link().with_format(PixelFormat::Other(0x0110_0003));
    let source = source(link, 32, 24);
    source.start().expect("start");
    wait_until("frame", || source.stats().frames_published >= 1);
    source.stop();
    assert_eq!(source.stats().decode_failures, 0);
}

#[test]
fn bayer_frames_are_published_as_rgb() {
    let link = small_link()
        .with_format(PixelFormat::BayerRg8)
        .with_pattern(TestPattern::Solid(160));
    let source = source(link, 32, 24);
    source.start().expect("start");
    wait_until("frame", || source.stats().frames_published >= 1);
    source.stop();

    let entry = source.snapshot().expect("frame");
    assert!(entry.frame.image.as_raw().iter().all(|&v| v == 160));
}

#[test]
fn zero_report_cadence_reports_every_failure() {
    let link = small_link().with_script([SimStep::Timeout, SimStep::IoError]);
    let source = FrameSource::new(
        Box::new(link),
        CaptureSettings {
            failure_report_every: 0,
            ..settings(32, 24)
        },
        Arc::new(ControlSurface::new()),
        Arc::new(FrameCache::new()),
    );

    source.start().expect("start");
    wait_until("frame after failures", || source.stats().frames_published >= 1);
    assert!(source.is_running());
    source.stop();

    let stats = source.stats();
    assert_eq!(stats.read_failures, 2);
    assert_eq!(stats.failure_reports, 2);
}

/// Device link whose first session dies inside `read_frame`.
struct PanickingLink {
    inner: SimulatedLink,
    opened: usize,
}

struct PanickingSession;

impl DeviceSession for PanickingSession {
    fn start_capture(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn read_frame<'a>(
        &mut self,
        _scratch: &'a mut ScratchBuffer,
        _timeout: Duration,
    ) -> Result<RawFrame<'a>, DeviceError> {
        panic!("driver fault");
    }

    fn close(&mut self) {}
}

impl DeviceLink for PanickingLink {
    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        self.inner.enumerate()
    }

    fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<Box<dyn DeviceSession>, DeviceError> {
        self.opened += 1;
        if self.opened == 1 {
            Ok(Box::new(PanickingSession))
        } else {
            self.inner.open(descriptor)
        }
    }
}

#[test]
fn dead_capture_thread_clears_running_and_can_restart() {
    let link = PanickingLink {
        inner: small_link(),
        opened: 0,
    };
    let source = FrameSource::new(
        Box::new(link),
        settings(32, 24),
        Arc::new(ControlSurface::new()),
        Arc::new(FrameCache::new()),
    );

    source.start().expect("start");
    wait_until("running flag cleared", || !source.is_running());
    wait_until("device released", || source.active_device().is_none());
    assert_eq!(source.stats().frames_published, 0);

    source.start().expect("restart after dead loop");
    assert!(source.is_running());
    wait_until("frame after restart", || source.stats().frames_published >= 1);
    source.stop();
}

// ── Controls ─────────────────────────────────────────────────────────

#[test]
fn gain_applies_to_subsequent_frames() {
    let link = small_link().with_pattern(TestPattern::Solid(100));
    let source = source(link, 32, 24);
    source.control().set_gain(2.0);

    source.start().expect("start");
    wait_until("gained frame", || {
        source
            .snapshot()
            .is_some_and(|e| e.frame.image.as_raw()[0] == 200)
    });

    source.control().set_gain(0.5);
    wait_until("re-gained frame", || {
        source
            .snapshot()
            .is_some_and(|e| e.frame.image.as_raw()[0] == 50)
    });
    source.stop();

    assert_eq!(source.control().gain(), 0.5);
}

// ── Consumers ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumers_see_non_decreasing_sequences() {
    let source = Arc::new(source(small_link(), 32, 24));
    source.start().expect("start");

    let mux = StreamMultiplexer::new(
        Arc::clone(source.cache()),
        StreamSettings {
            poll_interval: Duration::from_millis(5),
            frame_interval: Duration::from_millis(1),
            jpeg_quality: 70,
        },
    );

    let consume = |mux: StreamMultiplexer, delay: Duration| {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let stream = mux.subscribe();
            pin_mut!(stream);
            let mut seen = Vec::new();
            for _ in 0..20 {
                seen.push(stream.next().await.expect("frame").sequence);
            }
            seen
        })
    };
    let early = consume(mux.clone(), Duration::ZERO);
    let late = consume(mux.clone(), Duration::from_millis(40));

    for seen in [early.await.expect("early"), late.await.expect("late")] {
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert!(seen[0] >= 1);
    }

    let stopper = Arc::clone(&source);
    tokio::task::spawn_blocking(move || stopper.stop())
        .await
        .expect("stop");
}
