//! PlaybackSession integration tests
//!
//! Run real playback threads against the synthetic decoder and a counting
//! output device.

mod helpers;

use helpers::{ad_url, CountingDevice, SyntheticDecoder, FAILING_URL, MAIN_AMPLITUDE};
use musique_agent::audio::PcmFrame;
use musique_agent::events::AdEvent;
use musique_agent::playback::{AdDecision, AdState, PlaybackSession, SessionExit, SessionSettings};
use musique_agent::Error;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

const STREAM_URL: &str = "http://radio.test/live.mp3";

fn start(decoder: SyntheticDecoder, device: &Arc<CountingDevice>) -> PlaybackSession {
    PlaybackSession::start(
        STREAM_URL,
        Arc::new(decoder),
        device.clone(),
        SessionSettings::default(),
    )
    .expect("session should start")
}

/// Block on the session's exit receiver.
fn wait_exit(session: &mut PlaybackSession) -> SessionExit {
    let mut rx = session.take_exit().expect("exit receiver");
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match rx.try_recv() {
            Ok(exit) => return exit,
            Err(tokio::sync::oneshot::error::TryRecvError::Empty) => {
                assert!(Instant::now() < deadline, "session never exited");
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("exit channel closed: {:?}", e),
        }
    }
}

#[test]
fn test_finite_stream_ends_with_end_of_stream() {
    let device = Arc::new(CountingDevice::new());
    let mut session = start(SyntheticDecoder::finite(5_000), &device);

    let exit = wait_exit(&mut session);
    assert!(matches!(exit, SessionExit::EndOfStream), "got {}", exit);
    session.stop();

    assert_eq!(device.frames(), 5_000);
    assert_eq!(device.opens(), 1);
    assert_eq!(device.closes(), 1);
    assert_eq!(device.counters.drains.load(Ordering::SeqCst), 1);
    assert_eq!(device.last_frame(), Some(PcmFrame::from_mono(MAIN_AMPLITUDE)));
}

#[test]
fn test_stop_is_idempotent_and_closes_device_once() {
    let device = Arc::new(CountingDevice::new());
    let mut session = start(SyntheticDecoder::endless(), &device);

    assert!(device.wait_for_frames(2_048, Duration::from_secs(5)));

    session.stop();
    assert!(session.is_finished());
    session.stop();
    drop(session);

    assert_eq!(device.opens(), 1);
    assert_eq!(device.closes(), 1);
}

#[test]
fn test_stopped_session_reports_stopped() {
    let device = Arc::new(CountingDevice::new());
    let mut session = start(SyntheticDecoder::endless(), &device);
    let mut rx = session.take_exit().expect("exit receiver");
    assert!(session.take_exit().is_none());

    assert!(device.wait_for_frames(512, Duration::from_secs(5)));
    session.stop();

    let exit = rx.try_recv().expect("exit reported before stop returns");
    assert!(matches!(exit, SessionExit::Stopped), "got {}", exit);
}

#[test]
fn test_decoder_open_failure_fails_session() {
    let device = Arc::new(CountingDevice::new());
    let mut session = PlaybackSession::start(
        FAILING_URL,
        Arc::new(SyntheticDecoder::endless()),
        device.clone(),
        SessionSettings::default(),
    )
    .expect("thread spawn");

    let mut ready = session.take_ready().expect("ready receiver");
    let exit = wait_exit(&mut session);
    assert!(matches!(exit, SessionExit::Failed(Error::Decode(_))), "got {}", exit);
    session.stop();

    // Never signalled ready and never touched the device
    assert!(ready.try_recv().is_err());
    assert_eq!(device.opens(), 0);
    assert_eq!(device.closes(), 0);
}

#[test]
fn test_device_open_failure_fails_session() {
    let device = Arc::new(CountingDevice::new());
    device.fail_open.store(true, Ordering::SeqCst);
    let decoder = Arc::new(SyntheticDecoder::endless());

    let mut session = PlaybackSession::start(
        STREAM_URL,
        decoder.clone(),
        device.clone(),
        SessionSettings::default(),
    )
    .expect("thread spawn");

    let exit = wait_exit(&mut session);
    assert!(matches!(exit, SessionExit::Failed(Error::Device(_))), "got {}", exit);
    assert_eq!(decoder.opens.load(Ordering::SeqCst), 1);
    assert_eq!(device.closes(), 0);
}

#[test]
fn test_ready_signalled_once_stream_and_device_open() {
    let device = Arc::new(CountingDevice::new());
    let mut session = start(SyntheticDecoder::endless(), &device);
    let mut ready = session.take_ready().expect("ready receiver");
    assert!(session.take_ready().is_none());

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match ready.try_recv() {
            Ok(()) => break,
            Err(tokio::sync::oneshot::error::TryRecvError::Empty) => {
                assert!(Instant::now() < deadline, "session never became ready");
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(e) => panic!("ready sender dropped: {:?}", e),
        }
    }
    assert_eq!(device.opens(), 1);

    session.stop();
    assert_eq!(device.closes(), 1);
}

#[test]
fn test_enqueue_after_stop_is_rejected() {
    let device = Arc::new(CountingDevice::new());
    let mut session = start(SyntheticDecoder::endless(), &device);
    session.stop();

    let decision = session.enqueue_ad(AdEvent::new(ad_url("late")));
    assert!(decision.is_rejected());
    assert_eq!(session.ad_state(), AdState::Empty);
}

#[test]
fn test_ad_ducks_live_session() {
    let device = Arc::new(CountingDevice::new());
    let mut session = start(SyntheticDecoder::endless().with_ad_frames(441_000), &device);
    let gains = session.gains();

    assert!(device.wait_for_frames(1_024, Duration::from_secs(5)));
    assert_eq!(session.enqueue_ad(AdEvent::new(ad_url("promo"))), AdDecision::Accepted);

    // Default fade is 500ms; the device accepts frames far faster than
    // realtime, so the duck settles quickly
    let deadline = Instant::now() + Duration::from_secs(10);
    while gains.main() > 0.2 || gains.ad() < 1.0 {
        assert!(Instant::now() < deadline, "duck never settled: {} / {}", gains.main(), gains.ad());
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(matches!(session.ad_state(), AdState::Playing | AdState::Draining));

    session.stop();
    assert_eq!(device.closes(), 1);
}
