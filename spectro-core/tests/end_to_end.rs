// Full pipeline over a real UDP socket on localhost.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use spectro_core::predictor::{LinearModel, LinearPredictor, PredictorRegistry};
use spectro_core::{
    AveragedSpectrum, LogContext, PipelineConfig, ReferenceKind, SessionCoordinator, SessionEvent,
};

const N: usize = 1024;

fn coordinator(config: PipelineConfig, predictors: PredictorRegistry) -> SessionCoordinator {
    let log = LogContext::in_memory(1000);
    SessionCoordinator::new(config, Arc::new(predictors), log).unwrap()
}

fn empty_registry() -> PredictorRegistry {
    PredictorRegistry::new(LogContext::in_memory(16))
}

fn encode(samples: impl IntoIterator<Item = u16>) -> Vec<u8> {
    samples.into_iter().flat_map(u16::to_be_bytes).collect()
}

/// Sends datagrams in small bursts so the kernel buffer never overflows.
fn send_all(target: SocketAddr, datagrams: impl IntoIterator<Item = Vec<u8>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    for (i, datagram) in datagrams.into_iter().enumerate() {
        socket.send_to(&datagram, target).unwrap();
        if i % 16 == 15 {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn wait_for<T>(events: &Receiver<SessionEvent>, mut pick: impl FnMut(SessionEvent) -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let event = events.recv_deadline(deadline).expect("timed out waiting for event");
        if let Some(found) = pick(event) {
            return found;
        }
    }
}

fn spectrum_ready(event: SessionEvent) -> Option<(AveragedSpectrum, f64, f64, usize)> {
    match event {
        SessionEvent::SpectrumReady {
            spectrum,
            min,
            max,
            batch_size,
        } => Some((spectrum, min, max, batch_size)),
        _ => None,
    }
}

fn no_more_spectra(events: &Receiver<SessionEvent>) {
    thread::sleep(Duration::from_millis(200));
    assert!(
        !events
            .try_iter()
            .any(|e| matches!(e, SessionEvent::SpectrumReady { .. })),
        "unexpected extra spectrum"
    );
}

#[test]
fn full_batch_yields_one_averaged_spectrum() {
    let config = PipelineConfig::default();
    let batch = config.spectrum_threshold;
    assert_eq!(config.spectrum_len, N);

    let coordinator = coordinator(config, empty_registry());
    let events = coordinator.events();
    let addr = coordinator.start(0, "127.0.0.1").unwrap();

    let sample = |packet: usize, index: usize| (index * 10 + packet % 7) as u16;
    send_all(addr, (0..batch).map(|p| encode((0..N).map(|i| sample(p, i)))));

    let (spectrum, min, max, batch_size) = wait_for(&events, spectrum_ready);
    assert_eq!(batch_size, batch);
    assert_eq!(spectrum.len(), N);

    let mut expected = vec![0.0_f64; N];
    for p in 0..batch {
        for (i, sum) in expected.iter_mut().enumerate() {
            *sum += f64::from(sample(p, i));
        }
    }
    for sum in expected.iter_mut() {
        *sum /= batch as f64;
    }
    for (i, (got, want)) in spectrum.samples().iter().zip(&expected).enumerate() {
        assert!((got - want).abs() < 1e-9, "index {i}: {got} != {want}");
    }
    assert!((min - expected[0]).abs() < 1e-9);
    assert!((max - expected[N - 1]).abs() < 1e-9);

    no_more_spectra(&events);
    assert_eq!(coordinator.stats().packet_count, batch as u64);

    coordinator.reset_packet_count();
    assert_eq!(coordinator.stats().packet_count, 0);
}

#[test]
fn black_and_white_references_normalize_the_mean() {
    let config = PipelineConfig {
        spectrum_threshold: 100,
        ..PipelineConfig::default()
    };
    let coordinator = coordinator(config, empty_registry());
    coordinator
        .set_reference(ReferenceKind::Black, AveragedSpectrum::from_samples(vec![0.0; N], 1))
        .unwrap();
    coordinator
        .set_reference(ReferenceKind::White, AveragedSpectrum::from_samples(vec![1.0; N], 1))
        .unwrap();

    let events = coordinator.events();
    let addr = coordinator.start(0, "127.0.0.1").unwrap();
    send_all(addr, (0..100).map(|p| encode(std::iter::repeat_n((p % 2) as u16, N))));

    let (spectrum, min, max, _) = wait_for(&events, spectrum_ready);
    assert!(spectrum.samples().iter().all(|&v| (v - 0.5).abs() < 1e-12));
    assert_eq!((min, max), (0.5, 0.5));
}

#[test]
fn collected_reference_is_applied_after_a_restart() {
    let config = PipelineConfig {
        spectrum_threshold: 60,
        reference_threshold: 50,
        progress_report_interval: 10,
        ..PipelineConfig::default()
    };
    let coordinator = coordinator(config, empty_registry());
    let events = coordinator.events();
    let addr = coordinator.start(0, "127.0.0.1").unwrap();

    coordinator.start_reference(ReferenceKind::Black).unwrap();
    assert!(coordinator.is_accumulating(ReferenceKind::Black));
    send_all(addr, (0..50).map(|_| encode(std::iter::repeat_n(5u16, N))));

    let black = wait_for(&events, |event| match event {
        SessionEvent::ReferenceReady {
            kind: ReferenceKind::Black,
            spectrum,
        } => Some(spectrum),
        _ => None,
    });
    assert!(black.samples().iter().all(|&v| v == 5.0));
    assert_eq!((black.min, black.max), (5.0, 5.0));

    let deadline = Instant::now() + Duration::from_secs(5);
    while coordinator.is_accumulating(ReferenceKind::Black) {
        assert!(Instant::now() < deadline, "accumulator was not released");
        thread::sleep(Duration::from_millis(5));
    }

    coordinator.stop();
    coordinator
        .set_reference(ReferenceKind::White, AveragedSpectrum::from_samples(vec![15.0; N], 1))
        .unwrap();
    let addr = coordinator.start(0, "127.0.0.1").unwrap();

    send_all(addr, (0..60).map(|_| encode(std::iter::repeat_n(10u16, N))));
    let (spectrum, _, _, _) = wait_for(&events, spectrum_ready);
    assert!(spectrum.samples().iter().all(|&v| (v - 0.5).abs() < 1e-12));
    assert!(coordinator.reference(ReferenceKind::Black).is_some());
}

#[test]
fn selected_predictor_runs_on_every_spectrum() {
    let registry = empty_registry();
    registry.register(Box::new(LinearPredictor::with_model(
        "mean",
        LinearModel {
            bias: 1.0,
            weights: vec![1.0 / N as f64; N],
        },
    )));
    let config = PipelineConfig {
        spectrum_threshold: 10,
        ..PipelineConfig::default()
    };
    let coordinator = coordinator(config, registry);
    coordinator.set_predictor_index(Some(0)).unwrap();

    let events = coordinator.events();
    let addr = coordinator.start(0, "127.0.0.1").unwrap();
    send_all(addr, (0..10).map(|_| encode(std::iter::repeat_n(40u16, N))));

    let (predictor, value) = wait_for(&events, |event| match event {
        SessionEvent::Prediction { predictor, value } => Some((predictor, value)),
        _ => None,
    });
    assert_eq!(predictor, 0);
    assert!((value - 41.0).abs() < 1e-9);
}

#[test]
fn stopping_mid_reference_never_reports_it() {
    let config = PipelineConfig {
        reference_threshold: 40,
        ..PipelineConfig::default()
    };
    let coordinator = coordinator(config, empty_registry());
    let events = coordinator.events();
    let addr = coordinator.start(0, "127.0.0.1").unwrap();

    coordinator.start_reference(ReferenceKind::White).unwrap();
    send_all(addr, (0..20).map(|_| encode(std::iter::repeat_n(3u16, N))));
    wait_for(&events, |event| match event {
        SessionEvent::ReferenceProgress { progress, .. } if progress.count == 20 => Some(()),
        _ => None,
    });
    coordinator.stop_reference(ReferenceKind::White);

    // The rest of the batch arrives after the cancellation.
    send_all(addr, (0..40).map(|_| encode(std::iter::repeat_n(3u16, N))));
    thread::sleep(Duration::from_millis(300));
    assert!(
        !events
            .try_iter()
            .any(|e| matches!(e, SessionEvent::ReferenceReady { .. }))
    );
    assert!(coordinator.reference(ReferenceKind::White).is_none());
    assert!(coordinator.stats().white.is_none());
}

#[test]
fn packets_per_second_follows_each_window() {
    let config = PipelineConfig {
        rate_window_ms: 250,
        ..PipelineConfig::default()
    };
    let coordinator = coordinator(config, empty_registry());
    let events = coordinator.events();
    let addr = coordinator.start(0, "127.0.0.1").unwrap();
    let next_rate = || {
        wait_for(&events, |event| match event {
            SessionEvent::PacketsPerSecond(rate) => Some(rate),
            _ => None,
        })
    };

    // Align with a window boundary, then send a known count per window.
    next_rate();
    for count in [30, 5, 0, 12] {
        send_all(addr, (0..count).map(|_| encode(std::iter::repeat_n(1u16, N))));
        assert_eq!(next_rate(), count as u64);
        assert_eq!(coordinator.stats().packets_per_second, count as u64);
    }
    assert_eq!(coordinator.stats().packet_count, 47);
}
