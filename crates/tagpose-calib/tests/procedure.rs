use approx::assert_relative_eq;
use nalgebra::{Isometry3, Point2, Rotation3, Translation3, Vector3};
use std::collections::VecDeque;
use tagpose_calib::solver::project_point;
use tagpose_calib::{
    AcceptAll, BoardObservation, CalibrationError, CalibrationOptions, CalibrationSession,
    CalibrationStore, Calibrator, CheckerboardFinder, CheckerboardSpec, MemoryCalibrationStore,
    ObservationReview, ReviewDecision,
};
use tagpose_core::{
    CameraParams, CaptureError, ColorFrame, Distortion, FrameSource, GrayImageView,
};

const SQUARE: f64 = 0.02261;

struct ScriptedSource {
    frames: VecDeque<Result<ColorFrame, CaptureError>>,
}

impl ScriptedSource {
    fn new(frames: impl IntoIterator<Item = Result<ColorFrame, CaptureError>>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    fn good(n: usize) -> Self {
        Self::new((0..n).map(|_| Ok(ColorFrame::new(480, 240))))
    }
}

impl FrameSource for ScriptedSource {
    fn read(&mut self) -> Result<ColorFrame, CaptureError> {
        self.frames.pop_front().unwrap_or(Err(CaptureError::Exhausted))
    }

    fn resolution(&self) -> (usize, usize) {
        (480, 240)
    }
}

/// Hands out precomputed boards, one per successfully read frame.
struct ScriptedFinder {
    boards: VecDeque<Option<BoardObservation>>,
}

impl CheckerboardFinder for ScriptedFinder {
    fn find(&mut self, _: &GrayImageView<'_>, _: &CheckerboardSpec) -> Option<BoardObservation> {
        self.boards.pop_front().flatten()
    }
}

struct Script(VecDeque<ReviewDecision>);

impl ObservationReview for Script {
    fn review(&mut self, _: &ColorFrame, _: &BoardObservation, _: usize) -> ReviewDecision {
        self.0.pop_front().unwrap_or(ReviewDecision::Accept)
    }
}

fn camera() -> CameraParams {
    CameraParams::new(352.0, 349.0, 243.0, 118.0)
}

fn lens() -> Distortion {
    Distortion {
        k1: -0.18,
        k2: 0.03,
        ..Distortion::default()
    }
}

fn pose(k: usize) -> Isometry3<f64> {
    let f = k as f64;
    let rot = Rotation3::from_euler_angles(
        0.35 * (0.9 * f).sin(),
        0.35 * (1.3 * f + 0.5).cos(),
        0.15 * f.sin(),
    );
    let center = Vector3::new(4.0 * SQUARE, 2.5 * SQUARE, 0.0);
    let t = Vector3::new(0.015 * (f * 0.7).sin(), 0.01 * (f * 1.1).cos(), 0.34) - rot * center;
    Isometry3::from_parts(Translation3::from(t), rot.into())
}

fn board(k: usize, noise_px: f64) -> BoardObservation {
    let spec = CheckerboardSpec::new(9, 6, SQUARE);
    let corners = spec
        .board_points()
        .iter()
        .enumerate()
        .map(|(n, p)| {
            let px = project_point(&camera(), &lens(), &pose(k), p);
            let jitter = ((n * 7919 + k * 104_729) % 17) as f64 / 17.0 - 0.5;
            Point2::new(px.x + noise_px * jitter, px.y - noise_px * jitter)
        })
        .collect();
    BoardObservation { corners }
}

fn finder(n: usize, noise_px: f64) -> ScriptedFinder {
    ScriptedFinder {
        boards: (0..n).map(|k| Some(board(k, noise_px))).collect(),
    }
}

#[test]
fn unattended_session_solves_and_saves() {
    let mut session = CalibrationSession::new(finder(12, 0.0), AcceptAll, CalibrationOptions::default());
    let mut source = ScriptedSource::good(12);
    let mut store = MemoryCalibrationStore::new();

    let report = session
        .calibrate(&mut source, SQUARE, &mut store)
        .expect("calibration succeeds");
    assert_eq!(report.views, 10);
    assert_eq!(report.frames_read, 10);
    assert!(report.rms_error < 1e-3, "rms={}", report.rms_error);

    let saved = store.load().expect("record saved");
    assert_eq!(saved, report.parameters);
    assert_eq!(saved.image_size, Some([480, 240]));
    assert_eq!(saved.views, Some(10));
    let cam = saved.camera_params();
    assert_relative_eq!(cam.fx, camera().fx, epsilon = 0.05);
    assert_relative_eq!(cam.cy, camera().cy, epsilon = 0.05);
    let d = saved.distortion_model().expect("distortion");
    assert_relative_eq!(d.k1, lens().k1, epsilon = 1e-3);
}

#[test]
fn failed_reads_and_empty_frames_are_skipped() {
    let frames = (0..12).flat_map(|_| {
        [
            Err(CaptureError::NoFrame),
            Ok(ColorFrame::new(480, 240)),
        ]
    });
    let mut source = ScriptedSource::new(frames);
    let mut boards: VecDeque<Option<BoardObservation>> = VecDeque::new();
    for k in 0..12 {
        boards.push_back(None);
        boards.push_back(Some(board(k, 0.0)));
    }
    let mut session = CalibrationSession::new(
        ScriptedFinder { boards },
        AcceptAll,
        CalibrationOptions {
            required_views: 5,
            ..CalibrationOptions::default()
        },
    );
    let mut store = MemoryCalibrationStore::new();

    let report = session
        .calibrate(&mut source, SQUARE, &mut store)
        .expect("calibration succeeds");
    // Every other read fails and every other good frame shows no board.
    assert_eq!(report.views, 5);
    assert!(report.frames_read >= 10);
    assert!(store.load().is_some());
}

#[test]
fn operator_abort_saves_nothing() {
    let review = Script(
        [
            ReviewDecision::Accept,
            ReviewDecision::Skip,
            ReviewDecision::Accept,
            ReviewDecision::Abort,
        ]
        .into(),
    );
    let mut session = CalibrationSession::new(finder(12, 0.0), review, CalibrationOptions::default());
    let mut store = MemoryCalibrationStore::new();

    let err = session
        .calibrate(&mut ScriptedSource::good(12), SQUARE, &mut store)
        .unwrap_err();
    assert!(matches!(err, CalibrationError::Aborted { accepted: 2 }));
    assert!(store.load().is_none());
}

#[test]
fn exhausted_source_reports_missing_views() {
    let mut session = CalibrationSession::new(finder(4, 0.0), AcceptAll, CalibrationOptions::default());
    let mut store = MemoryCalibrationStore::new();

    let err = session
        .calibrate(&mut ScriptedSource::good(4), SQUARE, &mut store)
        .unwrap_err();
    assert!(matches!(
        err,
        CalibrationError::NotEnoughViews { got: 4, need: 10 }
    ));
    assert!(store.load().is_none());
}

#[test]
fn frame_budget_bounds_the_session() {
    let options = CalibrationOptions {
        max_frames: 3,
        ..CalibrationOptions::default()
    };
    let mut session = CalibrationSession::new(finder(12, 0.0), AcceptAll, options);
    let mut store = MemoryCalibrationStore::new();

    let err = session
        .calibrate(&mut ScriptedSource::good(12), SQUARE, &mut store)
        .unwrap_err();
    assert!(matches!(
        err,
        CalibrationError::NotEnoughViews { got: 3, need: 10 }
    ));
}

#[test]
fn noisy_views_fail_the_quality_gate() {
    let options = CalibrationOptions {
        max_rms: 0.01,
        ..CalibrationOptions::default()
    };
    let mut session = CalibrationSession::new(finder(12, 1.5), AcceptAll, options);
    let mut store = MemoryCalibrationStore::new();

    let err = session
        .calibrate(&mut ScriptedSource::good(12), SQUARE, &mut store)
        .unwrap_err();
    match err {
        CalibrationError::ReprojectionTooHigh { rms, max } => {
            assert!(rms > max);
            assert_eq!(max, 0.01);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.load().is_none());
}

#[test]
fn non_positive_square_size_is_rejected() {
    let mut session = CalibrationSession::new(finder(12, 0.0), AcceptAll, CalibrationOptions::default());
    let mut store = MemoryCalibrationStore::new();
    let err = session
        .calibrate(&mut ScriptedSource::good(12), 0.0, &mut store)
        .unwrap_err();
    assert!(matches!(err, CalibrationError::InvalidBoard(_)));
}
