//! Image calibration: master frame creation, the calibration equation, and
//! the master-frame library.
//!
//! Implements the standard reduction pipeline:
//! `calibrated = (light − dark [− bias]) / flat`, with masters built as
//! pixelwise medians so a single outlying input frame cannot skew them.
//! Master frames live in an explicit [`CalibrationLibrary`] keyed by
//! (role, exposure, temperature, filter) buckets; lookup selects the closest
//! stored master within a configurable [`MatchPolicy`] and fails loudly,
//! naming the missing bucket, rather than silently substituting a
//! mismatched master.

use log::{debug, info};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::algo::stats;
use crate::frame::{Frame, FrameType};

/// Flat-field values below this are treated as unity before division to
/// avoid numerical blow-up at dead pixels and hard vignetting edges.
pub const FLAT_EPSILON: f64 = 1e-3;

/// Clamp range applied to the normalized master flat.
const FLAT_CLAMP: (f64, f64) = (0.1, 10.0);

/// Exposures closer than this are considered identical (no dark scaling).
const EXPOSURE_MATCH_S: f64 = 0.01;

/// Errors from master creation and light calibration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    /// Master creation needs at least one input frame.
    #[error("creating a master {role} requires at least one input frame")]
    EmptyInput { role: FrameType },

    /// Input frames or masters have incompatible shapes.
    #[error("frame shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// No stored master falls within the match tolerance for the requested
    /// bucket. Reports exactly what was asked for so the caller can capture
    /// the missing calibration data.
    #[error(
        "no master {role} within tolerance for exposure {exposure_s:.2}s, \
         {temperature_c:.1}°C, filter '{filter}'"
    )]
    NoMatchingMaster {
        role: FrameType,
        exposure_s: f64,
        temperature_c: f64,
        filter: String,
    },
}

/// The calibration bucket a master frame represents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasterKey {
    /// Role of the combined frames.
    pub role: FrameType,
    /// Exposure bucket in whole milliseconds.
    pub exposure_ms: u64,
    /// Temperature bucket in whole degrees Celsius.
    pub temp_bucket_c: i32,
    /// Filter identifier.
    pub filter: String,
}

impl MasterKey {
    /// Quantize a frame's metadata into its bucket.
    pub fn from_frame(frame: &Frame) -> Self {
        let meta = frame.meta();
        Self {
            role: meta.frame_type,
            exposure_ms: (meta.exposure_s * 1000.0).round() as u64,
            temp_bucket_c: meta.temperature_c.round() as i32,
            filter: meta.filter.clone(),
        }
    }

    /// Exposure represented by this bucket, in seconds.
    pub fn exposure_s(&self) -> f64 {
        self.exposure_ms as f64 / 1000.0
    }
}

/// A combined calibration product (master bias, dark or flat).
#[derive(Debug, Clone)]
pub struct MasterFrame {
    frame: Frame,
    key: MasterKey,
    n_combined: usize,
    bias_subtracted: bool,
}

impl MasterFrame {
    /// Pixel data of the combined frame.
    pub fn data(&self) -> &Array2<f64> {
        self.frame.data()
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Bucket this master represents.
    pub fn key(&self) -> &MasterKey {
        &self.key
    }

    /// Number of source frames combined into this master.
    pub fn n_combined(&self) -> usize {
        self.n_combined
    }

    /// Whether the bias baseline was removed during master creation.
    pub fn bias_subtracted(&self) -> bool {
        self.bias_subtracted
    }
}

/// Tolerance windows for selecting the best-matching master.
///
/// The windows are policy, not physics: widen them to accept more reuse of
/// stored masters, narrow them to force bucket-exact calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    /// Maximum acceptable ratio between light and dark exposures
    /// (longer / shorter).
    pub max_exposure_ratio: f64,
    /// Maximum acceptable sensor temperature difference (°C).
    pub max_temperature_delta_c: f64,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            max_exposure_ratio: 1.25,
            max_temperature_delta_c: 2.0,
        }
    }
}

/// Explicit key→master store owned by the calibration session.
///
/// Not ambient global state: the library is created by the caller and passed
/// into calibration calls. Lookup is a pure scan over stored entries plus
/// the tolerance policy.
#[derive(Debug, Clone, Default)]
pub struct CalibrationLibrary {
    masters: HashMap<MasterKey, MasterFrame>,
}

impl CalibrationLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a master, replacing any previous master in the same bucket.
    pub fn insert(&mut self, master: MasterFrame) {
        debug!(
            "library insert: {} bucket {:?} ({} frames combined)",
            master.key().role,
            master.key(),
            master.n_combined()
        );
        self.masters.insert(master.key.clone(), master);
    }

    pub fn len(&self) -> usize {
        self.masters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masters.is_empty()
    }

    /// Drop every master of one role (e.g. after a temperature setpoint
    /// change invalidates the darks).
    pub fn invalidate_role(&mut self, role: FrameType) {
        self.masters.retain(|key, _| key.role != role);
    }

    pub fn clear(&mut self) {
        self.masters.clear();
    }

    fn masters_of(&self, role: FrameType) -> impl Iterator<Item = &MasterFrame> {
        self.masters.values().filter(move |m| m.key.role == role)
    }

    /// Best stored master bias: the most deeply combined one.
    pub fn find_bias(&self) -> Option<&MasterFrame> {
        self.masters_of(FrameType::Bias)
            .max_by_key(|m| (m.n_combined, m.key.exposure_ms))
    }

    /// Closest master dark within the policy windows.
    ///
    /// Candidates must fall inside both the exposure-ratio and temperature
    /// windows; among them the one closest in temperature, then in exposure
    /// ratio, wins.
    pub fn find_dark(
        &self,
        exposure_s: f64,
        temperature_c: f64,
        policy: &MatchPolicy,
    ) -> Result<&MasterFrame, CalibrationError> {
        let mut best: Option<(&MasterFrame, (f64, f64))> = None;
        for master in self.masters_of(FrameType::Dark) {
            let master_exp = master.key.exposure_s();
            if master_exp <= 0.0 || exposure_s <= 0.0 {
                continue;
            }
            let ratio = (exposure_s / master_exp).max(master_exp / exposure_s);
            let temp_delta = (master.key.temp_bucket_c as f64 - temperature_c).abs();
            if ratio > policy.max_exposure_ratio || temp_delta > policy.max_temperature_delta_c {
                continue;
            }
            let badness = (temp_delta, ratio);
            let better = match &best {
                None => true,
                Some((_, current)) => badness < *current,
            };
            if better {
                best = Some((master, badness));
            }
        }
        best.map(|(m, _)| m).ok_or(CalibrationError::NoMatchingMaster {
            role: FrameType::Dark,
            exposure_s,
            temperature_c,
            filter: String::new(),
        })
    }

    /// Master flat for the given filter; among several, the most deeply
    /// combined one wins.
    pub fn find_flat(&self, filter: &str) -> Result<&MasterFrame, CalibrationError> {
        self.masters_of(FrameType::Flat)
            .filter(|m| m.key.filter == filter)
            .max_by_key(|m| (m.n_combined, m.key.exposure_ms))
            .ok_or(CalibrationError::NoMatchingMaster {
                role: FrameType::Flat,
                exposure_s: 0.0,
                temperature_c: 0.0,
                filter: filter.to_string(),
            })
    }
}

/// Pixelwise median across a set of equally-shaped arrays.
fn median_combine(arrays: &[Array2<f64>]) -> Array2<f64> {
    let shape = arrays[0].dim();
    let mut out = Array2::zeros(shape);
    let mut buf = Vec::with_capacity(arrays.len());
    for ((y, x), value) in out.indexed_iter_mut() {
        buf.clear();
        buf.extend(arrays.iter().map(|a| a[[y, x]]));
        buf.sort_by(|a, b| a.partial_cmp(b).expect("counts are finite"));
        let mid = buf.len() / 2;
        *value = if buf.len() % 2 == 0 {
            (buf[mid - 1] + buf[mid]) / 2.0
        } else {
            buf[mid]
        };
    }
    out
}

/// Verify that every frame matches the first frame's shape.
fn check_shapes(frames: &[&Frame]) -> Result<(usize, usize), CalibrationError> {
    let expected = frames[0].shape();
    for frame in frames.iter().skip(1) {
        if frame.shape() != expected {
            return Err(CalibrationError::ShapeMismatch {
                expected,
                actual: frame.shape(),
            });
        }
    }
    Ok(expected)
}

/// Image calibration engine.
#[derive(Debug, Clone, Default)]
pub struct Calibrator {
    policy: MatchPolicy,
}

impl Calibrator {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Combine bias frames into a master bias by pixelwise median.
    pub fn create_master_bias(
        &self,
        bias_frames: &[Frame],
    ) -> Result<MasterFrame, CalibrationError> {
        if bias_frames.is_empty() {
            return Err(CalibrationError::EmptyInput {
                role: FrameType::Bias,
            });
        }
        let refs: Vec<&Frame> = bias_frames.iter().collect();
        check_shapes(&refs)?;

        let arrays: Vec<Array2<f64>> = bias_frames.iter().map(|f| f.data().clone()).collect();
        let combined = median_combine(&arrays);
        let frame = bias_frames[0].with_data_and_step(
            combined,
            format!("master bias from {} frames (median)", bias_frames.len()),
        );
        info!("created master bias from {} frames", bias_frames.len());
        Ok(MasterFrame {
            key: MasterKey::from_frame(&frame),
            frame,
            n_combined: bias_frames.len(),
            bias_subtracted: false,
        })
    }

    /// Combine dark frames into a master dark.
    ///
    /// With a master bias supplied, each dark is bias-subtracted first so
    /// the master represents pure dark-current charge.
    pub fn create_master_dark(
        &self,
        dark_frames: &[Frame],
        master_bias: Option<&MasterFrame>,
    ) -> Result<MasterFrame, CalibrationError> {
        if dark_frames.is_empty() {
            return Err(CalibrationError::EmptyInput {
                role: FrameType::Dark,
            });
        }
        let refs: Vec<&Frame> = dark_frames.iter().collect();
        let shape = check_shapes(&refs)?;
        if let Some(bias) = master_bias {
            if bias.data().dim() != shape {
                return Err(CalibrationError::ShapeMismatch {
                    expected: shape,
                    actual: bias.data().dim(),
                });
            }
        }

        let arrays: Vec<Array2<f64>> = dark_frames
            .iter()
            .map(|f| match master_bias {
                Some(bias) => f.data() - bias.data(),
                None => f.data().clone(),
            })
            .collect();
        let combined = median_combine(&arrays);
        let step = match master_bias {
            Some(_) => format!(
                "master dark from {} frames, bias-subtracted (median)",
                dark_frames.len()
            ),
            None => format!("master dark from {} frames (median)", dark_frames.len()),
        };
        let frame = dark_frames[0].with_data_and_step(combined, step);
        info!("created master dark from {} frames", dark_frames.len());
        Ok(MasterFrame {
            key: MasterKey::from_frame(&frame),
            frame,
            n_combined: dark_frames.len(),
            bias_subtracted: master_bias.is_some(),
        })
    }

    /// Combine flat frames into a normalized master flat.
    ///
    /// Optionally dark-subtracts each input (scaled linearly when the dark
    /// exposure differs), median-combines, then divides by the result's own
    /// mean so the master is a relative sensitivity map with mean 1.0.
    pub fn create_master_flat(
        &self,
        flat_frames: &[Frame],
        master_dark: Option<&MasterFrame>,
    ) -> Result<MasterFrame, CalibrationError> {
        if flat_frames.is_empty() {
            return Err(CalibrationError::EmptyInput {
                role: FrameType::Flat,
            });
        }
        let refs: Vec<&Frame> = flat_frames.iter().collect();
        let shape = check_shapes(&refs)?;
        if let Some(dark) = master_dark {
            if dark.data().dim() != shape {
                return Err(CalibrationError::ShapeMismatch {
                    expected: shape,
                    actual: dark.data().dim(),
                });
            }
        }

        let arrays: Vec<Array2<f64>> = flat_frames
            .iter()
            .map(|f| match master_dark {
                Some(dark) => {
                    let scale = dark_scale(f.meta().exposure_s, dark.key.exposure_s());
                    f.data() - &(dark.data() * scale)
                }
                None => f.data().clone(),
            })
            .collect();
        let mut combined = median_combine(&arrays);

        // Normalize to mean 1.0, preserving relative pixel response
        let mean = combined.mean().unwrap_or(0.0);
        if mean > 0.0 {
            combined /= mean;
        }
        combined.mapv_inplace(|v| v.clamp(FLAT_CLAMP.0, FLAT_CLAMP.1));

        let frame = flat_frames[0].with_data_and_step(
            combined,
            format!(
                "master flat from {} frames, normalized (median)",
                flat_frames.len()
            ),
        );
        info!("created master flat from {} frames", flat_frames.len());
        Ok(MasterFrame {
            key: MasterKey::from_frame(&frame),
            frame,
            n_combined: flat_frames.len(),
            bias_subtracted: false,
        })
    }

    /// Apply the calibration equation to one light frame.
    ///
    /// `calibrated = (light − dark·scale [− bias]) / flat`, where the bias
    /// is subtracted separately only when the dark was already
    /// bias-subtracted (otherwise the dark still contains the baseline).
    /// The dark scales linearly with the exposure ratio when exposures
    /// differ. Flat values below [`FLAT_EPSILON`] are treated as 1.0, and
    /// the result is clipped back to the light frame's digital range.
    pub fn calibrate_light(
        &self,
        light: &Frame,
        master_dark: Option<&MasterFrame>,
        master_flat: Option<&MasterFrame>,
        master_bias: Option<&MasterFrame>,
    ) -> Result<Frame, CalibrationError> {
        let shape = light.shape();
        for master in [master_dark, master_flat, master_bias].into_iter().flatten() {
            if master.data().dim() != shape {
                return Err(CalibrationError::ShapeMismatch {
                    expected: shape,
                    actual: master.data().dim(),
                });
            }
        }

        let mut data = light.data().clone();
        let mut steps: Vec<String> = Vec::new();

        let dark_has_baseline = master_dark.map(|d| !d.bias_subtracted()).unwrap_or(false);
        if let Some(bias) = master_bias {
            if !dark_has_baseline {
                data -= bias.data();
                steps.push("bias subtraction".to_string());
            }
        }

        if let Some(dark) = master_dark {
            let scale = dark_scale(light.meta().exposure_s, dark.key.exposure_s());
            if (scale - 1.0).abs() < 1e-9 {
                data -= dark.data();
                steps.push("dark subtraction".to_string());
            } else {
                data -= &(dark.data() * scale);
                steps.push(format!("dark subtraction (scaled {scale:.2}x)"));
            }
        }

        if let Some(flat) = master_flat {
            ndarray::Zip::from(&mut data).and(flat.data()).for_each(|v, &f| {
                let divisor = if f < FLAT_EPSILON { 1.0 } else { f };
                *v /= divisor;
            });
            steps.push("flat division".to_string());
        }

        let max_adu = light.meta().max_adu();
        data.mapv_inplace(|v| v.clamp(0.0, max_adu));

        let description = if steps.is_empty() {
            "no calibration".to_string()
        } else {
            steps.join(" + ")
        };
        debug!("calibrated light frame: {description}");
        Ok(light.with_data_and_step(data, description))
    }

    /// Calibrate a light frame against the masters stored in a library.
    ///
    /// Selects the closest dark (by exposure and temperature) and the flat
    /// for the light's filter; the bias is used when present. Missing
    /// masters surface as [`CalibrationError::NoMatchingMaster`] naming the
    /// bucket that was asked for.
    pub fn calibrate_with_library(
        &self,
        light: &Frame,
        library: &CalibrationLibrary,
    ) -> Result<Frame, CalibrationError> {
        let meta = light.meta();
        let dark = library.find_dark(meta.exposure_s, meta.temperature_c, &self.policy)?;
        let flat = library.find_flat(&meta.filter)?;
        let bias = library.find_bias();
        self.calibrate_light(light, Some(dark), Some(flat), bias)
    }

    /// Replace hot and cosmic-ray pixels with their local neighborhood
    /// median.
    ///
    /// A pixel is flagged when it deviates from its 3×3 neighborhood median
    /// by more than `k_sigma` robust standard deviations (estimated from
    /// the MAD of all such residuals).
    pub fn cosmetic_correction(&self, frame: &Frame, k_sigma: f64) -> Frame {
        let data = frame.data();
        let (height, width) = data.dim();

        let mut local_median = Array2::zeros((height, width));
        let mut neighborhood = Vec::with_capacity(9);
        for y in 0..height {
            for x in 0..width {
                neighborhood.clear();
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        if dy == 0 && dx == 0 {
                            continue;
                        }
                        let ny = (y as i64 + dy).clamp(0, height as i64 - 1) as usize;
                        let nx = (x as i64 + dx).clamp(0, width as i64 - 1) as usize;
                        neighborhood.push(data[[ny, nx]]);
                    }
                }
                local_median[[y, x]] =
                    stats::median(&neighborhood).unwrap_or(data[[y, x]]);
            }
        }

        let residuals: Vec<f64> = data
            .iter()
            .zip(local_median.iter())
            .map(|(v, m)| v - m)
            .collect();
        let sigma = stats::robust_sigma(&residuals).unwrap_or(0.0);
        if sigma <= 0.0 {
            // Perfectly uniform frame, nothing to correct
            return frame.with_data_and_step(data.clone(), "cosmetic correction (0 pixels)");
        }

        let threshold = k_sigma * sigma;
        let mut corrected = data.clone();
        let mut n_corrected = 0usize;
        ndarray::Zip::from(&mut corrected)
            .and(&local_median)
            .for_each(|v, &m| {
                if (*v - m).abs() > threshold {
                    *v = m;
                    n_corrected += 1;
                }
            });

        debug!("cosmetic correction replaced {n_corrected} pixels (k={k_sigma})");
        frame.with_data_and_step(
            corrected,
            format!("cosmetic correction ({n_corrected} pixels)"),
        )
    }
}

/// Linear dark scaling factor between a light and a dark exposure. Unity
/// when the exposures match within [`EXPOSURE_MATCH_S`].
fn dark_scale(light_exposure_s: f64, dark_exposure_s: f64) -> f64 {
    if dark_exposure_s <= 0.0 || (light_exposure_s - dark_exposure_s).abs() < EXPOSURE_MATCH_S {
        1.0
    } else {
        light_exposure_s / dark_exposure_s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameMetadata;
    use approx::assert_relative_eq;

    fn frame_with(frame_type: FrameType, exposure_s: f64, data: Array2<f64>) -> Frame {
        Frame::new(data, FrameMetadata::new(frame_type, exposure_s))
    }

    fn constant_frame(frame_type: FrameType, exposure_s: f64, value: f64) -> Frame {
        frame_with(frame_type, exposure_s, Array2::from_elem((4, 4), value))
    }

    #[test]
    fn test_master_bias_requires_frames() {
        let calibrator = Calibrator::default();
        let err = calibrator.create_master_bias(&[]).unwrap_err();
        assert_eq!(
            err,
            CalibrationError::EmptyInput {
                role: FrameType::Bias,
            }
        );
    }

    #[test]
    fn test_master_bias_is_pixelwise_median() {
        let calibrator = Calibrator::default();
        let frames: Vec<Frame> = [10.0, 12.0, 11.0]
            .iter()
            .map(|&v| constant_frame(FrameType::Bias, 0.0, v))
            .collect();
        let master = calibrator.create_master_bias(&frames).unwrap();
        assert_eq!(master.n_combined(), 3);
        assert!(master.data().iter().all(|&v| v == 11.0));
    }

    #[test]
    fn test_master_dark_median_rejects_outlier() {
        let calibrator = Calibrator::default();
        let mut frames: Vec<Frame> = (0..4)
            .map(|_| constant_frame(FrameType::Dark, 30.0, 100.0))
            .collect();
        // One frame carries a cosmic-ray hit at (1, 1)
        let mut spiked = Array2::from_elem((4, 4), 100.0);
        spiked[[1, 1]] = 10_000.0;
        frames.push(frame_with(FrameType::Dark, 30.0, spiked));

        let master = calibrator.create_master_dark(&frames, None).unwrap();
        assert_relative_eq!(master.data()[[1, 1]], 100.0);
    }

    #[test]
    fn test_master_dark_bias_subtraction() {
        let calibrator = Calibrator::default();
        let bias = calibrator
            .create_master_bias(&[constant_frame(FrameType::Bias, 0.0, 20.0)])
            .unwrap();
        let darks: Vec<Frame> = (0..3)
            .map(|_| constant_frame(FrameType::Dark, 30.0, 120.0))
            .collect();
        let master = calibrator.create_master_dark(&darks, Some(&bias)).unwrap();
        assert!(master.bias_subtracted());
        assert!(master.data().iter().all(|&v| v == 100.0));
    }

    #[test]
    fn test_master_flat_normalized_to_unit_mean() {
        let calibrator = Calibrator::default();
        let mut vignetted = Array2::from_elem((4, 4), 20_000.0);
        vignetted[[0, 0]] = 10_000.0;
        let flats = vec![
            frame_with(FrameType::Flat, 2.0, vignetted.clone()),
            frame_with(FrameType::Flat, 2.0, vignetted),
        ];
        let master = calibrator.create_master_flat(&flats, None).unwrap();
        assert_relative_eq!(master.data().mean().unwrap(), 1.0, epsilon = 1e-12);
        // Vignetted corner is below average sensitivity
        assert!(master.data()[[0, 0]] < 1.0);
    }

    #[test]
    fn test_shape_mismatch_detected() {
        let calibrator = Calibrator::default();
        let frames = vec![
            constant_frame(FrameType::Bias, 0.0, 10.0),
            frame_with(FrameType::Bias, 0.0, Array2::zeros((2, 2))),
        ];
        assert!(matches!(
            calibrator.create_master_bias(&frames),
            Err(CalibrationError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_calibration_round_trip_recovers_sky() {
        // Synthetic light = sky + dark pattern, times a flat pattern, with
        // no noise. Calibration must recover the sky exactly.
        let calibrator = Calibrator::default();
        let shape = (8, 8);
        let sky = Array2::from_shape_fn(shape, |(y, x)| 500.0 + (y * 8 + x) as f64);
        let dark_pattern = Array2::from_shape_fn(shape, |(y, _)| 50.0 + y as f64);
        let flat_pattern = Array2::from_shape_fn(shape, |(_, x)| 0.8 + 0.05 * x as f64);

        let light_data = (&sky + &dark_pattern) * &flat_pattern;
        let light = frame_with(FrameType::Light, 60.0, light_data);

        let dark_master = calibrator
            .create_master_dark(
                &[frame_with(FrameType::Dark, 60.0, &dark_pattern * &flat_pattern)],
                None,
            )
            .unwrap();
        // Build the flat master from the pure pattern; normalization divides
        // by its own mean, so scale the sky expectation accordingly.
        let flat_master = calibrator
            .create_master_flat(
                &[frame_with(FrameType::Flat, 1.0, flat_pattern.clone())],
                None,
            )
            .unwrap();

        let calibrated = calibrator
            .calibrate_light(&light, Some(&dark_master), Some(&flat_master), None)
            .unwrap();

        let flat_mean = flat_pattern.mean().unwrap();
        for ((y, x), &value) in calibrated.data().indexed_iter() {
            let expected = sky[[y, x]] * flat_mean;
            assert_relative_eq!(value, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_flat_epsilon_guard() {
        let calibrator = Calibrator::default();
        let light = constant_frame(FrameType::Light, 1.0, 1000.0);
        // A flat with a dead region far below epsilon
        let mut flat_data = Array2::from_elem((4, 4), 1.0);
        flat_data[[2, 2]] = 1e-9;
        let flat = MasterFrame {
            key: MasterKey {
                role: FrameType::Flat,
                exposure_ms: 1000,
                temp_bucket_c: 25,
                filter: "L".to_string(),
            },
            frame: frame_with(FrameType::Flat, 1.0, flat_data),
            n_combined: 1,
            bias_subtracted: false,
        };
        let calibrated = calibrator
            .calibrate_light(&light, None, Some(&flat), None)
            .unwrap();
        // Dead flat pixel treated as unity, no numerical blow-up
        assert_relative_eq!(calibrated.data()[[2, 2]], 1000.0);
    }

    #[test]
    fn test_dark_exposure_scaling() {
        let calibrator = Calibrator::default();
        let light = constant_frame(FrameType::Light, 60.0, 1000.0);
        let dark = calibrator
            .create_master_dark(&[constant_frame(FrameType::Dark, 30.0, 40.0)], None)
            .unwrap();
        let calibrated = calibrator
            .calibrate_light(&light, Some(&dark), None, None)
            .unwrap();
        // Dark scaled 2x for the doubled exposure
        assert!(calibrated.data().iter().all(|&v| v == 1000.0 - 80.0));
    }

    #[test]
    fn test_bias_not_double_subtracted() {
        let calibrator = Calibrator::default();
        let bias = calibrator
            .create_master_bias(&[constant_frame(FrameType::Bias, 0.0, 20.0)])
            .unwrap();
        // Dark master still containing the baseline
        let raw_dark = calibrator
            .create_master_dark(&[constant_frame(FrameType::Dark, 10.0, 70.0)], None)
            .unwrap();
        let light = constant_frame(FrameType::Light, 10.0, 1000.0);
        let calibrated = calibrator
            .calibrate_light(&light, Some(&raw_dark), None, Some(&bias))
            .unwrap();
        // Only the dark (which includes the baseline) is subtracted
        assert!(calibrated.data().iter().all(|&v| v == 930.0));

        // With a bias-subtracted dark, both come off
        let clean_dark = calibrator
            .create_master_dark(&[constant_frame(FrameType::Dark, 10.0, 70.0)], Some(&bias))
            .unwrap();
        let calibrated = calibrator
            .calibrate_light(&light, Some(&clean_dark), None, Some(&bias))
            .unwrap();
        assert!(calibrated.data().iter().all(|&v| v == 930.0));
    }

    #[test]
    fn test_library_finds_closest_dark() {
        let calibrator = Calibrator::default();
        let mut library = CalibrationLibrary::new();

        for (exposure, temp) in [(30.0, -10.0), (30.0, 0.0), (60.0, -10.0)] {
            let mut meta = FrameMetadata::new(FrameType::Dark, exposure);
            meta.temperature_c = temp;
            let dark = Frame::new(Array2::from_elem((2, 2), 100.0), meta);
            library.insert(calibrator.create_master_dark(&[dark], None).unwrap());
        }
        assert_eq!(library.len(), 3);

        let found = library
            .find_dark(32.0, -9.5, &MatchPolicy::default())
            .unwrap();
        assert_eq!(found.key().exposure_ms, 30_000);
        assert_eq!(found.key().temp_bucket_c, -10);
    }

    #[test]
    fn test_library_missing_bucket_is_named() {
        let library = CalibrationLibrary::new();
        let err = library
            .find_dark(30.0, -10.0, &MatchPolicy::default())
            .unwrap_err();
        match err {
            CalibrationError::NoMatchingMaster {
                role,
                exposure_s,
                temperature_c,
                ..
            } => {
                assert_eq!(role, FrameType::Dark);
                assert_relative_eq!(exposure_s, 30.0);
                assert_relative_eq!(temperature_c, -10.0);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = library.find_flat("Ha").unwrap_err();
        assert!(err.to_string().contains("Ha"));
    }

    #[test]
    fn test_library_rejects_out_of_tolerance_dark() {
        let calibrator = Calibrator::default();
        let mut library = CalibrationLibrary::new();
        let dark = constant_frame(FrameType::Dark, 10.0, 100.0);
        library.insert(calibrator.create_master_dark(&[dark], None).unwrap());

        // Exposure ratio 3x exceeds the default 1.25 window
        assert!(library
            .find_dark(30.0, 25.0, &MatchPolicy::default())
            .is_err());
        // Widening the policy accepts it
        let wide = MatchPolicy {
            max_exposure_ratio: 5.0,
            max_temperature_delta_c: 2.0,
        };
        assert!(library.find_dark(30.0, 25.0, &wide).is_ok());
    }

    #[test]
    fn test_library_invalidate_role() {
        let calibrator = Calibrator::default();
        let mut library = CalibrationLibrary::new();
        library.insert(
            calibrator
                .create_master_bias(&[constant_frame(FrameType::Bias, 0.0, 10.0)])
                .unwrap(),
        );
        library.insert(
            calibrator
                .create_master_dark(&[constant_frame(FrameType::Dark, 30.0, 100.0)], None)
                .unwrap(),
        );
        library.invalidate_role(FrameType::Dark);
        assert_eq!(library.len(), 1);
        assert!(library.find_bias().is_some());
    }

    #[test]
    fn test_calibrate_with_library() {
        let calibrator = Calibrator::default();
        let mut library = CalibrationLibrary::new();
        library.insert(
            calibrator
                .create_master_dark(&[constant_frame(FrameType::Dark, 30.0, 50.0)], None)
                .unwrap(),
        );
        library.insert(
            calibrator
                .create_master_flat(&[constant_frame(FrameType::Flat, 1.0, 20_000.0)], None)
                .unwrap(),
        );

        let light = constant_frame(FrameType::Light, 30.0, 1050.0);
        let calibrated = calibrator.calibrate_with_library(&light, &library).unwrap();
        assert!(calibrated.data().iter().all(|&v| v == 1000.0));

        // A light outside every dark bucket fails loudly
        let orphan = constant_frame(FrameType::Light, 300.0, 1050.0);
        assert!(matches!(
            calibrator.calibrate_with_library(&orphan, &library),
            Err(CalibrationError::NoMatchingMaster { .. })
        ));
    }

    #[test]
    fn test_cosmetic_correction_replaces_hot_pixel() {
        let calibrator = Calibrator::default();
        let mut data = Array2::from_shape_fn((8, 8), |(y, x)| 100.0 + ((y + x) % 3) as f64);
        data[[4, 4]] = 5000.0;
        let frame = frame_with(FrameType::Light, 1.0, data);

        let corrected = calibrator.cosmetic_correction(&frame, 5.0);
        assert!(corrected.data()[[4, 4]] < 110.0);
        // Normal pixels untouched
        assert_eq!(corrected.data()[[0, 0]], 100.0);
        assert!(corrected
            .meta()
            .calibration_history
            .iter()
            .any(|s| s.starts_with("cosmetic correction")));
    }

    #[test]
    fn test_cosmetic_correction_uniform_frame_unchanged() {
        let calibrator = Calibrator::default();
        let frame = constant_frame(FrameType::Light, 1.0, 42.0);
        let corrected = calibrator.cosmetic_correction(&frame, 3.0);
        assert_eq!(corrected.data(), frame.data());
    }
}
