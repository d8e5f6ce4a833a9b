//! Frame containers and typed frame collections.
//!
//! A [`Frame`] is an immutable 2-D array of digital counts plus metadata;
//! statistics are computed on first access and cached. A [`FrameSet`] groups
//! frames of one role and answers the exposure/filter queries the calibrator
//! needs. An [`ImagingSession`] owns the four frame sets of one observing
//! session.

use ndarray::Array2;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::algo::stats;

/// Role of a captured frame in the reduction pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    /// Science exposure of the sky.
    Light,
    /// Shutter-closed exposure capturing thermal charge.
    Dark,
    /// Evenly-illuminated exposure capturing pixel response variations.
    Flat,
    /// Zero-length readout capturing the electronic baseline.
    Bias,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::Light => "LIGHT",
            FrameType::Dark => "DARK",
            FrameType::Flat => "FLAT",
            FrameType::Bias => "BIAS",
        };
        write!(f, "{name}")
    }
}

/// FITS-like acquisition metadata attached to every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Frame role.
    pub frame_type: FrameType,
    /// Exposure duration in seconds (zero for bias frames).
    pub exposure_s: f64,
    /// Sensor temperature at capture (°C).
    pub temperature_c: f64,
    /// Filter identifier ("L" for luminance by default).
    pub filter: String,
    /// Target identifier (empty for calibration frames).
    pub target: String,
    /// Capture timestamp as a simulation Julian date.
    pub captured_jd: f64,
    /// Binning factor.
    pub binning: u32,
    /// Name of the capturing camera.
    pub camera: String,
    /// ADC bit depth of the capturing camera.
    pub bit_depth: u8,
    /// Reduction steps applied to this frame, in order.
    pub calibration_history: Vec<String>,
}

impl FrameMetadata {
    /// Create metadata with sensible defaults for the remaining fields.
    pub fn new(frame_type: FrameType, exposure_s: f64) -> Self {
        Self {
            frame_type,
            exposure_s,
            temperature_c: 25.0,
            filter: "L".to_string(),
            target: String::new(),
            captured_jd: 0.0,
            binning: 1,
            camera: String::new(),
            bit_depth: 16,
            calibration_history: Vec::new(),
        }
    }

    /// Maximum representable digital count for this frame's bit depth.
    pub fn max_adu(&self) -> f64 {
        ((1u32 << self.bit_depth) - 1) as f64
    }

    /// True once any reduction step has been applied.
    pub fn is_calibrated(&self) -> bool {
        !self.calibration_history.is_empty()
    }
}

/// Basic per-frame statistics, computed once and cached.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameStats {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

/// An immutable captured or reduced image.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Array2<f64>,
    meta: FrameMetadata,
    stats: OnceCell<FrameStats>,
}

impl Frame {
    /// Wrap pixel data and metadata into a frame.
    pub fn new(data: Array2<f64>, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta,
            stats: OnceCell::new(),
        }
    }

    /// Pixel data in digital counts, indexed `[row, col]`.
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Acquisition metadata.
    pub fn meta(&self) -> &FrameMetadata {
        &self.meta
    }

    /// Image width in pixels.
    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    /// Image height in pixels.
    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    /// Image shape as (height, width).
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Frame statistics, computed on first access.
    pub fn stats(&self) -> &FrameStats {
        self.stats.get_or_init(|| {
            let values: Vec<f64> = self.data.iter().copied().collect();
            FrameStats {
                mean: stats::mean(&values),
                median: stats::median(&values).unwrap_or(f64::NAN),
                std_dev: stats::std_dev(&values),
                min: values.iter().copied().fold(f64::INFINITY, f64::min),
                max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            }
        })
    }

    /// Derive a new frame carrying this frame's metadata plus one more
    /// reduction step in its history. Statistics are recomputed lazily.
    pub fn with_data_and_step(&self, data: Array2<f64>, step: impl Into<String>) -> Frame {
        let mut meta = self.meta.clone();
        meta.calibration_history.push(step.into());
        Frame::new(data, meta)
    }

    /// Quantize to unsigned 16-bit counts, clipped to the frame's bit depth.
    /// This is the representation the persistence collaborator consumes.
    pub fn to_u16(&self) -> Array2<u16> {
        let max = self.meta.max_adu();
        self.data.mapv(|v| v.clamp(0.0, max).round() as u16)
    }
}

/// Errors from typed frame collections.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameSetError {
    /// A frame of the wrong role was offered to the set.
    #[error("frame type mismatch: set holds {expected} frames, got {actual}")]
    TypeMismatch {
        expected: FrameType,
        actual: FrameType,
    },
}

/// A collection of frames that all share one role.
#[derive(Debug, Clone)]
pub struct FrameSet {
    frame_type: FrameType,
    frames: Vec<Frame>,
}

impl FrameSet {
    /// Create an empty set for the given role.
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            frames: Vec::new(),
        }
    }

    /// Role this set holds.
    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// Add a frame, rejecting role mismatches.
    pub fn add(&mut self, frame: Frame) -> Result<(), FrameSetError> {
        if frame.meta().frame_type != self.frame_type {
            return Err(FrameSetError::TypeMismatch {
                expected: self.frame_type,
                actual: frame.meta().frame_type,
            });
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// All frames in insertion order.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Frame> {
        self.frames.iter()
    }

    /// Frames whose exposure lies in `[min_s, max_s]`.
    pub fn with_exposure_between(&self, min_s: f64, max_s: f64) -> Vec<&Frame> {
        self.frames
            .iter()
            .filter(|f| f.meta().exposure_s >= min_s && f.meta().exposure_s <= max_s)
            .collect()
    }

    /// Frames captured through the named filter.
    pub fn with_filter(&self, filter: &str) -> Vec<&Frame> {
        self.frames
            .iter()
            .filter(|f| f.meta().filter == filter)
            .collect()
    }

    /// Group frames by exposure, bucketed on whole milliseconds.
    pub fn exposure_groups(&self) -> HashMap<u64, Vec<&Frame>> {
        let mut groups: HashMap<u64, Vec<&Frame>> = HashMap::new();
        for frame in &self.frames {
            let key = (frame.meta().exposure_s * 1000.0).round() as u64;
            groups.entry(key).or_default().push(frame);
        }
        groups
    }

    /// Total integration time across the set, in seconds.
    pub fn total_integration_s(&self) -> f64 {
        self.frames.iter().map(|f| f.meta().exposure_s).sum()
    }
}

/// Summary counts for one imaging session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub name: String,
    pub n_lights: usize,
    pub n_darks: usize,
    pub n_flats: usize,
    pub n_biases: usize,
    pub light_integration_s: f64,
}

/// All frames captured during one observing session, grouped by role.
#[derive(Debug, Clone)]
pub struct ImagingSession {
    name: String,
    pub lights: FrameSet,
    pub darks: FrameSet,
    pub flats: FrameSet,
    pub biases: FrameSet,
}

impl ImagingSession {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lights: FrameSet::new(FrameType::Light),
            darks: FrameSet::new(FrameType::Dark),
            flats: FrameSet::new(FrameType::Flat),
            biases: FrameSet::new(FrameType::Bias),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Route a frame to the set matching its role.
    pub fn add_frame(&mut self, frame: Frame) -> Result<(), FrameSetError> {
        match frame.meta().frame_type {
            FrameType::Light => self.lights.add(frame),
            FrameType::Dark => self.darks.add(frame),
            FrameType::Flat => self.flats.add(frame),
            FrameType::Bias => self.biases.add(frame),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            name: self.name.clone(),
            n_lights: self.lights.len(),
            n_darks: self.darks.len(),
            n_flats: self.flats.len(),
            n_biases: self.biases.len(),
            light_integration_s: self.lights.total_integration_s(),
        }
    }
}
