//! Camera exposure simulation.
//!
//! Converts an incoming photon-flux field plus exposure parameters into a
//! digital [`Frame`], applying quantum efficiency, shot noise, dark current,
//! read noise, persistent sensor defects, full-well saturation and ADC
//! quantization in order.
//!
//! Captures are bit-reproducible: the same (session seed, frame seed,
//! photon flux, exposure, temperature) always yields an identical frame,
//! and different frame seeds draw from independent noise streams.

use log::debug;
use ndarray::Array2;
use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::frame::{Frame, FrameMetadata, FrameType};
use crate::hardware::defects::DefectMap;
use crate::hardware::sensor::CameraSpec;
use crate::noise;
use crate::noise::seed::{category, hash_seeds};

/// Ambient sensor temperature when cooling is off (°C).
const AMBIENT_TEMP_C: f64 = 25.0;

/// Arcseconds per radian, used for pixel scale computation.
const ARCSEC_PER_RAD: f64 = 206_265.0;

/// Validation errors raised at the capture boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    /// Photon-flux field does not match the sensor resolution.
    #[error("flux field shape {actual:?} does not match sensor shape {expected:?} (height, width)")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// Exposure duration invalid for the requested frame type. Bias frames
    /// are zero-length readouts; every other type needs a positive exposure.
    #[error("exposure {exposure_s} s is invalid for a {frame_type} frame")]
    InvalidExposure {
        frame_type: FrameType,
        exposure_s: f64,
    },

    /// Photon flux must be finite and non-negative everywhere.
    #[error("flux value {value} at pixel ({x}, {y}) is negative or not finite")]
    InvalidFlux { x: usize, y: usize, value: f64 },
}

/// One simulated camera for one observing session.
///
/// Holds the immutable [`CameraSpec`], the current thermal state and a
/// lazily-built persistent defect map. The defect map is generated once from
/// the session seed and never changes for the lifetime of the instance,
/// modeling the fixed defects of a physical sensor.
#[derive(Debug)]
pub struct Camera {
    spec: CameraSpec,
    session_seed: u64,
    temperature_c: f64,
    cooling_enabled: bool,
    defect_map: OnceCell<DefectMap>,
}

impl Camera {
    /// Create a camera at ambient temperature.
    pub fn new(spec: CameraSpec, session_seed: u64) -> Self {
        Self {
            spec,
            session_seed,
            temperature_c: AMBIENT_TEMP_C,
            cooling_enabled: false,
            defect_map: OnceCell::new(),
        }
    }

    pub fn spec(&self) -> &CameraSpec {
        &self.spec
    }

    /// Current sensor temperature (°C).
    pub fn temperature_c(&self) -> f64 {
        self.temperature_c
    }

    pub fn is_cooling(&self) -> bool {
        self.cooling_enabled
    }

    /// Enable or disable sensor cooling.
    ///
    /// Returns false when the sensor has no cooler. The target temperature
    /// is clamped at the sensor's minimum; disabling returns the sensor to
    /// ambient. Temperature settles instantly in this model.
    pub fn set_cooling(&mut self, enabled: bool, target_temp_c: Option<f64>) -> bool {
        if enabled && !self.spec.has_cooling {
            return false;
        }
        self.cooling_enabled = enabled;
        if enabled {
            let target = target_temp_c.unwrap_or(self.spec.min_temp_c);
            self.temperature_c = target.max(self.spec.min_temp_c);
        } else {
            self.temperature_c = AMBIENT_TEMP_C;
        }
        true
    }

    /// The sensor's persistent defect map, generated on first use.
    pub fn defect_map(&self) -> &DefectMap {
        self.defect_map.get_or_init(|| {
            let map = DefectMap::generate(
                self.spec.name.clone(),
                self.session_seed,
                self.spec.resolution,
                self.spec.hot_pixel_rate,
                self.spec.cold_pixel_rate,
                self.spec.full_well_capacity_e,
            );
            debug!(
                "generated defect map for '{}': {} defective pixels",
                self.spec.name,
                map.len()
            );
            map
        })
    }

    /// Simulate one exposure end-to-end.
    ///
    /// `flux_photons` is the per-pixel photon count arriving during the
    /// exposure, shaped (height, width) to match the sensor. The sky term is
    /// skipped for dark and bias frames. `frame_seed` selects the noise
    /// realization; `metadata`, when given, supplies target/filter/timestamp
    /// fields and is re-stamped with the capture parameters.
    pub fn capture_frame(
        &self,
        flux_photons: &Array2<f64>,
        exposure_s: f64,
        frame_type: FrameType,
        frame_seed: u64,
        metadata: Option<FrameMetadata>,
    ) -> Result<Frame, CaptureError> {
        let (width, height) = self.spec.resolution;
        let sensor_shape = (height, width);
        if flux_photons.dim() != sensor_shape {
            return Err(CaptureError::ShapeMismatch {
                expected: sensor_shape,
                actual: flux_photons.dim(),
            });
        }
        let exposure_valid = match frame_type {
            FrameType::Bias => exposure_s == 0.0,
            _ => exposure_s > 0.0 && exposure_s.is_finite(),
        };
        if !exposure_valid {
            return Err(CaptureError::InvalidExposure {
                frame_type,
                exposure_s,
            });
        }
        if let Some(((y, x), &value)) = flux_photons
            .indexed_iter()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(CaptureError::InvalidFlux { x, y, value });
        }

        // Stage 1: photons to electrons through quantum efficiency.
        // Dark and bias frames see no sky.
        let mut electrons = match frame_type {
            FrameType::Dark | FrameType::Bias => Array2::zeros(sensor_shape),
            _ => flux_photons * self.spec.quantum_efficiency,
        };

        // Stage 2: shot noise on the signal term.
        electrons = noise::shot_noise(
            &electrons,
            hash_seeds(&[self.session_seed, category::SHOT, frame_seed]),
        );

        // Stage 3: dark current with its own shot noise.
        let dark = noise::dark_current(
            self.spec.dark_current_e_per_s,
            exposure_s,
            self.temperature_c,
            hash_seeds(&[self.session_seed, category::DARK, frame_seed]),
            sensor_shape,
        );
        electrons += &dark;

        // Stage 4: read noise, independent of signal and exposure.
        let read = noise::read_noise(
            hash_seeds(&[self.session_seed, category::READ, frame_seed]),
            self.spec.read_noise_e,
            sensor_shape,
        );
        electrons += &read;

        // Stage 5: persistent sensor defects at their fixed coordinates.
        self.defect_map().apply(&mut electrons);

        // Stage 6: full-well saturation, floored at zero charge.
        let full_well = self.spec.full_well_capacity_e;
        electrons.mapv_inplace(|e| e.clamp(0.0, full_well));

        // Stage 7: quantize to digital counts.
        let gain = self.spec.gain_e_per_adu();
        let max_adu = self.spec.max_adu() as f64;
        let counts = electrons.mapv(|e| (e / gain).round().clamp(0.0, max_adu));

        let mut meta =
            metadata.unwrap_or_else(|| FrameMetadata::new(frame_type, exposure_s));
        meta.frame_type = frame_type;
        meta.exposure_s = exposure_s;
        meta.temperature_c = self.temperature_c;
        meta.camera = self.spec.name.clone();
        meta.bit_depth = self.spec.bit_depth;

        debug!(
            "captured {} frame: {}x{}, {:.1}s at {:.1}°C, seed {}",
            frame_type, width, height, exposure_s, self.temperature_c, frame_seed
        );

        Ok(Frame::new(counts, meta))
    }

    /// Capture a dark frame (shutter closed, thermal signal only).
    pub fn capture_dark_frame(&self, exposure_s: f64, frame_seed: u64) -> Result<Frame, CaptureError> {
        let (width, height) = self.spec.resolution;
        let zero_flux = Array2::zeros((height, width));
        self.capture_frame(&zero_flux, exposure_s, FrameType::Dark, frame_seed, None)
    }

    /// Capture a bias frame (zero-length readout, electronics only).
    pub fn capture_bias_frame(&self, frame_seed: u64) -> Result<Frame, CaptureError> {
        let (width, height) = self.spec.resolution;
        let zero_flux = Array2::zeros((height, width));
        self.capture_frame(&zero_flux, 0.0, FrameType::Bias, frame_seed, None)
    }

    /// Pixel scale in arcseconds per pixel for a given focal length.
    pub fn pixel_scale_arcsec(&self, focal_length_mm: f64) -> f64 {
        self.spec.pixel_size_um / 1000.0 / focal_length_mm * ARCSEC_PER_RAD
    }

    /// Field of view in degrees as (width, height) for a given focal length.
    pub fn fov_degrees(&self, focal_length_mm: f64) -> (f64, f64) {
        let (w_mm, h_mm) = self.spec.dimensions_mm();
        let fov_w = 2.0 * (w_mm / (2.0 * focal_length_mm)).atan();
        let fov_h = 2.0 * (h_mm / (2.0 * focal_length_mm)).atan();
        (fov_w.to_degrees(), fov_h.to_degrees())
    }
}
