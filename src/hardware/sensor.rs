//! Sensor configuration for simulating detector characteristics.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from sensor specification validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpecError {
    #[error("quantum efficiency {0} must be in (0, 1]")]
    InvalidQuantumEfficiency(f64),
    #[error("bit depth {0} must be 12, 14 or 16")]
    InvalidBitDepth(u8),
    #[error("read noise {0} e- must be positive")]
    InvalidReadNoise(f64),
    #[error("resolution {0}x{1} must be non-zero in both dimensions")]
    InvalidResolution(usize, usize),
    #[error("full well capacity {0} e- must be positive")]
    InvalidFullWell(f64),
}

/// Physical and electronic characteristics of an imaging sensor.
///
/// Immutable configuration: one `CameraSpec` describes a sensor model, a
/// [`Camera`](crate::Camera) instance adds per-session state on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSpec {
    /// Name/model of the sensor.
    pub name: String,
    /// Pixel pitch in microns.
    pub pixel_size_um: f64,
    /// Sensor resolution as (width, height) in pixels.
    pub resolution: (usize, usize),
    /// Fraction of incoming photons converted to electrons, in (0, 1].
    pub quantum_efficiency: f64,
    /// Read noise standard deviation in electrons.
    pub read_noise_e: f64,
    /// Dark current at the 25 °C reference temperature (e-/pixel/s).
    pub dark_current_e_per_s: f64,
    /// Maximum electrons a pixel holds before saturating.
    pub full_well_capacity_e: f64,
    /// ADC bit depth (12, 14 or 16).
    pub bit_depth: u8,
    /// Whether the sensor has regulated temperature control.
    pub has_cooling: bool,
    /// Minimum cooling temperature if cooled (°C).
    pub min_temp_c: f64,
    /// Fraction of pixels with excess dark signal.
    pub hot_pixel_rate: f64,
    /// Fraction of pixels with depressed response.
    pub cold_pixel_rate: f64,
}

impl CameraSpec {
    /// Create a validated sensor specification.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        pixel_size_um: f64,
        resolution: (usize, usize),
        quantum_efficiency: f64,
        read_noise_e: f64,
        dark_current_e_per_s: f64,
        full_well_capacity_e: f64,
        bit_depth: u8,
        has_cooling: bool,
    ) -> Result<Self, SpecError> {
        if !(quantum_efficiency > 0.0 && quantum_efficiency <= 1.0) {
            return Err(SpecError::InvalidQuantumEfficiency(quantum_efficiency));
        }
        if !matches!(bit_depth, 12 | 14 | 16) {
            return Err(SpecError::InvalidBitDepth(bit_depth));
        }
        if read_noise_e <= 0.0 {
            return Err(SpecError::InvalidReadNoise(read_noise_e));
        }
        if resolution.0 == 0 || resolution.1 == 0 {
            return Err(SpecError::InvalidResolution(resolution.0, resolution.1));
        }
        if full_well_capacity_e <= 0.0 {
            return Err(SpecError::InvalidFullWell(full_well_capacity_e));
        }

        Ok(Self {
            name: name.into(),
            pixel_size_um,
            resolution,
            quantum_efficiency,
            read_noise_e,
            dark_current_e_per_s,
            full_well_capacity_e,
            bit_depth,
            has_cooling,
            min_temp_c: if has_cooling { -10.0 } else { 25.0 },
            hot_pixel_rate: 0.0005,
            cold_pixel_rate: 0.0001,
        })
    }

    /// Maximum digital count representable at this bit depth.
    pub fn max_adu(&self) -> u32 {
        (1u32 << self.bit_depth) - 1
    }

    /// Electrons per digital count, sized so that full well maps onto the
    /// top of the ADC range.
    pub fn gain_e_per_adu(&self) -> f64 {
        self.full_well_capacity_e / self.max_adu() as f64
    }

    /// Sensor dimensions in millimeters.
    pub fn dimensions_mm(&self) -> (f64, f64) {
        (
            self.resolution.0 as f64 * self.pixel_size_um / 1000.0,
            self.resolution.1 as f64 * self.pixel_size_um / 1000.0,
        )
    }

    /// Sensor diagonal in millimeters.
    pub fn sensor_diagonal_mm(&self) -> f64 {
        let (w, h) = self.dimensions_mm();
        (w * w + h * h).sqrt()
    }

    /// Sensor area in square millimeters.
    pub fn sensor_area_mm2(&self) -> f64 {
        let (w, h) = self.dimensions_mm();
        w * h
    }

    /// Entry-level uncooled webcam sensor, useful as a worst-case noise model.
    pub fn modified_webcam() -> Self {
        Self {
            name: "Modified Webcam".to_string(),
            pixel_size_um: 5.6,
            resolution: (640, 480),
            quantum_efficiency: 0.40,
            read_noise_e: 12.0,
            dark_current_e_per_s: 0.5,
            full_well_capacity_e: 15_000.0,
            bit_depth: 12,
            has_cooling: false,
            min_temp_c: 25.0,
            hot_pixel_rate: 0.0005,
            cold_pixel_rate: 0.0001,
        }
    }

    /// Cooled 14-bit CMOS astro camera (IMX294 class).
    pub fn cooled_cmos_imx294() -> Self {
        Self {
            name: "Cooled CMOS IMX294".to_string(),
            pixel_size_um: 4.63,
            resolution: (4144, 2822),
            quantum_efficiency: 0.80,
            read_noise_e: 1.5,
            dark_current_e_per_s: 0.005,
            full_well_capacity_e: 63_000.0,
            bit_depth: 14,
            has_cooling: true,
            min_temp_c: -10.0,
            hot_pixel_rate: 0.0001,
            cold_pixel_rate: 0.00005,
        }
    }

    /// Full-frame 16-bit survey sensor (IMX455 class).
    pub fn survey_cmos_imx455() -> Self {
        Self {
            name: "Survey CMOS IMX455".to_string(),
            pixel_size_um: 3.76,
            resolution: (9576, 6388),
            quantum_efficiency: 0.85,
            read_noise_e: 1.3,
            dark_current_e_per_s: 0.002,
            full_well_capacity_e: 90_000.0,
            bit_depth: 16,
            has_cooling: true,
            min_temp_c: -20.0,
            hot_pixel_rate: 0.00005,
            cold_pixel_rate: 0.00002,
        }
    }
}
