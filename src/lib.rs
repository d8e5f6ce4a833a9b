//! Sensor simulation and image reduction for astronomical imaging
//!
//! This crate provides a physically-grounded simulation of a digital image
//! sensor (photon flux to digital counts), the calibration pipeline that
//! removes systematic sensor defects, and the stacking engine that combines
//! multiple noisy exposures into a higher signal-to-noise result.
//!
//! Data flows one direction: sky signal → [`Camera`] → [`Frame`]s →
//! [`Calibrator`] → calibrated frames → stacking → combined result.
//! All noise generation is reseeded per (category, frame) so captures are
//! bit-reproducible regardless of call or thread order.

pub mod algo;
pub mod calibration;
pub mod frame;
pub mod hardware;
pub mod noise;
pub mod stacking;

// Re-exports for easier access
pub use calibration::{
    CalibrationError, CalibrationLibrary, Calibrator, MasterFrame, MasterKey, MatchPolicy,
};
pub use frame::{Frame, FrameMetadata, FrameSet, FrameStats, FrameType, ImagingSession};
pub use hardware::camera::{Camera, CaptureError};
pub use hardware::defects::DefectMap;
pub use hardware::sensor::CameraSpec;
pub use stacking::{StackError, StackMethod};
