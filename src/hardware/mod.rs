//! Camera hardware simulation: sensor configuration, persistent defects,
//! and the exposure pipeline.

pub mod camera;
pub mod defects;
pub mod sensor;

pub use camera::Camera;
pub use defects::DefectMap;
pub use sensor::CameraSpec;
