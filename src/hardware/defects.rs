//! Persistent sensor defect map.
//!
//! Hot and cold pixels are a fixed physical property of one sensor, not
//! re-rolled per exposure. The map is generated deterministically from the
//! camera's session seed and applied to every capture at the same
//! coordinates. Maps can be saved to and loaded from JSON, the same way
//! measured bad-pixel maps would be exchanged for real hardware.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::noise::seed::{category, hash_seeds};

/// Median excess dark signal of a hot pixel, in electrons. Individual hot
/// pixels scatter between half and twice this level.
const HOT_PIXEL_LEVEL_E: f64 = 100.0;

/// A single defective pixel and its signal excess.
///
/// `excess_e` is positive for hot pixels (spurious charge) and negative for
/// cold pixels (depressed response); it is added to the electron field
/// before saturation clamping, so a strongly negative excess pins the pixel
/// near zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelDefect {
    pub x: usize,
    pub y: usize,
    pub excess_e: f64,
}

/// Fixed defect map for one simulated sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefectMap {
    /// Sensor model this map belongs to.
    pub sensor_name: String,
    /// Session seed the map was generated from.
    pub seed: u64,
    /// Defective pixels with their excess values.
    pub defects: Vec<PixelDefect>,
}

impl DefectMap {
    /// Generate the defect map for a sensor.
    ///
    /// Deterministic: the same (seed, resolution, rates, full well) always
    /// produces the same set of coordinates and excess values.
    pub fn generate(
        sensor_name: impl Into<String>,
        seed: u64,
        resolution: (usize, usize),
        hot_pixel_rate: f64,
        cold_pixel_rate: f64,
        full_well_e: f64,
    ) -> Self {
        let (width, height) = resolution;
        let n_pixels = (width * height) as f64;
        let n_hot = (n_pixels * hot_pixel_rate).round() as usize;
        let n_cold = (n_pixels * cold_pixel_rate).round() as usize;

        let mut rng = StdRng::seed_from_u64(hash_seeds(&[seed, category::DEFECT]));
        let mut defects = Vec::with_capacity(n_hot + n_cold);

        for _ in 0..n_hot {
            let x = rng.gen_range(0..width);
            let y = rng.gen_range(0..height);
            let excess_e = rng.gen_range(HOT_PIXEL_LEVEL_E * 0.5..HOT_PIXEL_LEVEL_E * 2.0);
            defects.push(PixelDefect { x, y, excess_e });
        }
        for _ in 0..n_cold {
            let x = rng.gen_range(0..width);
            let y = rng.gen_range(0..height);
            // Cold pixels lose most of their charge; the clamp stage floors
            // them at zero counts.
            defects.push(PixelDefect {
                x,
                y,
                excess_e: -full_well_e,
            });
        }

        Self {
            sensor_name: sensor_name.into(),
            seed,
            defects,
        }
    }

    /// Number of defective pixels.
    pub fn len(&self) -> usize {
        self.defects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defects.is_empty()
    }

    /// Defect coordinates as a set for fast membership checks.
    pub fn coordinate_set(&self) -> HashSet<(usize, usize)> {
        self.defects.iter().map(|d| (d.x, d.y)).collect()
    }

    /// Add each defect's excess to an electron field in place.
    pub fn apply(&self, electrons: &mut Array2<f64>) {
        for defect in &self.defects {
            electrons[[defect.y, defect.x]] += defect.excess_e;
        }
    }

    /// Save to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load from a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_is_deterministic() {
        let a = DefectMap::generate("s", 7, (200, 100), 0.001, 0.0005, 50_000.0);
        let b = DefectMap::generate("s", 7, (200, 100), 0.001, 0.0005, 50_000.0);
        assert_eq!(a, b);

        let c = DefectMap::generate("s", 8, (200, 100), 0.001, 0.0005, 50_000.0);
        assert_ne!(a.defects, c.defects);
    }

    #[test]
    fn test_defect_counts_follow_rates() {
        let map = DefectMap::generate("s", 1, (1000, 1000), 0.0005, 0.0001, 50_000.0);
        assert_eq!(map.len(), 500 + 100);
    }

    #[test]
    fn test_coordinates_in_bounds() {
        let map = DefectMap::generate("s", 3, (64, 48), 0.01, 0.01, 50_000.0);
        for d in &map.defects {
            assert!(d.x < 64);
            assert!(d.y < 48);
        }
    }

    #[test]
    fn test_apply_adds_excess() {
        let map = DefectMap {
            sensor_name: "s".to_string(),
            seed: 0,
            defects: vec![
                PixelDefect {
                    x: 1,
                    y: 0,
                    excess_e: 120.0,
                },
                PixelDefect {
                    x: 0,
                    y: 1,
                    excess_e: -500.0,
                },
            ],
        };
        let mut field = Array2::from_elem((2, 2), 10.0);
        map.apply(&mut field);
        assert_eq!(field[[0, 1]], 130.0);
        assert_eq!(field[[1, 0]], -490.0);
        assert_eq!(field[[0, 0]], 10.0);
    }

    #[test]
    fn test_json_round_trip() {
        let map = DefectMap::generate("s", 5, (32, 32), 0.01, 0.0, 10_000.0);
        let dir = std::env::temp_dir().join("astrostack_defect_map_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("map.json");
        map.save_to_file(&path).unwrap();
        let loaded = DefectMap::load_from_file(&path).unwrap();
        assert_eq!(map, loaded);
        std::fs::remove_file(&path).ok();
    }
}
