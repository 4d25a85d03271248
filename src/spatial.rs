//! Minimal spatial value types for plan steps.
//!
//! The platform's frame-system math lives elsewhere; plan steps only need
//! poses to describe where a component should be, and geo-referenced plans
//! need the compass-heading embedding below.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Orientation vector with `theta` in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrientationVector {
    pub ox: f64,
    pub oy: f64,
    pub oz: f64,
    pub theta: f64,
}

impl Default for OrientationVector {
    fn default() -> Self {
        Self {
            ox: 0.0,
            oy: 0.0,
            oz: 1.0,
            theta: 0.0,
        }
    }
}

/// A position and orientation in some reference frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub translation: Vector3,
    pub orientation: OrientationVector,
}

impl Pose {
    pub fn new(translation: Vector3, orientation: OrientationVector) -> Self {
        Self {
            translation,
            orientation,
        }
    }
}

/// A point on the globe in decimal degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// A geo point plus a compass heading in degrees, 0 = north, clockwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPose {
    pub location: GeoPoint,
    pub heading: f64,
}

impl GeoPose {
    pub fn new(location: GeoPoint, heading: f64) -> Self {
        Self { location, heading }
    }

    /// Embeds the geo pose into a plan-step pose: latitude and longitude land
    /// in x and y of the translation, and the compass heading becomes a
    /// right-handed orientation-vector theta of (360 - heading) mod 360.
    pub fn to_pose(&self) -> Pose {
        let theta = (360.0 - self.heading).rem_euclid(360.0);
        Pose {
            translation: Vector3::new(self.location.latitude, self.location.longitude, 0.0),
            orientation: OrientationVector {
                theta,
                ..OrientationVector::default()
            },
        }
    }
}
