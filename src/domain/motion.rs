//! Motion planning
//!
//! Turns pattern parameters into primitive device fields and decides in which
//! order to write them so the actuator never over-extends at speed.

use crate::domain::models::{DeviceState, Field};
use crate::error::{ClientError, Result};

/// High-level pattern request, all percentages in 0..=100
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternRequest {
    pub pattern: u32,
    pub speed: u8,
    /// Shallow end of the stroke, as a percentage of full depth
    pub min_depth: u8,
    /// Deep end of the stroke, as a percentage of full depth
    pub max_depth: u8,
    pub intensity: u8,
    /// `Some(_)` maps intensity onto one half of the sensation scale
    pub invert: Option<bool>,
}

impl PatternRequest {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("speed", self.speed),
            ("min_depth", self.min_depth),
            ("max_depth", self.max_depth),
            ("intensity", self.intensity),
        ] {
            if value > 100 {
                return Err(ClientError::InvalidInput(format!(
                    "{} must be within 0..=100, got {}",
                    name, value
                )));
            }
        }
        if self.min_depth > self.max_depth {
            return Err(ClientError::InvalidInput(format!(
                "min_depth {} is above max_depth {}",
                self.min_depth, self.max_depth
            )));
        }
        Ok(())
    }

    pub fn targets(&self) -> MotionTargets {
        MotionTargets {
            pattern: self.pattern,
            speed: self.speed,
            depth: self.max_depth,
            stroke: self.max_depth - self.min_depth,
            sensation: sensation_for(self.intensity, self.invert),
        }
    }
}

/// `50 ± round(intensity / 2)` when a direction is given, else intensity as is
pub fn sensation_for(intensity: u8, invert: Option<bool>) -> u8 {
    match invert {
        None => intensity,
        Some(invert) => {
            let half = (intensity as f64 / 2.0).round() as u8;
            if invert {
                50 - half
            } else {
                50 + half
            }
        }
    }
}

/// Primitive field values for one pattern application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionTargets {
    pub pattern: u32,
    pub speed: u8,
    pub depth: u8,
    pub stroke: u8,
    pub sensation: u8,
}

impl MotionTargets {
    pub fn get(&self, field: Field) -> u32 {
        match field {
            Field::Speed => self.speed as u32,
            Field::Stroke => self.stroke as u32,
            Field::Depth => self.depth as u32,
            Field::Sensation => self.sensation as u32,
            Field::Pattern => self.pattern,
        }
    }

    pub fn range_min(&self) -> u8 {
        self.depth - self.stroke
    }

    pub fn range_max(&self) -> u8 {
        self.depth
    }
}

/// Which ordering rule applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionOrdering {
    /// Slowing down: speed goes first
    Decelerate,
    /// Faster and wider: reshape at the old speed, then speed up
    ExtendThenAccelerate,
    Neutral,
}

pub fn choose_ordering(current: &DeviceState, targets: &MotionTargets) -> MotionOrdering {
    let extends = targets.range_min() < current.range_min()
        || targets.range_max() > current.range_max();

    if targets.speed < current.speed {
        MotionOrdering::Decelerate
    } else if targets.speed > current.speed && extends {
        MotionOrdering::ExtendThenAccelerate
    } else {
        MotionOrdering::Neutral
    }
}

/// Field writes for `targets`, in order, skipping values the device already has
pub fn plan_writes(current: &DeviceState, targets: &MotionTargets) -> Vec<(Field, u32)> {
    let order: [Field; 5] = match choose_ordering(current, targets) {
        MotionOrdering::Decelerate => [
            Field::Pattern,
            Field::Speed,
            Field::Depth,
            Field::Stroke,
            Field::Sensation,
        ],
        MotionOrdering::ExtendThenAccelerate => [
            Field::Pattern,
            Field::Depth,
            Field::Stroke,
            Field::Sensation,
            Field::Speed,
        ],
        MotionOrdering::Neutral => [
            Field::Pattern,
            Field::Depth,
            Field::Stroke,
            Field::Speed,
            Field::Sensation,
        ],
    };

    order
        .into_iter()
        .filter(|f| current.get(*f) != targets.get(*f))
        .map(|f| (f, targets.get(f)))
        .collect()
}
