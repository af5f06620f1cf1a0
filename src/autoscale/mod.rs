//! Horizontal Autoscaling
//!
//! Threshold rules over registry utilization, a global cooldown, and the
//! offline/draining lifecycle of the instances it adds and retires.

mod controller;
mod decision;

pub use controller::{AutoscaleController, AutoscaleStats};
pub use decision::{evaluate_rules, AutoscaleConfig, ScalingAction, ScalingDecision, ScalingMetrics};
