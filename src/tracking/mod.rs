// src/tracking/mod.rs

pub mod trajectory;
pub mod vehicle_tracker;

pub use trajectory::{Trajectory, TrajectoryConfig, TrajectoryPoint, TrajectoryStore};
pub use vehicle_tracker::{
    iou, Associator, GreedyIouAssociator, Track, TrackState, TrackedVehicle, TrackerConfig,
    TrackerStats, VehicleTracker,
};
