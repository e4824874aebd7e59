pub mod calibration;
pub mod clock;
pub mod config;
pub mod library;
pub mod overrides;
pub mod platform;
pub mod probe;
pub mod recordings;
pub mod schedule;
pub mod schedule_store;
pub mod selector;
