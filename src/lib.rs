pub mod config;
pub mod core;
pub mod distributions;
pub mod error;
pub mod hmc;
pub mod metropolis;
pub mod point;
pub mod resampling;
pub mod smc;
pub mod stats;
pub mod transition;
