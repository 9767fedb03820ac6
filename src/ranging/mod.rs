pub mod distance;
pub mod engine;
pub mod history;
pub mod session;
pub mod smoothing;
pub mod state;
pub mod stats;
