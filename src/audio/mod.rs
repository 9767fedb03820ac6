pub mod chirp;
pub mod detector;
pub mod device;
pub mod filter;
pub mod simulated;
