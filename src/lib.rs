pub mod audio;
pub mod comms;
pub mod config;
pub mod error;
pub mod protocol;
pub mod ranging;
