pub mod config;
pub mod duration;
pub mod fingerprint;

pub use config::StepgridConfig;
pub use duration::parse_duration;
pub use fingerprint::Fingerprint;
