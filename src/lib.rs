pub mod app;
pub mod config;
pub mod executor;
pub mod integrity;
pub mod ledger;
pub mod logging;
pub mod pass;
pub mod payload;
pub mod phase;
pub mod prefs;
pub mod source;
pub mod system;
pub mod telemetry;
pub mod trigger;
