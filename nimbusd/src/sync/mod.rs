pub mod conflict;
pub mod coordinator;
pub mod copier;
pub mod descriptor;
pub mod error;
pub mod index;
pub mod livequery;
pub mod local_watcher;
pub mod observer;
pub mod paths;
pub mod progress;
pub mod store;
pub mod transfer;
pub mod watchdog;
