pub mod agent;
pub mod dispatch;
pub mod errors;
pub mod models;
pub mod providers;
pub mod registry;
pub mod toolkit;
