pub mod classify;
pub mod config;
pub mod connectivity;
pub mod draft;
pub mod engine;
pub mod model;
pub mod remote;
pub mod scheduler;
pub mod store;
