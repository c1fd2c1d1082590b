pub mod auth;
pub mod classifier;
pub mod config;
pub mod db;
pub mod error;
pub mod gmail;
pub mod logging;
pub mod models;
pub mod narration;
pub mod pipeline;
pub mod storage;
pub mod vault;
