pub mod app_config;
pub mod commons;
pub mod health;
pub mod kvstore;
pub mod retry;
pub mod traits;
