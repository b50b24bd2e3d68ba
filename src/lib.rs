// Public library interface for spread-pipeline
pub mod action_router;
pub mod aggregators;
pub mod backup;
pub mod cli_helper;
pub mod samples;
pub mod storage;
pub mod utils;
pub mod views;
