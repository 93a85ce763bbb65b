pub mod analysis;
pub mod api;
pub mod attachments;
pub mod config;
pub mod db;
pub mod jobs;
pub mod logging;
pub mod queue;
pub mod worker;
