pub mod common;
pub mod http_client;
pub mod log_feed;
pub mod model;
