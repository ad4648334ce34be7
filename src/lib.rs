pub mod api;
pub mod config;
pub mod engine;
pub mod groups;
pub mod limits;
pub mod model;
pub mod observability;
pub mod quota;
pub mod units;
