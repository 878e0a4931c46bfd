pub mod api;
pub mod config;
pub mod controller;
pub mod domain;
pub mod forecast;
pub mod notify;
pub mod optimizer;
pub mod repo;
pub mod telemetry;
