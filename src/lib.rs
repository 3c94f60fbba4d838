pub mod aggregate;
pub mod audit;
pub mod config;
pub mod db;
pub mod destination;
pub mod media;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod scanner;
pub mod schedule;
pub mod service;
pub mod vault;
