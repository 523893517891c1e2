pub mod api;
pub mod config;
pub mod data_models;
pub mod error;
pub mod gate;
pub mod llm;
pub mod pipeline;
pub mod report;
pub mod search;
