pub mod broadcast;
pub mod comfy_client;
pub mod config;
pub mod context;
pub mod database;
pub mod discussion;
pub mod error;
pub mod http_client;
pub mod image_gen;
pub mod image_prep;
pub mod jobs;
pub mod llm_client;
pub mod orchestrator;
pub mod rag;
pub mod runtime;
pub mod server;
pub mod sessions;
pub mod storage;
pub mod streaming;
pub mod tags;
pub mod tasks;
pub mod tools;
pub mod web_search;
