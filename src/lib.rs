pub mod api;
pub mod config;
pub mod editor;
pub mod error;
pub mod ffmpeg;
pub mod generator;
pub mod probe;
pub mod prompts;
pub mod retry;
pub mod script;
pub mod timeline;
