//! Thumbnail generation, caching and grid display for an image browser.

pub mod animation;
pub mod app;
pub mod cli;
pub mod config;
pub mod layout;
pub mod models;
pub mod scanner;
pub mod thumbnails;
