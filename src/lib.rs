//! Two-way sync between a flashcard collection and a directory of markdown deck files.

pub mod config;
pub mod db;
pub mod engine;
pub mod files;
pub mod models;
pub mod remote;
pub mod transform;
