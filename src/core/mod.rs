// src/core/mod.rs

pub mod arg_parser;
pub mod cache;
pub mod composer;
pub mod loader;
pub mod magic;
pub mod paths;
pub mod plugins;
pub mod projector;
pub mod settings;
pub mod stage;
pub mod tree;
pub mod types;
pub mod validator;
