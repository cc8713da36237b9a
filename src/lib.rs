pub mod assembler;
pub mod cache;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod cube;
pub mod domain;
pub mod error;
pub mod icos;
pub mod output;
pub mod preload;
pub mod progress;
pub mod resolver;
pub mod selector;
pub mod stager;
pub mod store;
pub mod tui;
pub mod writer;

pub use error::IcosdpError;
pub use store::IcosdpStore;
