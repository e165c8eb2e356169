pub mod cli;
pub mod config;
pub mod copier;
pub mod dispatch;
pub mod events;
pub mod host;
pub mod matcher;
pub mod service;
pub mod watcher;

pub use config::*;
pub use copier::*;
pub use dispatch::*;
pub use events::*;
pub use matcher::*;
pub use service::*;
pub use watcher::*;
