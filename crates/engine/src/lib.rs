// ABOUTME: Main library entry point for the Shelf book-source engine.
// ABOUTME: Re-exports the public API: Engine, EngineBuilder, SourceDefinition, crawl results, tasks and errors.

//! Shelf - a rule-driven engine for crawling web novel sites.
//!
//! A *book source* is a JSON definition of CSS/rule selectors describing how
//! to search one site and how to walk a book from detail page to chapter list
//! to chapter text. The engine stores sources, fans a keyword search out to
//! many of them at once, and runs batch imports as background tasks.
//!
//! # Example
//!
//! ```no_run
//! use shelf_engine::{Engine, EngineError, SearchOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EngineError> {
//!     let engine = Engine::builder().build().await?;
//!     engine
//!         .add_or_update_raw(r#"{"bookSourceName": "Demo", "bookSourceUrl": "https://demo.example"}"#)
//!         .await?;
//!     for book in engine.search("dune", &SearchOptions::new()).await? {
//!         println!("{} / {} ({})", book.name, book.author, book.source_name);
//!     }
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod error;
pub mod options;
pub mod parser;
pub mod registry;
pub mod resource;
pub mod search;
pub mod selector;
pub mod source;
pub mod tasks;
pub mod urls;

pub use crate::engine::Engine;
pub use crate::error::{EngineError, ErrorCode, Stage};
pub use crate::options::{DnsMode, EngineBuilder, EngineOptions};
pub use crate::parser::{BookDetail, Chapter, ChapterContent, SearchResult};
pub use crate::registry::store::{JsonFileStore, MemoryStore, SourceStore};
pub use crate::registry::Upsert;
pub use crate::search::SearchOptions;
pub use crate::source::SourceDefinition;
pub use crate::tasks::{ImportTask, TaskKind, TaskStatus};
