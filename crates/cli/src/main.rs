// ABOUTME: Command-line front end for the shelf engine: manage book sources, search, and read books.
// ABOUTME: Prints JSON on stdout; logs go to stderr through tracing-subscriber.

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use shelf_engine::{
    DnsMode, Engine, EngineBuilder, EngineOptions, JsonFileStore, SearchOptions, TaskStatus,
};
use tracing_subscriber::EnvFilter;

/// Crawl web novel sites described by JSON book sources.
#[derive(Parser, Debug)]
#[command(name = "shelf")]
#[command(about = "Manage book sources and crawl books with them", long_about = None)]
struct Args {
    /// JSON file holding the source registry. Created on first write.
    #[arg(long = "sources", global = true, default_value = "sources.json")]
    sources_file: PathBuf,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Use the system resolver instead of the fixed public resolvers.
    #[arg(long, global = true, default_value_t = false)]
    system_dns: bool,

    /// Output compact JSON instead of pretty.
    #[arg(long, global = true, default_value_t = false)]
    compact: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every stored source.
    List,
    /// List the distinct source groups.
    Groups,
    /// Import one definition or an array of them from a file ("-" for stdin).
    Import { file: String },
    /// Export all sources as a JSON array, without usage statistics.
    Export,
    /// Search enabled sources, or only the named ones.
    Search {
        keyword: String,
        /// Restrict the search to this source. Repeatable.
        #[arg(long = "source")]
        source_names: Vec<String>,
        /// Aggregate timeout for the whole search.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Fetch a book's detail page.
    Detail {
        #[arg(long)]
        source: String,
        url: String,
    },
    /// Fetch a book's chapter list.
    Chapters {
        #[arg(long)]
        source: String,
        url: String,
    },
    /// Fetch one chapter's text.
    Content {
        #[arg(long)]
        source: String,
        url: String,
    },
    /// Enable a source.
    Enable { name: String },
    /// Disable a source.
    Disable { name: String },
    /// Delete a source.
    Delete { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut opts = EngineOptions::from_env();
    if args.system_dns {
        opts.dns = DnsMode::System;
    }
    let engine = EngineBuilder::with_options(opts)
        .store(Arc::new(JsonFileStore::new(&args.sources_file)))
        .build()
        .await
        .with_context(|| format!("opening source registry {}", args.sources_file.display()))?;

    let output = run(&engine, args.command).await?;
    if args.compact {
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    engine.shutdown();
    Ok(())
}

async fn run(engine: &Engine, command: Command) -> Result<Value> {
    let output = match command {
        Command::List => serde_json::to_value(engine.list_sources().await)?,
        Command::Groups => serde_json::to_value(engine.list_groups().await)?,
        Command::Import { file } => {
            let json = load_text(&file)?;
            let id = engine.import_batch(json);
            let task = engine
                .wait_for_task(&id)
                .await
                .ok_or_else(|| anyhow!("import task {id} disappeared"))?;
            if task.status == TaskStatus::Failed {
                eprintln!(
                    "import failed: {}",
                    task.error.as_deref().unwrap_or("no definition was imported")
                );
            }
            serde_json::to_value(task)?
        }
        Command::Export => {
            let exported = engine.export_sources().await?;
            serde_json::from_str(&exported)?
        }
        Command::Search {
            keyword,
            source_names,
            timeout_ms,
        } => {
            let mut opts = SearchOptions::new().sources(source_names);
            if let Some(ms) = timeout_ms {
                opts = opts.timeout(Duration::from_millis(ms));
            }
            serde_json::to_value(engine.search(&keyword, &opts).await?)?
        }
        Command::Detail { source, url } => {
            serde_json::to_value(engine.get_detail(&url, &source).await?)?
        }
        Command::Chapters { source, url } => {
            serde_json::to_value(engine.get_chapters(&url, &source).await?)?
        }
        Command::Content { source, url } => {
            serde_json::to_value(engine.get_chapter_content(&url, &source).await?)?
        }
        Command::Enable { name } => {
            engine.set_enabled(&name, true).await?;
            json!({ "name": name, "enabled": true })
        }
        Command::Disable { name } => {
            engine.set_enabled(&name, false).await?;
            json!({ "name": name, "enabled": false })
        }
        Command::Delete { name } => {
            engine.delete(&name).await?;
            json!({ "name": name, "deleted": true })
        }
    };
    Ok(output)
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_text(target: &str) -> Result<String> {
    if target == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }

    let path = PathBuf::from(target);
    if !path.exists() {
        bail!("file not found: {}", target);
    }
    fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn search_takes_store_file_and_source_filters() {
        let args = Args::try_parse_from([
            "shelf",
            "--sources",
            "s.json",
            "search",
            "Dune",
            "--source",
            "A",
            "--source",
            "B",
        ])
        .unwrap();
        assert_eq!(args.sources_file, PathBuf::from("s.json"));
        match args.command {
            Command::Search {
                keyword,
                source_names,
                timeout_ms,
            } => {
                assert_eq!(keyword, "Dune");
                assert_eq!(source_names, vec!["A", "B"]);
                assert_eq!(timeout_ms, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
