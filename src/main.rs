//! tagdir CLI
//!
//! Command-line front end over [`tagdir::Store`] for tagging directories
//! and reading or writing their metadata.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tagdir::codec::DataMap;
use tagdir::{lock, Config, Store};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tagdir")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tag directories and attach metadata to them")]
pub struct Cli {
    /// Name of the metadata directory
    #[arg(long, global = true, default_value = tagdir::config::DEFAULT_DATA_ROOT)]
    pub data_root: String,

    /// Give up waiting for a lock after this many seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<f64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add tags to a directory
    Tag {
        path: PathBuf,
        #[arg(required = true)]
        tags: Vec<String>,
    },

    /// Remove tags from a directory
    Untag {
        path: PathBuf,
        #[arg(required = true)]
        tags: Vec<String>,
    },

    /// List the tags of a directory
    Tags { path: PathBuf },

    /// Print stored data, or only the given keys
    Read { path: PathBuf, keys: Vec<String> },

    /// Merge key=value pairs into the stored data (values are YAML)
    #[command(
        long_about = "Merge key=value pairs into the stored data\n\n\
        Values are parsed as YAML, so numbers, booleans and lists keep their type.\n\n\
        Example:\n\
          tagdir write ./shot01 frames=24 approved=true 'artists=[ana, bo]'"
    )]
    Write {
        path: PathBuf,
        #[arg(required = true, value_name = "KEY=VALUE")]
        pairs: Vec<String>,
    },

    /// Find tagged directories
    Search {
        root: PathBuf,
        /// Only directories carrying all of these tags
        tags: Vec<String>,
        /// Walk towards the filesystem root instead of down
        #[arg(long)]
        up: bool,
        /// Only directories whose name contains this (use / to select by hierarchy)
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        depth: Option<usize>,
    },

    /// Delete the metadata of a directory
    Delete {
        path: PathBuf,
        /// Also remove the directory itself
        #[arg(long)]
        remove_root: bool,
    },

    /// Print the identifier of a directory
    Uuid {
        path: PathBuf,
        /// Assign a new identifier first
        #[arg(long)]
        new: bool,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tagdir=info")),
        )
        .init();

    let cli = Cli::parse();
    let result = run(cli);
    let released = lock::release_all();
    tracing::debug!("Released {} locks on exit", released);

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut builder = Config::builder().data_root(cli.data_root);
    if let Some(secs) = cli.timeout {
        let timeout = Duration::try_from_secs_f64(secs).context("invalid --timeout")?;
        builder = builder.lock_timeout(Some(timeout));
    }
    let store = Store::new(builder.build());

    match cli.command {
        Commands::Tag { path, tags } => {
            store.get(&path)?.tag(&as_strs(&tags))?;
        }
        Commands::Untag { path, tags } => {
            store.get(&path)?.untag(&as_strs(&tags))?;
        }
        Commands::Tags { path } => {
            for tag in store.get(&path)?.tags()? {
                println!("{}", tag);
            }
        }
        Commands::Read { path, keys } => {
            let entry = store.get(&path)?;
            let data = if keys.is_empty() {
                (*entry.read()?).clone()
            } else {
                entry.read_keys(&as_strs(&keys))?
            };
            print!("{}", serde_yaml::to_string(&data)?);
        }
        Commands::Write { path, pairs } => {
            let mut data = DataMap::new();
            for pair in &pairs {
                let (key, value) = parse_pair(pair)?;
                data.insert(key, value);
            }
            store.get(&path)?.write(data)?;
        }
        Commands::Search {
            root,
            tags,
            up,
            name,
            depth,
        } => {
            let mut search = store.search(&root).tags(&as_strs(&tags))?;
            if up {
                search = search.up();
            }
            if let Some(name) = name {
                search = search.name(&name);
            }
            if let Some(depth) = depth {
                search = search.depth(depth);
            }
            for entry in search {
                println!("{}", entry.path().display());
            }
        }
        Commands::Delete { path, remove_root } => {
            store.get(&path)?.delete(remove_root)?;
        }
        Commands::Uuid { path, new } => {
            let entry = store.get(&path)?;
            let uuid = if new { entry.new_uuid()? } else { entry.uuid()? };
            println!("{}", uuid);
        }
    }
    Ok(())
}

fn as_strs(items: &[String]) -> Vec<&str> {
    items.iter().map(String::as_str).collect()
}

/// Split `key=value` and parse the value as a YAML scalar or collection.
fn parse_pair(pair: &str) -> Result<(String, Value)> {
    let (key, raw) = pair
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got {:?}", pair))?;
    if key.is_empty() {
        bail!("empty key in {:?}", pair);
    }
    let value: Value = if raw.is_empty() {
        Value::String(String::new())
    } else {
        serde_yaml::from_str(raw).with_context(|| format!("invalid value for {}", key))?
    };
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_pair() {
        assert_eq!(parse_pair("frames=24").unwrap(), ("frames".to_string(), json!(24)));
        assert_eq!(parse_pair("ok=true").unwrap().1, json!(true));
        assert_eq!(parse_pair("names=[a, b]").unwrap().1, json!(["a", "b"]));
        assert_eq!(parse_pair("note=").unwrap().1, json!(""));
        assert_eq!(parse_pair("url=a=b").unwrap().1, json!("a=b"));
        assert!(parse_pair("novalue").is_err());
        assert!(parse_pair("=1").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["tagdir", "search", ".", "shot", "--up", "--depth", "2"]).unwrap();
        match cli.command {
            Commands::Search { tags, up, depth, .. } => {
                assert_eq!(tags, vec!["shot"]);
                assert!(up);
                assert_eq!(depth, Some(2));
            }
            _ => panic!("expected search"),
        }
    }
}
