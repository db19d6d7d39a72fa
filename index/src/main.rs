use std::ops::Bound;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ilindex::btree::{Scalar, Tree, TreeError};
use ilindex::config::{ConfigError, IndexConfig};
use ilindex::storage::{FileStore, StoreError, copy_to_file, pack_file};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type FileTree = Tree<i32, i64, FileStore<i32, i64>>;

#[derive(Parser)]
#[command(name = "ilindex", about = "Persistent integer B-tree index", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the value stored under a key
    Get {
        #[arg(allow_negative_numbers = true)]
        key: Scalar,
    },

    /// Insert or replace a value
    Set {
        #[arg(allow_negative_numbers = true)]
        key: Scalar,
        #[arg(allow_negative_numbers = true)]
        value: Scalar,
    },

    /// Insert a value, failing if the key exists
    Insert {
        #[arg(allow_negative_numbers = true)]
        key: Scalar,
        #[arg(allow_negative_numbers = true)]
        value: Scalar,
    },

    /// Remove a key
    Delete {
        #[arg(allow_negative_numbers = true)]
        key: Scalar,
    },

    /// Print entries in key order
    Range {
        /// Smallest key to include
        #[arg(long, allow_negative_numbers = true)]
        from: Option<Scalar>,

        /// Largest key to include
        #[arg(long, allow_negative_numbers = true)]
        to: Option<Scalar>,

        /// Stop after this many entries
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print tree and file statistics
    Stats,

    /// Verify every tree invariant
    Check,

    /// Rewrite the index file down to its latest committed version
    Pack,

    /// Write a point-in-time copy of the committed tree to a new index file
    Snapshot {
        /// Path of the new file; must not exist yet
        destination: PathBuf,
    },
}

#[derive(Debug)]
enum CliError {
    Config(ConfigError),
    Store(StoreError),
    Tree(TreeError<i32>),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Tree(e) => write!(f, "{e}"),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<StoreError> for CliError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<TreeError<i32>> for CliError {
    fn from(e: TreeError<i32>) -> Self {
        Self::Tree(e)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "ilindex=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn open_tree(config: &IndexConfig) -> Result<FileTree, CliError> {
    let store = FileStore::open_or_create(&config.data_file, config.tree, config.cache_nodes)?;
    let tree_config = store.config();
    Ok(Tree::open_latest(Arc::new(store), tree_config)?)
}

fn run(command: Command) -> Result<(), CliError> {
    let config = IndexConfig::from_env()?;
    tracing::debug!(
        data_file = %config.data_file.display(),
        cache_nodes = config.cache_nodes,
        "loaded configuration"
    );
    let mut tree = open_tree(&config)?;

    match command {
        Command::Get { key } => {
            let key = FileTree::coerce_key(&key)?;
            println!("{}", tree.get(key)?);
        }
        Command::Set { key, value } => {
            let previous = tree.set_scalar(&key, &value)?;
            tree.commit()?;
            if let Some(previous) = previous {
                println!("replaced {previous}");
            }
        }
        Command::Insert { key, value } => {
            let key = FileTree::coerce_key(&key)?;
            let value = FileTree::coerce_value(&value)?;
            tree.insert(key, value)?;
            tree.commit()?;
        }
        Command::Delete { key } => {
            let key = FileTree::coerce_key(&key)?;
            let removed = tree.delete(key)?;
            tree.commit()?;
            println!("{removed}");
        }
        Command::Range { from, to, limit } => {
            let lower = match from {
                Some(key) => Bound::Included(FileTree::coerce_key(&key)?),
                None => Bound::Unbounded,
            };
            let upper = match to {
                Some(key) => Bound::Included(FileTree::coerce_key(&key)?),
                None => Bound::Unbounded,
            };
            for entry in tree.range((lower, upper)).take(limit.unwrap_or(usize::MAX)) {
                let (key, value) = entry?;
                println!("{key}\t{value}");
            }
        }
        Command::Stats => {
            let stats = tree.store().stats();
            println!("entries\t{}", tree.len());
            println!("height\t{}", tree.height()?);
            println!("root\t{}", tree.root_id());
            println!("pages\t{}", stats.committed_pages);
            println!("max_bucket_size\t{}", tree.config().max_bucket_size());
            println!("max_btree_size\t{}", tree.config().max_btree_size());
        }
        Command::Check => {
            tree.check()?;
            println!("ok: {} entries, height {}", tree.len(), tree.height()?);
        }
        Command::Snapshot { destination } => {
            let copy = copy_to_file(&tree, &destination, config.cache_nodes)?;
            println!("copied {} entries to {}", copy.len(), destination.display());
        }
        Command::Pack => {
            // The packed file replaces this one
            drop(tree);
            let stats = pack_file::<i32, i64>(&config.data_file, config.cache_nodes)?;
            println!("pages\t{} -> {}", stats.pages_before, stats.pages_after);
            println!("entries\t{}", stats.entries);
        }
    }
    Ok(())
}
