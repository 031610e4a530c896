use anyhow::{Context, Result, anyhow};
use chatstate::{
    Document, EntityKey, EntityStore, Platform, SCHEMA_VERSION_KEY, SchemaVersion, StateConfig,
    StateLayer,
    cooldown::user_cooldown_attribute,
    storage::{codec, layout},
};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "state-tool")]
#[command(about = "Inspect and edit chatstate entity documents offline")]
struct Cli {
    /// Overrides CHATSTATE_BASE_DIR (and the bank directory beneath it)
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    #[arg(long, global = true, default_value = "twitch")]
    platform: Platform,

    #[arg(long, global = true, value_enum, default_value_t = NamespaceArg::Users)]
    namespace: NamespaceArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum NamespaceArg {
    Users,
    Bank,
    ChannelSettings,
    Channels,
}

#[derive(Subcommand)]
enum Command {
    /// Print a whole document
    Show { id: String },
    /// Print one attribute without creating it
    Get { id: String, attr: String },
    /// Write one attribute; the value is parsed as JSON, falling back to a string
    Set { id: String, attr: String, value: String },
    /// Delete one attribute
    Remove { id: String, attr: String },
    /// Print a user's stored schema version
    Version { id: String },
    /// Print the remaining personal cooldown for a user
    Cooldown {
        id: String,
        key: String,
        #[arg(long)]
        seconds: i64,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.base_dir {
        Some(base_dir) => StateConfig::new(base_dir),
        None => StateConfig::from_env().map_err(|err| anyhow!(err))?,
    };
    let state = StateLayer::open(config).context("failed to open state layer")?;
    let store = select_store(&state, cli.namespace);

    match cli.command {
        Command::Show { id } => {
            let key = EntityKey::new(cli.platform, id);
            let document = read_document(store, &key)?;
            println!("{}", serde_json::to_string_pretty(&document.into_value())?);
        }
        Command::Get { id, attr } => {
            let key = EntityKey::new(cli.platform, id);
            match read_document(store, &key)?.get(&attr) {
                Some(value) => println!("{}", value),
                None => println!("<unset>"),
            }
        }
        Command::Set { id, attr, value } => {
            let key = EntityKey::new(cli.platform, id);
            let value = serde_json::from_str::<Value>(&value).unwrap_or(Value::String(value));
            store
                .try_save(&key, &attr, &value, true)
                .with_context(|| format!("failed to write '{}' on {}", attr, key))?;
            println!("{}.{} = {}", key, attr, value);
        }
        Command::Remove { id, attr } => {
            let key = EntityKey::new(cli.platform, id);
            let existed = store
                .try_remove(&key, &attr)
                .with_context(|| format!("failed to remove '{}' on {}", attr, key))?;
            println!("{}", if existed { "removed" } else { "not present" });
        }
        Command::Version { id } => {
            let key = EntityKey::new(cli.platform, id);
            let version = read_document(state.users(), &key)?
                .get_as::<SchemaVersion>(SCHEMA_VERSION_KEY)?
                .unwrap_or(SchemaVersion::ZERO);
            println!("{} schema version {}", key, version);
        }
        Command::Cooldown { id, key, seconds } => {
            let user = EntityKey::new(cli.platform, id);
            let attr = user_cooldown_attribute(&key);
            let last_use = read_document(state.users(), &user)?.get_as::<DateTime<Utc>>(&attr)?;
            match last_use {
                Some(last_use) => println!(
                    "{} last used '{}' at {}, remaining {}s",
                    user,
                    key,
                    last_use.to_rfc3339(),
                    (Duration::seconds(seconds) - (Utc::now() - last_use)).num_seconds()
                ),
                None => println!("{} never used '{}'", user, key),
            }
        }
    }

    Ok(())
}

fn select_store(state: &StateLayer, namespace: NamespaceArg) -> &EntityStore {
    match namespace {
        NamespaceArg::Users => state.users().as_ref(),
        NamespaceArg::Bank => state.bank().as_ref(),
        NamespaceArg::ChannelSettings => state.channel_settings().as_ref(),
        NamespaceArg::Channels => state.channel_cooldowns().as_ref(),
    }
}

/// Reads a document straight from disk. Inspection never creates, caches
/// or quarantines anything.
fn read_document(store: &EntityStore, key: &EntityKey) -> Result<Document> {
    let path = layout::document_path(store.namespace(), key)?;
    match layout::read_file(&path)? {
        None => Ok(Document::new()),
        Some(bytes) => codec::decode(&bytes)
            .with_context(|| format!("{} is not a readable document", path.display())),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatstate=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatstate::NamespaceConfig;
    use tempfile::TempDir;

    #[test]
    fn test_inspecting_corrupt_document_leaves_it_in_place() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("users").join("twitch");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("7.json"), b"{ broken").unwrap();

        let store = EntityStore::new(NamespaceConfig::new("users", temp_dir.path()));
        let key = EntityKey::new(Platform::Twitch, "7");

        assert!(read_document(&store, &key).is_err());
        assert!(dir.join("7.json").exists());
        assert!(!dir.join("7.json.corrupt").exists());
    }

    #[test]
    fn test_inspecting_missing_document_creates_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let store = EntityStore::new(NamespaceConfig::new("users", temp_dir.path()));
        let key = EntityKey::new(Platform::Twitch, "8");

        assert!(read_document(&store, &key).unwrap().is_empty());
        assert!(!temp_dir.path().join("users").exists());
    }
}
