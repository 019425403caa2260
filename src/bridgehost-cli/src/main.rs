use anyhow::{Context, Result};
use bridgehost_accessory::{AccessoryCache, LocalAccessoryFactory, SerializedPlatformAccessory};
use bridgehost_bridge::{
    detect_parent_channel, listen_to_parent, ChildControl, ChildExit, IpcIncomingEvent,
    ProcessLauncher,
};
use bridgehost_core::{init_logging, BridgeUsername, Config, StorageRoot};
use bridgehost_plugin::{builtin_plugins, Server, ServerMode};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "bridgehost", version, about = "Plugin host for bridged smart-home accessories")]
struct Cli {
    /// Directory holding config, cached accessories and logs
    #[arg(long, short = 'U', global = true)]
    storage_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the main bridge and its child bridges (default)
    Run,
    /// Run a single child bridge; started by the main bridge
    #[command(hide = true)]
    Child {
        #[arg(long)]
        username: BridgeUsername,
    },
    /// Inspect cached accessories
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Bridge username helpers
    #[command(subcommand)]
    Mac(MacCommand),
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// List every cache partition and the accessories in it
    List,
}

#[derive(Debug, Subcommand)]
enum MacCommand {
    /// Print a bridge username, derived from SEED when given
    Generate { seed: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let storage = StorageRoot::new();
    if let Some(path) = &cli.storage_path {
        storage.set_storage_path(path)?;
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_main(&storage).await,
        Command::Child { username } => run_child(&storage, username).await,
        Command::Cache(CacheCommand::List) => {
            let dir = storage.cached_accessory_path()?;
            for line in describe_partitions(&dir)? {
                println!("{line}");
            }
            Ok(())
        }
        Command::Mac(MacCommand::Generate { seed }) => {
            println!("{}", generate_username(seed.as_deref()));
            Ok(())
        }
    }
}

async fn run_main(storage: &StorageRoot) -> Result<()> {
    storage.ensure_exists()?;
    let config = Config::load_or_default(storage)?;
    let _logging = init_logging(&config.logging, &storage.log_path()?)?;

    let launcher = ProcessLauncher::current_exe()
        .context("cannot locate own executable for child bridges")?
        .with_storage_path(storage.storage_path()?);
    let mut server = Server::new(
        config,
        storage,
        ServerMode::Main,
        Arc::new(LocalAccessoryFactory),
        detect_parent_channel(),
    )?
    .with_launcher(Arc::new(launcher));

    server.start(builtin_plugins()).await?;
    server
        .run(listen_to_parent::<IpcIncomingEvent>(), shutdown_signal())
        .await;
    server.shutdown().await;
    Ok(())
}

async fn run_child(storage: &StorageRoot, username: BridgeUsername) -> Result<()> {
    storage.ensure_exists()?;
    let mut config = Config::load_or_default(storage)?;
    // stdout is the control channel; the child keeps its own log file.
    config.logging.console = false;
    config.logging.file_name = Some(child_log_file(&username));
    let _logging = init_logging(&config.logging, &storage.log_path()?)?;

    let mut server = Server::new(
        config,
        storage,
        ServerMode::Child(username),
        Arc::new(LocalAccessoryFactory),
        detect_parent_channel(),
    )?;
    server.start(builtin_plugins()).await?;

    let exit = tokio::select! {
        exit = server.serve_child(listen_to_parent::<ChildControl>()) => exit,
        _ = shutdown_signal() => ChildExit::ShutdownRequested,
    };
    tracing::info!(?exit, "child bridge exiting");
    server.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for ctrl-c; running until the parent stops us");
        std::future::pending::<()>().await;
    }
}

fn child_log_file(username: &BridgeUsername) -> String {
    format!("bridgehost-{}.log", username.compact())
}

fn generate_username(seed: Option<&str>) -> BridgeUsername {
    match seed {
        Some(seed) => BridgeUsername::from_seed(seed),
        None => BridgeUsername::random(),
    }
}

fn describe_partitions(dir: &std::path::Path) -> Result<Vec<String>> {
    let partitions = AccessoryCache::partitions(dir)?;
    if partitions.is_empty() {
        return Ok(vec![format!("No cached accessories in {}.", dir.display())]);
    }

    let mut lines = Vec::new();
    for partition in partitions {
        let records = match partition.peek() {
            Ok(records) => records,
            Err(e) => {
                lines.push(format!("{} (unreadable: {e})", partition.path().display()));
                continue;
            }
        };
        lines.push(format!(
            "{} ({} accessories)",
            partition.path().display(),
            records.len()
        ));
        lines.extend(records.iter().map(describe_record));
    }
    Ok(lines)
}

fn describe_record(record: &SerializedPlatformAccessory) -> String {
    let owner = match (&record.plugin, &record.platform) {
        (Some(plugin), Some(platform)) => format!("{plugin}.{platform}"),
        (Some(plugin), None) => plugin.to_string(),
        _ => "unassociated".to_string(),
    };
    format!(
        "  - {} [{}] {}",
        record.accessory.display_name, record.accessory.uuid, owner
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridgehost_accessory::{AccessoryRegistry, PlatformAccessory};
    use bridgehost_core::PluginIdentifier;
    use tempfile::tempdir;

    #[test]
    fn run_is_the_default_command() {
        let cli = Cli::try_parse_from(["bridgehost"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.storage_path.is_none());
    }

    #[test]
    fn child_command_matches_launcher_arguments() {
        let cli = Cli::try_parse_from([
            "bridgehost",
            "--storage-path",
            "/var/lib/bridgehost",
            "child",
            "--username",
            "0E:80:9C:B4:E4:C5",
        ])
        .unwrap();
        assert_eq!(cli.storage_path, Some(PathBuf::from("/var/lib/bridgehost")));
        match cli.command {
            Some(Command::Child { username }) => assert_eq!(username.as_str(), "0E:80:9C:B4:E4:C5"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn child_command_rejects_malformed_username() {
        let err = Cli::try_parse_from(["bridgehost", "child", "--username", "not-a-mac"]);
        assert!(err.is_err());
    }

    #[test]
    fn seeded_usernames_are_stable() {
        assert_eq!(
            generate_username(Some("living room")),
            generate_username(Some("living room"))
        );
        assert_ne!(
            generate_username(Some("living room")),
            generate_username(Some("garage"))
        );
    }

    #[test]
    fn child_log_files_are_per_bridge() {
        let username = BridgeUsername::parse("0E:80:9C:B4:E4:C5").unwrap();
        assert_eq!(child_log_file(&username), "bridgehost-0E809CB4E4C5.log");
    }

    #[test]
    fn empty_cache_directory_is_reported() {
        let dir = tempdir().unwrap();
        let lines = describe_partitions(dir.path()).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("No cached accessories"));
    }

    #[test]
    fn cached_accessories_are_listed_with_owner() {
        let dir = tempdir().unwrap();
        let factory = Arc::new(LocalAccessoryFactory);
        let mut registry =
            AccessoryRegistry::new(AccessoryCache::main_bridge(dir.path()), factory.clone());
        let lamp = PlatformAccessory::new(
            factory.as_ref(),
            "Lamp",
            "0ab1c6a1-3b4d-5e8f-9a0b-1c2d3e4f5a6b",
            None,
        )
        .unwrap();
        let plugin = PluginIdentifier::parse("homebridge-dummy").unwrap();
        registry.register(&plugin, "DummyPlatform", vec![lamp]).unwrap();

        let lines = describe_partitions(dir.path()).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("(1 accessories)"));
        assert_eq!(
            lines[1],
            "  - Lamp [0ab1c6a1-3b4d-5e8f-9a0b-1c2d3e4f5a6b] homebridge-dummy.DummyPlatform"
        );
    }

    #[test]
    fn corrupt_partition_is_reported_and_left_alone() {
        let dir = tempdir().unwrap();
        let factory = Arc::new(LocalAccessoryFactory);
        let username = BridgeUsername::parse("0E:80:9C:B4:E4:C5").unwrap();
        let child = AccessoryCache::child_bridge(dir.path(), &username);
        let mut registry = AccessoryRegistry::new(child, factory.clone());
        let lamp = PlatformAccessory::new(
            factory.as_ref(),
            "Lamp",
            "0ab1c6a1-3b4d-5e8f-9a0b-1c2d3e4f5a6b",
            None,
        )
        .unwrap();
        let plugin = PluginIdentifier::parse("homebridge-dummy").unwrap();
        registry.register(&plugin, "DummyPlatform", vec![lamp]).unwrap();

        let main = dir.path().join("cachedAccessories");
        std::fs::write(&main, "{ not json").unwrap();

        let lines = describe_partitions(dir.path()).unwrap();
        assert!(lines
            .iter()
            .any(|line| line.starts_with(&main.display().to_string()) && line.contains("unreadable")));
        assert!(lines.iter().any(|line| line.contains("homebridge-dummy.DummyPlatform")));

        assert_eq!(std::fs::read_to_string(&main).unwrap(), "{ not json");
        assert!(!dir.path().join("cachedAccessories.corrupt").exists());
    }
}
