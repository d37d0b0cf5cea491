//! Command line surface: one-shot actions and the interactive `run` console.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::Client;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::sync::mpsc;

use crate::config::SettingsStore;
use crate::coordinator::{RestartReason, RestartRequester};
use crate::error::{AppError, Result};
use crate::launcher::{Launcher, LauncherOptions, LauncherStatus};
use crate::lock::DataRootLock;
use crate::paths::Layout;
use crate::provision::ArchiveSource;

/// Runs grocy and Barcode Buddy on a bundled PHP runtime
#[derive(Parser)]
#[command(name = "grocy-desktop", version, about, long_about = None)]
pub struct Cli {
    /// Use this directory instead of the resolved user data root
    #[arg(long, global = true, value_name = "DIR")]
    pub data_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start every enabled application and supervise it until quit
    Run {
        /// Require an exact port for an application, e.g. grocy=8111
        #[arg(long = "port", value_name = "APP=PORT", value_parser = parse_port_assignment)]
        ports: Vec<(String, u16)>,
    },

    #[command(flatten)]
    Action(Action),
}

/// Operations available both as subcommands and on the `run` console.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Archive an application's data directory into a zip file
    Backup { app: String, archive: PathBuf },

    /// Replace an application's data directory with a backup
    Restore { app: String, archive: PathBuf },

    /// Move an application's data directory
    Relocate { app: String, target: PathBuf },

    /// Delete an application's database so it starts empty
    Wipe { app: String },

    /// Replace an application's release from an archive path or http(s) URL
    Update { app: String, source: String },

    /// Enable or disable the Barcode Buddy integration
    SetIntegration {
        #[arg(action = clap::ArgAction::Set, value_parser = clap::builder::BoolishValueParser::new())]
        enabled: bool,
    },

    /// Allow or forbid access from other machines
    SetExternalAccess {
        #[arg(action = clap::ArgAction::Set, value_parser = clap::builder::BoolishValueParser::new())]
        enabled: bool,
    },

    /// Set an application's preferred port, 0 for any
    SetPort { app: String, port: u16 },
}

/// A line typed on the `run` console.
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_version_flag = true)]
struct ConsoleLine {
    #[command(subcommand)]
    command: ConsoleCommand,
}

#[derive(Subcommand, Debug)]
enum ConsoleCommand {
    /// Print the state of every application as JSON
    Status,
    /// Print captured console output of an application
    Output { app: String },
    /// Stop everything and start again with reloaded settings
    Restart,
    /// Stop everything and exit
    Quit,
    #[command(flatten)]
    Action(Action),
}

fn parse_port_assignment(input: &str) -> std::result::Result<(String, u16), String> {
    let (app, port) = input
        .split_once('=')
        .ok_or_else(|| format!("expected APP=PORT, got {input:?}"))?;
    let port: u16 = port
        .parse()
        .map_err(|e| format!("invalid port {port:?}: {e}"))?;
    if port == 0 {
        return Err("port must be greater than 0".to_string());
    }
    Ok((app.to_string(), port))
}

/// Sends restart requests to the `run` loop.
struct ChannelRestarts(mpsc::UnboundedSender<RestartReason>);

impl RestartRequester for ChannelRestarts {
    fn request_restart(&self, reason: RestartReason) {
        if self.0.send(reason).is_err() {
            log::warn!("Run loop is gone, restart request dropped");
        }
    }
}

/// One-shot commands have nothing running to restart.
struct DeferredRestarts;

impl RestartRequester for DeferredRestarts {
    fn request_restart(&self, reason: RestartReason) {
        log::info!("{}; takes effect the next time grocy-desktop runs", reason);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Restart,
    Quit,
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path)
        .map_err(|e| AppError::io(format!("Failed to resolve {}: {e}", path.display())))
}

pub async fn dispatch(cli: Cli) -> Result<()> {
    let data_root = cli.data_root.as_deref().map(absolute).transpose()?;
    let layout = Layout::discover(data_root)?;
    layout.ensure_data_root()?;
    log::info!("Data root: {}", layout.data_root().display());
    // A `run` in another process owns the servers this process cannot see.
    let lock = DataRootLock::acquire(&layout.lock_path())?;
    log::debug!("Holding {}", lock.path().display());

    let client = Client::builder()
        .timeout(Duration::from_secs(600))
        .build()?;

    match cli.command {
        Command::Run { ports } => {
            let options = LauncherOptions {
                required_ports: ports.into_iter().collect(),
                ..LauncherOptions::default()
            };
            run_interactive(&layout, &client, &options).await
        }
        Command::Action(action) => {
            let settings = Arc::new(SettingsStore::load(layout.settings_path())?);
            let mut launcher = Launcher::new(
                layout,
                settings,
                Arc::new(DeferredRestarts),
                client,
                LauncherOptions::default(),
            );
            let message = execute(&mut launcher, action).await?;
            println!("{message}");
            Ok(())
        }
    }
}

/// Start the launcher, serve console commands and rebuild it on every restart request.
async fn run_interactive(layout: &Layout, client: &Client, options: &LauncherOptions) -> Result<()> {
    let (tx, mut restarts) = mpsc::unbounded_channel();
    let requester: Arc<dyn RestartRequester> = Arc::new(ChannelRestarts(tx));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        let settings = Arc::new(SettingsStore::load(layout.settings_path())?);
        let mut launcher = Launcher::new(
            layout.clone(),
            settings,
            Arc::clone(&requester),
            client.clone(),
            options.clone(),
        );

        if let Err(e) = launcher.start().await {
            if let Err(stop_err) = launcher.shutdown().await {
                log::warn!("Shutdown after failed start: {}", stop_err);
            }
            return Err(e);
        }
        print_summary(&launcher.snapshot());

        let next = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break Next::Quit,
                Some(reason) = restarts.recv() => {
                    log::info!("Restarting: {}", reason);
                    break Next::Restart;
                }
                line = lines.next_line(), if stdin_open => match line {
                    Ok(Some(line)) => {
                        if let Some(next) = handle_console_line(&mut launcher, &line).await {
                            break next;
                        }
                    }
                    Ok(None) => {
                        log::info!("Console closed, press Ctrl-C to stop");
                        stdin_open = false;
                    }
                    Err(e) => {
                        log::warn!("Failed to read console input: {}", e);
                        stdin_open = false;
                    }
                },
            }
        };

        if let Err(e) = launcher.shutdown().await {
            log::error!("Shutdown incomplete: {}", e);
        }
        // Requests queued during shutdown are covered by this restart.
        while restarts.try_recv().is_ok() {}

        if next == Next::Quit {
            log::info!("Bye");
            return Ok(());
        }
    }
}

async fn handle_console_line(launcher: &mut Launcher, line: &str) -> Option<Next> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() {
        return None;
    }

    let parsed = match ConsoleLine::try_parse_from(words) {
        Ok(parsed) => parsed,
        Err(e) => {
            println!("{e}");
            return None;
        }
    };

    match parsed.command {
        ConsoleCommand::Status => match serde_json::to_string_pretty(&launcher.snapshot()) {
            Ok(json) => println!("{json}"),
            Err(e) => log::error!("Failed to render status: {}", e),
        },
        ConsoleCommand::Output { app } => match launcher.output(&app) {
            Ok(outputs) => {
                for (label, lines) in outputs {
                    println!("== {label} ==");
                    for line in lines {
                        println!("{} {:?} {}", line.at.format("%H:%M:%S"), line.stream, line.text);
                    }
                }
            }
            Err(e) => println!("{e}"),
        },
        ConsoleCommand::Restart => {
            launcher.request_restart(RestartReason::UserRequested);
        }
        ConsoleCommand::Quit => return Some(Next::Quit),
        ConsoleCommand::Action(action) => match execute(launcher, action).await {
            Ok(message) => println!("{message}"),
            Err(e) => println!("Failed: {e}"),
        },
    }
    None
}

/// Run one action and describe the outcome.
pub async fn execute(launcher: &mut Launcher, action: Action) -> Result<String> {
    match action {
        Action::Backup { app, archive } => {
            let archive = absolute(&archive)?;
            launcher.backup(&app, &archive).await?;
            Ok(format!("Backed up {app} to {}", archive.display()))
        }
        Action::Restore { app, archive } => {
            let archive = absolute(&archive)?;
            launcher.restore(&app, &archive).await?;
            Ok(format!("Restored {app} from {}", archive.display()))
        }
        Action::Relocate { app, target } => {
            let target = absolute(&target)?;
            launcher.relocate(&app, &target).await?;
            Ok(format!("Moved {app} data to {}", target.display()))
        }
        Action::Wipe { app } => {
            launcher.wipe(&app).await?;
            Ok(format!("Deleted the {app} database"))
        }
        Action::Update { app, source } => {
            let source = match ArchiveSource::parse(&source) {
                ArchiveSource::File(path) => ArchiveSource::File(absolute(&path)?),
                url => url,
            };
            launcher.update_release(&app, &source).await?;
            Ok(format!("Updated the {app} release"))
        }
        Action::SetIntegration { enabled } => {
            launcher.set_integration_enabled(enabled)?;
            Ok(format!("Barcode Buddy integration {}", on_off(enabled)))
        }
        Action::SetExternalAccess { enabled } => {
            launcher.set_external_access_enabled(enabled)?;
            Ok(format!("External access {}", on_off(enabled)))
        }
        Action::SetPort { app, port } => {
            launcher.set_desired_port(&app, port)?;
            Ok(format!("Preferred port of {app} set to {port}"))
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

fn print_summary(status: &LauncherStatus) {
    for app in &status.apps {
        match (&app.urls, &app.error) {
            (Some(urls), _) => {
                println!("{} is running at {}", app.display_name, urls.loopback);
                for url in urls.hostname.iter().chain(urls.lan_ip.iter()) {
                    println!("{} is reachable at {}", app.display_name, url);
                }
            }
            (None, Some(error)) => println!("{} failed: {}", app.display_name, error),
            (None, None) if !app.enabled => println!("{} is disabled", app.display_name),
            (None, None) => println!("{} is not running", app.display_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn console(line: &str) -> ConsoleCommand {
        ConsoleLine::try_parse_from(line.split_whitespace())
            .unwrap()
            .command
    }

    #[test]
    fn port_assignments() {
        assert_eq!(
            parse_port_assignment("grocy=8111").unwrap(),
            ("grocy".to_string(), 8111)
        );
        assert!(parse_port_assignment("grocy").is_err());
        assert!(parse_port_assignment("grocy=0").is_err());
        assert!(parse_port_assignment("grocy=70000").is_err());
    }

    #[test]
    fn console_accepts_shared_actions() {
        assert!(matches!(console("status"), ConsoleCommand::Status));
        assert!(matches!(console("quit"), ConsoleCommand::Quit));
        assert!(matches!(
            console("set-integration on"),
            ConsoleCommand::Action(Action::SetIntegration { enabled: true })
        ));
        assert!(matches!(
            console("backup grocy /tmp/grocy.zip"),
            ConsoleCommand::Action(Action::Backup { ref app, ref archive })
                if app == "grocy" && archive == Path::new("/tmp/grocy.zip")
        ));
        assert!(ConsoleLine::try_parse_from(["launch"]).is_err());
    }

    #[test]
    fn cli_parses_run_and_actions() {
        let cli = Cli::try_parse_from([
            "grocy-desktop",
            "--data-root",
            "/srv/grocy",
            "run",
            "--port",
            "grocy=8111",
        ])
        .unwrap();
        assert_eq!(cli.data_root, Some(PathBuf::from("/srv/grocy")));
        assert!(matches!(
            cli.command,
            Command::Run { ref ports } if *ports == [("grocy".to_string(), 8111)]
        ));

        let cli = Cli::try_parse_from(["grocy-desktop", "wipe", "barcodebuddy"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Action(Action::Wipe { ref app }) if app == "barcodebuddy"
        ));
    }

    #[tokio::test]
    async fn one_shot_action_is_rejected_while_run_holds_the_lock() {
        let root = tempfile::tempdir().unwrap();
        let grocy = root.path().join("grocy");
        std::fs::create_dir_all(&grocy).unwrap();
        std::fs::write(grocy.join("grocy.db"), b"live").unwrap();
        let running = DataRootLock::acquire(&root.path().join("grocy-desktop.lock")).unwrap();

        let args: Vec<std::ffi::OsString> = vec![
            "grocy-desktop".into(),
            "--data-root".into(),
            root.path().into(),
            "wipe".into(),
            "grocy".into(),
        ];
        let cli = Cli::try_parse_from(args).unwrap();
        let err = dispatch(cli).await.unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::OperationInProgress);
        assert_eq!(std::fs::read(grocy.join("grocy.db")).unwrap(), b"live");
        drop(running);
    }
}
