//! `panappticon` - CLI for the capture agent
//!
//! This binary runs the agent in the foreground and offers a few commands to
//! inspect its configuration and captured data.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

#[cfg(target_os = "macos")]
mod macos;

use std::fs;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::json;

use panappticon::cli::{Cli, Command, ConfigCommand, RecentCommand, RunCommand};
use panappticon::config::parse_config;
use panappticon::storage::Table;
use panappticon::volume::{Hdiutil, VolumeBackend};
use panappticon::{init_logging, CaptureKind, Config, ConfigStore, EncryptedStore, KeyboardShortcut};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Execute the command
    match &cli.command {
        Command::Run(run_cmd) => handle_run(&cli, run_cmd),
        Command::Status(status_cmd) => handle_status(&cli, status_cmd.json),
        Command::Recent(recent_cmd) => handle_recent(&cli, recent_cmd),
        Command::Config(config_cmd) => handle_config(&cli, config_cmd),
        Command::Shortcut(shortcut_cmd) => handle_shortcut(&shortcut_cmd.text),
    }
}

/// Configuration for the inspection commands, without creating the file.
fn inspect_config(cli: &Cli) -> Config {
    ConfigStore::read_only(cli.config_path(), Config::default_app_dir()).current()
}

#[cfg(target_os = "macos")]
fn handle_run(cli: &Cli, cmd: &RunCommand) -> anyhow::Result<()> {
    use std::time::Duration;

    use panappticon::platform::{obtain_passphrase, TerminalPrompt};

    let passphrase = obtain_passphrase(&macos::KeychainKeys, &TerminalPrompt)
        .context("No database passphrase available")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let config_path = cli.config_path();
    let collect = cmd.collect;
    let agent = std::thread::Builder::new()
        .name("panappticon-agent".to_string())
        .spawn(move || {
            let result = runtime.block_on(agent::run(config_path, passphrase, collect));
            // The console reader may still be parked on stdin.
            runtime.shutdown_timeout(Duration::from_millis(200));
            result
        })
        .context("Failed to start agent thread")?;

    // AppKit state such as the frontmost application only refreshes while
    // the main run loop runs.
    panappticon_mac::run_main_loop_until(Duration::from_millis(250), || agent.is_finished());
    match agent.join() {
        Ok(result) => result,
        Err(_) => bail!("agent thread panicked"),
    }
}

#[cfg(not(target_os = "macos"))]
fn handle_run(_cli: &Cli, _cmd: &RunCommand) -> anyhow::Result<()> {
    bail!("the capture agent only runs on macOS")
}

#[cfg(target_os = "macos")]
mod agent {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Context;
    use tokio::sync::mpsc;
    use tracing::{info, warn};

    use panappticon::app::{run_control_loop, spawn_console, AppContext, Collector, ControlCommand};
    use panappticon::capture::{spawn_recorder, RecordSink};
    use panappticon::hotkey::HotkeyWatcher;
    use panappticon::keystroke::KeystrokeCapture;
    use panappticon::media::{HelperCommand, MediaCapture, MediaCaptureConfig};
    use panappticon::screenshot::ScreenshotCapture;
    use panappticon::volume::Hdiutil;
    use panappticon::{Config, ConfigStore};
    use panappticon_mac::media_helper;

    use crate::macos;

    /// How long buffered records get to reach the database at exit.
    const RECORDER_DRAIN: Duration = Duration::from_secs(5);

    pub async fn run(
        config_path: PathBuf,
        passphrase: String,
        collect_now: bool,
    ) -> anyhow::Result<()> {
        let config = Arc::new(
            ConfigStore::open(&config_path, Config::default_app_dir())
                .context("Failed to open configuration")?,
        );
        let context = AppContext::initialize(Arc::clone(&config), &passphrase, Box::new(Hdiutil))
            .context("Failed to open encrypted storage")?;
        drop(passphrase);

        let (sink, records) = RecordSink::channel();
        let recorder = spawn_recorder(Arc::clone(&context.store), records);

        let apps = macos::foreground_app();
        let mut collector = Collector::new(
            Arc::clone(&config),
            Arc::new(macos::AccessibilityGate),
            sink,
        );
        collector.add_source(Box::new(KeystrokeCapture::new(
            macos::key_tap(),
            Arc::clone(&apps),
        )));
        match media_helper::install_script(&Config::default_app_dir()) {
            Ok(script) => collector.add_source(Box::new(MediaCapture::new(
                HelperCommand::new(media_helper::SWIFT, [script.display().to_string()]),
                MediaCaptureConfig::default(),
            ))),
            Err(e) => warn!(error = %e, "Media helper unavailable, media capture disabled"),
        }
        collector.add_source(Box::new(ScreenshotCapture::new(
            Arc::new(macos::MacDisplays),
            apps,
            Arc::clone(&context.volume),
        )));

        let (commands, control) = mpsc::unbounded_channel();
        let mut hotkey = HotkeyWatcher::new(macos::key_tap(), Arc::clone(&config));
        if let Err(e) = hotkey.install(commands.clone()) {
            warn!(error = %e, "Toggle hotkey unavailable");
        }
        let console = spawn_console(commands.clone());
        if collect_now {
            let _ = commands.send(ControlCommand::Toggle);
        }
        drop(commands);

        info!(
            shortcut = %config.current().toggle_shortcut,
            "Ready. Press the shortcut or type `toggle` to collect, `quit` to exit"
        );

        let collector = run_control_loop(collector, control).await;
        hotkey.remove();
        console.abort();
        drop(collector);

        if tokio::time::timeout(RECORDER_DRAIN, recorder).await.is_err() {
            warn!("Recorder did not drain in time");
        }
        context.shutdown();
        info!("Stopped");
        Ok(())
    }
}

fn handle_status(cli: &Cli, json: bool) -> anyhow::Result<()> {
    let config = inspect_config(cli);
    let config_path = cli.config_path();
    let mount_point = config.mount_point();
    let mounted = Hdiutil.is_mounted(&mount_point);

    if json {
        let status = json!({
            "config_path": config_path,
            "data_path": config.data_path,
            "database_path": config.database_path(),
            "database_exists": config.database_path().exists(),
            "volume_image": config.volume_image_path(),
            "volume_image_exists": config.volume_image_path().exists(),
            "mount_point": mount_point,
            "volume_mounted": mounted,
            "toggle_shortcut": config.toggle_shortcut.to_config_string(),
            "collect_keystrokes": config.collect_keystrokes,
            "collect_screenshots": config.collect_screenshots,
            "collect_media": config.collect_media,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("panappticon status");
        println!("------------------");
        println!("Config:        {}", config_path.display());
        println!("Data:          {}", config.data_path.display());
        println!(
            "Database:      {}{}",
            config.database_path().display(),
            missing_marker(config.database_path().exists())
        );
        println!(
            "Volume image:  {}{}",
            config.volume_image_path().display(),
            missing_marker(config.volume_image_path().exists())
        );
        println!(
            "Mount point:   {} ({})",
            mount_point.display(),
            if mounted { "mounted" } else { "not mounted" }
        );
        println!("Shortcut:      {}", config.toggle_shortcut);
        println!(
            "Collect:       keystrokes={} screenshots={} media={}",
            config.collect_keystrokes, config.collect_screenshots, config.collect_media
        );
        #[cfg(target_os = "macos")]
        for permission in panappticon_mac::permissions::check_permissions() {
            println!("Permission:    {}", permission.description);
        }
    }
    Ok(())
}

fn missing_marker(exists: bool) -> &'static str {
    if exists {
        ""
    } else {
        " (missing)"
    }
}

#[cfg(target_os = "macos")]
fn stored_passphrase() -> anyhow::Result<String> {
    use panappticon::platform::KeyProvider;

    macos::KeychainKeys
        .get_passphrase()
        .context("No database passphrase in the keychain; run `panappticon run` first")
}

#[cfg(not(target_os = "macos"))]
fn stored_passphrase() -> anyhow::Result<String> {
    bail!("the database passphrase is kept in the macOS keychain")
}

fn handle_recent(cli: &Cli, cmd: &RecentCommand) -> anyhow::Result<()> {
    let config = inspect_config(cli);
    let path = config.database_path();
    if !path.exists() {
        bail!("no database at {}", path.display());
    }
    let store = EncryptedStore::open(&path, &stored_passphrase()?)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let kind = CaptureKind::from(cmd.kind);
    let lines: Vec<String> = match kind {
        CaptureKind::Keystrokes => {
            let rows = store.recent_keystrokes(cmd.limit)?;
            if cmd.json {
                return print_json(&rows);
            }
            rows.iter()
                .map(|r| format!("{}  [{}]  {}", r.timestamp, r.application, r.keystroke))
                .collect()
        }
        CaptureKind::Media => {
            let rows = store.recent_media(cmd.limit)?;
            if cmd.json {
                return print_json(&rows);
            }
            rows.iter()
                .map(|r| {
                    format!(
                        "{}  \"{}\" by {} on {} [{}]",
                        r.timestamp, r.title, r.artist, r.album, r.source_app
                    )
                })
                .collect()
        }
        CaptureKind::Screenshots => {
            let rows = store.recent_screenshots(cmd.limit)?;
            if cmd.json {
                return print_json(&rows);
            }
            rows.iter()
                .map(|r| {
                    format!(
                        "{}  {}  display {}  [{}]",
                        r.timestamp, r.filename, r.display_index, r.active_app
                    )
                })
                .collect()
        }
    };

    let total = store.count(Table::from(kind))?;
    println!("{kind}: {} of {total} rows", lines.len());
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(rows: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(rows)?);
    Ok(())
}

fn handle_config(cli: &Cli, cmd: &ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            let config = inspect_config(cli);
            if *json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("  Toggle shortcut:     {}", config.toggle_shortcut.to_config_string());
                println!("  Collect keystrokes:  {}", config.collect_keystrokes);
                println!("  Collect screenshots: {}", config.collect_screenshots);
                println!("  Collect media:       {}", config.collect_media);
                println!("  Data path:           {}", config.data_path.display());
            }
        }
        ConfigCommand::Path => {
            println!("{}", cli.config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.clone().unwrap_or_else(|| cli.config_path());
            println!("Validating configuration: {}", path.display());
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let (_, problems) = parse_config(&contents, Config::default());
            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                for problem in &problems {
                    println!("Configuration error: {problem}");
                }
                bail!("{} problem(s) in {}", problems.len(), path.display());
            }
        }
    }
    Ok(())
}

fn handle_shortcut(text: &str) -> anyhow::Result<()> {
    let Some(shortcut) = KeyboardShortcut::parse(text) else {
        bail!("'{text}' is not a valid shortcut; use at least one modifier and one key");
    };
    println!("{}  ({})", shortcut.format(), shortcut.to_config_string());
    Ok(())
}
