use anyhow::{Context as _, Result};
use debugger::{Controller, DebuggerSettings, Middleman, Vim};
use gdb_mi::{Demultiplexer, GdbLauncher};
use log::LevelFilter;
use simplelog::ConfigBuilder;
use std::{fs::OpenOptions, sync::Arc};
use util::ResultExt;
use vim_rpc::Connection;

fn main() {
    let settings = DebuggerSettings::load();
    init_logger(settings.as_ref().ok());
    let Some(settings) = settings.log_err() else {
        std::process::exit(1);
    };

    log::info!("========== starting gdbvim ==========");
    if smol::block_on(run(settings)).log_err().is_none() {
        std::process::exit(1);
    }
}

async fn run(settings: DebuggerSettings) -> Result<()> {
    let connection = Connection::new(
        smol::Unblock::new(std::io::stdin()),
        smol::Unblock::new(std::io::stdout()),
    );
    let launcher = Arc::new(GdbLauncher::new(
        settings.gdb_path.clone(),
        settings.gdb_args.clone(),
    ));
    let demux = Demultiplexer::new(launcher, settings.scheduling());
    let controller = Controller::new(Vim::new(connection), demux, settings.command_timeout());
    Middleman::new(controller).run().await
}

/// Stdout carries the editor channel, so logs always go to a file.
fn init_logger(settings: Option<&DebuggerSettings>) {
    let defaults;
    let settings = match settings {
        Some(settings) => settings,
        None => {
            defaults = DebuggerSettings::default();
            &defaults
        }
    };

    // Prevent log file from becoming too large.
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const MAX_LOG_BYTES: u64 = MIB;
    let log_path = &settings.log_file;
    if std::fs::metadata(log_path).map_or(false, |metadata| metadata.len() > MAX_LOG_BYTES) {
        let _ = std::fs::rename(log_path, log_path.with_extension("old.log"));
    }

    let config = ConfigBuilder::new()
        .set_target_level(LevelFilter::Trace)
        .set_location_level(LevelFilter::Trace)
        .set_time_format_rfc3339()
        .build();

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("could not open log file {log_path:?}"));
    let result = match log_file {
        Ok(file) => simplelog::WriteLogger::init(settings.log_level, config, file),
        Err(error) => {
            eprintln!("{error:#}");
            simplelog::WriteLogger::init(settings.log_level, config, std::io::stderr())
        }
    };
    if let Err(error) = result {
        eprintln!("could not initialize logger: {error}");
    }
}
