//! # Serial Fabric - Main Entry Point
//!
//! Headless shell around the connection fabric. The binary:
//!
//! 1. **Initializes logging**: colored user-facing output on stdout plus a
//!    detailed file (or stderr) log, verbosity from `-v` flags
//! 2. **Loads settings**: schema-validated JSON with migration and a
//!    reset-on-start notice when a corrupt file was replaced
//! 3. **Builds the core**: event bus, connection controller, UI dispatcher
//!    (here: a stdout consumer), optional data logger
//! 4. **Opens ports** from `--port` specs and performs the requested
//!    actions (send, broadcast, file transfer, capture)
//! 5. **Runs** until Ctrl-C or the `--listen` deadline, then closes all
//!    connections gracefully under a bounded shutdown

use anyhow::{Context, Result};
use clap::Parser;
use serial_fabric::cli::{parse_port_spec, Args};
use serial_fabric::{
    command, defaults, ConnectionController, DataLogger, DataLoggerConfig, EventBus,
    FileTransferEngine, GlobalErrorHandler, LogFormat, SettingsStore, UiDispatcher,
};
use std::sync::Arc;
use tracing::{error, info, warn};

mod logging;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Console + diagnostic streams; the guard keeps the file appender
    // flushing until the process ends.
    let _log_guard = logging::init(args.verbose, args.quiet, args.log_file.as_deref());

    // Faults from any worker end up in one sink instead of killing the
    // process.
    let faults = GlobalErrorHandler::install();
    faults.install_panic_hook();

    let bus = Arc::new(EventBus::new());
    bus.set_debug_trace(args.debug_bus);

    // Settings: per-user config dir unless overridden.
    let settings_path = args
        .config
        .clone()
        .unwrap_or_else(SettingsStore::default_path);
    let store = SettingsStore::load(settings_path, Some(Arc::clone(&bus)));
    if store.reset_on_start() {
        warn!(
            "settings were invalid and have been reset to defaults (backup kept next to {})",
            store.path().display()
        );
    }
    let settings = store.get();

    let controller = ConnectionController::new(Arc::clone(&bus), Some(Arc::clone(&faults)));

    // The dispatcher is the single fast-path consumer; in this shell it
    // relays received data to stdout in 30 ms batches.
    let dispatcher = UiDispatcher::start();
    let quiet = args.quiet;
    dispatcher.set_consumer(move |batch| {
        if quiet {
            return;
        }
        let text = String::from_utf8_lossy(&batch.concat()).into_owned();
        info!("[{}] {}", batch.port_id, text.trim_end());
    });
    controller.set_fast_path_sink(dispatcher.sink());

    // Optional traffic capture.
    let _capture = match args.capture.as_deref() {
        Some(format) => {
            let format = match format {
                "hex" => LogFormat::HexDump,
                "pcap" => LogFormat::Pcap,
                _ => LogFormat::Raw,
            };
            let logger_config = DataLoggerConfig {
                dir: settings.logging.log_dir.clone(),
                format,
                max_file_bytes: settings.logging.max_file_bytes,
                keep_files: settings.logging.keep_files,
                include_tx: true,
            };
            let logger = DataLogger::start(Arc::clone(&bus), logger_config)
                .context("starting data logger")?;
            info!("capturing traffic to {}", logger.current_path().display());
            Some(logger)
        }
        None => None,
    };

    if args.ports.is_empty() {
        warn!("no ports requested; use --port to open one");
    }

    // Open requested ports.
    let mut opened = Vec::new();
    for spec in &args.ports {
        let (port_id, baud) = parse_port_spec(spec, settings.serial.default_baudrate);
        let mut config = settings.port_config(&port_id);
        config.baud_rate = baud;
        config.read_timeout_ms = defaults::READ_TIMEOUT.as_millis() as u64;
        if let Some(parser) = &args.parser {
            let mut parser_settings = settings.parser.clone();
            parser_settings.parser_type = parser.clone();
            config.parser = parser_settings.selection();
        }
        match controller.open(config).await {
            Ok(()) => opened.push(port_id),
            Err(err) => error!("could not open {port_id}: {err}"),
        }
    }
    if let Some(first) = opened.first() {
        controller.set_current(Some(first.clone()));
    }

    // One-shot send.
    if let Some(text) = &args.send {
        let wire = command::format(
            text,
            args.hex,
            true,
            true,
            &settings.command.prefix,
            &settings.command.suffix,
        )
        .context("composing --send command")?;
        let wire = bytes::Bytes::from(wire);
        if args.broadcast {
            for (port_id, ok) in controller.broadcast(&wire) {
                if !ok {
                    warn!("broadcast to {port_id} failed");
                }
            }
        } else if let Some(port_id) = controller.current() {
            controller
                .send(&port_id, wire)
                .with_context(|| format!("sending to {port_id}"))?;
        } else {
            warn!("--send given but no port is open");
        }
    }

    // File transfer to the current port.
    if let Some(path) = &args.send_file {
        match controller.current() {
            Some(port_id) => {
                let engine =
                    FileTransferEngine::new(Arc::clone(&controller), Arc::clone(&bus));
                engine
                    .send_file(&port_id, path)
                    .await
                    .with_context(|| format!("transferring {}", path.display()))?;
                info!("transfer of {} started on {port_id}", path.display());
            }
            None => warn!("--send-file given but no port is open"),
        }
    }

    // Run until the deadline or Ctrl-C.
    match args.listen {
        Some(deadline) => {
            info!("listening for {deadline:?}");
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {}
                _ = tokio::signal::ctrl_c() => info!("interrupted"),
            }
        }
        None if !opened.is_empty() => {
            info!("running; press Ctrl-C to exit");
            let _ = tokio::signal::ctrl_c().await;
        }
        None => {}
    }

    dispatcher.drain();
    controller.shutdown(defaults::SHUTDOWN_GRACE).await;
    info!("all connections closed");
    Ok(())
}
