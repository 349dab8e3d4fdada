mod bolt;
mod config;
mod logging;
mod server;
mod shutdown;
mod wire;
mod worker;

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use config::AppConfig;
use logging::{LogChannels, LogLevel};
use serde_json::json;
use server::{serve_connection, BoltConnection, TcpServer};
use shutdown::ShutdownSignal;
use worker::{MemorySessionConnector, PoolSettings, ThreadNaming, WorkerFactory, WorkerSettings};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = load_config_or_exit();
    let logs = LogChannels::from_config(&app_config.logging).unwrap_or_else(|error| {
        eprintln!("logging configuration error: {error}");
        process::exit(2);
    });

    let server = Arc::new(TcpServer::bind(&app_config.server).unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    }));
    let bound_addr = server.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });
    logs.internal.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} accepting Bolt connections",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "connector": app_config.server.connector,
        })),
    );

    let factory = Arc::new(WorkerFactory::new(
        MemorySessionConnector::from_config(&app_config, &logs),
        WorkerSettings::from(&app_config.worker),
        PoolSettings::from(&app_config.thread_pool),
        ThreadNaming::new(format!("{}-worker", app_config.server.connector)),
        logs.clone(),
    ));
    logs.internal.log(
        LogLevel::Info,
        Some("main::worker"),
        "Worker factory initialized",
        Some(json!({
            "queue_capacity": app_config.worker.queue_capacity,
            "idle_poll_seconds": app_config.worker.idle_poll_seconds,
            "min_threads": app_config.thread_pool.min_threads,
            "max_threads": app_config.thread_pool.max_threads,
            "keep_alive_minutes": app_config.thread_pool.keep_alive_minutes,
            "auth_enabled": app_config.auth.enabled,
        })),
    );

    let shutdown_signal = ShutdownSignal::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logs.internal.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    while !shutdown_signal.is_triggered() {
        match server.try_accept() {
            Ok(Some(connection)) => spawn_connection_reader(connection, &server, &factory, &logs),
            Ok(None) => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(error) => {
                logs.internal.warn(Some("main::server"), &error.to_string());
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }

    logs.internal.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Shutdown signal received, halting session workers",
        Some(json!({
            "live_workers": factory.live_workers(),
            "open_connections": server.connection_count(),
        })),
    );
    factory.shutdown();
    server.shutdown_all_connections();
    logs.internal.info(
        Some("main::shutdown"),
        "TCP server stopped and shutdown completed",
    );
}

fn spawn_connection_reader(
    connection: BoltConnection,
    server: &Arc<TcpServer>,
    factory: &Arc<WorkerFactory<MemorySessionConnector>>,
    logs: &LogChannels,
) {
    let connection_id = connection.id();
    logs.internal.log(
        LogLevel::Debug,
        Some("main::server"),
        "Accepted TCP connection",
        Some(json!({ "connection": connection.descriptor().to_string() })),
    );

    let reader_server = Arc::clone(server);
    let reader_factory = Arc::clone(factory);
    let reader_logs = logs.clone();
    let spawned = thread::Builder::new()
        .name(format!("bolt-reader-{connection_id}"))
        .spawn(move || {
            let (descriptor, stream) = connection.into_parts();
            let closing_server = Arc::clone(&reader_server);
            let outcome = serve_connection(
                descriptor,
                stream,
                &reader_factory,
                &reader_logs,
                move || closing_server.forget(connection_id),
            );
            if let Err(error) = outcome {
                reader_logs.internal.log(
                    LogLevel::Debug,
                    Some("main::server"),
                    "Connection ended with error",
                    Some(json!({ "connection_id": connection_id, "error": error.to_string() })),
                );
            }
        });

    if let Err(error) = spawned {
        logs.internal.warn(
            Some("main::server"),
            &format!("failed to start reader for connection {connection_id}: {error}"),
        );
        server.forget(connection_id);
    }
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: bolt-runtime is intended for POSIX systems");
        process::exit(2);
    }
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;66m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const APP_DESCRIPTION: &str =
        "Bolt session workers: one request queue per connection, one thread per session.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("  b o l t - r u n t i m e{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("BOLT_RUNTIME_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
