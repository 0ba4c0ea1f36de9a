use std::{collections::BTreeSet, process, sync::Arc};

use blazebee_pal::{
    config::Config,
    core::{
        enumerations::registry::{DynEnumeration, EnumerationContext, EnumerationRegistry},
        executor::{Executor, StdoutPublisher},
        log::LogRegistry,
    },
    logger::LoggerManager,
    print_error,
};
use tracing::{debug, error, info, warn};

fn log_enumerations_table(enabled: &[&str], available: &[&'static str]) {
    let enabled_set: BTreeSet<&str> = enabled.iter().copied().collect();
    let available_set: BTreeSet<&str> = available.iter().copied().collect();
    let all_names: BTreeSet<&str> = enabled_set.union(&available_set).copied().collect();

    let name_width = all_names
        .iter()
        .map(|s| s.len())
        .max()
        .unwrap_or(0)
        .max("Enumeration".len());

    info!("{:<width$} | Status", "Enumeration", width = name_width);
    info!("{}-+-{}", "-".repeat(name_width), "-".repeat(17));

    for name in all_names {
        let status = match (enabled_set.contains(name), available_set.contains(name)) {
            (true, true) => "ENABLED",
            (true, false) => "ENABLED (missing)",
            (false, true) => "DISABLED",
            (false, false) => "UNKNOWN",
        };
        info!("{:<width$} | {}", name, status, width = name_width);
    }
}

#[tokio::main]
async fn main() {
    let cfg = Config::new().unwrap_or_else(|e| {
        print_error!("{}", e);
        process::exit(1);
    });

    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to set up logger: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to initialize logger: {}", e);
        process::exit(1);
    });
    info!("Starting blazebee-pal version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.enumerations);

    let registry = EnumerationRegistry::new();
    let enabled = cfg.enumerations.enabled_names();
    log_enumerations_table(&enabled, &registry.list_names());

    let ctx = EnumerationContext::new(
        Arc::new(LogRegistry::new()),
        Arc::new(cfg.enumerations.clone()),
    );
    let mut enumerations: Vec<Box<dyn DynEnumeration>> = Vec::with_capacity(enabled.len());
    for name in &enabled {
        match registry.build(name, &ctx) {
            Ok(enumeration) => enumerations.push(enumeration),
            Err(e) => warn!("Skipping enumeration '{}': {}", name, e),
        }
    }

    let mut executor = Executor::new(
        Arc::new(StdoutPublisher::default()),
        &cfg.enumerations,
        enumerations,
    );
    if executor.init_all() == 0 {
        error!("No enumeration could be initialized");
        process::exit(1);
    }

    info!("Running enumerations: {}", executor.names().join(", "));

    tokio::select! {
        _ = executor.run() => {
            error!("Executor unexpectedly finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    executor.shutdown();
    info!("Shutdown complete");
}
