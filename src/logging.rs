use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize the tracing subscriber for a ComputeMesh process.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default log level based on debug/release build
        if cfg!(debug_assertions) {
            EnvFilter::new("computemesh=debug")
        } else {
            EnvFilter::new("computemesh=info")
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    info!("ComputeMesh logging initialized");
    Ok(())
}

/// Initialize logging, falling back to stderr notices if the subscriber is already set.
pub fn init_logging_safe() {
    if let Err(e) = init_logging() {
        eprintln!(
            "Warning: failed to set up structured logging: {}. Continuing without it.",
            e
        );
    }
}
