use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs a global subscriber printing engine events to stderr.
///
/// The filter is read from `RUST_LOG` and defaults to `info`, so per-node
/// outcomes of the [`LoggingListener`](crate::LoggingListener) show up while
/// worker and lock chatter stays hidden.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true),
        )
        .try_init()?;

    Ok(())
}
