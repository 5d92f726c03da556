use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Target used for authentication events so they can be filtered separately.
pub const AUTH_TARGET: &str = "auth";

/// Install the process-wide subscriber.
///
/// Every event goes to stdout; WARN and ERROR events (failed dials, failed
/// hijacks, rejected credentials) are written to stderr as well.
pub fn init() -> color_eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fwdproxy=info,auth=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(std::io::stderr.with_max_level(Level::WARN)),
        )
        .try_init()?;

    Ok(())
}
