use crate::Result;

/// Initialize logging/tracing for a bot process.
///
/// Without the `fmt` feature this is a no-op and events go to whatever
/// subscriber the embedding application installs.
pub fn init(service_name: &str) -> Result<()> {
    let _ = service_name;

    #[cfg(feature = "fmt")]
    {
        use tracing_subscriber::{fmt, EnvFilter};

        // Default: info for our crates, warn for everything else.
        // Can be overridden with `RUST_LOG`.
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "warn,parley=info,parley_core=info,parley_http=info,{service_name}=info"
            ))
        });

        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
            .map_err(|e| crate::Error::Config(format!("logging init failed: {e}")))?;
    }

    Ok(())
}
