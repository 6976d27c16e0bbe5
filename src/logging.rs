use tracing_subscriber::EnvFilter;

/// Debug log on the media channel. Enable with `RUST_LOG=podium::media=debug`.
#[macro_export]
macro_rules! dlog {
    ($($arg:tt)*) => {
        ::tracing::debug!(target: "podium::media", $($arg)*)
    };
}

/// Installs the global subscriber. `RUST_LOG` selects levels (default
/// `info`); `PODIUM_LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PODIUM_LOG_FORMAT").is_ok_and(|format| format == "json");

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing already initialised: {e}");
    }
}
