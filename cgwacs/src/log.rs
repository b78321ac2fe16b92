use tracing_subscriber::{EnvFilter, filter::LevelFilter};

/// Installs the global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Timestamps are left out unless
/// asked for, the service supervisor usually adds its own.
pub fn init(level: LevelFilter, timestamps: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if timestamps {
        builder.init();
    } else {
        builder.without_time().init();
    }
}

/// Maps the numeric `-d` verbosity (0 = trace .. 6 = off) to a level.
pub fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::TRACE,
        1 => LevelFilter::DEBUG,
        2 => LevelFilter::INFO,
        3 => LevelFilter::WARN,
        4 | 5 => LevelFilter::ERROR,
        _ => LevelFilter::OFF,
    }
}
