//! Tracing subscriber setup for binaries embedding the library.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is not set, by verbosity flag count
fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "bufr=info",
        1 => "bufr=debug",
        _ => "bufr=trace",
    }
}

/// Install a global fmt subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over `verbosity`. Calling this twice is harmless.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_directives() {
        assert_eq!(default_directive(0), "bufr=info");
        assert_eq!(default_directive(1), "bufr=debug");
        assert_eq!(default_directive(5), "bufr=trace");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(0);
        init(2);
    }
}
