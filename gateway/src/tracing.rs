//! Log output for the `gateway` binary.
//!
//! Logs go to stderr so that `gateway prove` can write its JSON result to
//! stdout and stay pipeable. `RUST_LOG` selects what is logged; when it is
//! unset, everything at `info` and above is.

use tracing_subscriber::{
    filter::LevelFilter, prelude::*, util::SubscriberInitExt, EnvFilter,
};

pub fn init() {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::io::stderr)
                .with_filter(filter(&directives)),
        )
        .init();
}

fn filter(directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(directives)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_info() {
        assert_eq!(filter("").max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(
            filter("gateway=trace").max_level_hint(),
            Some(LevelFilter::TRACE)
        );
    }
}
