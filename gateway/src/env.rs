use std::io;

use dotenvy::dotenv;
use tracing::{debug, warn};

/// Loads `GATEWAY_*` prover options (and anything else) from a local `.env`,
/// without overriding variables that are already set. A missing or
/// unreadable file is ignored; a malformed one is reported and skipped.
pub fn load_dotenvy_vars_if_present() {
    match dotenv() {
        Ok(path) => debug!(path = %path.display(), "loaded .env"),
        Err(dotenvy::Error::Io(io::Error { .. })) => (),
        Err(e) => warn!("found a local `.env` file but could not parse it: {e}"),
    }
}
