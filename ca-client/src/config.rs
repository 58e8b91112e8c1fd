//! Configuration for the client context.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum number of counted search attempts per channel (MAXCONNTRIES).
pub const MAX_SEARCH_TRIES: u32 = 30;

/// Maximum datagram size used for search requests (MAX_UDP).
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Protocol minor version this client speaks.
pub const CA_MINOR_VERSION: u16 = 8;

/// Configuration for channel search and protocol behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Cap on the per-channel search retry counter.
    ///
    /// Reaching the cap stops the counter, never the searches.
    pub max_search_tries: u32,

    /// Largest datagram the search transport accepts, header included.
    pub max_datagram_size: usize,

    /// Minor protocol version stamped on search and claim requests.
    pub minor_version: u16,

    /// First delay of the search timer after a reset pass.
    pub search_initial_delay: Duration,

    /// Upper bound of the exponential search backoff.
    pub search_max_delay: Duration,

    /// Number of channels a single search pass may emit requests for.
    pub search_batch: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_search_tries: MAX_SEARCH_TRIES,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            minor_version: CA_MINOR_VERSION,
            search_initial_delay: Duration::from_millis(30),
            search_max_delay: Duration::from_secs(5),
            search_batch: 64,
        }
    }
}

impl ClientConfig {
    /// Set the search backoff bounds.
    pub fn with_search_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.search_initial_delay = initial;
        self.search_max_delay = max;
        self
    }

    /// Set the number of channels searched per pass.
    pub fn with_search_batch(mut self, batch: usize) -> Self {
        self.search_batch = batch;
        self
    }

    /// Set the advertised protocol minor version.
    pub fn with_minor_version(mut self, minor_version: u16) -> Self {
        self.minor_version = minor_version;
        self
    }

    /// Configuration for a quiet local subnet.
    pub fn local_network() -> Self {
        Self {
            search_initial_delay: Duration::from_millis(10),
            search_max_delay: Duration::from_secs(1),
            search_batch: 256,
            ..Self::default()
        }
    }

    /// Configuration for searches crossing slow or congested links.
    pub fn wan_network() -> Self {
        Self {
            search_initial_delay: Duration::from_millis(100),
            search_max_delay: Duration::from_secs(30),
            search_batch: 16,
            ..Self::default()
        }
    }
}
