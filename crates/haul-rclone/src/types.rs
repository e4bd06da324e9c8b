//! Wire payloads of the rc API.

use serde::Deserialize;

/// `{"jobid": N}` returned by `_async` calls.
#[derive(Debug, Deserialize)]
pub(crate) struct JobCreated {
    pub(crate) jobid: u64,
}

/// `job/status` response.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct JobStatusBody {
    pub(crate) finished: bool,
    pub(crate) success: bool,
    pub(crate) error: String,
}

/// `core/stats` response, filtered to a job group.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct StatsBody {
    pub(crate) bytes: u64,
    pub(crate) total_bytes: u64,
    pub(crate) speed: f64,
}

impl StatsBody {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub(crate) fn speed_bytes(&self) -> u64 {
        if self.speed.is_finite() && self.speed > 0.0 {
            self.speed as u64
        } else {
            0
        }
    }
}

/// Error envelope returned with non-2xx statuses.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub(crate) error: String,
}
