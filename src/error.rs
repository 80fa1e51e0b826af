// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Error taxonomy for segment delivery
//
// Each variant maps to one scheduling decision in the upload worker:
// - Transient / Rejected: retried with backoff, consuming retry budget
// - PolicyPaused: rescheduled without consuming retry budget
// - Cancelled: the owning session ended, work is left for a later sweep
// - MissingBytes: the local copy is gone, the segment can never be delivered

use thiserror::Error;

pub type UploadResult<T> = std::result::Result<T, UploadError>;

#[derive(Debug, Error)]
pub enum UploadError {
    /// Timeouts, connection failures and 5xx responses
    #[error("transient network error: {0}")]
    Transient(String),

    /// Non-success status that is not a server fault
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Transfer aborted because network health made uploads inadmissible
    #[error("upload paused by network policy")]
    PolicyPaused,

    /// Transfer aborted because the session ended
    #[error("upload cancelled")]
    Cancelled,

    #[error("segment bytes for '{0}' are no longer stored locally")]
    MissingBytes(String),

    #[error("local storage error: {0}")]
    Local(#[from] anyhow::Error),
}

impl UploadError {
    /// Whether the failure should consume retry budget
    pub fn counts_as_attempt(&self) -> bool {
        matches!(
            self,
            UploadError::Transient(_) | UploadError::Rejected { .. } | UploadError::Local(_)
        )
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if !status.is_server_error() => UploadError::Rejected {
                status: status.as_u16(),
                message: err.to_string(),
            },
            _ => UploadError::Transient(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_budget_classification() {
        assert!(UploadError::Transient("timeout".into()).counts_as_attempt());
        assert!(UploadError::Rejected {
            status: 403,
            message: "expired".into()
        }
        .counts_as_attempt());
        assert!(!UploadError::PolicyPaused.counts_as_attempt());
        assert!(!UploadError::Cancelled.counts_as_attempt());
        assert!(!UploadError::MissingBytes("seg".into()).counts_as_attempt());
    }
}
