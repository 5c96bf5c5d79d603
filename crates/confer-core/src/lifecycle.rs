//! Meeting-lifecycle service client.
//!
//! The lifecycle service is the external system of record for meeting
//! existence, status, and peak occupancy. The coordinator only needs two
//! narrow calls: validate a room code, and report stats on status
//! transitions. Failures degrade rather than propagate: an unreachable
//! service reads as "not valid" and stat reports are best-effort.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Header carrying the shared internal key.
const INTERNAL_KEY_HEADER: &str = "x-internal-key";

/// Request timeout for lifecycle calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle client construction errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The underlying HTTP client could not be built.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Externally reported meeting status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Planned,
    Started,
    Done,
    Cancelled,
    NoShow,
}

impl MeetingStatus {
    /// Whether this status is terminal for the meeting.
    #[must_use]
    pub fn is_ended(self) -> bool {
        matches!(
            self,
            MeetingStatus::Done | MeetingStatus::Cancelled | MeetingStatus::NoShow
        )
    }
}

/// Status value carried in a stats report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Started,
    Done,
}

/// Result of validating a room code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomValidation {
    /// Whether the lifecycle service recognizes the room code.
    pub valid: bool,
    /// The externally reported status.
    pub status: MeetingStatus,
}

impl RoomValidation {
    /// A validation result for an unknown or unreachable room.
    #[must_use]
    pub fn invalid() -> Self {
        Self {
            valid: false,
            status: MeetingStatus::Done,
        }
    }
}

/// Narrow interface to the lifecycle service.
///
/// Implementations never surface transport errors: reads degrade to
/// invalid, writes report success as a plain boolean.
#[async_trait]
pub trait LifecycleApi: Send + Sync {
    /// Validate a room code and fetch its external status.
    async fn validate_room(&self, room_code: &str) -> RoomValidation;

    /// Report peak occupancy and a status transition for a meeting.
    ///
    /// Returns `true` if the service acknowledged the report.
    async fn report_stats(&self, room_id: &str, peak_users: u32, status: ReportStatus) -> bool;
}

#[derive(Debug, Deserialize)]
struct ValidationResponse {
    valid: bool,
    status: MeetingStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsReport {
    peak_users: u32,
    status: ReportStatus,
}

/// HTTP client for the lifecycle service.
pub struct HttpLifecycleClient {
    http: reqwest::Client,
    base_url: String,
    internal_key: String,
}

impl HttpLifecycleClient {
    /// Create a client for the service at `base_url`, authenticating with
    /// the shared internal key.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        base_url: impl Into<String>,
        internal_key: impl Into<String>,
    ) -> Result<Self, LifecycleError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            internal_key: internal_key.into(),
        })
    }
}

#[async_trait]
impl LifecycleApi for HttpLifecycleClient {
    async fn validate_room(&self, room_code: &str) -> RoomValidation {
        let url = format!("{}/meeting/room/{}", self.base_url, room_code);

        let response = match self
            .http
            .get(&url)
            .header(INTERNAL_KEY_HEADER, &self.internal_key)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(room_code = %room_code, error = %e, "Lifecycle service unreachable");
                return RoomValidation::invalid();
            }
        };

        if !response.status().is_success() {
            warn!(
                room_code = %room_code,
                status = %response.status(),
                "Lifecycle validation returned non-OK"
            );
            return RoomValidation::invalid();
        }

        match response.json::<ValidationResponse>().await {
            Ok(body) => RoomValidation {
                valid: body.valid,
                status: body.status,
            },
            Err(e) => {
                warn!(room_code = %room_code, error = %e, "Malformed lifecycle validation body");
                RoomValidation::invalid()
            }
        }
    }

    async fn report_stats(&self, room_id: &str, peak_users: u32, status: ReportStatus) -> bool {
        let url = format!("{}/meeting/room/{}", self.base_url, room_id);
        let report = StatsReport { peak_users, status };

        let response = match self
            .http
            .post(&url)
            .header(INTERNAL_KEY_HEADER, &self.internal_key)
            .json(&report)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "Lifecycle stats report failed");
                return false;
            }
        };

        if !response.status().is_success() {
            warn!(
                room_id = %room_id,
                status = %response.status(),
                "Lifecycle stats report returned non-OK"
            );
            return false;
        }

        response.json::<bool>().await.unwrap_or(false)
    }
}

/// Mock lifecycle client for testing coordinator logic without a network.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// A recorded stats report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordedReport {
        /// Reported peak occupancy.
        pub peak_users: u32,
        /// Reported status transition.
        pub status: ReportStatus,
    }

    /// Scripted lifecycle service that records every report.
    pub struct MockLifecycle {
        validation: Mutex<RoomValidation>,
        reports: Mutex<Vec<RecordedReport>>,
        validate_calls: AtomicUsize,
    }

    impl MockLifecycle {
        /// A service that recognizes every room as planned.
        #[must_use]
        pub fn valid() -> Self {
            Self::with_validation(RoomValidation {
                valid: true,
                status: MeetingStatus::Planned,
            })
        }

        /// A service that rejects every room.
        #[must_use]
        pub fn invalid() -> Self {
            Self::with_validation(RoomValidation::invalid())
        }

        /// A service with a scripted validation result.
        #[must_use]
        pub fn with_validation(validation: RoomValidation) -> Self {
            Self {
                validation: Mutex::new(validation),
                reports: Mutex::new(Vec::new()),
                validate_calls: AtomicUsize::new(0),
            }
        }

        /// Change the scripted validation result mid-test.
        pub fn set_validation(&self, validation: RoomValidation) {
            *self.validation.lock().unwrap() = validation;
        }

        /// Every stats report received so far.
        #[must_use]
        pub fn reports(&self) -> Vec<RecordedReport> {
            self.reports.lock().unwrap().clone()
        }

        /// Number of validation calls made.
        #[must_use]
        pub fn validate_calls(&self) -> usize {
            self.validate_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LifecycleApi for MockLifecycle {
        async fn validate_room(&self, _room_code: &str) -> RoomValidation {
            self.validate_calls.fetch_add(1, Ordering::SeqCst);
            *self.validation.lock().unwrap()
        }

        async fn report_stats(
            &self,
            _room_id: &str,
            peak_users: u32,
            status: ReportStatus,
        ) -> bool {
            self.reports
                .lock()
                .unwrap()
                .push(RecordedReport { peak_users, status });
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockLifecycle;
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!MeetingStatus::Planned.is_ended());
        assert!(!MeetingStatus::Started.is_ended());
        assert!(MeetingStatus::Done.is_ended());
        assert!(MeetingStatus::Cancelled.is_ended());
        assert!(MeetingStatus::NoShow.is_ended());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&MeetingStatus::NoShow).unwrap(),
            r#""no_show""#
        );
        assert_eq!(
            serde_json::from_str::<MeetingStatus>(r#""cancelled""#).unwrap(),
            MeetingStatus::Cancelled
        );
    }

    #[test]
    fn test_stats_report_shape() {
        let report = StatsReport {
            peak_users: 3,
            status: ReportStatus::Done,
        };
        assert_eq!(
            serde_json::to_string(&report).unwrap(),
            r#"{"peakUsers":3,"status":"done"}"#
        );
    }

    #[tokio::test]
    async fn test_mock_records_reports() {
        let mock = MockLifecycle::valid();

        assert!(mock.validate_room("abc123").await.valid);
        assert_eq!(mock.validate_calls(), 1);

        assert!(mock.report_stats("m-1", 2, ReportStatus::Started).await);
        let reports = mock.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].peak_users, 2);
        assert_eq!(reports[0].status, ReportStatus::Started);
    }

    #[tokio::test]
    async fn test_mock_invalid() {
        let mock = MockLifecycle::invalid();
        let validation = mock.validate_room("nope").await;
        assert!(!validation.valid);
        assert!(validation.status.is_ended());
    }
}
