use cadence_core::{Action, ActionError, ActionOutcome, StatusReporter};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::cmp::Ordering;
use std::time::Duration;
use thiserror::Error;

pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum ReleaseCheckError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("could not reach release server: {message}")]
    Network { message: String },
    #[error("release server answered {status}")]
    Status { status: StatusCode },
    #[error("invalid release payload: {message}")]
    Payload { message: String },
}

impl ReleaseCheckError {
    /// Failures caused by the environment rather than by us or the server's payload.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            ReleaseCheckError::Network { .. } | ReleaseCheckError::Status { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseStatus {
    UpToDate,
    Available { latest: String },
}

#[derive(Debug, Deserialize)]
struct ReleaseInfo {
    version: String,
}

/// Asks a release endpoint for the latest published version.
///
/// The endpoint answers `{"version": "x.y.z"}`.
#[derive(Debug, Clone)]
pub struct ReleaseChecker {
    client: Client,
    url: String,
    current: String,
}

impl ReleaseChecker {
    pub fn new(url: impl Into<String>) -> Result<Self, ReleaseCheckError> {
        Self::with_current_version(url, CURRENT_VERSION)
    }

    pub fn with_current_version(
        url: impl Into<String>,
        current: impl Into<String>,
    ) -> Result<Self, ReleaseCheckError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(ReleaseCheckError::Client)?;
        Ok(Self {
            client,
            url: url.into(),
            current: current.into(),
        })
    }

    pub async fn latest_version(&self) -> Result<String, ReleaseCheckError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ReleaseCheckError::Network {
                message: e.to_string(),
            })?;
        match resp.status() {
            StatusCode::OK => {}
            status => return Err(ReleaseCheckError::Status { status }),
        }
        let info: ReleaseInfo = resp.json().await.map_err(|e| ReleaseCheckError::Payload {
            message: e.to_string(),
        })?;
        if parse_version(&info.version).is_none() {
            return Err(ReleaseCheckError::Payload {
                message: format!("'{}' is not a version", info.version),
            });
        }
        Ok(info.version)
    }

    /// Run the check as a reported action. Unreachable servers are a handled
    /// failure; a broken payload is returned as an error.
    pub async fn check(
        &self,
        reporter: &dyn StatusReporter,
    ) -> Result<ActionOutcome<ReleaseStatus>, ReleaseCheckError> {
        let action = Action::begin(reporter, "Checking for updates");
        let result = match self.latest_version().await {
            Ok(latest) if is_newer(&latest, &self.current) => {
                Ok(ReleaseStatus::Available { latest })
            }
            Ok(_) => Ok(ReleaseStatus::UpToDate),
            Err(err) if err.is_transient() => Err(action.fail(err.to_string())),
            Err(err) => Err(ActionError::Error(err)),
        };
        let outcome = action.finish(result)?;
        if let ActionOutcome::Done(ReleaseStatus::Available { latest }) = &outcome {
            reporter.show_msg(&format!(
                "Cadence {latest} is available (running {})",
                self.current
            ));
        }
        Ok(outcome)
    }
}

fn parse_version(version: &str) -> Option<Vec<u64>> {
    let version = version.trim().trim_start_matches('v');
    let core = version.split(['-', '+']).next().unwrap_or_default();
    core.split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()
        .filter(|parts| !parts.is_empty())
}

/// Whether `candidate` is a later release than `current`. Unparsable
/// versions never count as newer.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    match (parse_version(candidate), parse_version(current)) {
        (Some(mut candidate), Some(mut current)) => {
            let len = candidate.len().max(current.len());
            candidate.resize(len, 0);
            current.resize(len, 0);
            candidate.cmp(&current) == Ordering::Greater
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl StatusReporter for Recorder {
        fn show_msg(&self, msg: &str) {
            self.0.lock().unwrap().push(msg.to_string());
        }
    }

    async fn server_answering(template: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/latest.json"))
            .respond_with(template)
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn compares_versions_numerically() {
        assert!(is_newer("1.10.0", "1.9.3"));
        assert!(is_newer("v2.0", "1.99.99"));
        assert!(is_newer("1.0.1", "1.0"));
        assert!(!is_newer("1.0.0", "1.0"));
        assert!(!is_newer("1.0.0-rc1", "1.0.0"));
        assert!(!is_newer("latest", "0.1.0"));
    }

    #[tokio::test]
    async fn reports_available_update() {
        let server = server_answering(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"version": "9.0.0"})),
        )
        .await;
        let checker =
            ReleaseChecker::with_current_version(format!("{}/latest.json", server.uri()), "1.2.3")
                .unwrap();
        let recorder = Recorder::default();

        let outcome = checker.check(&recorder).await.unwrap();
        assert_eq!(
            outcome,
            ActionOutcome::Done(ReleaseStatus::Available {
                latest: "9.0.0".into()
            })
        );
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                "Checking for updates...".to_string(),
                "Checking for updates...done".to_string(),
                "Cadence 9.0.0 is available (running 1.2.3)".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn same_version_is_up_to_date() {
        let server = server_answering(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"version": "1.2.3"})),
        )
        .await;
        let checker =
            ReleaseChecker::with_current_version(format!("{}/latest.json", server.uri()), "1.2.3")
                .unwrap();
        let outcome = checker.check(&Recorder::default()).await.unwrap();
        assert_eq!(outcome, ActionOutcome::Done(ReleaseStatus::UpToDate));
    }

    #[tokio::test]
    async fn server_error_is_a_handled_failure() {
        let server = server_answering(ResponseTemplate::new(503)).await;
        let checker = ReleaseChecker::new(format!("{}/latest.json", server.uri())).unwrap();
        let recorder = Recorder::default();

        let outcome = checker.check(&recorder).await.unwrap();
        assert!(matches!(outcome, ActionOutcome::Failed(_)));
        let messages = recorder.0.lock().unwrap();
        assert!(messages[1].starts_with("Checking for updates...failed\t"));
    }

    #[tokio::test]
    async fn broken_payload_propagates() {
        let server =
            server_answering(ResponseTemplate::new(200).set_body_string("<html>")).await;
        let checker = ReleaseChecker::new(format!("{}/latest.json", server.uri())).unwrap();
        let recorder = Recorder::default();

        let err = checker.check(&recorder).await.unwrap_err();
        assert!(matches!(err, ReleaseCheckError::Payload { .. }));
        let messages = recorder.0.lock().unwrap();
        assert!(messages[1].starts_with("Checking for updates...error\t"));
    }
}
