//! Backend project provisioning against the Supabase management API.
//!
//! `create` issues the project-create call, then polls the project until it
//! reports healthy and finally reads its API keys. Poll failures are absorbed
//! until the wall-clock ceiling; a rejected create is returned immediately.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::SupabaseSettings;
use super::models::BackendProject;
use super::poll::{PollDecision, PollObservation, PollPolicy, decide};
use crate::errors::ProvisionError;
use crate::util::{generate_secret, unique_name};

/// Platform project names are capped well below this.
const MAX_PROJECT_NAME_LEN: usize = 40;
const DB_PASSWORD_LEN: usize = 40;
const HEALTHY_STATUS: &str = "ACTIVE_HEALTHY";

/// Creates one ephemeral backend project.
#[async_trait]
pub trait ProjectProvisioner: Send + Sync {
    async fn create(&self, name: &str) -> Result<BackendProject, ProvisionError>;
}

#[derive(Debug, Serialize)]
struct CreateProjectRequest<'a> {
    name: &'a str,
    organization_id: &'a str,
    db_pass: &'a str,
    region: &'a str,
}

#[derive(Debug, Deserialize)]
struct ProjectResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "ref")]
    project_ref: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl ProjectResponse {
    fn reference(self) -> Option<String> {
        self.project_ref.or(self.id)
    }
}

#[derive(Debug, Deserialize)]
struct ApiKey {
    name: String,
    api_key: String,
}

pub struct SupabaseProvisioner {
    client: reqwest::Client,
    api_url: String,
    access_token: String,
    organization_id: String,
    region: String,
    poll: PollPolicy,
}

impl SupabaseProvisioner {
    pub fn new(
        api_url: impl Into<String>,
        access_token: impl Into<String>,
        organization_id: impl Into<String>,
        region: impl Into<String>,
        poll: PollPolicy,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            organization_id: organization_id.into(),
            region: region.into(),
            poll,
        }
    }

    /// Build from settings. Both the access token and the organization are required.
    pub fn from_settings(settings: &SupabaseSettings) -> anyhow::Result<Self> {
        let token = settings
            .access_token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("SUPABASE_ACCESS_TOKEN is required to provision projects"))?;
        let org = settings.organization_id.clone().ok_or_else(|| {
            anyhow::anyhow!("SUPABASE_ORGANIZATION_ID is required to provision projects")
        })?;
        Ok(Self::new(
            settings.api_url.clone(),
            token,
            org,
            settings.region.clone(),
            settings.poll,
        ))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    async fn create_project(&self, name: &str, db_pass: &str) -> Result<String, ProvisionError> {
        let body = CreateProjectRequest {
            name,
            organization_id: &self.organization_id,
            db_pass,
            region: &self.region,
        };
        let resp = self
            .client
            .post(self.url("/v1/projects"))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProvisionError::Request(e.to_string()))?;
        let resp = check_status(resp).await?;
        let project: ProjectResponse = resp
            .json()
            .await
            .map_err(|e| ProvisionError::Request(format!("Invalid create response: {}", e)))?;
        project
            .reference()
            .ok_or_else(|| ProvisionError::Request("Create response carried no project ref".into()))
    }

    /// One status poll. Anything but a healthy answer is "not yet".
    async fn observe(&self, project_ref: &str) -> PollObservation {
        let resp = self
            .client
            .get(self.url(&format!("/v1/projects/{}", project_ref)))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                debug!(project_ref, error = %e, "Status poll failed; will retry");
                return PollObservation::TransientError;
            }
        };
        match resp.json::<ProjectResponse>().await {
            Ok(p) if p.status.as_deref() == Some(HEALTHY_STATUS) => PollObservation::Ready,
            Ok(p) => {
                debug!(project_ref, status = ?p.status, "Project not healthy yet");
                PollObservation::Pending
            }
            Err(e) => {
                debug!(project_ref, error = %e, "Unreadable status response; will retry");
                PollObservation::TransientError
            }
        }
    }

    async fn wait_until_healthy(&self, project_ref: &str) -> Result<(), ProvisionError> {
        let started = Instant::now();
        loop {
            let budget = self.poll.remaining(started.elapsed());
            let observation = match tokio::time::timeout(budget, self.observe(project_ref)).await {
                Ok(observation) => observation,
                Err(_) => {
                    debug!(project_ref, "Status poll outlived the ceiling; abandoning it");
                    PollObservation::TransientError
                }
            };
            match decide(observation, started.elapsed(), &self.poll) {
                PollDecision::Succeeded => return Ok(()),
                PollDecision::KeepPolling { wait } => tokio::time::sleep(wait).await,
                PollDecision::TimedOut => {
                    let waited = started.elapsed();
                    warn!(
                        project_ref,
                        waited_secs = waited.as_secs(),
                        "Project never became healthy; it may exist on the platform (possibly orphaned)"
                    );
                    return Err(ProvisionError::Timeout {
                        project_ref: project_ref.to_string(),
                        waited,
                    });
                }
            }
        }
    }

    async fn fetch_keys(&self, project_ref: &str) -> Result<(String, String), ProvisionError> {
        let resp = self
            .client
            .get(self.url(&format!("/v1/projects/{}/api-keys", project_ref)))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| ProvisionError::Request(e.to_string()))?;
        let keys: Vec<ApiKey> = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| ProvisionError::Request(format!("Invalid api-keys response: {}", e)))?;

        let find = |wanted: &str| {
            keys.iter()
                .find(|k| k.name == wanted)
                .map(|k| k.api_key.clone())
                .ok_or_else(|| ProvisionError::Request(format!("Project has no {} key", wanted)))
        };
        Ok((find("anon")?, find("service_role")?))
    }
}

#[async_trait]
impl ProjectProvisioner for SupabaseProvisioner {
    async fn create(&self, name: &str) -> Result<BackendProject, ProvisionError> {
        let project_name = unique_name(name, MAX_PROJECT_NAME_LEN);
        let db_pass = generate_secret(DB_PASSWORD_LEN);

        info!(name = %project_name, region = %self.region, "Creating backend project");
        let project_ref = self.create_project(&project_name, &db_pass).await?;
        info!(project_ref = %project_ref, "Project accepted; waiting for healthy status");

        self.wait_until_healthy(&project_ref).await?;
        let (anon_key, service_role_key) = self.fetch_keys(&project_ref).await?;
        info!(project_ref = %project_ref, "Backend project ready");

        Ok(BackendProject {
            url: format!("https://{}.supabase.co", project_ref),
            database_url: format!(
                "postgresql://postgres:{}@db.{}.supabase.co:5432/postgres",
                db_pass, project_ref
            ),
            id: project_ref,
            anon_key,
            service_role_key,
        })
    }
}

/// Map a non-2xx response to `Rejected` with the platform's message.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProvisionError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProvisionError::Rejected {
        status: status.as_u16(),
        message: platform_message(&body),
    })
}

/// Pull `message`/`error` out of a JSON error body, falling back to the raw text.
pub(crate) fn platform_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "msg", "error"] {
            match value.get(key) {
                Some(serde_json::Value::String(s)) => return s.clone(),
                Some(serde_json::Value::Object(o)) => {
                    if let Some(serde_json::Value::String(s)) = o.get("message") {
                        return s.clone();
                    }
                }
                _ => {}
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no response body".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::poll::fast_poll;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provisioner(server: &MockServer, ceiling_ms: u64) -> SupabaseProvisioner {
        SupabaseProvisioner::new(
            server.uri(),
            "sbp_test",
            "org-1",
            "us-east-1",
            fast_poll(ceiling_ms),
        )
    }

    async fn mount_keys(server: &MockServer, project_ref: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/v1/projects/{}/api-keys", project_ref)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "anon", "api_key": "anon-key"},
                {"name": "service_role", "api_key": "service-key"}
            ])))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_create_polls_until_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects"))
            .and(header("authorization", "Bearer sbp_test"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"id": "abcd1234", "status": "COMING_UP"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        // Two pending answers, then healthy.
        Mock::given(method("GET"))
            .and(path("/v1/projects/abcd1234"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "abcd1234", "status": "COMING_UP"})))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/projects/abcd1234"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "abcd1234", "status": "ACTIVE_HEALTHY"})),
            )
            .mount(&server)
            .await;
        mount_keys(&server, "abcd1234").await;

        let project = provisioner(&server, 5_000).create("Recipe App").await.unwrap();
        assert_eq!(project.id, "abcd1234");
        assert_eq!(project.url, "https://abcd1234.supabase.co");
        assert_eq!(project.anon_key, "anon-key");
        assert_eq!(project.service_role_key, "service-key");
        assert!(project.database_url.starts_with("postgresql://postgres:"));
        assert!(project.database_url.ends_with("@db.abcd1234.supabase.co:5432/postgres"));
    }

    #[tokio::test]
    async fn test_create_sends_sanitized_name_and_strong_password() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "p1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/projects/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "p1", "status": "ACTIVE_HEALTHY"})))
            .mount(&server)
            .await;
        mount_keys(&server, "p1").await;

        provisioner(&server, 5_000).create("My App!!").await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let create = requests
            .iter()
            .find(|r| r.method.as_str() == "POST")
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&create.body).unwrap();
        let name = body["name"].as_str().unwrap();
        assert!(name.starts_with("my-app-"));
        assert_eq!(body["organization_id"], "org-1");
        assert_eq!(body["region"], "us-east-1");
        assert!(body["db_pass"].as_str().unwrap().len() >= 32);
    }

    #[tokio::test]
    async fn test_rejected_create_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "Unauthorized"})))
            .expect(1)
            .mount(&server)
            .await;

        let err = provisioner(&server, 5_000).create("app").await.unwrap_err();
        match err {
            ProvisionError::Rejected { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Unauthorized");
            }
            other => panic!("Expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_poll_errors_are_absorbed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "flaky"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/projects/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/projects/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "flaky", "status": "ACTIVE_HEALTHY"})))
            .mount(&server)
            .await;
        mount_keys(&server, "flaky").await;

        let project = provisioner(&server, 5_000).create("app").await.unwrap();
        assert_eq!(project.id, "flaky");
    }

    #[tokio::test]
    async fn test_never_healthy_times_out_near_ceiling() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "stuck"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/projects/stuck"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "stuck", "status": "COMING_UP"})))
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        let err = provisioner(&server, 200).create("app").await.unwrap_err();
        let elapsed = started.elapsed();

        match err {
            ProvisionError::Timeout { project_ref, waited } => {
                assert_eq!(project_ref, "stuck");
                assert!(waited >= Duration::from_millis(200));
            }
            other => panic!("Expected Timeout, got {:?}", other),
        }
        assert!(elapsed >= Duration::from_millis(200));
        // One interval of slack plus generous room for request latency.
        assert!(elapsed < Duration::from_millis(200 + 20 + 800));
    }

    #[tokio::test]
    async fn test_hung_status_poll_still_times_out_at_ceiling() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "hang"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/projects/hang"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "hang", "status": "ACTIVE_HEALTHY"}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        let err = provisioner(&server, 200).create("app").await.unwrap_err();
        let elapsed = started.elapsed();

        match err {
            ProvisionError::Timeout { project_ref, .. } => assert_eq!(project_ref, "hang"),
            other => panic!("Expected Timeout, got {:?}", other),
        }
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
    }

    #[test]
    fn test_platform_message_extraction() {
        assert_eq!(platform_message(r#"{"message":"nope"}"#), "nope");
        assert_eq!(
            platform_message(r#"{"error":{"code":"forbidden","message":"no access"}}"#),
            "no access"
        );
        assert_eq!(platform_message("plain text"), "plain text");
        assert_eq!(platform_message(""), "no response body");
    }

    #[test]
    fn test_from_settings_requires_org() {
        let settings = SupabaseSettings {
            api_url: "http://localhost".into(),
            access_token: Some("sbp".into()),
            organization_id: None,
            region: "us-east-1".into(),
            poll: PollPolicy::provisioning(),
        };
        let err = SupabaseProvisioner::from_settings(&settings).err().unwrap();
        assert!(err.to_string().contains("SUPABASE_ORGANIZATION_ID"));
    }
}
