//! Connectivity self-test for the external platforms.
//!
//! Each check makes one authenticated read call and checks the platform's
//! command-line tool. Nothing here is on the job path.

use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::config::{SupabaseSettings, VercelSettings};
use super::deploy::VercelCli;
use super::provisioner::platform_message;

pub const SUPABASE_CLI: &str = "supabase";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlatformCheck {
    pub platform: &'static str,
    pub reachable: bool,
    /// Why the platform is unreachable, or a short success note.
    pub detail: String,
    pub cli_installed: bool,
    pub cli_authenticated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelfTestReport {
    pub checks: Vec<PlatformCheck>,
}

impl SelfTestReport {
    pub fn all_reachable(&self) -> bool {
        self.checks.iter().all(|c| c.reachable)
    }
}

pub async fn run_self_test(supabase: &SupabaseSettings, vercel: &VercelSettings) -> SelfTestReport {
    let (supabase, vercel) = tokio::join!(
        check_supabase(supabase, SUPABASE_CLI),
        check_vercel(vercel),
    );
    SelfTestReport {
        checks: vec![supabase, vercel],
    }
}

/// `GET /v1/projects` with the management token, plus the supabase CLI.
pub async fn check_supabase(settings: &SupabaseSettings, cli_cmd: &str) -> PlatformCheck {
    let (reachable, detail) = match &settings.access_token {
        Some(token) => {
            let url = format!("{}/v1/projects", settings.api_url.trim_end_matches('/'));
            authenticated_get(reqwest::Client::new().get(url).bearer_auth(token)).await
        }
        None => (false, "SUPABASE_ACCESS_TOKEN not set".to_string()),
    };
    let cli_installed = cli_succeeds(cli_cmd, &["--version"]).await;
    let cli_authenticated = cli_installed && cli_succeeds(cli_cmd, &["projects", "list"]).await;
    report("supabase", reachable, detail, cli_installed, cli_authenticated)
}

/// `GET /v2/user` with the deploy token, plus the vercel CLI.
pub async fn check_vercel(settings: &VercelSettings) -> PlatformCheck {
    let (reachable, detail) = match &settings.token {
        Some(token) => {
            let url = format!("{}/v2/user", settings.api_url.trim_end_matches('/'));
            authenticated_get(reqwest::Client::new().get(url).bearer_auth(token)).await
        }
        None => (false, "VERCEL_TOKEN not set".to_string()),
    };
    let cli = VercelCli::new(
        settings.cli_cmd.clone(),
        settings.token.clone(),
        settings.team_id.clone(),
    );
    let cli_installed = cli.is_installed().await;
    let cli_authenticated = cli_installed && cli.is_authenticated().await;
    report("vercel", reachable, detail, cli_installed, cli_authenticated)
}

fn report(
    platform: &'static str,
    reachable: bool,
    detail: String,
    cli_installed: bool,
    cli_authenticated: bool,
) -> PlatformCheck {
    info!(platform, reachable, cli_installed, cli_authenticated, detail = %detail, "Connectivity check");
    PlatformCheck {
        platform,
        reachable,
        detail,
        cli_installed,
        cli_authenticated,
    }
}

async fn authenticated_get(request: reqwest::RequestBuilder) -> (bool, String) {
    match request.send().await {
        Ok(resp) if resp.status().is_success() => (true, format!("HTTP {}", resp.status().as_u16())),
        Ok(resp) => {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            (false, format!("HTTP {}: {}", status, platform_message(&body)))
        }
        Err(e) => (false, format!("request failed: {}", e)),
    }
}

async fn cli_succeeds(cmd: &str, args: &[&str]) -> bool {
    let status = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    debug!(cmd, ?args, ok = matches!(&status, Ok(s) if s.success()), "CLI check");
    matches!(status, Ok(s) if s.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::poll::PollPolicy;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MISSING_CLI: &str = "appfactory-test-no-such-cli";

    fn supabase(api_url: &str, token: Option<&str>) -> SupabaseSettings {
        SupabaseSettings {
            api_url: api_url.to_string(),
            access_token: token.map(String::from),
            organization_id: None,
            region: "us-east-1".into(),
            poll: PollPolicy::new(Duration::from_secs(1), Duration::from_secs(1)),
        }
    }

    fn vercel(api_url: &str, token: Option<&str>) -> VercelSettings {
        VercelSettings {
            api_url: api_url.to_string(),
            token: token.map(String::from),
            team_id: None,
            cli_cmd: MISSING_CLI.into(),
            poll: PollPolicy::new(Duration::from_secs(1), Duration::from_secs(1)),
        }
    }

    #[tokio::test]
    async fn test_supabase_reachable_with_valid_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/projects"))
            .and(header("authorization", "Bearer sbp_good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let check = check_supabase(&supabase(&server.uri(), Some("sbp_good")), MISSING_CLI).await;
        assert!(check.reachable);
        assert_eq!(check.platform, "supabase");
        assert!(!check.cli_installed);
        assert!(!check.cli_authenticated);
    }

    #[tokio::test]
    async fn test_supabase_bad_token_is_unreachable_with_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/projects"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(serde_json::json!({"message": "Unauthorized"})),
            )
            .mount(&server)
            .await;

        let check = check_supabase(&supabase(&server.uri(), Some("bad")), MISSING_CLI).await;
        assert!(!check.reachable);
        assert_eq!(check.detail, "HTTP 401: Unauthorized");
    }

    #[tokio::test]
    async fn test_missing_token_skips_the_call() {
        let check = check_supabase(&supabase("http://127.0.0.1:9", None), MISSING_CLI).await;
        assert!(!check.reachable);
        assert!(check.detail.contains("SUPABASE_ACCESS_TOKEN"));

        let check = check_vercel(&vercel("http://127.0.0.1:9", None)).await;
        assert!(!check.reachable);
        assert!(check.detail.contains("VERCEL_TOKEN"));
    }

    #[tokio::test]
    async fn test_vercel_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/user"))
            .and(header("authorization", "Bearer vc_token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"user": {"username": "me"}})),
            )
            .mount(&server)
            .await;

        let check = check_vercel(&vercel(&server.uri(), Some("vc_token"))).await;
        assert!(check.reachable);
        assert!(!check.cli_installed);
    }

    #[tokio::test]
    async fn test_unreachable_host_reports_request_failure() {
        let check = check_vercel(&vercel("http://127.0.0.1:9", Some("vc_token"))).await;
        assert!(!check.reachable);
        assert!(check.detail.starts_with("request failed"));
    }

    #[test]
    fn test_report_all_reachable() {
        let ok = |platform| PlatformCheck {
            platform,
            reachable: true,
            detail: String::new(),
            cli_installed: false,
            cli_authenticated: false,
        };
        let mut report = SelfTestReport {
            checks: vec![ok("supabase"), ok("vercel")],
        };
        assert!(report.all_reachable());
        report.checks[1].reachable = false;
        assert!(!report.all_reachable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_check_uses_exit_status() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-supabase");
        std::fs::write(
            &script,
            "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then echo 1.0.0; exit 0; fi\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let cmd = script.to_string_lossy().into_owned();

        let check = check_supabase(&supabase("http://127.0.0.1:9", None), &cmd).await;
        assert!(check.cli_installed);
        assert!(!check.cli_authenticated);
    }
}
