use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use log::debug;
use regex::Regex;
use reqwest::Client;
use url::Url;

use crate::error::{PipelineError, Result};
use crate::process::{with_retries, RetryPolicy};

const RETRY_DELAY_SECONDS: u64 = 1;
const REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// A Fedora release as named by the pipeline (`rawhide`, `f33`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Rawhide,
    Numbered(u32),
}

impl FromStr for Release {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_lowercase();
        if name == "rawhide" {
            return Ok(Self::Rawhide);
        }
        name.strip_prefix('f')
            .and_then(|number| number.parse::<u32>().ok())
            .map(Self::Numbered)
            .ok_or_else(|| PipelineError::Usage(format!("Unsupported release {s}")))
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rawhide => write!(f, "rawhide"),
            Self::Numbered(number) => write!(f, "f{number}"),
        }
    }
}

impl Release {
    /// Location of the last successfully tested cloud image for this release.
    pub fn image_url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        match self {
            Self::Rawhide => {
                format!("{base}/fedora-rawhide-image-test/lastSuccessfulBuild/artifact/Fedora-Rawhide.qcow2")
            }
            Self::Numbered(n) => {
                format!("{base}/fedora-f{n}-image-test/lastSuccessfulBuild/artifact/Fedora-{n}.qcow2")
            }
        }
    }
}

/// Whether a dist-git branch builds for rawhide.
pub fn is_rawhide_branch(branch: &str) -> bool {
    matches!(branch, "master" | "main" | "rawhide")
}

/// Extracts the `%define dist_version` value from a fedora-release spec file.
pub fn dist_version_from_spec(spec: &str) -> Option<String> {
    let re = Regex::new(r"(?m)^%define dist_version\s+(\S+)\s*$").ok()?;
    re.captures(spec).map(|caps| caps[1].to_string())
}

/// Looks up the version number currently carried by rawhide.
pub struct ReleaseInfoClient {
    client: Client,
    spec_url: Url,
    policy: RetryPolicy,
}

impl ReleaseInfoClient {
    pub fn new(spec_url: &str, retries: u32) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("distgit-ci/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to create HTTP client: {e}")))?;

        let spec_url = Url::parse(spec_url)
            .map_err(|e| PipelineError::Config(format!("Invalid release spec URL: {e}")))?;

        Ok(Self {
            client,
            spec_url,
            policy: RetryPolicy::new(retries, Duration::from_secs(RETRY_DELAY_SECONDS)),
        })
    }

    /// Fetches the spec file. Network errors are retried, HTTP errors are not.
    async fn fetch_spec(&self) -> Result<String> {
        let (client, url) = (&self.client, &self.spec_url);
        let response = with_retries(self.policy, &format!("Querying {url}"), || async move {
            client
                .get(url.clone())
                .send()
                .await
                .map_err(PipelineError::from)
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Stage(format!(
                "Could not query {url} (status {status})"
            )));
        }
        Ok(response.text().await?)
    }

    /// Dist tag of rawhide, e.g. `f34`.
    pub async fn rawhide_dist(&self) -> Result<String> {
        let spec = self.fetch_spec().await?;
        let version = dist_version_from_spec(&spec).ok_or_else(|| {
            PipelineError::Stage("Couldn't discover the Fedora dist number of rawhide".into())
        })?;
        debug!("rawhide is Fedora {version}");
        Ok(format!("f{version}"))
    }

    /// Dist tag used for repositories and builds of `release`.
    pub async fn dist_for(&self, release: Release) -> Result<String> {
        match release {
            Release::Rawhide => self.rawhide_dist().await,
            numbered @ Release::Numbered(_) => Ok(numbered.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = "Summary:        Fedora release files\nName:           fedora-release\n%define dist_version 34\n%define bug_version rawhide\n";

    #[test]
    fn test_parse_release() {
        assert_eq!("rawhide".parse::<Release>().unwrap(), Release::Rawhide);
        assert_eq!("F33".parse::<Release>().unwrap(), Release::Numbered(33));
        assert_eq!("f33".parse::<Release>().unwrap().to_string(), "f33");
    }

    #[test]
    fn test_parse_unsupported_release() {
        let err = "epel8".parse::<Release>().unwrap_err();
        assert!(matches!(err, PipelineError::Usage(_)));
        assert!(err.to_string().contains("Unsupported release epel8"));
        assert!("f".parse::<Release>().is_err());
    }

    #[test]
    fn test_image_url() {
        let base = "https://jenkins.example.org/job/";
        assert_eq!(
            Release::Rawhide.image_url(base),
            "https://jenkins.example.org/job/fedora-rawhide-image-test/lastSuccessfulBuild/artifact/Fedora-Rawhide.qcow2"
        );
        assert_eq!(
            Release::Numbered(33).image_url(base),
            "https://jenkins.example.org/job/fedora-f33-image-test/lastSuccessfulBuild/artifact/Fedora-33.qcow2"
        );
    }

    #[test]
    fn test_rawhide_branches() {
        assert!(is_rawhide_branch("master"));
        assert!(is_rawhide_branch("rawhide"));
        assert!(!is_rawhide_branch("f33"));
    }

    #[test]
    fn test_dist_version_from_spec() {
        assert_eq!(dist_version_from_spec(SPEC), Some("34".to_string()));
        assert_eq!(dist_version_from_spec("Name: fedora-release\n"), None);
    }

    #[tokio::test]
    async fn test_rawhide_dist_from_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/fedora-release.spec")
            .with_status(200)
            .with_body(SPEC)
            .create_async()
            .await;

        let client =
            ReleaseInfoClient::new(&format!("{}/fedora-release.spec", server.url()), 3).unwrap();
        assert_eq!(client.rawhide_dist().await.unwrap(), "f34");
        assert_eq!(client.dist_for(Release::Numbered(32)).await.unwrap(), "f32");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rawhide_dist_http_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/fedora-release.spec")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let client =
            ReleaseInfoClient::new(&format!("{}/fedora-release.spec", server.url()), 3).unwrap();
        let err = client.rawhide_dist().await.unwrap_err();
        assert!(err.to_string().contains("status 404"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_server_is_retried_then_fails() {
        let client = ReleaseInfoClient::new("http://127.0.0.1:9/fedora-release.spec", 2).unwrap();
        let err = client.rawhide_dist().await.unwrap_err();
        assert!(matches!(err, PipelineError::Network(_)));
    }

    #[test]
    fn test_invalid_spec_url() {
        assert!(ReleaseInfoClient::new("not a url", 1).is_err());
    }
}
