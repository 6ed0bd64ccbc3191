//! The `RangeGetter` capability (spec §4.A) and its concrete
//! implementations. The core depends only on this two-method interface.
//!
//! Grounded in `otlp2parquet-iceberg::aws::AwsSigV4HttpClient`: sign a
//! `reqwest` request with `aws-sigv4`, execute it, map the response.

use crate::config::{R2Credentials, RuntimeConfig, StorageKind};
use crate::error::{BenchError, Result};
use async_trait::async_trait;
use aws_credential_types::provider::ProvideCredentials;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4;
use std::time::{Duration, Instant};

/// A fetched range and how long it took to drain (spec §4.A).
pub struct RangeResult {
    pub bytes: Vec<u8>,
    pub latency_ms: f64,
    pub http_status: u16,
}

/// External capability the core consumes. Must be safe to call from many
/// concurrent tasks (spec §4.A).
#[async_trait]
pub trait RangeGetter: Send + Sync {
    async fn get_range(&self, object_key: &str, start: u64, length: u64) -> Result<RangeResult>;

    /// Used by `CapacityDriver::EnsureObject` to check for the test object
    /// before ranging into it.
    async fn object_exists(&self, object_key: &str) -> Result<bool>;

    /// Seeds the test object via a streamed PUT of `size_bytes` zero bytes
    /// (spec §4.A's uploader collaborator, reimplemented minimally here so
    /// the `upload` subcommand is not a no-op).
    async fn put_object(&self, object_key: &str, size_bytes: u64) -> Result<()>;
}

/// Shared SigV4-signing HTTP client for both S3 and R2 (R2 is
/// S3-API-compatible; only the signing region/service and credential source
/// differ, per spec §9's "sum variant" guidance).
pub struct SigV4RangeGetter {
    client: reqwest::Client,
    bucket: String,
    base_url: String,
    region: String,
    service: &'static str,
    credentials: StaticOrProvided,
}

enum StaticOrProvided {
    Static {
        access_key_id: String,
        secret_access_key: String,
    },
    Provider(aws_credential_types::provider::SharedCredentialsProvider),
}

impl SigV4RangeGetter {
    /// Build a client targeting AWS S3, loading credentials from the
    /// standard AWS credential chain (env vars, instance profile, etc.).
    pub async fn s3(config: &RuntimeConfig) -> Result<Self> {
        let aws_cfg = aws_config::from_env().load().await;
        let provider = aws_cfg
            .credentials_provider()
            .ok_or_else(|| BenchError::Config("no AWS credentials provider available".into()))?;

        let base_url = config.s3_endpoint.clone().unwrap_or_else(|| {
            format!(
                "https://{}.s3.{}.amazonaws.com",
                config.bucket_name, config.region
            )
        });

        Ok(Self {
            client: http_client()?,
            bucket: config.bucket_name.clone(),
            base_url,
            region: config.region.clone(),
            service: "s3",
            credentials: StaticOrProvided::Provider(provider),
        })
    }

    /// Build a client targeting Cloudflare R2 using static credentials.
    pub fn r2(config: &RuntimeConfig, creds: &R2Credentials) -> Result<Self> {
        let base_url = creds
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.r2.cloudflarestorage.com", creds.account_id));

        Ok(Self {
            client: http_client()?,
            bucket: config.bucket_name.clone(),
            base_url,
            region: "auto".to_string(),
            service: "s3",
            credentials: StaticOrProvided::Static {
                access_key_id: creds.access_key_id.clone(),
                secret_access_key: creds.secret_access_key.clone(),
            },
        })
    }

    fn object_url(&self, object_key: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.bucket, object_key)
    }

    async fn resolve_credentials(&self) -> Result<aws_credential_types::Credentials> {
        match &self.credentials {
            StaticOrProvided::Static {
                access_key_id,
                secret_access_key,
            } => Ok(aws_credential_types::Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "static",
            )),
            StaticOrProvided::Provider(provider) => provider
                .provide_credentials()
                .await
                .map_err(|e| BenchError::Config(format!("failed to load AWS credentials: {e}"))),
        }
    }

    async fn signed_request(
        &self,
        method: &str,
        url: &str,
        extra_headers: &[(&str, String)],
        body: Option<&[u8]>,
    ) -> Result<reqwest::RequestBuilder> {
        let credentials = self.resolve_credentials().await?;

        // Parse-then-stringify validates the URL before it is handed to the
        // signer, matching `otlp2parquet-iceberg::aws::AwsSigV4HttpClient`'s
        // use of `url::Url` ahead of `SignableRequest::new`.
        let parsed_url = url
            .parse::<url::Url>()
            .map_err(|e| BenchError::Config(format!("invalid object URL '{url}': {e}")))?;

        let signable_body = match body {
            Some(bytes) => SignableBody::Bytes(bytes),
            None => SignableBody::Bytes(&[]),
        };

        let header_refs: Vec<(&str, &str)> = extra_headers
            .iter()
            .map(|(k, v)| (*k, v.as_str()))
            .collect();

        let signable_request =
            SignableRequest::new(method, parsed_url.as_str(), header_refs.into_iter(), signable_body)
                .map_err(|e| BenchError::Transport(format!("failed to build signable request: {e}")))?;

        let identity = aws_credential_types::Credentials::new(
            credentials.access_key_id(),
            credentials.secret_access_key(),
            credentials.session_token().map(String::from),
            None,
            "capacity-bench",
        )
        .into();

        let signing_params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(self.service)
            .time(std::time::SystemTime::now())
            .settings(SigningSettings::default())
            .build()
            .map_err(|e| BenchError::Transport(format!("failed to build signing params: {e}")))?
            .into();

        let (instructions, _signature) = sign(signable_request, &signing_params)
            .map_err(|e| BenchError::Transport(format!("failed to sign request: {e}")))?
            .into_parts();

        let mut builder = self
            .client
            .request(method.parse().expect("valid http method"), url);
        for (name, value) in extra_headers {
            builder = builder.header(*name, value.as_str());
        }
        for (name, value) in instructions.headers() {
            builder = builder.header(name, value);
        }
        if let Some(bytes) = body {
            builder = builder.body(bytes.to_vec());
        }
        Ok(builder)
    }
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| BenchError::Transport(format!("failed to build http client: {e}")))
}

/// Maps a `reqwest` error to its spec §7 kind: the client-configured
/// deadline tripping is `timeout`, distinct from `transport` (connection/
/// socket/TLS failure) even though both surface as the same `reqwest`
/// error type.
fn map_reqwest_err(e: reqwest::Error) -> BenchError {
    if e.is_timeout() {
        BenchError::Timeout(REQUEST_TIMEOUT)
    } else {
        BenchError::Transport(e.to_string())
    }
}

#[async_trait]
impl RangeGetter for SigV4RangeGetter {
    async fn get_range(&self, object_key: &str, start: u64, length: u64) -> Result<RangeResult> {
        let url = self.object_url(object_key);
        let range_header = format!("bytes={}-{}", start, start + length.saturating_sub(1));
        let headers = [("range", range_header)];

        let started = Instant::now();
        let builder = self.signed_request("GET", &url, &headers, None).await?;
        let response = builder.send().await.map_err(map_reqwest_err)?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(BenchError::HttpNonSuccess { status });
        }

        let bytes = response.bytes().await.map_err(map_reqwest_err)?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        if bytes.is_empty() {
            return Err(BenchError::HttpNonSuccess { status });
        }

        Ok(RangeResult {
            bytes: bytes.to_vec(),
            latency_ms,
            http_status: status,
        })
    }

    async fn object_exists(&self, object_key: &str) -> Result<bool> {
        match self.get_range(object_key, 0, 1).await {
            Ok(_) => Ok(true),
            Err(BenchError::HttpNonSuccess { status }) if status == 404 || status == 0 => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn put_object(&self, object_key: &str, size_bytes: u64) -> Result<()> {
        let url = self.object_url(object_key);
        let payload = vec![0u8; size_bytes as usize];
        let builder = self.signed_request("PUT", &url, &[], Some(&payload)).await?;
        let response = builder.send().await.map_err(map_reqwest_err)?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(BenchError::HttpNonSuccess { status });
        }
        Ok(())
    }
}
