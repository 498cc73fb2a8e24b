//! Object store backed by S3 `PutObject`.

use super::sigv4::{sha256_hex, uri_encode, SignableRequest, Signer};
use super::{classify_failure, endpoint, host_header, send_error, AwsSettings, Credentials};
use crate::error::{PipelineError, ServiceError};
use crate::services::ObjectStore;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use tracing::debug;

pub struct S3Store {
    client: reqwest::Client,
    signer: Signer,
    endpoint: Url,
    /// Bucket goes in the path rather than the host name.
    path_style: bool,
}

impl S3Store {
    pub fn new(
        client: reqwest::Client,
        credentials: Credentials,
        settings: &AwsSettings,
    ) -> Result<Self, PipelineError> {
        let path_style = settings.s3_endpoint.is_some();
        let endpoint = endpoint(
            settings.s3_endpoint.as_deref(),
            format!("https://s3.{}.amazonaws.com", settings.region),
        )?;
        Ok(Self {
            client,
            signer: Signer::new(credentials, settings.region.clone(), "s3"),
            endpoint,
            path_style,
        })
    }

    /// The request URL and its encoded path for `bucket`/`key`.
    fn object_url(&self, bucket: &str, key: &str) -> Result<(Url, String), ServiceError> {
        let encoded_key = uri_encode(key, false);
        let mut url = self.endpoint.clone();
        let path = if self.path_style {
            let base = url.path().trim_end_matches('/').to_string();
            format!("{}/{}/{}", base, uri_encode(bucket, true), encoded_key)
        } else {
            let host = format!("{}.{}", bucket, url.host_str().unwrap_or_default());
            url.set_host(Some(&host))
                .map_err(|e| ServiceError::Rejected {
                    status: 400,
                    message: format!("Invalid bucket name '{}': {}", bucket, e),
                })?;
            format!("/{}", encoded_key)
        };
        url.set_path(&path);
        Ok((url, path))
    }
}

/// MIME type sent with an upload, from the key's extension.
pub fn content_type_for(key: &str) -> &'static str {
    let ext = key.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Pull `<Code>` and `<Message>` out of an S3 XML error body.
fn xml_error(body: &str) -> (Option<String>, String) {
    let element = |name: &str| {
        let open = format!("<{}>", name);
        let close = format!("</{}>", name);
        let start = body.find(&open)? + open.len();
        let end = body[start..].find(&close)? + start;
        Some(body[start..end].to_string())
    };
    let message = element("Message").unwrap_or_else(|| body.trim().to_string());
    (element("Code"), message)
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), ServiceError> {
        let (url, path) = self.object_url(bucket, key)?;
        let payload_hash = sha256_hex(&body);
        let content_type = content_type_for(key);

        let headers = vec![
            ("content-type".to_string(), content_type.to_string()),
            ("host".to_string(), host_header(&url)),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
        ];
        let signed = self.signer.sign(
            SignableRequest {
                method: "PUT",
                path: &path,
                headers: headers.clone(),
                payload_hash,
            },
            Utc::now(),
        );

        debug!("PUT {} ({} bytes)", url, body.len());
        let mut request = self.client.put(url.clone()).body(body);
        for (name, value) in headers.into_iter().chain(signed) {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| send_error(e, &url))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let (code, message) = xml_error(&text);
        Err(classify_failure(status.as_u16(), code.as_deref(), message))
    }
}
