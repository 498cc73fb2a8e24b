//! Expense analysis over the Textract JSON 1.1 protocol.

use super::sigv4::{sha256_hex, SignableRequest, Signer};
use super::{classify_failure, endpoint, host_header, send_error, AwsSettings, Credentials};
use crate::error::{PipelineError, ServiceError};
use crate::models::{AnalysisRequest, JobId, JobStatus, RemoteObject, StatusReport};
use crate::services::AnalysisService;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use serde_json::{json, Value};
use tracing::debug;

const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const START_TARGET: &str = "Textract.StartExpenseAnalysis";
const GET_TARGET: &str = "Textract.GetExpenseAnalysis";

pub struct TextractService {
    client: reqwest::Client,
    signer: Signer,
    endpoint: Url,
}

impl TextractService {
    pub fn new(
        client: reqwest::Client,
        credentials: Credentials,
        settings: &AwsSettings,
    ) -> Result<Self, PipelineError> {
        let endpoint = endpoint(
            settings.textract_endpoint.as_deref(),
            format!("https://textract.{}.amazonaws.com", settings.region),
        )?;
        Ok(Self {
            client,
            signer: Signer::new(credentials, settings.region.clone(), "textract"),
            endpoint,
        })
    }

    /// Issue one signed call and return the decoded JSON body.
    async fn call(&self, target: &str, body: Vec<u8>) -> Result<Value, ServiceError> {
        let path = match self.endpoint.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };
        let headers = vec![
            ("content-type".to_string(), CONTENT_TYPE.to_string()),
            ("host".to_string(), host_header(&self.endpoint)),
            ("x-amz-target".to_string(), target.to_string()),
        ];
        let signed = self.signer.sign(
            SignableRequest {
                method: "POST",
                path: &path,
                headers: headers.clone(),
                payload_hash: sha256_hex(&body),
            },
            Utc::now(),
        );

        let mut request = self.client.post(self.endpoint.clone()).body(body);
        for (name, value) in headers.into_iter().chain(signed) {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| send_error(e, &self.endpoint))?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let (code, message) = json_error(&text);
            return Err(classify_failure(status.as_u16(), code.as_deref(), message));
        }

        serde_json::from_str(&text)
            .map_err(|e| ServiceError::Decode(format!("{} response: {}", target, e)))
    }
}

/// Error code and message from a JSON 1.1 error body.
///
/// The code may carry a namespace (`com.amazonaws...#ThrottlingException`);
/// only the trailing name is kept.
fn json_error(body: &str) -> (Option<String>, String) {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return (None, body.trim().to_string());
    };
    let code = value
        .get("__type")
        .and_then(Value::as_str)
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string());
    let message = value
        .get("message")
        .or_else(|| value.get("Message"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    (code, message)
}

/// Append a result page's documents to `into` and return the next page token.
fn merge_page(into: &mut Value, page: Value) -> Option<String> {
    let next = page
        .get("NextToken")
        .and_then(Value::as_str)
        .map(String::from);

    if let Some(Value::Array(documents)) = page.get("ExpenseDocuments").cloned() {
        match into.get_mut("ExpenseDocuments") {
            Some(Value::Array(existing)) => existing.extend(documents),
            _ => {
                if let Some(map) = into.as_object_mut() {
                    map.insert("ExpenseDocuments".to_string(), Value::Array(documents));
                }
            }
        }
    }
    next
}

#[async_trait]
impl AnalysisService for TextractService {
    async fn submit(&self, object: &RemoteObject) -> Result<JobId, ServiceError> {
        let body = AnalysisRequest::for_object(object).body();
        let response = self.call(START_TARGET, body).await?;
        response
            .get("JobId")
            .and_then(Value::as_str)
            .map(|id| JobId(id.to_string()))
            .ok_or_else(|| ServiceError::Decode("StartExpenseAnalysis returned no JobId".into()))
    }

    async fn get_status(&self, job_id: &JobId) -> Result<StatusReport, ServiceError> {
        let request = |token: Option<&str>| {
            let mut body = json!({ "JobId": job_id.0 });
            if let Some(token) = token {
                body["NextToken"] = Value::String(token.to_string());
            }
            body.to_string().into_bytes()
        };

        let mut payload = self.call(GET_TARGET, request(None)).await?;
        let status = payload
            .get("JobStatus")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| ServiceError::Decode(format!("no JobStatus for job {}", job_id)))?;

        let finished = matches!(
            JobStatus::from_wire(&status),
            Some(JobStatus::Succeeded) | Some(JobStatus::PartialSuccess)
        );
        if finished {
            let mut next = payload
                .as_object_mut()
                .and_then(|map| map.remove("NextToken"))
                .and_then(|v| v.as_str().map(String::from));
            let mut pages = 1;
            while let Some(token) = next {
                let page = self.call(GET_TARGET, request(Some(&token))).await?;
                next = merge_page(&mut payload, page);
                pages += 1;
            }
            if pages > 1 {
                debug!("Job {} result spanned {} pages", job_id, pages);
            }
        }

        Ok(StatusReport { status, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_error_strips_namespace() {
        let (code, message) = json_error(
            r#"{"__type":"com.amazonaws.textract#ProvisionedThroughputExceededException","message":"slow down"}"#,
        );
        assert_eq!(code.as_deref(), Some("ProvisionedThroughputExceededException"));
        assert_eq!(message, "slow down");

        let (code, message) = json_error(r#"{"__type":"InvalidJobIdException","Message":"bad id"}"#);
        assert_eq!(code.as_deref(), Some("InvalidJobIdException"));
        assert_eq!(message, "bad id");

        let (code, message) = json_error("<html>bad gateway</html>");
        assert!(code.is_none());
        assert_eq!(message, "<html>bad gateway</html>");
    }

    #[test]
    fn test_merge_page_appends_documents() {
        let mut payload = json!({
            "JobStatus": "SUCCEEDED",
            "ExpenseDocuments": [{"ExpenseIndex": 1}]
        });
        let next = merge_page(
            &mut payload,
            json!({"ExpenseDocuments": [{"ExpenseIndex": 2}], "NextToken": "t2"}),
        );
        assert_eq!(next.as_deref(), Some("t2"));

        let next = merge_page(&mut payload, json!({"ExpenseDocuments": [{"ExpenseIndex": 3}]}));
        assert!(next.is_none());

        let indexes: Vec<i64> = payload["ExpenseDocuments"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["ExpenseIndex"].as_i64().unwrap())
            .collect();
        assert_eq!(indexes, vec![1, 2, 3]);
    }

    #[test]
    fn test_merge_page_into_payload_without_documents() {
        let mut payload = json!({"JobStatus": "PARTIAL_SUCCESS"});
        merge_page(&mut payload, json!({"ExpenseDocuments": [{"ExpenseIndex": 1}]}));
        assert_eq!(payload["ExpenseDocuments"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_service_endpoint_defaults_to_region() {
        let credentials = Credentials {
            access_key_id: "AKID".into(),
            secret_access_key: "secret".into(),
            session_token: None,
        };
        let service = TextractService::new(
            reqwest::Client::new(),
            credentials,
            &AwsSettings::new("ap-southeast-2"),
        )
        .unwrap();
        assert_eq!(
            service.endpoint.as_str(),
            "https://textract.ap-southeast-2.amazonaws.com/"
        );
    }
}
