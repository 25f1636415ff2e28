//! HTTP registry client
//!
//! Talks to the hub's registry endpoints. Bulk updates post the batch to
//! `/devices`; the hub applies what it can and reports per-item failures in
//! the body, so only transport and batch-level rejections become errors
//! here.

use super::{BulkRegistryOperationResult, RegistryApi, Twin};
use crate::error::{DeviceError, DeviceResult};
use crate::transport::settings::API_VERSION;
use crate::transport::TransportError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    sas_token: Option<String>,
}

/// One entry of a bulk `/devices` request
#[derive(Serialize)]
struct ExportImportDevice<'a> {
    #[serde(rename = "id")]
    device_id: &'a str,
    #[serde(rename = "importMode")]
    import_mode: &'static str,
    tags: &'a Map<String, Value>,
    properties: ImportProperties<'a>,
    #[serde(rename = "twinETag", skip_serializing_if = "Option::is_none")]
    etag: Option<&'a str>,
}

#[derive(Serialize)]
struct ImportProperties<'a> {
    desired: &'a Map<String, Value>,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>, sas_token: Option<String>) -> DeviceResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::protocol("http client construction failed", e))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            sas_token,
        })
    }

    fn twin_url(&self, device_id: &str) -> String {
        format!(
            "{}/twins/{}?api-version={}",
            self.base_url, device_id, API_VERSION
        )
    }

    fn bulk_url(&self) -> String {
        format!("{}/devices?api-version={}", self.base_url, API_VERSION)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.sas_token {
            Some(token) => request.header("Authorization", token.clone()),
            None => request,
        }
    }
}

fn rejection(status: StatusCode, operation: &str) -> DeviceError {
    DeviceError::Transport(TransportError::Rejected {
        status: status.as_u16(),
        permanent: matches!(status.as_u16(), 400 | 401 | 403 | 404),
        message: format!("{operation} returned {status}"),
    })
}

#[async_trait]
impl RegistryApi for RegistryClient {
    async fn get_twin(&self, device_id: &str) -> DeviceResult<Twin> {
        let response = self
            .authorize(self.http.get(self.twin_url(device_id)))
            .send()
            .await
            .map_err(|e| TransportError::protocol("twin fetch failed", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(rejection(status, "twin fetch"));
        }
        let twin = response
            .json::<Twin>()
            .await
            .map_err(|e| TransportError::protocol("twin decode failed", e))?;
        Ok(twin)
    }

    async fn update_twins_bulk(
        &self,
        twins: Vec<Twin>,
        force_replace: bool,
    ) -> DeviceResult<BulkRegistryOperationResult> {
        let import_mode = if force_replace {
            "ReplaceTwin"
        } else {
            "UpdateTwin"
        };
        let batch: Vec<ExportImportDevice<'_>> = twins
            .iter()
            .map(|twin| ExportImportDevice {
                device_id: &twin.device_id,
                import_mode,
                tags: &twin.tags,
                properties: ImportProperties {
                    desired: &twin.properties.desired,
                },
                etag: twin.etag.as_deref(),
            })
            .collect();

        debug!(count = batch.len(), import_mode, "posting bulk twin update");
        let response = self
            .authorize(self.http.post(self.bulk_url()).json(&batch))
            .send()
            .await
            .map_err(|e| TransportError::protocol("bulk twin update failed", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(rejection(status, "bulk twin update"));
        }

        // An empty body means every item was applied
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::protocol("bulk result read failed", e))?;
        if body.is_empty() {
            return Ok(BulkRegistryOperationResult::success());
        }
        let result: BulkRegistryOperationResult = serde_json::from_slice(&body)?;
        Ok(result)
    }
}
