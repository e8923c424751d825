//! HTTP client for the writeback API

use async_trait::async_trait;
use reqwest::{header, Client, Response};
use serde::de::DeserializeOwned;
use url::Url;

use cell_store::CellFetcher;
use planner_core::{ApiSettings, Cell, CellId, VersionId};

use crate::api::WritebackApi;
use crate::error::{classify, RequestKind, Result, WritebackError};
use crate::types::*;

/// reqwest-backed `WritebackApi`
pub struct HttpWritebackApi {
    base_url: Url,
    client: Client,
}

impl HttpWritebackApi {
    /// Create a new client
    pub fn new(settings: &ApiSettings) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref token) = settings.token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| WritebackError::InvalidRequest("API token is not a valid header value".into()))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.request_timeout())
            .build()?;

        Ok(Self {
            base_url: Url::parse(&settings.base_url)?,
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `<base>/writeback/cells[/<segments>...]`, each segment percent-encoded
    fn cells_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| WritebackError::InvalidRequest(format!("Base URL cannot have a path: {}", self.base_url)))?;
            path.pop_if_empty().extend(["writeback", "cells"]).extend(segments);
        }
        Ok(url)
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: Response, request: &RequestKind) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            let bytes = response.bytes().await?;
            return Ok(serde_json::from_slice(&bytes)?);
        }

        let body = response.text().await.unwrap_or_default();
        let error = classify(request, status.as_u16(), &body);
        tracing::debug!(status = status.as_u16(), kind = ?error.kind(), "Writeback request failed");
        Err(error)
    }
}

#[async_trait]
impl CellFetcher for HttpWritebackApi {
    type Error = WritebackError;

    async fn fetch_cells(&self, version_id: &VersionId) -> Result<Vec<Cell>> {
        let mut url = self.cells_url(&[])?;
        url.query_pairs_mut().append_pair("version_id", version_id.as_str());

        let response = self.client.get(url).send().await?;
        self.handle_response(response, &RequestKind::FetchCells).await
    }
}

#[async_trait]
impl WritebackApi for HttpWritebackApi {
    async fn update_cell(&self, cell_id: &CellId, request: &UpdateCellRequest) -> Result<CellUpdateResponse> {
        let url = self.cells_url(&[cell_id.as_str()])?;
        let response = self.client.put(url).json(request).send().await?;

        let kind = RequestKind::UpdateCell {
            cell_id: cell_id.clone(),
            expected_version: request.version,
        };
        self.handle_response(response, &kind).await
    }

    async fn batch_update(&self, request: &BatchUpdateRequest) -> Result<BatchUpdateResponse> {
        let url = self.cells_url(&["batch"])?;
        let response = self.client.post(url).json(request).send().await?;
        self.handle_response(response, &RequestKind::BatchUpdate).await
    }

    async fn lock_cell(&self, cell_id: &CellId, request: &LockRequest) -> Result<LockResponse> {
        let url = self.cells_url(&[cell_id.as_str(), "lock"])?;
        let response = self.client.post(url).json(request).send().await?;
        self.handle_response(response, &RequestKind::LockCell { cell_id: cell_id.clone() }).await
    }

    async fn unlock_cell(&self, cell_id: &CellId, request: &UnlockRequest) -> Result<LockResponse> {
        let url = self.cells_url(&[cell_id.as_str(), "lock"])?;
        let response = self.client.delete(url).json(request).send().await?;
        self.handle_response(response, &RequestKind::UnlockCell { cell_id: cell_id.clone() }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use planner_core::{BatchSessionId, CellValue};
    use serde_json::json;
    use wiremock::matchers::{body_json, header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> HttpWritebackApi {
        HttpWritebackApi::new(&ApiSettings {
            base_url: format!("{}/api/v1", server.uri()),
            token: Some("secret".into()),
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_update_cell_success() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/writeback/cells/c1"))
            .and(header_eq("authorization", "Bearer secret"))
            .and(body_json(json!({"value_numeric": 200.0, "version": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "c1",
                "value_numeric": 200.0,
                "version": 2,
                "modified_by": "user-1",
                "modified_at": "2025-01-15T09:30:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = UpdateCellRequest::new(&CellValue::Numeric(200.0), 1);
        let response = api(&server).update_cell(&"c1".into(), &request).await.unwrap();

        assert_eq!(response.version, 2);
        assert_eq!(response.value_numeric, Some(200.0));
        assert_eq!(response.modified_by.unwrap().as_str(), "user-1");
    }

    #[tokio::test]
    async fn test_update_cell_conflict_and_lock() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/writeback/cells/c1"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "detail": {"message": "Cell modified by another user", "cell_id": "c1", "expected_version": 1, "actual_version": 3}
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/writeback/cells/c2"))
            .respond_with(ResponseTemplate::new(423).set_body_json(json!({
                "detail": {"message": "Cell is locked", "cell_id": "c2"}
            })))
            .mount(&server)
            .await;

        let client = api(&server);
        let request = UpdateCellRequest::new(&CellValue::Numeric(5.0), 1);

        let err = client.update_cell(&"c1".into(), &request).await.unwrap_err();
        match err {
            WritebackError::VersionConflict { actual_version, .. } => assert_eq!(actual_version, Some(3)),
            other => panic!("unexpected {:?}", other),
        }

        let err = client.update_cell(&"c2".into(), &request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CellLocked);
    }

    #[tokio::test]
    async fn test_batch_update_partial_conflict() {
        let server = MockServer::start().await;
        let session_id = BatchSessionId::new();
        Mock::given(method("POST"))
            .and(path("/api/v1/writeback/cells/batch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "session_id": session_id,
                "updated_count": 1,
                "conflicts": [{"cell_id": "c2", "expected_version": 1, "actual_version": 2, "message": "stale"}]
            })))
            .mount(&server)
            .await;

        let request = BatchUpdateRequest {
            session_id,
            updates: vec![
                BatchUpdateItem { cell_id: "c1".into(), value_numeric: Some(1.0), value_text: None, version: 1 },
                BatchUpdateItem { cell_id: "c2".into(), value_numeric: Some(2.0), value_text: None, version: 1 },
            ],
        };
        let response = api(&server).batch_update(&request).await.unwrap();
        assert_eq!(response.updated_count, 1);
        assert_eq!(response.conflicts[0].cell_id.as_str(), "c2");
    }

    #[tokio::test]
    async fn test_batch_hard_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/writeback/cells/batch"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "detail": {"message": "Batch rejected", "conflicts": [
                    {"cell_id": "c1", "expected_version": 1, "actual_version": 4}
                ]}
            })))
            .mount(&server)
            .await;

        let request = BatchUpdateRequest { session_id: BatchSessionId::new(), updates: Vec::new() };
        match api(&server).batch_update(&request).await.unwrap_err() {
            WritebackError::BatchConflict { conflicts, .. } => assert_eq!(conflicts.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/writeback/cells/c1/lock"))
            .and(body_json(json!({"lock_reason": "manual"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "c1", "is_locked": true, "lock_reason": "manual",
                "locked_by": "user-1", "locked_at": "2025-01-15T09:30:00Z"
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/writeback/cells/c1/lock"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "c1", "is_locked": false, "lock_reason": null, "locked_by": null, "locked_at": null
            })))
            .mount(&server)
            .await;

        let client = api(&server);
        let locked = client
            .lock_cell(&"c1".into(), &LockRequest { lock_reason: Some("manual".into()) })
            .await
            .unwrap();
        assert!(locked.is_locked);

        let unlocked = client.unlock_cell(&"c1".into(), &UnlockRequest::default()).await.unwrap();
        assert!(!unlocked.is_locked);
    }

    #[tokio::test]
    async fn test_fetch_cells_by_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/writeback/cells"))
            .and(query_param("version_id", "v1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": "c1", "version_id": "v1", "module_code": "revenue", "entity_id": "fees",
                "field_name": "tuition", "value_numeric": 100.0, "version": 1
            }])))
            .mount(&server)
            .await;

        let cells = api(&server).fetch_cells(&VersionId::new("v1")).await.unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].value_numeric, Some(100.0));
    }

    #[tokio::test]
    async fn test_cell_ids_are_percent_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/writeback/cells/a%2Fb/lock"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = api(&server).lock_cell(&"a/b".into(), &LockRequest::default()).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
    }
}
