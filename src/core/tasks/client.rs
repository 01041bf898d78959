//! Task service REST client.
//!
//! Thin client for a TickTick-style open API. Authentication is a
//! pre-obtained OAuth bearer token; acquiring and refreshing it happens
//! out-of-band.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{BridgeError, BridgeResult};

/// Open task status code.
pub const TASK_STATUS_OPEN: i64 = 0;
/// Completed task status code.
pub const TASK_STATUS_COMPLETED: i64 = 2;

/// A task as the service returns it. Only the fields the tools consume.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub is_all_day: Option<bool>,
}

impl Task {
    pub fn is_completed(&self) -> bool {
        self.status == TASK_STATUS_COMPLETED
    }
}

/// Payload for task creation.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_all_day: Option<bool>,
    /// 0 none, 1 low, 3 medium, 5 high.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

/// A project (task list).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
}

/// Response shape of the project data endpoint.
#[derive(Debug, Deserialize)]
struct ProjectData {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Client for the task service.
#[derive(Clone)]
pub struct TaskClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl TaskClient {
    pub fn new(base_url: &str, access_token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        }
    }

    pub async fn create_task(&self, task: &NewTask) -> BridgeResult<Task> {
        debug!(title = %task.title, "creating task");
        let response = self
            .http
            .post(format!("{}/task", self.base_url))
            .bearer_auth(&self.access_token)
            .json(task)
            .send()
            .await?;
        Self::parse(response).await
    }

    pub async fn list_tasks(&self, project_id: &str) -> BridgeResult<Vec<Task>> {
        let response = self
            .http
            .get(format!("{}/project/{project_id}/data", self.base_url))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let data: ProjectData = Self::parse(response).await?;
        Ok(data.tasks)
    }

    pub async fn complete_task(&self, project_id: &str, task_id: &str) -> BridgeResult<()> {
        let response = self
            .http
            .post(format!(
                "{}/project/{project_id}/task/{task_id}/complete",
                self.base_url
            ))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        Self::check(response).await
    }

    pub async fn delete_task(&self, project_id: &str, task_id: &str) -> BridgeResult<()> {
        let response = self
            .http
            .delete(format!(
                "{}/project/{project_id}/task/{task_id}",
                self.base_url
            ))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        Self::check(response).await
    }

    pub async fn list_projects(&self) -> BridgeResult<Vec<Project>> {
        let response = self
            .http
            .get(format!("{}/project", self.base_url))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> BridgeResult<T> {
        let status = response.status();
        if !status.is_success() {
            return Err(Self::service_error(status, response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| BridgeError::TaskService(format!("invalid response body: {e}")))
    }

    async fn check(response: reqwest::Response) -> BridgeResult<()> {
        let status = response.status();
        if !status.is_success() {
            return Err(Self::service_error(status, response).await);
        }
        Ok(())
    }

    async fn service_error(status: StatusCode, response: reqwest::Response) -> BridgeError {
        let body = response.text().await.unwrap_or_default();
        let detail = if body.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {body}")
        };
        BridgeError::TaskService(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_create_task_posts_bearer_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/task"))
            .and(header("authorization", "Bearer tok"))
            .and(body_partial_json(json!({"title": "Buy milk", "priority": 5})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "t1",
                "projectId": "inbox",
                "title": "Buy milk",
                "status": 0,
                "priority": 5
            })))
            .mount(&server)
            .await;

        let client = TaskClient::new(&server.uri(), "tok");
        let task = client
            .create_task(&NewTask {
                title: "Buy milk".into(),
                priority: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(task.id, "t1");
        assert!(!task.is_completed());
    }

    #[tokio::test]
    async fn test_list_tasks_unwraps_project_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/project/inbox/data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "project": {"id": "inbox", "name": "Inbox"},
                "tasks": [
                    {"id": "t1", "title": "Buy milk", "status": 0},
                    {"id": "t2", "title": "Call dentist", "status": 2}
                ]
            })))
            .mount(&server)
            .await;

        let client = TaskClient::new(&server.uri(), "tok");
        let tasks = client.list_tasks("inbox").await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[1].is_completed());
    }

    #[tokio::test]
    async fn test_service_error_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/project/inbox/task/t9"))
            .respond_with(ResponseTemplate::new(404).set_body_string("task not found"))
            .mount(&server)
            .await;

        let client = TaskClient::new(&server.uri(), "tok");
        let err = client.delete_task("inbox", "t9").await.unwrap_err();
        match err {
            BridgeError::TaskService(detail) => {
                assert!(detail.contains("404"));
                assert!(detail.contains("task not found"));
            }
            other => panic!("expected TaskService, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_complete_task_hits_complete_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/project/p1/task/t1/complete"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = TaskClient::new(&server.uri(), "tok");
        client.complete_task("p1", "t1").await.unwrap();
    }
}
