//! Thin reqwest client for a running `delve-api` server.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use delve_core::{ExplainFormat, SecretValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{Value, json};
use uuid::Uuid;

pub struct ApiClient {
    base_url: String,
    token: Option<SecretValue>,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: Option<SecretValue>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            http: Client::new(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value> {
        let response = builder
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.base_url))?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        let text = response.text().await.context("failed to read response body")?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        if !status.is_success() {
            let message = body["error"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string());
            bail!("server returned {status}: {message}");
        }
        Ok(body)
    }

    /// Start a session. Documents are sent in the same multipart request so
    /// they are attached before the session is scheduled.
    pub async fn start_session(
        &self,
        query: &str,
        parent_id: Option<Uuid>,
        documents: &[PathBuf],
    ) -> Result<Value> {
        let builder = self.request(Method::POST, "/api/sessions");
        if documents.is_empty() {
            let body = json!({ "query": query, "parent_id": parent_id });
            return self.send(builder.json(&body)).await;
        }

        let mut form = Form::new().text("query", query.to_string());
        if let Some(parent_id) = parent_id {
            form = form.text("parent_id", parent_id.to_string());
        }
        let form = attach_files(form, documents).await?;
        self.send(builder.multipart(form)).await
    }

    pub async fn continue_session(
        &self,
        parent_id: Uuid,
        query: &str,
        documents: &[PathBuf],
    ) -> Result<Value> {
        let builder = self.request(Method::POST, &format!("/api/sessions/{parent_id}/continue"));
        if documents.is_empty() {
            return self.send(builder.json(&json!({ "query": query }))).await;
        }

        let form = attach_files(Form::new().text("query", query.to_string()), documents).await?;
        self.send(builder.multipart(form)).await
    }

    pub async fn upload(
        &self,
        session_id: Uuid,
        path: &Path,
        file_type: Option<&str>,
    ) -> Result<Value> {
        let mut form = Form::new().part("file", file_part(path).await?);
        if let Some(file_type) = file_type {
            form = form.text("file_type", file_type.to_string());
        }

        let route = format!("/api/sessions/{session_id}/documents");
        self.send(self.request(Method::POST, &route).multipart(form))
            .await
    }

    pub async fn session(&self, session_id: Uuid, explain: Option<ExplainFormat>) -> Result<Value> {
        let mut builder = self.request(Method::GET, &format!("/api/sessions/{session_id}"));
        if let Some(format) = explain {
            builder = builder.query(&[("explain", format.as_str())]);
        }
        self.send(builder).await
    }

    pub async fn lineage(&self, session_id: Uuid) -> Result<Value> {
        self.send(self.request(Method::GET, &format!("/api/sessions/{session_id}/lineage")))
            .await
    }

    pub async fn history(&self, limit: usize, parent_id: Option<Uuid>) -> Result<Value> {
        let mut builder = self
            .request(Method::GET, "/api/sessions")
            .query(&[("limit", limit.to_string())]);
        if let Some(parent_id) = parent_id {
            builder = builder.query(&[("parent_id", parent_id.to_string())]);
        }
        self.send(builder).await
    }

    pub async fn delete(&self, session_id: Uuid) -> Result<()> {
        self.send(self.request(Method::DELETE, &format!("/api/sessions/{session_id}")))
            .await?;
        Ok(())
    }
}

async fn file_part(path: &Path) -> Result<Part> {
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))?;
    Ok(Part::bytes(content).file_name(name))
}

async fn attach_files(mut form: Form, paths: &[PathBuf]) -> Result<Form> {
    for path in paths {
        form = form.part("file", file_part(path).await?);
    }
    Ok(form)
}
