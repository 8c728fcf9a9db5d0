//! [`RemoteStore`] over the Seafile `api2` REST endpoints.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use crate::config::ServerConfig;
use crate::error::{FsError, Result};
use crate::storage::{Library, RawEntry, RemoteStore};

const JSON: &str = "application/json; charset=utf-8";

#[derive(Deserialize)]
struct AuthToken {
    token: String,
}

pub struct SeafileClient {
    http: reqwest::Client,
    config: ServerConfig,
    token: RwLock<Option<String>>,
}

impl std::fmt::Debug for SeafileClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeafileClient")
            .field("server", &self.config.server)
            .field("username", &self.config.username)
            .finish()
    }
}

impl SeafileClient {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }
        Self::with_http_client(config, builder.build()?)
    }

    /// Uses a caller-built HTTP client, e.g. one with its own proxy or TLS
    /// settings. The config's timeout is not applied.
    pub fn with_http_client(config: ServerConfig, http: reqwest::Client) -> Result<Self> {
        config.validate()?;
        let token = config.auth_token.clone();

        Ok(Self {
            http,
            config,
            token: RwLock::new(token),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Logs in with username and password and keeps the returned token.
    pub async fn connect(&self) -> Result<String> {
        let password = self.config.password.as_deref().ok_or_else(|| {
            FsError::Unauthorized(format!("no password configured for {}", self.config.username))
        })?;
        info!("connecting to {} as {}", self.config.base_url(), self.config.username);

        let response = self
            .http
            .post(self.url("/api2/auth-token/"))
            .header(ACCEPT, JSON)
            .form(&[("username", self.config.username.as_str()), ("password", password)])
            .send()
            .await?;
        let body: AuthToken = check(response).await?.json().await?;

        *self.token.write().await = Some(body.token.clone());
        debug!("connect: token acquired for {}", self.config.username);
        Ok(body.token)
    }

    /// Server version string from `/api2/server-info/`.
    pub async fn server_version(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct ServerInfo {
            version: String,
        }
        let info: ServerInfo = self
            .send(|http| http.get(self.url("/api2/server-info/")))
            .await?
            .json()
            .await?;
        Ok(info.version)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url(), path)
    }

    fn repo_url(&self, library_id: &str, endpoint: &str) -> String {
        self.url(&format!("/api2/repos/{}/{}", library_id, endpoint))
    }

    async fn token(&self) -> Result<String> {
        let cached = self.token.read().await.clone();
        match cached {
            Some(token) => Ok(token),
            None => self.connect().await,
        }
    }

    /// Sends an authenticated request. A 401 answer triggers one fresh login
    /// and one retry; `build` is called again for the retry.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder + Send + Sync,
    {
        let token = self.token().await?;
        let response = build(&self.http)
            .header(ACCEPT, JSON)
            .header(AUTHORIZATION, format!("Token {}", token))
            .send()
            .await?;
        debug!("{} {}", response.status().as_u16(), response.url());

        if response.status() != StatusCode::UNAUTHORIZED || self.config.password.is_none() {
            return check(response).await;
        }

        warn!("token rejected by {}, logging in again", self.config.base_url());
        let token = self.connect().await?;
        let response = build(&self.http)
            .header(ACCEPT, JSON)
            .header(AUTHORIZATION, format!("Token {}", token))
            .send()
            .await?;
        check(response).await
    }
}

/// Maps non-2xx answers onto [`FsError`].
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        url
    } else {
        format!("{}: {}", url, body.trim())
    };
    Err(status_error(status.as_u16(), message))
}

fn status_error(status: u16, message: String) -> FsError {
    match status {
        404 => FsError::NotFound(message),
        409 => FsError::Conflict(message),
        401 | 403 => FsError::Unauthorized(message),
        440 | 441 => FsError::Unauthorized(format!("library password required: {}", message)),
        _ => FsError::Remote { status, message },
    }
}

fn remote_path(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

fn split_parent(path: &str) -> (&str, &str) {
    let path = path.trim_matches('/');
    path.rsplit_once('/').unwrap_or(("", path))
}

#[async_trait]
impl RemoteStore for SeafileClient {
    async fn list_libraries(&self) -> Result<Vec<Library>> {
        let libraries = self
            .send(|http| http.get(self.url("/api2/repos/")))
            .await?
            .json()
            .await?;
        Ok(libraries)
    }

    async fn get_library_info(&self, library_id: &str) -> Result<Library> {
        let library = self
            .send(|http| http.get(self.repo_url(library_id, "")))
            .await?
            .json()
            .await?;
        Ok(library)
    }

    async fn list_directory(&self, library_id: &str, path: &str) -> Result<Vec<RawEntry>> {
        let p = remote_path(path);
        let entries = self
            .send(|http| http.get(self.repo_url(library_id, "dir/")).query(&[("p", p.as_str())]))
            .await?
            .json()
            .await?;
        Ok(entries)
    }

    async fn create_directory(&self, library_id: &str, path: &str) -> Result<()> {
        let p = remote_path(path);
        self.send(|http| {
            http.post(self.repo_url(library_id, "dir/"))
                .query(&[("p", p.as_str())])
                .form(&[("operation", "mkdir")])
        })
        .await?;
        Ok(())
    }

    async fn delete_file(&self, library_id: &str, path: &str) -> Result<()> {
        let p = remote_path(path);
        self.send(|http| http.delete(self.repo_url(library_id, "file/")).query(&[("p", p.as_str())]))
            .await?;
        Ok(())
    }

    async fn delete_directory(&self, library_id: &str, path: &str) -> Result<()> {
        let p = remote_path(path);
        self.send(|http| http.delete(self.repo_url(library_id, "dir/")).query(&[("p", p.as_str())]))
            .await?;
        Ok(())
    }

    async fn get_file_info(&self, library_id: &str, path: &str) -> Result<RawEntry> {
        let (parent, name) = split_parent(path);
        if name.is_empty() {
            return Ok(RawEntry::dir(""));
        }
        // file/detail only covers files; the parent listing covers both kinds
        self.list_directory(library_id, parent)
            .await?
            .into_iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| FsError::NotFound(format!("{}{}", library_id, remote_path(path))))
    }

    async fn download_object(&self, library_id: &str, path: &str) -> Result<Vec<u8>> {
        let p = remote_path(path);
        if p == "/" {
            return Err(FsError::FileExpected(library_id.to_string()));
        }
        let link = self
            .send(|http| http.get(self.repo_url(library_id, "file/")).query(&[("p", p.as_str())]))
            .await;
        let link: String = match link {
            Ok(response) => response.json().await?,
            Err(e @ (FsError::NotFound(_) | FsError::Remote { status: 400, .. })) => {
                return match self.get_file_info(library_id, path).await {
                    Ok(entry) if !entry.is_file() => Err(FsError::FileExpected(format!("{}{}", library_id, p))),
                    _ => Err(e),
                };
            }
            Err(e) => return Err(e),
        };

        let response = check(self.http.get(&link).send().await?).await?;
        let data = response.bytes().await?;
        debug!("download: {}{} ({} bytes)", library_id, p, data.len());
        Ok(data.to_vec())
    }

    async fn upload_object(&self, library_id: &str, path: &str, data: &[u8]) -> Result<()> {
        let (parent, name) = split_parent(path);
        if name.is_empty() {
            return Err(FsError::FileExpected(library_id.to_string()));
        }
        let parent_dir = remote_path(parent);
        let link: String = self
            .send(|http| {
                http.get(self.repo_url(library_id, "upload-link/"))
                    .query(&[("p", parent_dir.as_str())])
            })
            .await?
            .json()
            .await?;

        self.send(|http| {
            let part = Part::bytes(data.to_vec()).file_name(name.to_string());
            let form = Form::new()
                .text("parent_dir", parent_dir.clone())
                .text("replace", "1")
                .part("file", part);
            http.post(&link).query(&[("ret-json", "1")]).multipart(form)
        })
        .await?;
        debug!("upload: {}{} ({} bytes)", library_id, remote_path(path), data.len());
        Ok(())
    }
}
