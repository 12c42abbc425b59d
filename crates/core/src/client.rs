//! Blocking client for the render server's upload / prompt / history / view API.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RenderConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::naming::{ArtifactNamer, DiskSequenceNamer};
use crate::workflow::JobGraph;

/// Asset type the server expects for reference inputs.
pub const DEFAULT_ASSET_TYPE: &str = "input";

const UPLOAD_ENDPOINT: &str = "/upload/image";
const PROMPT_ENDPOINT: &str = "/prompt";
const VIEW_ENDPOINT: &str = "/view";

/// Identifier the server uses to group a caller's jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `client_<unix-microseconds>` taken from the wall clock.
    pub fn from_clock() -> Self {
        Self(format!("client_{}", Utc::now().timestamp_micros()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedAsset {
    pub name: String,
    pub subfolder: String,
}

impl UploadedAsset {
    /// The identifier a job graph uses to refer to this asset.
    pub fn reference(&self) -> String {
        if self.subfolder.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.subfolder, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    pub client_session_id: SessionId,
}

/// A finished job as reported by the history endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutputs>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gifs: Option<Vec<RemoteFile>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub videos: Option<Vec<RemoteFile>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<RemoteFile>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeOutputs {
    pub fn files(&self, category: ArtifactCategory) -> &[RemoteFile] {
        let files = match category {
            ArtifactCategory::Gifs => &self.gifs,
            ArtifactCategory::Videos => &self.videos,
            ArtifactCategory::Images => &self.images,
        };
        files.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: ArtifactKind,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Storage area a remote file lives in; unknown values pass through to `/view`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ArtifactKind {
    #[default]
    Output,
    Input,
    Temp,
    Other(String),
}

impl ArtifactKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Output => "output",
            Self::Input => "input",
            Self::Temp => "temp",
            Self::Other(raw) => raw,
        }
    }
}

impl From<String> for ArtifactKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "output" => Self::Output,
            "input" => Self::Input,
            "temp" => Self::Temp,
            _ => Self::Other(raw),
        }
    }
}

impl From<ArtifactKind> for String {
    fn from(kind: ArtifactKind) -> Self {
        kind.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactCategory {
    Gifs,
    Videos,
    Images,
}

impl ArtifactCategory {
    /// Categories in the order their files are downloaded.
    pub const ALL: [ArtifactCategory; 3] = [Self::Gifs, Self::Videos, Self::Images];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gifs => "gifs",
            Self::Videos => "videos",
            Self::Images => "images",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub remote_filename: String,
    pub subfolder: String,
    pub kind: ArtifactKind,
    pub category: ArtifactCategory,
}

impl CompletionRecord {
    /// Every downloadable file, node by node, gifs before videos before images.
    pub fn artifacts(&self) -> Vec<ArtifactDescriptor> {
        let mut artifacts = Vec::new();
        for outputs in self.outputs.values() {
            for category in ArtifactCategory::ALL {
                artifacts.extend(outputs.files(category).iter().map(|file| {
                    ArtifactDescriptor {
                        remote_filename: file.filename.clone(),
                        subfolder: file.subfolder.clone(),
                        kind: file.kind.clone(),
                        category,
                    }
                }));
            }
        }
        artifacts
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    name: String,
    #[serde(default)]
    subfolder: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnqueueResponse {
    prompt_id: String,
}

pub struct RenderJobClient {
    base_url: String,
    http: Client,
    session: SessionId,
    poll_interval: Duration,
    namer: Box<dyn ArtifactNamer>,
}

impl RenderJobClient {
    pub fn from_config(config: &RenderConfig, session: SessionId) -> PipelineResult<Self> {
        let base_url = validate_base_url(&config.base_url)?;
        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(PipelineError::HttpClient)?;

        Ok(Self {
            base_url,
            http,
            session,
            poll_interval: config.poll_interval(),
            namer: Box::new(DiskSequenceNamer::new()),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_namer(mut self, namer: Box<dyn ArtifactNamer>) -> Self {
        self.namer = namer;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn upload_asset(&self, local_path: &Path, asset_type: &str) -> PipelineResult<UploadedAsset> {
        if !local_path.exists() {
            return Err(PipelineError::NotFound(local_path.to_path_buf()));
        }

        let upload_error = |message: String| PipelineError::Upload {
            path: local_path.to_path_buf(),
            message,
        };

        let file_name = local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let bytes = fs::read(local_path).map_err(|err| PipelineError::io(local_path, err))?;
        let mime = mime_guess::from_path(local_path).first_or_octet_stream();
        info!(file = %file_name, size = bytes.len(), "uploading asset");

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime.essence_str())
            .map_err(|err| upload_error(format!("invalid mime type {mime}: {err}")))?;
        let form = Form::new()
            .part("image", part)
            .text("type", asset_type.to_string())
            .text("overwrite", "true");

        let url = self.endpoint(UPLOAD_ENDPOINT)?;
        let response = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .map_err(|err| upload_error(format!("request failed: {err}")))?;
        let response = ensure_success(response).map_err(upload_error)?;

        let decoded: UploadResponse = response
            .json()
            .map_err(|err| upload_error(format!("invalid upload response: {err}")))?;
        let asset = UploadedAsset {
            name: decoded.name,
            subfolder: decoded.subfolder.unwrap_or_default(),
        };
        info!(reference = %asset.reference(), "asset uploaded");
        Ok(asset)
    }

    pub fn enqueue(&self, graph: &JobGraph) -> PipelineResult<JobHandle> {
        let url = self.endpoint(PROMPT_ENDPOINT)?;
        let body = json!({
            "prompt": graph,
            "client_id": self.session.as_str(),
        });

        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .map_err(|err| PipelineError::Submit(format!("request failed: {err}")))?;
        let response = ensure_success(response).map_err(PipelineError::Submit)?;
        let decoded: EnqueueResponse = response
            .json()
            .map_err(|err| PipelineError::Submit(format!("invalid prompt response: {err}")))?;

        info!(job_id = %decoded.prompt_id, nodes = graph.len(), "job queued");
        Ok(JobHandle {
            id: decoded.prompt_id,
            client_session_id: self.session.clone(),
        })
    }

    /// Poll the history endpoint until the job shows up or `timeout` elapses.
    ///
    /// No request is issued once the deadline has passed.
    pub fn await_completion(
        &self,
        handle: &JobHandle,
        timeout: Duration,
    ) -> PipelineResult<CompletionRecord> {
        let poll_error = |message: String| PipelineError::Poll {
            job_id: handle.id.clone(),
            message,
        };
        let url = self.endpoint(&format!("/history/{}", handle.id))?;
        let started = Instant::now();
        let mut polls = 0u32;

        loop {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(job_id = %handle.id, polls, "job did not complete in time");
                return Err(PipelineError::Timeout {
                    job_id: handle.id.clone(),
                    timeout,
                });
            }

            polls += 1;
            let response = self
                .http
                .get(url.clone())
                .send()
                .map_err(|err| poll_error(format!("request failed: {err}")))?;
            let response = ensure_success(response).map_err(poll_error)?;
            let mut history: Map<String, Value> = response
                .json()
                .map_err(|err| poll_error(format!("invalid history response: {err}")))?;

            if let Some(entry) = history.remove(&handle.id) {
                let record: CompletionRecord = serde_json::from_value(entry)
                    .map_err(|err| poll_error(format!("invalid history entry: {err}")))?;
                info!(
                    job_id = %handle.id,
                    polls,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
                return Ok(record);
            }

            debug!(job_id = %handle.id, polls, "job still running");
            let remaining = timeout.saturating_sub(started.elapsed());
            thread::sleep(self.poll_interval.min(remaining));
        }
    }

    /// Download every artifact of `record` into `destination_dir`.
    pub fn fetch_artifacts(
        &self,
        record: &CompletionRecord,
        destination_dir: &Path,
    ) -> PipelineResult<Vec<PathBuf>> {
        fs::create_dir_all(destination_dir)
            .map_err(|err| PipelineError::io(destination_dir, err))?;

        let artifacts = record.artifacts();
        debug!(
            nodes = record.outputs.len(),
            artifacts = artifacts.len(),
            "collected artifacts from completion record"
        );

        artifacts
            .iter()
            .map(|artifact| self.fetch_artifact(artifact, destination_dir))
            .collect()
    }

    pub fn fetch_artifact(
        &self,
        artifact: &ArtifactDescriptor,
        destination_dir: &Path,
    ) -> PipelineResult<PathBuf> {
        let download_error = |message: String| PipelineError::Download {
            filename: artifact.remote_filename.clone(),
            message,
        };

        let url = self.view_url(artifact)?;
        let response = self
            .http
            .get(url)
            .send()
            .map_err(|err| download_error(format!("request failed: {err}")))?;
        let mut response = ensure_success(response).map_err(download_error)?;

        let local_name = self
            .namer
            .assign(destination_dir, &artifact.remote_filename)?;
        let final_path = destination_dir.join(&local_name);
        let part_path = destination_dir.join(format!("{local_name}.part"));

        let mut part_file =
            File::create(&part_path).map_err(|err| PipelineError::io(&part_path, err))?;
        let mut part_guard = PartFileGuard::new(&part_path);

        let bytes = response
            .copy_to(&mut part_file)
            .map_err(|err| download_error(format!("failed while reading body: {err}")))?;
        part_file
            .flush()
            .map_err(|err| PipelineError::io(&part_path, err))?;
        drop(part_file);

        fs::rename(&part_path, &final_path).map_err(|err| PipelineError::io(&final_path, err))?;
        part_guard.disarm();

        info!(
            remote = %artifact.remote_filename,
            category = artifact.category.as_str(),
            path = %final_path.display(),
            bytes,
            "artifact saved"
        );
        Ok(final_path)
    }

    pub fn view_url(&self, artifact: &ArtifactDescriptor) -> PipelineResult<Url> {
        let mut url = self.endpoint(VIEW_ENDPOINT)?;
        url.query_pairs_mut()
            .append_pair("filename", &artifact.remote_filename)
            .append_pair("subfolder", &artifact.subfolder)
            .append_pair("type", artifact.kind.as_str());
        Ok(url)
    }

    fn endpoint(&self, path: &str) -> PipelineResult<Url> {
        let raw = format!("{}{path}", self.base_url);
        Url::parse(&raw).map_err(|err| PipelineError::InvalidUrl {
            url: raw,
            reason: err.to_string(),
        })
    }
}

fn validate_base_url(raw: &str) -> PipelineResult<String> {
    let invalid = |reason: String| PipelineError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };

    let parsed = Url::parse(raw.trim()).map_err(|err| invalid(err.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }

    debug!(base_url = %redacted_url_for_display(&parsed), "render server configured");
    Ok(raw.trim().trim_end_matches('/').to_string())
}

/// Hide credentials embedded in the server URL before it reaches the logs.
fn redacted_url_for_display(url: &Url) -> String {
    let mut redacted = url.clone();
    if redacted.password().is_some() {
        let _ = redacted.set_password(Some("<redacted>"));
    }
    if redacted.query().is_some() {
        redacted.set_query(Some("<redacted>"));
    }
    redacted.to_string()
}

fn ensure_success(response: Response) -> Result<Response, String> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(format!("server returned {status}: {}", body.trim()))
}

struct PartFileGuard<'a> {
    path: &'a Path,
    keep: bool,
}

impl<'a> PartFileGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, keep: false }
    }

    fn disarm(&mut self) {
        self.keep = true;
    }
}

impl Drop for PartFileGuard<'_> {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(self.path);
        }
    }
}
