//! Reference image + narration in, rendered avatar clips out.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::client::{RenderJobClient, DEFAULT_ASSET_TYPE};
use crate::error::{PipelineError, PipelineResult};
use crate::workflow::{JobGraph, WorkflowParameterizer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarRequest {
    pub image: PathBuf,
    pub audio: PathBuf,
    pub output_dir: PathBuf,
    /// `<width>x<height>`; invalid values are logged and ignored.
    pub resolution: Option<String>,
}

/// Upload both references, bind them into `graph`, run the job and download
/// what it produced into `request.output_dir`.
pub fn generate_avatar_video(
    client: &RenderJobClient,
    parameterizer: &WorkflowParameterizer,
    graph: JobGraph,
    request: &AvatarRequest,
    timeout: Duration,
) -> PipelineResult<Vec<PathBuf>> {
    let started = Instant::now();
    if graph.is_empty() {
        return Err(PipelineError::Workflow(
            "workflow has no nodes to render".to_string(),
        ));
    }

    let image = client.upload_asset(&request.image, DEFAULT_ASSET_TYPE)?;
    let audio = client.upload_asset(&request.audio, DEFAULT_ASSET_TYPE)?;

    let graph = parameterizer.bind(
        graph,
        &image.reference(),
        &audio.reference(),
        request.resolution.as_deref(),
    );

    let handle = client.enqueue(&graph)?;
    let record = client.await_completion(&handle, timeout)?;
    let files = client.fetch_artifacts(&record, &request.output_dir)?;

    if files.is_empty() {
        warn!(job_id = %handle.id, "job finished without any downloadable output");
    } else {
        info!(
            job_id = %handle.id,
            count = files.len(),
            output_dir = %request.output_dir.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "avatar video generated"
        );
        for file in &files {
            info!(path = %file.display(), "produced");
        }
    }

    Ok(files)
}
