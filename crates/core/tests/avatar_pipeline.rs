mod support;

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use avatarflow_core::client::{RenderJobClient, SessionId};
use avatarflow_core::config::RenderConfig;
use avatarflow_core::pipeline::{generate_avatar_video, AvatarRequest};
use avatarflow_core::workflow::{JobGraph, WorkflowParameterizer};
use avatarflow_core::PipelineError;
use serde_json::json;
use support::{StubResponse, StubServer};
use tempfile::tempdir;

fn avatar_workflow() -> JobGraph {
    JobGraph::from_value(json!({
        "3": { "class_type": "LoadImage", "inputs": { "image": "placeholder.png", "upload": "image" } },
        "7": { "class_type": "VH_LoadAudio", "inputs": { "audio": "placeholder.mp3", "seek_seconds": 0 } },
        "12": {
            "class_type": "ImageResize",
            "inputs": { "image": ["3", 0], "width": 512, "height": 512 },
            "_meta": { "title": "Resize" }
        },
        "20": { "class_type": "VHS_VideoCombine", "inputs": { "frame_rate": 25 } }
    }))
    .expect("workflow graph")
}

/// Render server that finishes the job on the second history poll.
fn render_server() -> StubServer {
    let uploads = AtomicUsize::new(0);
    let polls = AtomicUsize::new(0);
    StubServer::start(move |request| match request.path() {
        "/upload/image" => {
            let name = if uploads.fetch_add(1, Ordering::SeqCst) == 0 {
                "face.png"
            } else {
                "narration.mp3"
            };
            StubResponse::json(json!({ "name": name, "subfolder": "avatar", "type": "input" }))
        }
        "/prompt" => StubResponse::json(json!({ "prompt_id": "job-7", "number": 1 })),
        "/history/job-7" => {
            if polls.fetch_add(1, Ordering::SeqCst) == 0 {
                StubResponse::json(json!({}))
            } else {
                StubResponse::json(json!({
                    "job-7": {
                        "outputs": {
                            "20": {
                                "gifs": [{
                                    "filename": "AvatarGen_00001.mp4",
                                    "subfolder": "",
                                    "type": "output",
                                    "format": "video/h264-mp4"
                                }]
                            }
                        },
                        "status": { "status_str": "success", "completed": true }
                    }
                }))
            }
        }
        "/view" => StubResponse::bytes(b"rendered-mp4".to_vec()),
        _ => StubResponse::status(404, "unknown endpoint"),
    })
}

fn client_for(server: &StubServer) -> RenderJobClient {
    let config = RenderConfig {
        base_url: server.base_url().to_string(),
        ..RenderConfig::default()
    };
    RenderJobClient::from_config(&config, SessionId::new("client_1700000000"))
        .expect("client")
        .with_poll_interval(Duration::from_millis(10))
}

#[test]
fn generates_avatar_video_end_to_end() {
    let server = render_server();
    let dir = tempdir().unwrap();
    let image = dir.path().join("face.png");
    let audio = dir.path().join("narration.mp3");
    fs::write(&image, b"png").unwrap();
    fs::write(&audio, b"mp3").unwrap();
    let output_dir = dir.path().join("out").join("tmp").join("demo");
    fs::create_dir_all(&output_dir).unwrap();
    fs::write(output_dir.join("1.mp4"), b"earlier").unwrap();

    let request = AvatarRequest {
        image,
        audio,
        output_dir: output_dir.clone(),
        resolution: Some("560X996".to_string()),
    };
    let files = generate_avatar_video(
        &client_for(&server),
        &WorkflowParameterizer::default(),
        avatar_workflow(),
        &request,
        Duration::from_secs(10),
    )
    .expect("pipeline");

    assert_eq!(files, vec![output_dir.join("2.mp4")]);
    assert_eq!(fs::read(output_dir.join("2.mp4")).unwrap(), b"rendered-mp4");

    let requests = server.requests();
    let paths: Vec<&str> = requests.iter().map(|request| request.path()).collect();
    assert_eq!(
        paths,
        vec![
            "/upload/image",
            "/upload/image",
            "/prompt",
            "/history/job-7",
            "/history/job-7",
            "/view",
        ]
    );

    let prompt = requests[2].body_json();
    assert_eq!(prompt["client_id"], "client_1700000000");
    let graph = &prompt["prompt"];
    assert_eq!(graph["3"]["inputs"]["image"], "avatar/face.png");
    assert_eq!(graph["3"]["inputs"]["upload"], "image");
    assert_eq!(graph["7"]["inputs"]["audio"], "avatar/narration.mp3");
    assert_eq!(graph["12"]["inputs"]["width"], 560);
    assert_eq!(graph["12"]["inputs"]["height"], 996);
    assert_eq!(graph["12"]["inputs"]["image"], json!(["3", 0]));
    assert_eq!(graph["12"]["_meta"]["title"], "Resize");
    assert!(graph["20"]["inputs"].get("width").is_none());

    let view_query = requests[5].query().unwrap_or_default();
    assert!(view_query.contains("filename=AvatarGen_00001.mp4"));
    assert!(view_query.contains("type=output"));
}

#[test]
fn stalled_job_times_out() {
    let server = StubServer::start(|request| match request.path() {
        "/upload/image" => StubResponse::json(json!({ "name": "ref.bin" })),
        "/prompt" => StubResponse::json(json!({ "prompt_id": "stuck" })),
        _ => StubResponse::json(json!({})),
    });
    let dir = tempdir().unwrap();
    let image = dir.path().join("face.png");
    let audio = dir.path().join("narration.mp3");
    fs::write(&image, b"png").unwrap();
    fs::write(&audio, b"mp3").unwrap();

    let request = AvatarRequest {
        image,
        audio,
        output_dir: dir.path().join("out"),
        resolution: None,
    };
    let err = generate_avatar_video(
        &client_for(&server),
        &WorkflowParameterizer::default(),
        avatar_workflow(),
        &request,
        Duration::from_millis(60),
    )
    .expect_err("timeout");

    assert!(matches!(err, PipelineError::Timeout { ref job_id, .. } if job_id == "stuck"));
    assert_eq!(server.count_path("/view"), 0);
    assert!(!dir.path().join("out").exists());
}
