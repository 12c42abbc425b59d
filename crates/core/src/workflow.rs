use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};

/// API-format job graph: node id -> node record.
///
/// Unknown node fields survive a load/bind/save cycle through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobGraph {
    nodes: BTreeMap<String, GraphNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    #[serde(
        rename = "class_type",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GraphNode {
    pub fn new(kind: &str, inputs: Map<String, Value>) -> Self {
        Self {
            kind: Some(kind.to_string()),
            inputs: Some(inputs),
            extra: Map::new(),
        }
    }

    fn kind_str(&self) -> &str {
        self.kind.as_deref().unwrap_or_default()
    }
}

impl JobGraph {
    pub fn from_value(value: Value) -> PipelineResult<Self> {
        serde_json::from_value(value)
            .map_err(|err| PipelineError::Workflow(format!("invalid job graph: {err}")))
    }

    pub fn load_from_path(path: &Path) -> PipelineResult<Self> {
        if !path.exists() {
            return Err(PipelineError::NotFound(path.to_path_buf()));
        }
        let raw = fs::read_to_string(path).map_err(|err| PipelineError::io(path, err))?;
        serde_json::from_str(&raw).map_err(|err| {
            PipelineError::Workflow(format!(
                "failed to parse workflow JSON {}: {err}",
                path.display()
            ))
        })
    }

    pub fn save_to_path(&self, path: &Path) -> PipelineResult<()> {
        let encoded = serde_json::to_string_pretty(self)
            .map_err(|err| PipelineError::Workflow(format!("failed to encode workflow: {err}")))?;
        fs::write(path, encoded).map_err(|err| PipelineError::io(path, err))
    }

    pub fn insert(&mut self, id: impl Into<String>, node: GraphNode) -> Option<GraphNode> {
        self.nodes.insert(id.into(), node)
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Node kinds and field names the render server uses for loader nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeVocabulary {
    pub image_loader_kinds: Vec<String>,
    pub audio_loader_kinds: Vec<String>,
    /// First field present on an audio loader wins.
    pub audio_fields: Vec<String>,
}

impl Default for NodeVocabulary {
    fn default() -> Self {
        Self {
            image_loader_kinds: ["LoadImage", "ImageLoader", "Load Image"]
                .map(String::from)
                .to_vec(),
            audio_loader_kinds: [
                "LoadAudio",
                "AudioLoader",
                "Load Audio",
                "ETN_LoadAudio",
                "VH_LoadAudio",
            ]
            .map(String::from)
            .to_vec(),
            audio_fields: ["audio", "path", "upload"].map(String::from).to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let lowered = raw.to_ascii_lowercase();
        let (width, height) = lowered
            .split_once('x')
            .ok_or_else(|| format!("expected WIDTHxHEIGHT (e.g. 1080x1920), got '{raw}'"))?;

        let parse_dim = |part: &str| -> Result<u32, String> {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format!("invalid dimension '{part}' in '{raw}'"));
            }
            match part.parse::<u32>() {
                Ok(0) => Err(format!("zero dimension in '{raw}'")),
                Ok(value) => Ok(value),
                Err(err) => Err(format!("invalid dimension '{part}' in '{raw}': {err}")),
            }
        };

        Ok(Self {
            width: parse_dim(width)?,
            height: parse_dim(height)?,
        })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindReport {
    pub image_nodes: Vec<String>,
    pub audio_nodes: Vec<String>,
    pub resized_nodes: Vec<String>,
    pub resolution: Option<Resolution>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowParameterizer {
    vocabulary: NodeVocabulary,
}

impl WorkflowParameterizer {
    pub fn new(vocabulary: NodeVocabulary) -> Self {
        Self { vocabulary }
    }

    pub fn bind(
        &self,
        mut graph: JobGraph,
        image_asset: &str,
        audio_asset: &str,
        resolution: Option<&str>,
    ) -> JobGraph {
        self.bind_in_place(&mut graph, image_asset, audio_asset, resolution);
        graph
    }

    pub fn bind_in_place(
        &self,
        graph: &mut JobGraph,
        image_asset: &str,
        audio_asset: &str,
        resolution: Option<&str>,
    ) -> BindReport {
        let resolution = resolution.and_then(|raw| match raw.parse::<Resolution>() {
            Ok(parsed) => Some(parsed),
            Err(reason) => {
                warn!(%reason, "ignoring invalid resolution; dimensions left unchanged");
                None
            }
        });

        let mut report = BindReport {
            resolution,
            ..Default::default()
        };

        for (node_id, node) in graph.nodes.iter_mut() {
            let kind = node.kind_str().to_string();
            let Some(inputs) = node.inputs.as_mut() else {
                continue;
            };

            if self.is_image_loader(&kind) {
                inputs.insert("image".to_string(), Value::from(image_asset));
                report.image_nodes.push(node_id.clone());
            }

            if self.is_audio_loader(&kind) {
                let field = self
                    .vocabulary
                    .audio_fields
                    .iter()
                    .find(|field| inputs.contains_key(field.as_str()));
                match field {
                    Some(field) => {
                        inputs.insert(field.clone(), Value::from(audio_asset));
                        report.audio_nodes.push(node_id.clone());
                    }
                    None => debug!(
                        node_id = %node_id,
                        kind = %kind,
                        "audio loader has no recognized audio field"
                    ),
                }
            }

            if let Some(target) = resolution {
                if inputs.contains_key("width") && inputs.contains_key("height") {
                    info!(
                        node_id = %node_id,
                        kind = %kind,
                        from = %format!("{}x{}", inputs["width"], inputs["height"]),
                        to = %target,
                        "updating node resolution"
                    );
                    inputs.insert("width".to_string(), Value::from(target.width));
                    inputs.insert("height".to_string(), Value::from(target.height));
                    report.resized_nodes.push(node_id.clone());
                }
            }
        }

        if report.image_nodes.is_empty() {
            warn!("no image loader node found in workflow");
        }
        if report.audio_nodes.is_empty() {
            warn!("no audio loader node found in workflow");
        }

        report
    }

    fn is_image_loader(&self, kind: &str) -> bool {
        self.vocabulary.image_loader_kinds.iter().any(|k| k == kind)
    }

    fn is_audio_loader(&self, kind: &str) -> bool {
        self.vocabulary.audio_loader_kinds.iter().any(|k| k == kind)
    }
}
