//! The multi-stage file pipeline.
//!
//! `ProcessFiles` discovers CSV files under a prefix and fans out one
//! `ProcessFile` sub-orchestration per file. Each chain runs
//! `stageTransform → stageSample(first) → stageSample(second)`, each stage
//! consuming the previous stage's `outputPath`, and optionally archives the
//! raw file with the move protocol. Stage boundaries are typed records.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::PipelineConfig;
use crate::providers::HistoryStore;
use crate::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
use crate::runtime::Runtime;
use crate::storage::BlobClient;

pub mod activities;
pub mod orchestrations;

pub const PROCESS_FILES: &str = "ProcessFiles";
pub const PROCESS_FILE: &str = "ProcessFile";
pub const DISCOVER_FILES: &str = "discoverFiles";
pub const STAGE_TRANSFORM: &str = "stageTransform";
pub const STAGE_SAMPLE: &str = "stageSample";
pub const ARCHIVE_FILE: &str = "archiveFile";

/// Input of the top-level workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInput {
    pub path_prefix: String,
    /// Upper bound on how many discovered files are processed.
    #[serde(default)]
    pub file_count: Option<usize>,
    /// Move each raw file under this folder once its chain completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_folder: Option<String>,
}

impl PipelineInput {
    pub fn parse(input: &str) -> Result<Self, String> {
        let parsed: PipelineInput =
            serde_json::from_str(input).map_err(|e| format!("malformed pipeline input: {e}"))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.path_prefix.trim().is_empty() {
            return Err("pathPrefix must not be empty".to_string());
        }
        if self.file_count == Some(0) {
            return Err("fileCount must be at least 1".to_string());
        }
        if let Some(folder) = &self.archive_folder {
            if folder.trim_matches('/').is_empty() {
                return Err("archiveFolder must not be empty".to_string());
            }
        }
        Ok(())
    }
}

/// Input of one file chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_folder: Option<String>,
}

impl FileRequest {
    /// Accepts the JSON record or a bare path.
    pub fn parse(input: &str) -> Result<Self, String> {
        let request = match serde_json::from_str::<FileRequest>(input) {
            Ok(r) => r,
            Err(e) if input.trim_start().starts_with('{') => return Err(format!("malformed file request: {e}")),
            Err(_) => FileRequest {
                path: serde_json::from_str::<String>(input).unwrap_or_else(|_| input.to_string()),
                archive_folder: None,
            },
        };
        if request.path.trim().is_empty() {
            return Err("file path must not be empty".to_string());
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformOutput {
    pub output_path: String,
    pub column_count: usize,
    pub row_count: usize,
}

/// Which sampling stage a `stageSample` call belongs to; decides the output location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SampleStage {
    #[default]
    Interim,
    Final,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleRequest {
    pub path: String,
    pub sample_size: usize,
    #[serde(default)]
    pub stage: SampleStage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleOutput {
    pub output_path: String,
    pub column_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRequest {
    pub path: String,
    pub target_folder: String,
}

/// Ordered outputs of one file chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainResult {
    pub transform: TransformOutput,
    pub sample: SampleOutput,
    pub final_sample: SampleOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_path: Option<String>,
}

pub fn activity_registry(client: BlobClient, config: &PipelineConfig) -> ActivityRegistry {
    let stages = &config.stages;
    ActivityRegistry::builder()
        .register_handler(DISCOVER_FILES, Arc::new(activities::DiscoverFiles::new(client.clone())))
        .register_handler(
            STAGE_TRANSFORM,
            Arc::new(activities::StageTransform::new(client.clone(), &stages.transform_subpath)),
        )
        .register_handler(
            STAGE_SAMPLE,
            Arc::new(activities::StageSample::new(
                client.clone(),
                &stages.sample_subpath,
                &stages.final_subpath,
            )),
        )
        .register_handler(ARCHIVE_FILE, Arc::new(activities::ArchiveFile::new(client)))
        .build()
}

pub fn orchestration_registry(config: &PipelineConfig) -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register_handler(PROCESS_FILES, Arc::new(orchestrations::ProcessFiles))
        .register_handler(
            PROCESS_FILE,
            Arc::new(orchestrations::ProcessFile::new(
                config.stages.first_sample_size,
                config.stages.second_sample_size,
            )),
        )
        .build()
}

/// Start a runtime with the pipeline's workflows and activities registered.
pub async fn start_runtime(store: Arc<dyn HistoryStore>, client: BlobClient, config: &PipelineConfig) -> Arc<Runtime> {
    let client = client.with_move_options(config.move_options());
    Runtime::start_with_options(
        store,
        activity_registry(client, config),
        orchestration_registry(config),
        config.runtime_options(),
    )
    .await
}
