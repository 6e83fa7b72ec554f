//! `ProcessFiles` fans out one `ProcessFile` chain per discovered file and
//! fans the results back in, in discovery order.

use async_trait::async_trait;

use super::{
    ARCHIVE_FILE, ArchiveRequest, ChainResult, DISCOVER_FILES, FileRequest, PROCESS_FILE, PipelineInput,
    STAGE_SAMPLE, STAGE_TRANSFORM, SampleOutput, SampleRequest, SampleStage, TransformOutput,
};
use crate::_typed_codec::{Codec, Json};
use crate::runtime::OrchestrationHandler;
use crate::{OrchestrationContext, durable_error, durable_info};

/// Top-level workflow: `{pathPrefix, fileCount?, archiveFolder?}` in, one
/// [`ChainResult`] per processed file out.
pub struct ProcessFiles;

#[async_trait]
impl OrchestrationHandler for ProcessFiles {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        let input = PipelineInput::parse(&input)?;

        let mut files: Vec<String> = ctx.schedule_activity_typed(DISCOVER_FILES, &input.path_prefix).await?;
        if let Some(limit) = input.file_count {
            files.truncate(limit);
        }
        durable_info!(ctx, prefix = %input.path_prefix, files = files.len(), "processing discovered files");

        let mut chains = Vec::with_capacity(files.len());
        for path in files {
            let request = FileRequest {
                path,
                archive_folder: input.archive_folder.clone(),
            };
            chains.push(ctx.schedule_sub_orchestration(PROCESS_FILE, Json::encode(&request)?));
        }

        let outputs = match ctx.wait_all(chains).await {
            Ok(outputs) => outputs,
            Err(err) => {
                durable_error!(ctx, call_index = err.call_index, position = err.position, "file chain failed: {err}");
                return Err(err.into());
            }
        };
        let results = outputs
            .iter()
            .map(|raw| Json::decode::<ChainResult>(raw))
            .collect::<Result<Vec<_>, _>>()?;
        durable_info!(ctx, files = results.len(), "all file chains completed");
        Json::encode(&results)
    }

    fn validate(&self, input: &str) -> Result<(), String> {
        PipelineInput::parse(input).map(|_| ())
    }
}

/// One file's chain: transform, two sampling stages, then the optional archive move.
pub struct ProcessFile {
    first_sample_size: usize,
    second_sample_size: usize,
}

impl ProcessFile {
    pub fn new(first_sample_size: usize, second_sample_size: usize) -> Self {
        Self {
            first_sample_size,
            second_sample_size,
        }
    }
}

#[async_trait]
impl OrchestrationHandler for ProcessFile {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        let request = FileRequest::parse(&input)?;

        let transform: TransformOutput = ctx.schedule_activity_typed(STAGE_TRANSFORM, &request.path).await?;
        durable_info!(ctx, output = %transform.output_path, "transform stage done");

        let sample: SampleOutput = ctx
            .schedule_activity_typed(
                STAGE_SAMPLE,
                &SampleRequest {
                    path: transform.output_path.clone(),
                    sample_size: self.first_sample_size,
                    stage: SampleStage::Interim,
                },
            )
            .await?;
        let final_sample: SampleOutput = ctx
            .schedule_activity_typed(
                STAGE_SAMPLE,
                &SampleRequest {
                    path: sample.output_path.clone(),
                    sample_size: self.second_sample_size,
                    stage: SampleStage::Final,
                },
            )
            .await?;
        durable_info!(ctx, output = %final_sample.output_path, "sampling stages done");

        let archived_path = match &request.archive_folder {
            Some(folder) => {
                let target: String = ctx
                    .schedule_activity_typed(
                        ARCHIVE_FILE,
                        &ArchiveRequest {
                            path: request.path.clone(),
                            target_folder: folder.clone(),
                        },
                    )
                    .await?;
                Some(target)
            }
            None => None,
        };

        Json::encode(&ChainResult {
            transform,
            sample,
            final_sample,
            archived_path,
        })
    }

    fn validate(&self, input: &str) -> Result<(), String> {
        FileRequest::parse(input).map(|_| ())
    }
}
