//! Stage activities. All storage access goes through [`BlobClient`].
//!
//! The stage bodies keep the data handling deliberately simple (header
//! preserved, rows re-emitted or sampled); the contracts are what the
//! orchestrations depend on.

use async_trait::async_trait;
use csv::StringRecord;

use super::{ArchiveRequest, SampleOutput, SampleRequest, SampleStage, TransformOutput};
use crate::_typed_codec::{Codec, Json};
use crate::runtime::{ActivityContext, ActivityHandler};
use crate::storage::{BlobClient, Metadata, StorageError};
use crate::ActivityError;

/// Only I/O failures are worth another attempt.
fn storage_failure(err: StorageError) -> ActivityError {
    match err {
        StorageError::Io(_) => ActivityError::retryable(err.to_string()),
        _ => ActivityError::permanent(err.to_string()),
    }
}

fn decode_input<T: serde::de::DeserializeOwned>(input: &str) -> Result<T, ActivityError> {
    Json::decode::<T>(input).map_err(|e| ActivityError::permanent(format!("malformed activity input: {e}")))
}

fn encode_output<T: serde::Serialize>(value: &T) -> Result<String, ActivityError> {
    Json::encode(value).map_err(ActivityError::permanent)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn stage_metadata(source: &str, stage: &str) -> Metadata {
    let mut m = Metadata::new();
    m.insert("sourcePath".to_string(), source.to_string());
    m.insert("stage".to_string(), stage.to_string());
    m
}

/// Header plus data records of a small CSV document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CsvTable {
    header: StringRecord,
    rows: Vec<StringRecord>,
}

impl CsvTable {
    /// Every record must have as many fields as the header.
    pub(crate) fn parse(text: &str) -> Result<Self, String> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(text.as_bytes());
        let header = reader.headers().map_err(|e| e.to_string())?.clone();
        if header.is_empty() {
            return Err("file has no header row".to_string());
        }
        let rows = reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        Ok(Self { header, rows })
    }

    pub(crate) fn column_count(&self) -> usize {
        self.header.len()
    }

    pub(crate) fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// `n` rows spread evenly across the table, original order kept.
    pub(crate) fn sample(&self, n: usize) -> Result<CsvTable, String> {
        let total = self.rows.len();
        if n > total {
            return Err(format!("cannot sample {n} rows from {total}"));
        }
        let rows = (0..n).map(|i| self.rows[i * total / n].clone()).collect();
        Ok(CsvTable {
            header: self.header.clone(),
            rows,
        })
    }

    pub(crate) fn render(&self) -> Result<String, String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for record in std::iter::once(&self.header).chain(&self.rows) {
            writer.write_record(record).map_err(|e| e.to_string())?;
        }
        let bytes = writer.into_inner().map_err(|e| e.to_string())?;
        String::from_utf8(bytes).map_err(|e| e.to_string())
    }
}

/// `discoverFiles(pathPrefix)`: `.csv` paths under the prefix.
pub struct DiscoverFiles {
    client: BlobClient,
}

impl DiscoverFiles {
    pub fn new(client: BlobClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActivityHandler for DiscoverFiles {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityError> {
        let prefix: String = decode_input(&input)?;
        let files = self.client.list_csv_files(&prefix).await.map_err(storage_failure)?;
        ctx.trace_info(format!("discovered {} csv files under {prefix}", files.len()));
        encode_output(&files)
    }
}

/// `stageTransform(filePath)`: normalize the file into the transform area.
pub struct StageTransform {
    client: BlobClient,
    output_subpath: String,
}

impl StageTransform {
    pub fn new(client: BlobClient, output_subpath: &str) -> Self {
        Self {
            client,
            output_subpath: output_subpath.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ActivityHandler for StageTransform {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityError> {
        let path: String = decode_input(&input)?;
        let text = self.client.download_text(&path).await.map_err(storage_failure)?;
        let table = CsvTable::parse(&text).map_err(|e| ActivityError::permanent(format!("{path}: {e}")))?;
        let output_path = format!("{}/data_{}", self.output_subpath, basename(&path));
        let body = table.render().map_err(ActivityError::permanent)?;
        self.client
            .upload_text(&output_path, &body, Some(stage_metadata(&path, "transform")))
            .await
            .map_err(storage_failure)?;
        ctx.trace_info(format!("transformed {path} into {output_path}"));
        encode_output(&TransformOutput {
            output_path,
            column_count: table.column_count(),
            row_count: table.row_count(),
        })
    }
}

/// `stageSample(priorOutputPath, sampleSize)`: keep `sampleSize` rows.
pub struct StageSample {
    client: BlobClient,
    interim_subpath: String,
    final_subpath: String,
}

impl StageSample {
    pub fn new(client: BlobClient, interim_subpath: &str, final_subpath: &str) -> Self {
        Self {
            client,
            interim_subpath: interim_subpath.trim_end_matches('/').to_string(),
            final_subpath: final_subpath.trim_end_matches('/').to_string(),
        }
    }

    fn output_path(&self, stage: SampleStage, source: &str) -> String {
        match stage {
            SampleStage::Interim => format!("{}/interim_{}", self.interim_subpath, basename(source)),
            SampleStage::Final => format!("{}/final_{}", self.final_subpath, basename(source)),
        }
    }
}

#[async_trait]
impl ActivityHandler for StageSample {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityError> {
        let request: SampleRequest = decode_input(&input)?;
        if request.sample_size == 0 {
            return Err(ActivityError::permanent("sampleSize must be at least 1"));
        }
        let text = self.client.download_text(&request.path).await.map_err(storage_failure)?;
        let table = CsvTable::parse(&text).map_err(|e| ActivityError::permanent(format!("{}: {e}", request.path)))?;
        let sample = table
            .sample(request.sample_size)
            .map_err(|e| ActivityError::permanent(format!("{}: {e}", request.path)))?;
        let output_path = self.output_path(request.stage, &request.path);
        let stage = match request.stage {
            SampleStage::Interim => "sample",
            SampleStage::Final => "final",
        };
        let body = sample.render().map_err(ActivityError::permanent)?;
        self.client
            .upload_text(&output_path, &body, Some(stage_metadata(&request.path, stage)))
            .await
            .map_err(storage_failure)?;
        ctx.trace_info(format!("sampled {} rows into {output_path}", request.sample_size));
        encode_output(&SampleOutput {
            output_path,
            column_count: sample.column_count(),
        })
    }
}

/// `archiveFile`: relocate a raw file with the move protocol. A move that
/// times out is not retried here; the source stays in place.
pub struct ArchiveFile {
    client: BlobClient,
}

impl ArchiveFile {
    pub fn new(client: BlobClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActivityHandler for ArchiveFile {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityError> {
        let request: ArchiveRequest = decode_input(&input)?;
        match self.client.move_blob(&request.path, &request.target_folder).await {
            Ok(target) => {
                ctx.trace_info(format!("archived {} to {target}", request.path));
                encode_output(&target)
            }
            Err(err) => {
                ctx.trace_warn(format!("archiving {} failed: {err}", request.path));
                Err(storage_failure(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::memory::{CopyBehavior, InMemoryBlobStore};
    use crate::storage::{BlobStore, MoveOptions};

    fn csv(rows: usize) -> String {
        let mut s = String::from("id,name,score\n");
        for i in 0..rows {
            s.push_str(&format!("{i},name{i},{}\n", i * 3));
        }
        s
    }

    fn ctx(name: &str) -> ActivityContext {
        ActivityContext::new("i1", 0, name, 1)
    }

    #[test]
    fn csv_counts_and_quoted_fields() {
        let t = CsvTable::parse("a,b,c\r\n1,\"x,y\",3\r\n\r\n4,5,6\r\n").unwrap();
        assert_eq!(t.column_count(), 3);
        assert_eq!(t.row_count(), 2);
        assert!(CsvTable::parse("").is_err());
        assert!(CsvTable::parse("a,b\n1,2,3\n").is_err());
    }

    #[test]
    fn quoted_newlines_stay_inside_one_record() {
        let t = CsvTable::parse("id,note\n1,\"line one\nline two\"\n2,plain\n").unwrap();
        assert_eq!((t.column_count(), t.row_count()), (2, 2));
        assert_eq!(&t.rows[0][1], "line one\nline two");
        let again = CsvTable::parse(&t.render().unwrap()).unwrap();
        assert_eq!(again, t);
    }

    #[test]
    fn sampling_is_even_and_deterministic() {
        let t = CsvTable::parse(&csv(20)).unwrap();
        let s = t.sample(5).unwrap();
        let ids: Vec<&str> = s.rows.iter().map(|r| &r[0]).collect();
        assert_eq!(ids, vec!["0", "4", "8", "12", "16"]);
        assert_eq!(t.sample(5).unwrap(), s);
        assert!(t.sample(21).is_err());
        assert_eq!(t.sample(20).unwrap().row_count(), 20);
    }

    #[tokio::test]
    async fn discover_returns_only_csv() {
        let store = Arc::new(InMemoryBlobStore::new());
        store.put_text("raw/a.csv", "h\n").await;
        store.put_text("raw/b.txt", "h\n").await;
        store.put_text("other/c.csv", "h\n").await;
        let act = DiscoverFiles::new(BlobClient::new(store));
        let out = act.invoke(ctx("discoverFiles"), "raw".into()).await.unwrap();
        assert_eq!(out, r#"["raw/a.csv"]"#);
    }

    #[tokio::test]
    async fn stage_chain_writes_expected_paths() {
        let store = Arc::new(InMemoryBlobStore::new());
        store.put_text("raw/a.csv", &csv(30)).await;
        let client = BlobClient::new(store.clone());

        let t = StageTransform::new(client.clone(), "step1");
        let out: TransformOutput = Json::decode(&t.invoke(ctx("stageTransform"), "raw/a.csv".into()).await.unwrap()).unwrap();
        assert_eq!(out.output_path, "step1/data_a.csv");
        assert_eq!((out.column_count, out.row_count), (3, 30));

        let s = StageSample::new(client, "step3", "step4");
        let req = SampleRequest {
            path: out.output_path.clone(),
            sample_size: 10,
            stage: SampleStage::Interim,
        };
        let first: SampleOutput =
            Json::decode(&s.invoke(ctx("stageSample"), Json::encode(&req).unwrap()).await.unwrap()).unwrap();
        assert_eq!(first.output_path, "step3/interim_data_a.csv");
        let req = SampleRequest {
            path: first.output_path.clone(),
            sample_size: 5,
            stage: SampleStage::Final,
        };
        let second: SampleOutput =
            Json::decode(&s.invoke(ctx("stageSample"), Json::encode(&req).unwrap()).await.unwrap()).unwrap();
        assert_eq!(second.output_path, "step4/final_interim_data_a.csv");
        assert_eq!(second.column_count, 3);

        let final_text = String::from_utf8(store.download("step4/final_interim_data_a.csv").await.unwrap().bytes).unwrap();
        assert_eq!(final_text.lines().count(), 6);
        assert_eq!(
            store.metadata("step1/data_a.csv").await.unwrap().get("stage").map(String::as_str),
            Some("transform")
        );
    }

    #[tokio::test]
    async fn transform_keeps_multiline_fields() {
        let store = Arc::new(InMemoryBlobStore::new());
        store.put_text("raw/a.csv", "id,note\n1,\"line one\nline two\"\n2,plain\n").await;
        let t = StageTransform::new(BlobClient::new(store.clone()), "step1");
        let out: TransformOutput = Json::decode(&t.invoke(ctx("stageTransform"), "raw/a.csv".into()).await.unwrap()).unwrap();
        assert_eq!((out.column_count, out.row_count), (2, 2));
        let written = String::from_utf8(store.download("step1/data_a.csv").await.unwrap().bytes).unwrap();
        assert!(written.contains("\"line one\nline two\""));
    }

    #[tokio::test]
    async fn oversampling_is_permanent() {
        let store = Arc::new(InMemoryBlobStore::new());
        store.put_text("step1/data_a.csv", &csv(3)).await;
        let s = StageSample::new(BlobClient::new(store), "step3", "step4");
        let req = r#"{"path": "step1/data_a.csv", "sampleSize": 10}"#;
        let err = s.invoke(ctx("stageSample"), req.into()).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("cannot sample 10 rows from 3"));
    }

    #[tokio::test]
    async fn archive_timeout_is_permanent_and_keeps_source() {
        let store = Arc::new(InMemoryBlobStore::new().with_copy_behavior(CopyBehavior::NeverComplete));
        store.put_text("raw/a.csv", "h\n1\n").await;
        let client = BlobClient::new(store.clone()).with_move_options(MoveOptions {
            poll_interval: std::time::Duration::from_millis(1),
            max_poll_attempts: 4,
        });
        let act = ArchiveFile::new(client);
        let req = r#"{"path": "raw/a.csv", "targetFolder": "archive"}"#;
        let err = act.invoke(ctx("archiveFile"), req.into()).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("still pending after 4"));
        assert!(store.exists("raw/a.csv").await.unwrap());
        assert_eq!(store.deletes(), 0);
    }
}
