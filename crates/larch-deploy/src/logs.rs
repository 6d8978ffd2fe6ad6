//! Buffered, chunked run logs over the key-value store.
//!
//! Each job has at most one active run, so the live log buffer is keyed by
//! (application, job type); when a run is finalized the buffer is sealed
//! under the run's number. Entries are stored in bounded chunks so a single
//! write stays small, with a head record carrying the id counter:
//!
//! ```text
//! /logs/{app}/{job}/active/head             id counter + chunk count
//! /logs/{app}/{job}/active/chunk/{n}        bounded entry chunk
//! /logs/{app}/{job}/{number}/sealed         seal marker of a finished run
//! /logs/{app}/{job}/{number}/chunk/{n}      sealed chunk
//! /reports/{app}/{job}/{number}             test reports, JSON array
//! ```
//!
//! Entry ids are assigned at append time and strictly increase within a
//! run. Store failures surface as storage errors, which callers treat as
//! retryable.

use std::sync::Arc;

use larch_core::KeyValueStore;
use larch_core::ReadRequest;
use larch_core::ScanRequest;
use larch_core::WriteRequest;
use larch_deploy_core::ApplicationId;
use larch_deploy_core::JobType;
use larch_deploy_core::LogEntry;
use larch_deploy_core::RunId;
use larch_deploy_core::RunLog;
use larch_deploy_core::Step;
use larch_deploy_core::TestReport;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::error::JobError;
use crate::error::Result;

/// Maximum entries per stored chunk.
const MAX_CHUNK_ENTRIES: usize = 256;

fn job_log_prefix(application: &ApplicationId, job_type: &JobType) -> String {
    format!("/logs/{application}/{}/", job_type.job_name())
}

fn active_head_key(application: &ApplicationId, job_type: &JobType) -> String {
    format!("{}active/head", job_log_prefix(application, job_type))
}

fn active_chunk_key(application: &ApplicationId, job_type: &JobType, index: u32) -> String {
    format!("{}active/chunk/{index:08}", job_log_prefix(application, job_type))
}

fn sealed_prefix(id: &RunId) -> String {
    format!("{}{:08}/", job_log_prefix(&id.application, &id.job_type), id.number)
}

fn sealed_marker_key(id: &RunId) -> String {
    format!("{}sealed", sealed_prefix(id))
}

fn sealed_chunk_key(id: &RunId, index: u32) -> String {
    format!("{}chunk/{index:08}", sealed_prefix(id))
}

fn report_key(id: &RunId) -> String {
    format!("/reports/{}/{}/{:08}", id.application, id.job_type.job_name(), id.number)
}

fn report_job_prefix(application: &ApplicationId, job_type: &JobType) -> String {
    format!("/reports/{application}/{}/", job_type.job_name())
}

/// Head record of the active buffer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LogHead {
    /// Next entry id to assign.
    next_id: u64,
    /// Number of chunks written so far.
    chunks: u32,
}

/// One bounded chunk of log entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LogChunk {
    entries: Vec<ChunkEntry>,
}

/// A log entry together with the step it was logged under.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkEntry {
    step: Step,
    entry: LogEntry,
}

/// Marker sealing the log of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealMarker {
    chunks: u32,
    last_id: u64,
}

/// Append-only per-run log storage.
pub struct BufferedLogStore<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
}

impl<S: KeyValueStore + ?Sized> BufferedLogStore<S> {
    /// A log store over the given key-value store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn read_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let result = self.store.read(ReadRequest::new(key)).await?;
        match result.kv {
            None => Ok(None),
            Some(kv) => serde_json::from_str(&kv.value).map(Some).map_err(|e| JobError::Storage {
                message: format!("corrupt log record at {key}: {e}"),
            }),
        }
    }

    fn encode<T: Serialize>(key: &str, record: &T) -> Result<String> {
        serde_json::to_string(record).map_err(|e| JobError::Storage {
            message: format!("failed to serialize log record at {key}: {e}"),
        })
    }

    /// Append entries under the given step of the job's active run.
    ///
    /// Entry ids are assigned here, monotonically increasing within the
    /// run; ids the entries arrived with are overwritten. The head and all
    /// touched chunks are written atomically.
    pub async fn append(
        &self,
        application: &ApplicationId,
        job_type: &JobType,
        step: Step,
        entries: Vec<LogEntry>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let head_key = active_head_key(application, job_type);
        let mut head: LogHead = self.read_record(&head_key).await?.unwrap_or_default();

        // Fill the last chunk before opening new ones.
        let mut open_index = head.chunks.saturating_sub(1);
        let mut open_chunk: LogChunk = if head.chunks == 0 {
            head.chunks = 1;
            LogChunk::default()
        } else {
            self.read_record(&active_chunk_key(application, job_type, open_index))
                .await?
                .unwrap_or_default()
        };

        let mut pairs: Vec<(String, String)> = Vec::new();
        for mut entry in entries {
            head.next_id += 1;
            entry.id = head.next_id;
            if open_chunk.entries.len() >= MAX_CHUNK_ENTRIES {
                let key = active_chunk_key(application, job_type, open_index);
                pairs.push((key.clone(), Self::encode(&key, &open_chunk)?));
                open_index += 1;
                head.chunks = open_index + 1;
                open_chunk = LogChunk::default();
            }
            open_chunk.entries.push(ChunkEntry { step, entry });
        }
        let key = active_chunk_key(application, job_type, open_index);
        pairs.push((key.clone(), Self::encode(&key, &open_chunk)?));
        pairs.push((head_key.clone(), Self::encode(&head_key, &head)?));

        self.store.write(WriteRequest::set_multi(pairs)).await?;
        Ok(())
    }

    /// The live log buffer of the job, entries with id greater than `after`.
    pub async fn read_active(&self, application: &ApplicationId, job_type: &JobType, after: u64) -> Result<RunLog> {
        let head_key = active_head_key(application, job_type);
        let Some(head) = self.read_record::<LogHead>(&head_key).await? else {
            return Ok(RunLog::empty());
        };

        let mut log = RunLog::empty();
        for index in 0..head.chunks {
            let key = active_chunk_key(application, job_type, index);
            let chunk: LogChunk = self.read_record(&key).await?.unwrap_or_default();
            for ChunkEntry { step, entry } in chunk.entries {
                if entry.id > after {
                    log.last_id = Some(entry.id);
                    log.entries.entry(step).or_default().push(entry);
                }
            }
        }
        Ok(log)
    }

    /// The sealed log of a finished run, entries with id greater than
    /// `after`; `None` when the run's log was never sealed or was deleted.
    pub async fn read_finished(&self, id: &RunId, after: u64) -> Result<Option<RunLog>> {
        let Some(marker) = self.read_record::<SealMarker>(&sealed_marker_key(id)).await? else {
            return Ok(None);
        };

        let mut log = RunLog::empty();
        for index in 0..marker.chunks {
            let key = sealed_chunk_key(id, index);
            let chunk: LogChunk = self.read_record(&key).await?.unwrap_or_default();
            for ChunkEntry { step, entry } in chunk.entries {
                if entry.id > after {
                    log.last_id = Some(entry.id);
                    log.entries.entry(step).or_default().push(entry);
                }
            }
        }
        Ok(Some(log))
    }

    /// Seal the active buffer of the run's job under the run's number.
    ///
    /// Idempotent: with no active buffer this is a no-op, and re-sealing
    /// after a partial crash rewrites the same content.
    pub async fn flush(&self, id: &RunId) -> Result<()> {
        let head_key = active_head_key(&id.application, &id.job_type);
        let Some(head) = self.read_record::<LogHead>(&head_key).await? else {
            return Ok(());
        };

        let mut pairs: Vec<(String, String)> = Vec::new();
        let mut delete_keys = vec![head_key];
        for index in 0..head.chunks {
            let active_key = active_chunk_key(&id.application, &id.job_type, index);
            let chunk: LogChunk = self.read_record(&active_key).await?.unwrap_or_default();
            let sealed_key = sealed_chunk_key(id, index);
            pairs.push((sealed_key.clone(), Self::encode(&sealed_key, &chunk)?));
            delete_keys.push(active_key);
        }
        let marker_key = sealed_marker_key(id);
        let marker = SealMarker {
            chunks: head.chunks,
            last_id: head.next_id,
        };
        pairs.push((marker_key.clone(), Self::encode(&marker_key, &marker)?));

        self.store.write(WriteRequest::set_multi(pairs)).await?;
        self.store.write(WriteRequest::delete_multi(delete_keys)).await?;
        Ok(())
    }

    /// Remove the sealed log and test reports of one run.
    pub async fn delete(&self, id: &RunId) -> Result<()> {
        let result = self.store.scan(ScanRequest::prefix(sealed_prefix(id))).await?;
        let mut keys: Vec<String> = result.entries.into_iter().map(|kv| kv.key).collect();
        keys.push(report_key(id));
        self.store.write(WriteRequest::delete_multi(keys)).await?;
        Ok(())
    }

    /// Remove every log and report of one job, active buffer included.
    pub async fn delete_for_type(&self, application: &ApplicationId, job_type: &JobType) -> Result<()> {
        self.delete_by_prefixes(vec![
            job_log_prefix(application, job_type),
            report_job_prefix(application, job_type),
        ])
        .await
    }

    /// Remove every log and report of the application.
    pub async fn delete_application(&self, application: &ApplicationId) -> Result<()> {
        self.delete_by_prefixes(vec![format!("/logs/{application}/"), format!("/reports/{application}/")]).await
    }

    async fn delete_by_prefixes(&self, prefixes: Vec<String>) -> Result<()> {
        let mut keys = Vec::new();
        for prefix in prefixes {
            let result = self.store.scan(ScanRequest::prefix(prefix)).await?;
            keys.extend(result.entries.into_iter().map(|kv| kv.key));
        }
        if keys.is_empty() {
            return Ok(());
        }
        self.store.write(WriteRequest::delete_multi(keys)).await?;
        Ok(())
    }

    /// Append a test report to the run's report list.
    pub async fn write_test_report(&self, id: &RunId, report: &TestReport) -> Result<()> {
        let key = report_key(id);
        let mut reports: Vec<TestReport> = self.read_record(&key).await?.unwrap_or_default();
        reports.push(report.clone());
        let value = Self::encode(&key, &reports)?;
        self.store.write(WriteRequest::set(key, value)).await?;
        Ok(())
    }

    /// The run's test reports as a JSON array, if any were written.
    pub async fn read_test_reports(&self, id: &RunId) -> Result<Option<String>> {
        let result = self.store.read(ReadRequest::new(report_key(id))).await?;
        Ok(result.kv.map(|kv| kv.value))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono::Utc;
    use larch_core::MemoryKeyValueStore;
    use larch_deploy_core::LogType;

    use super::*;

    fn app() -> ApplicationId {
        ApplicationId::from_parts("t", "a", "default")
    }

    fn entry(message: &str) -> LogEntry {
        LogEntry::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            LogType::Info,
            message,
        )
    }

    fn entry_ids(log: &RunLog) -> Vec<u64> {
        let mut ids: Vec<u64> = log.entries.values().flatten().map(|e| e.id).collect();
        ids.sort_unstable();
        ids
    }

    #[tokio::test]
    async fn append_assigns_strictly_increasing_ids() {
        let logs = BufferedLogStore::new(MemoryKeyValueStore::new());
        logs.append(&app(), &JobType::SystemTest, Step::DeployReal, vec![entry("a"), entry("b")])
            .await
            .unwrap();
        logs.append(&app(), &JobType::SystemTest, Step::InstallReal, vec![entry("c")])
            .await
            .unwrap();

        let log = logs.read_active(&app(), &JobType::SystemTest, 0).await.unwrap();
        assert_eq!(entry_ids(&log), vec![1, 2, 3]);
        assert_eq!(log.last_id, Some(3));
    }

    #[tokio::test]
    async fn read_active_filters_by_id_threshold() {
        let logs = BufferedLogStore::new(MemoryKeyValueStore::new());
        logs.append(&app(), &JobType::SystemTest, Step::DeployReal, vec![entry("a"), entry("b"), entry("c")])
            .await
            .unwrap();

        let log = logs.read_active(&app(), &JobType::SystemTest, 2).await.unwrap();
        assert_eq!(entry_ids(&log), vec![3]);
    }

    #[tokio::test]
    async fn append_spills_into_bounded_chunks() {
        let logs = BufferedLogStore::new(MemoryKeyValueStore::new());
        let entries: Vec<LogEntry> = (0..MAX_CHUNK_ENTRIES + 10).map(|i| entry(&format!("m{i}"))).collect();
        logs.append(&app(), &JobType::SystemTest, Step::EndTests, entries).await.unwrap();

        let log = logs.read_active(&app(), &JobType::SystemTest, 0).await.unwrap();
        assert_eq!(log.len(), MAX_CHUNK_ENTRIES + 10);
        assert_eq!(log.last_id, Some((MAX_CHUNK_ENTRIES + 10) as u64));
    }

    #[tokio::test]
    async fn flush_seals_the_active_buffer() {
        let logs = BufferedLogStore::new(MemoryKeyValueStore::new());
        let id = RunId::new(app(), JobType::SystemTest, 7);
        logs.append(&app(), &JobType::SystemTest, Step::DeployReal, vec![entry("a")]).await.unwrap();

        logs.flush(&id).await.unwrap();

        let active = logs.read_active(&app(), &JobType::SystemTest, 0).await.unwrap();
        assert!(active.is_empty());
        let finished = logs.read_finished(&id, 0).await.unwrap().unwrap();
        assert_eq!(finished.len(), 1);

        // Idempotent: a second flush with no active buffer changes nothing.
        logs.flush(&id).await.unwrap();
        assert_eq!(logs.read_finished(&id, 0).await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ids_continue_after_flush_of_previous_run() {
        let logs = BufferedLogStore::new(MemoryKeyValueStore::new());
        let first = RunId::new(app(), JobType::SystemTest, 1);
        logs.append(&app(), &JobType::SystemTest, Step::DeployReal, vec![entry("a")]).await.unwrap();
        logs.flush(&first).await.unwrap();

        // A new run starts its own buffer; ids restart with it.
        logs.append(&app(), &JobType::SystemTest, Step::DeployReal, vec![entry("b")]).await.unwrap();
        let log = logs.read_active(&app(), &JobType::SystemTest, 0).await.unwrap();
        assert_eq!(entry_ids(&log), vec![1]);
    }

    #[tokio::test]
    async fn unsealed_run_reads_as_none() {
        let logs: BufferedLogStore<MemoryKeyValueStore> = BufferedLogStore::new(MemoryKeyValueStore::new());
        let id = RunId::new(app(), JobType::SystemTest, 1);
        assert!(logs.read_finished(&id, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reports_accumulate() {
        let logs = BufferedLogStore::new(MemoryKeyValueStore::new());
        let id = RunId::new(app(), JobType::SystemTest, 1);
        assert!(logs.read_test_reports(&id).await.unwrap().is_none());

        logs.write_test_report(&id, &TestReport(serde_json::json!({"passed": 3}))).await.unwrap();
        logs.write_test_report(&id, &TestReport(serde_json::json!({"passed": 5}))).await.unwrap();

        let reports = logs.read_test_reports(&id).await.unwrap().unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&reports).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_sealed_log_and_reports() {
        let logs = BufferedLogStore::new(MemoryKeyValueStore::new());
        let id = RunId::new(app(), JobType::SystemTest, 1);
        logs.append(&app(), &JobType::SystemTest, Step::DeployReal, vec![entry("a")]).await.unwrap();
        logs.flush(&id).await.unwrap();
        logs.write_test_report(&id, &TestReport(serde_json::json!({}))).await.unwrap();

        logs.delete(&id).await.unwrap();

        assert!(logs.read_finished(&id, 0).await.unwrap().is_none());
        assert!(logs.read_test_reports(&id).await.unwrap().is_none());
    }
}
