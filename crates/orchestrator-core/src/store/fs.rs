use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use super::{collect_pages, plan_append, ExecutionStore, ListFilter, LogEventStore};
use crate::error::OrchestratorError;
use crate::execution::{Execution, ExecutionId};
use crate::log_event::{EventKey, LogEvent};

/// Largest epoch-millisecond value the start index encodes; subtracting from
/// it makes lexical order newest-first.
const START_KEY_CEILING: i64 = 9_999_999_999_999;

fn validate_id(execution_id: &ExecutionId) -> Result<(), OrchestratorError> {
    let id = execution_id.as_str();
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(OrchestratorError::InvalidRequest(format!(
            "execution id '{}' contains unsupported characters",
            id
        )));
    }
    Ok(())
}

fn write_atomically(target: &Path, contents: &[u8]) -> Result<(), OrchestratorError> {
    let tmp = temp_path(target);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, target)?;
    Ok(())
}

fn temp_path(target: &Path) -> PathBuf {
    let name = format!(".tmp-{}", uuid::Uuid::new_v4().simple());
    target.with_file_name(name)
}

/// One pretty-printed JSON file per execution under `executions/`, plus empty
/// marker files in `executions/by-start/` whose names sort newest-first.
///
/// `create` writes a temp file and hard-links it into place, so a concurrent
/// create of the same id fails and readers never see a half-written record.
pub struct FsExecutionStore {
    dir: PathBuf,
    page_size: usize,
    // Serializes update/delete within this process.
    write_lock: Mutex<()>,
}

impl FsExecutionStore {
    pub fn open(root: &Path, page_size: usize) -> Result<Self, OrchestratorError> {
        let dir = root.join("executions");
        fs::create_dir_all(dir.join("by-start"))?;
        Ok(Self {
            dir,
            page_size: page_size.max(1),
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, execution_id: &ExecutionId) -> PathBuf {
        self.dir.join(format!("{}.json", execution_id))
    }

    fn index_path(&self, execution: &Execution) -> PathBuf {
        let millis = execution.started_at.timestamp_millis().clamp(0, START_KEY_CEILING);
        self.dir.join("by-start").join(format!(
            "{:013}-{}",
            START_KEY_CEILING - millis,
            execution.execution_id
        ))
    }

    fn read_record(&self, path: &Path) -> Result<Option<Execution>, OrchestratorError> {
        match fs::read_to_string(path) {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Index entry names in newest-first order.
    fn index_entries(&self) -> Result<Vec<String>, OrchestratorError> {
        let mut names: Vec<String> = fs::read_dir(self.dir.join("by-start"))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, OrchestratorError> {
        self.write_lock
            .lock()
            .map_err(|e| OrchestratorError::StoreUnavailable(e.to_string()))
    }
}

#[async_trait::async_trait]
impl ExecutionStore for FsExecutionStore {
    async fn create(&self, execution: &Execution) -> Result<(), OrchestratorError> {
        validate_id(&execution.execution_id)?;
        let target = self.record_path(&execution.execution_id);
        let tmp = temp_path(&target);
        fs::write(&tmp, serde_json::to_vec_pretty(execution)?)?;
        let linked = fs::hard_link(&tmp, &target);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(OrchestratorError::Conflict(format!(
                    "execution {} already exists",
                    execution.execution_id
                )));
            }
            Err(e) => return Err(e.into()),
        }
        fs::write(self.index_path(execution), b"")?;
        debug!(execution_id = %execution.execution_id, "execution record created");
        Ok(())
    }

    async fn get(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<Execution>, OrchestratorError> {
        validate_id(execution_id)?;
        self.read_record(&self.record_path(execution_id))
    }

    async fn update(&self, execution: &Execution) -> Result<(), OrchestratorError> {
        validate_id(&execution.execution_id)?;
        let _guard = self.guard()?;
        let path = self.record_path(&execution.execution_id);
        let current = self.read_record(&path)?.ok_or_else(|| {
            OrchestratorError::ExecutionNotFound(execution.execution_id.to_string())
        })?;
        current.check_transition(execution)?;
        write_atomically(&path, &serde_json::to_vec_pretty(execution)?)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Execution>, OrchestratorError> {
        let entries = self.index_entries()?;
        collect_pages(filter, |cursor: Option<&usize>| {
            let offset = cursor.copied().unwrap_or(0);
            let window: Vec<&String> = entries.iter().skip(offset).take(self.page_size).collect();
            let mut page = Vec::new();
            for name in &window {
                let Some((_, id)) = name.split_once('-') else {
                    continue;
                };
                let id = ExecutionId::from(id);
                match self.read_record(&self.record_path(&id))? {
                    Some(execution) if filter.matches(&execution) => page.push(execution),
                    Some(_) => {}
                    None => warn!(execution_id = %id, "dangling start index entry"),
                }
            }
            let resume = offset + window.len();
            let next = (resume < entries.len()).then_some(resume);
            Ok((page, next))
        })
    }

    async fn delete(&self, execution_id: &ExecutionId) -> Result<(), OrchestratorError> {
        validate_id(execution_id)?;
        let _guard = self.guard()?;
        let path = self.record_path(execution_id);
        let execution = self
            .read_record(&path)?
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))?;
        fs::remove_file(&path)?;
        match fs::remove_file(self.index_path(&execution)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// `logs/<id>.jsonl` holds one indexed event per line; `logs/<id>.expires`
/// holds the RFC 3339 removal time once the log has been expired.
pub struct FsLogEventStore {
    dir: PathBuf,
    batch_size: usize,
    grace: Duration,
    append_lock: Mutex<()>,
}

impl FsLogEventStore {
    pub fn open(
        root: &Path,
        batch_size: usize,
        grace: Duration,
    ) -> Result<Self, OrchestratorError> {
        let dir = root.join("logs");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            batch_size: batch_size.max(1),
            grace,
            append_lock: Mutex::new(()),
        })
    }

    fn log_path(&self, execution_id: &ExecutionId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", execution_id))
    }

    fn expiry_path(&self, execution_id: &ExecutionId) -> PathBuf {
        self.dir.join(format!("{}.expires", execution_id))
    }

    fn read_events(&self, execution_id: &ExecutionId) -> Result<Vec<LogEvent>, OrchestratorError> {
        let file = match fs::File::open(self.log_path(execution_id)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str::<LogEvent>(&line)?);
        }
        events.sort_by_key(|e| e.index);
        Ok(events)
    }
}

#[async_trait::async_trait]
impl LogEventStore for FsLogEventStore {
    async fn append(
        &self,
        execution_id: &ExecutionId,
        events: &[LogEvent],
    ) -> Result<usize, OrchestratorError> {
        validate_id(execution_id)?;
        let _guard = self
            .append_lock
            .lock()
            .map_err(|e| OrchestratorError::StoreUnavailable(e.to_string()))?;

        let existing = self.read_events(execution_id)?;
        let mut keys: HashSet<EventKey> = existing.iter().map(|e| e.key()).collect();
        let mut max = existing.last().map(|e| e.index).unwrap_or(0);
        let mut stored = 0;

        for batch in events.chunks(self.batch_size) {
            let fresh = plan_append(execution_id, batch, max, |e| keys.contains(&e.key()))?;
            if fresh.is_empty() {
                continue;
            }
            let mut buf = Vec::new();
            for event in &fresh {
                serde_json::to_writer(&mut buf, event)?;
                buf.push(b'\n');
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.log_path(execution_id))?;
            file.write_all(&buf)?;
            for event in fresh {
                keys.insert(event.key());
                max = event.index;
                stored += 1;
            }
        }
        Ok(stored)
    }

    async fn list_all(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<LogEvent>, OrchestratorError> {
        validate_id(execution_id)?;
        self.read_events(execution_id)
    }

    async fn max_index(&self, execution_id: &ExecutionId) -> Result<u64, OrchestratorError> {
        validate_id(execution_id)?;
        Ok(self
            .read_events(execution_id)?
            .last()
            .map(|e| e.index)
            .unwrap_or(0))
    }

    async fn expire(&self, execution_id: &ExecutionId) -> Result<(), OrchestratorError> {
        validate_id(execution_id)?;
        let path = self.expiry_path(execution_id);
        if path.exists() {
            return Ok(());
        }
        let at = Utc::now() + self.grace;
        write_atomically(&path, at.to_rfc3339().as_bytes())
    }

    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionId>, OrchestratorError> {
        let mut purged = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "expires") {
                continue;
            }
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            let raw = fs::read_to_string(&path)?;
            let at = match DateTime::parse_from_rfc3339(raw.trim()) {
                Ok(at) => at.with_timezone(&Utc),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "unreadable expiry marker");
                    continue;
                }
            };
            if at > now {
                continue;
            }
            let id = ExecutionId::from_string(stem);
            match fs::remove_file(self.log_path(&id)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::remove_file(&path)?;
            purged.push(id);
        }
        Ok(purged)
    }
}
