//! Backup job state machine and its append-only log of events and commands.
//!
//! A job moves `pending -> running -> completed | failed`. Every entry gets
//! a timestamp that never goes backwards within one job, so the log can be
//! replayed in order by any structured sink.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backup::{BackupError, Result};

/// Lifecycle status of a backup or restore job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Discriminant of a [`LogEntry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Event,
    Command,
}

/// Payload of a log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogDetail {
    Event {
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Map<String, Value>>,
    },
    Command {
        command: String,
        #[serde(default)]
        output: Option<String>,
        #[serde(default)]
        exit_code: Option<i32>,
        #[serde(default)]
        start_time: Option<DateTime<Utc>>,
    },
}

/// One timestamped record in a job log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub detail: LogDetail,
}

impl LogEntry {
    pub fn kind(&self) -> LogKind {
        match self.detail {
            LogDetail::Event { .. } => LogKind::Event,
            LogDetail::Command { .. } => LogKind::Command,
        }
    }

    /// Message of an event entry, command text of a command entry
    pub fn text(&self) -> &str {
        match &self.detail {
            LogDetail::Event { message, .. } => message,
            LogDetail::Command { command, .. } => command,
        }
    }
}

/// Fields merged into a command entry once its process finishes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandUpdate {
    pub output: Option<String>,
    pub exit_code: Option<i32>,
}

/// Append-only, ordered log belonging to one job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobLog {
    entries: Vec<LogEntry>,
}

impl JobLog {
    fn append(&mut self, detail: LogDetail) -> usize {
        let now = Utc::now();
        let timestamp = match self.entries.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        self.entries.push(LogEntry { timestamp, detail });
        self.entries.len() - 1
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}

/// A single backup or restore run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    id: Uuid,
    status: JobStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    logs: JobLog,
}

impl Default for BackupJob {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupJob {
    /// Create a job in the `pending` state
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            started_at: None,
            completed_at: None,
            logs: JobLog::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Record a finished command in one step
    pub fn log_command(
        &mut self,
        command: impl Into<String>,
        output: Option<String>,
        exit_code: Option<i32>,
        start_time: Option<DateTime<Utc>>,
    ) -> usize {
        self.logs.append(LogDetail::Command {
            command: command.into(),
            output,
            exit_code,
            start_time,
        })
    }

    /// Record a command that is about to run and return its position.
    ///
    /// Complete it later with [`BackupJob::update_command_log`].
    pub fn start_command_log(&mut self, command: impl Into<String>) -> usize {
        let start_time = Utc::now();
        self.logs.append(LogDetail::Command {
            command: command.into(),
            output: None,
            exit_code: None,
            start_time: Some(start_time),
        })
    }

    /// Merge output and exit code into the command entry at `index`.
    ///
    /// Returns `false` without touching the log if `index` is out of range
    /// or points at an event entry.
    pub fn update_command_log(&mut self, index: usize, update: CommandUpdate) -> bool {
        let Some(entry) = self.logs.entries.get_mut(index) else {
            warn!(job_id = %self.id, index, "Ignoring update for unknown command log entry");
            return false;
        };
        match &mut entry.detail {
            LogDetail::Command {
                output, exit_code, ..
            } => {
                if update.output.is_some() {
                    *output = update.output;
                }
                if update.exit_code.is_some() {
                    *exit_code = update.exit_code;
                }
                true
            }
            LogDetail::Event { .. } => false,
        }
    }

    /// Append an event entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) -> usize {
        self.log_with_context(level, message, None)
    }

    pub fn log_with_context(
        &mut self,
        level: LogLevel,
        message: impl Into<String>,
        context: Option<Map<String, Value>>,
    ) -> usize {
        self.logs.append(LogDetail::Event {
            level,
            message: message.into(),
            context,
        })
    }

    pub fn logs(&self) -> &[LogEntry] {
        self.logs.entries()
    }

    pub fn logs_by_kind(&self, kind: LogKind) -> Vec<&LogEntry> {
        self.logs().iter().filter(|entry| entry.kind() == kind).collect()
    }

    pub fn command_logs(&self) -> Vec<&LogEntry> {
        self.logs_by_kind(LogKind::Command)
    }

    /// Elapsed milliseconds between start and completion, once both are set.
    ///
    /// Never negative, even if the wall clock stepped back mid-run.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_milliseconds().max(0)),
            _ => None,
        }
    }

    /// `"850ms"` below one second, `"12.35s"` otherwise
    pub fn human_duration(&self) -> Option<String> {
        let ms = self.duration_ms()?;
        if ms < 1000 {
            Some(format!("{ms}ms"))
        } else {
            Some(format!("{:.2}s", ms as f64 / 1000.0))
        }
    }

    pub fn mark_running(&mut self) -> Result<()> {
        self.transition(&[JobStatus::Pending], JobStatus::Running)?;
        self.started_at = Some(Utc::now());
        info!(job_id = %self.id, "Job started");
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        self.transition(&[JobStatus::Running], JobStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        info!(job_id = %self.id, duration = ?self.human_duration(), "Job completed");
        Ok(())
    }

    /// Fail the job and record `cause` as an error-level entry.
    ///
    /// Allowed from `pending` too, for pre-flight failures.
    pub fn mark_failed(&mut self, cause: &dyn fmt::Display) -> Result<()> {
        self.transition(&[JobStatus::Pending, JobStatus::Running], JobStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        let message = cause.to_string();
        warn!(job_id = %self.id, error = %message, "Job failed");
        self.log(LogLevel::Error, message);
        Ok(())
    }

    fn transition(&mut self, allowed: &[JobStatus], to: JobStatus) -> Result<()> {
        if !allowed.contains(&self.status) {
            return Err(BackupError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_new_job_is_pending_and_empty() {
        let job = BackupJob::new();
        assert_eq!(job.status(), JobStatus::Pending);
        assert!(job.logs().is_empty());
        assert!(job.duration_ms().is_none());
        assert!(job.human_duration().is_none());
    }

    #[test]
    fn test_lifecycle_duration_tracks_wall_time() {
        let mut job = BackupJob::new();
        job.mark_running().unwrap();
        assert!(job.duration_ms().is_none());

        std::thread::sleep(std::time::Duration::from_millis(60));
        job.mark_completed().unwrap();

        let duration = job.duration_ms().unwrap();
        assert!(duration >= 60, "duration was {duration}");
        assert!(duration < 5_000, "duration was {duration}");
        assert_eq!(job.status(), JobStatus::Completed);
    }

    #[test]
    fn test_mark_failed_appends_error_entry() {
        let mut job = BackupJob::new();
        job.mark_running().unwrap();
        job.log(LogLevel::Info, "Dumping database");
        job.log_command("mysqldump app", Some("ok".to_string()), Some(0), None);
        let before: Vec<LogEntry> = job.logs().to_vec();

        let err = BackupError::Dump("mysqldump exited with code 2".to_string());
        job.mark_failed(&err).unwrap();

        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.completed_at().is_some());
        assert_eq!(&job.logs()[..before.len()], before.as_slice());

        let last = job.logs().last().unwrap();
        match &last.detail {
            LogDetail::Event { level, message, .. } => {
                assert_eq!(*level, LogLevel::Error);
                assert_eq!(message, &err.to_string());
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn test_mark_failed_from_pending() {
        let mut job = BackupJob::new();
        job.mark_failed(&"invalid pattern").unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.started_at().is_none());
        assert!(job.duration_ms().is_none());
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let mut job = BackupJob::new();
        assert!(matches!(
            job.mark_completed(),
            Err(BackupError::InvalidTransition {
                from: JobStatus::Pending,
                to: JobStatus::Completed
            })
        ));

        job.mark_running().unwrap();
        assert!(job.mark_running().is_err());
        job.mark_completed().unwrap();

        assert!(job.mark_failed(&"late failure").is_err());
        assert!(job.mark_running().is_err());
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.logs().is_empty());
    }

    #[test]
    fn test_human_duration_formats() {
        let mut job = BackupJob::new();
        let start = Utc::now();
        job.started_at = Some(start);

        job.completed_at = Some(start + Duration::milliseconds(850));
        assert_eq!(job.human_duration().as_deref(), Some("850ms"));

        job.completed_at = Some(start + Duration::milliseconds(12_345));
        assert_eq!(job.human_duration().as_deref(), Some("12.35s"));

        job.completed_at = Some(start + Duration::milliseconds(1_000));
        assert_eq!(job.human_duration().as_deref(), Some("1.00s"));
    }

    #[test]
    fn test_duration_clamped_when_clock_steps_back() {
        let mut job = BackupJob::new();
        let start = Utc::now();
        job.started_at = Some(start);
        job.completed_at = Some(start - Duration::milliseconds(5));

        assert_eq!(job.duration_ms(), Some(0));
        assert_eq!(job.human_duration().as_deref(), Some("0ms"));
    }

    #[test]
    fn test_streaming_command_log() {
        let mut job = BackupJob::new();
        job.log(LogLevel::Info, "before");
        let index = job.start_command_log("pg_restore -d app");
        job.log(LogLevel::Info, "after");

        let updated = job.update_command_log(
            index,
            CommandUpdate {
                output: Some("restored".to_string()),
                exit_code: Some(0),
            },
        );
        assert!(updated);

        match &job.logs()[index].detail {
            LogDetail::Command {
                command,
                output,
                exit_code,
                start_time,
            } => {
                assert_eq!(command, "pg_restore -d app");
                assert_eq!(output.as_deref(), Some("restored"));
                assert_eq!(*exit_code, Some(0));
                assert!(start_time.is_some());
            }
            other => panic!("unexpected entry {other:?}"),
        }
        assert_eq!(job.logs()[0].text(), "before");
        assert_eq!(job.logs()[2].text(), "after");
    }

    #[test]
    fn test_update_out_of_range_is_noop() {
        let mut job = BackupJob::new();
        let event = job.log(LogLevel::Info, "only event");
        let snapshot = job.logs().to_vec();

        assert!(!job.update_command_log(5, CommandUpdate::default()));
        assert!(!job.update_command_log(
            event,
            CommandUpdate {
                output: Some("x".to_string()),
                exit_code: Some(1),
            }
        ));
        assert_eq!(job.logs(), snapshot.as_slice());
    }

    #[test]
    fn test_partial_update_keeps_existing_fields() {
        let mut job = BackupJob::new();
        let index = job.start_command_log("mongodump");
        job.update_command_log(
            index,
            CommandUpdate {
                output: Some("partial".to_string()),
                exit_code: None,
            },
        );
        job.update_command_log(
            index,
            CommandUpdate {
                output: None,
                exit_code: Some(0),
            },
        );
        match &job.logs()[index].detail {
            LogDetail::Command {
                output, exit_code, ..
            } => {
                assert_eq!(output.as_deref(), Some("partial"));
                assert_eq!(*exit_code, Some(0));
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn test_accessors_filter_by_kind_in_order() {
        let mut job = BackupJob::new();
        job.log(LogLevel::Info, "one");
        job.log_command("cmd-a", None, Some(0), None);
        job.log(LogLevel::Warning, "two");
        job.log_command("cmd-b", None, Some(1), None);

        let commands: Vec<&str> = job.command_logs().iter().map(|e| e.text()).collect();
        assert_eq!(commands, vec!["cmd-a", "cmd-b"]);

        let events: Vec<&str> = job
            .logs_by_kind(LogKind::Event)
            .iter()
            .map(|e| e.text())
            .collect();
        assert_eq!(events, vec!["one", "two"]);
        assert_eq!(job.logs().len(), 4);
    }

    #[test]
    fn test_timestamps_never_decrease() {
        let mut job = BackupJob::new();
        for i in 0..50 {
            job.log(LogLevel::Debug, format!("entry {i}"));
        }
        assert!(job.logs().windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_log_entry_serialization_shape() {
        let mut job = BackupJob::new();
        let mut context = Map::new();
        context.insert("local_port".to_string(), json!(40222));
        job.log_with_context(LogLevel::Info, "SSH tunnel established", Some(context));
        job.log_command("mysqldump app", None, Some(0), None);

        let value = serde_json::to_value(job.logs()).unwrap();
        assert_eq!(value[0]["type"], "event");
        assert_eq!(value[0]["level"], "info");
        assert_eq!(value[0]["context"]["local_port"], 40222);
        assert_eq!(value[1]["type"], "command");
        assert_eq!(value[1]["exit_code"], 0);

        let parsed: Vec<LogEntry> = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.as_slice(), job.logs());
    }
}
