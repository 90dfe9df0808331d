use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use super::client::{HypervisorClient, TaskState};
use crate::errors::HypervisorResult;

pub const HANDLE_DELIMITER: char = ':';

/// A task handle split into the parts this crate cares about.
///
/// Handles look like `UPID:node:pid:pstart:starttime:type:id:user@realm:`.
/// Only `node` is interpreted; the rest is informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskHandle {
    pub raw: String,
    pub kind: String,
    pub node: String,
    pub operation: Option<String>,
    pub target: Option<String>,
    pub user: Option<String>,
}

impl TaskHandle {
    /// Never fails: a handle without a usable node field falls back to
    /// `default_node` so a status query can still be attempted.
    pub fn parse(raw: &str, default_node: &str) -> Self {
        let parts: Vec<&str> = raw.split(HANDLE_DELIMITER).collect();
        let field = |i: usize| {
            parts
                .get(i)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Self {
            raw: raw.to_string(),
            kind: field(0).unwrap_or_default(),
            node: field(1).unwrap_or_else(|| default_node.to_string()),
            operation: field(5),
            target: field(6),
            user: field(7),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskProgress {
    pub handle: TaskHandle,
    pub status: TaskState,
    /// 0..=100, taken from the newest percentage in the log.
    pub progress: u8,
    pub running: bool,
    pub log: Vec<String>,
}

fn percentage_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)(?:\.\d+)?%").expect("percentage pattern compiles"))
}

/// Last `NN%` token in the log, 0 if there is none. Last wins, not max:
/// downloads that restart report a lower number again.
pub fn progress_from_logs<S: AsRef<str>>(lines: &[S]) -> u8 {
    let pattern = percentage_pattern();
    lines
        .iter()
        .filter_map(|line| pattern.captures_iter(line.as_ref()).last())
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .map(|p| p.min(100) as u8)
        .unwrap_or(0)
}

/// Starts, polls and cancels long running backend tasks.
#[derive(Clone)]
pub struct TaskTracker {
    client: Arc<dyn HypervisorClient>,
    default_node: String,
}

impl TaskTracker {
    pub fn new(client: Arc<dyn HypervisorClient>, default_node: impl Into<String>) -> Self {
        Self {
            client,
            default_node: default_node.into(),
        }
    }

    pub fn parse(&self, raw: &str) -> TaskHandle {
        TaskHandle::parse(raw, &self.default_node)
    }

    pub async fn start_iso_download(
        &self,
        url: &str,
        file_name: &str,
        storage: &str,
    ) -> HypervisorResult<TaskHandle> {
        let raw = self.client.download_iso(url, file_name, storage).await?;
        let handle = self.parse(&raw);
        info!(upid = %handle.raw, node = %handle.node, file_name, "ISO download started");
        Ok(handle)
    }

    /// Backend status plus progress derived from the log. A log that cannot
    /// be fetched yields progress 0 instead of failing the poll.
    pub async fn poll_status(&self, raw: &str) -> HypervisorResult<TaskProgress> {
        let handle = self.parse(raw);
        let status = self.client.task_status(&handle.raw, &handle.node).await?;
        let log = match self.client.task_log(&handle.raw, &handle.node).await {
            Ok(log) => log,
            Err(e) => {
                warn!(upid = %handle.raw, error = %e, "Task log unavailable");
                Vec::new()
            }
        };

        Ok(TaskProgress {
            progress: progress_from_logs(&log),
            running: status.is_running(),
            status,
            handle,
            log,
        })
    }

    /// The complete log; callers wanting a tail slice it themselves.
    pub async fn log(&self, raw: &str) -> HypervisorResult<Vec<String>> {
        let handle = self.parse(raw);
        self.client.task_log(&handle.raw, &handle.node).await
    }

    /// Asks the backend to stop the task. Cancellation is cooperative, a
    /// later poll may still report it running.
    pub async fn cancel(&self, raw: &str) -> bool {
        let handle = self.parse(raw);
        match self.client.cancel_task(&handle.raw, &handle.node).await {
            Ok(accepted) => {
                info!(upid = %handle.raw, accepted, "Task cancellation requested");
                accepted
            }
            Err(e) => {
                warn!(upid = %handle.raw, error = %e, "Task cancellation failed");
                false
            }
        }
    }
}
