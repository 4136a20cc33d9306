//! Handles for server-side background tasks.
//!
//! # Design
//! Long-running calls answer with a task envelope, which the codec decodes
//! into an unbound [`TaskRef`]: just the id and token, with no way to poll.
//! Binding a session produces a [`TaskHandle`] carrying the polling
//! surface, so refreshing an unbound result is a compile error rather than
//! a runtime one. Polling is skipped once the task has settled.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::codec::{encode_to_string, Value, ValueMap};
use crate::error::{Error, Result};
use crate::http::{HttpMethod, HttpRequest};
use crate::model::malformed_response;
use crate::session::Session;

/// Lifecycle states reported by the task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Started,
    Success,
    Failure,
    Retry,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
            TaskState::Retry => "RETRY",
        }
    }

    fn parse(text: &str) -> Option<TaskState> {
        match text {
            "PENDING" => Some(TaskState::Pending),
            "STARTED" => Some(TaskState::Started),
            "SUCCESS" => Some(TaskState::Success),
            "FAILURE" => Some(TaskState::Failure),
            "RETRY" => Some(TaskState::Retry),
            _ => None,
        }
    }

    /// Whether another poll could still change the state.
    pub fn in_progress(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Started)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unbound pointer to a background task, as decoded off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub task_id: String,
    pub token: String,
}

impl TaskRef {
    pub fn new(task_id: impl Into<String>, token: impl Into<String>) -> Self {
        TaskRef {
            task_id: task_id.into(),
            token: token.into(),
        }
    }

    /// Attach a session, producing a handle that can poll.
    pub fn bind(self, session: &Session) -> TaskHandle<'_> {
        TaskHandle {
            session,
            task: self,
            state: TaskState::Pending,
            result: None,
            created: Instant::now(),
        }
    }
}

/// A task pointer bound to a session.
#[derive(Debug)]
pub struct TaskHandle<'a> {
    session: &'a Session,
    task: TaskRef,
    state: TaskState,
    result: Option<Value>,
    created: Instant,
}

impl TaskHandle<'_> {
    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Result reported with the last adopted state, if any.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Time since this handle was created.
    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    /// Poll the task queue unless the task has already settled.
    ///
    /// A reply carrying an `error` field marks the task failed and
    /// surfaces the error; otherwise the reported state and result are
    /// adopted.
    pub fn refresh_if_needed(&mut self) -> Result<()> {
        if !self.state.in_progress() {
            return Ok(());
        }
        debug!(task_id = %self.task.task_id, "poll");
        let url = format!("{}/async-result", self.session.base_url());
        let mut request = HttpRequest::new(HttpMethod::Post, url);
        let mut body = ValueMap::new();
        body.insert(
            "tasks".to_string(),
            Value::List(vec![Value::List(vec![
                Value::from(self.task.task_id.as_str()),
                Value::from(self.task.token.as_str()),
            ])]),
        );
        request.body = Some(encode_to_string(&Value::Map(body)));
        let reply = self.session.execute(request)?;

        let entry = single_task_entry(&reply)?;
        if let Some(error) = entry.get("error") {
            self.state = TaskState::Failure;
            let message = match error {
                Value::String(text) => text.clone(),
                other => encode_to_string(other),
            };
            return Err(Error::Server {
                message,
                status: 500,
                incident_id: None,
            });
        }
        if let Some(text) = entry.get("state").and_then(Value::as_str) {
            let state = TaskState::parse(text)
                .ok_or_else(|| malformed_response(format!("unknown task state '{text}'")))?;
            self.state = state;
            self.result = entry.get("result").cloned();
        }
        Ok(())
    }

    /// Whether the task finished successfully, polling first if needed.
    pub fn ready(&mut self) -> Result<bool> {
        self.refresh_if_needed()?;
        Ok(self.state == TaskState::Success)
    }

    /// Whether the task failed, polling first if needed.
    pub fn failed(&mut self) -> Result<bool> {
        self.refresh_if_needed()?;
        Ok(self.state == TaskState::Failure)
    }

    /// Block until the task settles. Reserved; not implemented yet.
    pub fn wait(&mut self, _timeout: Option<Duration>) -> Result<Value> {
        Err(Error::NotImplemented("wait"))
    }
}

fn single_task_entry(reply: &Value) -> Result<&ValueMap> {
    let tasks = reply
        .as_map()
        .and_then(|map| map.get("tasks"))
        .and_then(Value::as_list)
        .ok_or_else(|| malformed_response("task poll reply has no tasks".to_string()))?;
    match tasks {
        [entry] => entry
            .as_map()
            .ok_or_else(|| malformed_response("task entry is not a map".to_string())),
        _ => Err(malformed_response(format!(
            "expected one task entry, got {}",
            tasks.len()
        ))),
    }
}
