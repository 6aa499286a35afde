//! In-process sink.
//!
//! `memory://` sinks record every statement and answer from a script of queued
//! responses (an empty response once the script runs out). The same script can
//! be shared by a [`MemoryConnector`] so that tests can also fail connects.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::{DatabaseType, Result, Sink, SinkConnector, SinkError, SinkResponse};

#[derive(Default)]
struct ScriptState {
    responses: VecDeque<Result<SinkResponse>>,
    executed: Vec<String>,
    connect_failures: VecDeque<SinkError>,
    connects: usize,
}

/// Shared, cloneable script of sink behaviour.
#[derive(Clone, Default)]
pub struct MemoryScript {
    inner: Arc<Mutex<ScriptState>>,
}

impl MemoryScript {
    fn state(&self) -> MutexGuard<'_, ScriptState> {
        // A panic while holding the lock only happens in a failing test; the
        // recorded state is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue the result of the next `execute` call.
    pub fn push_response(&self, response: Result<SinkResponse>) {
        self.state().responses.push_back(response);
    }

    /// Make the next connect attempt fail with `error`.
    pub fn fail_next_connect(&self, error: SinkError) {
        self.state().connect_failures.push_back(error);
    }

    /// Statements executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        self.state().connects
    }
}

pub struct MemorySink {
    script: MemoryScript,
}

impl MemorySink {
    pub fn new(script: MemoryScript) -> Self {
        Self { script }
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Memory
    }

    async fn execute(&mut self, statement: &str) -> Result<SinkResponse> {
        debug!(bytes = statement.len(), "memory sink statement");
        let mut state = self.script.state();
        state.executed.push(statement.to_string());
        state
            .responses
            .pop_front()
            .unwrap_or_else(|| Ok(SinkResponse::empty()))
    }
}

/// Connector handing out [`MemorySink`]s bound to one script, whatever the URL.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    script: MemoryScript,
}

impl MemoryConnector {
    pub fn new(script: MemoryScript) -> Self {
        Self { script }
    }

    pub fn script(&self) -> &MemoryScript {
        &self.script
    }
}

#[async_trait]
impl SinkConnector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Sink>> {
        {
            let mut state = self.script.state();
            if let Some(error) = state.connect_failures.pop_front() {
                return Err(error);
            }
            state.connects += 1;
        }
        Ok(Box::new(MemorySink::new(self.script.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SinkTable, SinkValue};

    #[tokio::test]
    async fn test_memory_sink_replays_script_then_defaults() {
        let script = MemoryScript::default();
        let table = SinkTable::new(vec!["hold_seconds".into()]).with_row(vec![SinkValue::Integer(5)]);
        script.push_response(Ok(SinkResponse::empty().with_table(table)));
        script.push_response(Err(SinkError::exec("boom")));

        let connector = MemoryConnector::new(script.clone());
        let mut sink = connector.connect("memory://").await.unwrap();

        assert_eq!(sink.execute("one").await.unwrap().hold_seconds(), Some(5));
        assert_eq!(sink.execute("two").await, Err(SinkError::exec("boom")));
        assert_eq!(sink.execute("three").await.unwrap(), SinkResponse::empty());
        assert_eq!(script.executed(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_memory_connector_fails_scripted_connects() {
        let script = MemoryScript::default();
        script.fail_next_connect(SinkError::connect("login failed"));
        let connector = MemoryConnector::new(script.clone());

        assert!(connector.connect("memory://").await.err().unwrap().is_connect());
        assert!(connector.connect("memory://").await.is_ok());
        assert_eq!(script.connect_count(), 1);
    }
}
