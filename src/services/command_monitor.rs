//! Command monitor
//!
//! Listens to driver command events and records any operation that ran
//! longer than the slow threshold. Started and succeeded events are
//! correlated by request id; the command document is only kept until its
//! outcome arrives.

use std::collections::HashSet;
use std::sync::Arc;

use bson::Document;
use dashmap::DashMap;
use mongodb::event::command::CommandEvent;
use serde_json::json;

use crate::services::query_profiler::QueryProfilerService;

/// Commands the profiler itself issues, never worth recording.
const IGNORED_COMMANDS: &[&str] = &[
    "explain",
    "collStats",
    "listIndexes",
    "ping",
    "hello",
    "isMaster",
    "buildInfo",
    "endSessions",
];

struct PendingCommand {
    collection: String,
    operation: String,
    query: Document,
    pipeline: Option<Vec<Document>>,
}

/// Correlates command started/succeeded events and feeds the profiler.
pub struct CommandMonitor {
    profiler: Arc<QueryProfilerService>,
    /// Collections whose traffic is ignored, e.g. the profiler's own
    /// persistence collection.
    ignored_collections: HashSet<String>,
    pending: DashMap<i32, PendingCommand>,
}

impl CommandMonitor {
    pub fn new(
        profiler: Arc<QueryProfilerService>,
        ignored_collections: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            profiler,
            ignored_collections: ignored_collections.into_iter().collect(),
            pending: DashMap::new(),
        }
    }

    /// Driver event handler forwarding to this monitor.
    pub fn event_handler(monitor: Arc<CommandMonitor>) -> mongodb::event::EventHandler<CommandEvent> {
        mongodb::event::EventHandler::callback(move |event: CommandEvent| {
            monitor.handle(&event);
        })
    }

    pub fn handle(&self, event: &CommandEvent) {
        match event {
            CommandEvent::Started(started) => {
                if started.db == "admin"
                    || IGNORED_COMMANDS.contains(&started.command_name.as_str())
                {
                    return;
                }
                if let Some(pending) = extract_command(&started.command_name, &started.command) {
                    if self.ignored_collections.contains(&pending.collection) {
                        return;
                    }
                    self.pending.insert(started.request_id, pending);
                }
            }
            CommandEvent::Succeeded(succeeded) => {
                let Some((_, pending)) = self.pending.remove(&succeeded.request_id) else {
                    return;
                };
                let duration_ms = succeeded.duration.as_secs_f64() * 1000.0;
                if duration_ms < self.profiler.slow_threshold_ms() {
                    return;
                }
                let client_info = json!({ "source": "command_monitor" });
                match &pending.pipeline {
                    Some(pipeline) => {
                        self.profiler.record_slow_aggregation(
                            &pending.collection,
                            pipeline,
                            duration_ms,
                            Some(client_info),
                        );
                    }
                    None => {
                        self.profiler.record_slow_query(
                            &pending.collection,
                            &pending.operation,
                            &pending.query,
                            duration_ms,
                            Some(client_info),
                        );
                    }
                }
            }
            CommandEvent::Failed(failed) => {
                self.pending.remove(&failed.request_id);
            }
            _ => {}
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Pull collection and filter out of a monitorable command document.
fn extract_command(name: &str, command: &Document) -> Option<PendingCommand> {
    match name {
        "find" => Some(PendingCommand {
            collection: command.get_str("find").ok()?.to_string(),
            operation: "find".to_string(),
            query: command.get_document("filter").cloned().unwrap_or_default(),
            pipeline: None,
        }),
        "aggregate" => Some(PendingCommand {
            collection: command.get_str("aggregate").ok()?.to_string(),
            operation: "aggregate".to_string(),
            query: Document::new(),
            pipeline: Some(
                command
                    .get_array("pipeline")
                    .ok()?
                    .iter()
                    .filter_map(|s| s.as_document().cloned())
                    .collect(),
            ),
        }),
        "count" => Some(PendingCommand {
            collection: command.get_str("count").ok()?.to_string(),
            operation: "count".to_string(),
            query: command.get_document("query").cloned().unwrap_or_default(),
            pipeline: None,
        }),
        "distinct" => Some(PendingCommand {
            collection: command.get_str("distinct").ok()?.to_string(),
            operation: "distinct".to_string(),
            query: command.get_document("query").cloned().unwrap_or_default(),
            pipeline: None,
        }),
        _ => None,
    }
}
