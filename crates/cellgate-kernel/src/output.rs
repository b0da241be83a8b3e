//! Turns iopub traffic for one execution into plain text.

use serde_json::Value;

use crate::wire::JupyterMessage;

/// Collects the text output of a single request.
///
/// Only messages whose parent is the tracked request count. Text is kept in
/// arrival order:
///
/// - `stream`: `content.text`
/// - `execute_result`: `content.data["text/plain"]`
/// - `error`: `content.traceback` joined with newlines
/// - `status` with `execution_state == "idle"` ends collection
///
/// Everything else is ignored.
#[derive(Debug)]
pub struct OutputCollector {
    parent_id: String,
    chunks: Vec<String>,
    done: bool,
}

impl OutputCollector {
    pub fn new(parent_id: impl Into<String>) -> Self {
        Self {
            parent_id: parent_id.into(),
            chunks: Vec::new(),
            done: false,
        }
    }

    /// Feed one iopub message. Returns `true` once the kernel reported idle.
    pub fn feed(&mut self, msg: &JupyterMessage) -> bool {
        if self.done {
            return true;
        }
        if msg.parent_msg_id() != Some(self.parent_id.as_str()) {
            tracing::trace!(
                msg_type = msg.msg_type(),
                "ignoring iopub message for another request"
            );
            return false;
        }

        let content = &msg.content;
        match msg.msg_type() {
            "stream" => {
                if let Some(text) = content.get("text").and_then(Value::as_str) {
                    self.chunks.push(text.to_string());
                }
            }
            "execute_result" => {
                if let Some(text) = content
                    .get("data")
                    .and_then(|d| d.get("text/plain"))
                    .and_then(Value::as_str)
                {
                    self.chunks.push(text.to_string());
                }
            }
            "error" => {
                let lines: Vec<&str> = content
                    .get("traceback")
                    .and_then(Value::as_array)
                    .map(|tb| tb.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                self.chunks.push(lines.join("\n"));
            }
            "status" => {
                if content.get("execution_state").and_then(Value::as_str) == Some("idle") {
                    self.done = true;
                }
            }
            _ => {}
        }
        self.done
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub fn finish(self) -> String {
        self.chunks.concat()
    }
}
