//! # Tool Calls
//!
//! The provider announces a function call in fragments: an `output_item.added`
//! carrying the ids and name, any number of argument deltas, then an
//! `output_item.done`. [`ToolCallTracker`] stitches those together. Argument
//! deltas sometimes reference the item id and sometimes only the call id, so
//! lookups try both.
//!
//! Results coming back from the browser are turned into `function_call_output`
//! strings by [`output_for`].

use super::events::FunctionCallItem;
use super::protocol::{ToolCall, ToolFunction, ToolResult};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingToolCall {
    pub item_id: String,
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

impl PendingToolCall {
    fn from_item(item: &FunctionCallItem) -> Self {
        Self {
            item_id: item.item_id.clone(),
            call_id: item.call_id.clone(),
            name: item.name.clone().unwrap_or_default(),
            arguments: item.arguments.clone().unwrap_or_default(),
        }
    }

    fn to_call(&self) -> ToolCall {
        ToolCall {
            id: self.item_id.clone(),
            call_id: self.call_id.clone(),
            function: ToolFunction {
                name: self.name.clone(),
                arguments: self.arguments.clone(),
            },
        }
    }
}

/// Pending calls of the current generation, in announcement order.
#[derive(Debug, Default)]
pub struct ToolCallTracker {
    pending: Vec<PendingToolCall>,
}

impl ToolCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, item_id: Option<&str>, call_id: Option<&str>) -> Option<usize> {
        item_id
            .and_then(|id| self.pending.iter().position(|call| call.item_id == id))
            .or_else(|| call_id.and_then(|id| self.pending.iter().position(|call| call.call_id == id)))
    }

    /// Starts tracking a call. A repeated announcement for the same item is ignored.
    pub fn begin(&mut self, item: &FunctionCallItem) {
        if self
            .position(Some(&item.item_id), Some(&item.call_id))
            .is_some()
        {
            return;
        }
        self.pending.push(PendingToolCall::from_item(item));
    }

    /// Returns false when no pending call matches either id.
    pub fn append_arguments(&mut self, item_id: Option<&str>, call_id: Option<&str>, delta: &str) -> bool {
        match self.position(item_id, call_id) {
            Some(index) => {
                self.pending[index].arguments.push_str(delta);
                true
            }
            None => false,
        }
    }

    /// Completes a call and returns it ready for dispatch.
    ///
    /// The final item's name and arguments replace what was accumulated only
    /// when they are at least as complete; a done event for an unseen item
    /// creates the call on the spot.
    pub fn finalize(&mut self, item: &FunctionCallItem) -> ToolCall {
        let index = match self.position(Some(&item.item_id), Some(&item.call_id)) {
            Some(index) => index,
            None => {
                self.pending.push(PendingToolCall::from_item(item));
                self.pending.len() - 1
            }
        };

        let call = &mut self.pending[index];
        if let Some(name) = item.name.as_deref().filter(|n| !n.is_empty()) {
            call.name = name.to_string();
        }
        if let Some(arguments) = item.arguments.as_deref() {
            if arguments.len() >= call.arguments.len() {
                call.arguments = arguments.to_string();
            }
        }
        call.to_call()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Why the browser could not run a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFailure {
    UnsupportedRoute,
    CallFailed,
}

impl ToolFailure {
    pub fn from_code(code: &str) -> Self {
        match code {
            "UNSUPPORTED_TOOL_ROUTE" => ToolFailure::UnsupportedRoute,
            _ => ToolFailure::CallFailed,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ToolFailure::UnsupportedRoute => "UNSUPPORTED_TOOL_ROUTE",
            ToolFailure::CallFailed => "TOOL_CALL_FAILED",
        }
    }

    fn default_message(&self) -> &'static str {
        match self {
            ToolFailure::UnsupportedRoute => "Tool route is not supported.",
            ToolFailure::CallFailed => "Tool call failed.",
        }
    }

    /// Payload handed to the model in place of a tool output.
    pub fn payload(&self, message: Option<&str>) -> String {
        json!({
            "error": self.code(),
            "message": message.filter(|m| !m.is_empty()).unwrap_or(self.default_message()),
        })
        .to_string()
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// The failure a browser result reports, if any.
///
/// Only string codes are mapped; objects use their `code` field, and any other
/// truthy value is a generic failure.
fn reported_failure(error: &Value) -> Option<ToolFailure> {
    match error {
        Value::Null | Value::Bool(false) => None,
        Value::String(code) if code.is_empty() => None,
        Value::String(code) => Some(ToolFailure::from_code(code)),
        Value::Object(fields) => Some(
            fields
                .get("code")
                .and_then(Value::as_str)
                .map_or(ToolFailure::CallFailed, ToolFailure::from_code),
        ),
        _ => Some(ToolFailure::CallFailed),
    }
}

/// `function_call_output` text for one browser result.
pub fn output_for(result: &ToolResult) -> String {
    if let Some(failure) = result.error.as_ref().and_then(reported_failure) {
        let message = result
            .message
            .as_ref()
            .and_then(Value::as_str)
            .or_else(|| result.error.as_ref().and_then(|e| e.get("message")).and_then(Value::as_str));
        return failure.payload(message);
    }
    result
        .content
        .as_ref()
        .filter(|v| !v.is_null())
        .or_else(|| result.result.as_ref().filter(|v| !v.is_null()))
        .map(stringify)
        .unwrap_or_else(|| "{}".to_string())
}
