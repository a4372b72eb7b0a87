//! Handlers shipped with the service.

use std::time::Duration;

use courier_api_types::MessagePayload;
use serde_json::{Value, json};

use super::context::ActionContext;
use super::handlers::{HandlerError, HandlerRegistry, Reply, handler_fn};

pub const PING: &str = "ping";
pub const ECHO: &str = "echo";
pub const SUMMARY: &str = "summary";

const PING_ESTIMATE: Duration = Duration::from_millis(10);
const ECHO_LAST_KEY: &str = "echo:last";

pub fn registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .register_immediate(PING, PING_ESTIMATE, handler_fn(|_| async { Ok(Reply::text("pong")) }))
        .register_multi_message(ECHO, handler_fn(echo))
        .register_multi_message(SUMMARY, handler_fn(summary))
}

/// Repeats `payload.text`, then each entry of `payload.repeat` as its own message.
async fn echo(ctx: ActionContext) -> Result<Reply, HandlerError> {
    let text = ctx
        .payload()
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::invalid_input("`text` must be a string"))?
        .to_string();

    let previous = ctx.documents().get(ECHO_LAST_KEY).await?;
    ctx.documents()
        .save(ECHO_LAST_KEY, json!({ "text": text, "action_id": ctx.action_id().as_str() }))
        .await?;

    let mut content = MessagePayload::text(text);
    if let Some(previous) = previous.as_ref().and_then(|doc| doc.get("text")).and_then(Value::as_str) {
        content = content.with_field("previous", json!(previous));
    }

    let follow_ups = ctx
        .payload()
        .get("repeat")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(MessagePayload::text)
                .collect()
        })
        .unwrap_or_default();

    Ok(Reply {
        content,
        follow_ups,
    })
}

/// Summarizes the materialized view named by `payload.view`.
async fn summary(ctx: ActionContext) -> Result<Reply, HandlerError> {
    let key = ctx
        .payload()
        .get("view")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::invalid_input("`view` must be a string"))?
        .to_string();

    let view = ctx.view(&key).await?;
    let entries = match &view.data {
        Value::Object(map) => map.len(),
        Value::Array(items) => items.len(),
        Value::Null => 0,
        _ => 1,
    };

    let mut reply = Reply::new(
        MessagePayload::text(format!("{key}: {entries} entries"))
            .with_field("completeness", json!(view.completeness)),
    );
    if view.incomplete {
        reply = reply.with_follow_up(MessagePayload::text(format!(
            "{key} is only {:.0}% complete; results may be partial",
            view.completeness * 100.0
        )));
    }
    Ok(reply)
}
