/// Research pipeline served by a sidecar graph server
///
/// The run is POSTed to `{base_url}/runs/stream` and the response is read as a
/// server-sent event stream. Event names map onto pipeline events:
/// - `checkpoint`, `task_result`, `interrupt`, `rollback`: the matching event
/// - `error`: ends the stream with [`RunError::Remote`]
/// - `end`: the graph finished
/// - anything else: [`PipelineEvent::Progress`]

use crate::pipeline::{
    sse::{LineBuffer, SseDecoder, SseEvent},
    EventStream, Pipeline, PipelineEvent, RunContext,
};
use crate::runtime::RunError;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use serde_json::{json, Value};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RemotePipeline {
    client: reqwest::Client,
    base_url: String,
}

impl RemotePipeline {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Pipeline for RemotePipeline {
    fn stream(&self, ctx: RunContext) -> EventStream {
        let url = format!("{}/runs/stream", self.base_url);
        let body = json!({
            "run_id": ctx.run.run_id,
            "thread_id": ctx.run.thread_id,
            "assistant_id": ctx.run.assistant_id,
            "attempt": ctx.attempt,
            "kwargs": ctx.run.kwargs,
            "metadata": ctx.run.metadata,
            "user": ctx.user,
        });

        tracing::debug!("🌍 Opening remote pipeline stream: POST {}", url);

        let request = self
            .client
            .post(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-store")
            .json(&body);

        futures::stream::once(async move {
            let response = request
                .send()
                .await
                .map_err(RunError::Http)?
                .error_for_status()
                .map_err(RunError::Http)?;

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("");
            if !content_type.split(';').next().unwrap_or("").contains("text/event-stream") {
                return Err(RunError::Remote(format!(
                    "expected content type 'text/event-stream', got '{content_type}'"
                )));
            }

            let body = response.bytes_stream().map_ok(|chunk| chunk.to_vec()).boxed();
            Ok(EventReader::new(body))
        })
        .flat_map(|opened| match opened {
            Ok(reader) => reader.into_stream(),
            Err(err) => futures::stream::once(async move { Err(err) }).boxed(),
        })
        .boxed()
    }
}

struct EventReader {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    lines: LineBuffer,
    decoder: SseDecoder,
    ready: VecDeque<Result<PipelineEvent, RunError>>,
    finished: bool,
}

impl EventReader {
    fn new(body: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> Self {
        Self {
            body,
            lines: LineBuffer::new(),
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    fn into_stream(self) -> EventStream {
        futures::stream::unfold(self, |mut reader| async move {
            loop {
                if let Some(item) = reader.ready.pop_front() {
                    if item.is_err() {
                        reader.ready.clear();
                        reader.finished = true;
                    }
                    return Some((item, reader));
                }
                if reader.finished {
                    return None;
                }

                match reader.body.next().await {
                    Some(Ok(chunk)) => {
                        for line in reader.lines.push(&chunk) {
                            reader.feed(&line);
                        }
                    }
                    Some(Err(err)) => {
                        reader.finished = true;
                        return Some((Err(RunError::Http(err)), reader));
                    }
                    None => {
                        if let Some(line) = reader.lines.finish() {
                            reader.feed(&line);
                        }
                        reader.feed("");
                        reader.finished = true;
                    }
                }
            }
        })
        .boxed()
    }

    fn feed(&mut self, line: &str) {
        if self.finished {
            return;
        }
        if let Some(event) = self.decoder.decode(line) {
            // Blank lines after an `id:` dispatch events with nothing in them
            if event.event.is_empty() && event.data.is_empty() {
                return;
            }
            match translate(event) {
                Ok(Some(event)) => self.ready.push_back(Ok(event)),
                Ok(None) => self.finished = true,
                Err(err) => self.ready.push_back(Err(err)),
            }
        }
    }
}

/// Map one decoded event; `Ok(None)` marks the end of the stream
fn translate(event: SseEvent) -> Result<Option<PipelineEvent>, RunError> {
    let data: Value = if event.data.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&event.data).unwrap_or_else(|_| Value::String(event.data.clone()))
    };

    let translated = match event.event.as_str() {
        "checkpoint" => PipelineEvent::Checkpoint(
            serde_json::from_value(data)
                .map_err(|e| RunError::Remote(format!("invalid checkpoint payload: {e}")))?,
        ),
        "task_result" => PipelineEvent::TaskResult(
            serde_json::from_value(data)
                .map_err(|e| RunError::Remote(format!("invalid task result payload: {e}")))?,
        ),
        "interrupt" => PipelineEvent::Interrupt {
            reason: text_field(&data, "reason"),
        },
        "rollback" => PipelineEvent::Rollback {
            reason: text_field(&data, "reason"),
        },
        "error" => return Err(RunError::Remote(text_field(&data, "message"))),
        "end" => return Ok(None),
        name => PipelineEvent::Progress(json!({ "event": name, "data": data })),
    };

    Ok(Some(translated))
}

fn text_field(data: &Value, key: &str) -> String {
    match data {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}
