use std::pin::Pin;

use {
    futures::{Stream, StreamExt},
    serde_json::Value,
    tracing::warn,
};

use crate::error::{Error, Result};

/// Events streamed back by `call_tool_streaming`.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

enum Line {
    Event(Value),
    Done,
    Skip,
}

fn parse_line(line: &str) -> Line {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Line::Skip;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Line::Done;
    }
    match serde_json::from_str(data) {
        Ok(value) => Line::Event(value),
        Err(e) => {
            warn!(error = %e, "skipping malformed SSE event");
            Line::Skip
        },
    }
}

/// Turn a `text/event-stream` body into JSON events, one per `data:` line.
///
/// A transport error ends the stream after yielding it.
pub fn events(resp: reqwest::Response) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut bytes = resp.bytes_stream();
        let mut buf = String::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield Err(Error::Http(e));
                    return;
                }
            };
            buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buf.find('\n') {
                let line: String = buf.drain(..=pos).collect();
                match parse_line(&line) {
                    Line::Event(value) => yield Ok(value),
                    Line::Done => return,
                    Line::Skip => {},
                }
            }
        }

        if let Line::Event(value) = parse_line(&buf) {
            yield Ok(value);
        }
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn parses_data_lines() {
        assert!(matches!(parse_line("data: {\"a\":1}"), Line::Event(v) if v == json!({"a": 1})));
        assert!(matches!(parse_line("data:{\"a\":2}\r"), Line::Event(v) if v == json!({"a": 2})));
        assert!(matches!(parse_line("data: [DONE]"), Line::Done));
        assert!(matches!(parse_line("event: progress"), Line::Skip));
        assert!(matches!(parse_line(": keepalive"), Line::Skip));
        assert!(matches!(parse_line("data: {broken"), Line::Skip));
        assert!(matches!(parse_line(""), Line::Skip));
    }

    #[tokio::test]
    async fn streams_events_from_response_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/stream")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(
                "data: {\"status\":\"running\"}\n\n: ping\ndata: nope\n\ndata: {\"status\":\"done\",\"result\":42}\n\ndata: [DONE]\n\ndata: {\"after\":true}\n",
            )
            .create_async()
            .await;

        let resp = reqwest::get(format!("{}/stream", server.url())).await.unwrap();
        let collected: Vec<Value> = events(resp).map(|e| e.unwrap()).collect().await;
        assert_eq!(
            collected,
            vec![
                json!({"status": "running"}),
                json!({"status": "done", "result": 42})
            ]
        );
    }

    #[tokio::test]
    async fn trailing_line_without_newline_is_kept() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/stream")
            .with_status(200)
            .with_body("data: {\"n\":1}\ndata: {\"n\":2}")
            .create_async()
            .await;

        let resp = reqwest::get(format!("{}/stream", server.url())).await.unwrap();
        let collected: Vec<Value> = events(resp).map(|e| e.unwrap()).collect().await;
        assert_eq!(collected, vec![json!({"n": 1}), json!({"n": 2})]);
    }
}
