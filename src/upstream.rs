use std::{future::Future, pin::Pin, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures::{Stream, StreamExt, stream::unfold};
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use serde_json::Value;

use crate::{config::UpstreamConfig, error::DialogError};

/// An uploaded image as handed over by the web layer.
#[derive(Clone, PartialEq)]
pub struct ImageUpload {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl ImageUpload {
    pub fn new(filename: impl Into<String>, content_type: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type,
            bytes,
        }
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    fn mime(&self) -> &str {
        self.content_type.as_deref().unwrap_or("image/jpeg")
    }
}

impl std::fmt::Debug for ImageUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageUpload")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Request envelope sent to the inference endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    pub stream: bool,
    /// Sent as a multipart `file` part instead of inline base64.
    #[serde(skip)]
    pub attachment: Option<ImageUpload>,
}

impl InferenceRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            max_tokens,
            images: None,
            stream: false,
            attachment: None,
        }
    }
}

/// Text accumulated from a streamed upstream call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamedCompletion {
    /// Concatenated fragments, trimmed.
    pub final_text: String,
    pub chunks: Vec<String>,
    /// Last record that decoded successfully.
    pub last_envelope: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Continue,
    Done,
}

/// One decoded line of a streamed reply.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    /// Text this record contributes, if any.
    pub fragment: Option<String>,
    pub done: bool,
    pub envelope: Value,
}

impl StreamRecord {
    /// Decodes one NDJSON line. Blank and malformed lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let envelope: Value = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::debug!("Skipping malformed upstream line: {e}");
                return None;
            }
        };

        Some(Self {
            fragment: fragment(&envelope).map(str::to_string),
            done: envelope.get("done").and_then(Value::as_bool) == Some(true),
            envelope,
        })
    }
}

/// Records of a streamed call, ending after the `done` record or at EOF.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<StreamRecord, DialogError>> + Send>>;

/// Folds newline-delimited JSON records into a [`StreamedCompletion`].
///
/// Blank and malformed lines are skipped. A record with `"done": true` ends
/// the stream after its own fragment has been taken.
#[derive(Debug, Default)]
pub struct NdjsonAccumulator {
    chunks: Vec<String>,
    last_envelope: Option<Value>,
    done: bool,
}

impl NdjsonAccumulator {
    pub fn push_line(&mut self, line: &str) -> LineOutcome {
        if self.done {
            return LineOutcome::Done;
        }
        match StreamRecord::parse(line) {
            Some(record) => self.push_record(record),
            None => LineOutcome::Continue,
        }
    }

    pub fn push_record(&mut self, record: StreamRecord) -> LineOutcome {
        if self.done {
            return LineOutcome::Done;
        }
        self.chunks.extend(record.fragment);
        self.done = record.done;
        self.last_envelope = Some(record.envelope);

        if self.done {
            LineOutcome::Done
        } else {
            LineOutcome::Continue
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn finish(self) -> StreamedCompletion {
        StreamedCompletion {
            final_text: self.chunks.concat().trim().to_string(),
            chunks: self.chunks,
            last_envelope: self.last_envelope,
        }
    }
}

/// Text carried by one streamed record: chat-style `message.content`, else generate-style `response`.
fn fragment(record: &Value) -> Option<&str> {
    record
        .pointer("/message/content")
        .and_then(Value::as_str)
        .or_else(|| record.get("response").and_then(Value::as_str))
        .filter(|text| !text.is_empty())
}

/// The seam between the dialog pipeline and the model serving it.
pub trait InferenceBackend: Send + Sync {
    /// Sends the request with `stream = false` and returns the decoded JSON body.
    fn call_buffered(
        &self,
        request: InferenceRequest,
    ) -> impl Future<Output = Result<Value, DialogError>> + Send;

    /// Sends the request with `stream = true` and yields records as they arrive.
    fn open_stream(
        &self,
        request: InferenceRequest,
    ) -> impl Future<Output = Result<RecordStream, DialogError>> + Send;

    /// Sends the request with `stream = true` and accumulates the NDJSON reply.
    fn call_streamed(
        &self,
        request: InferenceRequest,
    ) -> impl Future<Output = Result<StreamedCompletion, DialogError>> + Send {
        async move {
            let mut records = self.open_stream(request).await?;
            let mut accumulator = NdjsonAccumulator::default();
            while let Some(record) = records.next().await {
                if accumulator.push_record(record?) == LineOutcome::Done {
                    break;
                }
            }
            Ok(accumulator.finish())
        }
    }
}

/// HTTP client for a single inference endpoint.
///
/// Each call opens its own request; nothing is retried. The response body is
/// owned by the calling future or the returned [`RecordStream`], so dropping
/// either (for instance when the inbound caller disconnects) releases the
/// upstream connection.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DialogError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DialogError::Upstream)?;
        Ok(Self {
            http,
            url: url.into(),
            timeout,
        })
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self, DialogError> {
        Self::new(config.url.clone(), config.timeout())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, mut request: InferenceRequest) -> Result<reqwest::Response, DialogError> {
        log::debug!(
            "Calling upstream model={} max_tokens={} stream={} attachment={}",
            request.model,
            request.max_tokens,
            request.stream,
            request.attachment.is_some()
        );

        let builder = self.http.post(&self.url);
        let builder = match request.attachment.take() {
            Some(image) => {
                let envelope = serde_json::to_string(&request)?;
                let mime = image.mime().to_string();
                let part = Part::bytes(image.bytes)
                    .file_name(image.filename)
                    .mime_str(&mime)
                    .map_err(DialogError::Upstream)?;
                builder.multipart(Form::new().text("payload", envelope).part("file", part))
            }
            None => builder.json(&request),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("Upstream returned {status}");
            return Err(DialogError::UpstreamHttp {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> DialogError {
    if err.is_timeout() {
        DialogError::UpstreamTimeout(timeout)
    } else {
        DialogError::Upstream(err)
    }
}

struct LineReader<S> {
    body: Pin<Box<S>>,
    pending: Vec<u8>,
    eof: bool,
    finished: bool,
}

/// Splits a response body on `\n` and decodes each line into a [`StreamRecord`].
fn ndjson_records<S, B>(
    body: S,
    timeout: Duration,
) -> impl Stream<Item = Result<StreamRecord, DialogError>> + Send + 'static
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let reader = LineReader {
        body: Box::pin(body),
        pending: Vec::new(),
        eof: false,
        finished: false,
    };

    unfold(reader, move |mut reader| async move {
        loop {
            if reader.finished {
                return None;
            }

            if let Some(newline) = reader.pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = reader.pending.drain(..=newline).collect();
                if let Some(record) = StreamRecord::parse(&String::from_utf8_lossy(&line)) {
                    if record.done {
                        log::debug!("Upstream stream finished on done marker");
                        reader.finished = true;
                    }
                    return Some((Ok(record), reader));
                }
                continue;
            }

            if reader.eof {
                log::debug!("Upstream stream closed by transport");
                reader.finished = true;
                let tail = std::mem::take(&mut reader.pending);
                let record = StreamRecord::parse(&String::from_utf8_lossy(&tail))?;
                return Some((Ok(record), reader));
            }

            match reader.body.next().await {
                Some(Ok(bytes)) => reader.pending.extend_from_slice(bytes.as_ref()),
                Some(Err(e)) => {
                    reader.finished = true;
                    return Some((Err(transport_error(e, timeout)), reader));
                }
                None => reader.eof = true,
            }
        }
    })
}

impl InferenceBackend for UpstreamClient {
    async fn call_buffered(&self, mut request: InferenceRequest) -> Result<Value, DialogError> {
        request.stream = false;
        let response = self.send(request).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| transport_error(e, self.timeout))
    }

    async fn open_stream(&self, mut request: InferenceRequest) -> Result<RecordStream, DialogError> {
        request.stream = true;
        let response = self.send(request).await?;
        Ok(Box::pin(ndjson_records(response.bytes_stream(), self.timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn client(server: &mockito::Server) -> UpstreamClient {
        UpstreamClient::new(format!("{}/api/generate", server.url()), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn accumulator_skips_malformed_lines_and_stops_on_done() {
        let mut acc = NdjsonAccumulator::default();
        assert_eq!(
            acc.push_line(r#"{"message":{"content":"Hello"},"done":false}"#),
            LineOutcome::Continue
        );
        assert_eq!(acc.push_line("{not json"), LineOutcome::Continue);
        assert_eq!(
            acc.push_line(r#"{"message":{"content":" world "},"done":true}"#),
            LineOutcome::Done
        );
        assert_eq!(
            acc.push_line(r#"{"message":{"content":"late"}}"#),
            LineOutcome::Done
        );

        let completion = acc.finish();
        assert_eq!(completion.chunks, vec!["Hello", " world "]);
        assert_eq!(completion.final_text, "Hello world");
        assert_eq!(completion.last_envelope.unwrap()["done"], json!(true));
    }

    #[test]
    fn accumulator_ignores_blank_lines_and_records_without_text() {
        let mut acc = NdjsonAccumulator::default();
        acc.push_line("");
        acc.push_line("   ");
        acc.push_line(r#"{"message":{"role":"assistant"}}"#);
        acc.push_line(r#"{"response":"gen"}"#);
        let completion = acc.finish();
        assert_eq!(completion.chunks, vec!["gen"]);
        assert_eq!(completion.last_envelope, Some(json!({ "response": "gen" })));
    }

    #[test]
    fn inline_request_serializes_images_only_when_present() {
        let mut request = InferenceRequest::new("m", "p", 256);
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({ "model": "m", "prompt": "p", "max_tokens": 256, "stream": false })
        );
        request.images = Some(vec![ImageUpload::new("a.png", None, vec![1, 2, 3]).to_base64()]);
        assert_eq!(serde_json::to_value(&request).unwrap()["images"], json!(["AQID"]));
    }

    #[tokio::test]
    async fn buffered_call_returns_raw_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/generate")
            .match_body(Matcher::PartialJson(json!({ "model": "m", "stream": false })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"response":"text","done":true}"#)
            .create_async()
            .await;

        let mut request = InferenceRequest::new("m", "describe", 64);
        request.stream = true;
        let body = client(&server).call_buffered(request).await.unwrap();

        assert_eq!(body, json!({ "response": "text", "done": true }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_an_http_error() {
        let mut server = mockito::Server::new_async().await;
        let _failing = server
            .mock("POST", "/api/generate")
            .with_status(500)
            .with_body("model not loaded")
            .create_async()
            .await;

        let err = client(&server)
            .call_buffered(InferenceRequest::new("m", "p", 1))
            .await
            .unwrap_err();
        match err {
            DialogError::UpstreamHttp { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "model not loaded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn streamed_call_skips_bad_lines_and_stops_after_done() {
        let mut server = mockito::Server::new_async().await;
        let body = [
            r#"{"message":{"content":"Is it "},"done":false}"#,
            r#"{"message":{"content":"#,
            r#"{"message":{"content":"red?"},"done":true}"#,
            r#"{"message":{"content":"ignored"},"done":false}"#,
        ]
        .join("\n");
        let _ndjson = server
            .mock("POST", "/api/generate")
            .match_body(Matcher::PartialJson(json!({ "stream": true })))
            .with_status(200)
            .with_header("content-type", "application/x-ndjson")
            .with_body(body)
            .create_async()
            .await;

        let completion = client(&server)
            .call_streamed(InferenceRequest::new("m", "p", 8))
            .await
            .unwrap();

        assert_eq!(completion.chunks, vec!["Is it ", "red?"]);
        assert_eq!(completion.final_text, "Is it red?");
    }

    #[tokio::test]
    async fn streamed_call_without_done_reads_to_eof() {
        let mut server = mockito::Server::new_async().await;
        let _ndjson = server
            .mock("POST", "/api/generate")
            .with_status(200)
            .with_body("{\"message\":{\"content\":\"a\"}}\n\n{\"message\":{\"content\":\"b\"}}")
            .create_async()
            .await;

        let completion = client(&server)
            .call_streamed(InferenceRequest::new("m", "p", 8))
            .await
            .unwrap();
        assert_eq!(completion.final_text, "ab");
    }

    #[tokio::test]
    async fn open_stream_yields_records_until_done() {
        let mut server = mockito::Server::new_async().await;
        let _ndjson = server
            .mock("POST", "/api/generate")
            .match_body(Matcher::PartialJson(json!({ "stream": true })))
            .with_status(200)
            .with_body(
                [
                    r#"{"message":{"content":"one"}}"#,
                    "garbage",
                    r#"{"message":{"role":"assistant"}}"#,
                    r#"{"response":"two","done":true}"#,
                    r#"{"response":"three"}"#,
                ]
                .join("\n"),
            )
            .create_async()
            .await;

        let records: Vec<StreamRecord> = client(&server)
            .open_stream(InferenceRequest::new("m", "p", 8))
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;

        let fragments: Vec<Option<&str>> = records.iter().map(|r| r.fragment.as_deref()).collect();
        assert_eq!(fragments, vec![Some("one"), None, Some("two")]);
        assert!(records[2].done);
    }

    #[tokio::test]
    async fn silent_upstream_is_reported_as_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stalled = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let upstream =
            UpstreamClient::new(format!("http://{addr}/api/generate"), Duration::from_millis(200)).unwrap();
        let err = upstream
            .call_buffered(InferenceRequest::new("m", "p", 8))
            .await
            .unwrap_err();

        match err {
            DialogError::UpstreamTimeout(after) => assert_eq!(after, Duration::from_millis(200)),
            other => panic!("unexpected error: {other:?}"),
        }
        stalled.abort();
    }

    #[tokio::test]
    async fn streamed_text_matches_buffered_text() {
        let mut server = mockito::Server::new_async().await;
        let _buffered = server
            .mock("POST", "/api/generate")
            .match_body(Matcher::PartialJson(json!({ "stream": false })))
            .with_status(200)
            .with_body(r#"{"message":{"content":"A cat. Step 2\nIs it asleep?"}}"#)
            .create_async()
            .await;
        let _streamed = server
            .mock("POST", "/api/generate")
            .match_body(Matcher::PartialJson(json!({ "stream": true })))
            .with_status(200)
            .with_body(
                [
                    r#"{"message":{"content":"A cat. "}}"#,
                    r#"{"message":{"content":"Step 2\nIs it"}}"#,
                    r#"{"message":{"content":" asleep?"},"done":true}"#,
                ]
                .join("\n"),
            )
            .create_async()
            .await;

        let upstream = client(&server);
        let buffered = upstream
            .call_buffered(InferenceRequest::new("m", "p", 8))
            .await
            .unwrap();
        let streamed = upstream
            .call_streamed(InferenceRequest::new("m", "p", 8))
            .await
            .unwrap();

        assert_eq!(streamed.chunks.concat(), crate::extract::extract_text(&buffered));
        assert_eq!(streamed.final_text, crate::extract::extract_text(&buffered));
    }

    #[tokio::test]
    async fn attachment_is_sent_as_multipart() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/generate")
            .match_header("content-type", Matcher::Regex("^multipart/form-data".to_string()))
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#"name="payload""#.to_string()),
                Matcher::Regex(r#"name="file"; filename="cat.png""#.to_string()),
                Matcher::Regex(r#""stream":false"#.to_string()),
            ]))
            .with_status(200)
            .with_body(r#"{"response":"ok"}"#)
            .create_async()
            .await;

        let mut request = InferenceRequest::new("m", "p", 8);
        request.attachment = Some(ImageUpload::new(
            "cat.png",
            Some("image/png".to_string()),
            b"png-bytes".to_vec(),
        ));
        let body = client(&server).call_buffered(request).await.unwrap();

        assert_eq!(body, json!({ "response": "ok" }));
        mock.assert_async().await;
    }
}
