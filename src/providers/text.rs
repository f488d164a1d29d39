//! Text completion provider: one POST per user message, reply streamed back
//! as a chunked body with one frame per line.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::AUTHORIZATION;
use tokio::task::JoinHandle;

use super::{Capabilities, ProviderAdapter, ProviderEventSink, SendRequest, StreamContext};
use crate::credentials::bearer;
use crate::error::ProviderError;
use crate::http::{api_error_message, http_client};
use crate::session::{Role, SessionId, TurnRecord};
use crate::streaming::{ChatRequest, DecodedFrame, LineFramer, RawFrame, StreamDecoder, StreamEvent};

#[derive(Debug, Clone)]
pub struct TextConfig {
    /// Full URL of the streaming chat endpoint.
    pub url: String,
    pub model: String,
    pub token: Option<String>,
}

pub struct TextCompletionAdapter {
    config: TextConfig,
    live: Option<(SessionId, ProviderEventSink)>,
    request: Option<JoinHandle<()>>,
}

impl TextCompletionAdapter {
    pub fn new(config: TextConfig) -> Self {
        Self {
            config,
            live: None,
            request: None,
        }
    }

    fn abort_request(&mut self) {
        if let Some(task) = self.request.take() {
            if !task.is_finished() {
                log::debug!("TextAdapter: aborting in-flight request");
            }
            task.abort();
        }
    }
}

#[async_trait]
impl ProviderAdapter for TextCompletionAdapter {
    fn name(&self) -> &str {
        "text-completion"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            send: true,
            mute: false,
        }
    }

    /// Nothing to connect: requests are one-shot. The handle is just the sink.
    async fn start_stream(&mut self, ctx: StreamContext) -> Result<(), ProviderError> {
        if self.config.url.trim().is_empty() {
            return Err(ProviderError::rejected("chat endpoint is not configured"));
        }
        log::info!(
            "TextAdapter: ready for session {} (model {}, {} prior turns)",
            ctx.session_id,
            self.config.model,
            ctx.history.len()
        );
        self.live = Some((ctx.session_id, ctx.events));
        Ok(())
    }

    async fn send(&mut self, request: SendRequest) -> Result<(), ProviderError> {
        let Some((session_id, sink)) = self.live.clone() else {
            return Err(ProviderError::connection_lost("text provider is not started"));
        };
        self.abort_request();

        let mut messages = request.history;
        messages.push(TurnRecord {
            role: Role::User,
            content: request.text,
        });
        let body = ChatRequest {
            session_id,
            model: self.config.model.clone(),
            messages,
            stream: true,
        };

        let config = self.config.clone();
        self.request = Some(tokio::spawn(stream_reply(config, body, sink)));
        Ok(())
    }

    async fn stop(&mut self) {
        self.abort_request();
        if self.live.take().is_some() {
            log::info!("TextAdapter: stopped");
        }
    }
}

impl Drop for TextCompletionAdapter {
    fn drop(&mut self) {
        self.abort_request();
    }
}

enum Flow {
    Continue,
    Done,
}

async fn stream_reply(config: TextConfig, body: ChatRequest, sink: ProviderEventSink) {
    log::debug!(
        "TextAdapter: POST {} ({} messages)",
        config.url,
        body.messages.len()
    );

    let mut request = http_client().post(&config.url).json(&body);
    if let Some(token) = &config.token {
        request = request.header(AUTHORIZATION, bearer(token));
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            sink.error(ProviderError::connection_lost(format!("request failed: {}", e)))
                .await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let message = format!("HTTP {}: {}", status.as_u16(), api_error_message(&text));
        log::error!("TextAdapter: backend error {}", message);
        let error = if status.is_client_error() && status.as_u16() != 408 {
            ProviderError::rejected(message)
        } else {
            ProviderError::connection_lost(message)
        };
        sink.error(error).await;
        return;
    }

    let mut stream = response.bytes_stream();
    let mut framer = LineFramer::new();
    let mut decoder = StreamDecoder::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                sink.error(ProviderError::connection_lost(format!("stream interrupted: {}", e)))
                    .await;
                return;
            }
        };
        let frames = match framer.push(&chunk) {
            Ok(frames) => frames,
            Err(e) => {
                log::error!("TextAdapter: {}", e);
                sink.error(e.into()).await;
                return;
            }
        };
        for frame in frames {
            if let Flow::Done = forward(&mut decoder, &frame, &sink).await {
                return;
            }
        }
    }

    if let Some(frame) = framer.finish() {
        if let Flow::Done = forward(&mut decoder, &frame, &sink).await {
            return;
        }
    }

    let (decoded, ignored) = decoder.counts();
    log::warn!(
        "TextAdapter: body ended without turn_complete ({} frames, {} ignored)",
        decoded,
        ignored
    );
    sink.error(ProviderError::connection_lost(
        "stream ended before the turn completed",
    ))
    .await;
}

async fn forward(decoder: &mut StreamDecoder, frame: &RawFrame, sink: &ProviderEventSink) -> Flow {
    match decoder.decode(frame) {
        Ok(DecodedFrame::Event(event)) => {
            let terminal = matches!(
                event,
                StreamEvent::TurnComplete | StreamEvent::ProviderError(_)
            );
            if !sink.emit(event).await || terminal {
                Flow::Done
            } else {
                Flow::Continue
            }
        }
        Ok(DecodedFrame::Audio { .. }) => {
            log::debug!("TextAdapter: ignoring audio frame");
            Flow::Continue
        }
        Ok(_) => Flow::Continue,
        Err(e) => {
            log::warn!("TextAdapter: skipping undecodable frame: {}", e);
            Flow::Continue
        }
    }
}
