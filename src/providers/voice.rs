//! Realtime voice provider over the backend WebSocket
//!
//! # Architecture
//!
//! ```text
//! AudioInput ──▶ pump task ──▶ decimate ──▶ chunk (100ms) ──▶ audio_append ──▶ WS
//!
//! WS ──▶ reader task ──▶ StreamDecoder ──┬──▶ ProviderEventSink (tokens, transcripts)
//!                                       └──▶ AudioOutput (assistant speech)
//! ```
//!
//! One adapter instance owns one connection and one microphone capture.
//! `stop` tears down both; a switch builds a fresh adapter.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use super::audio::{AudioCapture, AudioChunker, Decimator, AudioInput, AudioOutput};
use super::{Capabilities, ProviderAdapter, ProviderEventSink, StreamContext};
use crate::error::ProviderError;
use crate::streaming::{
    ClientMessage, DecodedFrame, FrameReader, RawFrame, RetryPolicy, StreamDecoder, StreamEvent,
    WsTransport, REALTIME_SAMPLE_RATE,
};

/// How long the backend gets to acknowledge `session_start`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the goodbye sent during `stop`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Chunk duration for outgoing audio.
const CHUNK_MS: u32 = 100;

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// WebSocket URL of the realtime endpoint.
    pub url: String,
    pub model: String,
    pub voice: String,
    pub token: Option<String>,
    /// Rate of the frames the host pushes into [`AudioInput`].
    pub input_sample_rate: u32,
    pub retry: RetryPolicy,
}

type SharedTransport = Arc<Mutex<WsTransport>>;

pub struct RealtimeVoiceAdapter {
    config: VoiceConfig,
    input: Arc<dyn AudioInput>,
    output: Arc<dyn AudioOutput>,
    transport: Option<SharedTransport>,
    reader: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    muted: Arc<AtomicBool>,
    ready: bool,
}

impl RealtimeVoiceAdapter {
    pub fn new(config: VoiceConfig, input: Arc<dyn AudioInput>, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            config,
            input,
            output,
            transport: None,
            reader: None,
            pump: None,
            muted: Arc::new(AtomicBool::new(false)),
            ready: false,
        }
    }

    /// Wait for `session_ready`. An `error` frame before it fails the start.
    async fn await_ready(transport: &mut WsTransport) -> Result<(), ProviderError> {
        let mut decoder = StreamDecoder::new();
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = match timeout(remaining, transport.recv()).await {
                Err(_) => {
                    return Err(ProviderError::connection_lost(
                        "timed out waiting for session_ready",
                    ))
                }
                Ok(None) => {
                    return Err(ProviderError::connection_lost(
                        "connection closed during handshake",
                    ))
                }
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(frame))) => frame,
            };

            match decoder.decode(&frame) {
                Ok(DecodedFrame::SessionReady { session_id }) => {
                    log::info!(
                        "VoiceAdapter: session ready (backend id: {})",
                        session_id.as_deref().unwrap_or("-")
                    );
                    return Ok(());
                }
                Ok(DecodedFrame::Event(StreamEvent::ProviderError(err))) => return Err(err),
                Ok(other) => log::debug!("VoiceAdapter: frame before ready: {:?}", other),
                Err(e) => log::warn!("VoiceAdapter: undecodable frame during handshake: {}", e),
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for RealtimeVoiceAdapter {
    fn name(&self) -> &str {
        "realtime-voice"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            send: false,
            mute: true,
        }
    }

    async fn start_stream(&mut self, ctx: StreamContext) -> Result<(), ProviderError> {
        log::info!(
            "VoiceAdapter: starting {} for session {} ({} prior turns)",
            self.config.model,
            ctx.session_id,
            ctx.history.len()
        );

        let transport = WsTransport::connect(
            &self.config.url,
            self.config.token.as_deref(),
            self.config.retry,
        )
        .await?;
        let transport = Arc::new(Mutex::new(transport));
        // Stored before the handshake so a failed or cancelled start still closes it.
        self.transport = Some(Arc::clone(&transport));

        let reader = {
            let mut ws = transport.lock().await;
            ws.send_json(&ClientMessage::session_start(
                ctx.session_id,
                self.config.model.clone(),
                self.config.voice.clone(),
                ctx.history,
            ))
            .await?;
            Self::await_ready(&mut ws).await?;
            ws.take_reader()
                .ok_or_else(|| ProviderError::connection_lost("reader already taken"))?
        };
        self.ready = true;

        let capture = self
            .input
            .open()
            .map_err(|e| ProviderError::rejected(format!("microphone unavailable: {}", e)))?;

        self.reader = Some(tokio::spawn(read_frames(
            reader,
            ctx.events.clone(),
            Arc::clone(&self.output),
        )));
        self.pump = Some(tokio::spawn(pump_audio(
            capture,
            transport,
            ctx.events,
            Arc::clone(&self.muted),
            self.config.input_sample_rate,
        )));

        Ok(())
    }

    async fn set_muted(&mut self, muted: bool) -> Result<(), ProviderError> {
        let Some(transport) = self.transport.as_ref() else {
            return Err(ProviderError::connection_lost("voice provider is not started"));
        };
        self.muted.store(muted, Ordering::SeqCst);
        transport
            .lock()
            .await
            .send_json(&ClientMessage::InputMute { muted })
            .await?;
        log::info!("VoiceAdapter: input {}", if muted { "muted" } else { "unmuted" });
        Ok(())
    }

    async fn stop(&mut self) {
        // The pump owns the capture; awaiting the aborted task releases it.
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }

        if let Some(transport) = self.transport.take() {
            let mut ws = transport.lock().await;
            if self.ready {
                match timeout(CLOSE_TIMEOUT, ws.send_json(&ClientMessage::SessionStop)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::debug!("VoiceAdapter: session_stop not sent: {}", e),
                    Err(_) => log::debug!("VoiceAdapter: session_stop timed out"),
                }
            }
            let _ = timeout(CLOSE_TIMEOUT, ws.close()).await;
            log::info!("VoiceAdapter: connection closed");
        }

        self.ready = false;
        self.output.flush();
    }
}

impl Drop for RealtimeVoiceAdapter {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_frames(mut reader: FrameReader, sink: ProviderEventSink, output: Arc<dyn AudioOutput>) {
    let mut decoder = StreamDecoder::new();

    loop {
        let frame: RawFrame = match reader.next_frame().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                log::error!("VoiceAdapter: connection error: {}", e);
                sink.error(e.into()).await;
                return;
            }
            None => {
                log::warn!("VoiceAdapter: backend closed the connection");
                sink.error(ProviderError::connection_lost("realtime connection closed"))
                    .await;
                return;
            }
        };

        let alive = match decoder.decode(&frame) {
            Ok(DecodedFrame::Event(event)) => {
                let failed = matches!(event, StreamEvent::ProviderError(_));
                sink.emit(event).await && !failed
            }
            Ok(DecodedFrame::Audio { samples, level }) => {
                output.play(&samples, REALTIME_SAMPLE_RATE);
                sink.emit(StreamEvent::AudioLevel(level)).await
            }
            Ok(DecodedFrame::SessionReady { .. }) | Ok(DecodedFrame::Ignored) => true,
            Err(e) => {
                log::warn!("VoiceAdapter: skipping undecodable frame: {}", e);
                true
            }
        };

        if !alive {
            let (decoded, ignored) = decoder.counts();
            log::debug!(
                "VoiceAdapter: reader done ({} frames, {} ignored)",
                decoded,
                ignored
            );
            return;
        }
    }
}

async fn pump_audio(
    mut capture: AudioCapture,
    transport: SharedTransport,
    sink: ProviderEventSink,
    muted: Arc<AtomicBool>,
    input_rate: u32,
) {
    let mut decimator = Decimator::new(input_rate, REALTIME_SAMPLE_RATE);
    let mut chunker = AudioChunker::new(REALTIME_SAMPLE_RATE, CHUNK_MS);
    let mut chunks_sent: u64 = 0;

    while let Some(frame) = capture.recv().await {
        if muted.load(Ordering::SeqCst) {
            decimator.reset();
            chunker.clear();
            continue;
        }

        let samples = decimator.push(&frame);
        for chunk in chunker.push(&samples) {
            let result = transport
                .lock()
                .await
                .send_json(&ClientMessage::audio_append(&chunk))
                .await;
            if let Err(e) = result {
                log::error!("VoiceAdapter: failed to send audio: {}", e);
                sink.error(e.into()).await;
                return;
            }
            chunks_sent += 1;
            if chunks_sent % 50 == 0 {
                log::debug!("VoiceAdapter: sent {} audio chunks", chunks_sent);
            }
        }
    }

    log::warn!("VoiceAdapter: microphone capture ended");
    sink.error(ProviderError::connection_lost("microphone capture ended"))
        .await;
}
