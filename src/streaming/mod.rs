//! Streaming plumbing between provider adapters and the backend
//!
//! # Architecture
//!
//! ```text
//! WebSocket / chunked HTTP ──▶ Transport (RawFrame) ──▶ StreamDecoder
//!                                                           │
//!                                                           ▼
//!                                              StreamEvent (typed)
//!                                                           │
//!                                                           ▼
//!                                         ProviderEventSink ──▶ state machine
//! ```
//!
//! Frame ordering is causal per connection. Nothing is replayed across
//! reconnects: a dropped connection ends the provider handle.

mod decoder;
mod protocol;
mod transport;

pub use decoder::{rms_level, DecodeError, DecodedFrame, StreamDecoder, StreamEvent};
pub use protocol::{
    decode_pcm16, encode_pcm16, frame_type, pcm16_from_bytes, ChatRequest, ClientMessage,
    FrameEnvelope, REALTIME_SAMPLE_RATE,
};
pub use transport::{
    FrameReader, LineFramer, RawFrame, RetryPolicy, TransportError, WsTransport, MAX_LINE_BYTES,
};
