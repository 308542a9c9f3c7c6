//! # Audio Module
//!
//! Real-time voice playback core for the assistant bot.
//!
//! Producers (TTS, notification sounds) hand over raw PCM chunks of any size;
//! this module turns them into a continuous stream of fixed 20ms frames per
//! guild and keeps that stream alive across player errors.
//!
//! ## Architecture
//!
//! ### [`frame`] - Frame Buffer
//! - Fixed frame geometry ([`frame::FrameSpec`], 1920 bytes for 48kHz mono)
//! - Residual bytes between chunks, silence padding on flush
//!
//! ### [`encoder`] - Frame Encoders
//! - Opus via `audiopus`, f32 for songbird's raw adapter, raw passthrough
//!
//! ### [`resample`] - Input Adaptation
//! - `rubato` resampling when producers deliver a different sample rate
//!
//! ### [`pipeline`] - Frame Pipeline
//! - One per session: buffer, encoder and a bounded output stream
//! - Backpressure suspends writers until the player drains frames
//!
//! ### [`registry`] - Playback Registry
//! - Per-guild FIFO queue with a single drain loop
//! - Recovery after player errors, idle resumption, cleanup
//!
//! ## Audio Format
//!
//! - **Input**: 16-bit signed little-endian PCM, mono
//! - **Frames**: 20ms at 48kHz (960 samples)
//! - **Output**: configurable [`encoder::StreamCodec`]

pub mod encoder;
pub mod frame;
pub mod pipeline;
pub mod registry;
pub mod resample;
