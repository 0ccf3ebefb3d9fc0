#![deny(clippy::all)]

//! Audio engine for the karaoke player
//!
//! One song source (time-stretched, pitch-shifted), two microphone chains
//! with noise suppression and convolution reverb, synchronized lyrics and a
//! queue-driven transport. `Engine` is the entry point; the `node` feature
//! exposes it to the Electron front end.

pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod events;
pub mod fs;
pub mod graph;
pub mod loader;
pub mod lyrics;
pub mod microphone;
pub mod noise;
pub mod output;
pub mod reverb;
pub mod stems;
pub mod store;
pub mod time_stretch;
pub mod transport;

#[cfg(feature = "node")]
mod node;

#[cfg(test)]
mod testing;

pub use config::{EngineConfig, Settings};
pub use engine::{Engine, EngineSnapshot, MixParameters};
pub use error::{Alert, EngineError, Severity};
pub use events::{EngineEvent, Subscription};
pub use fs::{FileSystem, LocalFileSystem};
pub use lyrics::{LyricsDocument, LyricsLines};
pub use microphone::{CpalInputBackend, InputBackend, MicrophoneState, MicrophoneStatus};
pub use store::{MemorySongStore, Song, SongStore};
pub use transport::{PlaybackState, TransportState};
