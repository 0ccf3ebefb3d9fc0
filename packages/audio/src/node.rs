//! N-API surface for the Electron front end
//!
//! The host owns the song library; it mirrors songs and the queue into the
//! engine's in-memory store and calls `poll` from its UI loop. Engine events
//! are forwarded to a JavaScript callback through a threadsafe function.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait};
use napi::bindgen_prelude::*;
use napi::threadsafe_function::ThreadsafeFunctionCallMode;
use napi_derive::napi;

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineSnapshot};
use crate::error::{Alert, EngineError};
use crate::events::{EngineEvent, Subscription};
use crate::fs::LocalFileSystem;
use crate::microphone::{CpalInputBackend, MicrophoneState, MicrophoneStatus};
use crate::output;
use crate::store::{MemorySongStore, Song};
use crate::transport::PlaybackState;

fn map_err<E: ToString>(err: E) -> Error {
  Error::from_reason(err.to_string())
}

fn to_napi(err: EngineError) -> Error {
  map_err(err)
}

/// Returns the crate version so JS can verify the native module loaded correctly.
#[napi]
pub fn addon_version() -> String {
  env!("CARGO_PKG_VERSION").to_string()
}

#[napi(object)]
pub struct AudioDeviceInfo {
  pub id: String,
  pub name: String,
  pub max_output_channels: u32,
  pub is_default: bool,
}

#[napi]
pub fn list_output_devices() -> Result<Vec<AudioDeviceInfo>> {
  let devices = output::list_output_devices().map_err(to_napi)?;
  Ok(
    devices
      .into_iter()
      .map(|d| AudioDeviceInfo {
        id: d.id,
        name: d.name,
        max_output_channels: d.max_channels as u32,
        is_default: d.is_default,
      })
      .collect(),
  )
}

#[napi(object)]
pub struct InputDeviceInfo {
  pub id: String,
  pub name: String,
  pub is_default: bool,
  pub default_sample_rate: Option<f64>,
}

#[napi(object)]
#[derive(Clone)]
pub struct SongJs {
  pub id: String,
  pub name: Option<String>,
  pub artist: Option<String>,
  pub song_path: String,
  pub vocals_path: Option<String>,
  pub accompaniment_path: Option<String>,
  pub lyrics_path: Option<String>,
  pub graph_path: Option<String>,
}

impl From<SongJs> for Song {
  fn from(song: SongJs) -> Self {
    Song {
      id: song.id,
      name: song.name.unwrap_or_default(),
      artist: song.artist.unwrap_or_default(),
      song_path: song.song_path,
      vocals_path: song.vocals_path,
      accompaniment_path: song.accompaniment_path,
      lyrics_path: song.lyrics_path,
      graph_path: song.graph_path,
    }
  }
}

impl From<Song> for SongJs {
  fn from(song: Song) -> Self {
    SongJs {
      id: song.id,
      name: Some(song.name),
      artist: Some(song.artist),
      song_path: song.song_path,
      vocals_path: song.vocals_path,
      accompaniment_path: song.accompaniment_path,
      lyrics_path: song.lyrics_path,
      graph_path: song.graph_path,
    }
  }
}

#[napi(object)]
pub struct PlaybackStateJs {
  pub current_song: Option<SongJs>,
  pub next_song: Option<SongJs>,
  pub current_time: f64,
  pub duration: f64,
  pub playing: bool,
  pub loading: bool,
  pub ended: bool,
}

impl From<PlaybackState> for PlaybackStateJs {
  fn from(state: PlaybackState) -> Self {
    PlaybackStateJs {
      current_song: state.current_song.map(SongJs::from),
      next_song: state.next_song.map(SongJs::from),
      current_time: state.current_time,
      duration: state.duration,
      playing: state.playing,
      loading: state.loading,
      ended: state.ended,
    }
  }
}

#[napi(object)]
pub struct MicrophoneStateJs {
  pub enabled: bool,
  pub noise_suppression: bool,
  pub device_id: String,
  pub volume: f64,
  pub reverb_enabled: bool,
  pub reverb_volume: f64,
  pub reverb_available: bool,
  /// "idle", "requesting", "connected" or "suspended"
  pub status: String,
}

impl From<MicrophoneState> for MicrophoneStateJs {
  fn from(state: MicrophoneState) -> Self {
    let status = match state.status {
      MicrophoneStatus::Idle => "idle",
      MicrophoneStatus::Requesting => "requesting",
      MicrophoneStatus::Connected => "connected",
      MicrophoneStatus::Suspended => "suspended",
    };
    MicrophoneStateJs {
      enabled: state.enabled,
      noise_suppression: state.noise_suppression,
      device_id: state.device_id,
      volume: state.volume,
      reverb_enabled: state.reverb_enabled,
      reverb_volume: state.reverb_volume,
      reverb_available: state.reverb_available,
      status: status.to_string(),
    }
  }
}

#[napi(object)]
pub struct AlertJs {
  /// "info", "success", "warning" or "error"
  pub severity: String,
  pub message: String,
  pub timeout_ms: f64,
}

impl From<Alert> for AlertJs {
  fn from(alert: Alert) -> Self {
    AlertJs {
      severity: alert.severity.as_str().to_string(),
      message: alert.message,
      timeout_ms: alert.timeout.as_millis() as f64,
    }
  }
}

/// Event delivered to the JS callback; `kind` tells which field is set
#[napi(object)]
pub struct EngineEventJs {
  /// "alert", "state", "microphone" or "lyrics"
  pub kind: String,
  pub alert: Option<AlertJs>,
  pub playback: Option<PlaybackStateJs>,
  pub microphone_index: Option<u32>,
  pub microphone: Option<MicrophoneStateJs>,
  pub lyrics_current: Option<String>,
  pub lyrics_next: Option<String>,
}

impl EngineEventJs {
  fn empty(kind: &str) -> Self {
    EngineEventJs {
      kind: kind.to_string(),
      alert: None,
      playback: None,
      microphone_index: None,
      microphone: None,
      lyrics_current: None,
      lyrics_next: None,
    }
  }
}

impl From<&EngineEvent> for EngineEventJs {
  fn from(event: &EngineEvent) -> Self {
    match event {
      EngineEvent::Alert(alert) => EngineEventJs {
        alert: Some(alert.clone().into()),
        ..EngineEventJs::empty("alert")
      },
      EngineEvent::StateChanged(state) => EngineEventJs {
        playback: Some(state.clone().into()),
        ..EngineEventJs::empty("state")
      },
      EngineEvent::MicrophoneChanged { index, state } => EngineEventJs {
        microphone_index: Some(*index as u32),
        microphone: Some(state.clone().into()),
        ..EngineEventJs::empty("microphone")
      },
      EngineEvent::LyricsChanged(lines) => EngineEventJs {
        lyrics_current: Some(lines.current.clone()),
        lyrics_next: Some(lines.next.clone()),
        ..EngineEventJs::empty("lyrics")
      },
    }
  }
}

#[napi(object)]
pub struct EngineStateJs {
  /// "empty", "loading", "paused" or "playing"
  pub transport: String,
  pub playback: PlaybackStateJs,
  pub volume: f64,
  pub pitch: f64,
  pub tempo: f64,
  pub vocals_enabled: bool,
  pub microphones: Vec<MicrophoneStateJs>,
  pub lyrics_current: String,
  pub lyrics_next: String,
  pub lyrics_enabled: bool,
  pub lyrics_offset: f64,
  pub graph_enabled: bool,
}

impl From<EngineSnapshot> for EngineStateJs {
  fn from(snapshot: EngineSnapshot) -> Self {
    use crate::transport::TransportState;
    let transport = match snapshot.transport {
      TransportState::Empty => "empty",
      TransportState::Loading => "loading",
      TransportState::LoadedPaused => "paused",
      TransportState::LoadedPlaying => "playing",
    };
    EngineStateJs {
      transport: transport.to_string(),
      playback: snapshot.playback.into(),
      volume: snapshot.mix.volume,
      pitch: snapshot.mix.pitch,
      tempo: snapshot.mix.tempo,
      vocals_enabled: snapshot.mix.vocals_enabled,
      microphones: snapshot
        .microphones
        .into_iter()
        .map(MicrophoneStateJs::from)
        .collect(),
      lyrics_current: snapshot.lyrics.current,
      lyrics_next: snapshot.lyrics.next,
      lyrics_enabled: snapshot.lyrics_enabled,
      lyrics_offset: snapshot.lyrics_offset,
      graph_enabled: snapshot.graph_enabled,
    }
  }
}

#[napi]
pub struct KaraokeEngine {
  engine: Engine,
  store: Arc<MemorySongStore>,
  _subscription: Subscription,
}

#[napi]
impl KaraokeEngine {
  /// Create the engine; `config_path` points at the YAML settings file
  #[napi(constructor)]
  pub fn new(
    config_path: Option<String>,
    #[napi(ts_arg_type = "(event: EngineEventJs) => void")] event_callback: Function<
      EngineEventJs,
      (),
    >,
  ) -> Result<Self> {
    let config = match config_path {
      Some(path) => EngineConfig::load(Path::new(&path)),
      None => EngineConfig::default(),
    };

    let store = Arc::new(MemorySongStore::new());
    let engine = Engine::new(
      config,
      Arc::new(LocalFileSystem),
      store.clone(),
      Box::new(CpalInputBackend),
    );

    let tsfn = event_callback
      .build_threadsafe_function()
      .callee_handled::<false>()
      .build()?;
    let subscription = engine.subscribe(move |event| {
      tsfn.call(EngineEventJs::from(event), ThreadsafeFunctionCallMode::NonBlocking);
    });

    Ok(Self {
      engine,
      store,
      _subscription: subscription,
    })
  }

  // Library mirror

  #[napi]
  pub fn add_song(&self, song: SongJs) {
    self.store.add_song(song.into());
  }

  #[napi]
  pub fn enqueue(&mut self, song_id: String) {
    self.store.enqueue(song_id);
    self.engine.song_queue_changed();
  }

  #[napi]
  pub fn clear_queue(&mut self) {
    self.store.clear_queue();
    self.engine.song_queue_changed();
  }

  /// A stored song changed, e.g. stems or lyrics were attached
  #[napi]
  pub fn song_updated(&mut self, song: SongJs) {
    let song: Song = song.into();
    self.store.add_song(song.clone());
    self.engine.song_updated(song);
  }

  // Transport

  /// Apply finished background work; call from the UI loop
  #[napi]
  pub fn poll(&mut self) {
    self.engine.poll();
  }

  #[napi]
  pub fn get_state(&self) -> EngineStateJs {
    self.engine.snapshot().into()
  }

  #[napi]
  pub fn play(&mut self) -> Result<()> {
    self.engine.play().map_err(to_napi)
  }

  #[napi]
  pub fn pause(&mut self) -> Result<()> {
    self.engine.pause().map_err(to_napi)
  }

  #[napi]
  pub fn select_song(&mut self, song_id: String) -> Result<()> {
    use crate::store::SongStore;
    let song = self
      .store
      .get_song(&song_id)
      .ok_or_else(|| map_err(format!("unknown song {}", song_id)))?;
    self.engine.select_song(song).map_err(to_napi)
  }

  #[napi]
  pub fn end_song(&mut self) -> Result<()> {
    self.engine.end_song().map_err(to_napi)
  }

  #[napi]
  pub fn seek(&mut self, time_seconds: f64) {
    self.engine.seek(time_seconds);
  }

  // Mix

  #[napi]
  pub fn set_volume(&mut self, volume: f64) {
    self.engine.set_volume(volume);
  }

  #[napi]
  pub fn set_pitch(&mut self, semitones: f64) {
    self.engine.set_pitch(semitones);
  }

  #[napi]
  pub fn set_tempo(&mut self, ratio: f64) {
    self.engine.set_tempo(ratio);
  }

  #[napi]
  pub fn toggle_vocals(&mut self) -> Result<()> {
    self.engine.toggle_vocals().map_err(to_napi)
  }

  #[napi]
  pub fn set_graph_enabled(&mut self, enabled: bool) -> Result<()> {
    self.engine.set_graph_enabled(enabled).map_err(to_napi)
  }

  // Lyrics

  #[napi]
  pub fn set_lyrics_enabled(&mut self, enabled: bool) -> Result<()> {
    self.engine.set_lyrics_enabled(enabled).map_err(to_napi)
  }

  /// Shift the lyrics offset by `delta` seconds, snapped to tenths
  #[napi]
  pub fn adjust_lyrics_offset(&mut self, delta: f64) {
    self.engine.adjust_lyrics_offset(delta);
  }

  #[napi]
  pub fn step_lyrics_offset(&mut self, up: bool) {
    self.engine.step_lyrics_offset(up);
  }

  #[napi]
  pub fn set_lyrics_offset(&mut self, seconds: f64) {
    self.engine.set_lyrics_offset(seconds);
  }

  #[napi]
  pub fn save_lyrics_offset(&mut self) -> Result<()> {
    self.engine.save_lyrics_offset().map_err(to_napi)
  }

  // Microphones

  #[napi]
  pub fn set_microphone_enabled(&mut self, index: u32, enabled: bool) -> Result<()> {
    self
      .engine
      .set_microphone_enabled(index as usize, enabled)
      .map_err(to_napi)
  }

  #[napi]
  pub fn suspend_microphone(&mut self, index: u32) -> Result<()> {
    self.engine.suspend_microphone(index as usize).map_err(to_napi)
  }

  #[napi]
  pub fn resume_microphone(&mut self, index: u32) -> Result<()> {
    self.engine.resume_microphone(index as usize).map_err(to_napi)
  }

  #[napi]
  pub fn set_microphone_device(&mut self, index: u32, device_id: String) -> Result<()> {
    self
      .engine
      .set_microphone_device(index as usize, &device_id)
      .map_err(to_napi)
  }

  #[napi]
  pub fn set_noise_suppression(&mut self, index: u32, enabled: bool) -> Result<()> {
    self
      .engine
      .set_noise_suppression(index as usize, enabled)
      .map_err(to_napi)
  }

  #[napi]
  pub fn set_microphone_volume(&mut self, index: u32, volume: f64) -> Result<()> {
    self
      .engine
      .set_microphone_volume(index as usize, volume)
      .map_err(to_napi)
  }

  #[napi]
  pub fn set_reverb_enabled(&mut self, index: u32, enabled: bool) -> Result<()> {
    self
      .engine
      .set_reverb_enabled(index as usize, enabled)
      .map_err(to_napi)
  }

  #[napi]
  pub fn set_reverb_volume(&mut self, index: u32, volume: f64) -> Result<()> {
    self
      .engine
      .set_reverb_volume(index as usize, volume)
      .map_err(to_napi)
  }

  #[napi]
  pub fn restore_microphone_defaults(&mut self) -> Result<()> {
    self.engine.restore_microphone_defaults().map_err(to_napi)
  }

  #[napi]
  pub fn list_input_devices(&mut self) -> Result<Vec<InputDeviceInfo>> {
    let devices = self.engine.refresh_devices().map_err(to_napi)?;

    // Sample rates are informational only
    let host = cpal::default_host();
    let rates: Vec<(String, f64)> = host
      .input_devices()
      .map(|devices| {
        devices
          .filter_map(|d| {
            let name = d.name().ok()?;
            let rate = d.default_input_config().ok()?.sample_rate().0 as f64;
            Some((name, rate))
          })
          .collect()
      })
      .unwrap_or_default();

    Ok(
      devices
        .into_iter()
        .map(|d| InputDeviceInfo {
          default_sample_rate: rates.iter().find(|(n, _)| *n == d.id).map(|(_, r)| *r),
          id: d.id,
          name: d.name,
          is_default: d.is_default,
        })
        .collect(),
    )
  }

  // Output

  /// Start output on `device_id`, or move the running output to it
  #[napi]
  pub fn configure_output(&mut self, device_id: Option<String>) -> Result<()> {
    self
      .engine
      .start_output(device_id.as_deref())
      .map_err(to_napi)
  }

  #[napi]
  pub fn close(&mut self) {
    self.engine.stop_output();
  }

  /// Block until pending loads finish; returns false on timeout
  #[napi]
  pub fn wait_for_completion(&mut self, timeout_ms: u32) -> bool {
    self
      .engine
      .wait_for_completion(Duration::from_millis(timeout_ms as u64))
  }
}
