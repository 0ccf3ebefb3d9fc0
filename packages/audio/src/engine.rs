//! Karaoke engine
//!
//! The single context object the UI drives. All commands run on the owning
//! thread and mutate state synchronously; slow work (decoding, lyrics file
//! I/O) is handed to the asset worker and applied in `poll`. `MixParameters`
//! is authoritative: node parameters are re-derived from it whenever a
//! source is rebuilt.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{EngineConfig, Settings};
use crate::decoder::{AssetLoader, DecodedBuffer};
use crate::error::{Alert, EngineError, Result};
use crate::events::{EngineEvent, EventBus, Subscription};
use crate::fs::FileSystem;
use crate::graph::{Edge, MixGraph, MIC_CHANNELS};
use crate::loader::{AssetWorker, Job, JobDone, JobOutput, Target};
use crate::lyrics::{LyricsDocument, LyricsLines, LyricsSynchronizer, OFFSET_STEP};
use crate::microphone::{
  CaptureConstraints, Completion, InputBackend, InputDevice, MicrophoneChannel, MicrophoneState,
  DEFAULT_DEVICE_ID,
};
use crate::output::AudioOutput;
use crate::stems::{select_active_stem, validate_vocals_toggle, Stem};
use crate::store::{Song, SongStore};
use crate::time_stretch::{TimeStretchSource, MAX_TEMPO, MIN_TEMPO};
use crate::transport::{Command, PlaybackState, Transport, TransportState};

pub const DEFAULT_VOLUME: f64 = 70.0;

#[derive(Clone, Debug, PartialEq)]
pub struct MixParameters {
  /// 0-100
  pub volume: f64,
  /// Semitones
  pub pitch: f64,
  /// Playback rate, 1.0 is original speed
  pub tempo: f64,
  pub vocals_enabled: bool,
}

impl Default for MixParameters {
  fn default() -> Self {
    Self {
      volume: DEFAULT_VOLUME,
      pitch: 0.0,
      tempo: 1.0,
      vocals_enabled: true,
    }
  }
}

/// Everything the UI renders, captured at one instant
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSnapshot {
  pub transport: TransportState,
  pub playback: PlaybackState,
  pub mix: MixParameters,
  pub microphones: Vec<MicrophoneState>,
  pub lyrics: LyricsLines,
  pub lyrics_enabled: bool,
  pub lyrics_offset: f64,
  pub graph_enabled: bool,
}

/// Why the latest song decode was requested, and which stem it decodes
#[derive(Clone, Copy, Debug, PartialEq)]
enum SongLoad {
  /// Queue transition; completion feeds the transport
  Transition { stem: Stem },
  /// Stem change on the loaded song; the old source keeps playing until swapped
  StemSwap { stem: Stem },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ImpulseState {
  NotLoaded,
  Loading,
  Loaded,
}

pub struct Engine {
  config: EngineConfig,
  fs: Arc<dyn FileSystem>,
  store: Arc<dyn SongStore>,
  input_backend: Box<dyn InputBackend>,
  loader: AssetLoader,
  worker: AssetWorker,
  graph: MixGraph,
  transport: Transport,
  mix: MixParameters,
  microphones: Vec<MicrophoneChannel>,
  lyrics: LyricsSynchronizer,
  graph_enabled: bool,
  song_load: SongLoad,
  /// Stem of the source installed in the graph
  live_stem: Option<Stem>,
  impulse: ImpulseState,
  /// Offset written by the in-flight lyrics save
  saving_offset: Option<f64>,
  last_lyrics: LyricsLines,
  events: EventBus,
  output: Option<AudioOutput>,
}

impl Engine {
  pub fn new(
    config: EngineConfig,
    fs: Arc<dyn FileSystem>,
    store: Arc<dyn SongStore>,
    input_backend: Box<dyn InputBackend>,
  ) -> Self {
    let config = config.sanitized();
    let loader = AssetLoader::new(Arc::clone(&fs), config.sample_rate);
    let worker = AssetWorker::spawn(loader.clone(), Arc::clone(&fs));
    let graph = MixGraph::new(config.sample_rate, config.audio_buffer_size());
    graph.set_volume(DEFAULT_VOLUME);

    let mut engine = Self {
      config,
      fs,
      store,
      input_backend,
      loader,
      worker,
      graph,
      transport: Transport::new(),
      mix: MixParameters::default(),
      microphones: (0..MIC_CHANNELS).map(MicrophoneChannel::new).collect(),
      lyrics: LyricsSynchronizer::new(),
      graph_enabled: false,
      song_load: SongLoad::Transition {
        stem: Stem::FullMix,
      },
      live_stem: None,
      impulse: ImpulseState::NotLoaded,
      saving_offset: None,
      last_lyrics: LyricsLines::default(),
      events: EventBus::new(),
      output: None,
    };
    engine.preload_impulse();
    engine.transport.refresh_next(engine.store.as_ref());
    engine
  }

  // ---- events and state --------------------------------------------------

  pub fn subscribe(&self, listener: impl FnMut(&EngineEvent) + Send + 'static) -> Subscription {
    self.events.subscribe(listener)
  }

  pub fn graph(&self) -> &MixGraph {
    &self.graph
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn transport_state(&self) -> TransportState {
    self.transport.state()
  }

  pub fn playback(&self) -> PlaybackState {
    let mut playback = self.transport.playback().clone();
    if self.transport.is_loaded() {
      playback.current_time = self.graph.current_time();
    }
    playback
  }

  pub fn mix_parameters(&self) -> &MixParameters {
    &self.mix
  }

  pub fn microphone(&self, index: usize) -> Option<&MicrophoneState> {
    self.microphones.get(index).map(|m| m.state())
  }

  pub fn lyrics_enabled(&self) -> bool {
    self.lyrics.is_enabled()
  }

  pub fn lyrics_offset(&self) -> f64 {
    self.lyrics.offset()
  }

  pub fn lyrics_document(&self) -> Option<&LyricsDocument> {
    self.lyrics.document()
  }

  pub fn graph_enabled(&self) -> bool {
    self.graph_enabled
  }

  /// Active and next lyric line at the current playback time
  pub fn lyrics_lines(&self) -> LyricsLines {
    self.lyrics.lines_at(self.playback().current_time)
  }

  pub fn snapshot(&self) -> EngineSnapshot {
    EngineSnapshot {
      transport: self.transport.state(),
      playback: self.playback(),
      mix: self.mix.clone(),
      microphones: self.microphones.iter().map(|m| m.state().clone()).collect(),
      lyrics: self.lyrics_lines(),
      lyrics_enabled: self.lyrics.is_enabled(),
      lyrics_offset: self.lyrics.offset(),
      graph_enabled: self.graph_enabled,
    }
  }

  fn alert_timeout(&self) -> Duration {
    self.config.error_message_timeout()
  }

  /// Report `err` as an alert and hand it back to the caller
  fn fail<T>(&self, err: EngineError) -> Result<T> {
    log::debug!("[Engine] {}", err);
    self
      .events
      .emit(EngineEvent::Alert(Alert::from_error(&err, self.alert_timeout())));
    Err(err)
  }

  fn report(&self, err: EngineError) {
    let _ = self.fail::<()>(err);
  }

  fn emit_state(&self) {
    self.events.emit(EngineEvent::StateChanged(self.playback()));
  }

  fn emit_microphone(&self, index: usize) {
    if let Some(channel) = self.microphones.get(index) {
      self.events.emit(EngineEvent::MicrophoneChanged {
        index,
        state: channel.state().clone(),
      });
    }
  }

  fn emit_lyrics_if_changed(&mut self) {
    let lines = self.lyrics_lines();
    if lines != self.last_lyrics {
      self.last_lyrics = lines.clone();
      self.events.emit(EngineEvent::LyricsChanged(lines));
    }
  }

  // ---- asynchronous completions ------------------------------------------

  /// Apply finished background work and react to the end of the song
  pub fn poll(&mut self) {
    for done in self.worker.drain() {
      self.handle_completion(done);
    }

    if self.graph.take_ended() && self.transport.state() == TransportState::LoadedPlaying {
      log::info!("[Engine] Song ended");
      // Failures are already reported as alerts
      let _ = self.run_end_song();
    }

    if self.transport.is_loaded() {
      self.transport.set_current_time(self.graph.current_time());
    }
    self.emit_lyrics_if_changed();
  }

  /// Block until every outstanding job is applied or `timeout` elapses
  pub fn wait_for_completion(&mut self, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while self.worker.in_flight() > 0 {
      let remaining = deadline.saturating_duration_since(std::time::Instant::now());
      if remaining.is_zero() {
        return false;
      }
      if let Some(done) = self.worker.wait(remaining) {
        self.handle_completion(done);
      }
    }
    self.poll();
    true
  }

  fn handle_completion(&mut self, done: JobDone) {
    match done.output {
      JobOutput::Song(result) => self.apply_song(result),
      JobOutput::Impulse(result) => self.apply_impulse(&done.path, result),
      JobOutput::Lyrics(result) => match result {
        Ok(text) => {
          let document = LyricsDocument::parse(&text);
          log::info!(
            "[Engine] Loaded {} lyric lines from {}",
            document.lines().len(),
            done.path
          );
          self.lyrics.load(document);
          self.emit_lyrics_if_changed();
        }
        Err(e) => self.report(e),
      },
      JobOutput::LyricsSaved(result) => {
        let saved = self.saving_offset.take().unwrap_or(0.0);
        match result {
          Ok(()) => {
            if let Some(document) = self.lyrics.document_mut() {
              document.rebase_offset(saved);
            }
            self.events.emit(EngineEvent::Alert(Alert::success(
              "Successfully updated lyrics file",
              self.alert_timeout(),
            )));
            self.emit_lyrics_if_changed();
          }
          Err(e) => self.report(e),
        }
      }
    }
  }

  fn apply_song(&mut self, result: Result<DecodedBuffer>) {
    let source = result.and_then(TimeStretchSource::new);

    match (self.song_load, source) {
      (SongLoad::Transition { stem }, Ok(mut source)) => {
        source.set_pitch(self.mix.pitch);
        source.set_tempo(self.mix.tempo);
        let duration = source.duration();
        self.graph.set_source(Some(source));
        self.live_stem = Some(stem);

        if self.transport.load_succeeded(duration) {
          self.graph.connect(Edge::Song);
        } else {
          self.graph.disconnect(Edge::Song);
        }
        log::info!("[Engine] Song ready ({:.1}s)", duration);
        self.emit_state();
      }
      (SongLoad::Transition { .. }, Err(e)) => {
        self.graph.disconnect(Edge::Song);
        self.graph.set_source(None);
        self.live_stem = None;
        self.discard_lyrics();
        self.transport.load_failed();
        self.transport.refresh_next(self.store.as_ref());
        self.report(e);
        self.emit_state();
      }
      (SongLoad::StemSwap { stem }, Ok(mut source)) => {
        source.set_pitch(self.mix.pitch);
        source.set_tempo(self.mix.tempo);
        source.seek(self.graph.current_time());
        self.graph.set_source(Some(source));
        self.live_stem = Some(stem);
        log::info!("[Engine] Switched stem (vocals {})", self.mix.vocals_enabled);
        self.emit_state();
      }
      (SongLoad::StemSwap { .. }, Err(e)) => {
        // Back to what is audible, not to the superseded request
        self.mix.vocals_enabled = self.live_stem != Some(Stem::Accompaniment);
        self.report(e);
        self.emit_state();
      }
    }
  }

  fn apply_impulse(&mut self, path: &str, result: Result<DecodedBuffer>) {
    let installed = result.and_then(|buffer| self.graph.install_reverb(&buffer.to_mono()));

    match installed {
      Ok(()) => {
        log::info!("[Engine] Reverb impulse loaded from {}", path);
        self.impulse = ImpulseState::Loaded;
        for index in 0..self.microphones.len() {
          self.microphones[index].set_reverb_available(true);
          self.wire_microphone(index);
          self.emit_microphone(index);
        }
      }
      Err(e) => {
        log::error!("[Engine] Reverb impulse {} unusable: {}", path, e);
        self.impulse = ImpulseState::NotLoaded;
        let mut rolled_back = false;
        for index in 0..self.microphones.len() {
          self.microphones[index].set_reverb_available(false);
          if self.microphones[index].state().reverb_enabled {
            self.microphones[index].set_reverb_enabled(false);
            rolled_back = true;
          }
          self.emit_microphone(index);
        }
        if rolled_back {
          self.report(EngineError::ReverbAssetMissing(path.to_string()));
        }
      }
    }
  }

  fn preload_impulse(&mut self) {
    let path = self.config.reverb_impulse_path.clone();
    if self.fs.file_exists(&path) {
      self.impulse = ImpulseState::Loading;
      self.worker.submit(Job::DecodeImpulse { path });
    } else {
      log::warn!("[Engine] Reverb impulse {} not found, reverb unavailable", path);
    }
  }

  // ---- transport ---------------------------------------------------------

  pub fn play(&mut self) -> Result<()> {
    match self.transport.play(self.store.as_ref()) {
      Ok(command) => self.execute(command),
      Err(e) => self.fail(e),
    }
  }

  pub fn pause(&mut self) -> Result<()> {
    let command = self.transport.pause();
    self.execute(command)
  }

  /// Play `song` immediately, bypassing the queue
  pub fn select_song(&mut self, song: Song) -> Result<()> {
    let command = self.transport.select_song(song);
    self.execute(command)
  }

  pub fn end_song(&mut self) -> Result<()> {
    self.run_end_song()
  }

  fn run_end_song(&mut self) -> Result<()> {
    let command = self.transport.end_song(self.store.as_ref());
    self.execute(command)
  }

  pub fn seek(&mut self, time_seconds: f64) {
    if !self.transport.is_loaded() || !time_seconds.is_finite() {
      return;
    }
    let time = time_seconds.clamp(0.0, self.graph.duration());
    self.graph.seek(time);
    self.transport.set_current_time(time);
    self.emit_state();
    self.emit_lyrics_if_changed();
  }

  /// Host notification that a stored song changed (e.g. stems were added)
  pub fn song_updated(&mut self, song: Song) {
    let previous_lyrics = self
      .transport
      .current_song()
      .and_then(|s| s.lyrics_path().map(str::to_string));

    if self.transport.song_updated(&song)
      && song.lyrics_path().map(str::to_string) != previous_lyrics
    {
      self.discard_lyrics();
      self.request_lyrics(&song);
    }
    self.transport.refresh_next(self.store.as_ref());
    self.emit_state();
  }

  /// Host notification that the queue was edited
  pub fn song_queue_changed(&mut self) {
    self.transport.refresh_next(self.store.as_ref());
    self.emit_state();
  }

  fn execute(&mut self, command: Command) -> Result<()> {
    let result = match command {
      Command::None => Ok(()),
      Command::Load(song) => self.begin_song_load(song),
      Command::Resume => {
        self.graph.connect(Edge::Song);
        Ok(())
      }
      Command::Pause => {
        self.graph.disconnect(Edge::Song);
        Ok(())
      }
      Command::Unload => {
        self.graph.disconnect(Edge::Song);
        self.graph.set_source(None);
        self.live_stem = None;
        self.worker.invalidate(Target::Song);
        self.discard_lyrics();
        Ok(())
      }
    };
    self.transport.refresh_next(self.store.as_ref());
    self.emit_state();
    self.emit_lyrics_if_changed();
    result
  }

  fn begin_song_load(&mut self, song: Song) -> Result<()> {
    self.graph.disconnect(Edge::Song);
    self.graph.set_source(None);
    self.live_stem = None;
    self.discard_lyrics();

    let active = select_active_stem(&song, self.mix.vocals_enabled, self.fs.as_ref());
    if let Err(e) = self.loader.ensure_exists(&active.path) {
      self.worker.invalidate(Target::Song);
      self.transport.load_failed();
      return self.fail(e);
    }

    self.song_load = SongLoad::Transition { stem: active.stem };
    self.worker.submit(Job::DecodeSong { path: active.path });
    self.request_lyrics(&song);
    Ok(())
  }

  // ---- mix parameters ----------------------------------------------------

  pub fn set_volume(&mut self, volume: f64) {
    if !volume.is_finite() {
      return;
    }
    self.mix.volume = volume.clamp(0.0, 100.0);
    self.graph.set_volume(self.mix.volume);
  }

  pub fn set_pitch(&mut self, semitones: f64) {
    if !semitones.is_finite() {
      return;
    }
    self.mix.pitch = semitones;
    self.graph.with_source(|source| source.set_pitch(semitones));
  }

  pub fn set_tempo(&mut self, ratio: f64) {
    if !ratio.is_finite() || ratio <= 0.0 {
      log::warn!("[Engine] Ignoring tempo {}", ratio);
      return;
    }
    let ratio = ratio.clamp(MIN_TEMPO, MAX_TEMPO);
    self.mix.tempo = ratio;
    self.graph.with_source(|source| source.set_tempo(ratio));
  }

  pub fn toggle_vocals(&mut self) -> Result<()> {
    self.set_vocals_enabled(!self.mix.vocals_enabled)
  }

  /// Switch between the full mix and the accompaniment stem
  ///
  /// The new stem is read from disk again on every change.
  pub fn set_vocals_enabled(&mut self, enabled: bool) -> Result<()> {
    if enabled == self.mix.vocals_enabled {
      return Ok(());
    }

    let Some(song) = self.transport.current_song().cloned() else {
      if !enabled {
        return self.fail(EngineError::StemUnavailable);
      }
      self.mix.vocals_enabled = true;
      return Ok(());
    };

    if let Err(e) = validate_vocals_toggle(&song, enabled, self.fs.as_ref()) {
      return self.fail(e);
    }

    let active = select_active_stem(&song, enabled, self.fs.as_ref());
    if let Err(e) = self.loader.ensure_exists(&active.path) {
      return self.fail(e);
    }

    self.mix.vocals_enabled = enabled;
    match self.transport.state() {
      TransportState::Loading => {
        self.song_load = SongLoad::Transition { stem: active.stem };
        self.worker.submit(Job::DecodeSong { path: active.path });
      }
      TransportState::LoadedPaused | TransportState::LoadedPlaying => {
        self.song_load = SongLoad::StemSwap { stem: active.stem };
        self.worker.submit(Job::DecodeSong { path: active.path });
      }
      TransportState::Empty => {}
    }
    self.emit_state();
    Ok(())
  }

  pub fn set_graph_enabled(&mut self, enabled: bool) -> Result<()> {
    if enabled
      && self
        .transport
        .current_song()
        .and_then(|s| s.graph_path())
        .is_none()
    {
      return self.fail(EngineError::GraphUnavailable);
    }
    self.graph_enabled = enabled;
    self.emit_state();
    Ok(())
  }

  // ---- lyrics ------------------------------------------------------------

  pub fn set_lyrics_enabled(&mut self, enabled: bool) -> Result<()> {
    if enabled
      && self
        .transport
        .current_song()
        .and_then(|s| s.lyrics_path())
        .is_none()
    {
      return self.fail(EngineError::LyricsUnavailable);
    }
    self.lyrics.set_enabled(enabled);
    self.emit_lyrics_if_changed();
    Ok(())
  }

  /// Set the lyrics offset directly, in seconds
  pub fn set_lyrics_offset(&mut self, seconds: f64) {
    if let Some(document) = self.lyrics.document_mut() {
      document.set_offset(seconds);
    }
    self.emit_lyrics_if_changed();
  }

  pub fn adjust_lyrics_offset(&mut self, delta: f64) {
    if let Some(document) = self.lyrics.document_mut() {
      document.adjust_offset(delta);
    }
    self.emit_lyrics_if_changed();
  }

  pub fn step_lyrics_offset(&mut self, up: bool) {
    self.adjust_lyrics_offset(if up { OFFSET_STEP } else { -OFFSET_STEP });
  }

  /// Write the shifted lyrics back to the song's lyrics file
  pub fn save_lyrics_offset(&mut self) -> Result<()> {
    let Some(path) = self
      .transport
      .current_song()
      .and_then(|s| s.lyrics_path().map(str::to_string))
    else {
      return self.fail(EngineError::NoLyricsFile);
    };

    let Some(document) = self.lyrics.document() else {
      return self.fail(EngineError::LyricsUnavailable);
    };

    self.saving_offset = Some(document.offset());
    let contents = document.to_lrc();
    self.worker.submit(Job::WriteLyrics { path, contents });
    Ok(())
  }

  fn request_lyrics(&mut self, song: &Song) {
    if let Some(path) = song.lyrics_path() {
      self.worker.submit(Job::ReadLyrics {
        path: path.to_string(),
      });
    }
  }

  fn discard_lyrics(&mut self) {
    self.worker.invalidate(Target::Lyrics);
    self.worker.invalidate(Target::LyricsSave);
    self.saving_offset = None;
    self.lyrics.clear();
  }

  // ---- microphones -------------------------------------------------------

  fn channel(&self, index: usize) -> Result<&MicrophoneChannel> {
    self
      .microphones
      .get(index)
      .ok_or_else(|| EngineError::Device(format!("no microphone channel {}", index)))
  }

  fn constraints(&self, noise_suppression: bool) -> CaptureConstraints {
    let block = self.graph.block_size();
    CaptureConstraints {
      noise_suppression,
      sample_rate: self.config.sample_rate,
      buffer_capacity: (self.config.sample_rate as usize / 10).max(block * 2),
    }
  }

  pub fn set_microphone_enabled(&mut self, index: usize, enabled: bool) -> Result<()> {
    if enabled {
      self.enable_microphone(index)
    } else {
      self.disable_microphone(index)
    }
  }

  pub fn enable_microphone(&mut self, index: usize) -> Result<()> {
    if self.channel(index)?.is_acquired() {
      return Ok(());
    }
    self.acquire_microphone(index)
  }

  pub fn disable_microphone(&mut self, index: usize) -> Result<()> {
    self.channel(index)?;
    self.microphones[index].disable();
    self.graph.detach_microphone_input(index);
    self.emit_microphone(index);
    Ok(())
  }

  /// Open the selected device for chain `index`, replacing any open one
  ///
  /// Opening runs on the owning thread because cpal streams are `!Send`, so
  /// `Requesting` is only observable through the `MicrophoneChanged` event
  /// emitted before the backend is called. A request completed here is always
  /// the latest one for its channel.
  fn acquire_microphone(&mut self, index: usize) -> Result<()> {
    let (token, sink) = self.microphones[index].begin_request();
    self.emit_microphone(index);

    let state = self.microphones[index].state().clone();
    let constraints = self.constraints(state.noise_suppression);
    let result = self
      .input_backend
      .open(&state.device_id, constraints, sink);

    match self.microphones[index].complete_request(token, result) {
      Ok(Completion::Connected) => {
        self.wire_microphone(index);
        self.emit_microphone(index);
        Ok(())
      }
      Ok(Completion::Stale) => {
        log::warn!("[Engine] Microphone {} request superseded while opening", index);
        Ok(())
      }
      Err(e) => {
        self.graph.detach_microphone_input(index);
        self.emit_microphone(index);
        self.fail(e)
      }
    }
  }

  /// Bring the graph edges of chain `index` in line with its state
  fn wire_microphone(&mut self, index: usize) {
    let channel = &self.microphones[index];
    let state = channel.state();

    if let Some(input) = channel.input() {
      self
        .graph
        .attach_microphone_input(index, input.clone(), state.noise_suppression);
    }
    self.graph.set_microphone_volume(index, state.volume);
    self.graph.set_reverb_volume(index, state.reverb_volume);

    let live = state.status == crate::microphone::MicrophoneStatus::Connected;
    if live {
      self.graph.connect_microphone(index);
    } else {
      self.graph.disconnect_microphone(index);
    }
    if live && state.reverb_enabled && self.graph.has_reverb() {
      self.graph.connect_reverb_send(index);
    } else {
      self.graph.disconnect_reverb_send(index);
    }
  }

  /// Detach chain `index` from the mix, keeping the device open
  pub fn suspend_microphone(&mut self, index: usize) -> Result<()> {
    self.channel(index)?;
    if self.microphones[index].suspend() {
      self.wire_microphone(index);
      self.emit_microphone(index);
    }
    Ok(())
  }

  pub fn resume_microphone(&mut self, index: usize) -> Result<()> {
    self.channel(index)?;
    if self.microphones[index].resume() {
      self.wire_microphone(index);
      self.emit_microphone(index);
    }
    Ok(())
  }

  pub fn set_microphone_device(&mut self, index: usize, device_id: &str) -> Result<()> {
    let channel = self.channel(index)?;
    if channel.state().device_id == device_id {
      return Ok(());
    }
    let reacquire = channel.is_acquired();
    self.microphones[index].set_device(device_id);
    if reacquire {
      return self.acquire_microphone(index);
    }
    self.emit_microphone(index);
    Ok(())
  }

  pub fn set_noise_suppression(&mut self, index: usize, enabled: bool) -> Result<()> {
    let channel = self.channel(index)?;
    if channel.state().noise_suppression == enabled {
      return Ok(());
    }
    let reacquire = channel.is_acquired();
    self.microphones[index].set_noise_suppression(enabled);
    if reacquire {
      return self.acquire_microphone(index);
    }
    self.emit_microphone(index);
    Ok(())
  }

  pub fn set_microphone_volume(&mut self, index: usize, volume: f64) -> Result<()> {
    self.channel(index)?;
    if !volume.is_finite() {
      return Ok(());
    }
    self.microphones[index].set_volume(volume);
    self.graph.set_microphone_volume(index, volume);
    self.emit_microphone(index);
    Ok(())
  }

  pub fn set_reverb_volume(&mut self, index: usize, volume: f64) -> Result<()> {
    self.channel(index)?;
    if !volume.is_finite() {
      return Ok(());
    }
    self.microphones[index].set_reverb_volume(volume);
    self.graph.set_reverb_volume(index, volume);
    self.emit_microphone(index);
    Ok(())
  }

  pub fn set_reverb_enabled(&mut self, index: usize, enabled: bool) -> Result<()> {
    self.channel(index)?;

    if !enabled {
      self.microphones[index].set_reverb_enabled(false);
      self.graph.disconnect_reverb_send(index);
      self.emit_microphone(index);
      return Ok(());
    }

    // Send connects once the impulse finishes loading
    if self.impulse == ImpulseState::NotLoaded {
      let path = self.config.reverb_impulse_path.clone();
      if !self.fs.file_exists(&path) {
        return self.fail(EngineError::ReverbAssetMissing(path));
      }
      self.impulse = ImpulseState::Loading;
      self.worker.submit(Job::DecodeImpulse { path });
    }

    self.microphones[index].set_reverb_enabled(true);
    self.wire_microphone(index);
    self.emit_microphone(index);
    Ok(())
  }

  /// Default device and both volumes back to 50 on every chain
  pub fn restore_microphone_defaults(&mut self) -> Result<()> {
    let mut first_error = None;
    for index in 0..self.microphones.len() {
      let device_changed = self.microphones[index].state().device_id != DEFAULT_DEVICE_ID;
      let reacquire = device_changed && self.microphones[index].is_acquired();
      self.microphones[index].restore_defaults();

      if reacquire {
        if let Err(e) = self.acquire_microphone(index) {
          first_error.get_or_insert(e);
          continue;
        }
      }
      self.wire_microphone(index);
      self.emit_microphone(index);
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  /// Re-enumerate capture devices
  pub fn refresh_devices(&mut self) -> Result<Vec<InputDevice>> {
    match self.input_backend.enumerate() {
      Ok(devices) => Ok(devices),
      Err(EngineError::DeviceEnumerationFailed(reason)) => {
        self.fail(EngineError::DeviceEnumerationFailed(reason))
      }
      Err(e) => self.fail(EngineError::DeviceEnumerationFailed(e.to_string())),
    }
  }

  // ---- output ------------------------------------------------------------

  /// Start (or move) audio output on `device_id`, host default when `None`
  pub fn start_output(&mut self, device_id: Option<&str>) -> Result<()> {
    let device_id = device_id.or(self.config.output_device.as_deref()).map(str::to_string);
    let result = match self.output.as_mut() {
      Some(output) => output.switch_device(device_id.as_deref()),
      None => AudioOutput::start(self.graph.clone(), device_id.as_deref()).map(|output| {
        self.output = Some(output);
      }),
    };
    match result {
      Ok(()) => Ok(()),
      Err(e) => self.fail(e),
    }
  }

  pub fn stop_output(&mut self) {
    if let Some(mut output) = self.output.take() {
      output.close();
    }
  }

  pub fn is_output_running(&self) -> bool {
    self.output.is_some()
  }
}
