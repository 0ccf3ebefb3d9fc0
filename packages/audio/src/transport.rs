//! Queue transition state machine
//!
//! ```text
//! Empty --play (queue non-empty)--> Loading --ready--> LoadedPlaying
//!                                      |                 |     ^
//!                                   failure            pause  play
//!                                      v                 v     |
//!                                    Empty            LoadedPaused
//! ```
//!
//! End of song (natural or explicit) resets the clock and dequeues the next
//! song, or falls back to `Empty` when the queue is exhausted. The machine
//! only decides; the engine carries out the returned `Command`.

use crate::error::{EngineError, Result};
use crate::store::{Song, SongStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
  Empty,
  Loading,
  LoadedPaused,
  LoadedPlaying,
}

/// Single source of truth for what is playing
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlaybackState {
  pub current_song: Option<Song>,
  /// Head of the queue, the song that plays after the current one
  pub next_song: Option<Song>,
  /// Seconds
  pub current_time: f64,
  /// Seconds
  pub duration: f64,
  pub playing: bool,
  pub loading: bool,
  pub ended: bool,
}

/// Side effect the engine must perform after a transition
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
  /// Nothing to do
  None,
  /// Decode `song` and rebuild the source
  Load(Song),
  /// Reattach the song source
  Resume,
  /// Detach the song source, keep the time
  Pause,
  /// Drop the song source
  Unload,
}

#[derive(Debug)]
pub struct Transport {
  state: TransportState,
  playback: PlaybackState,
  /// Start playing once the pending load resolves
  autoplay: bool,
}

impl Default for Transport {
  fn default() -> Self {
    Self::new()
  }
}

impl Transport {
  pub fn new() -> Self {
    Self {
      state: TransportState::Empty,
      playback: PlaybackState::default(),
      autoplay: false,
    }
  }

  pub fn state(&self) -> TransportState {
    self.state
  }

  pub fn playback(&self) -> &PlaybackState {
    &self.playback
  }

  pub fn current_song(&self) -> Option<&Song> {
    self.playback.current_song.as_ref()
  }

  pub fn is_loaded(&self) -> bool {
    matches!(
      self.state,
      TransportState::LoadedPaused | TransportState::LoadedPlaying
    )
  }

  pub fn play(&mut self, store: &dyn SongStore) -> Result<Command> {
    match self.state {
      TransportState::Empty => match store.dequeue_head() {
        Some(song) => Ok(self.begin_load(song, true)),
        None => Err(EngineError::QueueEmpty),
      },
      // A load is already resolving, a second dequeue would skip a song
      TransportState::Loading => {
        log::debug!("[Transport] Play ignored while loading");
        Ok(Command::None)
      }
      TransportState::LoadedPaused => {
        self.state = TransportState::LoadedPlaying;
        self.playback.playing = true;
        Ok(Command::Resume)
      }
      TransportState::LoadedPlaying => Ok(Command::None),
    }
  }

  pub fn pause(&mut self) -> Command {
    match self.state {
      TransportState::LoadedPlaying => {
        self.state = TransportState::LoadedPaused;
        self.playback.playing = false;
        Command::Pause
      }
      TransportState::Loading => {
        self.autoplay = false;
        self.playback.playing = false;
        Command::None
      }
      _ => Command::None,
    }
  }

  /// Play `song` now; re-selecting the loaded song does not reload it
  pub fn select_song(&mut self, song: Song) -> Command {
    let same = self
      .playback
      .current_song
      .as_ref()
      .map(|current| current.id == song.id)
      .unwrap_or(false);

    if same {
      match self.state {
        TransportState::LoadedPaused => {
          self.state = TransportState::LoadedPlaying;
          self.playback.playing = true;
          return Command::Resume;
        }
        TransportState::LoadedPlaying => return Command::None,
        TransportState::Loading => {
          self.autoplay = true;
          self.playback.playing = true;
          return Command::None;
        }
        TransportState::Empty => {}
      }
    }

    self.begin_load(song, true)
  }

  /// Natural end or explicit "end song"
  pub fn end_song(&mut self, store: &dyn SongStore) -> Command {
    self.playback.current_time = 0.0;

    if store.queue_length() > 0 {
      if let Some(song) = store.dequeue_head() {
        return self.begin_load(song, true);
      }
    }

    log::info!("[Transport] Queue exhausted");
    self.state = TransportState::Empty;
    self.autoplay = false;
    self.playback.current_song = None;
    self.playback.duration = 0.0;
    self.playback.playing = false;
    self.playback.loading = false;
    self.playback.ended = true;
    Command::Unload
  }

  fn begin_load(&mut self, song: Song, autoplay: bool) -> Command {
    log::info!("[Transport] Loading {} ({})", song.id, song.song_path);
    self.state = TransportState::Loading;
    self.autoplay = autoplay;
    self.playback.current_song = Some(song.clone());
    self.playback.current_time = 0.0;
    self.playback.duration = 0.0;
    self.playback.playing = autoplay;
    self.playback.loading = true;
    self.playback.ended = false;
    Command::Load(song)
  }

  /// The decoded asset is in place; returns whether playback should start
  pub fn load_succeeded(&mut self, duration: f64) -> bool {
    if self.state != TransportState::Loading {
      return false;
    }
    self.playback.loading = false;
    self.playback.duration = duration;
    self.playback.current_time = 0.0;
    if self.autoplay {
      self.state = TransportState::LoadedPlaying;
      self.playback.playing = true;
    } else {
      self.state = TransportState::LoadedPaused;
      self.playback.playing = false;
    }
    self.autoplay
  }

  pub fn load_failed(&mut self) {
    self.state = TransportState::Empty;
    self.autoplay = false;
    self.playback.current_song = None;
    self.playback.current_time = 0.0;
    self.playback.duration = 0.0;
    self.playback.playing = false;
    self.playback.loading = false;
  }

  pub fn set_current_time(&mut self, time: f64) {
    if self.is_loaded() {
      self.playback.current_time = time;
    }
  }

  /// Replace the stored fields of the current song, without reloading audio
  pub fn song_updated(&mut self, song: &Song) -> bool {
    match self.playback.current_song.as_mut() {
      Some(current) if current.id == song.id => {
        *current = song.clone();
        true
      }
      _ => false,
    }
  }

  pub fn refresh_next(&mut self, store: &dyn SongStore) {
    self.playback.next_song = store.peek_head();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemorySongStore;

  fn store_with(ids: &[&str]) -> MemorySongStore {
    let store = MemorySongStore::new();
    for id in ids {
      store.add_song(Song::new(*id, format!("/songs/{}.mp3", id)));
      store.enqueue(*id);
    }
    store
  }

  fn loaded(store: &MemorySongStore) -> Transport {
    let mut transport = Transport::new();
    transport.play(store).unwrap();
    assert!(transport.load_succeeded(180.0));
    transport
  }

  #[test]
  fn test_play_from_empty_dequeues_and_loads() {
    let store = store_with(&["a", "b"]);
    let mut transport = Transport::new();

    let command = transport.play(&store).unwrap();
    assert_eq!(command, Command::Load(Song::new("a", "/songs/a.mp3")));
    assert_eq!(transport.state(), TransportState::Loading);
    assert!(transport.playback().loading);
    assert_eq!(store.queue_length(), 1);

    assert!(transport.load_succeeded(120.0));
    assert_eq!(transport.state(), TransportState::LoadedPlaying);
    assert_eq!(transport.playback().duration, 120.0);
    assert!(!transport.playback().loading);
  }

  #[test]
  fn test_play_with_empty_queue_fails() {
    let store = store_with(&[]);
    let mut transport = Transport::new();
    assert_eq!(transport.play(&store), Err(EngineError::QueueEmpty));
    assert_eq!(transport.state(), TransportState::Empty);
  }

  #[test]
  fn test_play_while_loading_does_not_dequeue_again() {
    let store = store_with(&["a", "b", "c"]);
    let mut transport = Transport::new();
    transport.play(&store).unwrap();
    assert_eq!(transport.play(&store), Ok(Command::None));
    assert_eq!(transport.play(&store), Ok(Command::None));
    assert_eq!(store.queue_length(), 2);
  }

  #[test]
  fn test_pause_and_resume_in_place() {
    let store = store_with(&["a"]);
    let mut transport = loaded(&store);
    transport.set_current_time(42.0);

    assert_eq!(transport.pause(), Command::Pause);
    assert_eq!(transport.state(), TransportState::LoadedPaused);
    assert_eq!(transport.playback().current_time, 42.0);

    assert_eq!(transport.play(&store), Ok(Command::Resume));
    assert_eq!(transport.state(), TransportState::LoadedPlaying);
    assert_eq!(transport.playback().current_time, 42.0);
  }

  #[test]
  fn test_pause_while_loading_lands_paused() {
    let store = store_with(&["a"]);
    let mut transport = Transport::new();
    transport.play(&store).unwrap();
    assert_eq!(transport.pause(), Command::None);
    assert!(!transport.load_succeeded(10.0));
    assert_eq!(transport.state(), TransportState::LoadedPaused);
  }

  #[test]
  fn test_end_with_empty_queue_clears_current() {
    let store = store_with(&["a"]);
    let mut transport = loaded(&store);
    transport.set_current_time(90.0);

    assert_eq!(transport.end_song(&store), Command::Unload);
    assert_eq!(transport.state(), TransportState::Empty);
    assert!(transport.current_song().is_none());
    assert_eq!(transport.playback().current_time, 0.0);
    assert!(transport.playback().ended);
  }

  #[test]
  fn test_end_with_queue_dequeues_exactly_one() {
    let store = store_with(&["a", "b", "c"]);
    let mut transport = loaded(&store);
    transport.set_current_time(90.0);

    let command = transport.end_song(&store);
    assert_eq!(command, Command::Load(Song::new("b", "/songs/b.mp3")));
    assert_eq!(transport.state(), TransportState::Loading);
    assert_eq!(store.queue_length(), 1);
    assert_eq!(transport.playback().current_time, 0.0);
  }

  #[test]
  fn test_load_failure_returns_to_empty() {
    let store = store_with(&["a"]);
    let mut transport = Transport::new();
    transport.play(&store).unwrap();
    transport.load_failed();
    assert_eq!(transport.state(), TransportState::Empty);
    assert!(transport.current_song().is_none());
    assert!(!transport.playback().loading);
  }

  #[test]
  fn test_reselecting_loaded_song_does_not_reload() {
    let store = store_with(&["a"]);
    let mut transport = loaded(&store);
    transport.pause();

    let song = transport.current_song().cloned().unwrap();
    assert_eq!(transport.select_song(song.clone()), Command::Resume);
    assert_eq!(transport.select_song(song), Command::None);

    let other = Song::new("z", "/songs/z.mp3");
    assert_eq!(transport.select_song(other.clone()), Command::Load(other));
  }

  #[test]
  fn test_song_updated_only_touches_current() {
    let store = store_with(&["a"]);
    let mut transport = loaded(&store);

    let mut updated = Song::new("a", "/songs/a.mp3");
    updated.accompaniment_path = Some("/songs/a_acc.wav".into());
    assert!(transport.song_updated(&updated));
    assert_eq!(transport.current_song(), Some(&updated));
    assert!(!transport.song_updated(&Song::new("q", "/q.mp3")));
  }

  #[test]
  fn test_next_song_tracks_queue_head() {
    let store = store_with(&["a", "b"]);
    let mut transport = loaded(&store);
    transport.refresh_next(&store);
    assert_eq!(transport.playback().next_song.as_ref().unwrap().id, "b");
  }
}
