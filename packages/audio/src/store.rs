//! Song model and the song/queue storage the engine reads from

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

/// A song in the library
///
/// Optional asset paths are `None` until the song has been processed
/// (stems, pitch graph) or lyrics have been attached.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Song {
  pub id: String,
  pub name: String,
  pub artist: String,
  /// Full mix
  pub song_path: String,
  pub vocals_path: Option<String>,
  pub accompaniment_path: Option<String>,
  pub lyrics_path: Option<String>,
  pub graph_path: Option<String>,
}

impl Song {
  pub fn new(id: impl Into<String>, song_path: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      song_path: song_path.into(),
      ..Default::default()
    }
  }

  pub fn lyrics_path(&self) -> Option<&str> {
    non_empty(&self.lyrics_path)
  }

  pub fn accompaniment_path(&self) -> Option<&str> {
    non_empty(&self.accompaniment_path)
  }

  pub fn graph_path(&self) -> Option<&str> {
    non_empty(&self.graph_path)
  }
}

fn non_empty(path: &Option<String>) -> Option<&str> {
  path.as_deref().filter(|p| !p.is_empty())
}

/// Song library and playback queue owned by the host application
pub trait SongStore {
  fn get_song(&self, id: &str) -> Option<Song>;
  fn set_song(&self, song: Song);
  /// Removes and returns the song at the head of the queue
  fn dequeue_head(&self) -> Option<Song>;
  fn queue_length(&self) -> usize;
  /// Song at the head of the queue without removing it
  fn peek_head(&self) -> Option<Song> {
    None
  }
}

/// In-memory library and FIFO queue
#[derive(Default)]
pub struct MemorySongStore {
  songs: Mutex<HashMap<String, Song>>,
  queue: Mutex<VecDeque<String>>,
}

impl MemorySongStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_song(&self, song: Song) {
    self.songs.lock().insert(song.id.clone(), song);
  }

  /// Appends a song id to the queue; unknown ids are skipped on dequeue
  pub fn enqueue(&self, song_id: impl Into<String>) {
    self.queue.lock().push_back(song_id.into());
  }

  pub fn clear_queue(&self) {
    self.queue.lock().clear();
  }
}

impl SongStore for MemorySongStore {
  fn get_song(&self, id: &str) -> Option<Song> {
    self.songs.lock().get(id).cloned()
  }

  fn set_song(&self, song: Song) {
    self.add_song(song);
  }

  fn dequeue_head(&self) -> Option<Song> {
    let mut queue = self.queue.lock();
    while let Some(id) = queue.pop_front() {
      if let Some(song) = self.get_song(&id) {
        return Some(song);
      }
      log::warn!("[SongStore] Queued song {} no longer exists", id);
    }
    None
  }

  fn queue_length(&self) -> usize {
    self.queue.lock().len()
  }

  fn peek_head(&self) -> Option<Song> {
    let queue = self.queue.lock();
    queue.iter().find_map(|id| self.get_song(id))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_queue_is_fifo() {
    let store = MemorySongStore::new();
    store.add_song(Song::new("a", "/a.mp3"));
    store.add_song(Song::new("b", "/b.mp3"));
    store.enqueue("a");
    store.enqueue("b");

    assert_eq!(store.queue_length(), 2);
    assert_eq!(store.peek_head().unwrap().id, "a");
    assert_eq!(store.dequeue_head().unwrap().id, "a");
    assert_eq!(store.dequeue_head().unwrap().id, "b");
    assert!(store.dequeue_head().is_none());
  }

  #[test]
  fn test_empty_paths_are_treated_as_absent() {
    let mut song = Song::new("a", "/a.mp3");
    song.lyrics_path = Some(String::new());
    song.accompaniment_path = Some("/a_acc.wav".into());
    assert_eq!(song.lyrics_path(), None);
    assert_eq!(song.accompaniment_path(), Some("/a_acc.wav"));
  }
}
