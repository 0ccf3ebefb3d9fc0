//! Stem selection: which asset of a song is the audible signal

use crate::error::{EngineError, Result};
use crate::fs::FileSystem;
use crate::store::Song;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stem {
  FullMix,
  Accompaniment,
}

/// The stem chosen for playback and the asset it lives in
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveStem {
  pub stem: Stem,
  pub path: String,
}

/// An accompaniment asset exists when the song names one and it is on disk
pub fn accompaniment_available(song: &Song, fs: &dyn FileSystem) -> bool {
  song
    .accompaniment_path()
    .map(|path| fs.file_exists(path))
    .unwrap_or(false)
}

/// Accompaniment when vocals are off and the asset exists, otherwise the full mix
pub fn select_active_stem(song: &Song, vocals_enabled: bool, fs: &dyn FileSystem) -> ActiveStem {
  if !vocals_enabled && accompaniment_available(song, fs) {
    if let Some(path) = song.accompaniment_path() {
      return ActiveStem {
        stem: Stem::Accompaniment,
        path: path.to_string(),
      };
    }
  }

  ActiveStem {
    stem: Stem::FullMix,
    path: song.song_path.clone(),
  }
}

/// Reject turning vocals off for a song that has no accompaniment
///
/// Turning vocals back on is always allowed.
pub fn validate_vocals_toggle(song: &Song, vocals_enabled: bool, fs: &dyn FileSystem) -> Result<()> {
  if !vocals_enabled && !accompaniment_available(song, fs) {
    return Err(EngineError::StemUnavailable);
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::MemoryFileSystem;

  fn song_with_stems() -> Song {
    let mut song = Song::new("s1", "/songs/s1/song.mp3");
    song.accompaniment_path = Some("/songs/s1/accompaniment.wav".into());
    song.vocals_path = Some("/songs/s1/vocals.wav".into());
    song
  }

  #[test]
  fn test_vocals_on_plays_full_mix() {
    let fs = MemoryFileSystem::new();
    fs.insert_binary("/songs/s1/accompaniment.wav", vec![0]);
    let active = select_active_stem(&song_with_stems(), true, &fs);
    assert_eq!(active.stem, Stem::FullMix);
    assert_eq!(active.path, "/songs/s1/song.mp3");
  }

  #[test]
  fn test_vocals_off_plays_accompaniment() {
    let fs = MemoryFileSystem::new();
    fs.insert_binary("/songs/s1/accompaniment.wav", vec![0]);
    let active = select_active_stem(&song_with_stems(), false, &fs);
    assert_eq!(active.stem, Stem::Accompaniment);
    assert_eq!(active.path, "/songs/s1/accompaniment.wav");
  }

  #[test]
  fn test_missing_accompaniment_falls_back_and_rejects_toggle() {
    let fs = MemoryFileSystem::new();
    let song = song_with_stems();
    assert_eq!(select_active_stem(&song, false, &fs).stem, Stem::FullMix);
    assert_eq!(
      validate_vocals_toggle(&song, false, &fs),
      Err(EngineError::StemUnavailable)
    );
    assert_eq!(validate_vocals_toggle(&song, true, &fs), Ok(()));
  }

  #[test]
  fn test_empty_accompaniment_path_is_unavailable() {
    let fs = MemoryFileSystem::new();
    let mut song = Song::new("s2", "/songs/s2/song.mp3");
    song.accompaniment_path = Some(String::new());
    assert!(!accompaniment_available(&song, &fs));
    assert_eq!(
      validate_vocals_toggle(&song, false, &fs),
      Err(EngineError::StemUnavailable)
    );
  }
}
