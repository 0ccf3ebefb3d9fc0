//! Filesystem access used by the engine (song assets, lyrics files)

use std::io;
use std::path::Path;

/// File operations the engine needs from its host
///
/// Called from both the control thread and the asset worker.
pub trait FileSystem: Send + Sync {
  fn file_exists(&self, path: &str) -> bool;
  fn read_text(&self, path: &str) -> io::Result<String>;
  fn read_binary(&self, path: &str) -> io::Result<Vec<u8>>;
  /// Writes `data`, creating missing parent directories
  fn write_text(&self, path: &str, data: &str) -> io::Result<()>;
}

/// `std::fs` backed implementation
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
  fn file_exists(&self, path: &str) -> bool {
    !path.is_empty() && Path::new(path).is_file()
  }

  fn read_text(&self, path: &str) -> io::Result<String> {
    std::fs::read_to_string(path)
  }

  fn read_binary(&self, path: &str) -> io::Result<Vec<u8>> {
    std::fs::read(path)
  }

  fn write_text(&self, path: &str, data: &str) -> io::Result<()> {
    if let Some(dir) = Path::new(path).parent() {
      if !dir.as_os_str().is_empty() && !dir.exists() {
        std::fs::create_dir_all(dir)?;
      }
    }
    std::fs::write(path, data)
  }
}
