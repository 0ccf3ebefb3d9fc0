//! LRC lyrics and the playback-clock synchronizer
//!
//! Timestamps are kept in integer milliseconds so offset adjustments are
//! exact and reversible. The offset follows the LRC convention: a positive
//! offset shows lines earlier, i.e. the active line at time `t` is the last
//! one whose original timestamp is <= `t + offset`.

use std::fmt::Write as _;

/// Step applied by the offset +/- buttons, in seconds
pub const OFFSET_STEP: f64 = 0.2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LyricLine {
  /// Shifted by the current offset, may go negative
  pub timestamp_ms: i64,
  pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LyricsDocument {
  /// `[key:value]` header tags, in file order
  tags: Vec<(String, String)>,
  lines: Vec<LyricLine>,
  offset_ms: i64,
}

fn parse_timestamp(tag: &str) -> Option<i64> {
  let (minutes, rest) = tag.split_once(':')?;
  let minutes: i64 = minutes.trim().parse().ok()?;
  let (seconds, fraction) = match rest.find(['.', ':']) {
    Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
    None => (rest, None),
  };
  if seconds.is_empty() || !seconds.chars().all(|c| c.is_ascii_digit()) {
    return None;
  }
  let seconds: i64 = seconds.parse().ok()?;

  let millis = match fraction {
    None | Some("") => 0,
    Some(digits) if digits.chars().all(|c| c.is_ascii_digit()) => {
      let digits = &digits[..digits.len().min(3)];
      let value: i64 = digits.parse().ok()?;
      value * 10i64.pow(3 - digits.len() as u32)
    }
    Some(_) => return None,
  };

  // Absurd values are not timestamps
  minutes
    .checked_mul(60)?
    .checked_add(seconds)?
    .checked_mul(1000)?
    .checked_add(millis)
}

fn format_timestamp(ms: i64) -> String {
  let ms = ms.max(0);
  let minutes = ms / 60_000;
  let seconds = (ms % 60_000) / 1000;
  let millis = ms % 1000;
  if millis % 10 == 0 {
    format!("[{:02}:{:02}.{:02}]", minutes, seconds, millis / 10)
  } else {
    format!("[{:02}:{:02}.{:03}]", minutes, seconds, millis)
  }
}

impl LyricsDocument {
  pub fn parse(contents: &str) -> Self {
    let mut document = Self::default();

    for raw in contents.lines() {
      let mut rest = raw.trim();
      let mut timestamps = Vec::new();

      while let Some(body) = rest.strip_prefix('[') {
        let Some(end) = body.find(']') else {
          break;
        };
        let tag = &body[..end];
        if let Some(ts) = parse_timestamp(tag) {
          timestamps.push(ts);
        } else if let Some((key, value)) = tag.split_once(':') {
          if timestamps.is_empty() && key.chars().all(|c| c.is_ascii_alphabetic()) {
            document
              .tags
              .push((key.trim().to_string(), value.trim().to_string()));
          }
        } else {
          break;
        }
        rest = &body[end + 1..];
      }

      let text = rest.trim();
      for ts in timestamps {
        document.lines.push(LyricLine {
          timestamp_ms: ts,
          text: text.to_string(),
        });
      }
    }

    // Stable, so lines sharing a timestamp keep file order
    document.lines.sort_by_key(|line| line.timestamp_ms);
    document
  }

  pub fn lines(&self) -> &[LyricLine] {
    &self.lines
  }

  pub fn tags(&self) -> &[(String, String)] {
    &self.tags
  }

  pub fn is_empty(&self) -> bool {
    self.lines.is_empty()
  }

  /// Current offset in seconds
  pub fn offset(&self) -> f64 {
    self.offset_ms as f64 / 1000.0
  }

  /// Set the offset, shifting every line by the change from the previous one
  pub fn set_offset(&mut self, seconds: f64) {
    if !seconds.is_finite() {
      return;
    }
    let new_ms = (seconds * 1000.0).round() as i64;
    let delta = new_ms.saturating_sub(self.offset_ms);
    for line in self.lines.iter_mut() {
      line.timestamp_ms = line.timestamp_ms.saturating_sub(delta);
    }
    self.offset_ms = new_ms;
  }

  /// Step the offset by `delta` seconds, snapped to tenths
  pub fn adjust_offset(&mut self, delta: f64) {
    let target = ((self.offset() + delta) * 10.0).round() / 10.0;
    self.set_offset(target);
  }

  /// The stored file now carries `saved` seconds of the offset
  pub fn rebase_offset(&mut self, saved: f64) {
    if saved.is_finite() {
      self.offset_ms -= (saved * 1000.0).round() as i64;
    }
  }

  /// Index of the line active at `time` seconds
  pub fn line_index_at(&self, time: f64) -> Option<usize> {
    let time_ms = time * 1000.0;
    let count = self
      .lines
      .partition_point(|line| line.timestamp_ms as f64 <= time_ms);
    count.checked_sub(1)
  }

  /// Active and following line at `time`; empty strings where absent
  pub fn lines_at(&self, time: f64) -> LyricsLines {
    let next_index = self.line_index_at(time).map(|i| i + 1).unwrap_or(0);
    LyricsLines {
      current: self
        .line_index_at(time)
        .map(|i| self.lines[i].text.clone())
        .unwrap_or_default(),
      next: self
        .lines
        .get(next_index)
        .map(|l| l.text.clone())
        .unwrap_or_default(),
    }
  }

  /// Serialize with the shifted timestamps; negative times clamp to zero
  pub fn to_lrc(&self) -> String {
    let mut out = String::new();
    for (key, value) in &self.tags {
      let _ = writeln!(out, "[{}:{}]", key, value);
    }
    for line in &self.lines {
      let _ = writeln!(out, "{}{}", format_timestamp(line.timestamp_ms), line.text);
    }
    out
  }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LyricsLines {
  pub current: String,
  pub next: String,
}

/// Maps the playback clock to lyric lines for the current song
#[derive(Debug, Default)]
pub struct LyricsSynchronizer {
  enabled: bool,
  document: Option<LyricsDocument>,
}

impl LyricsSynchronizer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled
  }

  pub fn set_enabled(&mut self, enabled: bool) {
    self.enabled = enabled;
  }

  pub fn document(&self) -> Option<&LyricsDocument> {
    self.document.as_ref()
  }

  pub fn document_mut(&mut self) -> Option<&mut LyricsDocument> {
    self.document.as_mut()
  }

  pub fn load(&mut self, document: LyricsDocument) {
    self.document = Some(document);
  }

  /// Drop the document; a new song always starts from offset 0
  pub fn clear(&mut self) {
    self.document = None;
  }

  pub fn offset(&self) -> f64 {
    self.document.as_ref().map(|d| d.offset()).unwrap_or(0.0)
  }

  pub fn lines_at(&self, time: f64) -> LyricsLines {
    match (&self.document, self.enabled) {
      (Some(document), true) => document.lines_at(time),
      _ => LyricsLines::default(),
    }
  }
}
