//! Asset worker
//!
//! Decoding and lyrics file I/O run on one background thread so the control
//! plane never waits on them. Every submitted job carries a `RequestToken`;
//! only the latest token per target is current and completions for older
//! tokens are dropped when drained.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::decoder::{AssetLoader, DecodedBuffer};
use crate::error::{EngineError, Result};
use crate::fs::FileSystem;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestToken(u64);

/// Issues increasing tokens; the most recent one is current
#[derive(Debug, Default)]
pub struct TokenCounter {
  latest: u64,
}

impl TokenCounter {
  pub fn next(&mut self) -> RequestToken {
    self.latest += 1;
    RequestToken(self.latest)
  }

  pub fn is_current(&self, token: RequestToken) -> bool {
    token.0 == self.latest
  }

  /// Make every outstanding token stale
  pub fn invalidate(&mut self) {
    self.latest += 1;
  }
}

/// What a job's result is applied to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
  Song,
  Impulse,
  Lyrics,
  LyricsSave,
}

const TARGETS: usize = 4;

impl Target {
  fn index(self) -> usize {
    match self {
      Target::Song => 0,
      Target::Impulse => 1,
      Target::Lyrics => 2,
      Target::LyricsSave => 3,
    }
  }
}

#[derive(Clone, Debug)]
pub enum Job {
  DecodeSong { path: String },
  DecodeImpulse { path: String },
  ReadLyrics { path: String },
  WriteLyrics { path: String, contents: String },
}

impl Job {
  pub fn target(&self) -> Target {
    match self {
      Job::DecodeSong { .. } => Target::Song,
      Job::DecodeImpulse { .. } => Target::Impulse,
      Job::ReadLyrics { .. } => Target::Lyrics,
      Job::WriteLyrics { .. } => Target::LyricsSave,
    }
  }
}

#[derive(Debug)]
pub enum JobOutput {
  Song(Result<DecodedBuffer>),
  Impulse(Result<DecodedBuffer>),
  Lyrics(Result<String>),
  LyricsSaved(Result<()>),
}

#[derive(Debug)]
pub struct JobDone {
  pub token: RequestToken,
  pub path: String,
  pub output: JobOutput,
}

impl JobDone {
  pub fn target(&self) -> Target {
    match self.output {
      JobOutput::Song(_) => Target::Song,
      JobOutput::Impulse(_) => Target::Impulse,
      JobOutput::Lyrics(_) => Target::Lyrics,
      JobOutput::LyricsSaved(_) => Target::LyricsSave,
    }
  }
}

fn run_job(loader: &AssetLoader, fs: &dyn FileSystem, job: Job) -> (String, JobOutput) {
  match job {
    Job::DecodeSong { path } => {
      let output = JobOutput::Song(loader.load(&path));
      (path, output)
    }
    Job::DecodeImpulse { path } => {
      let output = JobOutput::Impulse(loader.load(&path));
      (path, output)
    }
    Job::ReadLyrics { path } => {
      let output = JobOutput::Lyrics(
        fs.read_text(&path)
          .map_err(|e| EngineError::LyricsReadError(e.to_string())),
      );
      (path, output)
    }
    Job::WriteLyrics { path, contents } => {
      let output = JobOutput::LyricsSaved(
        fs.write_text(&path, &contents)
          .map_err(|e| EngineError::LyricsWriteError(e.to_string())),
      );
      (path, output)
    }
  }
}

pub struct AssetWorker {
  sender: Option<Sender<(RequestToken, Job)>>,
  receiver: Receiver<JobDone>,
  thread: Option<JoinHandle<()>>,
  tokens: [TokenCounter; TARGETS],
  in_flight: usize,
}

impl AssetWorker {
  pub fn spawn(loader: AssetLoader, fs: Arc<dyn FileSystem>) -> Self {
    let (job_tx, job_rx) = unbounded::<(RequestToken, Job)>();
    let (done_tx, done_rx) = unbounded::<JobDone>();

    let thread = thread::spawn(move || {
      for (token, job) in job_rx.iter() {
        let (path, output) = run_job(&loader, fs.as_ref(), job);
        if done_tx.send(JobDone { token, path, output }).is_err() {
          break;
        }
      }
      log::debug!("[AssetWorker] Exiting");
    });

    Self {
      sender: Some(job_tx),
      receiver: done_rx,
      thread: Some(thread),
      tokens: Default::default(),
      in_flight: 0,
    }
  }

  /// Queue `job`, superseding any in-flight job for the same target
  pub fn submit(&mut self, job: Job) -> RequestToken {
    let token = self.tokens[job.target().index()].next();
    log::debug!("[AssetWorker] Submitting {:?} as {:?}", job.target(), token);

    match self.sender.as_ref().map(|tx| tx.send((token, job))) {
      Some(Ok(())) => self.in_flight += 1,
      _ => log::error!("[AssetWorker] Worker thread is gone, job dropped"),
    }
    token
  }

  /// Make the outstanding job for `target` stale
  pub fn invalidate(&mut self, target: Target) {
    self.tokens[target.index()].invalidate();
  }

  pub fn is_current(&self, done: &JobDone) -> bool {
    self.tokens[done.target().index()].is_current(done.token)
  }

  /// Jobs submitted but not yet drained
  pub fn in_flight(&self) -> usize {
    self.in_flight
  }

  /// Completed jobs whose token is still current
  pub fn drain(&mut self) -> Vec<JobDone> {
    let mut done = Vec::new();
    while let Ok(result) = self.receiver.try_recv() {
      self.in_flight = self.in_flight.saturating_sub(1);
      if let Some(result) = self.keep_current(result) {
        done.push(result);
      }
    }
    done
  }

  /// Block until a current job completes or `timeout` elapses
  pub fn wait(&mut self, timeout: Duration) -> Option<JobDone> {
    let deadline = Instant::now() + timeout;
    while self.in_flight > 0 {
      let remaining = deadline.saturating_duration_since(Instant::now());
      match self.receiver.recv_timeout(remaining) {
        Ok(result) => {
          self.in_flight = self.in_flight.saturating_sub(1);
          if let Some(result) = self.keep_current(result) {
            return Some(result);
          }
        }
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
      }
    }
    None
  }

  fn keep_current(&self, result: JobDone) -> Option<JobDone> {
    if self.is_current(&result) {
      Some(result)
    } else {
      log::warn!(
        "[AssetWorker] Dropping stale {:?} result for {}",
        result.target(),
        result.path
      );
      None
    }
  }
}

impl Drop for AssetWorker {
  fn drop(&mut self) {
    self.sender = None;
    if let Some(thread) = self.thread.take() {
      let _ = thread.join();
    }
  }
}
