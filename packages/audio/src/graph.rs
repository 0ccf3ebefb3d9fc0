//! Mix graph
//!
//! Node topology:
//! - song source -> [Song edge] -> master
//! - mic i -> (noise suppressor) -> mic gain -> [Microphone(i) edge] -> master
//! - mic gain i -> convolution reverb -> reverb gain -> [ReverbSend(i) edge] -> master
//!
//! Edges are named and explicitly connected/disconnected; both operations
//! are idempotent. The nodes live behind one mutex shared with the
//! processing thread, which pulls fixed-size blocks through `render`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DEFAULT_CHANNELS;
use crate::microphone::MicInput;
use crate::noise::NoiseSuppressor;
use crate::reverb::ConvolutionReverb;
use crate::time_stretch::TimeStretchSource;

/// Number of microphone chains
pub const MIC_CHANNELS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Edge {
  Song,
  Microphone(usize),
  ReverbSend(usize),
}

/// Linear 0-100 slider value to gain 0.0-1.0
pub fn slider_to_gain(value: f64) -> f32 {
  if !value.is_finite() {
    return 0.0;
  }
  (value.clamp(0.0, 100.0) / 100.0) as f32
}

struct MicNode {
  input: Option<MicInput>,
  suppressor: Option<NoiseSuppressor>,
  gain: f32,
  reverb: Option<ConvolutionReverb>,
  reverb_gain: f32,
  connected: bool,
  send_connected: bool,
  dry: Vec<f32>,
  wet: Vec<f32>,
}

impl MicNode {
  fn new(block_size: usize) -> Self {
    Self {
      input: None,
      suppressor: None,
      gain: 0.5,
      reverb: None,
      reverb_gain: 0.5,
      connected: false,
      send_connected: false,
      dry: vec![0.0; block_size],
      wet: vec![0.0; block_size],
    }
  }

  /// Pull one block of captured samples through the chain and mix it in
  fn render_into(&mut self, mix: &mut [f32], frames: usize) {
    let Some(input) = self.input.as_ref() else {
      return;
    };

    {
      let mut queue = input.lock();
      // Not enough captured audio yet, skip this block
      if queue.len() < frames {
        return;
      }
      for (slot, sample) in self.dry[..frames].iter_mut().zip(queue.drain(..frames)) {
        *slot = sample;
      }
    }

    if let Some(suppressor) = self.suppressor.as_mut() {
      suppressor.process(&mut self.dry[..frames]);
    }

    for sample in self.dry[..frames].iter_mut() {
      *sample *= self.gain;
    }

    let channels = DEFAULT_CHANNELS as usize;
    if self.connected {
      for (frame, sample) in mix.chunks_exact_mut(channels).zip(&self.dry[..frames]) {
        frame.iter_mut().for_each(|s| *s += sample);
      }
    }

    if self.send_connected {
      if let Some(reverb) = self.reverb.as_mut() {
        reverb.process(&self.dry[..frames], &mut self.wet[..frames]);
        for (frame, sample) in mix.chunks_exact_mut(channels).zip(&self.wet[..frames]) {
          let wet = sample * self.reverb_gain;
          frame.iter_mut().for_each(|s| *s += wet);
        }
      }
    }
  }
}

/// Audio-thread view of the graph
pub struct GraphNodes {
  block_size: usize,
  sample_rate: u32,
  source: Option<TimeStretchSource>,
  song_connected: bool,
  master_gain: f32,
  mics: [MicNode; MIC_CHANNELS],
  song_buffer: Vec<f32>,
  ended: bool,
  /// The current source already raised `ended`
  end_reported: bool,
}

impl GraphNodes {
  fn new(sample_rate: u32, block_size: usize) -> Self {
    Self {
      block_size,
      sample_rate,
      source: None,
      song_connected: false,
      master_gain: 1.0,
      mics: [MicNode::new(block_size), MicNode::new(block_size)],
      song_buffer: vec![0.0; block_size * DEFAULT_CHANNELS as usize],
      ended: false,
      end_reported: false,
    }
  }

  /// Render one block of `block_size` interleaved stereo frames
  pub fn render(&mut self, output: &mut [f32]) {
    let channels = DEFAULT_CHANNELS as usize;
    let frames = self.block_size.min(output.len() / channels);
    let mix = &mut output[..frames * channels];
    mix.fill(0.0);

    if self.song_connected {
      if let Some(source) = self.source.as_mut() {
        source.render(&mut self.song_buffer, frames);
        for (out, sample) in mix.iter_mut().zip(&self.song_buffer) {
          *out += sample;
        }
        if source.is_finished() && !self.end_reported {
          self.ended = true;
          self.end_reported = true;
        }
      }
    }

    for mic in self.mics.iter_mut() {
      mic.render_into(mix, frames);
    }

    let gain = self.master_gain;
    for sample in mix.iter_mut() {
      *sample = (*sample * gain).clamp(-1.0, 1.0);
    }
  }
}

/// Control-plane handle to the mix graph
#[derive(Clone)]
pub struct MixGraph {
  nodes: Arc<Mutex<GraphNodes>>,
}

impl MixGraph {
  pub fn new(sample_rate: u32, block_size: usize) -> Self {
    Self {
      nodes: Arc::new(Mutex::new(GraphNodes::new(sample_rate, block_size.max(1)))),
    }
  }

  pub fn block_size(&self) -> usize {
    self.nodes.lock().block_size
  }

  pub fn sample_rate(&self) -> u32 {
    self.nodes.lock().sample_rate
  }

  /// Render one block; called from the processing thread
  pub fn render(&self, output: &mut [f32]) {
    self.nodes.lock().render(output);
  }

  pub fn connect(&self, edge: Edge) {
    self.set_edge(edge, true);
  }

  pub fn disconnect(&self, edge: Edge) {
    self.set_edge(edge, false);
  }

  pub fn is_connected(&self, edge: Edge) -> bool {
    let nodes = self.nodes.lock();
    match edge {
      Edge::Song => nodes.song_connected,
      Edge::Microphone(i) => nodes.mics.get(i).map(|m| m.connected).unwrap_or(false),
      Edge::ReverbSend(i) => nodes.mics.get(i).map(|m| m.send_connected).unwrap_or(false),
    }
  }

  fn set_edge(&self, edge: Edge, connected: bool) {
    let mut nodes = self.nodes.lock();
    match edge {
      Edge::Song => nodes.song_connected = connected,
      Edge::Microphone(i) => {
        if let Some(mic) = nodes.mics.get_mut(i) {
          mic.connected = connected;
        }
      }
      Edge::ReverbSend(i) => {
        if let Some(mic) = nodes.mics.get_mut(i) {
          mic.send_connected = connected;
          if !connected {
            if let Some(reverb) = mic.reverb.as_mut() {
              reverb.reset();
            }
          }
        }
      }
    }
  }

  pub fn connect_microphone(&self, index: usize) {
    self.connect(Edge::Microphone(index));
  }

  pub fn disconnect_microphone(&self, index: usize) {
    self.disconnect(Edge::Microphone(index));
  }

  pub fn connect_reverb_send(&self, index: usize) {
    self.connect(Edge::ReverbSend(index));
  }

  pub fn disconnect_reverb_send(&self, index: usize) {
    self.disconnect(Edge::ReverbSend(index));
  }

  /// Master volume, 0-100
  pub fn set_volume(&self, volume: f64) {
    self.nodes.lock().master_gain = slider_to_gain(volume);
  }

  pub fn master_gain(&self) -> f32 {
    self.nodes.lock().master_gain
  }

  pub fn set_microphone_volume(&self, index: usize, volume: f64) {
    if let Some(mic) = self.nodes.lock().mics.get_mut(index) {
      mic.gain = slider_to_gain(volume);
    }
  }

  pub fn microphone_gain(&self, index: usize) -> Option<f32> {
    self.nodes.lock().mics.get(index).map(|m| m.gain)
  }

  pub fn set_reverb_volume(&self, index: usize, volume: f64) {
    if let Some(mic) = self.nodes.lock().mics.get_mut(index) {
      mic.reverb_gain = slider_to_gain(volume);
    }
  }

  pub fn reverb_gain(&self, index: usize) -> Option<f32> {
    self.nodes.lock().mics.get(index).map(|m| m.reverb_gain)
  }

  /// Wire a captured input into chain `index`, replacing any previous input
  pub fn attach_microphone_input(&self, index: usize, input: MicInput, noise_suppression: bool) {
    let mut nodes = self.nodes.lock();
    let sample_rate = nodes.sample_rate;
    if let Some(mic) = nodes.mics.get_mut(index) {
      mic.input = Some(input);
      mic.suppressor = noise_suppression.then(|| NoiseSuppressor::new(sample_rate));
    }
  }

  pub fn detach_microphone_input(&self, index: usize) {
    let mut nodes = self.nodes.lock();
    if let Some(mic) = nodes.mics.get_mut(index) {
      mic.input = None;
      mic.suppressor = None;
      mic.connected = false;
      mic.send_connected = false;
    }
  }

  /// Install the reverb impulse for every chain
  pub fn install_reverb(&self, impulse: &[f32]) -> crate::error::Result<()> {
    let mut nodes = self.nodes.lock();
    let block_size = nodes.block_size;
    for mic in nodes.mics.iter_mut() {
      mic.reverb = Some(ConvolutionReverb::normalized(impulse, block_size)?);
    }
    Ok(())
  }

  pub fn has_reverb(&self) -> bool {
    self.nodes.lock().mics.iter().all(|m| m.reverb.is_some())
  }

  /// Replace the song source; the previous source is dropped
  pub fn set_source(&self, source: Option<TimeStretchSource>) {
    let mut nodes = self.nodes.lock();
    nodes.source = source;
    nodes.ended = false;
    nodes.end_reported = false;
  }

  pub fn has_source(&self) -> bool {
    self.nodes.lock().source.is_some()
  }

  /// Run `f` against the live source, if any
  pub fn with_source<R>(&self, f: impl FnOnce(&mut TimeStretchSource) -> R) -> Option<R> {
    self.nodes.lock().source.as_mut().map(f)
  }

  pub fn current_time(&self) -> f64 {
    self.with_source(|s| s.current_time()).unwrap_or(0.0)
  }

  pub fn duration(&self) -> f64 {
    self.with_source(|s| s.duration()).unwrap_or(0.0)
  }

  pub fn seek(&self, time_seconds: f64) {
    let mut guard = self.nodes.lock();
    let nodes = &mut *guard;
    if let Some(source) = nodes.source.as_mut() {
      source.seek(time_seconds);
      nodes.ended = false;
      nodes.end_reported = false;
    }
  }

  /// Returns true once after the source played to its end
  pub fn take_ended(&self) -> bool {
    std::mem::take(&mut self.nodes.lock().ended)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::microphone::new_mic_input;
  use crate::testing::sine_buffer;

  const BLOCK: usize = 256;

  fn render_block(graph: &MixGraph) -> Vec<f32> {
    let mut out = vec![0.0; BLOCK * 2];
    graph.render(&mut out);
    out
  }

  fn feed(input: &MicInput, value: f32, frames: usize) {
    input.lock().extend(std::iter::repeat(value).take(frames));
  }

  #[test]
  fn test_slider_mapping_is_linear() {
    assert_eq!(slider_to_gain(40.0), 0.4);
    assert_eq!(slider_to_gain(100.0), 1.0);
    assert_eq!(slider_to_gain(0.0), 0.0);
    assert_eq!(slider_to_gain(150.0), 1.0);
    assert_eq!(slider_to_gain(f64::NAN), 0.0);
  }

  #[test]
  fn test_volume_sets_master_gain() {
    let graph = MixGraph::new(44_100, BLOCK);
    graph.set_volume(40.0);
    assert_eq!(graph.master_gain(), 0.4);
    graph.set_microphone_volume(1, 100.0);
    assert_eq!(graph.microphone_gain(1), Some(1.0));
    graph.set_reverb_volume(0, 40.0);
    assert_eq!(graph.reverb_gain(0), Some(0.4));
  }

  #[test]
  fn test_connect_and_disconnect_are_idempotent() {
    let graph = MixGraph::new(44_100, BLOCK);
    graph.connect_microphone(0);
    graph.connect_microphone(0);
    assert!(graph.is_connected(Edge::Microphone(0)));
    graph.disconnect_microphone(0);
    graph.disconnect_microphone(0);
    assert!(!graph.is_connected(Edge::Microphone(0)));

    graph.disconnect_reverb_send(1);
    assert!(!graph.is_connected(Edge::ReverbSend(1)));

    // Out of range channels are ignored
    graph.connect_microphone(5);
    assert!(!graph.is_connected(Edge::Microphone(5)));
  }

  #[test]
  fn test_disconnected_song_is_silent_and_keeps_time() {
    let graph = MixGraph::new(44_100, BLOCK);
    graph.set_source(Some(TimeStretchSource::new(sine_buffer(440.0, 1.0)).unwrap()));

    graph.connect(Edge::Song);
    for _ in 0..8 {
      render_block(&graph);
    }
    let time = graph.current_time();
    assert!(time > 0.0);

    graph.disconnect(Edge::Song);
    let out = render_block(&graph);
    assert!(out.iter().all(|s| *s == 0.0));
    assert_eq!(graph.current_time(), time);
  }

  #[test]
  fn test_microphone_chain_mixes_with_gain() {
    let graph = MixGraph::new(44_100, BLOCK);
    let input = new_mic_input();
    graph.attach_microphone_input(0, input.clone(), false);
    graph.set_microphone_volume(0, 50.0);
    graph.connect_microphone(0);

    feed(&input, 0.5, BLOCK);
    let out = render_block(&graph);
    assert!(out.iter().all(|s| (s - 0.25).abs() < 1e-6));
    assert!(input.lock().is_empty());
  }

  #[test]
  fn test_microphone_skips_block_when_underfed() {
    let graph = MixGraph::new(44_100, BLOCK);
    let input = new_mic_input();
    graph.attach_microphone_input(0, input.clone(), false);
    graph.connect_microphone(0);

    feed(&input, 0.5, BLOCK / 2);
    let out = render_block(&graph);
    assert!(out.iter().all(|s| *s == 0.0));
    assert_eq!(input.lock().len(), BLOCK / 2);
  }

  #[test]
  fn test_microphone_chains_are_independent() {
    let graph = MixGraph::new(44_100, BLOCK);
    let first = new_mic_input();
    let second = new_mic_input();
    graph.attach_microphone_input(0, first.clone(), false);
    graph.attach_microphone_input(1, second.clone(), false);
    graph.set_microphone_volume(0, 100.0);
    graph.set_microphone_volume(1, 100.0);
    graph.connect_microphone(1);

    feed(&first, 0.3, BLOCK);
    feed(&second, 0.2, BLOCK);
    let out = render_block(&graph);
    assert!(out.iter().all(|s| (s - 0.2).abs() < 1e-6));
  }

  #[test]
  fn test_reverb_send_adds_wet_signal() {
    let graph = MixGraph::new(44_100, BLOCK);
    graph.install_reverb(&[1.0]).unwrap();
    assert!(graph.has_reverb());

    let input = new_mic_input();
    graph.attach_microphone_input(0, input.clone(), false);
    graph.set_microphone_volume(0, 100.0);
    graph.set_reverb_volume(0, 50.0);
    graph.connect_reverb_send(0);

    feed(&input, 0.4, BLOCK);
    let out = render_block(&graph);
    // Dry path disconnected, only the send is audible
    assert!(out.iter().all(|s| (s - 0.2).abs() < 1e-4));
  }

  #[test]
  fn test_master_gain_scales_everything() {
    let graph = MixGraph::new(44_100, BLOCK);
    let input = new_mic_input();
    graph.attach_microphone_input(0, input.clone(), false);
    graph.set_microphone_volume(0, 100.0);
    graph.connect_microphone(0);
    graph.set_volume(50.0);

    feed(&input, 0.8, BLOCK);
    let out = render_block(&graph);
    assert!(out.iter().all(|s| (s - 0.4).abs() < 1e-6));
  }

  #[test]
  fn test_end_of_source_is_reported_once() {
    let graph = MixGraph::new(44_100, BLOCK);
    graph.set_source(Some(TimeStretchSource::new(sine_buffer(440.0, 0.05)).unwrap()));
    graph.connect(Edge::Song);

    let mut ended = false;
    for _ in 0..100 {
      render_block(&graph);
      if graph.take_ended() {
        ended = true;
        break;
      }
    }
    assert!(ended);
    render_block(&graph);
    assert!(!graph.take_ended());
  }
}
