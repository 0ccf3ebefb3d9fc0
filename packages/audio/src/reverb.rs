//! Convolution reverb
//!
//! Uniformly partitioned overlap-save convolution: the impulse response is
//! split into `block_size` partitions, each transformed once up front, and
//! every input block is convolved against all of them through a
//! frequency-domain delay line. Latency is zero; input is processed in
//! whole blocks.

use std::collections::VecDeque;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::error::{EngineError, Result};

pub struct ConvolutionReverb {
  block_size: usize,
  fft_size: usize,
  forward: Arc<dyn Fft<f32>>,
  inverse: Arc<dyn Fft<f32>>,
  /// Spectra of the impulse response partitions
  partitions: Vec<Vec<Complex<f32>>>,
  /// Spectra of past input windows, newest first
  delay_line: VecDeque<Vec<Complex<f32>>>,
  /// Previous block followed by the current block
  window: Vec<f32>,
  accumulator: Vec<Complex<f32>>,
  scratch: Vec<Complex<f32>>,
}

impl ConvolutionReverb {
  pub fn new(impulse: &[f32], block_size: usize) -> Result<Self> {
    if impulse.is_empty() {
      return Err(EngineError::InvalidBuffer("impulse response is empty".to_string()));
    }
    if block_size == 0 {
      return Err(EngineError::InvalidBuffer("block size must be non-zero".to_string()));
    }

    let fft_size = block_size * 2;
    let mut planner = FftPlanner::<f32>::new();
    let forward = planner.plan_fft_forward(fft_size);
    let inverse = planner.plan_fft_inverse(fft_size);

    let partitions: Vec<Vec<Complex<f32>>> = impulse
      .chunks(block_size)
      .map(|part| {
        let mut spectrum = vec![Complex::new(0.0, 0.0); fft_size];
        for (bin, sample) in spectrum.iter_mut().zip(part) {
          bin.re = *sample;
        }
        forward.process(&mut spectrum);
        spectrum
      })
      .collect();

    let delay_line = (0..partitions.len())
      .map(|_| vec![Complex::new(0.0, 0.0); fft_size])
      .collect();

    Ok(Self {
      block_size,
      fft_size,
      forward,
      inverse,
      partitions,
      delay_line,
      window: vec![0.0; fft_size],
      accumulator: vec![Complex::new(0.0, 0.0); fft_size],
      scratch: vec![Complex::new(0.0, 0.0); fft_size],
    })
  }

  /// Build from an impulse scaled to unit energy
  pub fn normalized(impulse: &[f32], block_size: usize) -> Result<Self> {
    let energy: f32 = impulse.iter().map(|s| s * s).sum::<f32>().sqrt();
    if energy <= f32::EPSILON {
      return Err(EngineError::InvalidBuffer("impulse response is silent".to_string()));
    }
    let scaled: Vec<f32> = impulse.iter().map(|s| s / energy).collect();
    Self::new(&scaled, block_size)
  }

  pub fn block_size(&self) -> usize {
    self.block_size
  }

  /// Convolve `input` into `output` (mono, same length)
  ///
  /// Lengths must be a multiple of the block size; a trailing partial block
  /// is written as silence.
  pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
    let len = input.len().min(output.len());
    let whole = len - len % self.block_size;

    for (inp, out) in input[..whole]
      .chunks_exact(self.block_size)
      .zip(output[..whole].chunks_exact_mut(self.block_size))
    {
      self.process_block(inp, out);
    }
    output[whole..len].fill(0.0);
  }

  fn process_block(&mut self, input: &[f32], output: &mut [f32]) {
    let b = self.block_size;

    self.window.copy_within(b.., 0);
    self.window[b..].copy_from_slice(input);

    // Recycle the oldest spectrum as the newest
    let mut spectrum = self
      .delay_line
      .pop_back()
      .unwrap_or_else(|| vec![Complex::new(0.0, 0.0); self.fft_size]);
    for (bin, sample) in spectrum.iter_mut().zip(self.window.iter()) {
      *bin = Complex::new(*sample, 0.0);
    }
    self.forward.process(&mut spectrum);
    self.delay_line.push_front(spectrum);

    self.accumulator.fill(Complex::new(0.0, 0.0));
    for (x, h) in self.delay_line.iter().zip(self.partitions.iter()) {
      for ((acc, xv), hv) in self.accumulator.iter_mut().zip(x).zip(h) {
        *acc += xv * hv;
      }
    }

    self.scratch.copy_from_slice(&self.accumulator);
    self.inverse.process(&mut self.scratch);

    let scale = 1.0 / self.fft_size as f32;
    for (out, bin) in output.iter_mut().zip(&self.scratch[b..]) {
      *out = bin.re * scale;
    }
  }

  pub fn reset(&mut self) {
    self.window.fill(0.0);
    for spectrum in self.delay_line.iter_mut() {
      spectrum.fill(Complex::new(0.0, 0.0));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_unit_impulse_is_identity() {
    let mut reverb = ConvolutionReverb::new(&[1.0], 64).unwrap();
    let input: Vec<f32> = (0..256).map(|i| ((i * 7) % 13) as f32 / 13.0 - 0.5).collect();
    let mut output = vec![0.0; 256];
    reverb.process(&input, &mut output);

    for (a, b) in input.iter().zip(output.iter()) {
      assert!((a - b).abs() < 1e-4);
    }
  }

  #[test]
  fn test_delay_across_partitions() {
    let block = 32;
    let delay = block * 2 + 5;
    let mut impulse = vec![0.0; delay + 1];
    impulse[delay] = 0.5;

    let mut reverb = ConvolutionReverb::new(&impulse, block).unwrap();
    let mut input = vec![0.0; block * 6];
    input[3] = 1.0;
    let mut output = vec![0.0; block * 6];
    reverb.process(&input, &mut output);

    for (i, sample) in output.iter().enumerate() {
      let expected = if i == 3 + delay { 0.5 } else { 0.0 };
      assert!((sample - expected).abs() < 1e-4, "sample {} = {}", i, sample);
    }
  }

  #[test]
  fn test_tail_continues_into_later_blocks() {
    let block = 16;
    let impulse = vec![0.25; block * 3];
    let mut reverb = ConvolutionReverb::new(&impulse, block).unwrap();

    let mut first = vec![0.0; block];
    first[0] = 1.0;
    let mut out = vec![0.0; block];
    reverb.process(&first, &mut out);
    assert!((out[0] - 0.25).abs() < 1e-4);

    let silence = vec![0.0; block];
    reverb.process(&silence, &mut out);
    reverb.process(&silence, &mut out);
    assert!(out.iter().all(|s| (s - 0.25).abs() < 1e-4));

    reverb.process(&silence, &mut out);
    assert!(out.iter().all(|s| s.abs() < 1e-4));
  }

  #[test]
  fn test_partial_block_is_silenced() {
    let mut reverb = ConvolutionReverb::new(&[1.0], 8).unwrap();
    let input = vec![1.0; 12];
    let mut output = vec![9.0; 12];
    reverb.process(&input, &mut output);
    assert!(output[8..].iter().all(|s| *s == 0.0));
  }

  #[test]
  fn test_empty_or_silent_impulse_is_rejected() {
    assert!(ConvolutionReverb::new(&[], 64).is_err());
    assert!(ConvolutionReverb::normalized(&[0.0; 16], 64).is_err());
  }

  #[test]
  fn test_normalized_impulse_has_unit_energy() {
    let mut reverb = ConvolutionReverb::normalized(&[3.0, 4.0], 4).unwrap();
    let mut out = vec![0.0; 4];
    reverb.process(&[1.0, 0.0, 0.0, 0.0], &mut out);
    assert!((out[0] - 0.6).abs() < 1e-4);
    assert!((out[1] - 0.8).abs() < 1e-4);
  }
}
