//! Fixed-cadence re-chunking of capture buffers.

use std::time::Instant;

use crate::events::AudioChunk;

/// Accumulates arbitrarily sized capture buffers and cuts them into
/// fixed-duration chunks with per-chunk RMS energy.
pub struct Chunker {
    sample_rate: u32,
    samples_per_chunk: usize,
    pending: Vec<i16>,
    sequence: u64,
}

impl Chunker {
    pub fn new(sample_rate: u32, samples_per_chunk: usize) -> Self {
        Self {
            sample_rate,
            samples_per_chunk: samples_per_chunk.max(1),
            pending: Vec::new(),
            sequence: 0,
        }
    }

    /// Feed one capture buffer; returns every chunk it completed.
    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioChunk> {
        self.pending.extend_from_slice(samples);
        let mut chunks = Vec::new();
        while self.pending.len() >= self.samples_per_chunk {
            let samples: Vec<i16> = self.pending.drain(..self.samples_per_chunk).collect();
            let energy = rms_energy(&samples);
            chunks.push(AudioChunk {
                samples,
                sample_rate: self.sample_rate,
                sequence: self.sequence,
                captured_at: Instant::now(),
                energy,
            });
            self.sequence += 1;
        }
        chunks
    }
}

/// RMS energy of 16-bit samples, normalized to \[0, 1\].
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let x = f64::from(s) / 32768.0;
            x * x
        })
        .sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}
