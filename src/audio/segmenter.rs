//! Energy-based utterance segmentation with hysteresis.

use tracing::{debug, warn};

use crate::config::VadConfig;
use crate::events::{AudioChunk, Payload, UtteranceId};

enum Phase {
    Silence,
    Speech {
        utterance: UtteranceId,
        voiced_ms: u32,
        trailing_silence_ms: u32,
    },
}

/// Walks chunk energies and produces utterance boundary events.
///
/// Voiced classification uses two thresholds: a chunk must exceed the rising
/// threshold to open an utterance, but only the lower falling threshold to
/// keep one open, so energy hovering near the boundary does not chatter.
/// An open utterance closes once trailing silence reaches the hangover
/// window. Sustained zero-energy input (a dead or muted capture path) is
/// reported as a `NoSignalWarning` every `no_signal_chunks` chunks for as
/// long as the silent run persists, with the running chunk count attached.
pub struct Segmenter {
    config: VadConfig,
    phase: Phase,
    next_utterance: u64,
    zero_run: u32,
}

impl Segmenter {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            phase: Phase::Silence,
            next_utterance: 1,
            zero_run: 0,
        }
    }

    /// Classify one chunk; returns the events it produced, in order.
    pub fn process(&mut self, chunk: &AudioChunk) -> Vec<Payload> {
        let mut out = Vec::new();
        let chunk_ms = chunk.duration_ms();

        if chunk.energy <= self.config.no_signal_floor {
            self.zero_run = self.zero_run.saturating_add(1);
            if self.config.no_signal_chunks > 0
                && self.zero_run % self.config.no_signal_chunks == 0
            {
                if self.zero_run == self.config.no_signal_chunks {
                    warn!(
                        "no capture signal for {} consecutive chunks",
                        self.zero_run
                    );
                } else {
                    debug!("capture still silent after {} chunks", self.zero_run);
                }
                out.push(Payload::NoSignalWarning {
                    zero_chunks: self.zero_run,
                });
            }
        } else if self.zero_run > 0 {
            self.zero_run = 0;
        }

        let voiced = match &self.phase {
            Phase::Silence => chunk.energy >= self.config.rising_threshold,
            Phase::Speech { .. } => chunk.energy >= self.config.falling_threshold,
        };

        match &mut self.phase {
            Phase::Silence => {
                if voiced {
                    let utterance = UtteranceId::new(self.next_utterance);
                    self.next_utterance += 1;
                    debug!("utterance {utterance} opened (energy {:.4})", chunk.energy);
                    out.push(Payload::UtteranceOpened { utterance });
                    out.push(Payload::SpeechFrames {
                        utterance,
                        voiced_ms: chunk_ms,
                    });
                    self.phase = Phase::Speech {
                        utterance,
                        voiced_ms: chunk_ms,
                        trailing_silence_ms: 0,
                    };
                }
            }
            Phase::Speech {
                utterance,
                voiced_ms,
                trailing_silence_ms,
            } => {
                if voiced {
                    *voiced_ms += chunk_ms;
                    *trailing_silence_ms = 0;
                    out.push(Payload::SpeechFrames {
                        utterance: *utterance,
                        voiced_ms: *voiced_ms,
                    });
                } else {
                    *trailing_silence_ms += chunk_ms;
                    if *trailing_silence_ms >= self.config.hangover_ms {
                        debug!("utterance {utterance} closed after {voiced_ms} voiced ms");
                        out.push(Payload::UtteranceClosed {
                            utterance: *utterance,
                            voiced_ms: *voiced_ms,
                        });
                        self.phase = Phase::Silence;
                    }
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::time::Instant;

    fn chunk(sequence: u64, energy: f32) -> AudioChunk {
        AudioChunk {
            samples: vec![0; 1600],
            sample_rate: 16_000,
            sequence,
            captured_at: Instant::now(),
            energy,
        }
    }

    fn feed(segmenter: &mut Segmenter, energies: &[f32]) -> Vec<Payload> {
        let mut out = Vec::new();
        for (i, &energy) in energies.iter().enumerate() {
            out.extend(segmenter.process(&chunk(i as u64, energy)));
        }
        out
    }

    #[test]
    fn sub_threshold_audio_never_opens_an_utterance() {
        let mut segmenter = Segmenter::new(VadConfig::default());
        // Includes values above the falling threshold but below the rising one.
        let events = feed(&mut segmenter, &[0.001, 0.009, 0.0085, 0.0, 0.0099, 0.002]);
        assert!(
            !events
                .iter()
                .any(|p| matches!(p, Payload::UtteranceOpened { .. })),
            "events: {events:?}"
        );
    }

    #[test]
    fn no_signal_warning_repeats_on_cadence_with_running_count() {
        let config = VadConfig {
            no_signal_chunks: 5,
            ..VadConfig::default()
        };
        let mut segmenter = Segmenter::new(config);

        let events = feed(&mut segmenter, &[0.0; 4]);
        assert!(events.is_empty());

        let events = feed(&mut segmenter, &[0.0]);
        assert!(matches!(
            events.as_slice(),
            [Payload::NoSignalWarning { zero_chunks: 5 }]
        ));

        // Run persists: one warning per cadence interval, count growing.
        let events = feed(&mut segmenter, &[0.0; 10]);
        let counts: Vec<u32> = events
            .iter()
            .filter_map(|p| match p {
                Payload::NoSignalWarning { zero_chunks } => Some(*zero_chunks),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![10, 15]);

        // Signal returns, then goes dead again: the count restarts.
        feed(&mut segmenter, &[0.005]);
        let events = feed(&mut segmenter, &[0.0; 5]);
        assert!(matches!(
            events.as_slice(),
            [Payload::NoSignalWarning { zero_chunks: 5 }]
        ));
    }

    #[test]
    fn speech_then_silence_produces_one_closed_utterance() {
        let mut segmenter = Segmenter::new(VadConfig::default());

        // 10 voiced chunks (1 s), then 6 s of silence.
        let mut energies = vec![0.05; 10];
        energies.extend(vec![0.0; 60]);
        let events = feed(&mut segmenter, &energies);

        let opened: Vec<_> = events
            .iter()
            .filter(|p| matches!(p, Payload::UtteranceOpened { .. }))
            .collect();
        assert_eq!(opened.len(), 1);

        let closed: Vec<_> = events
            .iter()
            .filter_map(|p| match p {
                Payload::UtteranceClosed {
                    utterance,
                    voiced_ms,
                } => Some((*utterance, *voiced_ms)),
                _ => None,
            })
            .collect();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].1, 1000);

        let frames = events
            .iter()
            .filter(|p| matches!(p, Payload::SpeechFrames { .. }))
            .count();
        assert_eq!(frames, 10);
    }

    #[test]
    fn close_happens_at_hangover_not_before() {
        let config = VadConfig {
            hangover_ms: 500,
            ..VadConfig::default()
        };
        let mut segmenter = Segmenter::new(config);

        feed(&mut segmenter, &[0.05; 3]);
        // Four silent chunks (400 ms) keep the utterance open.
        let events = feed(&mut segmenter, &[0.0; 4]);
        assert!(events.is_empty());

        // Speech resumes into the same utterance.
        let events = feed(&mut segmenter, &[0.05]);
        assert!(matches!(
            events.as_slice(),
            [Payload::SpeechFrames { voiced_ms: 400, .. }]
        ));

        // Now a full hangover of silence closes it.
        let events = feed(&mut segmenter, &[0.0; 5]);
        assert!(matches!(
            events.as_slice(),
            [Payload::UtteranceClosed { voiced_ms: 400, .. }]
        ));
    }

    #[test]
    fn hysteresis_keeps_wavering_speech_open() {
        let mut segmenter = Segmenter::new(VadConfig::default());

        feed(&mut segmenter, &[0.05]);
        // 0.009 is below the rising threshold but above the falling one.
        let events = feed(&mut segmenter, &[0.009, 0.009]);
        assert_eq!(
            events
                .iter()
                .filter(|p| matches!(p, Payload::SpeechFrames { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn utterance_ids_are_monotonic() {
        let mut segmenter = Segmenter::new(VadConfig::default());

        let first = feed(&mut segmenter, &[0.05, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let second = feed(&mut segmenter, &[0.05, 0.0, 0.0, 0.0, 0.0, 0.0]);

        let id = |events: &[Payload]| {
            events.iter().find_map(|p| match p {
                Payload::UtteranceOpened { utterance } => Some(*utterance),
                _ => None,
            })
        };
        let (a, b) = (id(&first).unwrap(), id(&second).unwrap());
        assert!(b > a);
    }
}
