//! Per-link sample-rate conversion and gain
//!
//! A [`Mixer`] pulls frames from a source window (raw bytes in the source
//! sample format) and writes or accumulates interleaved f32 frames into a
//! destination buffer. Source positions are fixed point, see
//! [`crate::domain::filter`].
//!
//! The per-link mutable state lives in [`Bookkeeping`]:
//! - the mixer itself, absent until both endpoint formats are known
//! - the link gain, shared with the request side
//! - the source step (integer step plus rate modulo and denominator)
//! - the timeline transforms and the generation ids they were built from

use crate::domain::audio::StreamFormat;
use crate::domain::filter::{
    Filter, FilterKind, Resampler, DEFAULT_LINEAR_RATIO_THRESHOLD, FRAC_BITS, FRAC_MASK,
};
use crate::domain::gain::Gain;
use crate::domain::timeline::TimelineFunction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Generation id that never matches a snapshot or mapping
pub const INVALID_GENERATION_ID: u32 = 0;

/// Resampler choice parameters shared by every link
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerSettings {
    pub resampler: Resampler,
    pub linear_ratio_threshold: f64,
}

impl Default for MixerSettings {
    fn default() -> Self {
        Self {
            resampler: Resampler::Default,
            linear_ratio_threshold: DEFAULT_LINEAR_RATIO_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelMap {
    Identity,
    /// Mono source fanned out to every destination channel
    Duplicate,
    /// Stereo source folded down to mono
    Average,
}

impl ChannelMap {
    fn select(source_channels: u32, dest_channels: u32) -> Option<Self> {
        match (source_channels, dest_channels) {
            (s, d) if s == d => Some(ChannelMap::Identity),
            (1, _) => Some(ChannelMap::Duplicate),
            (2, 1) => Some(ChannelMap::Average),
            _ => None,
        }
    }
}

/// Fixed-point source stepping for one destination frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStep {
    /// Whole fractional units advanced per destination frame
    pub step_size: i64,
    /// Remainder of the exact step, in units of `1 / denominator`
    pub rate_modulo: u64,
    pub denominator: u64,
    /// Accumulated remainder, always below `denominator`
    pub src_pos_modulo: u64,
}

impl SourceStep {
    #[inline]
    fn advance(&mut self, frac_source_offset: &mut i64) {
        *frac_source_offset += self.step_size;
        if self.denominator == 0 {
            return;
        }
        self.src_pos_modulo += self.rate_modulo;
        if self.src_pos_modulo >= self.denominator {
            *frac_source_offset += 1;
            self.src_pos_modulo -= self.denominator;
        }
    }
}

/// Resampling mixer for a single source/destination pair
#[derive(Debug)]
pub struct Mixer {
    filter: Filter,
    source_format: StreamFormat,
    dest_channels: usize,
    channel_map: ChannelMap,
    /// Tail of the previous source window, interleaved
    history: Vec<f32>,
    history_frames: usize,
    frame: Vec<f32>,
}

impl Mixer {
    /// Pick a mixer for a source and destination format
    ///
    /// Returns `None` for channel layouts the mixer cannot map.
    pub fn select(
        source: &StreamFormat,
        dest: &StreamFormat,
        settings: &MixerSettings,
    ) -> Option<Self> {
        let Some(channel_map) = ChannelMap::select(source.channels, dest.channels) else {
            debug!(
                source_channels = source.channels,
                dest_channels = dest.channels,
                "No channel mapping for mixer"
            );
            return None;
        };
        if source.frames_per_second == 0 || dest.frames_per_second == 0 {
            return None;
        }

        let kind = FilterKind::select(
            source.frames_per_second,
            dest.frames_per_second,
            settings.resampler,
            settings.linear_ratio_threshold,
        );
        let filter = Filter::new(kind, source.frames_per_second, dest.frames_per_second);
        let history_frames = filter.neg_frames();
        let source_channels = source.channels as usize;

        Some(Self {
            filter,
            source_format: *source,
            dest_channels: dest.channels as usize,
            channel_map,
            history: vec![0.0; history_frames * source_channels],
            history_frames,
            frame: vec![0.0; source_channels],
        })
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn source_format(&self) -> &StreamFormat {
        &self.source_format
    }

    pub fn pos_width(&self) -> i64 {
        self.filter.pos_width()
    }

    pub fn neg_width(&self) -> i64 {
        self.filter.neg_width()
    }

    /// Forget the previous source window
    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|s| *s = 0.0);
    }

    /// Produce destination frames from one source window
    ///
    /// Stops when the destination is full or the next source position would
    /// need frames past the end of the window. Returns true when the window
    /// was consumed, in which case its tail becomes history for the next call.
    #[allow(clippy::too_many_arguments)]
    pub fn mix(
        &mut self,
        dest: &mut [f32],
        dest_frames: usize,
        dest_offset: &mut usize,
        source: &[u8],
        frac_source_frames: i64,
        frac_source_offset: &mut i64,
        accumulate: bool,
        gain: &Gain,
        step: &mut SourceStep,
    ) -> bool {
        let source_channels = self.source_format.channels as usize;
        let bytes_per_sample = self.source_format.sample_format.bytes_per_sample();
        let bytes_per_frame = bytes_per_sample * source_channels;
        let source_frames = (source.len() / bytes_per_frame.max(1)) as i64;
        let src_end = frac_source_frames - self.filter.pos_width() - 1;
        let dest_frames = dest_frames.min(dest.len() / self.dest_channels.max(1));

        let gain_db = gain.gain_db();
        let silent = gain.is_silent();
        let unity = gain.is_unity();
        let scale = gain.scale();

        let Self {
            filter,
            source_format,
            dest_channels,
            channel_map,
            history,
            history_frames,
            frame,
        } = self;
        let dest_channels = *dest_channels;
        let history_frames = *history_frames as i64;
        let sample_format = source_format.sample_format;

        trace!(
            dest_offset = *dest_offset,
            dest_frames,
            frac_source_offset = *frac_source_offset,
            frac_source_frames,
            gain_db,
            "Mixing source window"
        );

        while *dest_offset < dest_frames && *frac_source_offset <= src_end {
            let out = &mut dest[*dest_offset * dest_channels..(*dest_offset + 1) * dest_channels];

            if silent {
                if !accumulate {
                    out.iter_mut().for_each(|s| *s = 0.0);
                }
            } else {
                let center = *frac_source_offset >> FRAC_BITS;
                let frac = *frac_source_offset & FRAC_MASK;

                for (channel, value) in frame.iter_mut().enumerate() {
                    let read = |index: i64| -> f32 {
                        if index < 0 {
                            let h = history_frames + index;
                            if h < 0 {
                                0.0
                            } else {
                                history[h as usize * source_channels + channel]
                            }
                        } else if index < source_frames {
                            let at = index as usize * bytes_per_frame + channel * bytes_per_sample;
                            sample_format.decode(&source[at..at + bytes_per_sample])
                        } else {
                            0.0
                        }
                    };
                    *value = filter.compute_sample(frac, center, read);
                }

                for (d, slot) in out.iter_mut().enumerate() {
                    let mut sample = match channel_map {
                        ChannelMap::Identity => frame[d],
                        ChannelMap::Duplicate => frame[0],
                        ChannelMap::Average => (frame[0] + frame[1]) * 0.5,
                    };
                    if !unity {
                        sample *= scale;
                    }
                    if accumulate {
                        *slot += sample;
                    } else {
                        *slot = sample;
                    }
                }
            }

            *dest_offset += 1;
            step.advance(frac_source_offset);
        }

        let consumed = *frac_source_offset > src_end;
        if consumed {
            Self::update_history(
                history,
                history_frames as usize,
                source,
                source_frames as usize,
                source_channels,
                bytes_per_sample,
                sample_format,
            );
        }
        consumed
    }

    fn update_history(
        history: &mut [f32],
        history_frames: usize,
        source: &[u8],
        source_frames: usize,
        channels: usize,
        bytes_per_sample: usize,
        sample_format: crate::domain::audio::SampleFormat,
    ) {
        let keep = source_frames.min(history_frames);
        // Older history slides down when the window is shorter than the tail.
        history.copy_within(keep * channels.., 0);

        let first = source_frames - keep;
        let base = (history_frames - keep) * channels;
        for f in 0..keep {
            for c in 0..channels {
                let at = ((first + f) * channels + c) * bytes_per_sample;
                history[base + f * channels + c] =
                    sample_format.decode(&source[at..at + bytes_per_sample]);
            }
        }
    }
}

/// Mutable per-link mixing state
#[derive(Debug)]
pub struct Bookkeeping {
    pub mixer: Option<Mixer>,
    pub gain: Arc<Gain>,
    pub step: SourceStep,
    pub dest_frames_to_frac_source_frames: TimelineFunction,
    pub clock_mono_to_frac_source_frames: TimelineFunction,
    pub dest_trans_gen_id: u32,
    pub source_trans_gen_id: u32,
}

impl Bookkeeping {
    pub fn new(gain: Arc<Gain>) -> Self {
        Self {
            mixer: None,
            gain,
            step: SourceStep::default(),
            dest_frames_to_frac_source_frames: TimelineFunction::default(),
            clock_mono_to_frac_source_frames: TimelineFunction::default(),
            dest_trans_gen_id: INVALID_GENERATION_ID,
            source_trans_gen_id: INVALID_GENERATION_ID,
        }
    }

    pub fn has_mixer(&self) -> bool {
        self.mixer.is_some()
    }

    /// Drop source position state after a discontinuity
    pub fn reset_positions(&mut self) {
        self.step.src_pos_modulo = 0;
        if let Some(mixer) = self.mixer.as_mut() {
            mixer.reset();
        }
    }

    /// Force the transforms to be rebuilt on the next pass
    pub fn invalidate_transforms(&mut self) {
        self.dest_trans_gen_id = INVALID_GENERATION_ID;
        self.source_trans_gen_id = INVALID_GENERATION_ID;
    }

    /// Mix through this link's mixer; without one nothing is consumed
    #[allow(clippy::too_many_arguments)]
    pub fn mix(
        &mut self,
        dest: &mut [f32],
        dest_frames: usize,
        dest_offset: &mut usize,
        source: &[u8],
        frac_source_frames: i64,
        frac_source_offset: &mut i64,
        accumulate: bool,
    ) -> bool {
        let Self {
            mixer, gain, step, ..
        } = self;
        let Some(mixer) = mixer.as_mut() else {
            return false;
        };
        mixer.mix(
            dest,
            dest_frames,
            dest_offset,
            source,
            frac_source_frames,
            frac_source_offset,
            accumulate,
            gain,
            step,
        )
    }
}
