//! Transport and musical time state.

use serde::{Deserialize, Serialize};

/// Bar/beat/tick position, valid only while the transport provides one.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransportBbt {
    pub bar: i32,
    pub beat: i32,
    pub tick: f64,
    pub bar_start_tick: f64,
    pub beats_per_bar: f32,
    pub beat_type: f32,
    pub ticks_per_beat: f64,
    pub beats_per_minute: f64,
}

impl Default for TransportBbt {
    fn default() -> Self {
        Self {
            bar: 1,
            beat: 1,
            tick: 0.0,
            bar_start_tick: 0.0,
            beats_per_bar: 4.0,
            beat_type: 4.0,
            ticks_per_beat: 1920.0,
            beats_per_minute: 120.0,
        }
    }
}

/// Transport snapshot observed by one audio cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportInfo {
    pub playing: bool,
    pub frame: u64,
    pub bbt: Option<TransportBbt>,
}

impl TransportInfo {
    /// Advances an internally-driven transport by one cycle and rederives
    /// the musical position from tempo.
    pub fn advance(&mut self, frames: u32, sample_rate: f64) {
        if !self.playing {
            return;
        }
        self.frame += frames as u64;
        if let Some(bbt) = &mut self.bbt {
            let seconds = self.frame as f64 / sample_rate;
            let total_beats = seconds * bbt.beats_per_minute / 60.0;
            let beats_per_bar = bbt.beats_per_bar.max(1.0) as f64;
            let bar = (total_beats / beats_per_bar).floor();
            let beat_in_bar = total_beats - bar * beats_per_bar;
            bbt.bar = bar as i32 + 1;
            bbt.beat = beat_in_bar.floor() as i32 + 1;
            bbt.tick = (beat_in_bar - beat_in_bar.floor()) * bbt.ticks_per_beat;
            bbt.bar_start_tick = bar * beats_per_bar * bbt.ticks_per_beat;
        }
    }

    pub fn relocate(&mut self, frame: u64) {
        self.frame = frame;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_tracks_bars_at_fixed_tempo() {
        let mut info = TransportInfo {
            playing: true,
            frame: 0,
            bbt: Some(TransportBbt::default()),
        };
        // 120 bpm, 4/4: one bar lasts two seconds.
        info.advance(96_000, 48_000.0);
        let bbt = info.bbt.unwrap();
        assert_eq!(bbt.bar, 2);
        assert_eq!(bbt.beat, 1);
    }

    #[test]
    fn paused_transport_does_not_move() {
        let mut info = TransportInfo::default();
        info.advance(512, 48_000.0);
        assert_eq!(info.frame, 0);
    }
}
