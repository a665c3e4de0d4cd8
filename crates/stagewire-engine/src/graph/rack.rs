//! Rack mode: a fixed stereo chain processed in plugin-table order.

use std::sync::Arc;

use stagewire_rt::{EventQueue, TransportInfo};

use crate::plugin::Plugin;

/// The running stereo buffer ping-pongs between two pairs so a plugin never
/// sees its own output buffer as input.
pub struct RackGraph {
    front: [Vec<f32>; 2],
    back: [Vec<f32>; 2],
}

impl RackGraph {
    pub fn new(buffer_size: u32) -> Self {
        let frames = buffer_size as usize;
        Self {
            front: [vec![0.0; frames], vec![0.0; frames]],
            back: [vec![0.0; frames], vec![0.0; frames]],
        }
    }

    pub fn set_buffer_size(&mut self, frames: u32) {
        let frames = frames as usize;
        for buf in self.front.iter_mut().chain(self.back.iter_mut()) {
            buf.clear();
            buf.resize(frames, 0.0);
        }
    }

    /// Processes the chain. With no enabled plugins the inputs pass through
    /// bit-exact and inbound MIDI is forwarded verbatim.
    pub fn process(
        &mut self,
        plugins: &[Arc<Plugin>],
        audio_in: &[&[f32]],
        audio_out: &mut [&mut [f32]],
        events_in: &EventQueue,
        events_out: &mut EventQueue,
        time: &TransportInfo,
        frames: u32,
    ) {
        let nframes = frames as usize;
        let active: Vec<&Arc<Plugin>> = plugins.iter().filter(|p| p.is_enabled()).collect();

        if active.is_empty() {
            for (out, input) in audio_out.iter_mut().zip(audio_in.iter()) {
                out[..nframes].copy_from_slice(&input[..nframes]);
            }
            for out in audio_out.iter_mut().skip(audio_in.len()) {
                out[..nframes].fill(0.0);
            }
            for event in events_in.as_slice() {
                events_out.push(*event);
            }
            return;
        }

        // Seed the running buffer; a mono host input feeds both channels.
        for channel in 0..2 {
            let source = audio_in.get(channel).or_else(|| audio_in.first());
            match source {
                Some(input) => self.front[channel][..nframes].copy_from_slice(&input[..nframes]),
                None => self.front[channel][..nframes].fill(0.0),
            }
        }

        for plugin in active {
            {
                let (front, back) = (&self.front, &mut self.back);
                let ins: [&[f32]; 2] = [&front[0][..nframes], &front[1][..nframes]];
                let [back0, back1] = back;
                let mut outs: [&mut [f32]; 2] =
                    [&mut back0[..nframes], &mut back1[..nframes]];
                plugin.process_rt(
                    &ins,
                    &mut outs,
                    &[],
                    &mut [],
                    events_in.as_slice(),
                    events_out,
                    time,
                    frames,
                );
            }
            std::mem::swap(&mut self.front, &mut self.back);
        }

        for (channel, out) in audio_out.iter_mut().enumerate() {
            let source = &self.front[channel.min(1)];
            out[..nframes].copy_from_slice(&source[..nframes]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::adapter::GainAdapter;
    use crate::plugin::{Backend, PluginType};

    fn gain(id: u32, value: f32) -> Arc<Plugin> {
        let plugin = Plugin::new(
            id,
            PluginType::Internal,
            "gain",
            "",
            "gain",
            Backend::Local(Box::new(GainAdapter::stereo())),
            64,
        );
        plugin.reload(false, false);
        plugin.set_active(true);
        plugin.set_parameter_value(0, value);
        Arc::new(plugin)
    }

    fn run(rack: &mut RackGraph, plugins: &[Arc<Plugin>], input: &[f32]) -> Vec<f32> {
        let in_r = input.to_vec();
        let ins: Vec<&[f32]> = vec![input, &in_r];
        let mut out_l = vec![0.0f32; input.len()];
        let mut out_r = vec![0.0f32; input.len()];
        let mut events_out = EventQueue::new();
        {
            let mut outs: Vec<&mut [f32]> = vec![&mut out_l, &mut out_r];
            rack.process(
                plugins,
                &ins,
                &mut outs,
                &EventQueue::new(),
                &mut events_out,
                &TransportInfo::default(),
                input.len() as u32,
            );
        }
        out_l
    }

    #[test]
    fn empty_rack_is_identity() {
        let mut rack = RackGraph::new(256);
        let input: Vec<f32> = (0..256)
            .map(|k| (2.0 * std::f32::consts::PI * 440.0 * k as f32 / 48_000.0).sin())
            .collect();
        let out = run(&mut rack, &[], &input);
        assert_eq!(out, input);
    }

    #[test]
    fn empty_rack_forwards_midi() {
        let mut rack = RackGraph::new(64);
        let mut events_in = EventQueue::new();
        events_in.push(stagewire_rt::EngineEvent::from_midi(3, 0, &[0x90, 60, 100]));
        let input = vec![0.0f32; 64];
        let ins: Vec<&[f32]> = vec![&input, &input];
        let mut out_l = vec![0.0f32; 64];
        let mut out_r = vec![0.0f32; 64];
        let mut outs: Vec<&mut [f32]> = vec![&mut out_l, &mut out_r];
        let mut events_out = EventQueue::new();
        rack.process(
            &[],
            &ins,
            &mut outs,
            &events_in,
            &mut events_out,
            &TransportInfo::default(),
            64,
        );
        assert_eq!(events_out.len(), 1);
        assert_eq!(events_out.as_slice()[0], events_in.as_slice()[0]);
    }

    #[test]
    fn chain_applies_plugins_in_table_order() {
        let mut rack = RackGraph::new(64);
        let plugins = vec![gain(0, 0.5), gain(1, 0.5)];
        let out = run(&mut rack, &plugins, &[1.0f32; 64]);
        assert!(out.iter().all(|s| (*s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn disabled_plugins_are_skipped() {
        let mut rack = RackGraph::new(64);
        let enabled = gain(0, 0.5);
        let disabled = gain(1, 0.0);
        disabled.set_enabled(false);
        let out = run(&mut rack, &[enabled, disabled], &[1.0f32; 64]);
        assert!(out.iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }
}
