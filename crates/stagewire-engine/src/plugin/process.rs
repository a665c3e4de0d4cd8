//! The plugin handle's RT processing path.
//!
//! Every exit fills all outputs: computed audio on success, silence when the
//! plugin is disabled, inactive, contended or its bridge timed out.

use stagewire_rt::{
    ControlEvent, EngineEvent, EngineEventKind, EventQueue, PostRtEvent, PostRtEventKind,
    TransportInfo,
};

use super::{
    extra_hints, hints, plugin_options, Backend, Plugin, CC_BALANCE, CC_BREATH_DRYWET,
    CC_PAN_BALANCE, CC_VOLUME, PARAMETER_BALANCE_LEFT, PARAMETER_BALANCE_RIGHT, PARAMETER_DRYWET,
    PARAMETER_VOLUME,
};

fn zero_channels(channels: &mut [&mut [f32]], frames: usize) {
    for channel in channels.iter_mut() {
        let len = frames.min(channel.len());
        channel[..len].fill(0.0);
    }
}

fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

impl Plugin {
    /// Processes one cycle. Inputs/outputs are per-channel slices of at
    /// least `frames` samples; `events_in` is this cycle's inbound slice and
    /// `events_out` collects the plugin's outbound events.
    #[allow(clippy::too_many_arguments)]
    pub fn process_rt(
        &self,
        audio_in: &[&[f32]],
        audio_out: &mut [&mut [f32]],
        cv_in: &[&[f32]],
        cv_out: &mut [&mut [f32]],
        events_in: &[EngineEvent],
        events_out: &mut EventQueue,
        time: &TransportInfo,
        frames: u32,
    ) {
        let nframes = frames as usize;
        if !self.is_enabled() || !self.is_active() {
            zero_channels(audio_out, nframes);
            zero_channels(cv_out, nframes);
            return;
        }
        let Some(mut state) = self.process.try_lock() else {
            zero_channels(audio_out, nframes);
            zero_channels(cv_out, nframes);
            return;
        };
        let state = &mut *state;

        // Stash the inputs before the backend runs; the dry/wet stage needs
        // them even when the caller processes in place.
        for (stash, input) in state.dry.iter_mut().zip(audio_in.iter()) {
            stash[..nframes].copy_from_slice(&input[..nframes]);
        }

        self.gather_events(state, events_in, frames);

        match &mut state.backend {
            Backend::Local(adapter) => {
                let (_, backing_out) = adapter.audio_io();
                let backing_out = (backing_out as usize).min(audio_out.len());
                {
                    let (used, rest) = audio_out.split_at_mut(backing_out);
                    adapter.process(audio_in, used, &state.event_scratch, frames);
                    // Stereo coercion: a narrower backend feeds the spare
                    // outputs from its last channel.
                    if let Some(last) = used.last() {
                        for extra in rest.iter_mut() {
                            extra[..nframes].copy_from_slice(&last[..nframes]);
                        }
                    } else {
                        zero_channels(rest, nframes);
                    }
                }
                zero_channels(cv_out, nframes);
            }
            Backend::Bridged(transport) => {
                if transport.timed_out() {
                    zero_channels(audio_out, nframes);
                    zero_channels(cv_out, nframes);
                    return;
                }
                transport.write_time_info(time);
                for (slot, input) in audio_in.iter().chain(cv_in.iter()).enumerate() {
                    transport.pool_mut().write_input(slot as u32, &input[..nframes]);
                }
                for event in &state.event_scratch {
                    match event.kind {
                        EngineEventKind::Midi(data) => {
                            transport.rt_midi_event(event.time, data.port, data.bytes());
                        }
                        EngineEventKind::Control(ControlEvent::Parameter { param, value }) => {
                            transport.rt_control_event_parameter(
                                event.time,
                                event.channel,
                                param,
                                value,
                            );
                        }
                        EngineEventKind::Control(ControlEvent::MidiBank(bank)) => {
                            transport.rt_control_event_midi_bank(event.time, event.channel, bank);
                        }
                        EngineEventKind::Control(ControlEvent::MidiProgram(program)) => {
                            transport.rt_control_event_midi_program(
                                event.time,
                                event.channel,
                                program,
                            );
                        }
                        EngineEventKind::Control(ControlEvent::AllSoundOff) => {
                            transport.rt_control_event_all_sound_off(event.time, event.channel);
                        }
                        EngineEventKind::Control(ControlEvent::AllNotesOff) => {
                            transport.rt_control_event_all_notes_off(event.time, event.channel);
                        }
                    }
                }
                if transport.process_cycle(frames) {
                    for (slot, output) in audio_out.iter_mut().enumerate() {
                        transport.pool().read_output(slot as u32, &mut output[..nframes]);
                    }
                    for (slot, output) in cv_out.iter_mut().enumerate() {
                        let slot = (audio_out.len() + slot) as u32;
                        transport.pool().read_output(slot, &mut output[..nframes]);
                    }
                    transport.drain_midi_out(|time, bytes| {
                        // Oversized payloads never cross the output boundary.
                        if bytes.len() <= stagewire_rt::MAX_MIDI_BYTES {
                            events_out.push(EngineEvent::from_midi(time, 0, bytes));
                        }
                    });
                } else {
                    self.post_rt.append_rt(PostRtEvent {
                        kind: PostRtEventKind::ProcessTimedOut,
                        value1: 0,
                        value2: 0,
                        value3: 0,
                        valuef: 0.0,
                        send_callback_later: false,
                    });
                    zero_channels(audio_out, nframes);
                    zero_channels(cv_out, nframes);
                    return;
                }
            }
        }

        self.post_process(state, audio_in.len(), audio_out, nframes);

        self.store_peaks([
            audio_in.first().map(|c| peak(&c[..nframes])).unwrap_or(0.0),
            audio_in.get(1).map(|c| peak(&c[..nframes])).unwrap_or(0.0),
            audio_out.first().map(|c| peak(&c[..nframes])).unwrap_or(0.0),
            audio_out.get(1).map(|c| peak(&c[..nframes])).unwrap_or(0.0),
        ]);
    }

    /// Event-input phase: external notes first, then the cycle's queue.
    fn gather_events(
        &self,
        state: &mut super::ProcessState,
        events_in: &[EngineEvent],
        _frames: u32,
    ) {
        state.event_scratch.clear();
        let options = self.options();
        let hint_bits = self.hints();
        let extra = self.extra_hints();
        let ctrl_channel = self.ctrl_channel();
        let wants_midi = extra & extra_hints::HAS_MIDI_IN != 0;
        let mut notes_off_synthesized = false;

        while let Some(note) = self.ext_notes.pop() {
            let status = if note.velocity > 0 { 0x90 } else { 0x80 };
            let data = [status | (note.channel & 0x0F), note.note, note.velocity];
            state
                .event_scratch
                .push(EngineEvent::from_midi(0, 0, &data));
            self.track_note(state, note.channel, note.note, note.velocity, true);
        }

        for event in events_in {
            match event.kind {
                EngineEventKind::Control(ControlEvent::Parameter { param, value }) => {
                    if i32::from(event.channel) == ctrl_channel {
                        match param {
                            CC_BREATH_DRYWET if hint_bits & hints::CAN_DRYWET != 0 => {
                                let fixed = self.mix.set_dry_wet(value);
                                self.post_mix_change(PARAMETER_DRYWET, fixed);
                                continue;
                            }
                            CC_VOLUME if hint_bits & hints::CAN_VOLUME != 0 => {
                                let fixed = self.mix.set_volume(value * 127.0 / 100.0);
                                self.post_mix_change(PARAMETER_VOLUME, fixed);
                                continue;
                            }
                            CC_BALANCE | CC_PAN_BALANCE if hint_bits & hints::CAN_BALANCE != 0 => {
                                let centered = value * 2.0 - 1.0;
                                let (left, right) = super::split_balance(centered);
                                self.mix.set_balance_left(left);
                                self.mix.set_balance_right(right);
                                self.post_mix_change(PARAMETER_BALANCE_LEFT, left);
                                self.post_mix_change(PARAMETER_BALANCE_RIGHT, right);
                                continue;
                            }
                            _ => {}
                        }
                    }
                    if wants_midi && options & plugin_options::SEND_CONTROL_CHANGES != 0 {
                        state.event_scratch.push(*event);
                    }
                }
                EngineEventKind::Control(ControlEvent::MidiBank(_))
                | EngineEventKind::Control(ControlEvent::MidiProgram(_)) => {
                    if options & plugin_options::MAP_PROGRAM_CHANGES != 0 {
                        state.event_scratch.push(*event);
                        if let EngineEventKind::Control(ControlEvent::MidiProgram(program)) =
                            event.kind
                        {
                            self.post_rt.append_rt(PostRtEvent {
                                kind: PostRtEventKind::MidiProgramChanged,
                                value1: program as i32,
                                value2: 0,
                                value3: 0,
                                valuef: 0.0,
                                send_callback_later: true,
                            });
                        }
                    }
                }
                EngineEventKind::Control(ControlEvent::AllSoundOff) => {
                    if options & plugin_options::SEND_ALL_SOUND_OFF != 0 {
                        state.event_scratch.push(*event);
                    }
                }
                EngineEventKind::Control(ControlEvent::AllNotesOff) => {
                    if i32::from(event.channel) == ctrl_channel && !notes_off_synthesized {
                        notes_off_synthesized = true;
                        for (channel, note) in state.held_notes.drain(..) {
                            self.post_rt.append_rt(PostRtEvent {
                                kind: PostRtEventKind::NoteOff,
                                value1: channel as i32,
                                value2: note as i32,
                                value3: 0,
                                valuef: 0.0,
                                send_callback_later: true,
                            });
                        }
                    }
                    if options & plugin_options::SEND_ALL_SOUND_OFF != 0 {
                        state.event_scratch.push(*event);
                    }
                }
                EngineEventKind::Midi(data) => {
                    if data.size >= 2 {
                        let status = data.data[0] & 0xF0;
                        let channel = data.data[0] & 0x0F;
                        if status == 0x90 {
                            self.track_note(state, channel, data.data[1], data.data[2], true);
                        } else if status == 0x80 {
                            self.track_note(state, channel, data.data[1], 0, true);
                        }
                    }
                    if wants_midi {
                        state.event_scratch.push(*event);
                    }
                }
            }
        }
    }

    fn track_note(
        &self,
        state: &mut super::ProcessState,
        channel: u8,
        note: u8,
        velocity: u8,
        post: bool,
    ) {
        if velocity > 0 {
            if state.held_notes.len() < 128 {
                state.held_notes.push((channel, note));
            }
            if post {
                self.post_rt.append_rt(PostRtEvent {
                    kind: PostRtEventKind::NoteOn,
                    value1: channel as i32,
                    value2: note as i32,
                    value3: velocity as i32,
                    valuef: 0.0,
                    send_callback_later: true,
                });
            }
        } else {
            state.held_notes.retain(|&(c, n)| c != channel || n != note);
            if post {
                self.post_rt.append_rt(PostRtEvent {
                    kind: PostRtEventKind::NoteOff,
                    value1: channel as i32,
                    value2: note as i32,
                    value3: 0,
                    valuef: 0.0,
                    send_callback_later: true,
                });
            }
        }
    }

    fn post_mix_change(&self, pseudo_index: i32, value: f32) {
        self.post_rt.append_rt(PostRtEvent {
            kind: PostRtEventKind::ParameterValueChanged,
            value1: pseudo_index,
            value2: 0,
            value3: 0,
            valuef: value,
            send_callback_later: true,
        });
    }

    /// Fixed-order post-processing: dry/wet, balance, volume. Stages at
    /// identity are skipped; the odd tail of an unpaired output passes
    /// through the balance stage untouched.
    fn post_process(
        &self,
        state: &mut super::ProcessState,
        input_count: usize,
        audio_out: &mut [&mut [f32]],
        frames: usize,
    ) {
        let hint_bits = self.hints();
        let dry_wet = self.mix.dry_wet();
        let volume = self.mix.volume();
        let balance_left = self.mix.balance_left();
        let balance_right = self.mix.balance_right();

        if hint_bits & hints::CAN_DRYWET != 0 && (dry_wet - 1.0).abs() > f32::EPSILON {
            let dry_count = state.dry.len().min(input_count);
            let latency = self.latency_frames() as usize;
            let start_pos = state.latency_pos;
            let mut next_pos = start_pos;
            for (index, output) in audio_out.iter_mut().enumerate() {
                if dry_count == 0 {
                    break;
                }
                let source = index.min(dry_count - 1);
                let dry = &state.dry[source];
                let delayed = state
                    .latency_rings
                    .get_mut(source)
                    .filter(|ring| latency > 0 && ring.len() == latency);
                match delayed {
                    // The dry signal runs through the latency delay line so
                    // it stays aligned with the wet signal.
                    Some(ring) => {
                        let mut pos = start_pos;
                        for k in 0..frames {
                            let sample = ring[pos];
                            ring[pos] = dry[k];
                            output[k] = output[k] * dry_wet + sample * (1.0 - dry_wet);
                            pos += 1;
                            if pos == latency {
                                pos = 0;
                            }
                        }
                        next_pos = pos;
                    }
                    None => {
                        for k in 0..frames {
                            output[k] = output[k] * dry_wet + dry[k] * (1.0 - dry_wet);
                        }
                    }
                }
            }
            state.latency_pos = next_pos;
        }

        if hint_bits & hints::CAN_BALANCE != 0
            && !((balance_left + 1.0).abs() < f32::EPSILON
                && (balance_right - 1.0).abs() < f32::EPSILON)
        {
            let range_left = (balance_left + 1.0) / 2.0;
            let range_right = (balance_right + 1.0) / 2.0;
            let mut index = 0;
            while index + 1 < audio_out.len() {
                let (left_half, right_half) = audio_out.split_at_mut(index + 1);
                let left = &mut left_half[index];
                let right = &mut right_half[0];
                state.bal[..frames].copy_from_slice(&left[..frames]);
                for k in 0..frames {
                    left[k] = state.bal[k] * (1.0 - range_left) + right[k] * (1.0 - range_right);
                    right[k] = right[k] * range_right + state.bal[k] * range_left;
                }
                index += 2;
            }
        }

        if hint_bits & hints::CAN_VOLUME != 0 && (volume - 1.0).abs() > f32::EPSILON {
            for output in audio_out.iter_mut() {
                for sample in &mut output[..frames] {
                    *sample *= volume;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::adapter::GainAdapter;
    use super::super::{Backend, Plugin, PluginType};
    use super::*;

    fn make_plugin() -> Plugin {
        let plugin = Plugin::new(
            0,
            PluginType::Internal,
            "gain",
            "",
            "gain",
            Backend::Local(Box::new(GainAdapter::stereo())),
            64,
        );
        plugin.reload(false, false);
        plugin.set_active(true);
        plugin
    }

    fn run(plugin: &Plugin, input: &[f32]) -> (Vec<f32>, Vec<f32>) {
        let in_l = input.to_vec();
        let in_r = input.to_vec();
        let mut out_l = vec![0.0f32; input.len()];
        let mut out_r = vec![0.0f32; input.len()];
        let mut events_out = EventQueue::new();
        {
            let ins: Vec<&[f32]> = vec![&in_l, &in_r];
            let mut outs: Vec<&mut [f32]> = vec![&mut out_l, &mut out_r];
            plugin.process_rt(
                &ins,
                &mut outs,
                &[],
                &mut [],
                &[],
                &mut events_out,
                &TransportInfo::default(),
                input.len() as u32,
            );
        }
        (out_l, out_r)
    }

    #[test]
    fn inactive_plugin_outputs_silence() {
        let plugin = make_plugin();
        plugin.set_active(false);
        let (out_l, _) = run(&plugin, &[0.5f32; 64]);
        assert!(out_l.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn contended_single_mutex_outputs_silence() {
        let plugin = make_plugin();
        let _hold = plugin.process.lock();
        let (out_l, _) = run(&plugin, &[0.5f32; 64]);
        assert!(out_l.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn unity_settings_pass_audio_through() {
        let plugin = make_plugin();
        let input: Vec<f32> = (0..64).map(|i| (i as f32 / 64.0) - 0.5).collect();
        let (out_l, out_r) = run(&plugin, &input);
        assert_eq!(out_l, input);
        assert_eq!(out_r, input);
    }

    #[test]
    fn volume_scales_outputs() {
        let plugin = make_plugin();
        plugin.mix.set_volume(0.5);
        let (out_l, _) = run(&plugin, &[1.0f32; 64]);
        assert!(out_l.iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn dry_wet_blends_input_back_in() {
        let plugin = make_plugin();
        plugin.set_parameter_value(0, 0.0); // wet = silence
        plugin.mix.set_dry_wet(0.25);
        let (out_l, _) = run(&plugin, &[0.8f32; 64]);
        // 25% of silent wet + 75% of dry input.
        assert!(out_l.iter().all(|s| (*s - 0.6).abs() < 1e-6));
    }

    #[test]
    fn hard_left_balance_moves_right_channel() {
        let plugin = make_plugin();
        plugin.mix.set_balance_left(-1.0);
        plugin.mix.set_balance_right(-1.0);
        let input: Vec<f32> = vec![0.5; 64];
        let (out_l, out_r) = run(&plugin, &input);
        // Right balance at -1 folds the right bus fully into the left.
        assert!(out_l.iter().all(|s| (*s - 1.0).abs() < 1e-6));
        assert!(out_r.iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn ctrl_channel_volume_cc_updates_mix() {
        let plugin = make_plugin();
        let event = EngineEvent {
            time: 0,
            channel: 0,
            kind: EngineEventKind::Control(ControlEvent::Parameter {
                param: CC_VOLUME,
                value: 0.5,
            }),
        };
        let mut events_out = EventQueue::new();
        let input = vec![0.0f32; 64];
        let ins: Vec<&[f32]> = vec![&input, &input];
        let mut out_l = vec![0.0f32; 64];
        let mut out_r = vec![0.0f32; 64];
        let mut outs: Vec<&mut [f32]> = vec![&mut out_l, &mut out_r];
        plugin.process_rt(
            &ins,
            &mut outs,
            &[],
            &mut [],
            &[event],
            &mut events_out,
            &TransportInfo::default(),
            64,
        );
        assert!((plugin.mix.volume() - 0.5 * 127.0 / 100.0).abs() < 1e-6);
    }

    #[test]
    fn wrong_ctrl_channel_leaves_mix_alone() {
        let plugin = make_plugin();
        let event = EngineEvent {
            time: 0,
            channel: 5,
            kind: EngineEventKind::Control(ControlEvent::Parameter {
                param: CC_VOLUME,
                value: 0.1,
            }),
        };
        let mut events_out = EventQueue::new();
        let input = vec![0.0f32; 64];
        let ins: Vec<&[f32]> = vec![&input, &input];
        let mut out_l = vec![0.0f32; 64];
        let mut out_r = vec![0.0f32; 64];
        let mut outs: Vec<&mut [f32]> = vec![&mut out_l, &mut out_r];
        plugin.process_rt(
            &ins,
            &mut outs,
            &[],
            &mut [],
            &[event],
            &mut events_out,
            &TransportInfo::default(),
            64,
        );
        assert_eq!(plugin.mix.volume(), 1.0);
    }
}
