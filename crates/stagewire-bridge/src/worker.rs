//! Worker-process side of the bridge: attaches the shared regions and hosts
//! the actual plugin behind the [`WorkerPlugin`] seam.

use std::mem::offset_of;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use stagewire_rt::ring::{Ring, BIG_RING_SIZE, HUGE_RING_SIZE, SMALL_RING_SIZE};

use crate::proto::{NonRtClientOpcode, NonRtServerOpcode, RtClientOpcode};
use crate::sem::ShmSemaphore;
use crate::shm::{AudioPool, ShmRegion};
use crate::transport::{RtRegionPrefix, MIDI_OUT_BYTES};
use crate::SHM_PATHS_ENV;

/// Full description of one worker-side parameter, published during startup.
#[derive(Debug, Clone)]
pub struct WorkerParameter {
    pub name: String,
    pub unit: String,
    pub rindex: i32,
    pub kind: u32,
    pub hints: u32,
    pub midi_channel: u8,
    pub midi_cc: i16,
    pub def: f32,
    pub min: f32,
    pub max: f32,
    pub step: f32,
    pub step_small: f32,
    pub step_large: f32,
}

/// The capability set a hosted plugin exposes to the worker loop. Format
/// wrappers (VST/LV2/...) implement this; the built-in [`GainPlugin`] backs
/// tests and the binary's internal mode.
pub trait WorkerPlugin: Send {
    fn label(&self) -> &str;
    fn maker(&self) -> &str {
        ""
    }
    fn copyright(&self) -> &str {
        ""
    }
    fn unique_id(&self) -> i64 {
        0
    }
    fn audio_io(&self) -> (u32, u32);
    fn midi_io(&self) -> (u32, u32) {
        (0, 0)
    }
    fn hints(&self) -> u32 {
        0
    }
    fn parameters(&self) -> Vec<WorkerParameter>;
    fn parameter_value(&self, index: u32) -> f32;
    fn set_parameter_value(&mut self, index: u32, value: f32);
    fn program_count(&self) -> u32 {
        0
    }
    fn program_name(&self, _index: u32) -> String {
        String::new()
    }
    fn set_program(&mut self, _index: i32) {}
    fn activate(&mut self) {}
    fn deactivate(&mut self) {}
    fn midi_event(&mut self, _time: u32, _port: u8, _data: &[u8]) {}
    fn process(&mut self, inputs: &[Vec<f32>], outputs: &mut [Vec<f32>], frames: u32);
    fn prepare_for_save(&mut self) {}
}

/// Stereo passthrough with a single gain control.
pub struct GainPlugin {
    gain: f32,
}

impl GainPlugin {
    pub fn new() -> Self {
        Self { gain: 1.0 }
    }
}

impl Default for GainPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPlugin for GainPlugin {
    fn label(&self) -> &str {
        "gain"
    }

    fn maker(&self) -> &str {
        "Stagewire"
    }

    fn audio_io(&self) -> (u32, u32) {
        (2, 2)
    }

    fn parameters(&self) -> Vec<WorkerParameter> {
        vec![WorkerParameter {
            name: String::from("Gain"),
            unit: String::new(),
            rindex: 0,
            kind: 1,
            hints: 0x01 | 0x10,
            midi_channel: 0,
            midi_cc: -1,
            def: 1.0,
            min: 0.0,
            max: 2.0,
            step: 0.01,
            step_small: 0.001,
            step_large: 0.1,
        }]
    }

    fn parameter_value(&self, _index: u32) -> f32 {
        self.gain
    }

    fn set_parameter_value(&mut self, _index: u32, value: f32) {
        self.gain = value.clamp(0.0, 2.0);
    }

    fn process(&mut self, inputs: &[Vec<f32>], outputs: &mut [Vec<f32>], frames: u32) {
        for (output, input) in outputs.iter_mut().zip(inputs.iter()) {
            for i in 0..frames as usize {
                output[i] = input[i] * self.gain;
            }
        }
        for output in outputs.iter_mut().skip(inputs.len()) {
            output[..frames as usize].fill(0.0);
        }
    }
}

/// The worker's service loop over the four attached regions.
pub struct WorkerService {
    plugin: Box<dyn WorkerPlugin>,
    pool: AudioPool,
    rt_region: ShmRegion,
    _nonrt_client_region: ShmRegion,
    _nonrt_server_region: ShmRegion,
    sem_server: ShmSemaphore,
    sem_client: ShmSemaphore,
    rt_ring: Ring,
    nonrt_client: Ring,
    nonrt_server: Ring,
    buffer_size: u32,
    sample_rate: f64,
    active: bool,
    quit: bool,
    scratch_in: Vec<Vec<f32>>,
    scratch_out: Vec<Vec<f32>>,
}

impl WorkerService {
    /// Attaches using the paths the engine put into the environment.
    pub fn attach_from_env(plugin: Box<dyn WorkerPlugin>) -> Result<Self> {
        let joined = std::env::var(SHM_PATHS_ENV)
            .with_context(|| format!("{SHM_PATHS_ENV} not set; not spawned by an engine?"))?;
        let paths: Vec<PathBuf> = joined.split(':').map(PathBuf::from).collect();
        if paths.len() != 4 {
            bail!("{SHM_PATHS_ENV} must name four regions");
        }
        Self::attach(&paths[0], &paths[1], &paths[2], &paths[3], plugin)
    }

    pub fn attach(
        pool_path: &Path,
        rt_path: &Path,
        nonrt_client_path: &Path,
        nonrt_server_path: &Path,
        plugin: Box<dyn WorkerPlugin>,
    ) -> Result<Self> {
        let pool = AudioPool::attach(pool_path)?;
        let mut rt_region = ShmRegion::attach(rt_path)?;
        let mut nonrt_client_region = ShmRegion::attach(nonrt_client_path)?;
        let mut nonrt_server_region = ShmRegion::attach(nonrt_server_path)?;

        let base = rt_region.as_mut_ptr();
        let (sem_server, sem_client, rt_ring) = unsafe {
            let prefix = base as *mut RtRegionPrefix;
            let sem_server = ShmSemaphore::attach(std::ptr::addr_of_mut!((*prefix).sem_server));
            let sem_client = ShmSemaphore::attach(std::ptr::addr_of_mut!((*prefix).sem_client));
            let ring = Ring::attach(
                base.add(std::mem::size_of::<RtRegionPrefix>()),
                SMALL_RING_SIZE,
                false,
            );
            (sem_server, sem_client, ring)
        };

        let mut nonrt_client =
            unsafe { Ring::attach(nonrt_client_region.as_mut_ptr(), BIG_RING_SIZE, false) };
        let nonrt_server =
            unsafe { Ring::attach(nonrt_server_region.as_mut_ptr(), HUGE_RING_SIZE, false) };

        // Handshake preamble: Null opcode then the three ring sizes, which
        // must match what this build was compiled with.
        let null = nonrt_client.read_opcode()?;
        if null != NonRtClientOpcode::Null.as_u32() {
            bail!("unexpected handshake opcode {null}");
        }
        let small = nonrt_client.read_u32()?;
        let big = nonrt_client.read_u32()?;
        let huge = nonrt_client.read_u32()?;
        if (small as usize, big as usize, huge as usize)
            != (SMALL_RING_SIZE, BIG_RING_SIZE, HUGE_RING_SIZE)
        {
            bail!("ring geometry mismatch between engine and worker");
        }

        Ok(Self {
            plugin,
            pool,
            rt_region,
            _nonrt_client_region: nonrt_client_region,
            _nonrt_server_region: nonrt_server_region,
            sem_server,
            sem_client,
            rt_ring,
            nonrt_client,
            nonrt_server,
            buffer_size: 0,
            sample_rate: 0.0,
            active: false,
            quit: false,
            scratch_in: Vec::new(),
            scratch_out: Vec::new(),
        })
    }

    fn commit_server(&mut self, write: impl FnOnce(&mut Ring) -> bool) {
        if !(write(&mut self.nonrt_server) && self.nonrt_server.commit_write()) {
            warn!("server ring overflow, message lost");
        }
    }

    /// Publishes the hosted plugin's full description followed by `Ready`.
    pub fn publish_descriptor(&mut self) -> Result<()> {
        let (audio_in, audio_out) = self.plugin.audio_io();
        let (midi_in, midi_out) = self.plugin.midi_io();
        let hints = self.plugin.hints();
        let unique_id = self.plugin.unique_id();
        let label = self.plugin.label().to_string();
        let maker = self.plugin.maker().to_string();
        let copyright = self.plugin.copyright().to_string();
        let parameters = self.plugin.parameters();

        self.commit_server(|ring| {
            ring.write_opcode(NonRtServerOpcode::PluginInfo1.as_u32())
                && ring.write_u32(0)
                && ring.write_u32(hints)
                && ring.write_u32(0)
                && ring.write_u32(midi_in)
                && ring.write_u32(midi_out)
                && ring.write_i64(unique_id)
        });
        self.commit_server(|ring| {
            ring.write_opcode(NonRtServerOpcode::PluginInfo2.as_u32())
                && ring.write_str(&label)
                && ring.write_str(&label)
                && ring.write_str(&maker)
                && ring.write_str(&copyright)
        });
        self.commit_server(|ring| {
            ring.write_opcode(NonRtServerOpcode::AudioCount.as_u32())
                && ring.write_u32(audio_in)
                && ring.write_u32(audio_out)
        });
        self.commit_server(|ring| {
            ring.write_opcode(NonRtServerOpcode::MidiCount.as_u32())
                && ring.write_u32(midi_in)
                && ring.write_u32(midi_out)
        });
        self.commit_server(|ring| {
            ring.write_opcode(NonRtServerOpcode::ParameterCount.as_u32())
                && ring.write_u32(parameters.len() as u32)
        });
        for (index, param) in parameters.iter().enumerate() {
            let index = index as u32;
            self.commit_server(|ring| {
                ring.write_opcode(NonRtServerOpcode::ParameterData1.as_u32())
                    && ring.write_u32(index)
                    && ring.write_i32(param.rindex)
                    && ring.write_u32(param.kind)
                    && ring.write_u32(param.hints)
                    && ring.write_u8(param.midi_channel)
                    && ring.write_i16(param.midi_cc)
            });
            self.commit_server(|ring| {
                ring.write_opcode(NonRtServerOpcode::ParameterData2.as_u32())
                    && ring.write_u32(index)
                    && ring.write_str(&param.name)
                    && ring.write_str(&param.unit)
            });
            self.commit_server(|ring| {
                ring.write_opcode(NonRtServerOpcode::ParameterRanges1.as_u32())
                    && ring.write_u32(index)
                    && ring.write_f32(param.def)
                    && ring.write_f32(param.min)
                    && ring.write_f32(param.max)
            });
            self.commit_server(|ring| {
                ring.write_opcode(NonRtServerOpcode::ParameterRanges2.as_u32())
                    && ring.write_u32(index)
                    && ring.write_f32(param.step)
                    && ring.write_f32(param.step_small)
                    && ring.write_f32(param.step_large)
            });
            let value = self.plugin.parameter_value(index);
            self.commit_server(|ring| {
                ring.write_opcode(NonRtServerOpcode::ParameterValue.as_u32())
                    && ring.write_u32(index)
                    && ring.write_f32(value)
            });
        }
        let program_count = self.plugin.program_count();
        self.commit_server(|ring| {
            ring.write_opcode(NonRtServerOpcode::ProgramCount.as_u32())
                && ring.write_u32(program_count)
        });
        for index in 0..program_count {
            let name = self.plugin.program_name(index);
            self.commit_server(|ring| {
                ring.write_opcode(NonRtServerOpcode::ProgramName.as_u32())
                    && ring.write_u32(index)
                    && ring.write_str(&name)
            });
        }
        self.commit_server(|ring| {
            ring.write_opcode(NonRtServerOpcode::MidiProgramCount.as_u32()) && ring.write_u32(0)
        });
        self.commit_server(|ring| ring.write_opcode(NonRtServerOpcode::Ready.as_u32()));
        info!(label = %self.plugin.label(), "worker published descriptor");
        Ok(())
    }

    /// Serves both rings until `Quit`.
    pub fn run(&mut self) -> Result<()> {
        while !self.quit {
            self.service_non_rt()?;
            self.service_rt(Duration::from_millis(50));
        }
        debug!("worker loop finished");
        Ok(())
    }

    /// Drains every complete non-RT frame currently committed.
    pub fn service_non_rt(&mut self) -> Result<()> {
        while self.nonrt_client.is_data_available_for_reading() {
            let raw = self.nonrt_client.read_opcode()?;
            let opcode = NonRtClientOpcode::from_u32(raw)?;
            self.handle_non_rt(opcode)?;
        }
        Ok(())
    }

    fn handle_non_rt(&mut self, opcode: NonRtClientOpcode) -> Result<()> {
        match opcode {
            NonRtClientOpcode::Null => {}
            NonRtClientOpcode::SetAudioPoolSize => {
                let _bytes = self.nonrt_client.read_u64()?;
                self.pool.reattach_region()?;
            }
            NonRtClientOpcode::SetBufferSize => {
                self.buffer_size = self.nonrt_client.read_u32()?;
                self.realloc_scratch();
            }
            NonRtClientOpcode::SetSampleRate => {
                self.sample_rate = self.nonrt_client.read_f64()?;
            }
            NonRtClientOpcode::SetOffline | NonRtClientOpcode::SetOnline => {}
            NonRtClientOpcode::SetOption => {
                let _option = self.nonrt_client.read_u32()?;
                let _enabled = self.nonrt_client.read_bool()?;
            }
            NonRtClientOpcode::SetCtrlChannel => {
                let _channel = self.nonrt_client.read_i16()?;
            }
            NonRtClientOpcode::SetParameterValue => {
                let index = self.nonrt_client.read_u32()?;
                let value = self.nonrt_client.read_f32()?;
                self.plugin.set_parameter_value(index, value);
            }
            NonRtClientOpcode::SetParameterMidiChannel => {
                let _index = self.nonrt_client.read_u32()?;
                let _channel = self.nonrt_client.read_u8()?;
            }
            NonRtClientOpcode::SetParameterMidiCc => {
                let _index = self.nonrt_client.read_u32()?;
                let _cc = self.nonrt_client.read_i16()?;
            }
            NonRtClientOpcode::SetProgram => {
                let index = self.nonrt_client.read_i32()?;
                self.plugin.set_program(index);
            }
            NonRtClientOpcode::SetMidiProgram => {
                let _index = self.nonrt_client.read_i32()?;
            }
            NonRtClientOpcode::SetCustomData => {
                let _kind = self.nonrt_client.read_string()?;
                let _key = self.nonrt_client.read_string()?;
                let _value = self.nonrt_client.read_string()?;
            }
            NonRtClientOpcode::SetChunkDataFile => {
                let _path = self.nonrt_client.read_string()?;
            }
            NonRtClientOpcode::PrepareForSave => {
                self.plugin.prepare_for_save();
                self.commit_server(|ring| ring.write_opcode(NonRtServerOpcode::Saved.as_u32()));
            }
            NonRtClientOpcode::Activate => {
                self.plugin.activate();
                self.active = true;
            }
            NonRtClientOpcode::Deactivate => {
                self.plugin.deactivate();
                self.active = false;
            }
            NonRtClientOpcode::ShowUi | NonRtClientOpcode::HideUi => {
                // No custom UI in the built-in plugins.
                self.commit_server(|ring| ring.write_opcode(NonRtServerOpcode::UiClosed.as_u32()));
            }
            NonRtClientOpcode::Ping => {
                self.commit_server(|ring| ring.write_opcode(NonRtServerOpcode::Pong.as_u32()));
            }
            NonRtClientOpcode::UiParameterChange => {
                let index = self.nonrt_client.read_u32()?;
                let value = self.nonrt_client.read_f32()?;
                self.plugin.set_parameter_value(index, value);
            }
            NonRtClientOpcode::UiProgramChange => {
                let index = self.nonrt_client.read_u32()?;
                self.plugin.set_program(index as i32);
            }
            NonRtClientOpcode::UiMidiProgramChange => {
                let _index = self.nonrt_client.read_u32()?;
            }
            NonRtClientOpcode::UiNoteOn => {
                let channel = self.nonrt_client.read_u8()?;
                let note = self.nonrt_client.read_u8()?;
                let velocity = self.nonrt_client.read_u8()?;
                self.plugin
                    .midi_event(0, 0, &[0x90 | (channel & 0x0F), note, velocity]);
            }
            NonRtClientOpcode::UiNoteOff => {
                let channel = self.nonrt_client.read_u8()?;
                let note = self.nonrt_client.read_u8()?;
                self.plugin.midi_event(0, 0, &[0x80 | (channel & 0x0F), note, 0]);
            }
            NonRtClientOpcode::Quit => {
                self.quit = true;
            }
        }
        Ok(())
    }

    /// Waits for the server semaphore and serves one RT batch.
    pub fn service_rt(&mut self, timeout: Duration) {
        if !self.sem_server.wait_timeout(timeout) {
            return;
        }
        while self.rt_ring.is_data_available_for_reading() {
            let Ok(raw) = self.rt_ring.read_opcode() else {
                return;
            };
            let Ok(opcode) = RtClientOpcode::from_u32(raw) else {
                warn!(raw, "unknown rt opcode, dropping batch");
                self.rt_ring.flush_read();
                return;
            };
            match opcode {
                RtClientOpcode::Null => {}
                RtClientOpcode::SetAudioPool => {
                    let buffer = self.rt_ring.read_u32().unwrap_or(0);
                    let ins = self.rt_ring.read_u32().unwrap_or(0);
                    let outs = self.rt_ring.read_u32().unwrap_or(0);
                    if self.pool.update_layout(buffer, ins, outs).is_err() {
                        warn!("failed to re-attach audio pool");
                    }
                    self.buffer_size = buffer;
                    self.realloc_scratch();
                }
                RtClientOpcode::MidiEvent => {
                    let time = self.rt_ring.read_u32().unwrap_or(0);
                    let port = self.rt_ring.read_u8().unwrap_or(0);
                    if let Ok(data) = self.rt_ring.read_custom_data() {
                        self.plugin.midi_event(time, port, &data);
                    }
                }
                RtClientOpcode::ControlEventParameter => {
                    let _time = self.rt_ring.read_u32().unwrap_or(0);
                    let _channel = self.rt_ring.read_u8().unwrap_or(0);
                    let param = self.rt_ring.read_u16().unwrap_or(0);
                    let value = self.rt_ring.read_f32().unwrap_or(0.0);
                    self.plugin.set_parameter_value(param as u32, value);
                }
                RtClientOpcode::ControlEventMidiBank => {
                    let _time = self.rt_ring.read_u32().unwrap_or(0);
                    let _channel = self.rt_ring.read_u8().unwrap_or(0);
                    let _bank = self.rt_ring.read_u16().unwrap_or(0);
                }
                RtClientOpcode::ControlEventMidiProgram => {
                    let _time = self.rt_ring.read_u32().unwrap_or(0);
                    let _channel = self.rt_ring.read_u8().unwrap_or(0);
                    let program = self.rt_ring.read_u16().unwrap_or(0);
                    self.plugin.set_program(program as i32);
                }
                RtClientOpcode::ControlEventAllSoundOff
                | RtClientOpcode::ControlEventAllNotesOff => {
                    let _time = self.rt_ring.read_u32().unwrap_or(0);
                    let channel = self.rt_ring.read_u8().unwrap_or(0);
                    self.plugin.midi_event(0, 0, &[0xB0 | (channel & 0x0F), 0x7B, 0]);
                }
                RtClientOpcode::Process => {
                    let frames = self.rt_ring.read_u32().unwrap_or(0);
                    self.process_block(frames);
                    self.sem_client.post();
                }
                RtClientOpcode::Quit => {
                    self.quit = true;
                    self.sem_client.post();
                    return;
                }
            }
        }
    }

    fn realloc_scratch(&mut self) {
        let (audio_in, audio_out) = self.plugin.audio_io();
        let frames = self.buffer_size as usize;
        self.scratch_in = (0..audio_in).map(|_| vec![0.0; frames]).collect();
        self.scratch_out = (0..audio_out).map(|_| vec![0.0; frames]).collect();
    }

    fn process_block(&mut self, frames: u32) {
        if frames == 0 || frames > self.buffer_size {
            return;
        }
        let (audio_in, audio_out) = self.plugin.audio_io();
        if self.scratch_in.len() != audio_in as usize || self.scratch_out.len() != audio_out as usize
        {
            self.realloc_scratch();
        }
        for slot in 0..audio_in {
            let input = self.pool.input_slice(slot, frames);
            self.scratch_in[slot as usize][..frames as usize].copy_from_slice(input);
        }
        if self.active {
            self.plugin
                .process(&self.scratch_in, &mut self.scratch_out, frames);
        } else {
            for out in &mut self.scratch_out {
                out[..frames as usize].fill(0.0);
            }
        }
        for slot in 0..audio_out {
            let out = &self.scratch_out[slot as usize][..frames as usize];
            self.pool.output_slice_mut(slot, frames).copy_from_slice(out);
        }
    }

    /// Appends one outbound MIDI event to the shared array for the engine to
    /// drain after the cycle.
    pub fn push_midi_out(&mut self, time: u32, data: &[u8]) {
        let base = unsafe {
            (self.rt_region.as_mut_ptr() as *mut u8).add(offset_of!(RtRegionPrefix, midi_out))
        };
        let buf = unsafe { std::slice::from_raw_parts_mut(base, MIDI_OUT_BYTES) };
        let mut cursor = 0usize;
        while cursor + 5 <= MIDI_OUT_BYTES && buf[cursor + 4] != 0 {
            cursor += 5 + buf[cursor + 4] as usize;
        }
        if cursor + 5 + data.len() > MIDI_OUT_BYTES {
            return;
        }
        buf[cursor..cursor + 4].copy_from_slice(&time.to_ne_bytes());
        buf[cursor + 4] = data.len() as u8;
        buf[cursor + 5..cursor + 5 + data.len()].copy_from_slice(data);
    }
}
