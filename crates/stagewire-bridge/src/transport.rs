//! Engine-side bridge transport: region ownership, worker supervision and
//! the per-cycle rendezvous.

use std::mem::offset_of;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use stagewire_rt::ring::{Ring, BIG_RING_SIZE, HUGE_RING_SIZE, SMALL_RING_SIZE};
use stagewire_rt::TransportInfo;

use crate::proto::{NonRtClientOpcode, NonRtServerOpcode, ProtocolError, RtClientOpcode};
use crate::sem::ShmSemaphore;
use crate::shm::{AudioPool, ShmRegion};
use crate::SHM_PATHS_ENV;

/// Bytes reserved for worker-outbound MIDI inside the RT region.
pub const MIDI_OUT_BYTES: usize = 4096;

/// Transport snapshot shared with the worker, written before each cycle.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct BridgeTimeInfo {
    pub playing: u32,
    pub frame: u64,
    pub bbt_valid: u32,
    pub bar: i32,
    pub beat: i32,
    pub tick: f64,
    pub bar_start_tick: f64,
    pub beats_per_bar: f32,
    pub beat_type: f32,
    pub ticks_per_beat: f64,
    pub beats_per_minute: f64,
}

/// Fixed prefix of the RT-control region; the small ring follows it.
#[repr(C)]
pub(crate) struct RtRegionPrefix {
    pub(crate) sem_server: libc::sem_t,
    pub(crate) sem_client: libc::sem_t,
    pub(crate) time_info: BridgeTimeInfo,
    pub(crate) midi_out: [u8; MIDI_OUT_BYTES],
}

pub(crate) const RT_REGION_LEN: usize =
    std::mem::size_of::<RtRegionPrefix>() + Ring::required_bytes(SMALL_RING_SIZE);
pub(crate) const NON_RT_CLIENT_REGION_LEN: usize = Ring::required_bytes(BIG_RING_SIZE);
pub(crate) const NON_RT_SERVER_REGION_LEN: usize = Ring::required_bytes(HUGE_RING_SIZE);

/// How the transport launches and times out its worker.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub binary: PathBuf,
    pub plugin_type: String,
    pub filename: String,
    pub label: String,
    pub unique_id: i64,
    /// `ENGINE_OPTION_*` mirror passed into the worker environment.
    pub option_env: Vec<(String, String)>,
    /// Worker runs through a Unix compatibility layer for foreign binaries.
    pub wine: bool,
    pub rt_timeout: Duration,
    pub non_rt_timeout: Duration,
    pub init_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("stagewire-bridge"),
            plugin_type: String::from("internal"),
            filename: String::new(),
            label: String::new(),
            unique_id: 0,
            option_env: Vec::new(),
            wine: false,
            rt_timeout: Duration::from_secs(2),
            non_rt_timeout: Duration::from_secs(5),
            init_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    NotSpawned,
    Running,
    Exited(Option<i32>),
}

/// Decoded worker-to-engine message from the non-RT server ring.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Pong,
    PluginInfo1 {
        category: u32,
        hints: u32,
        options: u32,
        midi_ins: u32,
        midi_outs: u32,
        unique_id: i64,
    },
    PluginInfo2 {
        real_name: String,
        label: String,
        maker: String,
        copyright: String,
    },
    AudioCount {
        ins: u32,
        outs: u32,
    },
    MidiCount {
        ins: u32,
        outs: u32,
    },
    ParameterCount(u32),
    ProgramCount(u32),
    MidiProgramCount(u32),
    ParameterData1 {
        index: u32,
        rindex: i32,
        kind: u32,
        hints: u32,
        midi_channel: u8,
        midi_cc: i16,
    },
    ParameterData2 {
        index: u32,
        name: String,
        unit: String,
    },
    ParameterRanges1 {
        index: u32,
        def: f32,
        min: f32,
        max: f32,
    },
    ParameterRanges2 {
        index: u32,
        step: f32,
        step_small: f32,
        step_large: f32,
    },
    ParameterValue {
        index: u32,
        value: f32,
    },
    DefaultValue {
        index: u32,
        value: f32,
    },
    CurrentProgram(i32),
    CurrentMidiProgram(i32),
    ProgramName {
        index: u32,
        name: String,
    },
    MidiProgramData {
        index: u32,
        bank: u32,
        program: u32,
        name: String,
    },
    SetCustomData {
        kind: String,
        key: String,
        value: String,
    },
    SetChunkDataFile(String),
    SetLatency(u32),
    UiClosed,
    Ready,
    Saved,
    Error(String),
}

/// Engine-side endpoint of one bridged plugin.
///
/// RT methods are only entered from the audio thread under the plugin's
/// single mutex; non-RT writers serialize on an internal mutex as several
/// main-thread code paths commit frames concurrently.
pub struct BridgeTransport {
    config: BridgeConfig,
    pool: AudioPool,
    // The semaphores live inside the RT region; they must be destroyed
    // before the mapping goes away, so they are declared first.
    sem_server: ShmSemaphore,
    sem_client: ShmSemaphore,
    rt_region: ShmRegion,
    nonrt_client_region: ShmRegion,
    nonrt_server_region: ShmRegion,
    rt_ring: Ring,
    nonrt_client: Mutex<Ring>,
    nonrt_server: Ring,
    child: Option<Child>,
    timed_out: bool,
    poisoned: bool,
    offline: bool,
    quit_sent: bool,
    /// Idle ticks since the last `Pong`.
    pong_age: u32,
}

impl BridgeTransport {
    /// Creates the four regions, initializes rings and semaphores and stages
    /// the initial handshake frames. Nothing is spawned yet.
    pub fn create(config: BridgeConfig, buffer_size: u32, sample_rate: f64) -> Result<Self> {
        let pool = AudioPool::create(buffer_size)?;
        let mut rt_region = ShmRegion::create("rt", RT_REGION_LEN)?;
        let mut nonrt_client_region = ShmRegion::create("nonrt", NON_RT_CLIENT_REGION_LEN)?;
        let mut nonrt_server_region = ShmRegion::create("server", NON_RT_SERVER_REGION_LEN)?;

        let base = rt_region.as_mut_ptr();
        let (sem_server, sem_client, rt_ring) = unsafe {
            let prefix = base as *mut RtRegionPrefix;
            std::ptr::write(
                std::ptr::addr_of_mut!((*prefix).time_info),
                BridgeTimeInfo::default(),
            );
            std::ptr::write_bytes(std::ptr::addr_of_mut!((*prefix).midi_out) as *mut u8, 0, MIDI_OUT_BYTES);
            let sem_server = ShmSemaphore::create(std::ptr::addr_of_mut!((*prefix).sem_server))?;
            let sem_client = ShmSemaphore::create(std::ptr::addr_of_mut!((*prefix).sem_client))?;
            let ring = Ring::attach(
                base.add(std::mem::size_of::<RtRegionPrefix>()),
                SMALL_RING_SIZE,
                true,
            );
            (sem_server, sem_client, ring)
        };

        let mut nonrt_client =
            unsafe { Ring::attach(nonrt_client_region.as_mut_ptr(), BIG_RING_SIZE, true) };
        let nonrt_server =
            unsafe { Ring::attach(nonrt_server_region.as_mut_ptr(), HUGE_RING_SIZE, true) };

        // Handshake preamble: a null opcode, the three ring sizes, then the
        // initial buffer size and sample rate.
        nonrt_client.write_opcode(NonRtClientOpcode::Null.as_u32());
        nonrt_client.write_u32(SMALL_RING_SIZE as u32);
        nonrt_client.write_u32(BIG_RING_SIZE as u32);
        nonrt_client.write_u32(HUGE_RING_SIZE as u32);
        nonrt_client.write_opcode(NonRtClientOpcode::SetBufferSize.as_u32());
        nonrt_client.write_u32(buffer_size);
        nonrt_client.write_opcode(NonRtClientOpcode::SetSampleRate.as_u32());
        nonrt_client.write_f64(sample_rate);
        if !nonrt_client.commit_write() {
            bail!("failed to stage bridge handshake");
        }

        Ok(Self {
            config,
            pool,
            rt_region,
            nonrt_client_region,
            nonrt_server_region,
            sem_server,
            sem_client,
            rt_ring,
            nonrt_client: Mutex::new(nonrt_client),
            nonrt_server,
            child: None,
            timed_out: false,
            poisoned: false,
            offline: false,
            quit_sent: false,
            pong_age: 0,
        })
    }

    /// The four region paths in handoff order.
    pub fn shm_paths(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.pool.path().display(),
            self.rt_region.path().display(),
            self.nonrt_client_region.path().display(),
            self.nonrt_server_region.path().display(),
        )
    }

    /// Launches the worker process.
    pub fn spawn(&mut self) -> Result<()> {
        let mut command = Command::new(&self.config.binary);
        command
            .arg(&self.config.plugin_type)
            .arg(&self.config.filename)
            .arg(&self.config.label)
            .arg(self.config.unique_id.to_string())
            .env(SHM_PATHS_ENV, self.shm_paths())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        for (key, value) in &self.config.option_env {
            command.env(key, value);
        }
        if self.config.wine {
            command.env("WINEDEBUG", "-all");
        }
        debug!(binary = %self.config.binary.display(), "spawning bridge worker");
        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn bridge worker {:?}", self.config.binary))?;
        self.child = Some(child);
        Ok(())
    }

    /// Polls the server ring until `Ready`, collecting every message the
    /// worker publishes on the way up. `Error` or a dead child aborts.
    pub fn wait_ready(&mut self) -> Result<Vec<ServerMessage>> {
        let deadline = Instant::now() + self.config.init_timeout;
        let mut messages = Vec::new();
        loop {
            while let Some(message) = self.poll_server()? {
                match message {
                    ServerMessage::Ready => {
                        debug!("bridge worker ready");
                        return Ok(messages);
                    }
                    ServerMessage::Error(text) => {
                        bail!("bridge worker failed to start: {text}");
                    }
                    other => messages.push(other),
                }
            }
            if let ChildStatus::Exited(code) = self.check_child() {
                bail!("bridge worker exited during startup (status {code:?})");
            }
            if Instant::now() >= deadline {
                bail!("timed out waiting for bridge worker to become ready");
            }
            std::thread::sleep(Duration::from_millis(30));
        }
    }

    pub fn check_child(&mut self) -> ChildStatus {
        match self.child.as_mut() {
            None => ChildStatus::NotSpawned,
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => ChildStatus::Exited(status.code()),
                Ok(None) => ChildStatus::Running,
                Err(_) => ChildStatus::Exited(None),
            },
        }
    }

    pub fn quit_was_sent(&self) -> bool {
        self.quit_sent
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// The message surfaced when the worker dies without being asked to.
    pub fn crash_message(name: &str) -> String {
        format!("Plugin '{name}' has crashed! Saving now will lose its current settings.")
    }

    // ---- non-RT client writers ------------------------------------------

    fn commit_non_rt(&self, write: impl FnOnce(&mut Ring) -> bool) -> Result<()> {
        if self.poisoned {
            bail!("bridge transport is poisoned");
        }
        let mut ring = self.nonrt_client.lock();
        if write(&mut ring) && ring.commit_write() {
            Ok(())
        } else {
            Err(anyhow!("non-rt client ring overflow, message dropped"))
        }
    }

    pub fn set_audio_pool_size(&self, bytes: u64) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::SetAudioPoolSize.as_u32()) && ring.write_u64(bytes)
        })
    }

    pub fn set_buffer_size(&self, frames: u32) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::SetBufferSize.as_u32()) && ring.write_u32(frames)
        })
    }

    pub fn set_sample_rate(&self, rate: f64) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::SetSampleRate.as_u32()) && ring.write_f64(rate)
        })
    }

    pub fn set_offline_mode(&mut self, offline: bool) -> Result<()> {
        self.offline = offline;
        self.commit_non_rt(|ring| {
            let opcode = if offline {
                NonRtClientOpcode::SetOffline
            } else {
                NonRtClientOpcode::SetOnline
            };
            ring.write_opcode(opcode.as_u32())
        })
    }

    pub fn set_option(&self, option: u32, enabled: bool) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::SetOption.as_u32())
                && ring.write_u32(option)
                && ring.write_bool(enabled)
        })
    }

    pub fn set_ctrl_channel(&self, channel: i16) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::SetCtrlChannel.as_u32()) && ring.write_i16(channel)
        })
    }

    pub fn set_parameter_value(&self, index: u32, value: f32) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::SetParameterValue.as_u32())
                && ring.write_u32(index)
                && ring.write_f32(value)
        })
    }

    pub fn set_parameter_midi_channel(&self, index: u32, channel: u8) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::SetParameterMidiChannel.as_u32())
                && ring.write_u32(index)
                && ring.write_u8(channel)
        })
    }

    pub fn set_parameter_midi_cc(&self, index: u32, cc: i16) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::SetParameterMidiCc.as_u32())
                && ring.write_u32(index)
                && ring.write_i16(cc)
        })
    }

    pub fn set_program(&self, index: i32) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::SetProgram.as_u32()) && ring.write_i32(index)
        })
    }

    pub fn set_midi_program(&self, index: i32) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::SetMidiProgram.as_u32()) && ring.write_i32(index)
        })
    }

    pub fn set_custom_data(&self, kind: &str, key: &str, value: &str) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::SetCustomData.as_u32())
                && ring.write_str(kind)
                && ring.write_str(key)
                && ring.write_str(value)
        })
    }

    pub fn set_chunk_data_file(&self, path: &str) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::SetChunkDataFile.as_u32()) && ring.write_str(path)
        })
    }

    pub fn prepare_for_save(&self) -> Result<()> {
        self.commit_non_rt(|ring| ring.write_opcode(NonRtClientOpcode::PrepareForSave.as_u32()))
    }

    pub fn activate(&self) -> Result<()> {
        self.commit_non_rt(|ring| ring.write_opcode(NonRtClientOpcode::Activate.as_u32()))
    }

    pub fn deactivate(&self) -> Result<()> {
        self.commit_non_rt(|ring| ring.write_opcode(NonRtClientOpcode::Deactivate.as_u32()))
    }

    pub fn show_ui(&self, show: bool) -> Result<()> {
        self.commit_non_rt(|ring| {
            let opcode = if show {
                NonRtClientOpcode::ShowUi
            } else {
                NonRtClientOpcode::HideUi
            };
            ring.write_opcode(opcode.as_u32())
        })
    }

    /// Sends one keepalive ping and ages the pong counter. Returns the age
    /// in ticks so the caller can declare the worker dead past its timeout.
    pub fn ping(&mut self) -> u32 {
        let _ = self.commit_non_rt(|ring| ring.write_opcode(NonRtClientOpcode::Ping.as_u32()));
        self.pong_age = self.pong_age.saturating_add(1);
        self.pong_age
    }

    pub fn ui_parameter_change(&self, index: u32, value: f32) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::UiParameterChange.as_u32())
                && ring.write_u32(index)
                && ring.write_f32(value)
        })
    }

    pub fn ui_program_change(&self, index: u32) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::UiProgramChange.as_u32()) && ring.write_u32(index)
        })
    }

    pub fn ui_midi_program_change(&self, index: u32) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::UiMidiProgramChange.as_u32())
                && ring.write_u32(index)
        })
    }

    pub fn ui_note_on(&self, channel: u8, note: u8, velocity: u8) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::UiNoteOn.as_u32())
                && ring.write_u8(channel)
                && ring.write_u8(note)
                && ring.write_u8(velocity)
        })
    }

    pub fn ui_note_off(&self, channel: u8, note: u8) -> Result<()> {
        self.commit_non_rt(|ring| {
            ring.write_opcode(NonRtClientOpcode::UiNoteOff.as_u32())
                && ring.write_u8(channel)
                && ring.write_u8(note)
        })
    }

    // ---- RT path --------------------------------------------------------

    pub fn pool(&self) -> &AudioPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut AudioPool {
        &mut self.pool
    }

    /// Resizes the pool and announces the new geometry over the RT ring.
    /// Non-RT context; the caller guarantees no cycle is in flight.
    pub fn resize_pool(&mut self, buffer_size: u32, input_slots: u32, output_slots: u32) -> Result<()> {
        self.pool.resize(buffer_size, input_slots, output_slots)?;
        let bytes = ((input_slots + output_slots) as u64 * buffer_size as u64 * 4).max(4);
        self.set_audio_pool_size(bytes)?;
        self.rt_ring.write_opcode(RtClientOpcode::SetAudioPool.as_u32());
        self.rt_ring.write_u32(buffer_size);
        self.rt_ring.write_u32(input_slots);
        self.rt_ring.write_u32(output_slots);
        if !self.rt_ring.commit_write() {
            bail!("rt ring overflow announcing pool resize");
        }
        Ok(())
    }

    pub fn write_time_info(&mut self, info: &TransportInfo) {
        let bridged = BridgeTimeInfo {
            playing: info.playing as u32,
            frame: info.frame,
            bbt_valid: info.bbt.is_some() as u32,
            bar: info.bbt.map(|b| b.bar).unwrap_or(0),
            beat: info.bbt.map(|b| b.beat).unwrap_or(0),
            tick: info.bbt.map(|b| b.tick).unwrap_or(0.0),
            bar_start_tick: info.bbt.map(|b| b.bar_start_tick).unwrap_or(0.0),
            beats_per_bar: info.bbt.map(|b| b.beats_per_bar).unwrap_or(0.0),
            beat_type: info.bbt.map(|b| b.beat_type).unwrap_or(0.0),
            ticks_per_beat: info.bbt.map(|b| b.ticks_per_beat).unwrap_or(0.0),
            beats_per_minute: info.bbt.map(|b| b.beats_per_minute).unwrap_or(0.0),
        };
        unsafe {
            let prefix = self.rt_region.as_mut_ptr() as *mut RtRegionPrefix;
            std::ptr::write_volatile(std::ptr::addr_of_mut!((*prefix).time_info), bridged);
        }
    }

    pub fn rt_midi_event(&mut self, time: u32, port: u8, bytes: &[u8]) -> bool {
        self.rt_ring.write_opcode(RtClientOpcode::MidiEvent.as_u32())
            && self.rt_ring.write_u32(time)
            && self.rt_ring.write_u8(port)
            && self.rt_ring.write_custom_data(bytes)
    }

    pub fn rt_control_event_parameter(&mut self, time: u32, channel: u8, param: u16, value: f32) -> bool {
        self.rt_ring
            .write_opcode(RtClientOpcode::ControlEventParameter.as_u32())
            && self.rt_ring.write_u32(time)
            && self.rt_ring.write_u8(channel)
            && self.rt_ring.write_u16(param)
            && self.rt_ring.write_f32(value)
    }

    pub fn rt_control_event_midi_bank(&mut self, time: u32, channel: u8, bank: u16) -> bool {
        self.rt_ring
            .write_opcode(RtClientOpcode::ControlEventMidiBank.as_u32())
            && self.rt_ring.write_u32(time)
            && self.rt_ring.write_u8(channel)
            && self.rt_ring.write_u16(bank)
    }

    pub fn rt_control_event_midi_program(&mut self, time: u32, channel: u8, program: u16) -> bool {
        self.rt_ring
            .write_opcode(RtClientOpcode::ControlEventMidiProgram.as_u32())
            && self.rt_ring.write_u32(time)
            && self.rt_ring.write_u8(channel)
            && self.rt_ring.write_u16(program)
    }

    pub fn rt_control_event_all_sound_off(&mut self, time: u32, channel: u8) -> bool {
        self.rt_ring
            .write_opcode(RtClientOpcode::ControlEventAllSoundOff.as_u32())
            && self.rt_ring.write_u32(time)
            && self.rt_ring.write_u8(channel)
    }

    pub fn rt_control_event_all_notes_off(&mut self, time: u32, channel: u8) -> bool {
        self.rt_ring
            .write_opcode(RtClientOpcode::ControlEventAllNotesOff.as_u32())
            && self.rt_ring.write_u32(time)
            && self.rt_ring.write_u8(channel)
    }

    /// True while the previous cycle's timeout has not been recovered from.
    /// While set, the caller silences the worker's outputs and skips the
    /// round-trip entirely.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// One audio-cycle round trip. Inputs are already in the pool; on `true`
    /// the outputs are ready to read back.
    pub fn process_cycle(&mut self, frames: u32) -> bool {
        if self.timed_out || self.poisoned {
            return false;
        }
        if !(self.rt_ring.write_opcode(RtClientOpcode::Process.as_u32())
            && self.rt_ring.write_u32(frames)
            && self.rt_ring.commit_write())
        {
            return false;
        }
        self.sem_server.post();
        self.wait_for_client(self.config.rt_timeout)
    }

    /// Waits for the worker to finish a cycle. A timeout sets the sticky
    /// flag; only a later successful wait clears it.
    pub fn wait_for_client(&mut self, timeout: Duration) -> bool {
        let ok = if self.offline {
            self.sem_client.wait()
        } else {
            self.sem_client.wait_timeout(timeout)
        };
        self.timed_out = !ok;
        ok
    }

    /// Non-RT recovery probe: if the worker finished its late cycle since
    /// the timeout, consume the post and clear the flag.
    pub fn try_recover(&mut self) -> bool {
        if !self.timed_out {
            return true;
        }
        if self.sem_client.wait_timeout(Duration::from_millis(1)) {
            self.timed_out = false;
            warn!("bridge worker recovered after timeout");
            return true;
        }
        false
    }

    /// Drains worker-outbound MIDI written during the last cycle.
    pub fn drain_midi_out(&mut self, mut sink: impl FnMut(u32, &[u8])) {
        let prefix = self.rt_region.as_mut_ptr() as *mut RtRegionPrefix;
        let base = unsafe { (prefix as *mut u8).add(offset_of!(RtRegionPrefix, midi_out)) };
        let buf = unsafe { std::slice::from_raw_parts_mut(base, MIDI_OUT_BYTES) };
        let mut cursor = 0usize;
        while cursor + 5 <= MIDI_OUT_BYTES {
            let size = buf[cursor + 4] as usize;
            if size == 0 || cursor + 5 + size > MIDI_OUT_BYTES {
                break;
            }
            let time = u32::from_ne_bytes([buf[cursor], buf[cursor + 1], buf[cursor + 2], buf[cursor + 3]]);
            sink(time, &buf[cursor + 5..cursor + 5 + size]);
            cursor += 5 + size;
        }
        buf[..cursor.max(5).min(MIDI_OUT_BYTES)].fill(0);
    }

    // ---- server ring ----------------------------------------------------

    pub fn note_pong(&mut self) {
        self.pong_age = 0;
    }

    /// Decodes one worker message, if any. A malformed frame poisons the
    /// transport.
    pub fn poll_server(&mut self) -> Result<Option<ServerMessage>> {
        if self.poisoned {
            return Ok(None);
        }
        if !self.nonrt_server.is_data_available_for_reading() {
            return Ok(None);
        }
        match self.decode_server() {
            Ok(message) => {
                if matches!(message, ServerMessage::Pong) {
                    self.note_pong();
                }
                Ok(Some(message))
            }
            Err(err) => {
                self.poisoned = true;
                Err(anyhow!(err).context("bridge server ring protocol violation"))
            }
        }
    }

    fn decode_server(&mut self) -> Result<ServerMessage, ProtocolError> {
        fn mal(_: stagewire_rt::ring::RingError) -> ProtocolError {
            ProtocolError::MalformedPayload("server frame")
        }
        let ring = &mut self.nonrt_server;
        let raw = ring.read_opcode().map_err(mal)?;
        let opcode = NonRtServerOpcode::from_u32(raw)?;
        let message = match opcode {
            NonRtServerOpcode::Null => ServerMessage::Pong,
            NonRtServerOpcode::Pong => ServerMessage::Pong,
            NonRtServerOpcode::PluginInfo1 => ServerMessage::PluginInfo1 {
                category: ring.read_u32().map_err(mal)?,
                hints: ring.read_u32().map_err(mal)?,
                options: ring.read_u32().map_err(mal)?,
                midi_ins: ring.read_u32().map_err(mal)?,
                midi_outs: ring.read_u32().map_err(mal)?,
                unique_id: ring.read_i64().map_err(mal)?,
            },
            NonRtServerOpcode::PluginInfo2 => ServerMessage::PluginInfo2 {
                real_name: ring.read_string().map_err(mal)?,
                label: ring.read_string().map_err(mal)?,
                maker: ring.read_string().map_err(mal)?,
                copyright: ring.read_string().map_err(mal)?,
            },
            NonRtServerOpcode::AudioCount => ServerMessage::AudioCount {
                ins: ring.read_u32().map_err(mal)?,
                outs: ring.read_u32().map_err(mal)?,
            },
            NonRtServerOpcode::MidiCount => ServerMessage::MidiCount {
                ins: ring.read_u32().map_err(mal)?,
                outs: ring.read_u32().map_err(mal)?,
            },
            NonRtServerOpcode::ParameterCount => {
                ServerMessage::ParameterCount(ring.read_u32().map_err(mal)?)
            }
            NonRtServerOpcode::ProgramCount => {
                ServerMessage::ProgramCount(ring.read_u32().map_err(mal)?)
            }
            NonRtServerOpcode::MidiProgramCount => {
                ServerMessage::MidiProgramCount(ring.read_u32().map_err(mal)?)
            }
            NonRtServerOpcode::ParameterData1 => ServerMessage::ParameterData1 {
                index: ring.read_u32().map_err(mal)?,
                rindex: ring.read_i32().map_err(mal)?,
                kind: ring.read_u32().map_err(mal)?,
                hints: ring.read_u32().map_err(mal)?,
                midi_channel: ring.read_u8().map_err(mal)?,
                midi_cc: ring.read_i16().map_err(mal)?,
            },
            NonRtServerOpcode::ParameterData2 => ServerMessage::ParameterData2 {
                index: ring.read_u32().map_err(mal)?,
                name: ring.read_string().map_err(mal)?,
                unit: ring.read_string().map_err(mal)?,
            },
            NonRtServerOpcode::ParameterRanges1 => ServerMessage::ParameterRanges1 {
                index: ring.read_u32().map_err(mal)?,
                def: ring.read_f32().map_err(mal)?,
                min: ring.read_f32().map_err(mal)?,
                max: ring.read_f32().map_err(mal)?,
            },
            NonRtServerOpcode::ParameterRanges2 => ServerMessage::ParameterRanges2 {
                index: ring.read_u32().map_err(mal)?,
                step: ring.read_f32().map_err(mal)?,
                step_small: ring.read_f32().map_err(mal)?,
                step_large: ring.read_f32().map_err(mal)?,
            },
            NonRtServerOpcode::ParameterValue => ServerMessage::ParameterValue {
                index: ring.read_u32().map_err(mal)?,
                value: ring.read_f32().map_err(mal)?,
            },
            NonRtServerOpcode::DefaultValue => ServerMessage::DefaultValue {
                index: ring.read_u32().map_err(mal)?,
                value: ring.read_f32().map_err(mal)?,
            },
            NonRtServerOpcode::CurrentProgram => {
                ServerMessage::CurrentProgram(ring.read_i32().map_err(mal)?)
            }
            NonRtServerOpcode::CurrentMidiProgram => {
                ServerMessage::CurrentMidiProgram(ring.read_i32().map_err(mal)?)
            }
            NonRtServerOpcode::ProgramName => ServerMessage::ProgramName {
                index: ring.read_u32().map_err(mal)?,
                name: ring.read_string().map_err(mal)?,
            },
            NonRtServerOpcode::MidiProgramData => ServerMessage::MidiProgramData {
                index: ring.read_u32().map_err(mal)?,
                bank: ring.read_u32().map_err(mal)?,
                program: ring.read_u32().map_err(mal)?,
                name: ring.read_string().map_err(mal)?,
            },
            NonRtServerOpcode::SetCustomData => ServerMessage::SetCustomData {
                kind: ring.read_string().map_err(mal)?,
                key: ring.read_string().map_err(mal)?,
                value: ring.read_string().map_err(mal)?,
            },
            NonRtServerOpcode::SetChunkDataFile => {
                ServerMessage::SetChunkDataFile(ring.read_string().map_err(mal)?)
            }
            NonRtServerOpcode::SetLatency => {
                ServerMessage::SetLatency(ring.read_u32().map_err(mal)?)
            }
            NonRtServerOpcode::UiClosed => ServerMessage::UiClosed,
            NonRtServerOpcode::Ready => ServerMessage::Ready,
            NonRtServerOpcode::Saved => ServerMessage::Saved,
            NonRtServerOpcode::Error => {
                ServerMessage::Error(ring.read_string().map_err(mal)?)
            }
        };
        Ok(message)
    }

    // ---- shutdown -------------------------------------------------------

    /// Orderly shutdown: `Quit` on both rings, a bounded wait for the worker
    /// to acknowledge, then a grace period before the hard kill.
    pub fn shutdown(&mut self) {
        self.quit_sent = true;
        let _ = self.commit_non_rt(|ring| ring.write_opcode(NonRtClientOpcode::Quit.as_u32()));
        if self.rt_ring.write_opcode(RtClientOpcode::Quit.as_u32()) {
            let _ = self.rt_ring.commit_write();
        }
        self.sem_server.post();
        if !self.timed_out {
            let _ = self.sem_client.wait_timeout(Duration::from_secs(3));
        }

        if let Some(mut child) = self.child.take() {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => return,
                    Ok(None) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    _ => {
                        warn!("bridge worker did not exit in time, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                        return;
                    }
                }
            }
        }
    }
}

impl Drop for BridgeTransport {
    fn drop(&mut self) {
        if self.child.is_some() && !self.quit_sent {
            self.shutdown();
        }
    }
}
