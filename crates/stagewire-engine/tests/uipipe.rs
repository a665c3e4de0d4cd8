//! UI pipe protocol tests: the engine side of the command surface, driven
//! by an in-memory stand-in for the UI process.

use std::io::{Read, Write};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use stagewire_engine::{Engine, EngineOptions, PluginType, ProcessMode, UiPipe};

struct TxWriter(mpsc::Sender<Vec<u8>>);

impl Write for TxWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.0.send(buf.to_vec());
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct RxReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for RxReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(data) => self.pending = data,
                Err(_) => return Ok(0),
            }
        }
        let take = buf.len().min(self.pending.len());
        buf[..take].copy_from_slice(&self.pending[..take]);
        self.pending.drain(..take);
        Ok(take)
    }
}

/// The test's half of the pipe: write commands in, collect frames out.
struct FakeUi {
    to_engine: mpsc::Sender<Vec<u8>>,
    from_engine: mpsc::Receiver<Vec<u8>>,
    collected: String,
}

impl FakeUi {
    fn connect(engine: &Engine) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel();
        let pipe = UiPipe::new(
            RxReader {
                rx: cmd_rx,
                pending: Vec::new(),
            },
            TxWriter(out_tx),
        );
        engine.set_ui_pipe(pipe);
        Self {
            to_engine: cmd_tx,
            from_engine: out_rx,
            collected: String::new(),
        }
    }

    fn send(&self, text: &str) {
        self.to_engine.send(text.as_bytes().to_vec()).unwrap();
        // Give the reader thread a moment to queue the lines.
        std::thread::sleep(Duration::from_millis(50));
    }

    fn drain(&mut self) -> &str {
        let deadline = Instant::now() + Duration::from_millis(200);
        while Instant::now() < deadline {
            match self.from_engine.recv_timeout(Duration::from_millis(20)) {
                Ok(chunk) => self.collected.push_str(&String::from_utf8_lossy(&chunk)),
                Err(_) => break,
            }
        }
        &self.collected
    }
}

fn engine() -> std::sync::Arc<Engine> {
    let options = EngineOptions {
        process_mode: ProcessMode::Rack,
        ..EngineOptions::default()
    };
    let engine = Engine::new(options, 128, 48_000.0);
    engine.activate();
    engine
}

#[test]
fn set_volume_reports_the_internal_parameter_index() {
    let engine = engine();
    engine
        .add_plugin(PluginType::Internal, "", None, "gain", 0, false)
        .unwrap();
    let mut ui = FakeUi::connect(&engine);

    ui.send("set_volume\n0\n0.5\n");
    engine.ui_idle();

    let output = ui.drain();
    assert!(
        output.contains("PARAMVAL_0:-3\n0.500000\n"),
        "missing volume frame in:\n{output}"
    );
    assert!((engine.plugin(0).unwrap().mix.volume() - 0.5).abs() < 1e-6);
}

#[test]
fn unknown_commands_get_an_error_reply() {
    let engine = engine();
    let mut ui = FakeUi::connect(&engine);

    ui.send("warp_reality\n");
    engine.ui_idle();

    let output = ui.drain();
    assert!(output.contains("error\n"), "no error reply in:\n{output}");
    assert!(output.contains("warp_reality"));
}

#[test]
fn add_plugin_command_loads_and_reports() {
    let engine = engine();
    let mut ui = FakeUi::connect(&engine);

    ui.send("add_plugin\ninternal\n(null)\n(null)\ngain\n0\nfalse\n");
    engine.ui_idle();

    assert_eq!(engine.plugin_count(), 1);
    let output = ui.drain();
    // PluginAdded flows out as a generic engine callback frame.
    assert!(output.contains("ENGINE_CALLBACK_1\n"), "in:\n{output}");
}

#[test]
fn set_parameter_value_command_applies_coercion() {
    let engine = engine();
    engine
        .add_plugin(PluginType::Internal, "", None, "gain", 0, false)
        .unwrap();
    let mut ui = FakeUi::connect(&engine);

    ui.send("set_parameter_value\n0\n0\n9.0\n");
    engine.ui_idle();

    assert_eq!(engine.plugin(0).unwrap().parameter_value(0), 2.0);
    let output = ui.drain();
    assert!(output.contains("PARAMVAL_0:0\n2.000000\n"), "in:\n{output}");
}

#[test]
fn ui_show_resends_engine_info_and_options() {
    let engine = engine();
    engine
        .add_plugin(PluginType::Internal, "", None, "gain", 0, false)
        .unwrap();
    let mut ui = FakeUi::connect(&engine);

    engine.ui_show(true);

    let output = ui.drain();
    assert!(output.contains("max-plugin-number\n"));
    assert!(output.contains("buffer-size\n128\n"));
    assert!(output.contains("sample-rate\n48000.000000\n"));
    assert!(output.contains("ENGINE_OPTION_1\n"));
    assert!(output.contains("PLUGIN_INFO_0\n"));
    assert!(output.contains("PARAMETER_COUNT_0\n1\n"));
}

#[test]
fn idle_emits_runtime_info_and_transport() {
    let engine = engine();
    let mut ui = FakeUi::connect(&engine);

    engine.ui_idle();

    let output = ui.drain();
    assert!(output.contains("runtime-info\n"));
    assert!(output.contains("transport\n"));
}

#[test]
fn send_midi_note_command_reaches_the_plugin_mailbox() {
    let engine = engine();
    engine
        .add_plugin(PluginType::Internal, "", None, "spreader", 0, false)
        .unwrap();
    let ui = FakeUi::connect(&engine);

    ui.send("send_midi_note\n0\n0\n60\n100\n");
    engine.ui_idle();

    // The note sits in the mailbox until the next audio cycle drains it,
    // where it surfaces as a post-RT note-on callback.
    let input = vec![0.0f32; 128];
    let mut out_l = vec![0.0f32; 128];
    let mut out_r = vec![0.0f32; 128];
    {
        let ins: Vec<&[f32]> = vec![&input, &input];
        let mut outs: Vec<&mut [f32]> = vec![&mut out_l, &mut out_r];
        let mut sink = |_: &stagewire_rt::EngineEvent| {};
        engine.process(&ins, &mut outs, &[], &mut [], &[], &mut sink, 128);
    }
    engine.ui_idle();

    let mut ui = ui;
    let output = ui.drain();
    // NOTE_ON is callback opcode 13.
    assert!(output.contains("ENGINE_CALLBACK_13\n"), "in:\n{output}");
}
