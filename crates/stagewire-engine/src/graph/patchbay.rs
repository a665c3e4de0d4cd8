//! Patchbay mode: explicit nodes and directional connections with CV
//! support.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use stagewire_rt::{EventQueue, TransportInfo};

use crate::callback::EngineCallback;
use crate::plugin::Plugin;

/// Reserved groups for graph-external ports.
pub const GROUP_AUDIO_IN: u32 = 1;
pub const GROUP_AUDIO_OUT: u32 = 2;
pub const GROUP_CV_IN: u32 = 3;
pub const GROUP_CV_OUT: u32 = 4;
pub const GROUP_MIDI_IN: u32 = 5;
pub const GROUP_MIDI_OUT: u32 = 6;
/// Plugin groups are `PLUGIN_GROUP_BASE + plugin id`.
pub const PLUGIN_GROUP_BASE: u32 = 10;

/// Port ids inside a plugin group. Audio/CV ports use `rindex + 1`; the
/// event pair sits above every audio port.
pub const PORT_EVENT_IN: u32 = 1000;
pub const PORT_EVENT_OUT: u32 = 1001;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchbayError {
    #[error("unknown patchbay group {0}")]
    UnknownGroup(u32),
    #[error("unknown port {1} in group {0}")]
    UnknownPort(u32, u32),
    #[error("connection {0} does not exist")]
    UnknownConnection(u32),
    #[error("connection would create a cycle")]
    WouldCycle,
    #[error("port directions do not match")]
    DirectionMismatch,
}

/// One directional connection. Ids are stable until `refresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub id: u32,
    pub src_group: u32,
    pub src_port: u32,
    pub dst_group: u32,
    pub dst_port: u32,
}

struct NodeBuffers {
    audio_in: Vec<Vec<f32>>,
    audio_out: Vec<Vec<f32>>,
    cv_in: Vec<Vec<f32>>,
    cv_out: Vec<Vec<f32>>,
    wants_events: bool,
}

pub struct PatchbayGraph {
    connections: Vec<Connection>,
    next_connection_id: u32,
    buffer_size: u32,
    buffers: HashMap<u32, NodeBuffers>,
    external_audio_io: (u32, u32),
    external_cv_io: (u32, u32),
}

impl PatchbayGraph {
    pub fn new(buffer_size: u32, audio_io: (u32, u32), cv_io: (u32, u32)) -> Self {
        Self {
            connections: Vec::new(),
            next_connection_id: 1,
            buffer_size,
            buffers: HashMap::new(),
            external_audio_io: audio_io,
            external_cv_io: cv_io,
        }
    }

    pub fn set_buffer_size(&mut self, frames: u32) {
        self.buffer_size = frames;
        for buffers in self.buffers.values_mut() {
            for buf in buffers
                .audio_in
                .iter_mut()
                .chain(buffers.audio_out.iter_mut())
                .chain(buffers.cv_in.iter_mut())
                .chain(buffers.cv_out.iter_mut())
            {
                buf.clear();
                buf.resize(frames as usize, 0.0);
            }
        }
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Allocates per-node scratch for a plugin; non-RT, called when the
    /// plugin joins the graph and on refresh.
    pub fn ensure_node(&mut self, plugin: &Plugin) {
        let core = plugin.core_snapshot();
        let frames = self.buffer_size as usize;
        let make = |count: usize| (0..count).map(|_| vec![0.0f32; frames]).collect();
        self.buffers.insert(
            plugin.id(),
            NodeBuffers {
                audio_in: make(core.audio_in),
                audio_out: make(core.audio_out),
                cv_in: make(core.cv_in),
                cv_out: make(core.cv_out),
                wants_events: core.has_event_in,
            },
        );
    }

    pub fn remove_node(&mut self, plugin_id: u32) {
        let group = PLUGIN_GROUP_BASE + plugin_id;
        self.buffers.remove(&plugin_id);
        self.connections
            .retain(|c| c.src_group != group && c.dst_group != group);
    }

    /// Default wiring for a newly added plugin: external audio in to the
    /// plugin inputs, plugin outputs to external audio out, and the event
    /// pair when present.
    pub fn auto_connect(&mut self, plugin: &Plugin) {
        let group = PLUGIN_GROUP_BASE + plugin.id();
        let core = plugin.core_snapshot();
        for port in 0..core.audio_in.min(self.external_audio_io.0 as usize) {
            let _ = self.connect(
                GROUP_AUDIO_IN,
                port as u32 + 1,
                group,
                port as u32 + 1,
            );
        }
        for port in 0..core.audio_out.min(self.external_audio_io.1 as usize) {
            let _ = self.connect(
                group,
                (core.audio_in + port) as u32 + 1,
                GROUP_AUDIO_OUT,
                port as u32 + 1,
            );
        }
        if core.has_event_in {
            let _ = self.connect(GROUP_MIDI_IN, 1, group, PORT_EVENT_IN);
        }
        if core.has_event_out {
            let _ = self.connect(group, PORT_EVENT_OUT, GROUP_MIDI_OUT, 1);
        }
    }

    /// Adds a connection and returns its id. Ids stay valid until
    /// `refresh`, which may renumber.
    pub fn connect(
        &mut self,
        src_group: u32,
        src_port: u32,
        dst_group: u32,
        dst_port: u32,
    ) -> Result<u32, PatchbayError> {
        if src_group == dst_group {
            return Err(PatchbayError::WouldCycle);
        }
        if self.would_cycle(src_group, dst_group) {
            return Err(PatchbayError::WouldCycle);
        }
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        self.connections.push(Connection {
            id,
            src_group,
            src_port,
            dst_group,
            dst_port,
        });
        debug!(id, src_group, src_port, dst_group, dst_port, "patchbay connect");
        Ok(id)
    }

    pub fn disconnect(&mut self, id: u32) -> Result<(), PatchbayError> {
        let before = self.connections.len();
        self.connections.retain(|c| c.id != id);
        if self.connections.len() == before {
            return Err(PatchbayError::UnknownConnection(id));
        }
        Ok(())
    }

    /// Shifts plugin groups down after a table removal so connections keep
    /// following their plugins.
    pub fn renumber_after_removal(&mut self, removed_id: u32) {
        let removed_group = PLUGIN_GROUP_BASE + removed_id;
        let shift = |group: &mut u32| {
            if *group > removed_group && *group >= PLUGIN_GROUP_BASE {
                *group -= 1;
            }
        };
        for connection in &mut self.connections {
            shift(&mut connection.src_group);
            shift(&mut connection.dst_group);
        }
        let mut ids: Vec<u32> = self.buffers.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if id > removed_id {
                if let Some(buffers) = self.buffers.remove(&id) {
                    self.buffers.insert(id - 1, buffers);
                }
            }
        }
    }

    /// Swaps two plugin groups after a table switch.
    pub fn swap_groups(&mut self, id_a: u32, id_b: u32) {
        let group_a = PLUGIN_GROUP_BASE + id_a;
        let group_b = PLUGIN_GROUP_BASE + id_b;
        let swap = |group: &mut u32| {
            if *group == group_a {
                *group = group_b;
            } else if *group == group_b {
                *group = group_a;
            }
        };
        for connection in &mut self.connections {
            swap(&mut connection.src_group);
            swap(&mut connection.dst_group);
        }
        let a = self.buffers.remove(&id_a);
        let b = self.buffers.remove(&id_b);
        if let Some(buffers) = a {
            self.buffers.insert(id_b, buffers);
        }
        if let Some(buffers) = b {
            self.buffers.insert(id_a, buffers);
        }
    }

    fn would_cycle(&self, src_group: u32, dst_group: u32) -> bool {
        // Follow existing edges from dst; reaching src would close a loop.
        let mut stack = vec![dst_group];
        let mut seen = vec![];
        while let Some(group) = stack.pop() {
            if group == src_group {
                return true;
            }
            if seen.contains(&group) {
                continue;
            }
            seen.push(group);
            for connection in &self.connections {
                if connection.src_group == group {
                    stack.push(connection.dst_group);
                }
            }
        }
        false
    }

    /// Rebuilds node scratch and emits the complete topology snapshot as
    /// engine callbacks.
    pub fn refresh(&mut self, plugins: &[Arc<Plugin>]) -> Vec<EngineCallback> {
        let mut callbacks = Vec::new();
        callbacks.push(EngineCallback::PatchbayClientAdded {
            group: GROUP_AUDIO_IN,
            name: String::from("Audio Input"),
        });
        callbacks.push(EngineCallback::PatchbayClientAdded {
            group: GROUP_AUDIO_OUT,
            name: String::from("Audio Output"),
        });
        callbacks.push(EngineCallback::PatchbayClientAdded {
            group: GROUP_MIDI_IN,
            name: String::from("Midi Input"),
        });
        callbacks.push(EngineCallback::PatchbayClientAdded {
            group: GROUP_MIDI_OUT,
            name: String::from("Midi Output"),
        });
        if self.external_cv_io.0 > 0 || self.external_cv_io.1 > 0 {
            callbacks.push(EngineCallback::PatchbayClientAdded {
                group: GROUP_CV_IN,
                name: String::from("CV Input"),
            });
            callbacks.push(EngineCallback::PatchbayClientAdded {
                group: GROUP_CV_OUT,
                name: String::from("CV Output"),
            });
        }

        for plugin in plugins {
            self.ensure_node(plugin);
            let group = PLUGIN_GROUP_BASE + plugin.id();
            callbacks.push(EngineCallback::PatchbayClientAdded {
                group,
                name: plugin.name(),
            });
            for (port, name) in plugin.port_names() {
                callbacks.push(EngineCallback::PatchbayPortAdded {
                    group,
                    port,
                    flags: 0,
                    name,
                });
            }
        }

        for connection in &self.connections {
            callbacks.push(EngineCallback::PatchbayConnectionAdded {
                connection: connection.id,
                src_group: connection.src_group,
                src_port: connection.src_port,
                dst_group: connection.dst_group,
                dst_port: connection.dst_port,
            });
        }
        callbacks
    }

    /// Topological order over plugin groups; nodes untouched by
    /// connections process last so they still run (silent inputs).
    fn processing_order(&self, plugins: &[Arc<Plugin>]) -> Vec<usize> {
        let ids: Vec<u32> = plugins.iter().map(|p| p.id()).collect();
        let index_of = |group: u32| -> Option<usize> {
            group
                .checked_sub(PLUGIN_GROUP_BASE)
                .and_then(|id| ids.iter().position(|&p| p == id))
        };

        let mut indegree = vec![0usize; plugins.len()];
        let mut edges: Vec<(usize, usize)> = Vec::new();
        for connection in &self.connections {
            if let (Some(src), Some(dst)) =
                (index_of(connection.src_group), index_of(connection.dst_group))
            {
                edges.push((src, dst));
                indegree[dst] += 1;
            }
        }

        let mut order = Vec::with_capacity(plugins.len());
        let mut ready: Vec<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        while let Some(index) = ready.pop() {
            order.push(index);
            for &(src, dst) in &edges {
                if src == index {
                    indegree[dst] -= 1;
                    if indegree[dst] == 0 {
                        ready.push(dst);
                    }
                }
            }
        }
        // Connections are cycle-checked, so this covers every node.
        order
    }

    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &mut self,
        plugins: &[Arc<Plugin>],
        audio_in: &[&[f32]],
        audio_out: &mut [&mut [f32]],
        cv_in: &[&[f32]],
        cv_out: &mut [&mut [f32]],
        events_in: &EventQueue,
        events_out: &mut EventQueue,
        time: &TransportInfo,
        frames: u32,
    ) {
        let nframes = frames as usize;
        for out in audio_out.iter_mut() {
            out[..nframes].fill(0.0);
        }
        for out in cv_out.iter_mut() {
            out[..nframes].fill(0.0);
        }

        let order = self.processing_order(plugins);
        for index in order {
            let plugin = &plugins[index];
            if !plugin.is_enabled() {
                continue;
            }
            let group = PLUGIN_GROUP_BASE + plugin.id();
            let Some(mut node) = self.buffers.remove(&plugin.id()) else {
                continue;
            };

            for buf in node.audio_in.iter_mut().chain(node.cv_in.iter_mut()) {
                buf[..nframes].fill(0.0);
            }

            // Pull inputs: external ports and upstream node outputs.
            for connection in &self.connections {
                if connection.dst_group != group {
                    continue;
                }
                let dst_port = connection.dst_port;
                let audio_in_count = node.audio_in.len() as u32;
                if dst_port >= 1 && dst_port <= audio_in_count {
                    let target = (dst_port - 1) as usize;
                    match connection.src_group {
                        GROUP_AUDIO_IN => {
                            if let Some(source) = audio_in.get((connection.src_port - 1) as usize) {
                                accumulate(&mut node.audio_in[target], source, nframes);
                            }
                        }
                        src if src >= PLUGIN_GROUP_BASE => {
                            let src_id = src - PLUGIN_GROUP_BASE;
                            if let Some(upstream) = self.buffers.get(&src_id) {
                                let base = upstream.audio_in.len() as u32;
                                let port = connection.src_port;
                                if port > base {
                                    if let Some(source) =
                                        upstream.audio_out.get((port - base - 1) as usize)
                                    {
                                        accumulate(&mut node.audio_in[target], source, nframes);
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                } else if connection.src_group == GROUP_CV_IN {
                    let cv_base = audio_in_count + node.audio_out.len() as u32;
                    if dst_port > cv_base {
                        let target = (dst_port - cv_base - 1) as usize;
                        if let (Some(slot), Some(source)) = (
                            node.cv_in.get_mut(target),
                            cv_in.get((connection.src_port - 1) as usize),
                        ) {
                            accumulate(slot, source, nframes);
                        }
                    }
                }
            }

            let wants_events = node.wants_events
                && self
                    .connections
                    .iter()
                    .any(|c| c.src_group == GROUP_MIDI_IN && c.dst_group == group);

            {
                let ins: Vec<&[f32]> = node.audio_in.iter().map(|b| &b[..nframes]).collect();
                let cv_ins: Vec<&[f32]> = node.cv_in.iter().map(|b| &b[..nframes]).collect();
                let mut outs: Vec<&mut [f32]> =
                    node.audio_out.iter_mut().map(|b| &mut b[..nframes]).collect();
                let mut cv_outs: Vec<&mut [f32]> =
                    node.cv_out.iter_mut().map(|b| &mut b[..nframes]).collect();
                let event_slice: &[stagewire_rt::EngineEvent] = if wants_events {
                    events_in.as_slice()
                } else {
                    &[]
                };
                plugin.process_rt(
                    &ins,
                    &mut outs,
                    &cv_ins,
                    &mut cv_outs,
                    event_slice,
                    events_out,
                    time,
                    frames,
                );
            }

            // Push outputs that target the external sinks.
            for connection in &self.connections {
                if connection.src_group != group {
                    continue;
                }
                let base = node.audio_in.len() as u32;
                match connection.dst_group {
                    GROUP_AUDIO_OUT => {
                        if connection.src_port > base {
                            if let (Some(source), Some(sink)) = (
                                node.audio_out.get((connection.src_port - base - 1) as usize),
                                audio_out.get_mut((connection.dst_port - 1) as usize),
                            ) {
                                accumulate_mut(sink, source, nframes);
                            }
                        }
                    }
                    GROUP_CV_OUT => {
                        let cv_base = base + node.audio_out.len() as u32 + node.cv_in.len() as u32;
                        if connection.src_port > cv_base {
                            if let (Some(source), Some(sink)) = (
                                node.cv_out.get((connection.src_port - cv_base - 1) as usize),
                                cv_out.get_mut((connection.dst_port - 1) as usize),
                            ) {
                                accumulate_mut(sink, source, nframes);
                            }
                        }
                    }
                    _ => {}
                }
            }

            self.buffers.insert(plugin.id(), node);
        }
    }
}

fn accumulate(target: &mut [f32], source: &[f32], frames: usize) {
    for (t, s) in target[..frames].iter_mut().zip(&source[..frames]) {
        *t += *s;
    }
}

fn accumulate_mut(target: &mut [f32], source: &[f32], frames: usize) {
    for (t, s) in target[..frames].iter_mut().zip(&source[..frames]) {
        *t += *s;
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

    fn run(
        patchbay: &mut PatchbayGraph,
        plugins: &[Arc<Plugin>],
        input: &[f32],
    ) -> (Vec<f32>, Vec<f32>) {
        let in_r = input.to_vec();
        let ins: Vec<&[f32]> = vec![input, &in_r];
        let mut out_l = vec![0.0f32; input.len()];
        let mut out_r = vec![0.0f32; input.len()];
        let mut events_out = EventQueue::new();
        {
            let mut outs: Vec<&mut [f32]> = vec![&mut out_l, &mut out_r];
            patchbay.process(
                plugins,
                &ins,
                &mut outs,
                &[],
                &mut [],
                &EventQueue::new(),
                &mut events_out,
                &TransportInfo::default(),
                input.len() as u32,
            );
        }
        (out_l, out_r)
    }

    #[test]
    fn auto_connected_plugin_reaches_outputs() {
        let mut patchbay = PatchbayGraph::new(64, (2, 2), (0, 0));
        let plugin = gain(0, 0.5);
        patchbay.ensure_node(&plugin);
        patchbay.auto_connect(&plugin);
        let (out_l, _) = run(&mut patchbay, &[plugin], &[1.0f32; 64]);
        assert!(out_l.iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn chained_plugins_process_in_topological_order() {
        let mut patchbay = PatchbayGraph::new(64, (2, 2), (0, 0));
        let first = gain(0, 0.5);
        let second = gain(1, 0.5);
        patchbay.ensure_node(&first);
        patchbay.ensure_node(&second);
        // in -> first -> second -> out, wired manually.
        patchbay.connect(GROUP_AUDIO_IN, 1, 10, 1).unwrap();
        patchbay.connect(GROUP_AUDIO_IN, 2, 10, 2).unwrap();
        patchbay.connect(10, 3, 11, 1).unwrap();
        patchbay.connect(10, 4, 11, 2).unwrap();
        patchbay.connect(11, 3, GROUP_AUDIO_OUT, 1).unwrap();
        patchbay.connect(11, 4, GROUP_AUDIO_OUT, 2).unwrap();
        let (out_l, out_r) = run(&mut patchbay, &[first, second], &[1.0f32; 64]);
        assert!(out_l.iter().all(|s| (*s - 0.25).abs() < 1e-6));
        assert!(out_r.iter().all(|s| (*s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn cycles_are_rejected() {
        let mut patchbay = PatchbayGraph::new(64, (2, 2), (0, 0));
        patchbay.connect(10, 3, 11, 1).unwrap();
        let err = patchbay.connect(11, 3, 10, 1).unwrap_err();
        assert_eq!(err, PatchbayError::WouldCycle);
    }

    #[test]
    fn disconnect_by_id_removes_the_edge() {
        let mut patchbay = PatchbayGraph::new(64, (2, 2), (0, 0));
        let plugin = gain(0, 1.0);
        patchbay.ensure_node(&plugin);
        patchbay.auto_connect(&plugin);
        let id = patchbay.connections()[0].id;
        patchbay.disconnect(id).unwrap();
        assert!(patchbay.connections().iter().all(|c| c.id != id));
        assert_eq!(
            patchbay.disconnect(id),
            Err(PatchbayError::UnknownConnection(id))
        );
    }

    #[test]
    fn unconnected_graph_outputs_silence() {
        let mut patchbay = PatchbayGraph::new(64, (2, 2), (0, 0));
        let plugin = gain(0, 1.0);
        patchbay.ensure_node(&plugin);
        let (out_l, _) = run(&mut patchbay, &[plugin], &[1.0f32; 64]);
        assert!(out_l.iter().all(|s| *s == 0.0));
    }
}
