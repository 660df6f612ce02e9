//! Turns file changes into update packets and fans them out.
//!
//! The broker owns the current module graph and the set of open channels.
//! Planning is a free function run on the recompute path without the broker
//! lock; sends are non-blocking and a failed send only drops that channel.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use tokio::sync::mpsc::UnboundedSender;

use super::protocol::{
    ConnectionId, ModuleUpdate, PacketKind, ServerMessage, Targets, UpdatePacket,
};
use crate::bundler::{content_hash, module_id, ModuleId};
use crate::context::ContextKind;
use crate::error::{CrxError, CrxResult};
use crate::manifest::{ContextId, EntryKind, BACKGROUND};
use crate::pipeline::BuildState;
use crate::worker::{PersistentStorage, Submission, WorkerLifecycle};

/// Project-relative paths the broker treats specially.
#[derive(Debug, Clone)]
pub struct BrokerPaths {
    pub manifest: PathBuf,
    pub public_dir: PathBuf,
}

/// A batch of changed files, sorted by what they mean for the bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub manifest: bool,
    pub modules: BTreeSet<ModuleId>,
    /// Contexts whose HTML page changed.
    pub pages: BTreeSet<ContextId>,
    /// Icons and public files.
    pub assets: BTreeSet<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        !self.manifest && self.modules.is_empty() && self.pages.is_empty() && self.assets.is_empty()
    }

    /// Fold in a later batch.
    pub fn merge(&mut self, other: ChangeSet) {
        self.manifest |= other.manifest;
        self.modules.extend(other.modules);
        self.pages.extend(other.pages);
        self.assets.extend(other.assets);
    }
}

/// Plan packets for moving open contexts from `previous` to `next`.
///
/// Modules are compared by content hash across the whole graph, so edits
/// from batches whose rebuild failed are still picked up. `load` compiles a
/// hot module; a module that fails to load escalates its contexts to a full
/// reload. Runs without the broker lock: `load` may shell out.
pub fn plan_updates(
    changes: &ChangeSet,
    previous: &BuildState,
    next: &BuildState,
    load: &mut dyn FnMut(&ModuleId) -> CrxResult<String>,
) -> Vec<UpdatePacket> {
    if changes.manifest {
        let mut packets: Vec<UpdatePacket> = previous
            .contexts
            .iter()
            .filter(|c| next.context(&c.id).is_none())
            .map(|c| UpdatePacket::prune(c.id.clone()))
            .collect();
        packets.push(UpdatePacket::full_reload(Targets::Broadcast));
        return packets;
    }
    if !changes.assets.is_empty() {
        return vec![UpdatePacket::full_reload(Targets::Broadcast)];
    }

    let graph = &next.graph;
    let changed = graph.changed_since(&previous.graph);
    let affected = graph.affected_set(&changed);

    let mut reload: BTreeSet<ContextId> = changes
        .pages
        .iter()
        .filter(|c| next.context(c).is_some())
        .cloned()
        .collect();
    let mut hot: BTreeMap<ContextId, Vec<ModuleId>> = BTreeMap::new();

    for context in &next.contexts {
        if reload.contains(&context.id) {
            continue;
        }
        let touched = affected
            .iter()
            .any(|id| graph.node(id).is_some_and(|n| n.owners.contains(&context.id)));
        if !touched {
            continue;
        }

        match graph.hot_boundaries(&context.id, &changed) {
            Some(boundaries) if !boundaries.is_empty() => {
                hot.insert(context.id.clone(), boundaries.into_iter().collect());
            }
            Some(_) => {}
            None => {
                tracing::debug!("Escalating {} to full reload", context.id);
                reload.insert(context.id.clone());
            }
        }
    }

    let mut loaded: BTreeMap<ModuleId, Option<ModuleUpdate>> = BTreeMap::new();
    let mut groups: BTreeMap<Vec<ModuleId>, BTreeSet<ContextId>> = BTreeMap::new();

    for (context, modules) in hot {
        let mut failed = false;
        for id in &modules {
            let update = loaded.entry(id.clone()).or_insert_with(|| match load(id) {
                Ok(code) => Some(ModuleUpdate::new(id, &content_hash(code.as_bytes()), code)),
                Err(e) => {
                    tracing::warn!("Cannot hot-apply {}: {}", id, e);
                    None
                }
            });
            failed |= update.is_none();
        }
        if failed {
            reload.insert(context);
        } else {
            groups.entry(modules).or_default().insert(context);
        }
    }

    let mut packets = Vec::new();
    if !reload.is_empty() {
        packets.push(UpdatePacket::full_reload(Targets::Contexts(reload)));
    }
    for (modules, contexts) in groups {
        let updates = modules
            .iter()
            .filter_map(|id| loaded.get(id).cloned().flatten())
            .collect();
        packets.push(UpdatePacket::hot_apply(Targets::Contexts(contexts), updates));
    }
    packets
}

struct Channel {
    context: ContextId,
    url: Option<String>,
    sender: UnboundedSender<ServerMessage>,
}

type Worker = WorkerLifecycle<Box<dyn PersistentStorage>>;

pub struct HmrBroker {
    state: BuildState,
    paths: BrokerPaths,
    channels: BTreeMap<ConnectionId, Channel>,
    next_id: u64,
    worker: Option<Worker>,
}

impl HmrBroker {
    pub fn new(state: BuildState, paths: BrokerPaths) -> Self {
        Self {
            state,
            paths,
            channels: BTreeMap::new(),
            next_id: 1,
            worker: None,
        }
    }

    /// Track the background worker through `storage`.
    pub fn with_worker_storage(mut self, storage: Box<dyn PersistentStorage>) -> Self {
        self.worker = Some(WorkerLifecycle::new(storage));
        self
    }

    pub fn state(&self) -> &BuildState {
        &self.state
    }

    pub fn worker(&self) -> Option<&Worker> {
        self.worker.as_ref()
    }

    pub fn connection_count(&self) -> usize {
        self.channels.len()
    }

    /// Context of an open channel.
    pub fn channel_context(&self, id: ConnectionId) -> Option<&str> {
        self.channels.get(&id).map(|c| c.context.as_str())
    }

    /// Register a channel for `context`.
    ///
    /// Unknown contexts get a `prune` and are not registered. Returns `None`
    /// when the channel was not registered.
    pub fn connect(
        &mut self,
        context: &str,
        url: Option<String>,
        sender: UnboundedSender<ServerMessage>,
    ) -> Option<ConnectionId> {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        if self.state.context(context).is_none() {
            tracing::debug!("Pruning channel {} for unknown context {}", id, context);
            let _ = sender.send(ServerMessage::Prune {
                context_id: context.to_string(),
            });
            return None;
        }

        let handshake = ServerMessage::Connected {
            connection_id: id,
            context_id: context.to_string(),
        };
        if sender.send(handshake).is_err() {
            return None;
        }

        self.channels.insert(
            id,
            Channel {
                context: context.to_string(),
                url,
                sender,
            },
        );
        tracing::info!("Context {} connected ({})", context, id);

        if self.is_worker_context(context) {
            let replay = self.worker_started();
            if let Some(packet) = replay {
                self.send(id, packet.message_for(context));
            }
        }

        Some(id)
    }

    /// Forget a channel. The last worker channel closing means the host
    /// stopped the worker.
    pub fn disconnect(&mut self, id: ConnectionId) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        tracing::info!("Context {} disconnected ({})", channel.context, id);

        if self.is_worker_context(&channel.context) && self.channels_for(&channel.context).is_empty() {
            if let Some(worker) = self.worker.as_mut() {
                log_worker_error(worker.host_killed());
            }
        }
    }

    /// A client acknowledged its last update.
    pub fn applied(&mut self, id: ConnectionId) {
        let Some(context) = self.channels.get(&id).map(|c| c.context.clone()) else {
            return;
        };
        if !self.is_worker_context(&context) {
            return;
        }

        let next = match self.worker.as_mut().map(|w| w.applied()) {
            Some(Ok(next)) => next,
            Some(Err(e)) => {
                log_worker_error(Err(e));
                None
            }
            None => None,
        };
        if let Some(packet) = next {
            for channel in self.channels_for(&context) {
                self.send(channel, packet.message_for(&context));
            }
        }
    }

    /// Sort root-relative `paths` by their role in the current build.
    pub fn classify_changes(&self, paths: &[PathBuf]) -> ChangeSet {
        let mut changes = ChangeSet::default();
        let resolved = &self.state.resolved;

        for path in paths {
            if *path == self.paths.manifest {
                changes.manifest = true;
                continue;
            }
            if path.starts_with(&self.paths.public_dir) {
                changes.assets.insert(path.clone());
                continue;
            }
            if let Some(entry) = resolved.entries.iter().find(|e| e.source == *path) {
                match (entry.kind, &entry.context) {
                    (EntryKind::Html, Some(context)) => {
                        changes.pages.insert(context.clone());
                        continue;
                    }
                    (EntryKind::Asset, _) => {
                        changes.assets.insert(path.clone());
                        continue;
                    }
                    _ => {}
                }
            }

            let id = module_id(path);
            if self.state.graph.contains(&id) {
                changes.modules.insert(id);
            } else {
                tracing::debug!("Ignoring change outside the module graph: {}", path.display());
            }
        }

        changes
    }

    /// Swap in the rebuilt state; returns the one it replaces.
    pub fn replace_state(&mut self, next: BuildState) -> BuildState {
        std::mem::replace(&mut self.state, next)
    }

    /// Send packets to the channels they target. Returns the number of
    /// frames sent.
    pub fn dispatch(&mut self, packets: &[UpdatePacket]) -> usize {
        let mut sent = 0;

        for packet in packets {
            let through_worker = packet.kind != PacketKind::Prune
                && self.worker.is_some()
                && packet.targets.includes(BACKGROUND)
                && self.is_worker_context(BACKGROUND);

            let worker_packet = if through_worker {
                self.submit_to_worker(packet.clone())
            } else {
                None
            };

            let recipients: Vec<(ConnectionId, ContextId)> = self
                .channels
                .iter()
                .filter(|(_, ch)| packet.targets.includes(&ch.context))
                .filter(|(_, ch)| !(through_worker && ch.context == BACKGROUND))
                .filter(|(_, ch)| self.reaches_page(packet, ch))
                .map(|(id, ch)| (*id, ch.context.clone()))
                .collect();

            for (id, context) in recipients {
                if self.send(id, packet.message_for(&context)) {
                    sent += 1;
                }
                if packet.kind == PacketKind::Prune {
                    self.channels.remove(&id);
                }
            }

            if let Some(packet) = worker_packet {
                for id in self.channels_for(BACKGROUND) {
                    if self.send(id, packet.message_for(BACKGROUND)) {
                        sent += 1;
                    }
                }
            }
        }

        sent
    }

    /// Content-script packets go only to pages the rule matches. A
    /// content-script channel that never reported its page gets none.
    fn reaches_page(&self, packet: &UpdatePacket, channel: &Channel) -> bool {
        if packet.targets == Targets::Broadcast || packet.kind == PacketKind::Prune {
            return true;
        }
        match self.state.context(&channel.context) {
            Some(context) if context.kind == ContextKind::ContentScript => {
                channel.url.as_deref().is_some_and(|url| context.runs_on(url))
            }
            _ => true,
        }
    }

    fn submit_to_worker(&mut self, packet: UpdatePacket) -> Option<UpdatePacket> {
        let worker = self.worker.as_mut()?;
        match worker.submit(packet) {
            Ok(Submission::Deliver(packet)) => Some(packet),
            Ok(Submission::Coalesced) => {
                tracing::debug!("Worker busy, update coalesced");
                None
            }
            Ok(Submission::Deferred) => {
                tracing::debug!("Worker dormant, update deferred");
                None
            }
            Err(e) => {
                log_worker_error(Err(e));
                None
            }
        }
    }

    /// Bring the worker model up for a new connection; returns a replay.
    fn worker_started(&mut self) -> Option<UpdatePacket> {
        let worker = self.worker.as_mut()?;
        // A reconnect without a close frame means the old instance died
        if let Err(e) = worker.host_killed().and_then(|_| worker.start()) {
            log_worker_error(Err(e));
            return None;
        }
        match worker.activate() {
            Ok(replay) => replay,
            Err(e) => {
                log_worker_error(Err(e));
                None
            }
        }
    }

    fn is_worker_context(&self, context: &str) -> bool {
        self.worker.is_some()
            && self
                .state
                .context(context)
                .is_some_and(|c| c.is_ephemeral_worker())
    }

    fn channels_for(&self, context: &str) -> Vec<ConnectionId> {
        self.channels
            .iter()
            .filter(|(_, ch)| ch.context == context)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Non-blocking send. A closed channel is dropped, never retried.
    fn send(&mut self, id: ConnectionId, message: ServerMessage) -> bool {
        let Some(channel) = self.channels.get(&id) else {
            return false;
        };
        match channel.sender.send(message) {
            Ok(()) => true,
            Err(_) => {
                let err = CrxError::ChannelDelivery {
                    connection: id.to_string(),
                    message: format!("{} channel closed", channel.context),
                };
                tracing::warn!("{}", err);
                self.channels.remove(&id);
                false
            }
        }
    }
}

fn log_worker_error(result: CrxResult<()>) {
    if let Err(e) = result {
        tracing::warn!("Worker lifecycle: {}", e);
    }
}
