//! Module dependency graph with reverse edges and context ownership.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::bundler::{module_id, BundleOutput, ModuleId};
use crate::manifest::{ContextId, ResolvedManifest};

/// A module in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleNode {
    pub id: ModuleId,
    /// Modules this one imports.
    pub forward: BTreeSet<ModuleId>,
    /// Modules importing this one.
    pub reverse: BTreeSet<ModuleId>,
    pub content_hash: String,
    pub side_effects: bool,
    /// Source of a manifest entry point.
    pub is_entry: bool,
    /// Can be replaced in place without reloading its context.
    pub hot_swappable: bool,
    /// Contexts whose entries reach this module.
    pub owners: BTreeSet<ContextId>,
    /// Modules this one registers hot handlers for.
    pub accepts: Vec<ModuleId>,
    /// Contexts in which some importer registered a hot handler for this
    /// module.
    pub accepted_by: BTreeSet<ContextId>,
}

/// Dependency graph of every module reachable from the manifest entries.
#[derive(Debug, Clone, Default)]
pub struct ModuleGraph {
    nodes: BTreeMap<ModuleId, ModuleNode>,
}

impl ModuleGraph {
    /// Build the graph from bundler output, marking entries and owners.
    pub fn build(resolved: &ResolvedManifest, bundle: &BundleOutput) -> Self {
        let mut nodes: BTreeMap<ModuleId, ModuleNode> = bundle
            .modules
            .iter()
            .map(|m| {
                (
                    m.id.clone(),
                    ModuleNode {
                        id: m.id.clone(),
                        forward: BTreeSet::new(),
                        reverse: BTreeSet::new(),
                        content_hash: m.content_hash.clone(),
                        side_effects: m.side_effects,
                        is_entry: false,
                        hot_swappable: false,
                        owners: BTreeSet::new(),
                        accepts: m.accepts.clone(),
                        accepted_by: BTreeSet::new(),
                    },
                )
            })
            .collect();

        for edge in &bundle.edges {
            if !nodes.contains_key(&edge.from) || !nodes.contains_key(&edge.to) {
                continue;
            }
            if let Some(from) = nodes.get_mut(&edge.from) {
                from.forward.insert(edge.to.clone());
            }
            if let Some(to) = nodes.get_mut(&edge.to) {
                to.reverse.insert(edge.from.clone());
            }
        }

        let mut graph = Self { nodes };

        for entry in resolved.bundle_entries() {
            let Some(context) = &entry.context else {
                continue;
            };
            let id = module_id(&entry.source);
            let Some(node) = graph.nodes.get_mut(&id) else {
                continue;
            };
            node.is_entry = true;

            for reached in graph.reachable_from(&id) {
                if let Some(node) = graph.nodes.get_mut(&reached) {
                    node.owners.insert(context.clone());
                }
            }
        }

        for node in graph.nodes.values_mut() {
            node.hot_swappable = !node.is_entry && !node.side_effects;
        }

        // A handler only counts where both modules run
        let accepted: Vec<(ModuleId, BTreeSet<ContextId>)> = graph
            .nodes
            .values()
            .flat_map(|node| node.accepts.iter().map(move |id| (id, node)))
            .filter_map(|(id, acceptor)| {
                let target = graph.nodes.get(id)?;
                let contexts: BTreeSet<ContextId> =
                    acceptor.owners.intersection(&target.owners).cloned().collect();
                Some((id.clone(), contexts))
            })
            .collect();
        for (id, contexts) in accepted {
            if let Some(node) = graph.nodes.get_mut(&id) {
                node.accepted_by.extend(contexts);
            }
        }

        graph
    }

    pub fn node(&self, id: &str) -> Option<&ModuleNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleNode> {
        self.nodes.values()
    }

    /// Modules that are new or whose content hash differs from `previous`.
    pub fn changed_since(&self, previous: &ModuleGraph) -> BTreeSet<ModuleId> {
        self.nodes
            .values()
            .filter(|node| {
                previous
                    .node(&node.id)
                    .map_or(true, |before| before.content_hash != node.content_hash)
            })
            .map(|node| node.id.clone())
            .collect()
    }

    /// Modules `context` must re-import to pick up `changed`.
    ///
    /// Walks importers within `context` from each changed module and stops at
    /// modules the context accepts. Returns `None` when the walk reaches an
    /// entry or a side-effect module first: the context has to reload.
    pub fn hot_boundaries(
        &self,
        context: &str,
        changed: &BTreeSet<ModuleId>,
    ) -> Option<BTreeSet<ModuleId>> {
        let mut boundaries = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&ModuleNode> = changed
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|node| node.owners.contains(context))
            .collect();

        while let Some(node) = queue.pop_front() {
            if !seen.insert(node.id.as_str()) {
                continue;
            }
            if !node.hot_swappable {
                return None;
            }
            if node.accepted_by.contains(context) {
                boundaries.insert(node.id.clone());
                continue;
            }
            queue.extend(
                node.reverse
                    .iter()
                    .filter_map(|id| self.nodes.get(id))
                    .filter(|importer| importer.owners.contains(context)),
            );
        }
        Some(boundaries)
    }

    /// Transitive closure of `changed` over reverse edges, including
    /// `changed` itself. The walk does not continue past entry points.
    pub fn affected_set(&self, changed: &BTreeSet<ModuleId>) -> BTreeSet<ModuleId> {
        let mut affected = BTreeSet::new();
        let mut queue: VecDeque<&ModuleId> = changed.iter().collect();

        while let Some(id) = queue.pop_front() {
            if !affected.insert(id.clone()) {
                continue;
            }
            match self.nodes.get(id) {
                Some(node) if !node.is_entry => queue.extend(node.reverse.iter()),
                _ => {}
            }
        }

        affected.retain(|id| self.nodes.contains_key(id));
        affected
    }

    /// Every module reachable from `start` over forward edges.
    fn reachable_from(&self, start: &str) -> BTreeSet<ModuleId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start.to_string()]);

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                queue.extend(node.forward.iter().cloned());
            }
        }
        seen
    }
}
