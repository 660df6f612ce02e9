//! Dev-channel wire protocol.
//!
//! JSON text frames over a WebSocket. Every frame is an object with a `type`
//! field.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bundler::ModuleId;
use crate::manifest::ContextId;

/// Opaque id of one connected context instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// New body of one hot-applied module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleUpdate {
    pub id: ModuleId,
    pub hash: String,
    pub code: String,
    /// Path of the compiled module relative to the hot-module directory.
    pub url: String,
}

impl ModuleUpdate {
    pub fn new(id: &ModuleId, hash: &str, code: String) -> Self {
        Self {
            id: id.clone(),
            hash: hash.to_string(),
            code,
            url: hot_module_path(id),
        }
    }
}

/// File name a hot-applied module is written under.
pub fn hot_module_path(id: &ModuleId) -> String {
    Path::new(id)
        .with_extension("js")
        .to_string_lossy()
        .replace('\\', "/")
}

/// Messages sent from the dev server to a bootstrap client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
        #[serde(rename = "contextId")]
        context_id: ContextId,
    },
    Update {
        modules: Vec<ModuleUpdate>,
    },
    FullReload,
    Prune {
        #[serde(rename = "contextId")]
        context_id: ContextId,
    },
}

/// Messages sent from a bootstrap client to the dev server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// First frame on every connection.
    Hello {
        #[serde(rename = "contextId")]
        context_id: ContextId,
        /// Page URL, sent by content scripts.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// The last update was applied.
    Applied,
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PacketKind {
    HotApply,
    FullReload,
    Prune,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Targets {
    /// Every connected channel.
    Broadcast,
    Contexts(BTreeSet<ContextId>),
}

impl Targets {
    pub fn context(id: impl Into<ContextId>) -> Self {
        Targets::Contexts(BTreeSet::from([id.into()]))
    }

    pub fn includes(&self, context: &str) -> bool {
        match self {
            Targets::Broadcast => true,
            Targets::Contexts(set) => set.contains(context),
        }
    }
}

/// One unit of work for the dev channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePacket {
    pub targets: Targets,
    pub kind: PacketKind,
    /// Changed modules; empty unless `kind` is hot-apply.
    #[serde(default)]
    pub modules: Vec<ModuleUpdate>,
}

impl UpdatePacket {
    pub fn hot_apply(targets: Targets, modules: Vec<ModuleUpdate>) -> Self {
        Self {
            targets,
            kind: PacketKind::HotApply,
            modules,
        }
    }

    pub fn full_reload(targets: Targets) -> Self {
        Self {
            targets,
            kind: PacketKind::FullReload,
            modules: Vec::new(),
        }
    }

    pub fn prune(context: impl Into<ContextId>) -> Self {
        Self {
            targets: Targets::context(context),
            kind: PacketKind::Prune,
            modules: Vec::new(),
        }
    }

    /// Frame sent to a channel of `context`.
    pub fn message_for(&self, context: &str) -> ServerMessage {
        match self.kind {
            PacketKind::HotApply => ServerMessage::Update {
                modules: self.modules.clone(),
            },
            PacketKind::FullReload => ServerMessage::FullReload,
            PacketKind::Prune => ServerMessage::Prune {
                context_id: context.to_string(),
            },
        }
    }

    /// Fold a newer packet into this one.
    ///
    /// Prune dominates full-reload, which dominates hot-apply. Hot-apply
    /// payloads merge by module id with the newer body winning.
    pub fn coalesce(self, newer: UpdatePacket) -> UpdatePacket {
        if newer.kind > self.kind {
            return newer;
        }
        if self.kind > newer.kind || self.kind != PacketKind::HotApply {
            return self;
        }

        let mut modules: BTreeMap<ModuleId, ModuleUpdate> = self
            .modules
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        for module in newer.modules {
            modules.insert(module.id.clone(), module);
        }

        UpdatePacket::hot_apply(newer.targets, modules.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn module(id: &str, code: &str) -> ModuleUpdate {
        ModuleUpdate::new(&id.to_string(), "h", code.to_string())
    }

    #[test]
    fn test_server_message_frames() {
        let connected = ServerMessage::Connected {
            connection_id: ConnectionId(7),
            context_id: "popup".into(),
        };
        assert_eq!(
            serde_json::to_value(&connected).unwrap(),
            json!({"type": "connected", "connectionId": 7, "contextId": "popup"})
        );

        assert_eq!(
            serde_json::to_value(ServerMessage::FullReload).unwrap(),
            json!({"type": "full-reload"})
        );

        let prune = ServerMessage::Prune {
            context_id: "content-script[1]".into(),
        };
        assert_eq!(
            serde_json::to_value(&prune).unwrap(),
            json!({"type": "prune", "contextId": "content-script[1]"})
        );

        let update = ServerMessage::Update {
            modules: vec![module("src/util.ts", "export {}")],
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            json!({"type": "update", "modules": [
                {"id": "src/util.ts", "hash": "h", "code": "export {}", "url": "src/util.js"}
            ]})
        );
    }

    #[test]
    fn test_client_message_frames() {
        let hello: ClientMessage = serde_json::from_str(
            r#"{"type": "hello", "contextId": "content-script[0]", "url": "https://example.com/a"}"#,
        )
        .unwrap();
        assert_eq!(
            hello,
            ClientMessage::Hello {
                context_id: "content-script[0]".into(),
                url: Some("https://example.com/a".into()),
            }
        );

        let bare: ClientMessage =
            serde_json::from_str(r#"{"type": "hello", "contextId": "background"}"#).unwrap();
        assert!(matches!(bare, ClientMessage::Hello { url: None, .. }));

        let applied: ClientMessage = serde_json::from_str(r#"{"type": "applied"}"#).unwrap();
        assert_eq!(applied, ClientMessage::Applied);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "eval"}"#).is_err());
    }

    #[test]
    fn test_coalesce_merges_hot_apply_newest_wins() {
        let first = UpdatePacket::hot_apply(
            Targets::context("background"),
            vec![module("a.ts", "old"), module("b.ts", "b")],
        );
        let second = UpdatePacket::hot_apply(
            Targets::context("background"),
            vec![module("a.ts", "new")],
        );

        let merged = first.coalesce(second);
        assert_eq!(merged.kind, PacketKind::HotApply);
        let codes: Vec<_> = merged.modules.iter().map(|m| (m.id.as_str(), m.code.as_str())).collect();
        assert_eq!(codes, vec![("a.ts", "new"), ("b.ts", "b")]);
    }

    #[test]
    fn test_coalesce_full_reload_dominates() {
        let hot = UpdatePacket::hot_apply(Targets::Broadcast, vec![module("a.ts", "a")]);
        let reload = UpdatePacket::full_reload(Targets::Broadcast);

        assert_eq!(hot.clone().coalesce(reload.clone()).kind, PacketKind::FullReload);
        assert_eq!(reload.coalesce(hot).kind, PacketKind::FullReload);
    }

    #[test]
    fn test_hot_module_path() {
        assert_eq!(hot_module_path(&"src/util.ts".to_string()), "src/util.js");
        assert_eq!(hot_module_path(&"lib/a.js".to_string()), "lib/a.js");
    }
}
