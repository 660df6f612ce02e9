//! Dev session: rebuild on change, plan updates, push them to open
//! contexts.
//!
//! The session keeps the last good bundle. A failed rebuild is reported and
//! its changes are carried into the next batch, which starts from the same
//! state.

pub mod server;
pub mod watcher;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::bundler::{Bundler, ModuleId};
use crate::config::Config;
use crate::error::CrxResult;
use crate::hmr::{plan_updates, BrokerPaths, ChangeSet, HmrBroker, PacketKind};
use crate::inject::BootstrapSettings;
use crate::manifest::HMR_DIR;
use crate::pipeline::{write_bundle, write_hot_modules, write_in_place, Mode, Pipeline};
use crate::worker::PersistentStorage;

/// Result of handling one batch of changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Nothing in the batch affects the bundle.
    Ignored,
    Rebuilt {
        hot: usize,
        reloads: usize,
        /// Frames sent to open channels.
        sent: usize,
    },
}

pub struct DevSession<B: Bundler> {
    pipeline: Pipeline<B>,
    out_dir: PathBuf,
    broker: Arc<Mutex<HmrBroker>>,
    /// Changes not yet delivered because their rebuild failed.
    pending: ChangeSet,
}

impl<B: Bundler> DevSession<B> {
    /// Build the dev bundle and set up the broker.
    ///
    /// There is no previous bundle to fall back on, so a failing first build
    /// is returned as an error.
    pub fn start(
        root: impl Into<PathBuf>,
        config: Config,
        bundler: B,
        worker_storage: Box<dyn PersistentStorage>,
    ) -> CrxResult<Self> {
        let root = root.into();
        let settings = BootstrapSettings {
            hmr_url: config.dev.hmr_url(),
            origin: config.dev.origin(),
        };
        let out_dir = config.out_dir(&root);
        let paths = BrokerPaths {
            manifest: PathBuf::from(&config.build.manifest),
            public_dir: PathBuf::from(&config.build.public_dir),
        };

        let mut pipeline = Pipeline::new(root, config, Mode::Dev(settings), bundler);
        let artifacts = pipeline.build()?;
        write_bundle(&artifacts, &out_dir)?;
        fs::create_dir_all(out_dir.join(HMR_DIR))?;

        tracing::info!(
            "Dev bundle written to {} ({} contexts)",
            out_dir.display(),
            artifacts.state.contexts.len()
        );

        let broker = HmrBroker::new(artifacts.state, paths).with_worker_storage(worker_storage);

        Ok(Self {
            pipeline,
            out_dir,
            broker: Arc::new(Mutex::new(broker)),
            pending: ChangeSet::default(),
        })
    }

    pub fn broker(&self) -> Arc<Mutex<HmrBroker>> {
        Arc::clone(&self.broker)
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn root(&self) -> &Path {
        self.pipeline.root()
    }

    /// Rebuild for a batch of root-relative paths and push the updates.
    ///
    /// The broker is locked only to classify, swap state and send. Hot
    /// modules are compiled and written without it.
    pub fn handle_batch(&mut self, paths: &[PathBuf]) -> CrxResult<BatchOutcome> {
        let changes = lock_broker(&self.broker).classify_changes(paths);
        if changes.is_empty() {
            return Ok(BatchOutcome::Ignored);
        }
        self.pending.merge(changes);

        let artifacts = self.pipeline.build()?;
        if self.pending.manifest {
            write_bundle(&artifacts, &self.out_dir)?;
        }
        write_in_place(&artifacts, &self.out_dir)?;

        let changes = std::mem::take(&mut self.pending);
        let next = artifacts.state;
        let previous = lock_broker(&self.broker).replace_state(next.clone());

        let root = self.pipeline.root().to_path_buf();
        let bundler = self.pipeline.bundler_mut();
        let packets = plan_updates(&changes, &previous, &next, &mut |id: &ModuleId| {
            bundler.module_source(&root, id)
        });

        write_hot_modules(&self.out_dir, &packets)?;
        let sent = lock_broker(&self.broker).dispatch(&packets);

        Ok(BatchOutcome::Rebuilt {
            hot: packets.iter().filter(|p| p.kind == PacketKind::HotApply).count(),
            reloads: packets.iter().filter(|p| p.kind == PacketKind::FullReload).count(),
            sent,
        })
    }
}

/// Lock the broker, recovering from a poisoned lock.
pub(crate) fn lock_broker(broker: &Mutex<HmrBroker>) -> MutexGuard<'_, HmrBroker> {
    broker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
