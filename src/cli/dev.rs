//! Development server for `crxkit dev`.
//!
//! Builds once, serves the dev channel and pushes updates as sources change.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use super::{esbuild, load_project};
use crate::bundler::content_hash;
use crate::dev::watcher::{self, Backoff, WatchOptions};
use crate::dev::{lock_broker, server, BatchOutcome, DevSession};
use crate::error::CrxResult;
use crate::worker::FileStorage;

/// Run the extension in development mode with live updates.
pub fn run_dev(
    root: &str,
    out_dir: Option<String>,
    port: Option<u16>,
    host: Option<String>,
) -> Result<()> {
    let (root, mut config) = load_project(root, out_dir)?;
    if let Some(port) = port {
        config.dev.port = port;
    }
    if let Some(host) = host {
        config.dev.host = host;
    }

    // One state file per project directory
    let project_key = content_hash(root.to_string_lossy().as_bytes());
    let storage = FileStorage::open(&config.worker.state_dir(), &project_key[..12]);

    let options = WatchOptions {
        root: root.clone(),
        ignore: vec![PathBuf::from(&config.build.out_dir), PathBuf::from(".crxkit")],
        debounce: config.dev.debounce(),
        retry: Backoff::new(
            Duration::from_millis(config.dev.watch_retry_initial_ms),
            Duration::from_millis(config.dev.watch_retry_max_ms),
        ),
    };
    let address = format!("{}:{}", config.dev.host, config.dev.port);
    let origin = config.dev.origin();

    let bundler = esbuild(&root, &config);
    let mut session = DevSession::start(&root, config, bundler, Box::new(storage))
        .context("Initial build failed")?;

    {
        let broker = session.broker();
        let broker = lock_broker(&broker);
        println!(
            "{} {} {}",
            style("✓").green().bold(),
            style("Loaded manifest:").cyan(),
            style(&broker.state().resolved.descriptor.name).bold()
        );
        println!(
            "{} {} {}",
            style("✓").green().bold(),
            style("Dev bundle written to").cyan(),
            style(session.out_dir().display()).bold()
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind {}", address))?;

        println!(
            "{} {} {}",
            style("✓").green().bold(),
            style("Dev server listening on").cyan(),
            style(&origin).bold()
        );
        println!();
        println!("{}", style("Watching for changes...").dim());
        println!("{}", style("Press Ctrl+C to stop.").dim());
        println!();

        // Set up Ctrl+C handler
        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let r = running.clone();
        ctrlc::set_handler(move || {
            r.store(false, Ordering::SeqCst);
            let _ = stop_tx.send(true);
        })?;

        let router = server::router(session.broker(), session.out_dir());
        let mut server_stop = stop_rx.clone();
        let server = tokio::spawn(server::serve(listener, router, async move {
            let _ = server_stop.wait_for(|stopped| *stopped).await;
        }));

        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        let watcher = watcher::spawn(options, batch_tx, running.clone());

        loop {
            let first = tokio::select! {
                batch = batch_rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
                _ = stop_rx.wait_for(|stopped| *stopped) => break,
            };

            // Fold batches that queued up during the last rebuild
            let mut paths: BTreeSet<PathBuf> = first.into_iter().collect();
            while let Ok(more) = batch_rx.try_recv() {
                paths.extend(more);
            }
            let paths: Vec<PathBuf> = paths.into_iter().collect();

            println!(
                "{} File changed: {}",
                style("[").dim(),
                style(
                    paths
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
                .yellow()
            );

            report(tokio::task::block_in_place(|| session.handle_batch(&paths)));
        }

        running.store(false, Ordering::SeqCst);
        let _ = tokio::task::spawn_blocking(move || watcher.join()).await;
        match server.await {
            Ok(Err(e)) => tracing::warn!("Dev server stopped with error: {}", e),
            Err(e) => tracing::warn!("Dev server task failed: {}", e),
            Ok(Ok(())) => {}
        }

        println!();
        println!("{}", style("Stopped.").dim());
        Ok::<(), anyhow::Error>(())
    })
}

fn report(outcome: CrxResult<BatchOutcome>) {
    match outcome {
        Ok(BatchOutcome::Ignored) => {
            println!("  {}", style("No bundle changes").dim());
        }
        Ok(BatchOutcome::Rebuilt { hot, reloads, sent }) => {
            println!(
                "{} {} {}",
                style("✓").green().bold(),
                style("Rebuilt").cyan(),
                style(format!(
                    "({} hot, {} reload, {} sent)",
                    hot, reloads, sent
                ))
                .dim()
            );
        }
        Err(e) => {
            // Keep the last good bundle and wait for the next change
            eprintln!("{} Rebuild failed: {}", style("✗").red().bold(), e);
        }
    }
}
