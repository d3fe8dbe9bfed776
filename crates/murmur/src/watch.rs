//! Watch command: realtime feed, background reconciliation and a live event log.
//!
//! Tasks:
//! - Change feed over the backend websocket (when a backend is configured)
//! - Reconciler workers: outbox, per-collection listeners, polling, reloads
//! - Profile watcher turning backend profile notices into `ProfileChanged`
//! - Profile listener rewriting cached author snapshots
//! - Event printer on the main task

use std::sync::Arc;

use miette::Result;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use murmur_cache::{CacheEvent, CollectionKey, spawn_profile_watcher};
use murmur_remote::{PROFILES_TABLE, RemoteBackend};

use crate::app::App;

pub async fn run(app: &App) -> Result<()> {
    info!("watching for changes, press ctrl-c to stop");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Handle shutdown signal
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let mut handles = app.reconciler.start(shutdown_rx.clone());

    if let Some(rest) = &app.rest {
        let tables = CollectionKey::ALL
            .iter()
            .map(|key| key.table())
            .chain([PROFILES_TABLE])
            .map(str::to_string)
            .collect();
        let feed = rest.change_feed(tables);
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = feed.run(rx).await {
                error!(error = %e, "change feed stopped");
            }
        }));

        let remote: Arc<dyn RemoteBackend> = rest.clone();
        handles.push(spawn_profile_watcher(
            Arc::clone(&app.caches.session),
            remote,
            &app.caches.bus,
            shutdown_rx.clone(),
        ));
    }

    handles.push(
        Arc::new(app.caches.propagator()).spawn_listener(&app.caches.bus, shutdown_rx.clone()),
    );

    let mut events = app.caches.bus.subscribe();

    if app.reconciler.has_backend() {
        for (key, result) in app.reconciler.reconcile_all().await {
            if let Err(e) = result {
                warn!(collection = %key, error = %e, "initial reconcile failed");
            }
        }
    }

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("waiting for background tasks");
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

fn print_event(event: &CacheEvent) {
    match event {
        CacheEvent::CollectionUpdated { key, len } => {
            println!("{:<20} {} records", key.to_string(), len);
        }
        CacheEvent::Notice(notice) => {
            let scope = notice
                .collection
                .map(|key| key.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("{:<20} {:?}: {}", scope, notice.kind, notice.message);
        }
        CacheEvent::ProfileChanged(update) => {
            if let Some(name) = &update.name {
                println!("{:<20} {} is now {}", "profile", update.identity_id, name);
            } else {
                println!("{:<20} {} changed avatar", "profile", update.identity_id);
            }
        }
        CacheEvent::ReloadRequested { .. } => {}
    }
}
