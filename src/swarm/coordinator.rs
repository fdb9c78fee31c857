use std::sync::Arc;
use std::time::Instant;

use tokio::time::{interval, interval_at, MissedTickBehavior};

use super::events::Role;
use super::registry::PeerCommand;
use super::Shared;
use crate::constants::FILE_HANDLE_IDLE_TIMEOUT;
use crate::discovery::AnnounceEvent;
use crate::peer::{ChokingPolicy, PeerSnapshot};

/// The periodic work of one swarm: choking rounds, request refills and
/// announces. Missed ticks are skipped, never queued.
pub(crate) async fn run(shared: Arc<Shared>, mut policy: ChokingPolicy) {
    let config = &shared.config;

    let mut choke = interval(config.choke_interval);
    choke.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut refill = interval(config.request_interval);
    refill.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut announce = interval_at(
        tokio::time::Instant::now() + config.announce_interval,
        config.announce_interval,
    );
    announce.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut maintenance = interval_at(
        tokio::time::Instant::now() + FILE_HANDLE_IDLE_TIMEOUT,
        FILE_HANDLE_IDLE_TIMEOUT,
    );
    maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut role = shared.role.subscribe();
    let mut shutdown = shared.shutdown.subscribe();

    shared.announce(AnnounceEvent::Started).await;

    loop {
        tokio::select! {
            biased;

            _ = super::stopped(&mut shutdown) => break,
            _ = choke.tick() => choking_round(&shared, &mut policy),
            _ = refill.tick() => {
                shared.state.lock().registry.broadcast(PeerCommand::Refill);
                shared.reap_sessions();
            }
            _ = announce.tick() => shared.announce(AnnounceEvent::Periodic).await,
            _ = maintenance.tick() => {
                if let Err(e) = shared.store.release_idle().await {
                    tracing::warn!(error = %e, "failed to release idle storage resources");
                }
            }
            Ok(()) = role.changed() => {
                let seeding = *role.borrow_and_update() == Role::Seeding;
                if seeding {
                    shared.announce(AnnounceEvent::Completed).await;
                    choking_round(&shared, &mut policy);
                }
            }
        }
    }

    shared.announce(AnnounceEvent::Stopped).await;
    tracing::debug!(info_hash = %shared.torrent.info_hash(), "coordinator stopped");
}

pub(super) fn choking_round(shared: &Shared, policy: &mut ChokingPolicy) {
    if shared.is_stopping() {
        return;
    }
    let mut state = shared.state.lock();
    let seeding = state.tracker.is_seeding();
    let peers: Vec<PeerSnapshot> = state
        .registry
        .active()
        .map(|(key, entry)| PeerSnapshot {
            key,
            interested: entry.choking.peer_interested,
            am_choking: entry.choking.am_choking,
            download_rate: entry.stats.download_rate(),
            upload_rate: entry.stats.upload_rate(),
        })
        .collect();

    if let Some(optimistic) = policy.optimistic_peer() {
        if state.registry.get(optimistic).is_none() {
            policy.remove_peer(optimistic);
        }
    }

    let decision = policy.decide(&peers, seeding, Instant::now());
    if decision.is_empty() {
        return;
    }

    for &key in &decision.unchoke {
        if state.registry.send(key, PeerCommand::Unchoke) {
            if let Some(entry) = state.registry.get_mut(key) {
                entry.choking.am_choking = false;
            }
        }
    }
    for &key in &decision.choke {
        if state.registry.send(key, PeerCommand::Choke) {
            if let Some(entry) = state.registry.get_mut(key) {
                entry.choking.am_choking = true;
            }
        }
    }

    tracing::debug!(
        unchoked = decision.unchoked.len(),
        optimistic = ?decision.optimistic,
        seeding,
        "choking round"
    );
}
