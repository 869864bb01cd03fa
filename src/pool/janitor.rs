//! The janitor: a periodic sweep over every pool enforcing size
//! targets, idle timeouts, server lifetimes and shutdown progression,
//! and rotating the stats buckets.
//!
//! Client-side timers (query, transaction, idle-transaction and
//! client-idle timeouts) are armed on the client tasks themselves;
//! the janitor owns everything that concerns pooled servers.

use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{info, warn};

use crate::app::server::{ShutdownMode, SHUTDOWN_MODE};
use crate::config::get_config;
use crate::errors::Error;
use crate::utils::clock;

use super::{get_all_pools, ConnectionPool, ServerState, RETIRED_POOLS};

/// Nominal sweep interval.
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Run the sweep forever. Spawned once at startup.
pub async fn run() {
    let mut interval = tokio::time::interval(JANITOR_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut last_stats_rotation = clock::now();

    loop {
        interval.tick().await;

        let stats_period = get_config().general.stats_period.as_std();
        let rotate_stats = last_stats_rotation.elapsed() >= stats_period;
        if rotate_stats {
            last_stats_rotation = clock::now();
        }

        let shutdown = SHUTDOWN_MODE.load(Ordering::Relaxed);

        for (_, pool) in get_all_pools().iter() {
            maintain_pool(pool, shutdown);
            if rotate_stats {
                pool.stats.rotate();
            }
        }

        collect_retired_pools();
    }
}

fn maintain_pool(pool: &ConnectionPool, shutdown: u8) {
    let settings = pool.settings.clone();

    // Shutdown progression: while waiting for servers, idle ones are
    // closed eagerly and queued clients are dropped.
    if shutdown == ShutdownMode::WaitForServers as u8 {
        let idle: Vec<u64> = pool.with_inner(|inner| {
            inner.fail_waiters(|| Error::ShuttingDown);
            inner.list(ServerState::Idle).iter().copied().collect()
        });
        for id in idle {
            pool.destroy_parked(id);
        }
        return;
    }

    if pool.is_dead() {
        return;
    }

    let now = clock::now();
    let min_pool_size = settings.min_pool_size as usize;

    // server_idle_timeout: close idle connections past their last use,
    // never shrinking below min_pool_size.
    if !settings.server_idle_timeout.is_disabled() {
        let idle_timeout = settings.server_idle_timeout.as_std();
        let victims: Vec<u64> = pool.with_inner(|inner| {
            let connected = inner.connected_server_count();
            let closable = connected.saturating_sub(min_pool_size);
            inner
                .list(ServerState::Idle)
                .iter()
                .filter(|id| {
                    inner
                        .entry(**id)
                        .map(|e| e.last_used_at.elapsed() >= idle_timeout)
                        .unwrap_or(false)
                })
                .take(closable)
                .copied()
                .collect()
        });
        for id in victims {
            info!("Closing idle server connection (server_idle_timeout)");
            pool.destroy_parked(id);
        }
    }

    // server_lifetime: mark one expired connection per stagger window,
    // so a herd of same-age connections does not vanish all at once.
    if !settings.server_lifetime.is_disabled() {
        let lifetime = settings.server_lifetime.as_std();
        let stagger = lifetime / settings.pool_size.max(1);

        let expired_parked: Option<u64> = pool.with_inner(|inner| {
            if inner.last_lifetime_disconnect.elapsed() < stagger {
                return None;
            }

            let mut expired_parked = None;
            for id in inner.all_ids() {
                let entry = match inner.entry_mut(id) {
                    Some(entry) => entry,
                    None => continue,
                };
                if entry.created_at.elapsed() < lifetime || entry.close_needed {
                    continue;
                }
                match entry.state {
                    // Linked connections close at their next release.
                    ServerState::Active => {
                        entry.close_needed = true;
                        inner.last_lifetime_disconnect = now;
                        break;
                    }
                    ServerState::Idle | ServerState::Used | ServerState::Tested => {
                        expired_parked = Some(id);
                        inner.last_lifetime_disconnect = now;
                        break;
                    }
                    _ => (),
                }
            }
            expired_parked
        });

        if let Some(id) = expired_parked {
            info!("Closing server connection past server_lifetime");
            pool.destroy_parked(id);
        }
    }

    // min_pool_size refill, one connection per sweep.
    if min_pool_size > 0 && shutdown == ShutdownMode::None as u8 && !pool.is_paused() {
        let login = pool.with_inner(|inner| {
            let needs = inner.connected_server_count() + inner.list_count(ServerState::Login)
                < min_pool_size;
            let below_cap = inner.total_server_count() < settings.pool_size as usize;
            let allowed = inner.login_allowed(settings.server_login_retry.as_std());
            if needs && below_cap && allowed && inner.list_count(ServerState::Login) == 0 {
                pool.insert_login_entry(inner).ok()
            } else {
                None
            }
        });
        if let Some((id, stats)) = login {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.connect_for_pool(id, stats).await;
            });
        }
    }

    // WAIT_CLOSE completion.
    if pool.flags.wait_close.load(Ordering::Relaxed) && pool.connected_server_count() == 0 {
        info!("Pool {} fully closed", pool.identifier());
        pool.flags.wait_close.store(false, Ordering::Relaxed);
    }
}

/// Retired pools (removed by RELOAD) are dropped once drained.
fn collect_retired_pools() {
    let mut retired = RETIRED_POOLS.lock();
    retired.retain(|pool| {
        let busy = pool.with_inner(|inner| {
            inner.total_server_count() > 0 || inner.waiting_client_count() > 0
        });
        if !busy {
            warn!("Dropping retired pool {}", pool.identifier());
        }
        busy
    });
}
