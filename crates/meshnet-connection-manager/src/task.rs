//! The long-running per-peer task: feeds latency samples into the
//! [`PeerConnectionSm`] and carries out the [`Action`]s it emits. Holds no
//! reference back to the owning `ConnectionManager` (spec.md §9) — only a
//! `peer_id` handle and the shared resources it needs directly, reporting
//! its terminal outcome over `events_tx`.

use crate::{ConnectionManagerConfig, ManagerEvent, PeerStatus};
use meshnet_control_plane::ControlPlane;
use meshnet_model::{Endpoint, PeerId, Strategy, TunnelPublicKey};
use meshnet_peer_conn::{Action, PeerConnectionSm};
use meshnet_relay_selector::RelayProber;
use meshnet_tun::TunnelDevice;
use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};

pub(crate) struct PeerTaskCtx {
    pub peer_id: PeerId,
    pub public_key: TunnelPublicKey,
    pub allowed_address: IpAddr,
    pub tun: Arc<dyn TunnelDevice>,
    pub relay_prober: Arc<dyn RelayProber>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub config: ConnectionManagerConfig,
    pub status: Arc<RwLock<PeerStatus>>,
    pub disconnect: Arc<Notify>,
    pub events_tx: mpsc::UnboundedSender<ManagerEvent>,
}

pub(crate) async fn run(ctx: PeerTaskCtx, initial_strategy: Strategy) {
    let mut sm = PeerConnectionSm::new(initial_strategy, ctx.config.degradation_threshold);
    let mut ticker = tokio::time::interval(ctx.config.latency_probe_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let rtt = ctx.tun.probe_latency(ctx.public_key).await.unwrap_or(None);
                let now = Instant::now();
                sm.on_latency_sample(now, rtt);

                {
                    let mut status = ctx.status.write();
                    status.state = sm.state();
                    status.latency = rtt;
                }

                let actions = sm.on_timeout(now);
                if apply_actions(&ctx, &mut sm, actions).await {
                    break;
                }
            }
            _ = ctx.disconnect.notified() => {
                let actions = sm.disconnect();
                apply_actions(&ctx, &mut sm, actions).await;
                break;
            }
        }
    }
}

/// Returns `true` once cleanup has run and the task should exit.
async fn apply_actions(ctx: &PeerTaskCtx, sm: &mut PeerConnectionSm, actions: Vec<Action>) -> bool {
    let mut cleaned_up = false;

    for action in actions {
        match action {
            Action::RefreshDirectEndpoint => refresh_direct_endpoint(ctx).await,
            Action::AttemptRelaySwitch => attempt_relay_switch(ctx, sm).await,
            Action::EnterCleanup => {
                enter_cleanup(ctx).await;
                cleaned_up = true;
            }
        }
    }

    cleaned_up
}

async fn refresh_direct_endpoint(ctx: &PeerTaskCtx) {
    let endpoint = ctx.status.read().strategy.endpoint();
    let config = meshnet_tun::PeerConfig {
        public_key: ctx.public_key,
        endpoint,
        allowed_address: ctx.allowed_address,
    };

    if let Err(error) = ctx.tun.remove_peer(ctx.public_key).await {
        tracing::warn!(peer_id = %ctx.peer_id, %error, "failed to remove peer before refresh");
    }
    if let Err(error) = ctx.tun.upsert_peer(config).await {
        tracing::warn!(peer_id = %ctx.peer_id, %error, "failed to refresh direct endpoint");
    }
}

async fn attempt_relay_switch(ctx: &PeerTaskCtx, sm: &mut PeerConnectionSm) {
    let (current, last_rtt) = {
        let status = ctx.status.read();
        (status.strategy.endpoint(), status.latency)
    };
    let Some(last_rtt) = last_rtt else {
        return; // nothing to compare against yet.
    };

    let candidates = relay_candidates(ctx).await;

    let Some((new_endpoint, new_rtt)) = meshnet_relay_selector::switch_relay(
        &candidates,
        current,
        last_rtt,
        current,
        ctx.config.relay_switch_margin,
        ctx.relay_prober.as_ref(),
    )
    .await
    else {
        return;
    };

    if let Err(error) = ctx.tun.update_endpoint(ctx.public_key, new_endpoint).await {
        tracing::warn!(peer_id = %ctx.peer_id, %error, "relay switch rejected by tunnel device");
        return;
    }

    let new_strategy = Strategy::Relay(new_endpoint);
    sm.set_strategy(new_strategy);
    let mut status = ctx.status.write();
    status.strategy = new_strategy;
    status.latency = Some(new_rtt);
}

async fn relay_candidates(ctx: &PeerTaskCtx) -> Vec<Endpoint> {
    let control_plane_relays = ctx
        .control_plane
        .list_relays()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|relay| relay.public_endpoint);

    meshnet_relay_selector::build_candidate_list(
        control_plane_relays,
        ctx.config.static_relay_endpoint,
        ctx.config.builtin_default_relay,
    )
}

async fn enter_cleanup(ctx: &PeerTaskCtx) {
    if let Err(error) = ctx.tun.remove_peer(ctx.public_key).await {
        tracing::warn!(peer_id = %ctx.peer_id, %error, "failed to remove peer on cleanup");
    }
    ctx.status.write().state = meshnet_peer_conn::PeerState::Cleanup;
    let _ = ctx.events_tx.send(ManagerEvent::Cleaned(ctx.peer_id));
}
