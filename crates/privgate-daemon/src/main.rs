// Copyright [2026] [Privgate Contributors]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// Copyright (c) 2026 Privgate Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use privgate_core::audit::AuditLog;
use privgate_core::budget::BudgetLedger;
use privgate_core::gateway::{MaskedAdditiveScheme, SecureGateway};
use privgate_core::mediation::{EventSink, MediationEngine};
use privgate_core::policy::{PolicyRegistry, RegisteredMechanisms};

use privgate_daemon::config::{load_policies, DaemonConfig};
use privgate_daemon::http::{serve, AppState};
use privgate_daemon::store::{AuditFileSink, BudgetStore, DatasetStore};
use privgate_daemon::telemetry::Telemetry;

#[derive(Debug, Parser)]
#[command(name = "privgate-daemon")]
#[command(about = "Privacy-preserving query mediation daemon")]
struct Args {
    #[arg(long)]
    listen: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Policy snapshot file; defaults to <data-dir>/policies.json.
    #[arg(long)]
    policies: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut cfg = DaemonConfig::from_env();
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }
    if let Some(data_dir) = args.data_dir {
        cfg.data_dir = data_dir;
    }
    std::fs::create_dir_all(&cfg.data_dir)?;

    let policy_path = args
        .policies
        .unwrap_or_else(|| cfg.data_dir.join("policies.json"));
    let policies = load_policies(&policy_path)?;
    let registry = Arc::new(PolicyRegistry::load(policies, &RegisteredMechanisms::all())?);
    tracing::info!(
        target: "privgate.daemon",
        policies = registry.len(),
        "policy registry loaded"
    );

    let budget_store = Arc::new(BudgetStore::open(&cfg.data_dir));
    let ledger = Arc::new(BudgetLedger::new(
        cfg.default_allowance,
        cfg.budget_window_secs,
    )?);
    ledger.restore(budget_store.load()?)?;

    let dataset_store = Arc::new(DatasetStore::open(&cfg.data_dir));
    // persisted ciphertexts from a previous process are only decryptable
    // by keys that no longer exist; destroy them before serving
    let stale = dataset_store.clear_stale()?;
    if stale > 0 {
        tracing::warn!(
            target: "privgate.daemon",
            datasets = stale,
            "destroyed stale encrypted datasets from a previous run"
        );
    }

    let audit_sink = Arc::new(AuditFileSink::open(&cfg.data_dir));
    let audit = Arc::new(AuditLog::new(cfg.audit_retention_secs).with_sink(audit_sink.clone()));
    let gateway = Arc::new(SecureGateway::new(Arc::new(MaskedAdditiveScheme::new())));

    let telemetry = Telemetry::new();
    let engine = Arc::new(
        MediationEngine::new(registry, ledger, gateway, audit)
            .with_events(Arc::new(telemetry.clone()) as Arc<dyn EventSink>),
    );

    spawn_maintenance_sweep(&cfg, engine.clone(), budget_store.clone(), audit_sink.clone());
    spawn_key_rotation(&cfg, engine.clone(), dataset_store.clone());

    let state = AppState {
        engine,
        telemetry,
        budget_store,
        dataset_store,
        max_body_bytes: cfg.max_body_bytes,
        audit_trail_default_limit: 100,
    };

    let listener = tokio::net::TcpListener::bind(&cfg.listen).await?;
    tracing::info!(target: "privgate.daemon", listen = %cfg.listen, "serving");
    serve(listener, state, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!(target: "privgate.daemon", "failed to install ctrl-c handler");
    }
}

/// Budget window reset, audit retention prune, and dataset retention purge
/// run on one cadence; each failure is logged and retried next tick.
fn spawn_maintenance_sweep(
    cfg: &DaemonConfig,
    engine: Arc<MediationEngine>,
    budget_store: Arc<BudgetStore>,
    audit_sink: Arc<AuditFileSink>,
) {
    let interval = Duration::from_secs(cfg.sweep_interval_secs.max(1));
    let retention_secs = cfg.audit_retention_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match engine.reset_budget_windows() {
                Ok(reset) if reset > 0 => {
                    tracing::info!(target: "privgate.sweep", reset, "budget windows reset");
                    if let Err(err) = budget_store.persist(&engine.ledger().export()) {
                        tracing::error!(target: "privgate.sweep", error = %err, "budget persist failed");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(target: "privgate.sweep", error = %err, "budget reset failed");
                }
            }

            let pruned = engine.prune_audit();
            if pruned > 0 {
                tracing::info!(target: "privgate.sweep", pruned, "audit records pruned");
            }
            let cutoff = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
                .saturating_sub(retention_secs);
            if let Err(err) = audit_sink.prune_before(cutoff) {
                tracing::error!(target: "privgate.sweep", error = %err, "audit file prune failed");
            }

            match engine.purge_expired_datasets() {
                Ok(purged) if purged > 0 => {
                    tracing::info!(target: "privgate.sweep", purged, "expired datasets purged");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(target: "privgate.sweep", error = %err, "dataset purge failed");
                }
            }
        }
    });
}

fn spawn_key_rotation(
    cfg: &DaemonConfig,
    engine: Arc<MediationEngine>,
    dataset_store: Arc<DatasetStore>,
) {
    let interval = Duration::from_secs(cfg.key_rotation_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately; keys were just generated
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match engine.rotate_gateway_keys() {
                Ok(rotated) => {
                    tracing::info!(target: "privgate.sweep", rotated, "gateway keys rotated");
                    if let Err(err) = dataset_store.persist(&engine.gateway().export()) {
                        tracing::error!(target: "privgate.sweep", error = %err, "dataset persist failed");
                    }
                }
                Err(err) => {
                    tracing::error!(target: "privgate.sweep", error = %err, "key rotation failed");
                }
            }
        }
    });
}
