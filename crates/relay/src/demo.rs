//! The `Game` domain served by `rpc-relay serve`.
//!
//! - `Game.help {lives}` answers `{"acknowledged": true}`, or fails when
//!   `lives` is 0.
//! - `Game.levelUp` raises the shared level and broadcasts
//!   `Game.levelUp {level}` to every connected client.
//! - `Game.status` reports the current level.
//! - `Game.dying` notifications from clients are logged.

use anyhow::{anyhow, bail, Result};
use rpc_core::{Module, Server};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;

pub const DOMAIN: &str = "Game";

#[derive(Default)]
pub struct GameState {
    level: AtomicU64,
}

impl GameState {
    pub fn level(&self) -> u64 {
        self.level.load(Ordering::SeqCst)
    }

    fn level_up(&self) -> u64 {
        self.level.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn help(params: Option<Value>) -> Result<Value> {
    let lives = params
        .as_ref()
        .and_then(|p| p.get("lives"))
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("help expects {{\"lives\": <number>}}"))?;
    if lives == 0 {
        bail!("Cannot help at level 0");
    }
    Ok(json!({"acknowledged": true}))
}

/// Expose the `Game` domain on `server` and start the task that broadcasts
/// level changes. Must be called inside a tokio runtime.
pub fn install(server: &Server) -> Result<Arc<GameState>> {
    let state = Arc::new(GameState::default());
    let api = server.api();
    let domain = api
        .get(DOMAIN)
        .and_then(|member| member.as_domain().cloned())
        .ok_or_else(|| anyhow!("{} domain unavailable", DOMAIN))?;

    let (levels, mut level_rx) = unbounded_channel::<u64>();
    let level_state = state.clone();
    let status_state = state.clone();
    let module = Module::new()
        .method("help", help)
        .method_async("levelUp", move |_| {
            let level = level_state.level_up();
            let result = levels
                .send(level)
                .map(|()| json!({"level": level}))
                .map_err(|_| anyhow!("level broadcaster stopped"));
            async move { result }
        })
        .method("status", move |_| Ok(json!({"level": status_state.level()})));

    domain
        .get("expose")
        .and_then(|member| member.as_expose().map(|expose| expose.call(Some(module))))
        .ok_or_else(|| anyhow!("{}.expose unavailable", DOMAIN))??;

    if let Some(on_dying) = domain.get("onDying") {
        if let Some(subscribe) = on_dying.as_subscribe() {
            subscribe.call(|params| tracing::info!(?params, "A player is dying"));
        }
    }

    let emit = domain
        .get("emitLevelUp")
        .ok_or_else(|| anyhow!("{}.emitLevelUp unavailable", DOMAIN))?;
    tokio::spawn(async move {
        while let Some(level) = level_rx.recv().await {
            if let Some(emit) = emit.as_emit() {
                if let Err(e) = emit.call(Some(json!({"level": level}))) {
                    tracing::warn!(error = %e, "Failed to broadcast level");
                }
            }
        }
    });

    Ok(state)
}
