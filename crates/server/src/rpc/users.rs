//! User registration: the first RPC on every connection.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use arcor_domain::{Error, Result};
use arcor_protocol::{events, EventFrame};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterUserArgs {
    user_name: String,
}

pub async fn register(
    state: &AppState,
    peer_id: u64,
    args: &Value,
    dry_run: bool,
) -> Result<Value> {
    let args: RegisterUserArgs = super::parse_args(args)?;
    if args.user_name.trim().is_empty() {
        return Err(Error::Validation("User name must not be empty.".to_owned()));
    }
    if state.registry.user_of(peer_id).is_some() {
        return Err(Error::Validation("User already registered.".to_owned()));
    }
    if dry_run {
        if state.registry.is_user_connected(&args.user_name) {
            return Err(Error::Validation(format!(
                "User name '{}' is already in use.",
                args.user_name
            )));
        }
        return Ok(Value::Null);
    }

    let relogged = state.registry.set_user(peer_id, &args.user_name)?;
    if relogged {
        tracing::info!(user = %args.user_name, "re-login within release window, locks kept");
    }

    // Stale aiming sessions die on login.
    let pruned = state
        .aiming
        .prune_older_than(Duration::from_secs(state.config.server.aiming_prune_secs));
    if pruned > 0 {
        tracing::info!(pruned, "pruned stale aiming sessions");
    }

    // Late joiners converge on the in-progress session.
    let session = state.session.read();
    if let Some(ref scene) = session.scene {
        state.registry.send_to(
            peer_id,
            &EventFrame::new(
                events::OPEN_SCENE,
                serde_json::json!({ "scene": scene }),
            ),
        );
    }
    if let Some(ref project) = session.project {
        state.registry.send_to(
            peer_id,
            &EventFrame::new(
                events::OPEN_PROJECT,
                serde_json::json!({ "project": project, "scene": session.scene }),
            ),
        );
    }
    Ok(Value::Null)
}
