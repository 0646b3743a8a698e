//! Lock RPCs.
//!
//! Successful lock changes notify peers via `ObjectsLocked` /
//! `ObjectsUnlocked`; the owner only sees the RPC acknowledgement.

use serde::Deserialize;
use serde_json::{json, Value};

use arcor_domain::{Error, Result};
use arcor_protocol::{events, EventFrame};

use super::Ctx;
use crate::locks::Topology;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectIdArgs {
    object_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteLockArgs {
    object_id: String,
    #[serde(default)]
    lock_tree: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateLockArgs {
    object_id: String,
    new_type: LockKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum LockKind {
    Write,
    WriteTree,
}

/// Locks only apply to entities of the open session.
fn known_topology(ctx: &Ctx<'_>, id: &str) -> Result<Topology> {
    let session = ctx.state.session.read();
    if !session.knows(id) {
        return Err(Error::NotFound(format!("Object {id}")));
    }
    Ok(session.topology())
}

fn locked_event(id: &str, owner: &str) -> EventFrame {
    EventFrame::new(
        events::OBJECTS_LOCKED,
        json!({ "objectIds": [id], "owner": owner }),
    )
}

fn unlocked_event(id: &str, owner: &str) -> EventFrame {
    EventFrame::new(
        events::OBJECTS_UNLOCKED,
        json!({ "objectIds": [id], "owner": owner }),
    )
}

pub async fn read_lock(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: ObjectIdArgs = super::parse_args(&args)?;
    let topology = known_topology(ctx, &args.object_id)?;
    if ctx.dry_run {
        ctx.state.locks.check_read_lock(&args.object_id, &topology)?;
        return Ok(Value::Null);
    }
    ctx.state
        .locks
        .read_lock(&args.object_id, &ctx.user, &topology)?;
    ctx.broadcast_to_others(locked_event(&args.object_id, &ctx.user));
    Ok(Value::Null)
}

pub async fn read_unlock(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: ObjectIdArgs = super::parse_args(&args)?;
    if ctx.dry_run {
        ctx.state.locks.check_read_unlock(&args.object_id, &ctx.user)?;
        return Ok(Value::Null);
    }
    ctx.state.locks.read_unlock(&args.object_id, &ctx.user)?;
    ctx.broadcast_to_others(unlocked_event(&args.object_id, &ctx.user));
    Ok(Value::Null)
}

pub async fn write_lock(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: WriteLockArgs = super::parse_args(&args)?;
    let topology = known_topology(ctx, &args.object_id)?;
    if ctx.dry_run {
        ctx.state
            .locks
            .check_write_lock(&args.object_id, args.lock_tree, &topology)?;
        return Ok(Value::Null);
    }
    ctx.state
        .locks
        .write_lock(&args.object_id, &ctx.user, args.lock_tree, &topology)?;
    ctx.broadcast_to_others(locked_event(&args.object_id, &ctx.user));
    Ok(Value::Null)
}

pub async fn write_unlock(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: ObjectIdArgs = super::parse_args(&args)?;
    if ctx.dry_run {
        ctx.state
            .locks
            .check_write_unlock(&args.object_id, &ctx.user)?;
        return Ok(Value::Null);
    }
    ctx.state.locks.write_unlock(&args.object_id, &ctx.user)?;
    ctx.broadcast_to_others(unlocked_event(&args.object_id, &ctx.user));
    Ok(Value::Null)
}

pub async fn update_lock(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: UpdateLockArgs = super::parse_args(&args)?;
    let topology = known_topology(ctx, &args.object_id)?;
    let tree = args.new_type == LockKind::WriteTree;
    if ctx.dry_run {
        ctx.state
            .locks
            .check_update_lock(&args.object_id, &ctx.user, tree, &topology)?;
        return Ok(Value::Null);
    }
    ctx.state
        .locks
        .update_lock(&args.object_id, &ctx.user, tree, &topology)?;
    ctx.broadcast_to_others(locked_event(&args.object_id, &ctx.user));
    Ok(Value::Null)
}
