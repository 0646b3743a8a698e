//! Object aiming RPCs.
//!
//! Arming requires explicitly held write locks on both the aimed object
//! and the robot; recording reads the robot end effector through the
//! Scene service; finishing feeds the mesh focus points and recorded
//! poses into the focus endpoint and applies the returned pose.

use serde::Deserialize;
use serde_json::{json, Value};

use arcor_catalog::scene_service::MeshFocusRequest;
use arcor_domain::math::Pose;
use arcor_domain::object_type::{ModelKind, ObjectModel};
use arcor_domain::{Error, Result};
use arcor_protocol::{events, ChangeType, EventFrame};

use super::Ctx;
use crate::aiming::RobotTarget;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartArgs {
    object_id: String,
    robot: RobotTarget,
}

/// Focus points of the object's mesh model; aiming only makes sense for
/// mesh-modelled types.
fn focus_points(ctx: &Ctx<'_>, object_type: &str) -> Result<Vec<Pose>> {
    let ot = ctx.state.graph.get(object_type)?;
    match ot.model {
        Some(ObjectModel {
            kind: ModelKind::Mesh,
            mesh: Some(ref mesh),
            ..
        }) if !mesh.focus_points.is_empty() => Ok(mesh.focus_points.clone()),
        _ => Err(Error::Validation(format!(
            "Object type {object_type} has no mesh focus points."
        ))),
    }
}

pub async fn start(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: StartArgs = super::parse_args(&args)?;
    let points = {
        let session = ctx.state.session.read();
        let scene = session.scene()?;
        let object = scene.object(&args.object_id)?;
        scene.object(&args.robot.robot_id)?;

        let topology = session.topology();
        ctx.require_write_lock(&topology, &args.object_id)?;
        ctx.require_write_lock(&topology, &args.robot.robot_id)?;
        focus_points(ctx, &object.object_type)?.len()
    };
    if ctx.dry_run {
        if ctx.state.aiming.get(&ctx.user).is_ok() {
            return Err(Error::State("Aiming already armed.".to_owned()));
        }
        return Ok(Value::Null);
    }
    ctx.state
        .aiming
        .start(&ctx.user, &args.object_id, args.robot, points)?;
    Ok(Value::Null)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddPointArgs {
    point_idx: i64,
}

pub async fn add_point(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: AddPointArgs = super::parse_args(&args)?;
    ctx.state.aiming.check_point(&ctx.user, args.point_idx)?;
    if ctx.dry_run {
        return Ok(Value::Null);
    }

    let robot = ctx.state.aiming.get(&ctx.user)?.robot;
    let pose = ctx
        .state
        .scene_service
        .end_effector_pose(&robot.robot_id, &robot.end_effector, robot.arm_id.as_deref())
        .await?;
    // Re-validated: the session may have been cancelled during the read.
    ctx.state.aiming.set_point(&ctx.user, args.point_idx, pose)?;

    let session = ctx.state.aiming.get(&ctx.user)?;
    Ok(json!({ "remaining": session.missing() }))
}

pub async fn cancel(ctx: &Ctx<'_>) -> Result<Value> {
    if ctx.dry_run {
        ctx.state.aiming.get(&ctx.user)?;
        return Ok(Value::Null);
    }
    ctx.state.aiming.cancel(&ctx.user)?;
    Ok(Value::Null)
}

pub async fn done(ctx: &Ctx<'_>) -> Result<Value> {
    ctx.state.aiming.check_done(&ctx.user)?;
    if ctx.dry_run {
        return Ok(Value::Null);
    }

    let armed = ctx.state.aiming.get(&ctx.user)?;
    let mesh_focus_points = {
        let session = ctx.state.session.read();
        let object = session.scene()?.object(&armed.object_id)?;
        focus_points(ctx, &object.object_type)?
    };

    let pose = ctx
        .state
        .scene_service
        .focus(&MeshFocusRequest {
            mesh_focus_points,
            robot_space_points: armed.recorded(),
        })
        .await?;

    // Disarm only after the focus call succeeded, so a transient scene
    // service failure keeps the recorded points.
    let finished = ctx.state.aiming.take_done(&ctx.user)?;

    let payload = {
        let mut session = ctx.state.session.write();
        let scene = session.scene_mut()?;
        let object = scene.object_mut(&finished.object_id)?;
        object.pose = pose;
        let payload = serde_json::to_value(&*object)?;
        session.mark_scene_modified();
        payload
    };
    ctx.broadcast(EventFrame::with_change(
        events::SCENE_OBJECT_CHANGED,
        payload,
        ChangeType::Update,
    ));
    Ok(Value::Null)
}
