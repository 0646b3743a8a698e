//! Scene lifecycle and scene-object RPCs.

use serde::Deserialize;
use serde_json::{json, Value};

use arcor_domain::identifier;
use arcor_domain::math::Pose;
use arcor_domain::scene::{Parameter, Scene, SceneObject};
use arcor_domain::{Error, Result};
use arcor_protocol::{events, ChangeType, EventFrame};

use super::Ctx;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list(ctx: &Ctx<'_>) -> Result<Value> {
    let scenes = ctx.state.scenes.listing().await?;
    Ok(json!({ "scenes": scenes }))
}

#[derive(Debug, Deserialize)]
struct NewSceneArgs {
    name: String,
    #[serde(default)]
    description: String,
}

pub async fn new_scene(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: NewSceneArgs = super::parse_args(&args)?;
    if args.name.trim().is_empty() {
        return Err(Error::Validation("Scene name must not be empty.".to_owned()));
    }
    if ctx.state.session.read().is_open() {
        return Err(Error::State("Another scene or project is open.".to_owned()));
    }
    let listing = ctx.state.scenes.listing().await?;
    if listing.iter().any(|d| d.name == args.name) {
        return Err(Error::Validation(format!(
            "Scene name '{}' already exists.",
            args.name
        )));
    }
    if ctx.dry_run {
        return Ok(Value::Null);
    }

    let mut scene = Scene::new(&args.name, &args.description);
    scene.int_modified = Some(chrono::Utc::now());
    let scene_id = scene.id.clone();
    {
        let mut session = ctx.state.session.write();
        if session.is_open() {
            return Err(Error::State("Another scene or project is open.".to_owned()));
        }
        session.scene = Some(scene.clone());
    }
    ctx.broadcast(EventFrame::new(
        events::OPEN_SCENE,
        json!({ "scene": scene }),
    ));
    Ok(json!({ "id": scene_id }))
}

#[derive(Debug, Deserialize)]
struct IdArgs {
    id: String,
}

pub async fn open(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: IdArgs = super::parse_args(&args)?;
    if ctx.state.session.read().is_open() {
        return Err(Error::State("Another scene or project is open.".to_owned()));
    }
    let scene = ctx.state.scenes.get(&args.id).await?;
    if ctx.dry_run {
        return Ok(Value::Null);
    }
    {
        let mut session = ctx.state.session.write();
        if session.is_open() {
            return Err(Error::State("Another scene or project is open.".to_owned()));
        }
        session.scene = Some(scene.clone());
    }
    ctx.broadcast(EventFrame::new(
        events::OPEN_SCENE,
        json!({ "scene": scene }),
    ));
    upsert_collisions(ctx, &scene).await;
    Ok(Value::Null)
}

pub async fn save(ctx: &Ctx<'_>) -> Result<Value> {
    let scene = {
        let session = ctx.state.session.read();
        session.scene()?.clone()
    };
    if ctx.dry_run {
        return Ok(Value::Null);
    }
    let modified = ctx.state.scenes.put(scene.for_persist()).await?;
    {
        let mut session = ctx.state.session.write();
        if let Some(ref mut open) = session.scene {
            open.modified = Some(modified);
            open.int_modified = None;
        }
    }
    ctx.broadcast(EventFrame::new(events::SCENE_SAVED, Value::Null));
    Ok(Value::Null)
}

#[derive(Debug, Deserialize, Default)]
struct CloseArgs {
    #[serde(default)]
    force: bool,
}

pub async fn close(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: CloseArgs = super::parse_args(&args)?;
    let scene = {
        let session = ctx.state.session.read();
        if session.project.is_some() {
            return Err(Error::State("Close the project first.".to_owned()));
        }
        let scene = session.scene()?;
        if scene.int_modified.is_some() && !args.force {
            return Err(Error::State("Scene has unsaved changes.".to_owned()));
        }
        scene.clone()
    };
    if ctx.dry_run {
        return Ok(Value::Null);
    }
    {
        let mut session = ctx.state.session.write();
        session.scene = None;
    }
    // Entity locks die with the session.
    ctx.state.locks.clear();
    ctx.broadcast(EventFrame::new(
        events::CLOSE_SCENE,
        json!({ "id": scene.id }),
    ));
    delete_collisions(ctx, &scene).await;
    Ok(Value::Null)
}

pub async fn delete(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: IdArgs = super::parse_args(&args)?;
    if ctx.state.session.read().is_open() {
        return Err(Error::State("Close the scene first.".to_owned()));
    }
    // A scene referenced by any project must stay.
    for desc in ctx.state.projects.listing().await? {
        let project = ctx.state.projects.get(&desc.id).await?;
        if project.scene_id == args.id {
            return Err(Error::State(format!(
                "Scene is used by project '{}'.",
                project.name
            )));
        }
    }
    let scene = ctx.state.scenes.get(&args.id).await?;
    if ctx.dry_run {
        return Ok(Value::Null);
    }
    ctx.state.scenes.delete(&args.id).await?;
    ctx.broadcast(EventFrame::with_change(
        events::SCENE_CHANGED,
        serde_json::to_value(&scene)?,
        ChangeType::Remove,
    ));
    Ok(Value::Null)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameArgs {
    id: String,
    new_name: String,
}

pub async fn rename(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: RenameArgs = super::parse_args(&args)?;
    if args.new_name.trim().is_empty() {
        return Err(Error::Validation("Scene name must not be empty.".to_owned()));
    }
    if ctx.state.session.read().is_open() {
        return Err(Error::State("Close the scene first.".to_owned()));
    }
    let listing = ctx.state.scenes.listing().await?;
    if listing.iter().any(|d| d.name == args.new_name && d.id != args.id) {
        return Err(Error::Validation(format!(
            "Scene name '{}' already exists.",
            args.new_name
        )));
    }
    let mut scene = ctx.state.scenes.get(&args.id).await?;
    if ctx.dry_run {
        return Ok(Value::Null);
    }
    scene.name = args.new_name;
    let modified = ctx.state.scenes.put(scene.for_persist()).await?;
    scene.modified = Some(modified);
    ctx.broadcast(EventFrame::with_change(
        events::SCENE_CHANGED,
        serde_json::to_value(&scene)?,
        ChangeType::Update,
    ));
    Ok(Value::Null)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scene objects
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddObjectArgs {
    name: String,
    #[serde(rename = "type")]
    object_type: String,
    #[serde(default)]
    pose: Pose,
    #[serde(default)]
    parameters: Vec<Parameter>,
}

pub async fn add_object(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: AddObjectArgs = super::parse_args(&args)?;
    identifier::ensure_valid_name("object", &args.name)?;

    let object_type = ctx.state.graph.get(&args.object_type)?;
    if object_type.disabled {
        return Err(Error::Validation(format!(
            "Object type {} is disabled: {}.",
            object_type.id,
            object_type.problem.as_deref().unwrap_or("unknown problem")
        )));
    }
    if object_type.is_abstract {
        return Err(Error::Validation(format!(
            "Object type {} is abstract and cannot be instantiated.",
            object_type.id
        )));
    }
    for parameter in &args.parameters {
        if !object_type.settings_compatible(parameter) {
            return Err(Error::Validation(format!(
                "Parameter '{}' does not match the settings of {}.",
                parameter.name, object_type.id
            )));
        }
    }

    let object = SceneObject {
        id: uuid::Uuid::new_v4().to_string(),
        name: args.name,
        object_type: args.object_type,
        pose: args.pose,
        parent: None,
        parameters: args.parameters,
    };
    let object_id = object.id.clone();
    let (payload, scene_id) = {
        let mut session = ctx.state.session.write();
        let scene = session.scene_mut()?;
        if scene.contains_object_name(&object.name) {
            return Err(Error::Validation(format!(
                "Object name '{}' already used in the scene.",
                object.name
            )));
        }
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let scene_id = scene.id.clone();
        scene.add_object(object.clone())?;
        session.mark_scene_modified();
        (serde_json::to_value(&object)?, scene_id)
    };
    ctx.broadcast(
        EventFrame::with_change(events::SCENE_OBJECT_CHANGED, payload, ChangeType::Add)
            .parent(&scene_id),
    );

    // Best-effort collision upsert for modelled objects.
    if let Some(model) = ctx.state.graph.get(&object.object_type).ok().and_then(|t| t.model) {
        if let Err(e) = ctx.state.scene_service.upsert_collision(&object, &model).await {
            tracing::warn!(object = %object_id, error = %e, "collision upsert failed");
        }
    }
    Ok(json!({ "id": object_id }))
}

#[derive(Debug, Deserialize)]
struct UpdatePoseArgs {
    id: String,
    pose: Pose,
}

pub async fn update_object_pose(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: UpdatePoseArgs = super::parse_args(&args)?;
    let payload = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        ctx.ensure_writeable(&topology, &[&args.id])?;
        let scene = session.scene_mut()?;
        scene.object(&args.id)?;
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let object = scene.object_mut(&args.id)?;
        object.pose = args.pose;
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

pub async fn rename_object(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: RenameArgs = super::parse_args(&args)?;
    identifier::ensure_valid_name("object", &args.new_name)?;
    let payload = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        ctx.ensure_writeable(&topology, &[&args.id])?;
        let scene = session.scene_mut()?;
        scene.object(&args.id)?;
        if scene.contains_object_name(&args.new_name) {
            return Err(Error::Validation(format!(
                "Object name '{}' already used in the scene.",
                args.new_name
            )));
        }
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let object = scene.object_mut(&args.id)?;
        object.name = args.new_name;
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

#[derive(Debug, Deserialize)]
struct RemoveObjectArgs {
    id: String,
}

pub async fn remove_object(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: RemoveObjectArgs = super::parse_args(&args)?;
    let removed = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        ctx.ensure_writeable(&topology, &[&args.id])?;

        // References from the open project block the removal.
        if let Some(ref project) = session.project {
            let referenced = project
                .action_points
                .iter()
                .any(|ap| ap.parent.as_deref() == Some(args.id.as_str()))
                || project.action_points.iter().flat_map(|ap| &ap.actions).any(|a| {
                    a.parse_type()
                        .map(|(obj, _)| obj == args.id)
                        .unwrap_or(false)
                })
                || !project.overrides_for(&args.id).is_empty();
            if referenced {
                return Err(Error::State(
                    "Object is used by the open project.".to_owned(),
                ));
            }
        }
        let scene = session.scene_mut()?;
        scene.object(&args.id)?;
        if !scene.children_of(&args.id).is_empty() {
            return Err(Error::State("Object has child objects.".to_owned()));
        }
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let removed = scene.remove_object(&args.id)?;
        session.mark_scene_modified();
        removed
    };
    ctx.broadcast(EventFrame::with_change(
        events::SCENE_OBJECT_CHANGED,
        serde_json::to_value(&removed)?,
        ChangeType::Remove,
    ));
    if let Err(e) = ctx.state.scene_service.delete_collision(&removed.id).await {
        tracing::warn!(object = %removed.id, error = %e, "collision delete failed");
    }
    Ok(Value::Null)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Collision helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Push every modelled object's collision shape; failures degrade to
/// warnings so the scene still opens.
pub(crate) async fn upsert_collisions(ctx: &Ctx<'_>, scene: &Scene) {
    if ctx.dry_run {
        return;
    }
    for object in &scene.objects {
        let model = ctx
            .state
            .graph
            .get(&object.object_type)
            .ok()
            .and_then(|t| t.model);
        if let Some(model) = model {
            if let Err(e) = ctx.state.scene_service.upsert_collision(object, &model).await {
                tracing::warn!(object = %object.id, error = %e, "collision upsert failed");
            }
        }
    }
}

pub(crate) async fn delete_collisions(ctx: &Ctx<'_>, scene: &Scene) {
    if ctx.dry_run {
        return;
    }
    for object in &scene.objects {
        if let Err(e) = ctx.state.scene_service.delete_collision(&object.id).await {
            tracing::debug!(object = %object.id, error = %e, "collision delete failed");
        }
    }
}
