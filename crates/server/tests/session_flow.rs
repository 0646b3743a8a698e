//! End-to-end RPC flows against an in-memory catalog: scene CRUD,
//! locking, object aiming, project authoring, dry-run purity and event
//! fidelity.

mod common;

use common::{drain_events, env};
use serde_json::json;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scene lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn scene_crud_cycle() {
    let env = env().await;
    let (u1, events) = env.login("u1").await;
    drain_events(&events);

    let listed = env.ok(u1, "ListScenes", json!({})).await;
    assert_eq!(listed["scenes"].as_array().unwrap().len(), 0);

    let data = env
        .ok(u1, "NewScene", json!({ "name": "Test", "description": "desc" }))
        .await;
    let scene_id = data["id"].as_str().unwrap().to_owned();

    let seen = drain_events(&events);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "OpenScene");
    assert_eq!(seen[0].1["data"]["scene"]["id"], scene_id.as_str());

    env.ok(u1, "SaveScene", json!({})).await;
    let seen = drain_events(&events);
    assert_eq!(seen[0].0, "SceneSaved");

    env.ok(u1, "CloseScene", json!({})).await;
    let seen = drain_events(&events);
    assert_eq!(seen[0].0, "CloseScene");

    let listed = env.ok(u1, "ListScenes", json!({})).await;
    let scenes = listed["scenes"].as_array().unwrap();
    assert_eq!(scenes.len(), 1);
    assert_eq!(scenes[0]["id"], scene_id.as_str());

    env.ok(u1, "DeleteScene", json!({ "id": scene_id })).await;
    let seen = drain_events(&events);
    assert_eq!(seen[0].0, "SceneChanged");
    assert_eq!(seen[0].1["changeType"], "REMOVE");
    assert_eq!(seen[0].1["data"]["id"], scene_id.as_str());

    let listed = env.ok(u1, "ListScenes", json!({})).await;
    assert_eq!(listed["scenes"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn unsaved_scene_refuses_to_close_without_force() {
    let env = env().await;
    let (u1, _events) = env.login("u1").await;
    env.ok(u1, "NewScene", json!({ "name": "draft" })).await;
    let message = env.err(u1, "CloseScene", json!({})).await;
    assert!(message.contains("unsaved"));
    env.ok(u1, "CloseScene", json!({ "force": true })).await;
}

#[tokio::test]
async fn duplicate_names_rejected_without_state_change() {
    let env = env().await;
    let (u1, events) = env.login("u1").await;
    env.ok(u1, "NewScene", json!({ "name": "s" })).await;
    env.ok(
        u1,
        "AddObjectToScene",
        json!({ "name": "box", "type": "Generic" }),
    )
    .await;
    drain_events(&events);

    let message = env
        .err(
            u1,
            "AddObjectToScene",
            json!({ "name": "box", "type": "Generic" }),
        )
        .await;
    assert!(message.contains("box"));
    // No event accompanies a refused mutation.
    assert!(drain_events(&events).is_empty());

    // Invalid identifiers are refused up front.
    let message = env
        .err(
            u1,
            "AddObjectToScene",
            json!({ "name": "Not Snake", "type": "Generic" }),
        )
        .await;
    assert!(message.contains("Invalid"));
}

#[tokio::test]
async fn abstract_type_cannot_be_instantiated() {
    let env = env().await;
    let (u1, events) = env.login("u1").await;
    env.ok(u1, "NewScene", json!({ "name": "s" })).await;
    drain_events(&events);

    let message = env
        .err(
            u1,
            "AddObjectToScene",
            json!({ "name": "dev", "type": "Device" }),
        )
        .await;
    assert!(message.contains("abstract"));
    assert!(drain_events(&events).is_empty());
    assert!(env
        .state
        .session
        .read()
        .scene()
        .unwrap()
        .objects
        .is_empty());
}

#[tokio::test]
async fn externally_deleted_scene_surfaces_as_removed() {
    let env = env().await;
    let (u1, _events) = env.login("u1").await;
    let data = env.ok(u1, "NewScene", json!({ "name": "vanishing" })).await;
    let scene_id = data["id"].as_str().unwrap().to_owned();
    env.ok(u1, "SaveScene", json!({})).await;
    env.ok(u1, "CloseScene", json!({})).await;

    // Deleted behind the server's back.
    env.scenes.items.lock().remove(&scene_id);

    let message = env.err(u1, "OpenScene", json!({ "id": scene_id })).await;
    assert!(message.contains("removed externally"));
    let listed = env.ok(u1, "ListScenes", json!({})).await;
    assert_eq!(listed["scenes"].as_array().unwrap().len(), 0);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dry runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn dry_run_validates_without_mutating() {
    let env = env().await;
    let (u1, events) = env.login("u1").await;

    // A dry NewScene succeeds but opens nothing and emits nothing.
    let response = env.dry_call(u1, "NewScene", json!({ "name": "ghost" })).await;
    assert!(response.result);
    assert!(drain_events(&events).is_empty());
    assert!(!env.state.session.read().is_open());

    // A dry run of a failing call produces the same message as the real
    // one, and still no state change.
    env.ok(u1, "NewScene", json!({ "name": "real" })).await;
    env.ok(
        u1,
        "AddObjectToScene",
        json!({ "name": "box", "type": "Generic" }),
    )
    .await;
    drain_events(&events);

    let dry = env
        .dry_call(
            u1,
            "AddObjectToScene",
            json!({ "name": "box", "type": "Generic" }),
        )
        .await;
    let real = env
        .call(
            u1,
            "AddObjectToScene",
            json!({ "name": "box", "type": "Generic" }),
        )
        .await;
    assert!(!dry.result);
    assert!(!real.result);
    assert_eq!(dry.messages, real.messages);
    assert_eq!(
        env.state.session.read().scene().unwrap().objects.len(),
        1
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Locks over RPC
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn lock_events_go_to_peers_only() {
    let env = env().await;
    let (u1, events1) = env.login("u1").await;
    let (u2, events2) = env.login("u2").await;

    env.ok(u1, "NewScene", json!({ "name": "s" })).await;
    let data = env
        .ok(u1, "AddObjectToScene", json!({ "name": "box", "type": "Generic" }))
        .await;
    let obj = data["id"].as_str().unwrap().to_owned();
    drain_events(&events1);
    drain_events(&events2);

    env.ok(u1, "WriteLock", json!({ "objectId": obj })).await;
    assert!(drain_events(&events1).is_empty());
    let seen = drain_events(&events2);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "ObjectsLocked");
    assert_eq!(seen[0].1["data"]["owner"], "u1");

    // The other user cannot write or mutate.
    let message = env.err(u2, "WriteLock", json!({ "objectId": obj })).await;
    assert!(message.contains("locked"));
    let message = env
        .err(
            u2,
            "RenameObject",
            json!({ "id": obj, "newName": "other_name" }),
        )
        .await;
    assert!(message.contains("locked"));

    env.ok(u1, "WriteUnlock", json!({ "objectId": obj })).await;
    let seen = drain_events(&events2);
    assert_eq!(seen[0].0, "ObjectsUnlocked");
    env.ok(u2, "WriteLock", json!({ "objectId": obj })).await;
}

#[tokio::test]
async fn released_user_leaves_an_empty_lock_table() {
    let env = env().await;
    let (u1, _events1) = env.login("u1").await;
    let (_u2, events2) = env.login("u2").await;

    env.ok(u1, "NewScene", json!({ "name": "s" })).await;
    let data = env
        .ok(u1, "AddObjectToScene", json!({ "name": "box", "type": "Generic" }))
        .await;
    let obj = data["id"].as_str().unwrap().to_owned();
    env.ok(u1, "WriteLock", json!({ "objectId": obj })).await;
    drain_events(&events2);

    // The auto-release window elapsed.
    env.state.release_user("u1");
    assert!(env.state.locks.is_empty());
    let seen = drain_events(&events2);
    assert_eq!(seen[0].0, "ObjectsUnlocked");
    assert_eq!(seen[0].1["data"]["objectIds"][0], obj.as_str());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Object aiming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn aiming_fixture(env: &common::TestEnv, peer: u64) -> (String, String) {
    env.ok(peer, "NewScene", json!({ "name": "aim" })).await;
    let obj = env
        .ok(peer, "AddObjectToScene", json!({ "name": "tester", "type": "Tester" }))
        .await["id"]
        .as_str()
        .unwrap()
        .to_owned();
    let rob = env
        .ok(peer, "AddObjectToScene", json!({ "name": "rob", "type": "Robot" }))
        .await["id"]
        .as_str()
        .unwrap()
        .to_owned();
    env.ok(peer, "WriteLock", json!({ "objectId": obj })).await;
    env.ok(peer, "WriteLock", json!({ "objectId": rob })).await;
    (obj, rob)
}

#[tokio::test]
async fn aiming_happy_path_updates_the_pose() {
    let env = env().await;
    let (u1, events) = env.login("u1").await;
    let (obj, rob) = aiming_fixture(&env, u1).await;
    drain_events(&events);

    env.ok(
        u1,
        "ObjectAimingStart",
        json!({ "objectId": obj, "robot": { "robotId": rob, "endEffector": "eef1", "armId": "left" } }),
    )
    .await;

    for idx in 0..2 {
        env.ok(u1, "ObjectAimingAddPoint", json!({ "pointIdx": idx })).await;
    }
    env.ok(u1, "ObjectAimingDone", json!({})).await;

    // The focus endpoint got both recorded poses.
    let calls = env.scene_service.focus_calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].robot_space_points.len(), 2);
    drop(calls);

    let seen = drain_events(&events);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "SceneObjectChanged");
    assert_eq!(seen[0].1["changeType"], "UPDATE");
    assert_eq!(seen[0].1["data"]["pose"]["position"]["x"], 42.0);
}

#[tokio::test]
async fn aiming_rejections() {
    let env = env().await;
    let (u1, _events) = env.login("u1").await;
    let (obj, rob) = aiming_fixture(&env, u1).await;
    let robot = json!({ "robotId": rob, "endEffector": "eef1" });

    env.ok(u1, "ObjectAimingStart", json!({ "objectId": obj, "robot": robot }))
        .await;

    // Re-arming while armed.
    let message = env
        .err(u1, "ObjectAimingStart", json!({ "objectId": obj, "robot": robot }))
        .await;
    assert!(message.contains("armed"));

    // Out-of-range indices.
    let message = env
        .err(u1, "ObjectAimingAddPoint", json!({ "pointIdx": -1 }))
        .await;
    assert!(message.contains("out of range"));
    let message = env
        .err(u1, "ObjectAimingAddPoint", json!({ "pointIdx": 2 }))
        .await;
    assert!(message.contains("out of range"));

    // Done before every slot is filled.
    env.ok(u1, "ObjectAimingAddPoint", json!({ "pointIdx": 0 })).await;
    let message = env.err(u1, "ObjectAimingDone", json!({})).await;
    assert!(message.contains("not recorded"));

    // Duplicate slot.
    let message = env
        .err(u1, "ObjectAimingAddPoint", json!({ "pointIdx": 0 }))
        .await;
    assert!(message.contains("already recorded"));

    env.ok(u1, "ObjectAimingCancel", json!({})).await;
}

#[tokio::test]
async fn aiming_requires_held_write_locks() {
    let env = env().await;
    let (u1, _events) = env.login("u1").await;
    env.ok(u1, "NewScene", json!({ "name": "aim" })).await;
    let obj = env
        .ok(u1, "AddObjectToScene", json!({ "name": "tester", "type": "Tester" }))
        .await["id"]
        .as_str()
        .unwrap()
        .to_owned();
    let rob = env
        .ok(u1, "AddObjectToScene", json!({ "name": "rob", "type": "Robot" }))
        .await["id"]
        .as_str()
        .unwrap()
        .to_owned();

    // No locks at all.
    let message = env
        .err(
            u1,
            "ObjectAimingStart",
            json!({ "objectId": obj, "robot": { "robotId": rob, "endEffector": "eef1" } }),
        )
        .await;
    assert!(message.contains("write-locked"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Project authoring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn project_authoring_flow() {
    let env = env().await;
    let (u1, events) = env.login("u1").await;

    env.ok(u1, "NewScene", json!({ "name": "line" })).await;
    let gen = env
        .ok(u1, "AddObjectToScene", json!({ "name": "gen", "type": "RandomActions" }))
        .await["id"]
        .as_str()
        .unwrap()
        .to_owned();
    env.ok(u1, "NewProject", json!({ "name": "proj" })).await;
    drain_events(&events);

    // Project parameter the action will reference.
    env.ok(
        u1,
        "AddProjectParameter",
        json!({ "name": "min_time", "type": "double", "value": "0.1" }),
    )
    .await;
    let seen = drain_events(&events);
    assert_eq!(seen[0].0, "ProjectParameterChanged");
    assert_eq!(seen[0].1["changeType"], "ADD");

    let ap = env
        .ok(u1, "AddActionPoint", json!({ "name": "ap1" }))
        .await["id"]
        .as_str()
        .unwrap()
        .to_owned();
    let seen = drain_events(&events);
    assert_eq!(seen[0].0, "ActionPointChanged");

    let act = env
        .ok(
            u1,
            "AddAction",
            json!({
                "actionPointId": ap,
                "name": "act_random",
                "type": format!("{gen}/random_double"),
                "parameters": [
                    { "name": "min_time", "type": "projectParameter", "value": "\"min_time\"" }
                ],
            }),
        )
        .await["id"]
        .as_str()
        .unwrap()
        .to_owned();
    let seen = drain_events(&events);
    assert_eq!(seen[0].0, "ActionChanged");
    assert_eq!(seen[0].1["parentId"], ap.as_str());

    // Unknown parameter names and bad references are refused.
    let message = env
        .err(
            u1,
            "AddAction",
            json!({
                "actionPointId": ap,
                "name": "act_bad",
                "type": format!("{gen}/random_double"),
                "parameters": [
                    { "name": "min_time", "type": "projectParameter", "value": "\"missing\"" }
                ],
            }),
        )
        .await;
    assert!(message.contains("missing"));

    // Logic: START -> act -> END.
    env.ok(u1, "AddLogicItem", json!({ "start": "START", "end": act })).await;
    env.ok(u1, "AddLogicItem", json!({ "start": act, "end": "END" })).await;
    let message = env
        .err(u1, "AddLogicItem", json!({ "start": act, "end": "END" }))
        .await;
    assert!(message.contains("Duplicate"));

    // A referenced action cannot go away.
    let message = env.err(u1, "RemoveAction", json!({ "id": act })).await;
    assert!(message.contains("logic"));

    env.ok(u1, "SaveProject", json!({})).await;
    let seen = drain_events(&events);
    assert!(seen.iter().any(|(name, _)| name == "ProjectSaved"));

    // Both entities reached the catalog.
    assert_eq!(env.scenes.items.lock().len(), 1);
    assert_eq!(env.projects.items.lock().len(), 1);

    env.ok(u1, "CloseProject", json!({})).await;
    let listed = env.ok(u1, "ListProjects", json!({})).await;
    assert_eq!(listed["projects"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn override_lifecycle() {
    let env = env().await;
    let (u1, events) = env.login("u1").await;

    env.ok(u1, "NewScene", json!({ "name": "belt" })).await;
    let belt = env
        .ok(u1, "AddObjectToScene", json!({ "name": "belt", "type": "Conveyor" }))
        .await["id"]
        .as_str()
        .unwrap()
        .to_owned();
    env.ok(u1, "NewProject", json!({ "name": "sorting" })).await;
    drain_events(&events);

    // A parameter outside the settings schema is refused.
    let message = env
        .err(
            u1,
            "AddOverride",
            json!({ "objectId": belt, "parameter": { "name": "ghost", "type": "double", "value": "1.0" } }),
        )
        .await;
    assert!(message.contains("ghost"));

    let speed = json!({ "name": "speed", "type": "double", "value": "1.5" });
    env.ok(u1, "AddOverride", json!({ "objectId": belt, "parameter": speed }))
        .await;
    let seen = drain_events(&events);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "OverrideUpdated");
    assert_eq!(seen[0].1["changeType"], "ADD");
    assert_eq!(seen[0].1["parentId"], belt.as_str());
    assert_eq!(seen[0].1["data"]["value"], "1.5");

    // A second override of the same parameter is a duplicate.
    let message = env
        .err(u1, "AddOverride", json!({ "objectId": belt, "parameter": speed }))
        .await;
    assert!(message.contains("already overridden"));

    // The overridden object cannot leave the scene.
    let message = env.err(u1, "RemoveFromScene", json!({ "id": belt })).await;
    assert!(message.contains("used by the open project"));

    let faster = json!({ "name": "speed", "type": "double", "value": "2.0" });
    env.ok(u1, "UpdateOverride", json!({ "objectId": belt, "parameter": faster }))
        .await;
    let seen = drain_events(&events);
    assert_eq!(seen[0].1["changeType"], "UPDATE");
    assert_eq!(seen[0].1["data"]["value"], "2.0");

    // Overrides survive a save (validated against the schema) and are
    // part of the persisted project.
    env.ok(u1, "SaveProject", json!({})).await;
    let stored = env
        .projects
        .items
        .lock()
        .values()
        .next()
        .cloned()
        .unwrap();
    assert_eq!(stored.overrides_for(&belt).len(), 1);
    assert_eq!(stored.override_of(&belt, "speed").unwrap().value, "2.0");

    env.ok(
        u1,
        "DeleteOverride",
        json!({ "objectId": belt, "parameter": faster }),
    )
    .await;
    drain_events(&events);
    let message = env
        .err(
            u1,
            "DeleteOverride",
            json!({ "objectId": belt, "parameter": faster }),
        )
        .await;
    assert!(message.contains("Override"));
    assert!(env
        .state
        .session
        .read()
        .project()
        .unwrap()
        .overrides_for(&belt)
        .is_empty());
}

#[tokio::test]
async fn get_object_types_and_actions() {
    let env = env().await;
    let (u1, _events) = env.login("u1").await;

    let data = env.ok(u1, "GetObjectTypes", json!({})).await;
    let ids: Vec<&str> = data["objectTypes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["id"].as_str().unwrap())
        .collect();
    assert_eq!(
        ids,
        vec!["Conveyor", "Device", "Generic", "RandomActions", "Robot", "Tester"]
    );

    let data = env.ok(u1, "GetActions", json!({ "type": "Robot" })).await;
    let actions = data["actions"].as_array().unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0]["name"], "home");

    let message = env.err(u1, "GetActions", json!({ "type": "Nope" })).await;
    assert!(message.contains("Nope"));
}

#[tokio::test]
async fn unregistered_connection_cannot_issue_rpcs() {
    let env = env().await;
    let (peer, _outbox) = env.state.registry.register_connection();
    let message = env.err(peer, "ListScenes", json!({})).await;
    assert!(message.contains("Register"));
}
