//! Event discriminators on the UI-facing wire.

// Scene lifecycle.
pub const SCENE_CHANGED: &str = "SceneChanged";
pub const SCENE_OBJECT_CHANGED: &str = "SceneObjectChanged";
pub const OPEN_SCENE: &str = "OpenScene";
pub const SCENE_SAVED: &str = "SceneSaved";
pub const CLOSE_SCENE: &str = "CloseScene";

// Project lifecycle.
pub const PROJECT_CHANGED: &str = "ProjectChanged";
pub const OPEN_PROJECT: &str = "OpenProject";
pub const PROJECT_SAVED: &str = "ProjectSaved";
pub const CLOSE_PROJECT: &str = "CloseProject";
pub const ACTION_POINT_CHANGED: &str = "ActionPointChanged";
pub const ACTION_CHANGED: &str = "ActionChanged";
pub const LOGIC_ITEM_CHANGED: &str = "LogicItemChanged";
pub const PROJECT_PARAMETER_CHANGED: &str = "ProjectParameterChanged";
pub const OVERRIDE_UPDATED: &str = "OverrideUpdated";

// Object types.
pub const CHANGED_OBJECT_TYPES: &str = "ChangedObjectTypes";

// Locks.
pub const OBJECTS_LOCKED: &str = "ObjectsLocked";
pub const OBJECTS_UNLOCKED: &str = "ObjectsUnlocked";

// Execution (manager-originated; relayed verbatim by the server).
pub const PACKAGE_STATE: &str = "PackageState";
pub const PACKAGE_CHANGED: &str = "PackageChanged";
pub const ACTION_STATE_BEFORE: &str = "ActionStateBefore";
pub const ACTION_STATE_AFTER: &str = "ActionStateAfter";
pub const PROJECT_EXCEPTION: &str = "ProjectException";

// UI navigation.
pub const SHOW_MAIN_SCREEN: &str = "ShowMainScreen";
