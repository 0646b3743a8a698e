//! The object-type graph.
//!
//! Object types come from the catalog carrying build-time generated
//! action manifests. On refresh the graph resolves inheritance (actions
//! propagate into subclasses unless overridden, with `origins` naming
//! the nearest declaring ancestor), backfills descriptions from base
//! types, enriches mesh models, and computes ADD/UPDATE/REMOVE deltas
//! against the previous snapshot. Types that fail to resolve stay
//! listed as disabled with a `problem` string, so listings are complete
//! and deterministic.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use arcor_catalog::{CachedStore, PersistenceClient};
use arcor_domain::object_type::{ActionMeta, ModelKind, ObjectModel, ObjectType};
use arcor_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model enrichment
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fetch of full mesh payloads (focus points) for model pointers.
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    async fn mesh_model(&self, id: &str) -> Result<ObjectModel>;
}

#[async_trait]
impl ModelFetcher for PersistenceClient {
    async fn mesh_model(&self, id: &str) -> Result<ObjectModel> {
        self.get_model(id, "mesh").await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Graph
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deltas of one refresh, broadcast as `ChangedObjectTypes` events.
#[derive(Debug, Default)]
pub struct RefreshDelta {
    pub added: Vec<ObjectType>,
    pub updated: Vec<ObjectType>,
    pub removed: Vec<ObjectType>,
}

#[derive(Default)]
pub struct ObjectTypeGraph {
    types: RwLock<HashMap<String, ObjectType>>,
}

impl ObjectTypeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Result<ObjectType> {
        self.types
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Object type {id}")))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.types.read().contains_key(id)
    }

    pub fn all(&self) -> Vec<ObjectType> {
        let mut types: Vec<ObjectType> = self.types.read().values().cloned().collect();
        types.sort_by(|a, b| a.id.cmp(&b.id));
        types
    }

    /// Resolved (inheritance included) actions of a type. Disabled
    /// entries stay in the list so UIs can explain why.
    pub fn actions(&self, id: &str) -> Result<Vec<ActionMeta>> {
        Ok(self.get(id)?.actions)
    }

    /// An action usable for project authoring: known type, known
    /// action, neither disabled.
    pub fn usable_action(&self, type_id: &str, action: &str) -> Result<ActionMeta> {
        let ot = self.get(type_id)?;
        if ot.disabled {
            return Err(Error::Validation(format!(
                "Object type {type_id} is disabled: {}.",
                ot.problem.as_deref().unwrap_or("unknown problem")
            )));
        }
        let meta = ot
            .action(action)
            .ok_or_else(|| {
                Error::NotFound(format!("Action {action} on object type {type_id}"))
            })?
            .clone();
        if meta.disabled {
            return Err(Error::Validation(format!(
                "Action {action} is disabled: {}.",
                meta.problem.as_deref().unwrap_or("unknown problem")
            )));
        }
        Ok(meta)
    }

    /// Re-read the catalog, resolve the graph and swap the snapshot.
    pub async fn refresh(
        &self,
        store: &CachedStore<ObjectType>,
        models: &dyn ModelFetcher,
    ) -> Result<RefreshDelta> {
        let listing = store.listing().await?;

        let mut raw: HashMap<String, ObjectType> = HashMap::new();
        for desc in &listing {
            match store.get(&desc.id).await {
                Ok(ot) => {
                    raw.insert(ot.id.clone(), ot);
                }
                Err(e) => {
                    // Keep the id listed; downstream sees a disabled stub.
                    tracing::warn!(object_type = %desc.id, error = %e, "object type fetch failed");
                    raw.insert(
                        desc.id.clone(),
                        disabled_stub(&desc.id, &format!("Fetch failed: {e}")),
                    );
                }
            }
        }

        let mut resolved = resolve_graph(raw);

        // Mesh pointers without payload are enriched; a failed model
        // fetch disables the type rather than hiding it.
        for ot in resolved.values_mut() {
            let needs_mesh = matches!(
                ot.model,
                Some(ObjectModel {
                    kind: ModelKind::Mesh,
                    mesh: None,
                    ..
                })
            );
            if needs_mesh {
                let model_id = ot.model.as_ref().map(|m| m.id.clone()).unwrap_or_default();
                match models.mesh_model(&model_id).await {
                    Ok(full) => ot.model = Some(full),
                    Err(e) => {
                        tracing::warn!(object_type = %ot.id, error = %e, "model fetch failed");
                        ot.disabled = true;
                        ot.problem = Some(format!("Model fetch failed: {e}"));
                    }
                }
            }
        }

        let delta = {
            let mut current = self.types.write();
            let delta = diff(&current, &resolved);
            *current = resolved;
            delta
        };
        Ok(delta)
    }
}

fn disabled_stub(id: &str, problem: &str) -> ObjectType {
    ObjectType {
        id: id.to_owned(),
        base: String::new(),
        description: String::new(),
        source: String::new(),
        built_in: false,
        is_abstract: false,
        has_pose: false,
        disabled: true,
        problem: Some(problem.to_owned()),
        model: None,
        settings: Vec::new(),
        actions: Vec::new(),
        created: None,
        modified: None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inheritance resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Base-to-leaf chain for a type; `None` marks a broken chain.
fn base_chain(raw: &HashMap<String, ObjectType>, id: &str) -> std::result::Result<Vec<String>, String> {
    let mut chain = vec![id.to_owned()];
    let mut seen: HashSet<String> = HashSet::from([id.to_owned()]);
    let mut current = id.to_owned();
    loop {
        let base = match raw.get(&current) {
            Some(ot) => ot.base.clone(),
            None => return Err(format!("Unknown base type {current}.")),
        };
        if base.is_empty() {
            chain.reverse();
            return Ok(chain);
        }
        if !seen.insert(base.clone()) {
            return Err(format!("Inheritance cycle through {base}."));
        }
        chain.push(base.clone());
        current = base;
    }
}

fn resolve_graph(raw: HashMap<String, ObjectType>) -> HashMap<String, ObjectType> {
    let mut resolved = HashMap::with_capacity(raw.len());

    for id in raw.keys() {
        let mut ot = raw[id].clone();
        if ot.disabled {
            resolved.insert(id.clone(), ot);
            continue;
        }

        let chain = match base_chain(&raw, id) {
            Ok(chain) => chain,
            Err(problem) => {
                ot.disabled = true;
                ot.problem = Some(problem);
                resolved.insert(id.clone(), ot);
                continue;
            }
        };

        // Walk root → leaf: later declarations override earlier ones;
        // `origins` records where an inherited action was declared.
        let mut actions: Vec<ActionMeta> = Vec::new();
        for ancestor_id in &chain {
            let ancestor = &raw[ancestor_id];
            for action in &ancestor.actions {
                let mut action = action.clone();
                action.origins = if ancestor_id == id {
                    None
                } else {
                    Some(ancestor_id.clone())
                };
                if let Some(existing) = actions.iter_mut().find(|a| a.name == action.name) {
                    *existing = action;
                } else {
                    actions.push(action);
                }
            }
        }
        actions.sort_by(|a, b| a.name.cmp(&b.name));
        ot.actions = actions;

        // Description backfill from the nearest documented ancestor.
        if ot.description.is_empty() {
            for ancestor_id in chain.iter().rev().skip(1) {
                let ancestor = &raw[ancestor_id];
                if !ancestor.description.is_empty() {
                    ot.description = ancestor.description.clone();
                    break;
                }
            }
        }

        // A type whose ancestor occupies a pose occupies one too.
        ot.has_pose = chain.iter().any(|ancestor_id| raw[ancestor_id].has_pose);

        resolved.insert(id.clone(), ot);
    }

    resolved
}

fn diff(old: &HashMap<String, ObjectType>, new: &HashMap<String, ObjectType>) -> RefreshDelta {
    let mut delta = RefreshDelta::default();
    for (id, ot) in new {
        match old.get(id) {
            None => delta.added.push(ot.clone()),
            Some(prev) => {
                let changed = prev.modified != ot.modified
                    || prev.disabled != ot.disabled
                    || prev.actions.len() != ot.actions.len();
                if changed {
                    delta.updated.push(ot.clone());
                }
            }
        }
    }
    for (id, ot) in old {
        if !new.contains_key(id) {
            delta.removed.push(ot.clone());
        }
    }
    delta.added.sort_by(|a, b| a.id.cmp(&b.id));
    delta.updated.sort_by(|a, b| a.id.cmp(&b.id));
    delta.removed.sort_by(|a, b| a.id.cmp(&b.id));
    delta
}
