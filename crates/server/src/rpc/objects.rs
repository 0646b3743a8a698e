//! Object-type catalog RPCs.

use serde::Deserialize;
use serde_json::{json, Value};

use arcor_domain::Result;

use super::Ctx;

pub async fn get_object_types(ctx: &Ctx<'_>) -> Result<Value> {
    Ok(json!({ "objectTypes": ctx.state.graph.all() }))
}

#[derive(Debug, Deserialize)]
struct GetActionsArgs {
    #[serde(rename = "type")]
    object_type: String,
}

pub async fn get_actions(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: GetActionsArgs = super::parse_args(&args)?;
    Ok(json!({ "actions": ctx.state.graph.actions(&args.object_type)? }))
}
