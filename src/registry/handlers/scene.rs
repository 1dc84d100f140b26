//! Scene edits. Each method is one opaque host operation; the handler only
//! reshapes params (the project travels separately from the arguments).

use std::sync::Arc;

use serde_json::json;

use super::common::host_call;
use crate::error::AppError;
use crate::registry::params::{
    AddObjectParams, AssignMaterialParams, CreateMaterialParams, ObjectNameParams,
    RenameObjectParams, SceneListParams, TransformObjectParams,
};
use crate::registry::MethodOutput;
use crate::state::BridgeState;

pub async fn list_objects(
    state: &Arc<BridgeState>,
    p: SceneListParams,
) -> Result<MethodOutput, AppError> {
    host_call(state, "scene.object.list", &p.project, json!({ "type": p.kind })).await
}

pub async fn add_object(state: &Arc<BridgeState>, p: AddObjectParams) -> Result<MethodOutput, AppError> {
    let args = json!({
        "primitive": p.primitive.as_str(),
        "name": p.name,
        "location": p.location,
        "rotation": p.rotation,
        "scale": p.scale,
    });
    host_call(state, "scene.object.add", &p.project, args).await
}

pub async fn delete_object(
    state: &Arc<BridgeState>,
    p: ObjectNameParams,
) -> Result<MethodOutput, AppError> {
    host_call(state, "scene.object.delete", &p.project, json!({ "name": p.name })).await
}

pub async fn rename_object(
    state: &Arc<BridgeState>,
    p: RenameObjectParams,
) -> Result<MethodOutput, AppError> {
    host_call(
        state,
        "scene.object.rename",
        &p.project,
        json!({ "name": p.name, "newName": p.new_name }),
    )
    .await
}

pub async fn transform_object(
    state: &Arc<BridgeState>,
    p: TransformObjectParams,
) -> Result<MethodOutput, AppError> {
    let args = json!({
        "name": p.name,
        "location": p.location,
        "rotation": p.rotation,
        "scale": p.scale,
    });
    host_call(state, "scene.object.transform", &p.project, args).await
}

pub async fn create_material(
    state: &Arc<BridgeState>,
    p: CreateMaterialParams,
) -> Result<MethodOutput, AppError> {
    host_call(
        state,
        "scene.material.create",
        &p.project,
        json!({ "name": p.name, "baseColor": p.base_color }),
    )
    .await
}

pub async fn assign_material(
    state: &Arc<BridgeState>,
    p: AssignMaterialParams,
) -> Result<MethodOutput, AppError> {
    host_call(
        state,
        "scene.material.assign",
        &p.project,
        json!({ "object": p.object, "material": p.material }),
    )
    .await
}
