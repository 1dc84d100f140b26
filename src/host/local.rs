//! In-process stub host. Projects are JSON documents holding a flat scene
//! (objects and materials) plus render state; every write is atomic.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{HostAdapter, HostError};
use crate::project::{atomic_write, read_project_bytes, ProjectError};

const PROJECT_FORMAT: &str = "harness-project";
const PROJECT_VERSION: u32 = 1;

// ── Project document ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectDoc {
    format: String,
    version: u32,
    #[serde(default)]
    scene: Scene,
    #[serde(default)]
    render: RenderState,
}

impl ProjectDoc {
    fn empty() -> Self {
        Self {
            format: PROJECT_FORMAT.to_string(),
            version: PROJECT_VERSION,
            scene: Scene::default(),
            render: RenderState::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Scene {
    #[serde(default)]
    objects: Vec<SceneObject>,
    #[serde(default)]
    materials: Vec<Material>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneObject {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    location: [f64; 3],
    rotation: [f64; 3],
    scale: [f64; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    material: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Material {
    name: String,
    base_color: [f64; 4],
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenderState {
    #[serde(default)]
    frames_rendered: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_frame: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_output: Option<String>,
}

// ── Operation params ────────────────────────────────────────────

#[derive(Deserialize)]
struct NewArgs {
    #[serde(default)]
    overwrite: bool,
}

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Deserialize)]
struct AddArgs {
    primitive: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    location: Option<[f64; 3]>,
    #[serde(default)]
    rotation: Option<[f64; 3]>,
    #[serde(default)]
    scale: Option<[f64; 3]>,
}

#[derive(Deserialize)]
struct NameArgs {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameArgs {
    name: String,
    new_name: String,
}

#[derive(Deserialize)]
struct TransformArgs {
    name: String,
    #[serde(default)]
    location: Option<[f64; 3]>,
    #[serde(default)]
    rotation: Option<[f64; 3]>,
    #[serde(default)]
    scale: Option<[f64; 3]>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaterialArgs {
    name: String,
    #[serde(default)]
    base_color: Option<[f64; 4]>,
}

#[derive(Deserialize)]
struct AssignArgs {
    object: String,
    material: String,
}

#[derive(Deserialize)]
struct FrameArgs {
    frame: i64,
    output: PathBuf,
}

// ── Adapter ─────────────────────────────────────────────────────

/// Stub host that performs scene edits on a JSON project file.
#[derive(Debug, Default)]
pub struct LocalHost {
    latency: Option<Duration>,
}

impl LocalHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation, to stand in for a slow host.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
        }
    }
}

#[async_trait]
impl HostAdapter for LocalHost {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn invoke(
        &self,
        operation: &str,
        project: Option<&Path>,
        params: Value,
    ) -> Result<Value, HostError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if operation == "system.ping" {
            return Ok(json!({ "host": self.name(), "ready": true }));
        }
        let project = project.ok_or_else(|| {
            HostError::domain(format!("operation '{operation}' requires a project"))
        })?;
        match operation {
            "project.new" => new_project(project, &args(params)?),
            "project.inspect" => inspect(&load(project)?, project),
            "project.validate" => Ok(validate(&load(project)?)),
            "scene.object.list" => list_objects(&load(project)?, &args(params)?),
            "scene.object.add" => edit(project, |doc| add_object(doc, args(params)?)),
            "scene.object.delete" => edit(project, |doc| delete_object(doc, &args(params)?)),
            "scene.object.rename" => edit(project, |doc| rename_object(doc, &args(params)?)),
            "scene.object.transform" => edit(project, |doc| transform_object(doc, args(params)?)),
            "scene.material.create" => edit(project, |doc| create_material(doc, args(params)?)),
            "scene.material.assign" => edit(project, |doc| assign_material(doc, &args(params)?)),
            "render.frame" => edit(project, |doc| render_frame(doc, &args(params)?)),
            other => Err(HostError::domain(format!("unsupported host operation '{other}'"))),
        }
    }
}

fn args<T: DeserializeOwned>(params: Value) -> Result<T, HostError> {
    serde_json::from_value(params).map_err(|e| HostError::domain(format!("bad operation arguments: {e}")))
}

fn load(project: &Path) -> Result<ProjectDoc, HostError> {
    let bytes = read_project_bytes(project).map_err(|e| match e {
        ProjectError::Missing(p) => HostError::not_found(format!("project {} not found", p.display())),
        other => HostError::domain(other.to_string()),
    })?;
    let doc: ProjectDoc = serde_json::from_slice(&bytes)
        .map_err(|e| HostError::domain(format!("{} is not a project file: {e}", project.display())))?;
    if doc.format != PROJECT_FORMAT {
        return Err(HostError::domain(format!(
            "{} has unknown format '{}'",
            project.display(),
            doc.format
        )));
    }
    Ok(doc)
}

fn save(project: &Path, doc: &ProjectDoc) -> Result<(), HostError> {
    let json = serde_json::to_vec_pretty(doc).map_err(|e| HostError::domain(e.to_string()))?;
    atomic_write(project, &json).map_err(|e| HostError::domain(e.to_string()))
}

/// Load, apply `f`, and save only if `f` succeeded.
fn edit<F>(project: &Path, f: F) -> Result<Value, HostError>
where
    F: FnOnce(&mut ProjectDoc) -> Result<Value, HostError>,
{
    let mut doc = load(project)?;
    let result = f(&mut doc)?;
    save(project, &doc)?;
    Ok(result)
}

fn new_project(project: &Path, a: &NewArgs) -> Result<Value, HostError> {
    if project.exists() && !a.overwrite {
        return Err(HostError::domain(format!(
            "{} already exists (pass overwrite=true to replace it)",
            project.display()
        )));
    }
    save(project, &ProjectDoc::empty())?;
    Ok(json!({ "project": project, "created": true }))
}

fn inspect(doc: &ProjectDoc, project: &Path) -> Result<Value, HostError> {
    Ok(json!({
        "project": project,
        "objectCount": doc.scene.objects.len(),
        "materialCount": doc.scene.materials.len(),
        "objects": doc.scene.objects.iter().map(|o| json!({"name": o.name, "type": o.kind})).collect::<Vec<_>>(),
        "materials": doc.scene.materials.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
        "render": doc.render,
    }))
}

fn validate(doc: &ProjectDoc) -> Value {
    let mut issues = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for object in &doc.scene.objects {
        if !seen.insert(object.name.as_str()) {
            issues.push(format!("duplicate object name '{}'", object.name));
        }
        let finite = object
            .location
            .iter()
            .chain(&object.rotation)
            .chain(&object.scale)
            .all(|v| v.is_finite());
        if !finite {
            issues.push(format!("object '{}' has a non-finite transform", object.name));
        }
        if let Some(material) = &object.material {
            if !doc.scene.materials.iter().any(|m| &m.name == material) {
                issues.push(format!(
                    "object '{}' references missing material '{material}'",
                    object.name
                ));
            }
        }
    }
    json!({ "valid": issues.is_empty(), "issues": issues })
}

fn list_objects(doc: &ProjectDoc, a: &ListArgs) -> Result<Value, HostError> {
    let objects: Vec<&SceneObject> = doc
        .scene
        .objects
        .iter()
        .filter(|o| a.kind.as_deref().map_or(true, |k| o.kind.eq_ignore_ascii_case(k)))
        .collect();
    Ok(json!({ "objects": objects, "count": objects.len() }))
}

/// Blender-style uniquifier: `Cube`, `Cube.001`, `Cube.002`, ...
fn unique_name<'a>(base: &str, taken: impl Iterator<Item = &'a str> + Clone) -> String {
    if !taken.clone().any(|n| n == base) {
        return base.to_string();
    }
    (1u32..)
        .map(|i| format!("{base}.{i:03}"))
        .find(|candidate| !taken.clone().any(|n| n == candidate))
        .unwrap_or_else(|| base.to_string())
}

fn default_object_name(primitive: &str) -> String {
    let lower = primitive.to_ascii_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => "Object".to_string(),
    }
}

fn find_object<'a>(doc: &'a mut ProjectDoc, name: &str) -> Result<&'a mut SceneObject, HostError> {
    doc.scene
        .objects
        .iter_mut()
        .find(|o| o.name == name)
        .ok_or_else(|| HostError::not_found(format!("object '{name}' not found")))
}

fn add_object(doc: &mut ProjectDoc, a: AddArgs) -> Result<Value, HostError> {
    let base = a
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| default_object_name(&a.primitive));
    let name = unique_name(&base, doc.scene.objects.iter().map(|o| o.name.as_str()));
    let object = SceneObject {
        name,
        kind: a.primitive.to_ascii_uppercase(),
        location: a.location.unwrap_or([0.0; 3]),
        rotation: a.rotation.unwrap_or([0.0; 3]),
        scale: a.scale.unwrap_or([1.0; 3]),
        material: None,
    };
    let result = json!({ "object": object });
    doc.scene.objects.push(object);
    Ok(result)
}

fn delete_object(doc: &mut ProjectDoc, a: &NameArgs) -> Result<Value, HostError> {
    let before = doc.scene.objects.len();
    doc.scene.objects.retain(|o| o.name != a.name);
    if doc.scene.objects.len() == before {
        return Err(HostError::not_found(format!("object '{}' not found", a.name)));
    }
    Ok(json!({ "deleted": a.name }))
}

fn rename_object(doc: &mut ProjectDoc, a: &RenameArgs) -> Result<Value, HostError> {
    if a.name != a.new_name && doc.scene.objects.iter().any(|o| o.name == a.new_name) {
        return Err(HostError::domain(format!("an object named '{}' already exists", a.new_name)));
    }
    let object = find_object(doc, &a.name)?;
    object.name.clone_from(&a.new_name);
    Ok(json!({ "object": object }))
}

fn transform_object(doc: &mut ProjectDoc, a: TransformArgs) -> Result<Value, HostError> {
    let object = find_object(doc, &a.name)?;
    if let Some(location) = a.location {
        object.location = location;
    }
    if let Some(rotation) = a.rotation {
        object.rotation = rotation;
    }
    if let Some(scale) = a.scale {
        object.scale = scale;
    }
    Ok(json!({ "object": object }))
}

fn create_material(doc: &mut ProjectDoc, a: MaterialArgs) -> Result<Value, HostError> {
    let name = unique_name(&a.name, doc.scene.materials.iter().map(|m| m.name.as_str()));
    let material = Material {
        name,
        base_color: a.base_color.unwrap_or([0.8, 0.8, 0.8, 1.0]),
    };
    let result = json!({ "material": material });
    doc.scene.materials.push(material);
    Ok(result)
}

fn assign_material(doc: &mut ProjectDoc, a: &AssignArgs) -> Result<Value, HostError> {
    if !doc.scene.materials.iter().any(|m| m.name == a.material) {
        return Err(HostError::not_found(format!("material '{}' not found", a.material)));
    }
    let object = find_object(doc, &a.object)?;
    object.material = Some(a.material.clone());
    Ok(json!({ "object": a.object, "material": a.material }))
}

/// Substitute the frame number for the first run of `#` in the output path,
/// zero-padded to the run's width. Paths without `#` are used as is.
fn frame_output_path(output: &Path, frame: i64) -> PathBuf {
    let text = output.to_string_lossy();
    let Some(start) = text.find('#') else {
        return output.to_path_buf();
    };
    let (head, rest) = text.split_at(start);
    let tail = rest.trim_start_matches('#');
    let width = rest.len() - tail.len();
    PathBuf::from(format!("{head}{frame:0width$}{tail}"))
}

fn render_frame(doc: &mut ProjectDoc, a: &FrameArgs) -> Result<Value, HostError> {
    let path = frame_output_path(&a.output, a.frame);
    let image = json!({
        "frame": a.frame,
        "objects": doc.scene.objects.iter().map(|o| &o.name).collect::<Vec<_>>(),
    });
    let bytes = serde_json::to_vec(&image).map_err(|e| HostError::domain(e.to_string()))?;
    atomic_write(&path, &bytes)
        .map_err(|e| HostError::domain(format!("failed to write {}: {e}", path.display())))?;
    doc.render.frames_rendered += 1;
    doc.render.last_frame = Some(a.frame);
    doc.render.last_output = Some(path.to_string_lossy().into_owned());
    Ok(json!({ "frame": a.frame, "output": path }))
}
