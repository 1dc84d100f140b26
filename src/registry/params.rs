use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::validation::{
    validate_base_color, validate_finite_vec3, validate_frame_range, validate_name,
};
use crate::error::AppError;
use crate::jobs::JobStatusFilter;
use crate::plan::Plan;

/// Per-method param behavior consumed by the `define_methods!` expansion.
pub trait MethodParams {
    /// Name of the param that addresses the project, if the method has one.
    const PROJECT_PARAM: Option<&'static str> = None;

    fn project(&self) -> Option<&Path> {
        None
    }

    /// Semantic checks beyond the schema. Failures are `VALIDATION_FAILED`.
    fn validate(&self) -> Result<(), AppError> {
        Ok(())
    }
}

/// Implement `PROJECT_PARAM` and `project()` for a struct whose project
/// lives in field `$field`, serialized as `$name`.
macro_rules! project_param {
    ($field:ident, $name:literal) => {
        const PROJECT_PARAM: Option<&'static str> = Some($name);

        fn project(&self) -> Option<&Path> {
            Some(self.$field.as_path())
        }
    };
}

// ── Shared enums ────────────────────────────────────────────────

/// Primitive shapes the host can add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Primitive {
    Cube,
    #[serde(alias = "SPHERE")]
    UvSphere,
    IcoSphere,
    Cylinder,
    Cone,
    Torus,
    Plane,
    Monkey,
    Empty,
}

impl Primitive {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cube => "CUBE",
            Self::UvSphere => "UV_SPHERE",
            Self::IcoSphere => "ICO_SPHERE",
            Self::Cylinder => "CYLINDER",
            Self::Cone => "CONE",
            Self::Torus => "TORUS",
            Self::Plane => "PLANE",
            Self::Monkey => "MONKEY",
            Self::Empty => "EMPTY",
        }
    }
}

// ── System params ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MethodsParams {
    /// Category slug (e.g. "scene") or method name (e.g. "scene.object.add").
    #[serde(default)]
    pub topic: Option<String>,
}

impl MethodParams for MethodsParams {}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ValidateCallParams {
    /// Method name to check.
    pub method: String,
    /// Params to check against the method's schema.
    #[serde(default)]
    pub params: Value,
}

impl MethodParams for ValidateCallParams {
    fn validate(&self) -> Result<(), AppError> {
        validate_name(&self.method, "method")
    }
}

// ── Project params ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct NewProjectParams {
    /// Path of the project file to create.
    pub output: PathBuf,
    /// Replace an existing file.
    #[serde(default)]
    pub overwrite: bool,
}

impl MethodParams for NewProjectParams {
    project_param!(output, "output");
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CopyProjectParams {
    pub source: PathBuf,
    pub target: PathBuf,
    #[serde(default)]
    pub overwrite: bool,
}

impl MethodParams for CopyProjectParams {
    project_param!(target, "target");

    fn validate(&self) -> Result<(), AppError> {
        if self.source == self.target {
            return Err(AppError::validation("source and target must differ"));
        }
        Ok(())
    }
}

/// Params for methods that take only a project.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ProjectParams {
    pub project: PathBuf,
}

impl MethodParams for ProjectParams {
    project_param!(project, "project");
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DiffParams {
    pub source: PathBuf,
    pub target: PathBuf,
}

impl MethodParams for DiffParams {
    project_param!(source, "source");
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SnapshotParams {
    pub project: PathBuf,
    #[serde(default)]
    pub description: Option<String>,
}

impl MethodParams for SnapshotParams {
    project_param!(project, "project");
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UndoParams {
    pub project: PathBuf,
    /// Jump directly to this snapshot instead of stepping back one.
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

impl MethodParams for UndoParams {
    project_param!(project, "project");
}

// ── Scene params ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SceneListParams {
    pub project: PathBuf,
    /// Only objects of this type (case-insensitive), e.g. "CUBE".
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl MethodParams for SceneListParams {
    project_param!(project, "project");
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AddObjectParams {
    pub project: PathBuf,
    pub primitive: Primitive,
    /// Requested name; the host may suffix it to keep names unique.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location: Option<[f64; 3]>,
    #[serde(default)]
    pub rotation: Option<[f64; 3]>,
    #[serde(default)]
    pub scale: Option<[f64; 3]>,
}

impl MethodParams for AddObjectParams {
    project_param!(project, "project");

    fn validate(&self) -> Result<(), AppError> {
        if let Some(name) = &self.name {
            validate_name(name, "name")?;
        }
        validate_finite_vec3(self.location, "location")?;
        validate_finite_vec3(self.rotation, "rotation")?;
        validate_finite_vec3(self.scale, "scale")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ObjectNameParams {
    pub project: PathBuf,
    pub name: String,
}

impl MethodParams for ObjectNameParams {
    project_param!(project, "project");

    fn validate(&self) -> Result<(), AppError> {
        validate_name(&self.name, "name")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RenameObjectParams {
    pub project: PathBuf,
    pub name: String,
    pub new_name: String,
}

impl MethodParams for RenameObjectParams {
    project_param!(project, "project");

    fn validate(&self) -> Result<(), AppError> {
        validate_name(&self.name, "name")?;
        validate_name(&self.new_name, "newName")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TransformObjectParams {
    pub project: PathBuf,
    pub name: String,
    #[serde(default)]
    pub location: Option<[f64; 3]>,
    #[serde(default)]
    pub rotation: Option<[f64; 3]>,
    #[serde(default)]
    pub scale: Option<[f64; 3]>,
}

impl MethodParams for TransformObjectParams {
    project_param!(project, "project");

    fn validate(&self) -> Result<(), AppError> {
        validate_name(&self.name, "name")?;
        if self.location.is_none() && self.rotation.is_none() && self.scale.is_none() {
            return Err(AppError::validation(
                "transform needs at least one of location, rotation, scale",
            ));
        }
        validate_finite_vec3(self.location, "location")?;
        validate_finite_vec3(self.rotation, "rotation")?;
        validate_finite_vec3(self.scale, "scale")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateMaterialParams {
    pub project: PathBuf,
    pub name: String,
    /// RGBA, each channel in [0, 1].
    #[serde(default)]
    pub base_color: Option<[f64; 4]>,
}

impl MethodParams for CreateMaterialParams {
    project_param!(project, "project");

    fn validate(&self) -> Result<(), AppError> {
        validate_name(&self.name, "name")?;
        match self.base_color {
            Some(color) => validate_base_color(color),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AssignMaterialParams {
    pub project: PathBuf,
    pub object: String,
    pub material: String,
}

impl MethodParams for AssignMaterialParams {
    project_param!(project, "project");

    fn validate(&self) -> Result<(), AppError> {
        validate_name(&self.object, "object")?;
        validate_name(&self.material, "material")
    }
}

// ── Render params ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RenderStillParams {
    pub project: PathBuf,
    /// Output image path. A run of `#` is replaced by the frame number.
    pub output: PathBuf,
    #[serde(default = "default_frame")]
    pub frame: i64,
}

fn default_frame() -> i64 {
    1
}

impl MethodParams for RenderStillParams {
    project_param!(project, "project");
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RenderAnimationParams {
    pub project: PathBuf,
    /// Output pattern. `_####` is appended to the file stem when no `#` is present.
    pub output: PathBuf,
    pub frame_start: i64,
    pub frame_end: i64,
    #[serde(default = "default_frame_step")]
    pub frame_step: u32,
}

fn default_frame_step() -> u32 {
    1
}

impl MethodParams for RenderAnimationParams {
    project_param!(project, "project");

    fn validate(&self) -> Result<(), AppError> {
        validate_frame_range(self.frame_start, self.frame_end, self.frame_step)
    }
}

impl RenderAnimationParams {
    pub fn frames(&self) -> Vec<i64> {
        let step = usize::try_from(self.frame_step.max(1)).unwrap_or(1);
        (self.frame_start..=self.frame_end).step_by(step).collect()
    }
}

// ── Job params ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobStatusParams {
    pub job_id: String,
    /// Wait up to this long for the job to reach a terminal status.
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

impl MethodParams for JobStatusParams {}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobIdParams {
    pub job_id: String,
}

impl MethodParams for JobIdParams {}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct JobListParams {
    #[serde(default)]
    pub status: Option<JobStatusFilter>,
}

impl MethodParams for JobListParams {}

// ── Plan params ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlanRunParams {
    pub plan: Plan,
    /// Overrides `plan.options.dryRun`.
    #[serde(default)]
    pub dry_run: Option<bool>,
    /// Overrides `plan.options.rollbackOnFail`.
    #[serde(default)]
    pub rollback_on_fail: Option<bool>,
}

impl MethodParams for PlanRunParams {
    fn validate(&self) -> Result<(), AppError> {
        self.plan.validate()
    }
}
