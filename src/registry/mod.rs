pub mod catalog;
pub mod handlers;
pub mod params;
pub mod validation;

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::state::BridgeState;

pub use catalog::MethodDescriptor;

// ── Param types (used in Method enum) ───────────────────────────
use params::{
    AddObjectParams, AssignMaterialParams, CopyProjectParams, CreateMaterialParams, DiffParams,
    JobIdParams, JobListParams, JobStatusParams, MethodParams, MethodsParams, NewProjectParams,
    ObjectNameParams, PlanRunParams, ProjectParams, RenameObjectParams, RenderAnimationParams,
    RenderStillParams, SceneListParams, SnapshotParams, TransformObjectParams, UndoParams,
    ValidateCallParams,
};

// ── Handler modules (dispatch targets) ──────────────────────────
use handlers::{job, plan, project, render, scene, system};

// ── Method metadata ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodCategory {
    System,
    Project,
    Scene,
    Render,
    Job,
    Plan,
}

impl MethodCategory {
    pub fn slug(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Project => "project",
            Self::Scene => "scene",
            Self::Render => "render",
            Self::Job => "job",
            Self::Plan => "plan",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::System => "Health, version, discovery and diagnostics",
            Self::Project => "Project files, snapshots, undo and redo",
            Self::Scene => "Objects and materials inside a project",
            Self::Render => "Still and animation renders (run as jobs)",
            Self::Job => "Status, cancellation and listing of background jobs",
            Self::Plan => "Multi-step plans with rollback",
        }
    }

    pub fn all() -> &'static [MethodCategory] {
        &[
            Self::System,
            Self::Project,
            Self::Scene,
            Self::Render,
            Self::Job,
            Self::Plan,
        ]
    }
}

pub struct MethodInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub category: MethodCategory,
    pub mutates: bool,
    pub project_param: Option<&'static str>,
}

// ── Method output ───────────────────────────────────────────────

/// Result of executing a Method.
/// `message` is a one-line summary for logs; `result` is the envelope payload.
#[derive(Debug, Clone, Serialize)]
pub struct MethodOutput {
    pub message: String,
    pub result: Value,
}

impl MethodOutput {
    pub fn new(message: impl Into<String>, result: Value) -> Self {
        Self {
            message: message.into(),
            result,
        }
    }

    pub fn json<T: Serialize>(message: impl Into<String>, value: &T) -> Result<Self, AppError> {
        Ok(Self::new(message, serde_json::to_value(value)?))
    }
}

// ── define_methods! macro ───────────────────────────────────────

/// Single source of truth for all methods. Generates:
/// 1. `Method` enum, one variant per wire method
/// 2. `Method::info()`: name, description, category, mutates, project param
/// 3. `Method::descriptors()`: catalog entries with JSON schemas
/// 4. `Method::from_call()`: build a Method from a (name, params) pair
/// 5. `Method::project()` and `Method::validate()`
/// 6. `Method::dispatch()`: run the handler
macro_rules! define_methods {
    (
        params {
            $(
                [ $pc:expr $(, $pf:ident)* ]
                $pv:ident ( $pp:ty )
                => $ph:path, $pn:literal : $pd:literal ;
            )*
        }
        no_params {
            $(
                [ $nc:expr $(, $nf:ident)* ]
                $nv:ident
                => $nh:path, $nn:literal : $nd:literal ;
            )*
        }
    ) => {
        // ── 1. Method enum ──
        /// Closed set of wire methods. Adding a variant causes compiler errors
        /// until it is fully handled.
        #[derive(Debug, Clone)]
        pub enum Method {
            $( $pv($pp), )*
            $( $nv, )*
        }

        // ── 2. Method::info() ──
        impl Method {
            pub fn info(&self) -> MethodInfo {
                match self {
                    $( Method::$pv(_) => MethodInfo {
                        name: $pn,
                        description: $pd,
                        category: $pc,
                        mutates: define_methods!(@has_flag mutates; $($pf)*),
                        project_param: <$pp as MethodParams>::PROJECT_PARAM,
                    }, )*
                    $( Method::$nv => MethodInfo {
                        name: $nn,
                        description: $nd,
                        category: $nc,
                        mutates: define_methods!(@has_flag mutates; $($nf)*),
                        project_param: None,
                    }, )*
                }
            }
        }

        // ── 3. Method::descriptors() ──
        impl Method {
            pub(crate) fn descriptors() -> Vec<MethodDescriptor> {
                vec![
                    $( catalog::entry(
                        MethodInfo {
                            name: $pn,
                            description: $pd,
                            category: $pc,
                            mutates: define_methods!(@has_flag mutates; $($pf)*),
                            project_param: <$pp as MethodParams>::PROJECT_PARAM,
                        },
                        catalog::schema_value::<$pp>(),
                    ), )*
                    $( catalog::entry(
                        MethodInfo {
                            name: $nn,
                            description: $nd,
                            category: $nc,
                            mutates: define_methods!(@has_flag mutates; $($nf)*),
                            project_param: None,
                        },
                        catalog::empty_object_schema(),
                    ), )*
                ]
            }
        }

        // ── 4. Method::from_call() ──
        impl Method {
            pub(crate) fn from_call(name: &str, input: &Value) -> Result<Method, AppError> {
                match name {
                    $( $pn => Ok(Method::$pv(catalog::de(input)?)), )*
                    $( $nn => {
                        catalog::expect_no_params($nn, input)?;
                        Ok(Method::$nv)
                    } )*
                    _ => Err(AppError::not_found(format!("unknown method '{name}'"))),
                }
            }
        }

        // ── 5. Method::project() / Method::validate() ──
        impl Method {
            /// The project path this call addresses, if any.
            pub fn project(&self) -> Option<&Path> {
                match self {
                    $( Method::$pv(p) => p.project(), )*
                    $( Method::$nv => None, )*
                }
            }

            pub fn validate(&self) -> Result<(), AppError> {
                match self {
                    $( Method::$pv(p) => p.validate(), )*
                    $( Method::$nv => Ok(()), )*
                }
            }
        }

        // ── 6. Method::dispatch() ──
        impl Method {
            pub(crate) async fn dispatch(
                self,
                state: &Arc<BridgeState>,
            ) -> Result<MethodOutput, AppError> {
                match self {
                    $( Method::$pv(p) => $ph(state, p).await, )*
                    $( Method::$nv => $nh(state).await, )*
                }
            }
        }
    };

    // Flag helper. Literal tokens match before metavariables, so `mutates`
    // matches the first arm and any other ident recurses.
    (@has_flag mutates; mutates $($rest:ident)*) => { true };
    (@has_flag mutates; $_other:ident $($rest:ident)*) => { define_methods!(@has_flag mutates; $($rest)*) };
    (@has_flag mutates;) => { false };
}

// ── Method definitions ──────────────────────────────────────────

define_methods! {
    params {
        // ── System ──────────────────────────────────────────────
        [MethodCategory::System]
        Methods(MethodsParams)
        => system::methods, "system.methods": "List method descriptors. Optional topic narrows to a category or a single method.";

        [MethodCategory::System]
        Validate(ValidateCallParams)
        => system::validate, "system.validate": "Check that a method exists and its params validate, without running it.";

        // ── Project ─────────────────────────────────────────────
        [MethodCategory::Project, mutates]
        NewProject(NewProjectParams)
        => project::new_project, "project.new": "Create an empty project file at `output`.";

        [MethodCategory::Project, mutates]
        CopyProject(CopyProjectParams)
        => project::copy_project, "project.copy": "Copy the project file `source` to `target`.";

        [MethodCategory::Project, mutates]
        DeleteProject(ProjectParams)
        => project::delete_project, "project.delete": "Delete the project file. Its snapshot history is kept.";

        [MethodCategory::Project]
        Inspect(ProjectParams)
        => project::inspect, "project.inspect": "Summarize a project's objects, materials and render state.";

        [MethodCategory::Project]
        ValidateProject(ProjectParams)
        => project::validate_project, "project.validate": "Report structural problems in a project.";

        [MethodCategory::Project]
        Diff(DiffParams)
        => project::diff, "project.diff": "Compare the scene contents of two projects.";

        [MethodCategory::Project, mutates]
        Snapshot(SnapshotParams)
        => project::snapshot, "project.snapshot": "Record the current project state in its history.";

        [MethodCategory::Project, mutates]
        Undo(UndoParams)
        => project::undo, "project.undo": "Step back one snapshot, or jump to `snapshotId`, and restore it.";

        [MethodCategory::Project, mutates]
        Redo(ProjectParams)
        => project::redo, "project.redo": "Step forward one snapshot and restore it.";

        [MethodCategory::Project]
        History(ProjectParams)
        => project::history, "project.history": "List a project's snapshots and the current pointer.";

        [MethodCategory::Project]
        Status(ProjectParams)
        => project::status, "project.status": "Report lock state, history position and last output for a project.";

        // ── Scene ───────────────────────────────────────────────
        [MethodCategory::Scene]
        ListObjects(SceneListParams)
        => scene::list_objects, "scene.object.list": "List scene objects, optionally filtered by type.";

        [MethodCategory::Scene, mutates]
        AddObject(AddObjectParams)
        => scene::add_object, "scene.object.add": "Add a primitive object. Returns the object with its final name.";

        [MethodCategory::Scene, mutates]
        DeleteObject(ObjectNameParams)
        => scene::delete_object, "scene.object.delete": "Delete an object by name.";

        [MethodCategory::Scene, mutates]
        RenameObject(RenameObjectParams)
        => scene::rename_object, "scene.object.rename": "Rename an object.";

        [MethodCategory::Scene, mutates]
        TransformObject(TransformObjectParams)
        => scene::transform_object, "scene.object.transform": "Set location, rotation and/or scale of an object.";

        [MethodCategory::Scene, mutates]
        CreateMaterial(CreateMaterialParams)
        => scene::create_material, "scene.material.create": "Create a material with an optional RGBA base color.";

        [MethodCategory::Scene, mutates]
        AssignMaterial(AssignMaterialParams)
        => scene::assign_material, "scene.material.assign": "Assign an existing material to an object.";

        // ── Render ──────────────────────────────────────────────
        [MethodCategory::Render, mutates]
        RenderStill(RenderStillParams)
        => render::still, "render.still": "Render one frame as a background job. Returns the job id.";

        [MethodCategory::Render, mutates]
        RenderAnimation(RenderAnimationParams)
        => render::animation, "render.animation": "Render a frame range as a background job. Returns the job id.";

        // ── Job ─────────────────────────────────────────────────
        [MethodCategory::Job]
        JobStatus(JobStatusParams)
        => job::status, "job.status": "Get a job by id, optionally waiting up to waitMs for it to finish.";

        [MethodCategory::Job]
        JobCancel(JobIdParams)
        => job::cancel, "job.cancel": "Request cooperative cancellation of a job.";

        [MethodCategory::Job]
        JobList(JobListParams)
        => job::list, "job.list": "List jobs in submission order, optionally filtered by status.";

        // ── Plan ────────────────────────────────────────────────
        [MethodCategory::Plan]
        PlanRun(PlanRunParams)
        => plan::run, "plan.run": "Run a multi-step plan with variable substitution and rollback.";
    }
    no_params {
        [MethodCategory::System]
        Health
        => system::health, "system.health": "Liveness check. Takes no params and no lock.";

        [MethodCategory::System]
        Version
        => system::version, "system.version": "Bridge version, protocol version and host adapter name.";

        [MethodCategory::System]
        Doctor
        => system::doctor, "system.doctor": "Ping the host adapter and check the state directory.";
    }
}

// ── Registry ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("method '{0}' is registered more than once")]
    Duplicate(&'static str),
}

/// Name → descriptor map, populated once at startup and closed thereafter.
#[derive(Debug, Clone)]
pub struct Registry {
    methods: IndexMap<&'static str, MethodDescriptor>,
}

impl Registry {
    /// The built-in method set.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_descriptors(Method::descriptors())
    }

    pub fn from_descriptors(descriptors: Vec<MethodDescriptor>) -> Result<Self, RegistryError> {
        let mut methods = IndexMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let name = descriptor.name;
            if methods.insert(name, descriptor).is_some() {
                return Err(RegistryError::Duplicate(name));
            }
        }
        Ok(Self { methods })
    }

    /// Case-sensitive exact lookup.
    pub fn get(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.values()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Resolve a call to a validated [`Method`] and its descriptor.
    ///
    /// Unknown names are `NOT_FOUND`; param shape errors are `INVALID_INPUT`
    /// or `VALIDATION_FAILED`; semantic checks are `VALIDATION_FAILED`.
    pub fn resolve(
        &self,
        name: &str,
        params: &Value,
    ) -> Result<(Method, &MethodDescriptor), AppError> {
        let descriptor = self
            .get(name)
            .ok_or_else(|| AppError::not_found(format!("unknown method '{name}'")))?;
        let method = Method::from_call(name, params)?;
        method.validate()?;
        Ok((method, descriptor))
    }
}
