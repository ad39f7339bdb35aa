//! Project registry.
//!
//! Resolves a project id to a validated working directory. Unknown ids and
//! missing directories are rejected before anything is enqueued.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::settings::ProjectConfig;
use crate::error::ExecError;

/// Config-backed project registry.
#[derive(Debug, Clone, Default)]
pub struct ProjectRegistry {
    projects: HashMap<String, PathBuf>,
}

impl ProjectRegistry {
    /// Build the registry from config, expanding `~` and env vars in paths.
    pub fn new(config: &HashMap<String, ProjectConfig>) -> Self {
        let projects = config
            .iter()
            .map(|(id, p)| {
                let expanded = shellexpand::full(&p.path)
                    .map(|s| PathBuf::from(s.as_ref()))
                    .unwrap_or_else(|_| PathBuf::from(&p.path));
                (id.clone(), expanded)
            })
            .collect();
        Self { projects }
    }

    /// Resolve a project id to its working directory, validating existence.
    pub fn resolve(&self, project_id: &str) -> Result<PathBuf, ExecError> {
        let path = self
            .projects
            .get(project_id)
            .ok_or_else(|| ExecError::InvalidProject(format!("unknown project {project_id}")))?;
        if !path.is_dir() {
            return Err(ExecError::InvalidProject(format!(
                "project {project_id} directory {} does not exist",
                path.display()
            )));
        }
        Ok(path.clone())
    }

    /// Registered project ids, for listings.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.projects.keys().cloned().collect();
        ids.sort();
        ids
    }
}
