//! Skill discovery
//!
//! Skills come from five places. Collisions by name resolve in this order:
//! project directory, then user directory (overwrites), then external tool
//! servers (skipped on collision), then built-ins (always win). Names the
//! caller asks for explicitly are relabelled afterwards.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use super::manifest::{
    validate_name, BackendKind, Implementation, Permission, SkillManifest, SkillType,
    MANIFEST_FILE,
};
use super::skill::{Skill, SkillSource};
use super::version;
use crate::config::RuntimeConfig;
use crate::error::SkillError;
use crate::mcp::McpServerConfig;

/// Outcome of one discovery pass
#[derive(Debug, Default)]
pub struct Discovery {
    /// Sorted by name
    pub skills: Vec<Skill>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Loader {
    project_dir: Option<PathBuf>,
    user_dir: Option<PathBuf>,
    builtins: BTreeMap<String, SkillManifest>,
    external: BTreeMap<String, SkillManifest>,
}

impl Loader {
    pub fn new(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
            ..Default::default()
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            config.project_skills_dir.clone(),
            Some(config.user_skills_dir()),
        )
    }

    /// Add a skill compiled into the host
    pub fn register_builtin(&mut self, manifest: SkillManifest) -> Result<()> {
        manifest
            .validate()
            .with_context(|| format!("invalid built-in skill '{}'", manifest.name))?;
        self.builtins.insert(manifest.name.clone(), manifest);
        Ok(())
    }

    /// Synthesise one skill per external tool server
    ///
    /// Returns the synthetic skill names that were added.
    pub fn add_external_servers(
        &mut self,
        servers: &BTreeMap<String, McpServerConfig>,
    ) -> Vec<String> {
        let mut added = Vec::new();
        for (server, config) in servers {
            if !config.is_local() {
                debug!(server = %server, "Remote server left to the provider");
                continue;
            }
            match server_manifest(server) {
                Ok(manifest) => {
                    debug!(server = %server, skill = %manifest.name, "Synthesised server skill");
                    added.push(manifest.name.clone());
                    self.external.insert(manifest.name.clone(), manifest);
                }
                Err(e) => warn!("Skipping external server '{}': {}", server, e),
            }
        }
        added
    }

    /// Build the skill table
    pub fn discover(&self, explicit: &[String]) -> Result<Discovery> {
        let mut table: BTreeMap<String, Skill> = BTreeMap::new();

        if let Some(dir) = &self.project_dir {
            for skill in scan_dir(dir, SkillSource::Project)? {
                table.insert(skill.name().to_string(), skill);
            }
        }
        if let Some(dir) = &self.user_dir {
            for skill in scan_dir(dir, SkillSource::User)? {
                if table.contains_key(skill.name()) {
                    debug!(skill = %skill.name(), "User skill overrides project skill");
                }
                table.insert(skill.name().to_string(), skill);
            }
        }
        for (name, manifest) in &self.external {
            if table.contains_key(name) {
                debug!(skill = %name, "Server skill shadowed by an existing skill");
                continue;
            }
            table.insert(
                name.clone(),
                Skill::new(manifest.clone(), None, SkillSource::ExternalServer),
            );
        }
        for (name, manifest) in &self.builtins {
            table.insert(
                name.clone(),
                Skill::new(manifest.clone(), None, SkillSource::Builtin),
            );
        }

        for name in explicit {
            let Some(skill) = table.get_mut(name) else {
                return Err(SkillError::UnknownSkill(name.clone()))
                    .context("explicitly requested skill is not installed");
            };
            skill.source = SkillSource::Explicit;
        }

        let warnings = check_dependencies(&table)?;
        for warning in &warnings {
            warn!("{}", warning);
        }

        Ok(Discovery {
            skills: table.into_values().collect(),
            warnings,
        })
    }
}

/// Scan one skills directory. A missing directory is empty.
fn scan_dir(dir: &Path, source: SkillSource) -> Result<Vec<Skill>> {
    if !dir.is_dir() {
        debug!("Skills directory {:?} does not exist", dir);
        return Ok(Vec::new());
    }

    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read skills directory {:?}", dir))?;

    let mut skills = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || !path.join(MANIFEST_FILE).is_file() {
            continue;
        }
        let manifest = SkillManifest::from_dir(&path)
            .with_context(|| format!("failed to load skill from {}", path.display()))?;
        debug!(skill = %manifest.name, source = %source, "Loaded skill from {:?}", path);
        skills.push(Skill::new(manifest, Some(path), source));
    }

    skills.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(skills)
}

fn check_dependencies(table: &BTreeMap<String, Skill>) -> Result<Vec<String>> {
    let mut warnings = Vec::new();
    for skill in table.values() {
        for dep in &skill.manifest.dependencies {
            let problem = match table.get(&dep.name) {
                None => {
                    if !dep.optional {
                        return Err(SkillError::MissingDependency {
                            skill: skill.name().to_string(),
                            dependency: dep.name.clone(),
                        }
                        .into());
                    }
                    format!(
                        "skill '{}': optional dependency '{}' is not installed",
                        skill.name(),
                        dep.name
                    )
                }
                Some(found) => match &dep.version {
                    Some(req) if !version::satisfies(&found.manifest.version, req) => {
                        format!(
                            "skill '{}' requires '{}' {} but found {}",
                            skill.name(),
                            dep.name,
                            req,
                            found.manifest.version
                        )
                    }
                    _ => continue,
                },
            };
            if dep.optional {
                warnings.push(problem);
            } else {
                bail!(problem);
            }
        }
    }
    Ok(warnings)
}

/// `docs_search` -> `mcp-docs-search`
fn server_skill_name(server: &str) -> String {
    let mut slug = String::from("mcp");
    let mut dash = true;
    for c in server.chars() {
        if c.is_ascii_alphanumeric() {
            if dash {
                slug.push('-');
                dash = false;
            }
            slug.push(c.to_ascii_lowercase());
        } else {
            dash = true;
        }
    }
    slug
}

fn server_manifest(server: &str) -> Result<SkillManifest> {
    let name = server_skill_name(server);
    validate_name(&name, "name")?;

    let manifest = SkillManifest {
        name,
        version: "0.0.0".to_string(),
        description: format!("Tools from the '{}' tool server", server),
        types: vec![SkillType::Tool],
        author: None,
        license: None,
        homepage: None,
        triggers: Default::default(),
        permissions: vec![Permission::ShellExec],
        dependencies: Vec::new(),
        implementation: Some(Implementation {
            backend: BackendKind::Mcp,
            entrypoint: Some(server.to_string()),
            args: Vec::new(),
            env: Default::default(),
        }),
        prompt: None,
    };
    manifest.validate()?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_skill(root: &Path, name: &str, body: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), body).unwrap();
    }

    fn prompt_yaml(name: &str, description: &str, extra: &str) -> String {
        format!(
            "name: {}\nversion: 1.0.0\ndescription: {}\ntypes: [prompt]\n{}",
            name, description, extra
        )
    }

    fn builtin(name: &str) -> SkillManifest {
        SkillManifest::from_yaml(&prompt_yaml(name, "built in", "")).unwrap()
    }

    struct Dirs {
        _temp: TempDir,
        project: PathBuf,
        user: PathBuf,
    }

    fn dirs() -> Dirs {
        let temp = tempfile::tempdir().unwrap();
        let project = temp.path().join("project");
        let user = temp.path().join("user");
        fs::create_dir_all(&project).unwrap();
        fs::create_dir_all(&user).unwrap();
        Dirs {
            _temp: temp,
            project,
            user,
        }
    }

    #[test]
    fn test_missing_dirs_are_empty() {
        let loader = Loader::new(
            Some(PathBuf::from("/nonexistent/project")),
            Some(PathBuf::from("/nonexistent/user")),
        );
        let found = loader.discover(&[]).unwrap();
        assert!(found.skills.is_empty());
        assert!(found.warnings.is_empty());
    }

    #[test]
    fn test_entries_without_manifest_are_skipped() {
        let d = dirs();
        fs::create_dir_all(d.project.join("notes")).unwrap();
        fs::write(d.project.join("README.md"), "hi").unwrap();
        write_skill(&d.project, "review", &prompt_yaml("review", "Review", ""));

        let loader = Loader::new(Some(d.project.clone()), None);
        let found = loader.discover(&[]).unwrap();
        assert_eq!(found.skills.len(), 1);
        assert_eq!(found.skills[0].name(), "review");
        assert_eq!(found.skills[0].source, SkillSource::Project);
        assert_eq!(found.skills[0].dir, Some(d.project.join("review")));
    }

    #[test]
    fn test_malformed_manifest_names_directory() {
        let d = dirs();
        write_skill(&d.project, "broken", "name: broken\nversion: 1.0.0\n");

        let loader = Loader::new(Some(d.project.clone()), None);
        let err = loader.discover(&[]).unwrap_err();
        assert!(format!("{:#}", err).contains("broken"));
        assert!(format!("{:#}", err).contains("description"));
    }

    #[test]
    fn test_precedence_builtin_wins_and_explicit_relabels() {
        let d = dirs();
        write_skill(&d.project, "review", &prompt_yaml("review", "from project", ""));
        write_skill(&d.user, "review", &prompt_yaml("review", "from user", ""));
        write_skill(&d.project, "lint", &prompt_yaml("lint", "from project", ""));
        write_skill(&d.user, "lint", &prompt_yaml("lint", "from user", ""));

        let mut loader = Loader::new(Some(d.project.clone()), Some(d.user.clone()));
        loader.register_builtin(builtin("review")).unwrap();

        let found = loader.discover(&[]).unwrap();
        let names: Vec<_> = found.skills.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["lint", "review"]);
        assert_eq!(found.skills[0].source, SkillSource::User);
        assert_eq!(found.skills[0].manifest.description, "from user");
        assert_eq!(found.skills[1].source, SkillSource::Builtin);
        assert_eq!(found.skills[1].manifest.description, "built in");
        assert!(found.skills[1].dir.is_none());

        let found = loader.discover(&["review".to_string()]).unwrap();
        let review = &found.skills[1];
        assert_eq!(review.source, SkillSource::Explicit);
        assert_eq!(review.manifest.description, "built in");
    }

    #[test]
    fn test_unknown_explicit_skill_is_error() {
        let loader = Loader::new(None, None);
        let err = loader.discover(&["ghost".to_string()]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SkillError>(),
            Some(SkillError::UnknownSkill(name)) if name == "ghost"
        ));
    }

    #[test]
    fn test_required_dependency_missing() {
        let d = dirs();
        write_skill(
            &d.project,
            "deploy",
            &prompt_yaml("deploy", "Deploy", "dependencies:\n  - name: git-tools\n"),
        );
        let loader = Loader::new(Some(d.project.clone()), None);
        let err = loader.discover(&[]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("deploy"));
        assert!(msg.contains("git-tools"));
    }

    #[test]
    fn test_optional_dependency_missing_warns_once() {
        let d = dirs();
        write_skill(
            &d.project,
            "deploy",
            &prompt_yaml(
                "deploy",
                "Deploy",
                "dependencies:\n  - name: git-tools\n    optional: true\n",
            ),
        );
        let loader = Loader::new(Some(d.project.clone()), None);
        let found = loader.discover(&[]).unwrap();
        assert_eq!(found.skills.len(), 1);
        assert_eq!(found.warnings.len(), 1);
        assert!(found.warnings[0].contains("deploy"));
        assert!(found.warnings[0].contains("git-tools"));
    }

    #[test]
    fn test_dependency_version_constraint() {
        let d = dirs();
        write_skill(&d.project, "base", &prompt_yaml("base", "Base", ""));
        write_skill(
            &d.project,
            "needs-new",
            &prompt_yaml(
                "needs-new",
                "Needs new base",
                "dependencies:\n  - name: base\n    version: \"^2.0\"\n",
            ),
        );
        let loader = Loader::new(Some(d.project.clone()), None);
        let err = loader.discover(&[]).unwrap_err();
        assert!(err.to_string().contains("^2.0"));

        write_skill(
            &d.project,
            "needs-new",
            &prompt_yaml(
                "needs-new",
                "Needs new base",
                "dependencies:\n  - name: base\n    version: \"^2.0\"\n    optional: true\n",
            ),
        );
        let found = loader.discover(&[]).unwrap();
        assert_eq!(found.warnings.len(), 1);
        assert!(found.warnings[0].contains("1.0.0"));
    }

    #[test]
    fn test_external_servers() {
        let d = dirs();
        write_skill(
            &d.project,
            "mcp-search",
            &prompt_yaml("mcp-search", "a local skill", ""),
        );

        let mut servers = BTreeMap::new();
        servers.insert(
            "search".to_string(),
            McpServerConfig::Local {
                command: "search-mcp".to_string(),
                args: Vec::new(),
                env: Default::default(),
            },
        );
        servers.insert(
            "Docs_Site".to_string(),
            McpServerConfig::Remote {
                url: "https://mcp.example.com".to_string(),
                authorization_token: None,
            },
        );

        servers.insert(
            "git_tools".to_string(),
            McpServerConfig::Local {
                command: "git-mcp".to_string(),
                args: Vec::new(),
                env: Default::default(),
            },
        );

        let mut loader = Loader::new(Some(d.project.clone()), None);
        let added = loader.add_external_servers(&servers);
        // Remote servers never become skills
        assert_eq!(added, vec!["mcp-git-tools", "mcp-search"]);

        let found = loader.discover(&[]).unwrap();
        let names: Vec<&str> = found.skills.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["mcp-git-tools", "mcp-search"]);

        let git = &found.skills[0];
        assert_eq!(git.source, SkillSource::ExternalServer);
        assert_eq!(
            git.manifest
                .implementation
                .as_ref()
                .and_then(|i| i.entrypoint.as_deref()),
            Some("git_tools")
        );

        // Project skill claimed the name first
        let search = &found.skills[1];
        assert_eq!(search.source, SkillSource::Project);

        let err = loader.discover(&["mcp-docs-site".to_string()]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SkillError>(),
            Some(SkillError::UnknownSkill(_))
        ));
    }

    #[test]
    fn test_local_server_gets_shell_exec() {
        let manifest = server_manifest("git").unwrap();
        assert_eq!(manifest.name, "mcp-git");
        assert_eq!(manifest.permissions, vec![Permission::ShellExec]);
        assert_eq!(manifest.backend_kind(), Some(BackendKind::Mcp));
    }

    #[test]
    fn test_invalid_builtin_rejected() {
        let mut manifest = builtin("ok");
        manifest.name = "Not Valid".to_string();
        let mut loader = Loader::default();
        assert!(loader.register_builtin(manifest).is_err());
    }
}
