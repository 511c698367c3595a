//! Docker backend: resolves a content-addressed image per dependency set and
//! runs tasks in per-commit containers.

use super::manifest::{Manifest, ManifestKind, PIPFILE, PIPFILE_LOCK};
use super::{
    timed_out, Backend, BackendConfig, BackendKind, EnvironmentHandle, Workspace, DEFAULT_INSTALL_TIMEOUT_SECS,
};
use crate::docker::engine::completion_context;
use crate::docker::{BaseImage, ContainerEngine, ContextFile, DockerCli, Dockerfile, ImageRef, ImageSpec, Instruction};
use crate::error::{ArcaError, BuildContext, Result};
use crate::process::{self, CommandOutput, Completion};
use crate::repository::WorkingCopy;
use crate::result::ExecutionResult;
use crate::settings::Settings;
use crate::task::protocol::{parse_runner_output, RUNNER_FILENAME};
use crate::task::Task;
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_PYTHON_VERSION: &str = "3.11";

const SCRIPTS_DIR: &str = "/srv/scripts";
const DATA_DIR: &str = "/srv/data";

static PYTHON_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.\d+(\.\d+)?)").expect("valid regex"));
static NON_CONTAINER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_.-]+").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerConfig {
    pub backend: BackendConfig,
    pub python_version: String,
    /// Alpine packages installed in their own layer
    pub apk_dependencies: Vec<String>,
    pub inherit_image: Option<ImageRef>,
    pub disable_pull: bool,
    /// Registry repository images are pulled from and pushed to
    pub use_registry_name: Option<String>,
    pub registry_pull_only: bool,
    pub keep_container_running: bool,
    /// Bound on each image build
    pub install_timeout: Duration,
}

impl DockerConfig {
    /// Reads the Docker settings under the prefix of `kind`, so the Vagrant
    /// backend can configure its inner Docker backend with its own keys.
    pub fn from_settings(settings: &Settings, kind: BackendKind) -> Result<Self> {
        let backend = settings.backend(kind.settings_name());

        let python_version = match backend.string("python_version") {
            Some(version) => {
                if !is_python_version(&version) {
                    return Err(ArcaError::misconfigured(format!(
                        "Python version '{}' isn't in the X.Y or X.Y.Z format",
                        version
                    )));
                }
                version
            }
            None => host_python_version().unwrap_or_else(|| DEFAULT_PYTHON_VERSION.to_string()),
        };

        let config = Self {
            backend: BackendConfig::from_settings(&backend)?,
            python_version,
            apk_dependencies: backend.list("apk_dependencies").unwrap_or_default(),
            inherit_image: backend.string("inherit_image").map(|i| ImageRef::parse(&i)),
            disable_pull: backend.bool("disable_pull", false)?,
            use_registry_name: backend.string("use_registry_name"),
            registry_pull_only: backend.bool("registry_pull_only", false)?,
            keep_container_running: backend.bool("keep_container_running", false)?,
            install_timeout: backend.secs("install_timeout", DEFAULT_INSTALL_TIMEOUT_SECS)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.inherit_image.is_some() && !self.apk_dependencies.is_empty() {
            return Err(ArcaError::misconfigured(
                "An inherited image can't be combined with apk dependencies",
            ));
        }
        if self.registry_pull_only && self.use_registry_name.is_none() {
            return Err(ArcaError::misconfigured(
                "registry_pull_only requires use_registry_name",
            ));
        }
        Ok(())
    }

    pub fn base_image(&self) -> BaseImage {
        match &self.inherit_image {
            Some(image) => BaseImage::Inherited(image.clone()),
            None => BaseImage::Arca {
                python_version: self.python_version.clone(),
            },
        }
    }
}

fn is_python_version(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    (2..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Version of the host `python3`, if there is one.
pub fn host_python_version() -> Option<String> {
    let mut cmd = Command::new("python3");
    cmd.arg("--version");
    let output = process::run(cmd).ok().filter(|o| o.success())?;
    // python 2 and early 3 print the version on stderr
    let text = format!("{} {}", output.stdout_str(), output.stderr_str());
    PYTHON_VERSION
        .captures(&text)
        .map(|caps| caps[1].to_string())
}

pub struct DockerBackend {
    config: DockerConfig,
    workspace: Workspace,
    engine: Box<dyn ContainerEngine>,
    /// Containers left running for reuse
    running: BTreeSet<String>,
}

impl DockerBackend {
    pub fn new(config: DockerConfig, base_dir: &Path) -> Result<Self> {
        let engine = DockerCli::default().with_build_timeout(config.install_timeout);
        Self::with_engine(config, base_dir, Box::new(engine))
    }

    /// Fails eagerly when the configuration is invalid or the engine is unreachable.
    pub fn with_engine(config: DockerConfig, base_dir: &Path, engine: Box<dyn ContainerEngine>) -> Result<Self> {
        config.validate()?;
        engine.ping()?;
        Ok(Self {
            config,
            workspace: Workspace::new(base_dir),
            engine,
            running: BTreeSet::new(),
        })
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    pub fn image_spec(&self, copy: &WorkingCopy) -> Result<(ImageSpec, Option<Manifest>)> {
        let manifest = Manifest::locate(&copy.path, &self.config.backend)?;
        let spec = ImageSpec::new(
            self.config.base_image(),
            self.config.apk_dependencies.clone(),
            manifest.as_ref().map(Manifest::fingerprint),
        );
        Ok((spec, manifest))
    }

    /// Makes the image for `copy` available locally and returns its spec.
    ///
    /// Local image, then registry pull, then a layered build. Built images
    /// are pushed when a registry is configured and pushing isn't disabled.
    pub fn resolve(&self, copy: &WorkingCopy) -> Result<ImageSpec> {
        let (spec, manifest) = self.image_spec(copy)?;
        let image = spec.image();

        if self.engine.image_exists(&image)? {
            debug!(image = %image, "image exists locally");
            return Ok(spec);
        }

        if let Some(registry) = &self.config.use_registry_name {
            if !self.config.disable_pull {
                let remote = spec.registry_image(registry);
                if self.engine.pull(&remote)? {
                    info!(image = %image, remote = %remote, "pulled image from registry");
                    self.engine.tag(&remote, &image)?;
                    return Ok(spec);
                }
            }
        }

        self.build_layers(&spec, manifest.as_ref())?;

        if let Some(registry) = &self.config.use_registry_name {
            if !self.config.registry_pull_only {
                let remote = spec.registry_image(registry);
                self.engine.tag(&image, &remote)?;
                self.engine.push(&remote)?;
            }
        }
        Ok(spec)
    }

    fn build_layers(&self, spec: &ImageSpec, manifest: Option<&Manifest>) -> Result<()> {
        let image = spec.image();
        let mut parent = self.base_layer(spec)?;

        if let Some(layer) = spec.dependencies_layer() {
            if !self.engine.image_exists(&layer)? {
                info!(image = %layer, dependencies = ?spec.dependencies, "building dependencies layer");
                let dockerfile = Dockerfile::from_image(parent.to_string())
                    .run(format!("apk add --no-cache {}", spec.dependencies.join(" ")));
                self.engine.build(&layer, &dockerfile.render(), &[])?;
            }
            parent = layer;
        }

        match manifest {
            Some(manifest) => {
                info!(image = %image, kind = manifest.kind.marker(), "building requirements layer");
                let (dockerfile, files) = requirements_layer(&parent, manifest)?;
                self.engine.build(&image, &dockerfile.render(), &files)
            }
            None if parent != image => self.engine.tag(&parent, &image),
            None => Ok(()),
        }
    }

    fn base_layer(&self, spec: &ImageSpec) -> Result<ImageRef> {
        let layer = spec.base_layer();
        if self.engine.image_exists(&layer)? {
            return Ok(layer);
        }

        match &spec.base {
            BaseImage::Arca { python_version } => {
                info!(image = %layer, python_version, "building arca base image");
                let dockerfile = arca_base_dockerfile(python_version);
                self.engine.build(&layer, &dockerfile.render(), &[])?;
            }
            BaseImage::Inherited(inherited) => {
                if !self.engine.image_exists(inherited)? && !self.engine.pull(inherited)? {
                    return Err(ArcaError::build(
                        format!("The inherited image {} can't be pulled", inherited),
                        BuildContext::default(),
                    ));
                }
                self.engine.tag(inherited, &layer)?;
            }
        }
        Ok(layer)
    }

    pub fn container_name(copy: &WorkingCopy) -> String {
        let branch = NON_CONTAINER_NAME.replace_all(&copy.branch, "_");
        format!("arca_{}_{}_{}", copy.repo_id, branch, copy.short_commit)
    }

    fn container_workdir(&self) -> String {
        let cwd = self.config.backend.cwd.to_string_lossy();
        if cwd.is_empty() {
            DATA_DIR.to_string()
        } else {
            format!("{}/{}", DATA_DIR, cwd.trim_matches('/'))
        }
    }

    /// Starts the container for `copy` unless it already runs.
    fn start_container(&self, image: &ImageRef, name: &str, copy: &WorkingCopy) -> Result<()> {
        if self.engine.container_running(name)? {
            debug!(container = name, "reusing running container");
            return Ok(());
        }

        self.engine.run_detached(image, name, &self.container_workdir())?;

        let mkdir = vec![
            "mkdir".to_string(),
            "-p".to_string(),
            SCRIPTS_DIR.to_string(),
            DATA_DIR.to_string(),
        ];
        match self.engine.exec(name, &mkdir, None)? {
            Completion::Finished(output) if output.success() => {}
            other => {
                return Err(ArcaError::build(
                    "Unable to prepare the container",
                    completion_context(&other),
                ))
            }
        }

        self.engine.copy_into(name, &copy.path.join("."), DATA_DIR)?;
        let runner = self.workspace.write_runner()?;
        self.engine
            .copy_into(name, &runner, &format!("{}/{}", SCRIPTS_DIR, RUNNER_FILENAME))?;
        Ok(())
    }

    /// Copies the task definition in and runs it with the task's timeout.
    fn execute(&self, container: &str, task: &Task) -> Result<CommandOutput> {
        let definition = self.workspace.write_task(task)?;
        let target = format!("{}/{}.json", SCRIPTS_DIR, task.hash());
        self.engine.copy_into(container, &definition, &target)?;

        info!(task = %task, container = %container, "running task in container");
        let command = vec![
            "python".to_string(),
            format!("{}/{}", SCRIPTS_DIR, RUNNER_FILENAME),
            target,
        ];
        match self.engine.exec(container, &command, Some(task.timeout()))? {
            Completion::TimedOut => {
                warn!(container = %container, "task timed out, killing container");
                Err(timed_out(task))
            }
            Completion::Finished(output) => Ok(output),
        }
    }

    fn kill_container(&mut self, name: &str) -> Result<()> {
        self.running.remove(name);
        self.engine.kill(name)
    }

    /// Kills every container kept running by this backend.
    pub fn stop_containers(&mut self) -> Result<()> {
        for name in std::mem::take(&mut self.running) {
            info!(container = %name, "stopping container");
            self.engine.kill(&name)?;
        }
        Ok(())
    }

    pub fn running_containers(&self) -> impl Iterator<Item = &str> {
        self.running.iter().map(String::as_str)
    }
}

fn arca_base_dockerfile(python_version: &str) -> Dockerfile {
    Dockerfile::from_image(format!("python:{}-alpine", python_version))
        .run("apk add --no-cache bash git build-base")
        .run("python -m pip install --no-cache-dir pipenv")
        .run(format!("mkdir -p {} {}", SCRIPTS_DIR, DATA_DIR))
        .push(Instruction::Env("PYTHONUNBUFFERED".into(), "1".into()))
        .push(Instruction::Workdir(DATA_DIR.into()))
        .idle_cmd()
}

fn requirements_layer(parent: &ImageRef, manifest: &Manifest) -> Result<(Dockerfile, Vec<ContextFile>)> {
    let base = Dockerfile::from_image(parent.to_string());
    match manifest.kind {
        ManifestKind::Requirements => Ok((
            base.add("requirements.txt", "/srv/requirements.txt")
                .run("python -m pip install --no-cache-dir -r /srv/requirements.txt"),
            vec![ContextFile {
                name: "requirements.txt".into(),
                contents: manifest.text.clone().into_bytes(),
            }],
        )),
        ManifestKind::Pipfile => {
            let pipfile = manifest.pipfile().ok_or_else(|| {
                ArcaError::build("Pipfile is missing", BuildContext::default())
            })?;
            Ok((
                base.add(PIPFILE, format!("/srv/{}", PIPFILE))
                    .add(PIPFILE_LOCK, format!("/srv/{}", PIPFILE_LOCK))
                    .run("python -m pip install --no-cache-dir pipenv && cd /srv && pipenv install --system --deploy --ignore-pipfile"),
                vec![
                    ContextFile {
                        name: PIPFILE.into(),
                        contents: fs::read(pipfile)?,
                    },
                    ContextFile {
                        name: PIPFILE_LOCK.into(),
                        contents: manifest.text.clone().into_bytes(),
                    },
                ],
            ))
        }
    }
}

impl Backend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    fn get_or_create_environment(&mut self, copy: &WorkingCopy) -> Result<EnvironmentHandle> {
        let spec = self.resolve(copy)?;
        Ok(EnvironmentHandle::Container {
            image: spec.image(),
            container: Self::container_name(copy),
        })
    }

    fn run(
        &mut self,
        copy: &WorkingCopy,
        task: &Task,
        environment: &EnvironmentHandle,
    ) -> Result<ExecutionResult> {
        let EnvironmentHandle::Container { image, container } = environment else {
            return Err(ArcaError::misconfigured(
                "The docker backend can only run tasks in a container",
            ));
        };

        let outcome = self
            .start_container(image, container, copy)
            .and_then(|()| self.execute(container, task));

        // a container that failed half way through setup is never reused
        if self.config.keep_container_running && outcome.is_ok() {
            self.running.insert(container.clone());
        } else if let Err(e) = self.kill_container(container) {
            if outcome.is_ok() {
                return Err(e);
            }
            warn!(container = %container, error = %e, "unable to kill the container");
        }

        let output = outcome?;
        parse_runner_output(&output.stdout, &output.stderr, output.status.code())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    pub struct EngineState {
        pub local: HashSet<String>,
        pub registry: HashSet<String>,
        pub builds: Vec<(String, String)>,
        pub pushes: Vec<String>,
        pub pulls: Vec<String>,
        pub running: HashSet<String>,
        pub started: Vec<String>,
        pub killed: Vec<String>,
        pub copies: Vec<(String, String)>,
        pub runner_stdout: String,
        pub time_out: bool,
        pub fail_copies: bool,
    }

    #[derive(Debug, Clone, Default)]
    pub struct FakeEngine(pub Rc<RefCell<EngineState>>);

    impl ContainerEngine for FakeEngine {
        fn ping(&self) -> Result<()> {
            Ok(())
        }

        fn image_exists(&self, image: &ImageRef) -> Result<bool> {
            Ok(self.0.borrow().local.contains(&image.to_string()))
        }

        fn pull(&self, image: &ImageRef) -> Result<bool> {
            let mut state = self.0.borrow_mut();
            state.pulls.push(image.to_string());
            let found = state.registry.contains(&image.to_string());
            if found {
                state.local.insert(image.to_string());
            }
            Ok(found)
        }

        fn tag(&self, _source: &ImageRef, target: &ImageRef) -> Result<()> {
            self.0.borrow_mut().local.insert(target.to_string());
            Ok(())
        }

        fn push(&self, image: &ImageRef) -> Result<()> {
            let mut state = self.0.borrow_mut();
            state.pushes.push(image.to_string());
            state.registry.insert(image.to_string());
            Ok(())
        }

        fn build(&self, image: &ImageRef, dockerfile: &str, _files: &[ContextFile]) -> Result<()> {
            let mut state = self.0.borrow_mut();
            state.builds.push((image.to_string(), dockerfile.to_string()));
            state.local.insert(image.to_string());
            Ok(())
        }

        fn container_running(&self, name: &str) -> Result<bool> {
            Ok(self.0.borrow().running.contains(name))
        }

        fn run_detached(&self, _image: &ImageRef, name: &str, _workdir: &str) -> Result<()> {
            let mut state = self.0.borrow_mut();
            state.started.push(name.to_string());
            state.running.insert(name.to_string());
            Ok(())
        }

        fn copy_into(&self, container: &str, _source: &Path, destination: &str) -> Result<()> {
            if self.0.borrow().fail_copies {
                return Err(ArcaError::build("docker cp failed", BuildContext::default()));
            }
            self.0
                .borrow_mut()
                .copies
                .push((container.to_string(), destination.to_string()));
            Ok(())
        }

        fn exec(&self, _container: &str, command: &[String], _timeout: Option<std::time::Duration>) -> Result<Completion> {
            let state = self.0.borrow();
            if command[0] == "python" && state.time_out {
                return Ok(Completion::TimedOut);
            }
            let stdout = if command[0] == "python" {
                state.runner_stdout.clone().into_bytes()
            } else {
                Vec::new()
            };
            Ok(Completion::Finished(CommandOutput {
                status: success_status(),
                stdout,
                stderr: Vec::new(),
            }))
        }

        fn kill(&self, container: &str) -> Result<()> {
            let mut state = self.0.borrow_mut();
            state.running.remove(container);
            state.killed.push(container.to_string());
            Ok(())
        }
    }

    #[cfg(unix)]
    fn success_status() -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(0)
    }

    #[cfg(windows)]
    fn success_status() -> std::process::ExitStatus {
        use std::os::windows::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(0)
    }

    pub fn config() -> DockerConfig {
        DockerConfig {
            backend: BackendConfig::default(),
            python_version: "3.11.4".into(),
            apk_dependencies: vec![],
            inherit_image: None,
            disable_pull: false,
            use_registry_name: None,
            registry_pull_only: false,
            keep_container_running: false,
            install_timeout: Duration::from_secs(DEFAULT_INSTALL_TIMEOUT_SECS),
        }
    }

    pub fn working_copy(path: &Path) -> WorkingCopy {
        WorkingCopy {
            repo: "https://example.com/repo.git".into(),
            branch: "feature/x".into(),
            repo_id: "example.com_repo_abc".into(),
            path: path.to_path_buf(),
            commit: "a".repeat(40),
            short_commit: "aaaaaaa".into(),
        }
    }

    fn backend(config: DockerConfig, base: &Path) -> (DockerBackend, FakeEngine) {
        let engine = FakeEngine::default();
        let backend = DockerBackend::with_engine(config, base, Box::new(engine.clone())).unwrap();
        (backend, engine)
    }

    #[test]
    fn test_inherit_image_with_dependencies_is_misconfigured() {
        let config = DockerConfig {
            inherit_image: Some(ImageRef::parse("python:3.6")),
            apk_dependencies: vec!["libxml2".into()],
            ..config()
        };
        assert!(matches!(config.validate(), Err(ArcaError::Misconfigured(_))));

        let settings = Settings::from_pairs([
            ("docker_backend_python_version", "3.11"),
            ("docker_backend_inherit_image", "python:3.6"),
            ("backend_apk_dependencies", "libxml2"),
        ]);
        assert!(DockerConfig::from_settings(&settings, BackendKind::Docker).is_err());

        let settings = Settings::from_pairs([("docker_backend_python_version", "latest")]);
        assert!(DockerConfig::from_settings(&settings, BackendKind::Docker).is_err());
    }

    #[test]
    fn test_install_timeout_uses_generic_backend_key() {
        let settings = Settings::from_pairs([
            ("docker_backend_python_version", "3.11"),
            ("backend_install_timeout", "42"),
        ]);
        let config = DockerConfig::from_settings(&settings, BackendKind::Docker).unwrap();
        assert_eq!(config.install_timeout, Duration::from_secs(42));
    }

    #[test]
    fn test_builds_layers_once_and_reuses_dependencies_layer() {
        let base = tempfile::tempdir().unwrap();
        let repo_a = tempfile::tempdir().unwrap();
        let repo_b = tempfile::tempdir().unwrap();
        fs::write(repo_a.path().join("requirements.txt"), "requests\n").unwrap();
        fs::write(repo_b.path().join("requirements.txt"), "colorama\n").unwrap();

        let config = DockerConfig {
            apk_dependencies: vec!["libxml2".into()],
            ..config()
        };
        let (backend, engine) = backend(config, base.path());

        let spec_a = backend.resolve(&working_copy(repo_a.path())).unwrap();
        assert!(spec_a.tag().starts_with("ard_"));
        assert_eq!(engine.0.borrow().builds.len(), 3);

        backend.resolve(&working_copy(repo_b.path())).unwrap();
        let builds = engine.0.borrow().builds.clone();
        assert_eq!(builds.len(), 4);
        assert!(builds[3].1.starts_with(&format!(
            "FROM {}",
            spec_a.dependencies_layer().unwrap()
        )));

        backend.resolve(&working_copy(repo_a.path())).unwrap();
        assert_eq!(engine.0.borrow().builds.len(), 4);
    }

    #[test]
    fn test_pulls_from_registry_before_building() {
        let base = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let config = DockerConfig {
            use_registry_name: Some("docker.io/team/arca".into()),
            ..config()
        };
        let (backend, engine) = backend(config, base.path());

        let (spec, _) = backend.image_spec(&working_copy(repo.path())).unwrap();
        let remote = spec.registry_image("docker.io/team/arca").to_string();
        engine.0.borrow_mut().registry.insert(remote.clone());

        backend.resolve(&working_copy(repo.path())).unwrap();
        let state = engine.0.borrow();
        assert_eq!(state.pulls, vec![remote]);
        assert!(state.builds.is_empty());
        assert!(state.local.contains(&spec.image().to_string()));
    }

    #[test]
    fn test_pushes_built_image_unless_pull_only() {
        let base = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let config = DockerConfig {
            use_registry_name: Some("docker.io/team/arca".into()),
            ..config()
        };
        let (pushing, engine) = backend(config.clone(), base.path());
        let spec = pushing.resolve(&working_copy(repo.path())).unwrap();
        assert_eq!(
            engine.0.borrow().pushes,
            vec![spec.registry_image("docker.io/team/arca").to_string()]
        );

        let (pull_only, engine) = backend(
            DockerConfig {
                registry_pull_only: true,
                ..config
            },
            base.path(),
        );
        pull_only.resolve(&working_copy(repo.path())).unwrap();
        assert!(engine.0.borrow().pushes.is_empty());
    }

    #[test]
    fn test_identical_configuration_resolves_identical_image() {
        let base = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        fs::write(repo.path().join("requirements.txt"), "requests\n").unwrap();
        let config = DockerConfig {
            apk_dependencies: vec!["libxslt".into(), "libxml2".into()],
            ..config()
        };

        let (first, _) = backend(config.clone(), base.path());
        let (second, _) = backend(
            DockerConfig {
                apk_dependencies: vec!["libxml2".into(), "libxslt".into()],
                ..config
            },
            base.path(),
        );
        let copy = working_copy(repo.path());
        assert_eq!(
            first.image_spec(&copy).unwrap().0.image(),
            second.image_spec(&copy).unwrap().0.image()
        );
    }

    #[test]
    fn test_inherited_image_is_tagged_not_built() {
        let base = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let config = DockerConfig {
            inherit_image: Some(ImageRef::parse("python:3.6")),
            ..config()
        };
        let (backend, engine) = backend(config, base.path());
        engine.0.borrow_mut().registry.insert("python:3.6".into());

        let spec = backend.resolve(&working_copy(repo.path())).unwrap();
        assert_eq!(spec.tag(), "ise");
        let state = engine.0.borrow();
        assert!(state.builds.is_empty());
        assert!(state.local.contains(&spec.image().to_string()));
    }

    #[test]
    fn test_run_kills_container_unless_kept() {
        let base = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let copy = working_copy(repo.path());
        let task = Task::new("module:func").unwrap();

        let (mut backend, engine) = backend(config(), base.path());
        engine.0.borrow_mut().runner_stdout =
            r#"{"success": true, "result": "A", "stdout": "", "stderr": ""}"#.into();

        let env = backend.get_or_create_environment(&copy).unwrap();
        let result = backend.run(&copy, &task, &env).unwrap();
        assert_eq!(result.output(), Some(&serde_json::json!("A")));

        let name = DockerBackend::container_name(&copy);
        assert_eq!(name, "arca_example.com_repo_abc_feature_x_aaaaaaa");
        let state = engine.0.borrow();
        assert_eq!(state.killed, vec![name.clone()]);
        assert!(state
            .copies
            .iter()
            .any(|(c, dest)| c == &name && dest == &format!("/srv/scripts/{}.json", task.hash())));
    }

    #[test]
    fn test_kept_containers_are_reused_and_stopped() {
        let base = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let copy = working_copy(repo.path());
        let task = Task::new("module:func").unwrap();

        let config = DockerConfig {
            keep_container_running: true,
            ..config()
        };
        let (mut backend, engine) = backend(config, base.path());
        engine.0.borrow_mut().runner_stdout =
            r#"{"success": true, "result": 1, "stdout": "", "stderr": ""}"#.into();

        let env = backend.get_or_create_environment(&copy).unwrap();
        backend.run(&copy, &task, &env).unwrap();
        backend.run(&copy, &task, &env).unwrap();
        assert_eq!(engine.0.borrow().started.len(), 1);
        assert_eq!(backend.running_containers().count(), 1);

        backend.stop_containers().unwrap();
        assert_eq!(backend.running_containers().count(), 0);
        assert!(engine.0.borrow().running.is_empty());
    }

    #[test]
    fn test_timeout_kills_container() {
        let base = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let copy = working_copy(repo.path());
        let task = Task::builder("module:func").timeout(1).build().unwrap();

        let config = DockerConfig {
            keep_container_running: true,
            ..config()
        };
        let (mut backend, engine) = backend(config, base.path());
        engine.0.borrow_mut().time_out = true;

        let env = backend.get_or_create_environment(&copy).unwrap();
        let err = backend.run(&copy, &task, &env).unwrap_err();
        assert!(err.is_timeout());

        let name = DockerBackend::container_name(&copy);
        assert!(!engine.0.borrow().running.contains(&name));
        assert_eq!(backend.running_containers().count(), 0);
    }

    #[test]
    fn test_failed_setup_kills_started_container() {
        let base = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let copy = working_copy(repo.path());
        let task = Task::new("module:func").unwrap();

        let config = DockerConfig {
            keep_container_running: true,
            ..config()
        };
        let (mut backend, engine) = backend(config, base.path());
        let env = backend.get_or_create_environment(&copy).unwrap();
        engine.0.borrow_mut().fail_copies = true;

        let err = backend.run(&copy, &task, &env).unwrap_err();
        assert!(err.is_build_error());

        let name = DockerBackend::container_name(&copy);
        let state = engine.0.borrow();
        assert_eq!(state.started, vec![name.clone()]);
        assert_eq!(state.killed, vec![name.clone()]);
        assert!(!state.running.contains(&name));
        assert_eq!(backend.running_containers().count(), 0);
    }
}
