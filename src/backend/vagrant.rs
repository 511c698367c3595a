//! Runs the Docker image of a working copy inside a Vagrant VM.
//!
//! Image resolution is delegated to an inner [`DockerBackend`]; the VM pulls
//! the image from the registry, so a registry is mandatory.

use super::docker::{DockerBackend, DockerConfig};
use super::{timed_out, write_if_changed, Backend, BackendKind, EnvironmentHandle, Workspace};
use crate::docker::{ImageRef, ImageSpec};
use crate::error::{ArcaError, Result};
use crate::process::{self, Completion, CommandOutput};
use crate::repository::WorkingCopy;
use crate::result::ExecutionResult;
use crate::settings::Settings;
use crate::task::protocol::{parse_runner_output, RUNNER_FILENAME, RUNNER_SOURCE};
use crate::task::Task;
use std::ffi::{OsStr, OsString};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VagrantConfig {
    pub docker: DockerConfig,
    pub box_name: String,
    pub provider: String,
    /// Keep provisioning output out of the logs, it still goes to the log file
    pub quiet: bool,
    /// Destroy the VM after a run instead of halting it
    pub destroy: bool,
    pub keep_vm_running: bool,
}

impl VagrantConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let backend = settings.backend(BackendKind::Vagrant.settings_name());
        let config = Self {
            docker: DockerConfig::from_settings(settings, BackendKind::Vagrant)?,
            box_name: backend.string_or("box", "ubuntu/trusty64"),
            provider: backend.string_or("provider", "virtualbox"),
            quiet: backend.bool("quiet", false)?,
            destroy: backend.bool("destroy", false)?,
            keep_vm_running: backend.bool("keep_vm_running", false)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.docker.use_registry_name.is_none() {
            return Err(ArcaError::misconfigured(
                "The vagrant backend requires use_registry_name, the VM pulls images from the registry",
            ));
        }
        if self.box_name.contains('"') || self.provider.contains('"') {
            return Err(ArcaError::misconfigured("Box and provider can't contain quotes"));
        }
        Ok(())
    }

    fn registry(&self) -> Result<&str> {
        self.docker
            .use_registry_name
            .as_deref()
            .ok_or_else(|| ArcaError::misconfigured("use_registry_name is not set"))
    }
}

pub struct VagrantBackend {
    config: VagrantConfig,
    docker: DockerBackend,
    workspace: Workspace,
    log_file: PathBuf,
    /// Program and leading arguments every vagrant command starts with
    vagrant: Vec<OsString>,
}

impl VagrantBackend {
    pub fn new(config: VagrantConfig, base_dir: &Path) -> Result<Self> {
        config.validate()?;
        let docker = DockerBackend::new(config.docker.clone(), base_dir)?;
        Ok(Self::with_docker(config, base_dir, docker))
    }

    pub fn with_docker(config: VagrantConfig, base_dir: &Path, docker: DockerBackend) -> Self {
        let workspace = Workspace::new(base_dir);
        let log_file = workspace
            .dir("logs")
            .join(format!("{}.log", uuid::Uuid::new_v4()));
        Self {
            config,
            docker,
            workspace,
            log_file,
            vagrant: vec![OsString::from("vagrant")],
        }
    }

    /// Runs vagrant as `program` followed by `leading_args`, e.g. a wrapper script.
    pub fn with_vagrant_command<I, S>(mut self, program: impl Into<OsString>, leading_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.vagrant = std::iter::once(program.into())
            .chain(leading_args.into_iter().map(Into::into))
            .collect();
        self
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// `vagrant/<repo_id>/<branch>/<image_tag>`
    pub fn vagrant_dir(&self, copy: &WorkingCopy, spec: &ImageSpec) -> PathBuf {
        self.workspace
            .dir("vagrant")
            .join(&copy.repo_id)
            .join(&copy.branch)
            .join(spec.tag())
    }

    pub fn render_vagrantfile(&self, image: &ImageRef, repo_path: &Path) -> String {
        format!(
            r#"# -*- mode: ruby -*-
# vi: set ft=ruby :

Vagrant.configure("2") do |config|
  config.vm.box = "{box_name}"
  config.vm.provision "docker" do |d|
    d.pull_images "{image}"
  end
  config.vm.synced_folder "{repo_path}", "/srv/data"
  config.vm.provider "{provider}"
end
"#,
            box_name = self.config.box_name,
            image = image,
            repo_path = repo_path.display(),
            provider = self.config.provider,
        )
    }

    fn vagrant(&self, dir: &Path, args: &[&str]) -> Command {
        let (program, leading) = self
            .vagrant
            .split_first()
            .map_or((OsStr::new("vagrant"), &[][..]), |(p, rest)| (p.as_os_str(), rest));
        let mut cmd = Command::new(program);
        cmd.args(leading).args(args).current_dir(dir);
        cmd
    }

    /// Runs a vagrant command to completion, recording its output in the log file.
    fn checked(&self, dir: &Path, args: &[&str], failure: &str) -> Result<CommandOutput> {
        let output = process::run(self.vagrant(dir, args))?;
        self.record(args, &output)?;
        if !output.success() {
            return Err(ArcaError::build(failure, output.context()));
        }
        Ok(output)
    }

    fn record(&self, args: &[&str], output: &CommandOutput) -> Result<()> {
        if let Some(parent) = self.log_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?;
        writeln!(log, "$ vagrant {}", args.join(" "))?;
        log.write_all(&output.stdout)?;
        log.write_all(&output.stderr)?;

        if !self.config.quiet {
            debug!(command = %args.join(" "), stdout = %output.stdout_str(), "vagrant output");
        }
        Ok(())
    }

    fn ensure_up(&self, dir: &Path) -> Result<()> {
        let status = self.checked(
            dir,
            &["status", "--machine-readable"],
            "Unable to query the VM status",
        )?;
        if vm_running(&status.stdout_str()) {
            debug!(dir = %dir.display(), "VM already running");
            return Ok(());
        }

        info!(dir = %dir.display(), box_name = %self.config.box_name, "starting VM");
        self.checked(dir, &["up"], "Unable to start the VM")?;
        Ok(())
    }

    fn ssh(&self, dir: &Path, script: &str, failure: &str) -> Result<CommandOutput> {
        self.checked(dir, &["ssh", "-c", script], failure)
    }

    fn teardown_vm(&self, dir: &Path) -> Result<()> {
        if self.config.keep_vm_running {
            return Ok(());
        }
        if self.config.destroy {
            info!(dir = %dir.display(), "destroying VM");
            self.checked(dir, &["destroy", "--force"], "Unable to destroy the VM")?;
        } else {
            info!(dir = %dir.display(), "halting VM");
            self.checked(dir, &["halt"], "Unable to halt the VM")?;
        }
        Ok(())
    }
}

/// Parses `vagrant status --machine-readable`.
fn vm_running(status: &str) -> bool {
    status.lines().any(|line| {
        let fields: Vec<&str> = line.split(',').collect();
        fields.len() >= 4 && fields[2] == "state" && fields[3].trim() == "running"
    })
}

/// Shell script that starts or reuses the container inside the VM and copies
/// the working copy, the runner and the task definition into it.
pub fn setup_script(image: &ImageRef, container: &str, workdir: &str, task_file: &str) -> String {
    format!(
        "set -e\n\
         if [ \"$(docker inspect -f '{{{{.State.Running}}}}' {container} 2>/dev/null)\" != \"true\" ]; then\n\
         docker pull {image}\n\
         docker run -d -t --rm --name {container} -w {workdir} {image} tail -f /dev/null\n\
         fi\n\
         docker exec {container} mkdir -p /srv/scripts /srv/data\n\
         docker cp /srv/data/. {container}:/srv/data\n\
         docker cp /vagrant/{runner} {container}:/srv/scripts/{runner}\n\
         docker cp /vagrant/{task_file} {container}:/srv/scripts/{task_file}\n",
        container = container,
        image = image,
        workdir = workdir,
        runner = RUNNER_FILENAME,
        task_file = task_file,
    )
}

impl Backend for VagrantBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vagrant
    }

    fn get_or_create_environment(&mut self, copy: &WorkingCopy) -> Result<EnvironmentHandle> {
        let spec = self.docker.resolve(copy)?;
        let image = spec.registry_image(self.config.registry()?);

        let dir = self.vagrant_dir(copy, &spec);
        let vagrantfile = dir.join("Vagrantfile");
        let repo_path = std::path::absolute(&copy.path)?;
        write_if_changed(
            &vagrantfile,
            self.render_vagrantfile(&image, &repo_path).as_bytes(),
        )?;

        Ok(EnvironmentHandle::VirtualMachine {
            vagrantfile,
            image,
            container: DockerBackend::container_name(copy),
        })
    }

    fn run(
        &mut self,
        _copy: &WorkingCopy,
        task: &Task,
        environment: &EnvironmentHandle,
    ) -> Result<ExecutionResult> {
        let EnvironmentHandle::VirtualMachine {
            vagrantfile,
            image,
            container,
        } = environment
        else {
            return Err(ArcaError::misconfigured(
                "The vagrant backend can only run tasks in a VM",
            ));
        };
        let dir = vagrantfile
            .parent()
            .ok_or_else(|| ArcaError::misconfigured("Vagrantfile has no directory"))?;

        // /vagrant inside the VM is the Vagrantfile directory
        let task_file = format!("{}.json", task.hash());
        write_if_changed(&dir.join(RUNNER_FILENAME), RUNNER_SOURCE.as_bytes())?;
        write_if_changed(&dir.join(&task_file), task.json().as_bytes())?;

        let outcome = self.run_in_vm(dir, task, &task_file, image, container);

        // the VM is torn down whatever happened inside it
        match (outcome, self.teardown_vm(dir)) {
            (Ok(output), Ok(())) => {
                parse_runner_output(&output.stdout, &output.stderr, output.status.code())
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), teardown) => {
                if let Err(teardown) = teardown {
                    warn!(dir = %dir.display(), error = %teardown, "unable to tear down the VM");
                }
                Err(e)
            }
        }
    }
}

impl VagrantBackend {
    /// Boots the VM, starts the container inside it and runs the task.
    fn run_in_vm(
        &self,
        dir: &Path,
        task: &Task,
        task_file: &str,
        image: &ImageRef,
        container: &str,
    ) -> Result<CommandOutput> {
        self.ensure_up(dir)?;

        let workdir = match self.config.docker.backend.cwd.to_string_lossy() {
            cwd if cwd.is_empty() => "/srv/data".to_string(),
            cwd => format!("/srv/data/{}", cwd.trim_matches('/')),
        };
        self.ssh(
            dir,
            &setup_script(image, container, &workdir, task_file),
            "Unable to start the container in the VM",
        )?;

        info!(task = %task, container = %container, "running task in VM");
        let exec = format!(
            "docker exec {} python /srv/scripts/{} /srv/scripts/{}",
            container, RUNNER_FILENAME, task_file
        );
        let completion =
            process::run_with_timeout(self.vagrant(dir, &["ssh", "-c", &exec]), Some(task.timeout()));

        let output = match completion {
            Ok(Completion::Finished(output)) => output,
            Ok(Completion::TimedOut) => {
                warn!(container = %container, "task timed out, killing container");
                if let Err(e) = self.kill_container(dir, container) {
                    warn!(container = %container, error = %e, "unable to kill the container");
                }
                return Err(timed_out(task));
            }
            Err(e) => {
                self.kill_container(dir, container)?;
                return Err(e.into());
            }
        };
        self.record(&["ssh", "-c", &exec], &output)?;

        if !self.config.docker.keep_container_running {
            self.kill_container(dir, container)?;
        }
        Ok(output)
    }

    fn kill_container(&self, dir: &Path, container: &str) -> Result<()> {
        self.ssh(dir, &format!("docker kill {}", container), "Unable to kill the container")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::docker::tests::{config as docker_config, working_copy, FakeEngine};

    fn config() -> VagrantConfig {
        VagrantConfig {
            docker: DockerConfig {
                use_registry_name: Some("docker.io/team/arca".into()),
                ..docker_config()
            },
            box_name: "ubuntu/trusty64".into(),
            provider: "virtualbox".into(),
            quiet: false,
            destroy: false,
            keep_vm_running: false,
        }
    }

    #[test]
    fn test_registry_is_required() {
        let mut invalid = config();
        invalid.docker.use_registry_name = None;
        assert!(matches!(invalid.validate(), Err(ArcaError::Misconfigured(_))));

        let settings = Settings::from_pairs([("vagrant_backend_python_version", "3.11")]);
        assert!(VagrantConfig::from_settings(&settings).is_err());

        let settings = Settings::from_pairs([
            ("vagrant_backend_python_version", "3.11"),
            ("backend_use_registry_name", "docker.io/team/arca"),
            ("vagrant_backend_destroy", "yes"),
        ]);
        let config = VagrantConfig::from_settings(&settings).unwrap();
        assert!(config.destroy);
        assert_eq!(config.provider, "virtualbox");
    }

    #[test]
    fn test_environment_writes_vagrantfile() {
        let base = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let engine = FakeEngine::default();
        let docker = DockerBackend::with_engine(config().docker, base.path(), Box::new(engine.clone())).unwrap();
        let mut backend = VagrantBackend::with_docker(config(), base.path(), docker);

        let copy = working_copy(repo.path());
        let handle = backend.get_or_create_environment(&copy).unwrap();
        let EnvironmentHandle::VirtualMachine { vagrantfile, image, container } = handle else {
            panic!("expected a VM handle");
        };

        assert!(vagrantfile.starts_with(base.path().join("vagrant").join(&copy.repo_id)));
        assert!(vagrantfile.parent().unwrap().ends_with("ase"));
        assert_eq!(image.name, "docker.io/team/arca");
        assert_eq!(container, DockerBackend::container_name(&copy));

        let contents = fs::read_to_string(&vagrantfile).unwrap();
        assert!(contents.contains(&format!("d.pull_images \"{}\"", image)));
        assert!(contents.contains("config.vm.box = \"ubuntu/trusty64\""));
        assert_eq!(engine.0.borrow().pushes, vec![image.to_string()]);
        assert!(backend.log_file().starts_with(base.path().join("logs")));
    }

    #[test]
    fn test_vm_status_parse() {
        let running = "1700000000,default,metadata,provider,virtualbox\n1700000000,default,state,running\n";
        assert!(vm_running(running));
        assert!(!vm_running("1700000000,default,state,poweroff\n"));
        assert!(!vm_running(""));
    }

    #[cfg(unix)]
    #[test]
    fn test_vm_is_torn_down_when_setup_fails() {
        for (destroy, teardown) in [(false, "halt"), (true, "destroy")] {
            let base = tempfile::tempdir().unwrap();
            let repo = tempfile::tempdir().unwrap();
            let calls = base.path().join("calls.log");
            let script = base.path().join("vagrant.sh");
            // the VM reports running and every ssh session fails
            fs::write(
                &script,
                format!(
                    "echo \"$1\" >> '{}'\ncase \"$1\" in\n  status) echo 1700000000,default,state,running ;;\n  ssh) exit 1 ;;\nesac\n",
                    calls.display()
                ),
            )
            .unwrap();

            let config = VagrantConfig { destroy, ..config() };
            let docker =
                DockerBackend::with_engine(config.docker.clone(), base.path(), Box::new(FakeEngine::default())).unwrap();
            let mut backend = VagrantBackend::with_docker(config, base.path(), docker)
                .with_vagrant_command("sh", [script.clone().into_os_string()]);

            let copy = working_copy(repo.path());
            let env = backend.get_or_create_environment(&copy).unwrap();
            let err = backend
                .run(&copy, &Task::new("module:func").unwrap(), &env)
                .unwrap_err();
            assert!(err.is_build_error(), "{}", err);

            let calls = fs::read_to_string(&calls).unwrap();
            assert_eq!(calls.lines().collect::<Vec<_>>(), vec!["status", "ssh", teardown]);
        }
    }

    #[test]
    fn test_setup_script() {
        let script = setup_script(&ImageRef::new("reg/arca", "x_ase"), "arca_c", "/srv/data", "abc.json");
        assert!(script.contains("docker inspect -f '{{.State.Running}}' arca_c"));
        assert!(script.contains("docker run -d -t --rm --name arca_c -w /srv/data reg/arca:x_ase"));
        assert!(script.contains("docker cp /vagrant/abc.json arca_c:/srv/scripts/abc.json"));
    }
}
