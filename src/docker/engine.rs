use super::image::ImageRef;
use crate::backend::DEFAULT_INSTALL_TIMEOUT_SECS;
use crate::error::{ArcaError, BuildContext, Result};
use crate::process::{self, Completion, CommandOutput};
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// A file shipped in an image build context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    pub name: String,
    pub contents: Vec<u8>,
}

/// The container engine operations the Docker and Vagrant backends need.
pub trait ContainerEngine {
    /// Fails with `Misconfigured` when the engine can't be reached
    fn ping(&self) -> Result<()>;
    fn image_exists(&self, image: &ImageRef) -> Result<bool>;
    /// `Ok(false)` when the registry doesn't have the image
    fn pull(&self, image: &ImageRef) -> Result<bool>;
    fn tag(&self, source: &ImageRef, target: &ImageRef) -> Result<()>;
    fn push(&self, image: &ImageRef) -> Result<()>;
    fn build(&self, image: &ImageRef, dockerfile: &str, files: &[ContextFile]) -> Result<()>;
    fn container_running(&self, name: &str) -> Result<bool>;
    fn run_detached(&self, image: &ImageRef, name: &str, workdir: &str) -> Result<()>;
    fn copy_into(&self, container: &str, source: &Path, destination: &str) -> Result<()>;
    fn exec(&self, container: &str, command: &[String], timeout: Option<Duration>) -> Result<Completion>;
    fn kill(&self, container: &str) -> Result<()>;
}

/// [`ContainerEngine`] backed by the `docker` executable.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
    build_timeout: Duration,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            build_timeout: Duration::from_secs(DEFAULT_INSTALL_TIMEOUT_SECS),
        }
    }

    /// Bound on each `docker build`, which installs the image's dependencies
    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    fn docker<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        cmd
    }

    fn output(&self, cmd: Command) -> Result<CommandOutput> {
        Ok(process::run(cmd)?)
    }

    fn checked(&self, cmd: Command, failure: &str) -> Result<CommandOutput> {
        let output = self.output(cmd)?;
        if !output.success() {
            return Err(ArcaError::build(failure, output.context()));
        }
        Ok(output)
    }
}

/// Tar archive holding the Dockerfile and the extra context files.
pub fn build_context(dockerfile: &str, files: &[ContextFile]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let entries = std::iter::once(("Dockerfile", dockerfile.as_bytes()))
        .chain(files.iter().map(|f| (f.name.as_str(), f.contents.as_slice())));

    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, name, data)?;
    }

    Ok(builder.into_inner()?)
}

impl ContainerEngine for DockerCli {
    fn ping(&self) -> Result<()> {
        let output = self
            .output(self.docker(["info", "--format", "{{.ServerVersion}}"]))
            .map_err(|_| docker_unreachable())?;
        if !output.success() {
            return Err(docker_unreachable());
        }
        debug!(version = %output.stdout_str(), "docker is reachable");
        Ok(())
    }

    fn image_exists(&self, image: &ImageRef) -> Result<bool> {
        let output = self.output(self.docker(["image", "inspect", &image.to_string()]))?;
        Ok(output.success())
    }

    fn pull(&self, image: &ImageRef) -> Result<bool> {
        info!(image = %image, "pulling image");
        let output = self.output(self.docker(["pull", &image.to_string()]))?;
        if !output.success() {
            debug!(image = %image, stderr = %output.stderr_str(), "image can't be pulled");
        }
        Ok(output.success())
    }

    fn tag(&self, source: &ImageRef, target: &ImageRef) -> Result<()> {
        let cmd = self.docker(["tag", &source.to_string(), &target.to_string()]);
        self.checked(cmd, "Unable to tag image")?;
        Ok(())
    }

    fn push(&self, image: &ImageRef) -> Result<()> {
        info!(image = %image, "pushing image");
        let output = self.output(self.docker(["push", &image.to_string()]))?;
        if !output.success() {
            return Err(ArcaError::PushToRegistry {
                message: format!("Pushing {} to the registry failed", image),
                full_output: format!("{}\n{}", output.stdout_str(), output.stderr_str()),
            });
        }
        Ok(())
    }

    fn build(&self, image: &ImageRef, dockerfile: &str, files: &[ContextFile]) -> Result<()> {
        info!(image = %image, "building image");
        let context = build_context(dockerfile, files)?;

        let cmd = self.docker(["build", "--tag", &image.to_string(), "-"]);
        let completion = process::run_with_input(cmd, context, Some(self.build_timeout)).map_err(|e| {
            ArcaError::build(
                format!("Building image {} failed: {}", image, e),
                BuildContext {
                    traceback: Some(dockerfile.to_string()),
                    ..BuildContext::default()
                },
            )
        })?;

        match completion {
            Completion::TimedOut => Err(ArcaError::timeout(
                format!("Building image {} timed out", image),
                self.build_timeout.as_secs(),
                BuildContext {
                    traceback: Some(dockerfile.to_string()),
                    ..BuildContext::default()
                },
            )),
            Completion::Finished(output) if !output.success() => {
                let mut context = output.context();
                context.traceback = Some(dockerfile.to_string());
                Err(ArcaError::build(
                    format!("Building image {} failed", image),
                    context,
                ))
            }
            Completion::Finished(_) => Ok(()),
        }
    }

    fn container_running(&self, name: &str) -> Result<bool> {
        let filter = format!("name=^/{}$", name);
        let output = self.checked(
            self.docker([
                "ps",
                "--filter",
                &filter,
                "--filter",
                "status=running",
                "--format",
                "{{.Names}}",
            ]),
            "Unable to list containers",
        )?;
        Ok(output.stdout_str().lines().any(|line| line.trim() == name))
    }

    fn run_detached(&self, image: &ImageRef, name: &str, workdir: &str) -> Result<()> {
        info!(image = %image, container = name, "starting container");
        let image = image.to_string();
        let cmd = self.docker([
            "run", "--detach", "--tty", "--rm", "--name", name, "--workdir", workdir, &image,
            "tail", "-f", "/dev/null",
        ]);
        self.checked(cmd, "Unable to start container")?;
        Ok(())
    }

    fn copy_into(&self, container: &str, source: &Path, destination: &str) -> Result<()> {
        let mut cmd = self.docker(["cp"]);
        cmd.arg(source).arg(format!("{}:{}", container, destination));
        self.checked(cmd, "Unable to copy files into container")?;
        Ok(())
    }

    fn exec(&self, container: &str, command: &[String], timeout: Option<Duration>) -> Result<Completion> {
        let mut cmd = self.docker(["exec", container]);
        cmd.args(command);
        Ok(process::run_with_timeout(cmd, timeout)?)
    }

    fn kill(&self, container: &str) -> Result<()> {
        debug!(container, "killing container");
        let output = self.output(self.docker(["kill", "--signal", "KILL", container]))?;
        if !output.success() && self.container_running(container)? {
            return Err(ArcaError::build(
                format!("Unable to kill container {}", container),
                output.context(),
            ));
        }
        Ok(())
    }
}

fn docker_unreachable() -> ArcaError {
    ArcaError::misconfigured(
        "Docker is not running or the current user doesn't have permissions to access docker.",
    )
}

/// Captured output of a finished command as a build failure context
pub fn completion_context(completion: &Completion) -> BuildContext {
    match completion {
        Completion::Finished(output) => output.context(),
        Completion::TimedOut => BuildContext::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_build_context_contains_dockerfile_and_files() {
        let files = vec![ContextFile {
            name: "requirements.txt".into(),
            contents: b"requests\n".to_vec(),
        }];
        let archive = build_context("FROM alpine\n", &files).unwrap();

        let mut tar = tar::Archive::new(archive.as_slice());
        let mut seen = Vec::new();
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            seen.push((path, contents));
        }
        assert_eq!(
            seen,
            vec![
                ("Dockerfile".to_string(), "FROM alpine\n".to_string()),
                ("requirements.txt".to_string(), "requests\n".to_string()),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_build_reports_unsent_context() {
        let files = vec![ContextFile {
            name: "blob".into(),
            contents: vec![0; 4 << 20],
        }];
        // exits without reading the context from stdin
        let err = DockerCli::new("false")
            .build(&ImageRef::new("arca", "x"), "FROM alpine\n", &files)
            .unwrap_err();
        match err {
            ArcaError::Build { message, context } => {
                assert!(message.contains("Broken pipe"), "{}", message);
                assert_eq!(context.traceback.as_deref(), Some("FROM alpine\n"));
            }
            other => panic!("expected a build error, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_build_is_bounded() {
        // `yes` never exits, standing in for a hanging build
        let err = DockerCli::new("yes")
            .with_build_timeout(Duration::from_millis(300))
            .build(&ImageRef::new("arca", "x"), "FROM alpine\n", &[])
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
