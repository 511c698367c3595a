pub mod dockerfile;
pub mod engine;
pub mod image;

pub use dockerfile::{Dockerfile, Instruction};
pub use engine::{ContainerEngine, ContextFile, DockerCli};
pub use image::{BaseImage, ImageRef, ImageSpec};
