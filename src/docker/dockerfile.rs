use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    From(String),
    Workdir(String),
    Add(String, String),
    Run(String),
    Env(String, String),
    Cmd(Vec<String>),
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::From(image) => write!(f, "FROM {}", image),
            Instruction::Workdir(dir) => write!(f, "WORKDIR {}", dir),
            Instruction::Add(src, dst) => write!(f, "ADD {} {}", src, dst),
            Instruction::Run(cmd) => write!(f, "RUN {}", cmd),
            Instruction::Env(key, value) => write!(f, "ENV {}={}", key, value),
            Instruction::Cmd(args) => {
                let quoted: Vec<String> = args
                    .iter()
                    .map(|a| serde_json::Value::String(a.clone()).to_string())
                    .collect();
                write!(f, "CMD [{}]", quoted.join(", "))
            }
        }
    }
}

/// A Dockerfile assembled instruction by instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dockerfile {
    instructions: Vec<Instruction>,
}

impl Dockerfile {
    pub fn from_image(image: impl Into<String>) -> Self {
        Self {
            instructions: vec![Instruction::From(image.into())],
        }
    }

    pub fn push(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn run(self, cmd: impl Into<String>) -> Self {
        self.push(Instruction::Run(cmd.into()))
    }

    pub fn add(self, src: impl Into<String>, dst: impl Into<String>) -> Self {
        self.push(Instruction::Add(src.into(), dst.into()))
    }

    /// Keeps containers alive until they are killed
    pub fn idle_cmd(self) -> Self {
        self.push(Instruction::Cmd(vec![
            "tail".into(),
            "-f".into(),
            "/dev/null".into(),
        ]))
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for instruction in &self.instructions {
            out.push_str(&instruction.to_string());
            out.push('\n');
        }
        out
    }
}
