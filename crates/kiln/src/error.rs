use crate::lifecycle::Phase;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The recipe (or a profile, or the command line) is structurally invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unresolved dependency '{name}' (constraint '{constraint}')")]
    UnresolvedDependency { name: String, constraint: String },

    #[error(
        "ambiguous dependency '{name}' (constraint '{constraint}'): candidates {}",
        .candidates.join(", ")
    )]
    AmbiguousDependency {
        name: String,
        constraint: String,
        candidates: Vec<String>,
    },

    #[error("toolchain generation failed: {0}")]
    ToolchainGeneration(String),

    /// The external build system exited unsuccessfully. `output` holds the
    /// captured tail of its output, verbatim.
    #[error("external build step failed ({})", exit_label(.exit_code))]
    BuildFailed {
        exit_code: Option<i32>,
        output: Vec<String>,
    },

    #[error("package error: {0}")]
    Package(String),

    #[error("cancelled")]
    Cancelled,

    #[error("phase '{phase}' failed: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    Message(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "terminated by signal".into(),
    }
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Message(msg.into())
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::Configuration(msg.into())
    }

    /// Tag an error with the lifecycle phase that produced it. An error that
    /// already carries a phase keeps its original tag.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            Self::Phase { .. } => self,
            other => Self::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// The underlying error with any phase tag removed.
    pub fn cause(&self) -> &Error {
        match self {
            Self::Phase { source, .. } => source.cause(),
            other => other,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.cause() {
            Self::Configuration(_) => "ConfigurationError",
            Self::UnresolvedDependency { .. } => "UnresolvedDependency",
            Self::AmbiguousDependency { .. } => "AmbiguousDependency",
            Self::ToolchainGeneration(_) => "ToolchainGenerationError",
            Self::BuildFailed { .. } => "BuildFailed",
            Self::Package(_) => "PackageError",
            Self::Cancelled => "Cancelled",
            Self::Phase { .. } | Self::Message(_) => "Error",
        }
    }

    /// Captured external-tool output, if the failure carries any.
    pub fn captured_output(&self) -> &[String] {
        match self.cause() {
            Self::BuildFailed { output, .. } => output,
            _ => &[],
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_tag_is_applied_once() {
        let err = Error::Package("missing bin/".into())
            .in_phase(Phase::Package)
            .in_phase(Phase::Build);
        assert_eq!(err.phase(), Some(Phase::Package));
        assert_eq!(err.kind(), "PackageError");
        assert_eq!(
            err.to_string(),
            "phase 'package' failed: package error: missing bin/"
        );
    }

    #[test]
    fn build_failure_keeps_output_verbatim() {
        let err = Error::BuildFailed {
            exit_code: Some(2),
            output: vec!["main.cc:1: error: boom".into()],
        }
        .in_phase(Phase::Build);
        assert_eq!(err.kind(), "BuildFailed");
        assert_eq!(err.captured_output(), ["main.cc:1: error: boom"]);
        assert!(err.to_string().contains("exit code 2"));
    }

    #[test]
    fn ambiguous_lists_candidates() {
        let err = Error::AmbiguousDependency {
            name: "zlib".into(),
            constraint: "=1.3.0".into(),
            candidates: vec!["zlib/1.3.0#aaa".into(), "zlib/1.3.0#bbb".into()],
        };
        assert!(err.to_string().ends_with("zlib/1.3.0#aaa, zlib/1.3.0#bbb"));
    }
}
