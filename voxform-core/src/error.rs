use thiserror::Error;

/// All errors produced by voxform-core.
#[derive(Debug, Error)]
pub enum VoxformError {
    #[error("session open failed: {0}")]
    Connect(String),

    #[error("session configuration rejected: {0}")]
    Configure(String),

    #[error("inbound event stream failed: {0}")]
    Stream(String),

    #[error("tool `{tool}` failed: {reason}")]
    ToolDispatch { tool: String, reason: String },

    #[error("outbound audio stream failed: {0}")]
    AudioStream(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("session is closed")]
    SessionClosed,

    #[error("orchestrator is already running")]
    AlreadyRunning,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoxformError {
    /// Short name of the stage that produced the error, for status reporting.
    pub fn stage(&self) -> &'static str {
        match self {
            VoxformError::Connect(_) => "connect",
            VoxformError::Configure(_) => "configure",
            VoxformError::Stream(_) | VoxformError::SessionClosed => "stream",
            VoxformError::ToolDispatch { .. } => "tool",
            VoxformError::AudioStream(_)
            | VoxformError::AudioDevice(_)
            | VoxformError::NoDefaultInputDevice => "audio",
            VoxformError::AlreadyRunning => "lifecycle",
            VoxformError::Serialization(_) | VoxformError::Io(_) | VoxformError::Other(_) => {
                "internal"
            }
        }
    }

    /// `true` for errors after which the run cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoxformError::Connect(_) | VoxformError::Configure(_) | VoxformError::SessionClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, VoxformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_distinguishes_connect_from_configure() {
        assert_eq!(VoxformError::Connect("refused".into()).stage(), "connect");
        assert_eq!(VoxformError::Configure("bad voice".into()).stage(), "configure");
        assert!(VoxformError::Connect("refused".into()).is_fatal());
        assert!(!VoxformError::ToolDispatch {
            tool: "Save_ModelData".into(),
            reason: "bad args".into()
        }
        .is_fatal());
    }

    #[test]
    fn tool_error_message_names_the_tool() {
        let err = VoxformError::ToolDispatch {
            tool: "Save_ModelData".into(),
            reason: "missing field".into(),
        };
        assert_eq!(err.to_string(), "tool `Save_ModelData` failed: missing field");
    }
}
