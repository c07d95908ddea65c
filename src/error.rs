pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("no sketch registered for method `{0}`")]
    MissingSketch(String),

    #[error("invalid bytecode at offset {offset}: {msg}")]
    Bytecode { offset: usize, msg: String },

    #[error("device error on {device}: {msg}")]
    Device { device: String, msg: String },

    #[error("execution error: {0}")]
    Execution(String),

    #[error("internal compiler error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn precondition<S: Into<String>>(msg: S) -> Self {
        Error::Precondition(msg.into())
    }

    pub fn bytecode<S: Into<String>>(offset: usize, msg: S) -> Self {
        Error::Bytecode {
            offset,
            msg: msg.into(),
        }
    }

    pub fn device<D: Into<String>, S: Into<String>>(device: D, msg: S) -> Self {
        Error::Device {
            device: device.into(),
            msg: msg.into(),
        }
    }

    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Error::Execution(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }
}
