//! Error types for tomoflow.

use thiserror::Error;

/// Result type alias using tomoflow's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tomoflow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A task failed to set up, or the graph could not be mapped onto the
    /// available resources. Fatal before any node thread starts.
    #[error("setup failed{}: {message}", node_suffix(.node))]
    Setup {
        /// Node that failed (empty if not attributable).
        node: String,
        /// Description of the failure.
        message: String,
    },

    /// A task rejected the shapes of its inputs.
    #[error("shape negotiation failed{}: {message}", node_suffix(.node))]
    ShapeNegotiation {
        /// Node that failed (empty if not attributable).
        node: String,
        /// Description of the mismatch.
        message: String,
    },

    /// Moving data between host and device memory failed.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The task graph is malformed.
    #[error("invalid graph: {0}")]
    GraphStructure(String),

    /// A task's compute, generate or finalize step failed.
    #[error("task failed{}: {message}", node_suffix(.node))]
    Compute {
        /// Node that failed (empty if not attributable).
        node: String,
        /// Description of the failure.
        message: String,
    },

    /// Buffer storage could not be allocated.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// The run was aborted, or nobody is left to consume a node's output.
    ///
    /// Node threads use this internally to unwind; it is never reported as
    /// the error of a run.
    #[error("run aborted")]
    Aborted,

    /// A node thread panicked.
    #[error("thread for node '{0}' panicked")]
    ThreadPanicked(String),

    /// I/O error (thread spawning).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn node_suffix(node: &str) -> String {
    if node.is_empty() {
        String::new()
    } else {
        format!(" in node '{}'", node)
    }
}

impl Error {
    /// Setup error not yet attributed to a node.
    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup {
            node: String::new(),
            message: message.into(),
        }
    }

    /// Shape negotiation error not yet attributed to a node.
    pub fn shape(message: impl Into<String>) -> Self {
        Self::ShapeNegotiation {
            node: String::new(),
            message: message.into(),
        }
    }

    /// Compute error not yet attributed to a node.
    pub fn compute(message: impl Into<String>) -> Self {
        Self::Compute {
            node: String::new(),
            message: message.into(),
        }
    }

    /// Attach a node name to node-scoped errors that don't carry one yet.
    pub fn in_node(self, name: &str) -> Self {
        match self {
            Self::Setup { node, message } if node.is_empty() => Self::Setup {
                node: name.to_string(),
                message,
            },
            Self::ShapeNegotiation { node, message } if node.is_empty() => {
                Self::ShapeNegotiation {
                    node: name.to_string(),
                    message,
                }
            }
            Self::Compute { node, message } if node.is_empty() => Self::Compute {
                node: name.to_string(),
                message,
            },
            other => other,
        }
    }

    /// Turn any error raised during `setup` into a [`Error::Setup`].
    pub(crate) fn into_setup(self, name: &str) -> Self {
        match self {
            Self::Setup { .. } => self.in_node(name),
            other => Self::Setup {
                node: name.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Turn any error raised during negotiation into a
    /// [`Error::ShapeNegotiation`].
    pub(crate) fn into_shape(self, name: &str) -> Self {
        match self {
            Self::ShapeNegotiation { .. } => self.in_node(name),
            Self::Aborted => Self::Aborted,
            other => Self::ShapeNegotiation {
                node: name.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Name of the node this error is attributed to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Setup { node, .. }
            | Self::ShapeNegotiation { node, .. }
            | Self::Compute { node, .. }
                if !node.is_empty() =>
            {
                Some(node.as_str())
            }
            Self::ThreadPanicked(node) => Some(node.as_str()),
            _ => None,
        }
    }

    /// Whether this is the internal abort signal.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
