//! Failure taxonomy shared by the engine manager, the parser and the request processors.

/// Raw model text kept on a parse failure is cut to this many characters.
const RAW_EXCERPT_CHARS: usize = 200;

/// Why a model could not be brought to `Ready`.
///
/// `Clone` because one initialization outcome is handed to every caller
/// that waited on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The accelerator ran out of memory while loading weights.
    #[error(
        "not enough GPU memory to load {model}; close other GPU-heavy apps or pick a smaller model ({detail})"
    )]
    InsufficientMemory { model: String, detail: String },

    /// No usable accelerator on this device.
    #[error("GPU acceleration is not available on this device ({detail})")]
    AcceleratorUnavailable { detail: String },

    /// Anything the classifier does not recognise, message passed through.
    #[error("{0}")]
    Runtime(String),

    /// An operation needed a loaded engine and none was there.
    #[error("engine is not ready")]
    NotReady,
}

const MEMORY_PATTERNS: &[&str] = &[
    "out of memory",
    "out_of_memory",
    "device memory",
    "requires more system memory",
    "insufficient memory",
    "failed to allocate",
];

const ACCELERATOR_PATTERNS: &[&str] = &[
    "no gpu",
    "gpu not available",
    "gpu unavailable",
    "no compatible gpu",
    "gpu adapter",
    "webgpu",
    "device lost",
    "cuda driver",
];

impl EngineError {
    /// Rewrite a raw runtime error into a user-actionable one.
    pub fn classify(model: &str, err: &anyhow::Error) -> Self {
        let detail = format!("{err:#}");
        let lower = detail.to_lowercase();

        if MEMORY_PATTERNS.iter().any(|p| lower.contains(p)) {
            return Self::InsufficientMemory {
                model: model.to_string(),
                detail,
            };
        }
        if ACCELERATOR_PATTERNS.iter().any(|p| lower.contains(p)) {
            return Self::AcceleratorUnavailable { detail };
        }
        Self::Runtime(detail)
    }
}

/// Why model text could not be turned into groups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("no JSON found in model response")]
    NoJson,

    #[error("no valid groups in model response")]
    NoValidGroups,

    /// JSON was found but did not fit any accepted shape.
    #[error("invalid model response: {reason}")]
    Invalid { reason: String, raw: String },
}

impl ParseError {
    pub fn invalid(reason: impl Into<String>, raw: &str) -> Self {
        Self::Invalid {
            reason: reason.into(),
            raw: raw.chars().take(RAW_EXCERPT_CHARS).collect(),
        }
    }
}

/// Failure surfaced by a request processor to the router.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to initialize AI")]
    Init(#[source] EngineError),

    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("inference failed: {0}")]
    Inference(String),
}
