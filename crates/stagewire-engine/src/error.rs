use thiserror::Error;

/// Non-RT failure kinds surfaced to callers and the UI.
///
/// RT-path failures never construct these; they silence outputs, set flags
/// and post a notification instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bridge worker timed out")]
    TransportTimeout,
    #[error("bridge worker crashed")]
    TransportCrash,
    #[error("bridge protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("out of resources: {0}")]
    ResourceExhaustion(String),
    #[error("{0}")]
    CapabilityMismatch(String),
    #[error("failed to load project state: {0}")]
    StateRejection(String),
    #[error("{0}")]
    UserError(String),
    #[error("unknown plugin id {0}")]
    UnknownPlugin(u32),
}
