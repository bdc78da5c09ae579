use thiserror::Error;

/// The wire-visible error taxonomy from §7. Each variant that corresponds
/// to a numbered error code returns it from [`NetsyncError::code`]; the
/// number is what gets embedded as the first three ASCII digits of an
/// `Error` frame's message.
#[derive(Debug, Error)]
pub enum NetsyncError {
    #[error("{0} partial transfer")]
    PartialTransfer(&'static str),
    #[error("{0} no transfer occurred")]
    NoTransfer(&'static str),
    #[error("{0} not permitted: {1}")]
    NotPermitted(&'static str, String),
    #[error("{0} unknown key: {1}")]
    UnknownKey(&'static str, String),
    #[error("{0} mixing versions: local range does not overlap peer range")]
    MixingVersions(&'static str),
    #[error("{0} role mismatch")]
    RoleMismatch(&'static str),
    #[error("{0} bad command: {1}")]
    BadCommand(&'static str, String),
    #[error("{0} failed identification: {1}")]
    FailedIdentification(&'static str, String),

    #[error("unknown command code {0}")]
    BadCode(u8),
    #[error("frame version {0} outside negotiated range")]
    BadVersion(u8),
    #[error("payload length {0} exceeds cap {1}")]
    OversizedPayload(u64, u64),
    #[error("MAC chain verification failed")]
    BadMac,
    #[error("malformed frame encoding: {0}")]
    BadEncoding(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetsyncError {
    /// Numeric code from the §7 taxonomy, where applicable. Decode-level
    /// errors that have no dedicated code in the taxonomy (`BadCode`,
    /// `BadEncoding`, ...) share `bad_command`'s 521, since on the wire
    /// they all manifest as "the peer sent something we could not process
    /// in sequence".
    pub fn code(&self) -> u16 {
        match self {
            NetsyncError::PartialTransfer(_) => 211,
            NetsyncError::NoTransfer(_) => 212,
            NetsyncError::NotPermitted(..) => 412,
            NetsyncError::UnknownKey(..) => 422,
            NetsyncError::MixingVersions(_) => 432,
            NetsyncError::RoleMismatch(_) => 512,
            NetsyncError::BadCommand(..) => 521,
            NetsyncError::FailedIdentification(..) => 532,
            NetsyncError::BadCode(_)
            | NetsyncError::BadVersion(_)
            | NetsyncError::BadEncoding(_) => 521,
            NetsyncError::OversizedPayload(..) => 521,
            NetsyncError::BadMac => 532,
            NetsyncError::Store(_) | NetsyncError::Io(_) => 521,
        }
    }

    /// Render as the text an `Error` frame would carry: `"<code> <msg>"`.
    pub fn to_wire_message(&self) -> String {
        format!("{} {}", self.code(), self)
    }
}
