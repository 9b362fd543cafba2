//! Registration error taxonomy.
//!
//! All errors here are synchronous registration failures. Consistency
//! violations detected on the trap path (broken return-address chain,
//! moved stack at substitute return, nesting deeper than one level) are
//! not errors. They panic, because the control-flow invariants of the
//! surrounding system have already been broken.

use axerrno::AxError;

/// Errors returned by the probe registration API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeError {
    /// The target instruction cannot be relocated or simulated, or the
    /// address lies inside the fault/exception handling path itself.
    InvalidTarget,
    /// The address violates the encoding's alignment requirement.
    Misaligned,
    /// No free instruction slot for an out-of-line copy.
    OutOfSlots,
    /// A probe is already registered at this address.
    AlreadyRegistered,
    /// No probe is registered for this handle.
    NotRegistered,
}

impl core::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            ProbeError::InvalidTarget => "instruction or address cannot be probed",
            ProbeError::Misaligned => "probe address is misaligned",
            ProbeError::OutOfSlots => "no free instruction slot",
            ProbeError::AlreadyRegistered => "probe already registered at this address",
            ProbeError::NotRegistered => "no probe registered for this handle",
        };
        f.write_str(msg)
    }
}

impl From<ProbeError> for AxError {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::InvalidTarget => AxError::InvalidInput,
            ProbeError::Misaligned => AxError::InvalidInput,
            ProbeError::OutOfSlots => AxError::NoMemory,
            ProbeError::AlreadyRegistered => AxError::AlreadyExists,
            ProbeError::NotRegistered => AxError::NotFound,
        }
    }
}

/// Result alias for the registration API.
pub type Result<T> = core::result::Result<T, ProbeError>;
