//! Error types for the sensor manager.
//!
//! Every public manager operation clears the manager's last-error slot on
//! entry; failure paths record a [`ManagerError`] there and broadcast its
//! [`ErrorCode`] on the manager signal stream. Clients that talk to the
//! remote surface poll the slot through `error_code()` / `error_string()`,
//! so the code values are part of the wire contract and must stay stable.

use thiserror::Error;

/// Stable error codes carried in the last-error slot and the error signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    None = 0,
    /// Transport unavailable.
    NotConnected = 1,
    /// Transport refused the object path.
    CanNotRegisterObject = 2,
    /// Transport refused the service name.
    CanNotRegisterService = 3,
    /// Identifier has no registry slot.
    IdNotRegistered = 4,
    /// Registered type tag has no factory (plugin load gap).
    FactoryNotRegistered = 5,
    /// A controlling session already exists for the sensor.
    AlreadyUnderControl = 6,
    /// Release against an absent instance or a bogus session.
    NotInstantiated = 7,
    /// The adaptor's `start_adaptor` reported failure.
    AdaptorNotStarted = 8,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Failure of a sensor manager operation.
///
/// Variants map 1:1 onto [`ErrorCode`]; the payload is the human-readable
/// message stored in the last-error slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    #[error("{0}")]
    NotConnected(String),
    #[error("{0}")]
    CanNotRegisterObject(String),
    #[error("{0}")]
    CanNotRegisterService(String),
    #[error("{0}")]
    IdNotRegistered(String),
    #[error("{0}")]
    FactoryNotRegistered(String),
    #[error("requested sensor already under control")]
    AlreadyUnderControl,
    #[error("{0}")]
    NotInstantiated(String),
    #[error("{0}")]
    AdaptorNotStarted(String),
}

impl ManagerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ManagerError::NotConnected(_) => ErrorCode::NotConnected,
            ManagerError::CanNotRegisterObject(_) => ErrorCode::CanNotRegisterObject,
            ManagerError::CanNotRegisterService(_) => ErrorCode::CanNotRegisterService,
            ManagerError::IdNotRegistered(_) => ErrorCode::IdNotRegistered,
            ManagerError::FactoryNotRegistered(_) => ErrorCode::FactoryNotRegistered,
            ManagerError::AlreadyUnderControl => ErrorCode::AlreadyUnderControl,
            ManagerError::NotInstantiated(_) => ErrorCode::NotInstantiated,
            ManagerError::AdaptorNotStarted(_) => ErrorCode::AdaptorNotStarted,
        }
    }
}
