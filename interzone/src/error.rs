//! The closed error-code set carried across zone boundaries
//!
//! Errors never cross a boundary as exceptions or rich types; they travel
//! as integers from this set. `0` is success and is represented by
//! `Ok(..)`, never by a variant.

use std::fmt;

/// Result alias used on every fallible runtime path.
pub type RpcResult<T> = Result<T, ErrorCode>;

/// Integer error codes shared by every zone.
#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ErrorCode {
    InvalidData = 1,
    InvalidVersion = 2,
    IncompatibleService = 3,
    ZoneNotInitialised = 4,
    ZoneNotFound = 5,
    ZoneNotSupported = 6,
    ObjectNotFound = 7,
    InvalidInterfaceId = 8,
    InvalidMethodId = 9,
    ReferenceCountError = 10,
    TransportError = 11,
    ServiceProxyLostConnection = 12,
    NeedMoreMemory = 13,
    CallCancelled = 14,
    UnableToCreateServiceProxy = 15,
    Exception = 16,
}

/// The wire value for success.
pub const OK: i32 = 0;

impl ErrorCode {
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Map a raw wire code back to a variant.
    ///
    /// Unknown nonzero codes collapse to `Exception`: a peer speaking a
    /// newer protocol may know codes we do not.
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(Self::InvalidData),
            2 => Some(Self::InvalidVersion),
            3 => Some(Self::IncompatibleService),
            4 => Some(Self::ZoneNotInitialised),
            5 => Some(Self::ZoneNotFound),
            6 => Some(Self::ZoneNotSupported),
            7 => Some(Self::ObjectNotFound),
            8 => Some(Self::InvalidInterfaceId),
            9 => Some(Self::InvalidMethodId),
            10 => Some(Self::ReferenceCountError),
            11 => Some(Self::TransportError),
            12 => Some(Self::ServiceProxyLostConnection),
            13 => Some(Self::NeedMoreMemory),
            14 => Some(Self::CallCancelled),
            15 => Some(Self::UnableToCreateServiceProxy),
            16 => Some(Self::Exception),
            _ => Some(Self::Exception),
        }
    }
}

/// Wire code of a result: `0` for success, the error code otherwise.
pub fn code_of<T>(result: &RpcResult<T>) -> i32 {
    match result {
        Ok(_) => OK,
        Err(err) => err.code(),
    }
}

/// Rebuild a unit result from a wire code.
pub fn result_from_code(code: i32) -> RpcResult<()> {
    match ErrorCode::from_code(code) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

impl std::error::Error for ErrorCode {}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::InvalidData => "the payload could not be decoded",
            Self::InvalidVersion => "the protocol version is outside the supported range",
            Self::IncompatibleService => "the peer service cannot interoperate at this version",
            Self::ZoneNotInitialised => "the zone has no running service",
            Self::ZoneNotFound => "no route to the destination zone",
            Self::ZoneNotSupported => "the operation is not supported on this channel",
            Self::ObjectNotFound => "the object id is not registered in the destination zone",
            Self::InvalidInterfaceId => "the object does not expose the requested interface",
            Self::InvalidMethodId => "the interface has no such method",
            Self::ReferenceCountError => "reference-count accounting has been corrupted",
            Self::TransportError => "the underlying transport failed",
            Self::ServiceProxyLostConnection => "the service proxy has lost its connection",
            Self::NeedMoreMemory => "the reply does not fit the supplied buffer",
            Self::CallCancelled => "the call was cancelled by connection teardown",
            Self::UnableToCreateServiceProxy => "a service proxy could not be created",
            Self::Exception => "the remote implementation failed",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 1..=16 {
            let err = ErrorCode::from_code(code).unwrap();
            assert_eq!(err.code(), code);
        }
        assert!(ErrorCode::from_code(0).is_none());
    }

    #[test]
    fn unknown_codes_collapse_to_exception() {
        assert_eq!(ErrorCode::from_code(9999), Some(ErrorCode::Exception));
        assert_eq!(ErrorCode::from_code(-1), Some(ErrorCode::Exception));
    }

    #[test]
    fn result_conversion() {
        assert_eq!(code_of(&Ok(())), OK);
        assert_eq!(code_of::<()>(&Err(ErrorCode::ObjectNotFound)), 7);
        assert_eq!(result_from_code(0), Ok(()));
        assert_eq!(result_from_code(11), Err(ErrorCode::TransportError));
    }
}
