//! Core identities, constants, and error types.

pub mod constants;
pub mod error;
pub mod id;

pub use error::{
    DecodeError, EngineError, EnvelopeError, FilewayError, FragmentError, IdentityError,
    TransportError,
};
pub use id::{EnvelopeId, PeerId};
