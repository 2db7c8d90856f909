//! Request validation for the authority.
//!
//! Turns a decoded wire request into a typed [`Command`]. Everything that
//! can be checked without touching a session is checked here, so a request
//! that passes validation can only fail on session state.
//!
//! - Missing request body: Malformed
//! - Blank or overlong name: Validation
//! - Blank or non-alphanumeric session id: Validation
//! - Blank transport address: Validation

use rally_state::{PeerAddress, SessionCode, validate_name};
use rally_wire::authority_request::Request;

use crate::AuthorityError;

/// A validated authority request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Create { name: String, is_public: bool },
    Join { code: SessionCode, name: String },
    UpdateTransportAddress { address: PeerAddress },
    Start,
    Leave,
    Increment,
    GetState,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create { .. } => "createSession",
            Self::Join { .. } => "joinSession",
            Self::UpdateTransportAddress { .. } => "updateTransportAddress",
            Self::Start => "startSession",
            Self::Leave => "leaveSession",
            Self::Increment => "incrementCounter",
            Self::GetState => "getSessionState",
        }
    }
}

/// Validate a request body.
pub fn validate_request(
    request: Option<Request>,
    max_name_len: usize,
) -> Result<Command, AuthorityError> {
    let request = request.ok_or_else(|| AuthorityError::Malformed("empty request".into()))?;
    let command = match request {
        Request::CreateSession(r) => Command::Create {
            name: validate_name(&r.name, max_name_len)?,
            is_public: r.is_public,
        },
        Request::JoinSession(r) => {
            // Name first: a join with neither field reports the name.
            let name = validate_name(&r.name, max_name_len)?;
            Command::Join {
                code: SessionCode::parse(&r.session_id)?,
                name,
            }
        }
        Request::UpdateTransportAddress(r) => Command::UpdateTransportAddress {
            address: PeerAddress::new(r.address)?,
        },
        Request::StartSession(_) => Command::Start,
        Request::LeaveSession(_) => Command::Leave,
        Request::IncrementCounter(_) => Command::Increment,
        Request::GetSessionState(_) => Command::GetState,
    };
    Ok(command)
}
