pub mod message;
pub mod method;
pub mod status;
pub mod uri;

pub use message::{Headers, SipMessage, StartLine};
pub use method::Method;
pub use status::StatusCode;
pub use uri::SipUri;
