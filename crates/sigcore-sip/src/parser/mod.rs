pub mod stream;
pub mod uri;

pub use stream::{parse, Consumed, StreamParser};
pub use uri::parse_uri;
