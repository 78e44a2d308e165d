use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use sigcore_sip::SipMessage;

use crate::error::Result;
use crate::event::Protocol;

/// Static key for the non-standard `xor` interop-testing cipher. Not a
/// real security mechanism — toggled only when a message's `xor`
/// property is set, to interoperate with peers that expect it.
const XOR_KEY: &[u8] = b"sigcore-xor-test-key";

fn xor_cipher(data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= XOR_KEY[i % XOR_KEY.len()];
    }
}

/// Serializes `message`, applying the `xor` property toggle if present.
pub fn encode_message(message: &SipMessage) -> Bytes {
    let mut bytes = message.commit();
    if message.properties.get("xor").map(String::as_str) == Some("1") {
        xor_cipher(&mut bytes);
    }
    Bytes::from(bytes)
}

/// Decodes a raw on-wire buffer, undoing the `xor` cipher when the caller
/// knows this peer negotiated it (callers track this per-session, since an
/// inbound message can't self-report the toggle before it is decoded).
pub fn decode_with_xor(mut data: Vec<u8>, xor: bool) -> Vec<u8> {
    if xor {
        xor_cipher(&mut data);
    }
    data
}

/// Common surface implemented by each protocol's transport: send, close,
/// report the local bind address and protocol kind.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_addr(&self) -> Result<SocketAddr>;
    fn protocol(&self) -> Protocol;
    async fn send(&self, message: &SipMessage, destination: SocketAddr) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn is_closed(&self) -> bool;
}
