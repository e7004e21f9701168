//! Message handling for the subset of the SSH agent protocol the harness
//! serves: listing identities and signing with them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ed25519_dalek::{Signer, SigningKey};

use crate::key_pair::{
    DEFAULT_KEY_COMMENT, ED25519_ALGORITHM, KeyPair, KeyPairError, public_key_blob,
    put_ssh_string,
};

/// Generic failure reply.
pub const SSH_AGENT_FAILURE: u8 = 5;
/// Client request for the list of identities.
pub const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
/// Reply carrying the list of identities.
pub const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
/// Client request to sign data with an identity.
pub const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
/// Reply carrying a signature.
pub const SSH_AGENT_SIGN_RESPONSE: u8 = 14;

/// Largest request body the agent accepts before closing the connection.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024;

struct Identity {
    signing_key: SigningKey,
    blob: Bytes,
}

/// Identities served by one agent.
pub(crate) struct Keyring {
    identities: Vec<Identity>,
}

impl Keyring {
    /// Decodes every private key up front so a bad key fails agent startup
    /// rather than a later signing request.
    pub(crate) fn from_key_pairs(key_pairs: &[KeyPair]) -> Result<Self, KeyPairError> {
        let identities = key_pairs
            .iter()
            .map(|pair| {
                let signing_key = pair.signing_key()?;
                let blob = public_key_blob(&signing_key.verifying_key());
                Ok(Identity { signing_key, blob })
            })
            .collect::<Result<Vec<_>, KeyPairError>>()?;
        Ok(Self { identities })
    }

    pub(crate) fn len(&self) -> usize {
        self.identities.len()
    }

    /// Produces the reply body for one request body.
    pub(crate) fn handle(&self, request: &[u8]) -> Bytes {
        let reply = match request.split_first() {
            Some((&SSH_AGENTC_REQUEST_IDENTITIES, _)) => Some(self.identities_answer()),
            Some((&SSH_AGENTC_SIGN_REQUEST, body)) => self.sign(body),
            _ => None,
        };
        reply.unwrap_or_else(failure)
    }

    fn identities_answer(&self) -> Bytes {
        let mut reply = BytesMut::new();
        reply.put_u8(SSH_AGENT_IDENTITIES_ANSWER);
        reply.put_u32(u32::try_from(self.identities.len()).unwrap_or(u32::MAX));
        for identity in &self.identities {
            put_ssh_string(&mut reply, &identity.blob);
            put_ssh_string(&mut reply, DEFAULT_KEY_COMMENT.as_bytes());
        }
        reply.freeze()
    }

    fn sign(&self, mut body: &[u8]) -> Option<Bytes> {
        let key_blob = take_ssh_string(&mut body)?;
        let data = take_ssh_string(&mut body)?;
        // Flags only select RSA hash variants and are ignored for Ed25519.
        let identity = self
            .identities
            .iter()
            .find(|identity| identity.blob.as_ref() == key_blob)?;

        let signature = identity.signing_key.sign(data);
        let mut signature_blob = BytesMut::new();
        put_ssh_string(&mut signature_blob, ED25519_ALGORITHM.as_bytes());
        put_ssh_string(&mut signature_blob, &signature.to_bytes());

        let mut reply = BytesMut::new();
        reply.put_u8(SSH_AGENT_SIGN_RESPONSE);
        put_ssh_string(&mut reply, &signature_blob);
        Some(reply.freeze())
    }
}

fn failure() -> Bytes {
    Bytes::from_static(&[SSH_AGENT_FAILURE])
}

/// Reads a length-prefixed SSH `string`, advancing `buf` past it.
pub(crate) fn take_ssh_string<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = usize::try_from(buf.get_u32()).ok()?;
    let (value, rest) = buf.split_at_checked(len)?;
    *buf = rest;
    Some(value)
}

/// Prefixes `body` with its length.
pub(crate) fn frame(body: &[u8]) -> Bytes {
    let mut framed = BytesMut::with_capacity(body.len() + 4);
    put_ssh_string(&mut framed, body);
    framed.freeze()
}
