use std::fmt::{Debug, Formatter};
use anyhow::bail;
use sha2::{Digest, Sha256};
use crate::message::SequenceNumber;

pub const MAX_COOKIE_LEN: usize = 64;
pub const MAX_SHARED_SECRET_LEN: usize = 64;
pub const AUTHENTICATOR_LEN: usize = 32;

const DOMAIN_TAG: &[u8] = b"rudp-p2p-syn-v1";

/// Peer-to-peer handshake material. The cookie is sent in the clear as part of the SYN, the
///  shared secret never leaves the process: it is mixed into an authenticator that the peer
///  can only reproduce if it was configured with the same secret.
#[derive(Clone)]
pub struct P2pData {
    cookie: Vec<u8>,
    shared_secret: Vec<u8>,
}

impl Debug for P2pData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "P2P{{cookie:{} bytes,secret:***}}", self.cookie.len())
    }
}

impl P2pData {
    pub fn new(cookie: &[u8], shared_secret: &[u8]) -> anyhow::Result<P2pData> {
        if cookie.is_empty() || cookie.len() > MAX_COOKIE_LEN {
            bail!("P2P cookie must have between 1 and {} bytes, was {}", MAX_COOKIE_LEN, cookie.len());
        }
        if shared_secret.is_empty() || shared_secret.len() > MAX_SHARED_SECRET_LEN {
            bail!("P2P shared secret must have between 1 and {} bytes, was {}", MAX_SHARED_SECRET_LEN, shared_secret.len());
        }

        Ok(P2pData {
            cookie: cookie.to_vec(),
            shared_secret: shared_secret.to_vec(),
        })
    }

    pub fn cookie(&self) -> &[u8] {
        &self.cookie
    }

    /// The authenticator is bound to the SYN's sequence number so a captured SYN can not be
    ///  reused for a different handshake attempt.
    pub fn authenticator(&self, syn_sequence_number: SequenceNumber) -> [u8; AUTHENTICATOR_LEN] {
        Self::digest(&self.shared_secret, &self.cookie, syn_sequence_number)
    }

    /// Checks a peer's SYN material against this side's configuration: the cookie must match,
    ///  and the authenticator must have been created with the same shared secret.
    pub fn verify(&self, cookie: &[u8], syn_sequence_number: SequenceNumber, authenticator: &[u8; AUTHENTICATOR_LEN]) -> bool {
        if cookie != self.cookie.as_slice() {
            return false;
        }

        let expected = Self::digest(&self.shared_secret, cookie, syn_sequence_number);
        expected.iter()
            .zip(authenticator.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
    }

    fn digest(secret: &[u8], cookie: &[u8], syn_sequence_number: SequenceNumber) -> [u8; AUTHENTICATOR_LEN] {
        let mut sha256 = Sha256::default();
        sha256.update(DOMAIN_TAG);
        sha256.update((secret.len() as u16).to_be_bytes());
        sha256.update(secret);
        sha256.update((cookie.len() as u16).to_be_bytes());
        sha256.update(cookie);
        sha256.update(syn_sequence_number.to_raw().to_be_bytes());
        sha256.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty_cookie(b"", b"secret", false)]
    #[case::empty_secret(b"cookie", b"", false)]
    #[case::regular(b"cookie", b"secret", true)]
    #[case::max_cookie(&[1u8; MAX_COOKIE_LEN], b"secret", true)]
    #[case::long_cookie(&[1u8; MAX_COOKIE_LEN + 1], b"secret", false)]
    #[case::max_secret(b"cookie", &[1u8; MAX_SHARED_SECRET_LEN], true)]
    #[case::long_secret(b"cookie", &[1u8; MAX_SHARED_SECRET_LEN + 1], false)]
    fn test_new(#[case] cookie: &[u8], #[case] secret: &[u8], #[case] expected_ok: bool) {
        assert_eq!(P2pData::new(cookie, secret).is_ok(), expected_ok);
    }

    #[test]
    fn test_verify_matching() {
        let a = P2pData::new(b"cookie", b"secret").unwrap();
        let b = P2pData::new(b"cookie", b"secret").unwrap();

        let seq = SequenceNumber::from_raw(17);
        assert!(b.verify(a.cookie(), seq, &a.authenticator(seq)));
        assert!(a.verify(b.cookie(), seq, &b.authenticator(seq)));
    }

    #[rstest]
    #[case::different_secret(b"cookie", b"other secret", 17)]
    #[case::different_cookie(b"other cookie", b"secret", 17)]
    #[case::different_seq(b"cookie", b"secret", 18)]
    fn test_verify_mismatch(#[case] cookie: &[u8], #[case] secret: &[u8], #[case] seq: u16) {
        let local = P2pData::new(b"cookie", b"secret").unwrap();
        let remote = P2pData::new(cookie, secret).unwrap();

        let auth = remote.authenticator(SequenceNumber::from_raw(seq));
        assert!(!local.verify(remote.cookie(), SequenceNumber::from_raw(17), &auth));
    }

    #[test]
    fn test_debug_hides_secret() {
        let data = P2pData::new(b"cookie", b"very-secret").unwrap();
        assert!(!format!("{:?}", data).contains("very-secret"));
    }
}
