//! The 3-frame envelope `[identity | empty | data]`.
//!
//! The identity frame is the router-assigned source address: one zero byte
//! followed by the peer id. Broker-originated heartbeats carry a fabricated
//! non-routable identity instead (byte 0 = 0, remainder `'a'`), so replies
//! to them never collide with a real client address.

use crate::constants::{DATA_FRAME, EMPTY_FRAME, ENVELOPE, ID_FRAME, LENGTH_ID_FRAME};
use crate::protocol::error::{Result, TriplexError};

/// One multi-frame message: a vector of opaque frames.
pub type Multipart = Vec<Vec<u8>>;

/// Build a router identity frame for peer `id`.
pub fn identity_frame(id: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(LENGTH_ID_FRAME);
    frame.push(0);
    frame.extend_from_slice(&id.to_ne_bytes());
    frame
}

/// Extract the 32-bit client id at offset 1 of an identity frame.
pub fn client_id(identity: &[u8]) -> Result<u32> {
    if identity.len() < LENGTH_ID_FRAME {
        return Err(TriplexError::Malformed(format!(
            "identity frame of {} bytes, expected {}",
            identity.len(),
            LENGTH_ID_FRAME
        )));
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&identity[1..5]);
    Ok(u32::from_ne_bytes(raw))
}

/// The fixed non-routable identity stamped on broker heartbeats.
pub fn ping_identity() -> Vec<u8> {
    let mut frame = vec![b'a'; LENGTH_ID_FRAME];
    frame[0] = 0;
    frame
}

/// Assemble an `[identity | empty | data]` envelope.
pub fn envelope(identity: Vec<u8>, data: Vec<u8>) -> Multipart {
    vec![identity, Vec::new(), data]
}

/// Check the frame count and empty delimiter of an inbound envelope.
pub fn check(frames: &Multipart) -> Result<()> {
    if frames.len() != ENVELOPE {
        return Err(TriplexError::Malformed(format!(
            "{} frames, expected {}",
            frames.len(),
            ENVELOPE
        )));
    }
    if !frames[EMPTY_FRAME].is_empty() {
        return Err(TriplexError::Malformed(
            "missing empty delimiter frame".into(),
        ));
    }
    Ok(())
}

/// Split an inbound envelope into its routing frames and its payload.
///
/// The routing frames are everything up to and including the empty
/// delimiter; a reply must carry them back unchanged so the broker can
/// route it to the originator.
pub fn split(mut frames: Multipart) -> Result<(Multipart, Vec<u8>)> {
    check(&frames)?;
    let data = frames.remove(DATA_FRAME);
    Ok((frames, data))
}

/// Reassemble a reply from preserved routing frames and a new payload.
pub fn join(mut routing: Multipart, data: Vec<u8>) -> Multipart {
    routing.push(data);
    routing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trip() {
        let frame = identity_frame(0xDEAD_BEEF);
        assert_eq!(frame.len(), LENGTH_ID_FRAME);
        assert_eq!(frame[0], 0);
        assert_eq!(client_id(&frame).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn short_identity_is_malformed() {
        assert!(client_id(&[0, 1, 2]).is_err());
    }

    #[test]
    fn ping_identity_layout() {
        let frame = ping_identity();
        assert_eq!(frame.len(), LENGTH_ID_FRAME);
        assert_eq!(frame[0], 0);
        assert!(frame[1..].iter().all(|&b| b == b'a'));
    }

    #[test]
    fn envelope_split_and_join() {
        let frames = envelope(identity_frame(7), b"payload".to_vec());
        assert_eq!(frames.len(), ENVELOPE);
        assert!(frames[EMPTY_FRAME].is_empty());

        let (routing, data) = split(frames).unwrap();
        assert_eq!(data, b"payload");
        assert_eq!(routing.len(), 2);
        assert_eq!(client_id(&routing[ID_FRAME]).unwrap(), 7);

        let reply = join(routing, b"result".to_vec());
        assert_eq!(reply[DATA_FRAME], b"result");
    }

    #[test]
    fn wrong_frame_count_is_malformed() {
        assert!(split(vec![b"only".to_vec()]).is_err());
        assert!(check(&vec![vec![], vec![], vec![], vec![]]).is_err());
    }

    #[test]
    fn nonempty_delimiter_is_malformed() {
        let frames = vec![identity_frame(1), b"x".to_vec(), b"data".to_vec()];
        assert!(check(&frames).is_err());
    }
}
