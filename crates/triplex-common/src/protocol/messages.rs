//! Payload record codecs.
//!
//! Each record encodes to a fixed byte layout. Decoding validates the
//! exact length; a wrong-sized payload is a protocol error handled at the
//! decode site (logged and dropped, never surfaced to clients).

use crate::constants::{MAX_LENGTH_SIGNATURE, PARAM_SIZE};
use crate::protocol::error::{Result, TriplexError};
use crate::protocol::{ReplicaId, ServiceType};

fn check_len(what: &'static str, raw: &[u8], expected: usize) -> Result<()> {
    if raw.len() != expected {
        return Err(TriplexError::Malformed(format!(
            "{what} payload of {} bytes, expected {expected}",
            raw.len()
        )));
    }
    Ok(())
}

/// Client → broker: invoke `service` on `parameter`.
///
/// Layout: `[service: u32 host][parameter: i32 host]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestModule {
    pub service: ServiceType,
    pub parameter: i32,
}

impl RequestModule {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        raw[0..4].copy_from_slice(&self.service.to_ne_bytes());
        raw[4..8].copy_from_slice(&self.parameter.to_ne_bytes());
        raw
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        check_len("request", raw, Self::SIZE)?;
        Ok(RequestModule {
            service: u32::from_ne_bytes(raw[0..4].try_into().unwrap()),
            parameter: i32::from_ne_bytes(raw[4..8].try_into().unwrap()),
        })
    }
}

/// Replica → broker: join the cohort for `service`.
///
/// Layout: `[signature: 32 bytes, zero padded][service: u32 host]`. The
/// signature is an opaque per-replica identity used only to deduplicate
/// simultaneous registrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationModule {
    signature: [u8; MAX_LENGTH_SIGNATURE],
    pub service: ServiceType,
}

impl RegistrationModule {
    pub const SIZE: usize = MAX_LENGTH_SIGNATURE + 4;

    pub fn new(signature: &str, service: ServiceType) -> Result<Self> {
        let bytes = signature.as_bytes();
        if bytes.len() > MAX_LENGTH_SIGNATURE {
            return Err(TriplexError::SignatureTooLong(MAX_LENGTH_SIGNATURE));
        }
        let mut buf = [0u8; MAX_LENGTH_SIGNATURE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(RegistrationModule {
            signature: buf,
            service,
        })
    }

    /// The signature with trailing padding stripped.
    pub fn signature(&self) -> &[u8] {
        let end = self
            .signature
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        &self.signature[..end]
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        raw[..MAX_LENGTH_SIGNATURE].copy_from_slice(&self.signature);
        raw[MAX_LENGTH_SIGNATURE..].copy_from_slice(&self.service.to_ne_bytes());
        raw
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        check_len("registration", raw, Self::SIZE)?;
        let mut signature = [0u8; MAX_LENGTH_SIGNATURE];
        signature.copy_from_slice(&raw[..MAX_LENGTH_SIGNATURE]);
        Ok(RegistrationModule {
            signature,
            service: u32::from_ne_bytes(raw[MAX_LENGTH_SIGNATURE..].try_into().unwrap()),
        })
    }
}

/// Broker → replica: a dispatched request or a heartbeat.
///
/// Layout: `[heartbeat: u8][seq_id: u32 network][parameters: PARAM_SIZE bytes]`.
/// The parameter value sits host-order in the head of the buffer; the rest
/// is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceModule {
    pub heartbeat: bool,
    pub seq_id: u32,
    pub parameters: [u8; PARAM_SIZE],
}

impl ServiceModule {
    pub const SIZE: usize = 1 + 4 + PARAM_SIZE;

    /// A dispatched service request carrying `parameter`.
    pub fn request(seq_id: u32, parameter: i32) -> Self {
        let mut parameters = [0u8; PARAM_SIZE];
        parameters[..4].copy_from_slice(&parameter.to_ne_bytes());
        ServiceModule {
            heartbeat: false,
            seq_id,
            parameters,
        }
    }

    /// A heartbeat probe with sequence number `seq_id`.
    pub fn heartbeat(seq_id: u32) -> Self {
        ServiceModule {
            heartbeat: true,
            seq_id,
            parameters: [0u8; PARAM_SIZE],
        }
    }

    /// The parameter value packed in the head of the buffer.
    pub fn parameter(&self) -> i32 {
        i32::from_ne_bytes(self.parameters[..4].try_into().unwrap())
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        raw[0] = self.heartbeat as u8;
        raw[1..5].copy_from_slice(&self.seq_id.to_be_bytes());
        raw[5..].copy_from_slice(&self.parameters);
        raw
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        check_len("service", raw, Self::SIZE)?;
        let mut parameters = [0u8; PARAM_SIZE];
        parameters.copy_from_slice(&raw[5..]);
        Ok(ServiceModule {
            heartbeat: raw[0] != 0,
            seq_id: u32::from_be_bytes(raw[1..5].try_into().unwrap()),
            parameters,
        })
    }
}

/// Replica → broker: a service result, a pong, or a duplicate notice.
///
/// Layout: `[id: u8][heartbeat: u8][duplicated: u8][service: u32 network][result: i32 network]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerReply {
    pub id: ReplicaId,
    pub heartbeat: bool,
    pub duplicated: bool,
    pub service: ServiceType,
    pub result: i32,
}

impl ServerReply {
    pub const SIZE: usize = 3 + 4 + 4;

    /// A heartbeat pong from replica `id`.
    pub fn pong(id: ReplicaId, service: ServiceType) -> Self {
        ServerReply {
            id,
            heartbeat: true,
            duplicated: false,
            service,
            result: 0,
        }
    }

    /// A computed service result.
    pub fn result(id: ReplicaId, service: ServiceType, result: i32) -> Self {
        ServerReply {
            id,
            heartbeat: false,
            duplicated: false,
            service,
            result,
        }
    }

    /// Acknowledges a duplicate delivery without invoking the service body.
    pub fn duplicate(id: ReplicaId, service: ServiceType) -> Self {
        ServerReply {
            id,
            heartbeat: false,
            duplicated: true,
            service,
            result: 0,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        raw[0] = self.id;
        raw[1] = self.heartbeat as u8;
        raw[2] = self.duplicated as u8;
        raw[3..7].copy_from_slice(&self.service.to_be_bytes());
        raw[7..11].copy_from_slice(&self.result.to_be_bytes());
        raw
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        check_len("server reply", raw, Self::SIZE)?;
        Ok(ServerReply {
            id: raw[0],
            heartbeat: raw[1] != 0,
            duplicated: raw[2] != 0,
            service: u32::from_be_bytes(raw[3..7].try_into().unwrap()),
            result: i32::from_be_bytes(raw[7..11].try_into().unwrap()),
        })
    }
}

/// Whether the broker could serve a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceStatus {
    NotAvailable = 0,
    Available = 1,
}

/// Broker → client: the consolidated outcome of a request.
///
/// Layout: `[service_status: u8][result: i32 host]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseModule {
    pub service_status: ServiceStatus,
    pub result: i32,
}

impl ResponseModule {
    pub const SIZE: usize = 1 + 4;

    pub fn available(result: i32) -> Self {
        ResponseModule {
            service_status: ServiceStatus::Available,
            result,
        }
    }

    pub fn not_available() -> Self {
        ResponseModule {
            service_status: ServiceStatus::NotAvailable,
            result: 0,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        raw[0] = self.service_status as u8;
        raw[1..].copy_from_slice(&self.result.to_ne_bytes());
        raw
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        check_len("response", raw, Self::SIZE)?;
        let service_status = match raw[0] {
            0 => ServiceStatus::NotAvailable,
            1 => ServiceStatus::Available,
            other => {
                return Err(TriplexError::Malformed(format!(
                    "unknown service status {other}"
                )))
            }
        };
        Ok(ResponseModule {
            service_status,
            result: i32::from_ne_bytes(raw[1..].try_into().unwrap()),
        })
    }
}

/// Encode the u16 dispatch port granted by a registration reply.
pub fn encode_port(port: u16) -> [u8; 2] {
    port.to_ne_bytes()
}

/// Decode a registration reply into the granted dispatch port.
pub fn decode_port(raw: &[u8]) -> Result<u16> {
    check_len("port reply", raw, 2)?;
    Ok(u16::from_ne_bytes(raw.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let m = RequestModule {
            service: 7,
            parameter: -5,
        };
        assert_eq!(RequestModule::decode(&m.encode()).unwrap(), m);
    }

    #[test]
    fn registration_round_trip() {
        let m = RegistrationModule::new("replica-a", 3).unwrap();
        let back = RegistrationModule::decode(&m.encode()).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.signature(), b"replica-a");
        assert_eq!(back.service, 3);
    }

    #[test]
    fn registration_signature_bound() {
        let long = "s".repeat(MAX_LENGTH_SIGNATURE + 1);
        assert!(RegistrationModule::new(&long, 0).is_err());
        let exact = "s".repeat(MAX_LENGTH_SIGNATURE);
        assert!(RegistrationModule::new(&exact, 0).is_ok());
    }

    #[test]
    fn service_module_round_trip_preserves_seq() {
        let m = ServiceModule::request(0xAABB_CCDD, 41);
        let back = ServiceModule::decode(&m.encode()).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.seq_id, 0xAABB_CCDD);
        assert_eq!(back.parameter(), 41);
        assert!(!back.heartbeat);
    }

    #[test]
    fn service_module_seq_is_network_order_on_the_wire() {
        let m = ServiceModule::heartbeat(0x0102_0304);
        let raw = m.encode();
        assert_eq!(&raw[1..5], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(raw[0], 1);
    }

    #[test]
    fn server_reply_round_trip() {
        let m = ServerReply::result(2, 7, -42);
        let back = ServerReply::decode(&m.encode()).unwrap();
        assert_eq!(back, m);
        assert!(!back.heartbeat);
        assert!(!back.duplicated);
    }

    #[test]
    fn server_reply_network_order_fields() {
        let m = ServerReply::result(0, 0x0102_0304, 0x0506_0708);
        let raw = m.encode();
        assert_eq!(&raw[3..7], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&raw[7..11], &[0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn pong_and_duplicate_flags() {
        let pong = ServerReply::pong(1, 9);
        assert!(pong.heartbeat);
        assert!(!pong.duplicated);
        let dup = ServerReply::duplicate(1, 9);
        assert!(!dup.heartbeat);
        assert!(dup.duplicated);
    }

    #[test]
    fn response_round_trip() {
        let ok = ResponseModule::available(42);
        assert_eq!(ResponseModule::decode(&ok.encode()).unwrap(), ok);
        let gone = ResponseModule::not_available();
        let back = ResponseModule::decode(&gone.encode()).unwrap();
        assert_eq!(back.service_status, ServiceStatus::NotAvailable);
        assert_eq!(back.result, 0);
    }

    #[test]
    fn response_rejects_unknown_status() {
        let mut raw = ResponseModule::available(1).encode();
        raw[0] = 9;
        assert!(ResponseModule::decode(&raw).is_err());
    }

    #[test]
    fn port_reply_round_trip() {
        assert_eq!(decode_port(&encode_port(5561)).unwrap(), 5561);
        assert!(decode_port(&[1, 2, 3]).is_err());
    }

    #[test]
    fn truncated_payloads_are_malformed() {
        assert!(RequestModule::decode(&[0; 7]).is_err());
        assert!(ServiceModule::decode(&[0; ServiceModule::SIZE - 1]).is_err());
        assert!(ServerReply::decode(&[0; ServerReply::SIZE + 1]).is_err());
        assert!(RegistrationModule::decode(&[0; 8]).is_err());
    }
}
