//! SSH wire encoding (RFC 4251 §5) for the payloads revssh exchanges.
//!
//! - [`ForwardRequest`] is byte-compatible with the `direct-tcpip` /
//!   `forwarded-tcpip` channel-open extra data of RFC 4254 §7.
//! - [`RegistrationPayload`] is the body of a `reverse-client` request.
//! - [`RequestEnvelope`] wraps an out-of-band request type and its payload
//!   so it can travel as the command of an `exec` request.

use crate::error::{RevsshError, RevsshResult};

// ── Primitive codec ─────────────────────────────────────────────────

/// Appends SSH wire primitives to a buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
        self
    }

    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    /// Comma-separated name-list. Names must not contain commas.
    pub fn put_name_list(&mut self, names: &[String]) -> &mut Self {
        self.put_string(&names.join(","))
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads SSH wire primitives from a byte slice.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn u32(&mut self) -> RevsshResult<u32> {
        let end = self.pos + 4;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| RevsshError::Codec("truncated uint32".into()))?;
        self.pos = end;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn bytes(&mut self) -> RevsshResult<&'a [u8]> {
        let len = self.u32()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| RevsshError::Codec("length overflow".into()))?;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| RevsshError::Codec(format!("truncated string of {len} bytes")))?;
        self.pos = end;
        Ok(bytes)
    }

    pub fn string(&mut self) -> RevsshResult<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| RevsshError::Codec("string is not valid UTF-8".into()))
    }

    pub fn name_list(&mut self) -> RevsshResult<Vec<String>> {
        let joined = self.string()?;
        if joined.is_empty() {
            return Ok(Vec::new());
        }
        Ok(joined.split(',').map(str::to_string).collect())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fail if any bytes are left unread.
    pub fn expect_end(&self) -> RevsshResult<()> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(RevsshError::Codec(format!(
                "{} trailing bytes",
                self.remaining()
            )))
        }
    }
}

// ── ForwardRequest ──────────────────────────────────────────────────

/// Destination and originator of a port-forward stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub destination_host: String,
    pub destination_port: u32,
    pub originator_host: String,
    pub originator_port: u32,
}

impl ForwardRequest {
    pub fn new(
        destination_host: impl Into<String>,
        destination_port: u32,
        originator_host: impl Into<String>,
        originator_port: u32,
    ) -> Self {
        Self {
            destination_host: destination_host.into(),
            destination_port,
            originator_host: originator_host.into(),
            originator_port,
        }
    }

    /// RFC 4254 §7.2 channel-open extra data: `string host, uint32 port,
    /// string originator, uint32 originator port`. russh parses and builds
    /// this itself for `direct-tcpip` and `forwarded-tcpip`; the codec pins
    /// the layout and serves transports that carry forwards outside an SSH
    /// channel open.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_string(&self.destination_host)
            .put_u32(self.destination_port)
            .put_string(&self.originator_host)
            .put_u32(self.originator_port);
        w.finish()
    }

    pub fn decode(data: &[u8]) -> RevsshResult<Self> {
        let mut r = WireReader::new(data);
        let request = Self {
            destination_host: r.string()?,
            destination_port: r.u32()?,
            originator_host: r.string()?,
            originator_port: r.u32()?,
        };
        r.expect_end()?;
        Ok(request)
    }

    /// Destination port as a TCP port number.
    pub fn port(&self) -> RevsshResult<u16> {
        u16::try_from(self.destination_port).map_err(|_| {
            RevsshError::InvalidPayload(format!(
                "destination port {} out of range",
                self.destination_port
            ))
        })
    }

    /// `host:port` of the destination.
    pub fn destination(&self) -> String {
        format!("{}:{}", self.destination_host, self.destination_port)
    }
}

// ── RegistrationPayload ─────────────────────────────────────────────

/// Body of a `reverse-client` registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationPayload {
    pub protocol_version: String,
    pub hostname: String,
    pub username: String,
    /// SSH wire encodings of the accepted public keys, hex encoded.
    pub public_keys_hex: Vec<String>,
}

impl RegistrationPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_string(&self.protocol_version)
            .put_string(&self.hostname)
            .put_string(&self.username)
            .put_name_list(&self.public_keys_hex);
        w.finish()
    }

    pub fn decode(data: &[u8]) -> RevsshResult<Self> {
        let mut r = WireReader::new(data);
        let payload = Self {
            protocol_version: r.string()?,
            hostname: r.string()?,
            username: r.string()?,
            public_keys_hex: r.name_list()?,
        };
        r.expect_end()?;
        if payload.hostname.is_empty() {
            return Err(RevsshError::InvalidPayload("empty hostname".into()));
        }
        Ok(payload)
    }
}

// ── RequestEnvelope ─────────────────────────────────────────────────

/// An out-of-band request type and its payload, carried as `exec` data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub request_type: String,
    pub payload: Vec<u8>,
}

impl RequestEnvelope {
    pub fn new(request_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            request_type: request_type.into(),
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_string(&self.request_type).put_bytes(&self.payload);
        w.finish()
    }

    /// Decode an envelope. Returns `None` for data that is not one, such as
    /// an ordinary shell command line.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut r = WireReader::new(data);
        let request_type = r.string().ok()?;
        let payload = r.bytes().ok()?.to_vec();
        r.expect_end().ok()?;
        if request_type.is_empty() || !request_type.is_ascii() {
            return None;
        }
        Some(Self {
            request_type,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_request_matches_rfc4254_layout() {
        let req = ForwardRequest::new("box2", 4000, "10.0.0.9", 51000);
        let encoded = req.encode();
        let mut expected = Vec::new();
        expected.extend_from_slice(&4u32.to_be_bytes());
        expected.extend_from_slice(b"box2");
        expected.extend_from_slice(&4000u32.to_be_bytes());
        expected.extend_from_slice(&8u32.to_be_bytes());
        expected.extend_from_slice(b"10.0.0.9");
        expected.extend_from_slice(&51000u32.to_be_bytes());
        assert_eq!(encoded, expected);
        assert_eq!(ForwardRequest::decode(&encoded).unwrap(), req);
    }

    #[test]
    fn forward_request_rejects_truncation() {
        let encoded = ForwardRequest::new("box2", 22, "", 0).encode();
        assert!(ForwardRequest::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn forward_request_port_range() {
        assert_eq!(ForwardRequest::new("h", 22, "", 0).port().unwrap(), 22);
        assert!(ForwardRequest::new("h", 70000, "", 0).port().is_err());
        assert_eq!(ForwardRequest::new("box1", 22, "", 0).destination(), "box1:22");
    }

    #[test]
    fn registration_payload_with_keys() {
        let payload = RegistrationPayload {
            protocol_version: "SSH-2.0-revssh-0.1.0".into(),
            hostname: "box1".into(),
            username: "alice".into(),
            public_keys_hex: vec!["00aa".into(), "00bb".into()],
        };
        let decoded = RegistrationPayload::decode(&payload.encode()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn registration_payload_without_keys() {
        let payload = RegistrationPayload {
            protocol_version: "v".into(),
            hostname: "box1".into(),
            username: "alice".into(),
            public_keys_hex: Vec::new(),
        };
        let decoded = RegistrationPayload::decode(&payload.encode()).unwrap();
        assert!(decoded.public_keys_hex.is_empty());
    }

    #[test]
    fn registration_payload_malformed() {
        assert!(RegistrationPayload::decode(b"garbage").is_err());
        let mut w = WireWriter::new();
        w.put_string("v").put_string("").put_string("alice").put_string("");
        assert!(RegistrationPayload::decode(&w.finish()).is_err());
    }

    #[test]
    fn envelope_ignores_shell_commands() {
        assert!(RequestEnvelope::decode(b"ls -la").is_none());
        assert!(RequestEnvelope::decode(b"").is_none());

        let env = RequestEnvelope::new("reverse-client", b"body".to_vec());
        assert_eq!(RequestEnvelope::decode(&env.encode()), Some(env));
    }
}
