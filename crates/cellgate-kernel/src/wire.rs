//! Multipart framing and signing for kernel messages.
//!
//! A message on the wire is:
//!
//! ```text
//! identities..., "<IDS|MSG>", signature, header, parent_header, metadata, content, buffers...
//! ```
//!
//! The signature is the hex HMAC-SHA256 of the four JSON frames.

use std::fmt;

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::WireError;

type HmacSha256 = Hmac<Sha256>;

pub const DELIMITER: &[u8] = b"<IDS|MSG>";
pub const PROTOCOL_VERSION: &str = "5.3";

/// Signs and verifies message frames. An empty key disables signing.
#[derive(Clone)]
pub struct Signer {
    mac: Option<HmacSha256>,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("enabled", &self.mac.is_some())
            .finish()
    }
}

impl Signer {
    pub fn new(key: &str) -> Self {
        let mac = if key.is_empty() {
            None
        } else {
            HmacSha256::new_from_slice(key.as_bytes()).ok()
        };
        Self { mac }
    }

    pub fn is_enabled(&self) -> bool {
        self.mac.is_some()
    }

    pub fn sign(&self, parts: &[&[u8]]) -> String {
        match &self.mac {
            Some(mac) => {
                let mut mac = mac.clone();
                for part in parts {
                    mac.update(part);
                }
                hex::encode(mac.finalize().into_bytes())
            }
            None => String::new(),
        }
    }

    pub fn verify(&self, parts: &[&[u8]], signature: &[u8]) -> bool {
        let Some(mac) = &self.mac else {
            return true;
        };
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let mut mac = mac.clone();
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(&expected).is_ok()
    }
}

/// Identity of this client in message headers.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub username: String,
}

impl Session {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            username: username.into(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new("cellgate")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub msg_id: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub date: String,
    pub msg_type: String,
    #[serde(default)]
    pub version: String,
}

impl Header {
    pub fn new(msg_type: &str, session: &Session) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            session: session.id.clone(),
            username: session.username.clone(),
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            msg_type: msg_type.to_string(),
            version: PROTOCOL_VERSION.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JupyterMessage {
    pub identities: Vec<Bytes>,
    pub header: Header,
    pub parent_header: Value,
    pub metadata: Value,
    pub content: Value,
    pub buffers: Vec<Bytes>,
}

impl JupyterMessage {
    /// Build a fresh request with an empty parent.
    pub fn new(msg_type: &str, content: Value, session: &Session) -> Self {
        Self {
            identities: Vec::new(),
            header: Header::new(msg_type, session),
            parent_header: Value::Object(Default::default()),
            metadata: Value::Object(Default::default()),
            content,
            buffers: Vec::new(),
        }
    }

    /// Build a message answering `parent`, routed back to the same identities.
    pub fn reply_to(
        parent: &JupyterMessage,
        msg_type: &str,
        content: Value,
        session: &Session,
    ) -> Self {
        let parent_header = serde_json::to_value(&parent.header)
            .unwrap_or_else(|_| Value::Object(Default::default()));
        Self {
            identities: parent.identities.clone(),
            header: Header::new(msg_type, session),
            parent_header,
            metadata: Value::Object(Default::default()),
            content,
            buffers: Vec::new(),
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.get("msg_id").and_then(Value::as_str)
    }

    pub fn to_frames(&self, signer: &Signer) -> Result<Vec<Bytes>, WireError> {
        let header = encode("header", &self.header)?;
        let parent = encode("parent_header", &self.parent_header)?;
        let metadata = encode("metadata", &self.metadata)?;
        let content = encode("content", &self.content)?;
        let signature = signer.sign(&[
            header.as_slice(),
            parent.as_slice(),
            metadata.as_slice(),
            content.as_slice(),
        ]);

        let mut frames = Vec::with_capacity(self.identities.len() + 6 + self.buffers.len());
        frames.extend(self.identities.iter().cloned());
        frames.push(Bytes::from_static(DELIMITER));
        frames.push(Bytes::from(signature));
        frames.push(Bytes::from(header));
        frames.push(Bytes::from(parent));
        frames.push(Bytes::from(metadata));
        frames.push(Bytes::from(content));
        frames.extend(self.buffers.iter().cloned());
        Ok(frames)
    }

    pub fn from_frames(mut frames: Vec<Bytes>, signer: &Signer) -> Result<Self, WireError> {
        let split = frames
            .iter()
            .position(|f| f.as_ref() == DELIMITER)
            .ok_or(WireError::MissingDelimiter)?;
        let rest = frames.split_off(split + 1);
        frames.pop();
        let identities = frames;

        if rest.len() < 5 {
            return Err(WireError::TooFewFrames(rest.len()));
        }
        let mut rest = rest.into_iter();
        let signature = next_frame(&mut rest);
        let header = next_frame(&mut rest);
        let parent = next_frame(&mut rest);
        let metadata = next_frame(&mut rest);
        let content = next_frame(&mut rest);
        let buffers: Vec<Bytes> = rest.collect();

        let parts: [&[u8]; 4] = [&header, &parent, &metadata, &content];
        if !signer.verify(&parts, &signature) {
            return Err(WireError::BadSignature);
        }

        Ok(Self {
            identities,
            header: decode("header", &header)?,
            parent_header: decode("parent_header", &parent)?,
            metadata: decode("metadata", &metadata)?,
            content: decode("content", &content)?,
            buffers,
        })
    }
}

fn next_frame(iter: &mut impl Iterator<Item = Bytes>) -> Bytes {
    iter.next().unwrap_or_default()
}

fn encode<T: Serialize>(frame: &'static str, value: &T) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(value).map_err(|source| WireError::Json { frame, source })
}

fn decode<T: serde::de::DeserializeOwned>(frame: &'static str, raw: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(raw).map_err(|source| WireError::Json { frame, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signer_matches_known_hmac() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog"), split across parts.
        let signer = Signer::new("key");
        let parts: [&[u8]; 4] = [b"The quick brown ", b"fox jumps over ", b"the lazy dog", b""];
        let sig = signer.sign(&parts);
        assert_eq!(
            sig,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn empty_key_disables_signing() {
        let signer = Signer::new("");
        assert!(!signer.is_enabled());
        let parts: [&[u8]; 1] = [b"anything"];
        assert_eq!(signer.sign(&parts), "");
        assert!(signer.verify(&parts, b"whatever"));
    }

    #[test]
    fn frames_carry_identities_and_buffers() {
        let signer = Signer::new("secret");
        let session = Session::new("tester");
        let mut msg = JupyterMessage::new("execute_request", json!({ "code": "1+1" }), &session);
        msg.identities = vec![Bytes::from_static(b"client-a")];
        msg.buffers = vec![Bytes::from_static(b"\x00\x01")];

        let frames = msg.to_frames(&signer).unwrap();
        assert_eq!(frames[0].as_ref(), b"client-a");
        assert_eq!(frames[1].as_ref(), DELIMITER);
        assert_eq!(frames.len(), 8);

        let decoded = JupyterMessage::from_frames(frames, &signer).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.msg_type(), "execute_request");
        assert_eq!(decoded.header.version, PROTOCOL_VERSION);
    }

    #[test]
    fn tampered_content_is_rejected() {
        let signer = Signer::new("secret");
        let msg = JupyterMessage::new(
            "status",
            json!({ "execution_state": "idle" }),
            &Session::default(),
        );
        let mut frames = msg.to_frames(&signer).unwrap();
        let last = frames.len() - 1;
        frames[last] = Bytes::from_static(br#"{"execution_state":"busy"}"#);
        let err = JupyterMessage::from_frames(frames, &signer).unwrap_err();
        assert!(matches!(err, WireError::BadSignature));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let msg = JupyterMessage::new("status", json!({}), &Session::default());
        let frames = msg.to_frames(&Signer::new("one")).unwrap();
        let err = JupyterMessage::from_frames(frames, &Signer::new("two")).unwrap_err();
        assert!(matches!(err, WireError::BadSignature));
    }

    #[test]
    fn missing_delimiter_and_short_messages() {
        let signer = Signer::new("");
        let err = JupyterMessage::from_frames(vec![Bytes::from_static(b"{}")], &signer).unwrap_err();
        assert!(matches!(err, WireError::MissingDelimiter));

        let frames = vec![
            Bytes::from_static(DELIMITER),
            Bytes::new(),
            Bytes::from_static(b"{}"),
        ];
        let err = JupyterMessage::from_frames(frames, &signer).unwrap_err();
        assert!(matches!(err, WireError::TooFewFrames(2)));
    }

    #[test]
    fn reply_links_parent_header() {
        let session = Session::default();
        let mut request = JupyterMessage::new("kernel_info_request", json!({}), &session);
        request.identities = vec![Bytes::from_static(b"peer")];
        let reply = JupyterMessage::reply_to(&request, "kernel_info_reply", json!({}), &session);
        assert_eq!(reply.parent_msg_id(), Some(request.msg_id()));
        assert_eq!(reply.identities, request.identities);
    }

    #[test]
    fn decodes_kernel_header_without_optional_fields() {
        let signer = Signer::new("");
        let frames = vec![
            Bytes::from_static(DELIMITER),
            Bytes::new(),
            Bytes::from_static(br#"{"msg_id":"m1","msg_type":"stream"}"#),
            Bytes::from_static(br#"{"msg_id":"p1"}"#),
            Bytes::from_static(b"{}"),
            Bytes::from_static(br#"{"name":"stdout","text":"hi"}"#),
        ];
        let msg = JupyterMessage::from_frames(frames, &signer).unwrap();
        assert_eq!(msg.msg_id(), "m1");
        assert_eq!(msg.parent_msg_id(), Some("p1"));
        assert!(msg.identities.is_empty());
    }
}
