//! Wire codecs turning messages into transport frames

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ConnectivityError, ConnectivityResult};
use crate::message::{correlation_tag_for, tag, total_tag_for, Envelope};

/// FIX field delimiter
pub const SOH: char = '\x01';

/// Encoder/decoder between a message type and text frames
pub trait MessageCodec<M>: Send + Sync {
    fn encode(&self, message: &M) -> ConnectivityResult<String>;

    /// Malformed frames fail with `ConnectivityError::Protocol`
    fn decode(&self, frame: &str) -> ConnectivityResult<M>;
}

/// JSON text frames (WebSocket, HTTP, in-process venues)
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<M> MessageCodec<M> for JsonCodec
where
    M: Serialize + DeserializeOwned,
{
    fn encode(&self, message: &M) -> ConnectivityResult<String> {
        Ok(serde_json::to_string(message)?)
    }

    fn decode(&self, frame: &str) -> ConnectivityResult<M> {
        Ok(serde_json::from_str(frame)?)
    }
}

/// FIX tag=value codec with body length and checksum handling
#[derive(Debug, Clone)]
pub struct FixCodec {
    begin_string: String,
}

impl Default for FixCodec {
    fn default() -> Self {
        Self::new("FIX.4.4")
    }
}

impl FixCodec {
    pub fn new(begin_string: impl Into<String>) -> Self {
        Self {
            begin_string: begin_string.into(),
        }
    }

    pub fn begin_string(&self) -> &str {
        &self.begin_string
    }

    /// Sum of all bytes modulo 256
    pub fn checksum(bytes: &[u8]) -> u32 {
        bytes.iter().map(|b| *b as u32).sum::<u32>() % 256
    }

    fn push_field(body: &mut String, tag: &str, value: &str) -> ConnectivityResult<()> {
        if value.contains(SOH) {
            return Err(ConnectivityError::Protocol(format!(
                "value of tag {} contains the field delimiter",
                tag
            )));
        }
        body.push_str(tag);
        body.push('=');
        body.push_str(value);
        body.push(SOH);
        Ok(())
    }
}

impl MessageCodec<Envelope> for FixCodec {
    fn encode(&self, message: &Envelope) -> ConnectivityResult<String> {
        let correlation_tag = message.correlation_tag();
        let total_tag = message.total_tag();

        let mut body = String::new();
        Self::push_field(&mut body, tag::MSG_TYPE, &message.msg_type)?;
        if let Some(id) = &message.correlation_id {
            Self::push_field(&mut body, correlation_tag, id)?;
        }
        if let Some(total) = message.total {
            Self::push_field(&mut body, total_tag, &total.to_string())?;
        }
        if let Some(text) = &message.text {
            Self::push_field(&mut body, tag::TEXT, text)?;
        }

        for (key, value) in &message.fields {
            if key.parse::<u32>().is_err() {
                return Err(ConnectivityError::Protocol(format!(
                    "field key {} is not a FIX tag",
                    key
                )));
            }
            let managed = match key.as_str() {
                tag::BEGIN_STRING | tag::BODY_LENGTH | tag::CHECKSUM | tag::MSG_TYPE => true,
                k if k == correlation_tag => message.correlation_id.is_some(),
                k if k == total_tag => message.total.is_some(),
                tag::TEXT => message.text.is_some(),
                _ => false,
            };
            if !managed {
                Self::push_field(&mut body, key, value)?;
            }
        }

        let mut frame = format!(
            "{}={}{}{}={}{}",
            tag::BEGIN_STRING,
            self.begin_string,
            SOH,
            tag::BODY_LENGTH,
            body.len(),
            SOH
        );
        frame.push_str(&body);
        let checksum = Self::checksum(frame.as_bytes());
        frame.push_str(&format!("{}={:03}{}", tag::CHECKSUM, checksum, SOH));
        Ok(frame)
    }

    fn decode(&self, frame: &str) -> ConnectivityResult<Envelope> {
        let protocol = |msg: String| ConnectivityError::Protocol(msg);

        if !frame.ends_with(SOH) {
            return Err(protocol("FIX frame is not terminated".into()));
        }
        let content = &frame[..frame.len() - 1];
        let trailer_start = content
            .rfind(&format!("{}{}=", SOH, tag::CHECKSUM))
            .map(|i| i + 1)
            .ok_or_else(|| protocol("FIX frame has no checksum".into()))?;

        let declared: u32 = content[trailer_start + 3..]
            .parse()
            .map_err(|_| protocol("FIX checksum is not numeric".into()))?;
        let computed = Self::checksum(content[..trailer_start].as_bytes());
        if declared != computed {
            return Err(protocol(format!(
                "FIX checksum mismatch: declared {:03}, computed {:03}",
                declared, computed
            )));
        }

        let header = &content[..trailer_start];
        let mut cursor = 0usize;
        let begin_string = take_field(header, &mut cursor, tag::BEGIN_STRING)?.to_string();
        let body_length: usize = take_field(header, &mut cursor, tag::BODY_LENGTH)?
            .parse()
            .map_err(|_| protocol("FIX body length is not numeric".into()))?;
        let body = &header[cursor..];
        if body.len() != body_length {
            return Err(protocol(format!(
                "FIX body length mismatch: declared {}, actual {}",
                body_length,
                body.len()
            )));
        }
        if begin_string != self.begin_string {
            tracing::debug!(
                expected = %self.begin_string,
                received = %begin_string,
                "FIX begin string differs from configured version"
            );
        }

        let mut pairs = Vec::new();
        for field in body.split(SOH).filter(|f| !f.is_empty()) {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| protocol(format!("malformed FIX field '{}'", field)))?;
            pairs.push((key, value));
        }

        let msg_type = pairs
            .iter()
            .find(|(key, _)| *key == tag::MSG_TYPE)
            .map(|(_, value)| value.to_string())
            .ok_or_else(|| protocol("FIX frame has no MsgType".into()))?;

        let correlation_tag = correlation_tag_for(&msg_type);
        let total_tag = total_tag_for(&msg_type);
        let mut envelope = Envelope::new(msg_type);

        for (key, value) in pairs {
            match key {
                tag::MSG_TYPE => {}
                k if k == correlation_tag => envelope.correlation_id = Some(value.to_string()),
                k if k == total_tag => {
                    let total = value
                        .parse()
                        .map_err(|_| protocol(format!("tag {} is not a count", k)))?;
                    envelope.total = Some(total);
                }
                tag::TEXT => envelope.text = Some(value.to_string()),
                _ => {
                    envelope.fields.insert(key.to_string(), value.to_string());
                }
            }
        }

        Ok(envelope)
    }
}

/// Read the next `tag=value` field, which must carry `expected`
fn take_field<'a>(header: &'a str, cursor: &mut usize, expected: &str) -> ConnectivityResult<&'a str> {
    let rest = &header[*cursor..];
    let end = rest.find(SOH).ok_or_else(|| {
        ConnectivityError::Protocol(format!("FIX frame missing tag {}", expected))
    })?;
    *cursor += end + 1;
    match rest[..end].split_once('=') {
        Some((t, value)) if t == expected => Ok(value),
        _ => Err(ConnectivityError::Protocol(format!(
            "FIX frame must start with tag {}",
            expected
        ))),
    }
}
