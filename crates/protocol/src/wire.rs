use crate::codec::Codec;
use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::BufRead;

/// Codec-encoded payload of a client action, kept opaque until the
/// action's factory decodes it into a concrete type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionData {
    codec: Codec,
    bytes: Vec<u8>,
}

impl ActionData {
    pub fn empty(codec: Codec) -> Self {
        Self {
            codec,
            bytes: Vec::new(),
        }
    }

    pub fn from_bytes(codec: Codec, bytes: Vec<u8>) -> Self {
        Self { codec, bytes }
    }

    pub fn encode<T: Serialize + ?Sized>(codec: Codec, value: &T) -> Result<Self> {
        Ok(Self::from_bytes(codec, codec.to_vec(value)?))
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        self.codec.from_slice(&self.bytes)
    }
}

/// `{Name, Data}` as sent by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionCall {
    pub name: String,
    pub data: ActionData,
}

/// One decoded client request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentRequest {
    pub cookie: String,
    pub action: ActionCall,
    /// Optional editor properties (environment, active view), still encoded.
    pub props: Option<ActionData>,
}

#[derive(Deserialize)]
struct WireAction<V> {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Data", default = "none")]
    data: Option<V>,
}

impl<V> Default for WireAction<V> {
    fn default() -> Self {
        Self {
            name: String::new(),
            data: None,
        }
    }
}

fn none<V>() -> Option<V> {
    None
}

#[derive(Deserialize)]
#[serde(bound = "V: Deserialize<'de>")]
struct WireRequest<V> {
    #[serde(rename = "Cookie", default)]
    cookie: String,
    #[serde(rename = "Action", default)]
    action: WireAction<V>,
    #[serde(rename = "Props", default = "none")]
    props: Option<V>,
}

impl AgentRequest {
    /// Reads the next request, or `None` at a clean end of stream.
    pub fn decode<R: BufRead + ?Sized>(codec: Codec, r: &mut R) -> Result<Option<Self>> {
        match codec {
            Codec::Json => Self::decode_as::<R, serde_json::Value>(codec, r),
            Codec::Cbor => Self::decode_as::<R, ciborium::Value>(codec, r),
            Codec::Msgpack => Self::decode_as::<R, rmpv::Value>(codec, r),
        }
    }

    fn decode_as<R, V>(codec: Codec, r: &mut R) -> Result<Option<Self>>
    where
        R: BufRead + ?Sized,
        V: DeserializeOwned + Serialize,
    {
        let Some(wire) = codec.decode::<R, WireRequest<V>>(r)? else {
            return Ok(None);
        };
        let reencode = |v: Option<V>| -> Result<Option<ActionData>> {
            v.map(|v| ActionData::encode(codec, &v)).transpose()
        };
        Ok(Some(Self {
            cookie: wire.cookie,
            action: ActionCall {
                name: wire.action.name,
                data: reencode(wire.action.data)?.unwrap_or_else(|| ActionData::empty(codec)),
            },
            props: reencode(wire.props)?,
        }))
    }
}

/// `{Cookie, Error, State}` written after every reduction.
#[derive(Debug, Serialize)]
pub struct AgentResponse<'a, S: Serialize> {
    #[serde(rename = "Cookie")]
    pub cookie: &'a str,
    #[serde(rename = "Error")]
    pub error: &'a str,
    #[serde(rename = "State")]
    pub state: &'a S,
}

impl<S: Serialize> AgentResponse<'_, S> {
    pub fn encode<W: std::io::Write + ?Sized>(&self, codec: Codec, w: &mut W) -> Result<()> {
        codec.encode(w, self)?;
        w.flush()?;
        Ok(())
    }
}

/// Client-side view of a request, used by editors and tests.
#[derive(Debug, Clone, Serialize)]
pub struct ClientRequest<'a, D: Serialize, P: Serialize = ()> {
    #[serde(rename = "Cookie")]
    pub cookie: &'a str,
    #[serde(rename = "Action")]
    pub action: ClientAction<'a, D>,
    #[serde(rename = "Props", skip_serializing_if = "Option::is_none")]
    pub props: Option<P>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientAction<'a, D: Serialize> {
    #[serde(rename = "Name")]
    pub name: &'a str,
    #[serde(rename = "Data", skip_serializing_if = "Option::is_none")]
    pub data: Option<D>,
}
