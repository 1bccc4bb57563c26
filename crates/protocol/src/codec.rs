use crate::error::{CodecError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, BufRead, Write};
use std::str::FromStr;

/// A wire format for agent messages.
///
/// The codec is chosen once when an agent starts and every message of that
/// agent's lifetime uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Pretty-printed JSON, two-space indent, newline after each message.
    #[default]
    Json,
    Cbor,
    Msgpack,
}

impl Codec {
    pub const ALL: [Codec; 3] = [Codec::Json, Codec::Cbor, Codec::Msgpack];

    /// Resolves a codec name. The empty name selects the default.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim() {
            "" => Ok(Self::default()),
            "json" => Ok(Self::Json),
            "cbor" => Ok(Self::Cbor),
            "msgpack" => Ok(Self::Msgpack),
            other => Err(CodecError::UnknownCodec(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Cbor => "cbor",
            Self::Msgpack => "msgpack",
        }
    }

    /// Writes one message. JSON output is indented and newline-terminated.
    pub fn encode<W, T>(self, w: &mut W, value: &T) -> Result<()>
    where
        W: Write + ?Sized,
        T: Serialize + ?Sized,
    {
        match self {
            Self::Json => {
                serde_json::to_writer_pretty(&mut *w, value)?;
                w.write_all(b"\n")?;
            }
            Self::Cbor => ciborium::ser::into_writer(value, &mut *w)?,
            Self::Msgpack => rmp_serde::encode::write_named(&mut *w, value)?,
        }
        Ok(())
    }

    /// Encodes `value` into a compact standalone buffer.
    pub fn to_vec<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Json => Ok(serde_json::to_vec(value)?),
            Self::Cbor => {
                let mut buf = Vec::new();
                ciborium::ser::into_writer(value, &mut buf)?;
                Ok(buf)
            }
            Self::Msgpack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    pub fn from_slice<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Json => Ok(serde_json::from_slice(bytes)?),
            Self::Cbor => Ok(ciborium::de::from_reader(bytes)?),
            Self::Msgpack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }

    /// Reads the next message from a stream.
    ///
    /// Returns `Ok(None)` on a clean end of stream, i.e. when no byte of a
    /// new message has been read. A stream ending mid-message is an error.
    pub fn decode<R, T>(self, r: &mut R) -> Result<Option<T>>
    where
        R: BufRead + ?Sized,
        T: DeserializeOwned,
    {
        if at_eof(r, self == Self::Json)? {
            return Ok(None);
        }
        let value = match self {
            Self::Json => {
                let mut de = serde_json::Deserializer::from_reader(&mut *r);
                T::deserialize(&mut de)?
            }
            Self::Cbor => ciborium::de::from_reader(&mut *r)?,
            Self::Msgpack => rmp_serde::from_read(&mut *r)?,
        };
        Ok(Some(value))
    }
}

fn at_eof<R: BufRead + ?Sized>(r: &mut R, skip_whitespace: bool) -> io::Result<bool> {
    loop {
        let buf = r.fill_buf()?;
        if buf.is_empty() {
            return Ok(true);
        }
        if !skip_whitespace {
            return Ok(false);
        }
        let n = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
        if n == 0 {
            return Ok(false);
        }
        r.consume(n);
    }
}

impl FromStr for Codec {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::io::Cursor;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Msg {
        #[serde(rename = "Cookie")]
        cookie: String,
        #[serde(rename = "Items")]
        items: Vec<String>,
        #[serde(rename = "Meta")]
        meta: BTreeMap<String, u32>,
    }

    fn sample(n: u32) -> Msg {
        Msg {
            cookie: format!("c{n}"),
            items: vec!["a".into(), "…".into()],
            meta: BTreeMap::from([("n".to_string(), n)]),
        }
    }

    #[test]
    fn empty_name_selects_json() {
        assert_eq!(Codec::from_name("").unwrap(), Codec::Json);
        assert_eq!("msgpack".parse::<Codec>().unwrap(), Codec::Msgpack);
        assert!(matches!(
            Codec::from_name("yaml"),
            Err(CodecError::UnknownCodec(name)) if name == "yaml"
        ));
    }

    #[test]
    fn json_is_indented_with_trailing_newline() {
        let mut out = Vec::new();
        Codec::Json
            .encode(&mut out, &BTreeMap::from([("Cookie", "x")]))
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "{\n  \"Cookie\": \"x\"\n}\n");
    }

    #[test]
    fn stream_decodes_consecutive_messages_then_eof() {
        for codec in Codec::ALL {
            let mut buf = Vec::new();
            codec.encode(&mut buf, &sample(1)).unwrap();
            codec.encode(&mut buf, &sample(2)).unwrap();

            let mut r = Cursor::new(buf);
            let first: Option<Msg> = codec.decode(&mut r).unwrap();
            let second: Option<Msg> = codec.decode(&mut r).unwrap();
            let end: Option<Msg> = codec.decode(&mut r).unwrap();
            assert_eq!(first, Some(sample(1)), "{codec}");
            assert_eq!(second, Some(sample(2)), "{codec}");
            assert_eq!(end, None, "{codec}");
        }
    }

    #[test]
    fn truncated_message_is_an_error() {
        for codec in Codec::ALL {
            let mut buf = codec.to_vec(&sample(3)).unwrap();
            buf.truncate(buf.len() / 2);
            let res: Result<Option<Msg>> = codec.decode(&mut Cursor::new(buf));
            assert!(res.is_err(), "{codec}");
        }
    }
}
