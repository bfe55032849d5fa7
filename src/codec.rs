//! Wire codec for the bus protocol.
//!
//! Implements the typed, self-describing serialization from `SPEC_FULL.md`
//! §4.1 as a [`tokio_util::codec::Decoder`]/[`Encoder`] pair so it composes
//! with [`tokio_util::codec::Framed`] the way the rest of the ambient stack
//! expects. `decode` returns `Ok(None)` when the buffer holds less than a
//! complete frame rather than blocking, and `encode` never performs I/O
//! itself — both match the non-blocking flush / streaming decode
//! requirement in the spec.
//!
//! On the wire each frame is `u32 length (big-endian) | tagged body`, with
//! multi-byte integers big-endian throughout, matching the network-byte-
//! order convention the rest of the protocol uses.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::BusError, name::Name, value::Value};

/// Numeric tags from the type table in `SPEC_FULL.md` §4.1.
///
/// Registration order forms the ABI; the numeric values themselves are
/// authoritative and must not be renumbered.
pub mod tag {
    /// `Invoke(id, name, method, args, kwargs, hasBlock)`.
    pub const INVOKE: u8 = 0x00;
    /// `Return(id, result)`.
    pub const RETURN: u8 = 0x01;
    /// `Yield(id, values)`.
    pub const YIELD: u8 = 0x02;
    /// `Error(id, exception)`.
    pub const ERROR: u8 = 0x03;
    /// `Next(id, value)`.
    pub const NEXT: u8 = 0x04;
    /// `Throw(id, tag, value)`.
    pub const THROW: u8 = 0x05;
    /// `Close(id)`.
    pub const CLOSE: u8 = 0x06;
    /// `ProxyRef(name)`.
    pub const PROXY_REF: u8 = 0x10;
    /// `Release(name)`.
    pub const RELEASE: u8 = 0x11;
    /// `Symbol(bytes)`.
    pub const SYMBOL: u8 = 0x20;
    /// `Exception(class, message, backtrace)`.
    pub const EXCEPTION: u8 = 0x21;
    /// `ClassToken(name)`.
    pub const CLASS_TOKEN: u8 = 0x22;
    /// First tag of the per-connection reference-type range; tag `n` maps
    /// to `reference_types[n - REFERENCE_TYPE_BASE]`.
    pub const REFERENCE_TYPE_BASE: u8 = 0x30;

    // The remaining scalar/container value kinds are not part of the
    // wire-visible message/extension table above (which only enumerates
    // message kinds and reference extension types); they need tags of
    // their own to keep the value universe self-describing, chosen from a
    // range the table above never claims.
    /// Nil value.
    pub const NIL: u8 = 0x40;
    /// Boolean `false`.
    pub const BOOL_FALSE: u8 = 0x41;
    /// Boolean `true`.
    pub const BOOL_TRUE: u8 = 0x42;
    /// Signed 64-bit integer.
    pub const INT: u8 = 0x43;
    /// 64-bit float.
    pub const FLOAT: u8 = 0x44;
    /// UTF-8 string.
    pub const STR: u8 = 0x45;
    /// Opaque byte string.
    pub const BYTES: u8 = 0x46;
    /// Ordered sequence of values.
    pub const ARRAY: u8 = 0x47;
    /// Ordered sequence of key/value pairs.
    pub const MAP: u8 = 0x48;
}

/// A decoded protocol message, keyed by [`tag`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request to invoke `method` on the object bound under `name`.
    Invoke {
        /// Transaction id this invocation opens.
        id: u32,
        /// Name of the bound object to invoke.
        name: Name,
        /// Method name.
        method: String,
        /// Positional arguments.
        args: Vec<Value>,
        /// Keyword arguments, in caller-supplied order.
        kwargs: Vec<(String, Value)>,
        /// Whether the caller passed a block callback.
        has_block: bool,
    },
    /// Terminal success response.
    Return {
        /// Transaction id this terminates.
        id: u32,
        /// The returned value.
        result: Value,
    },
    /// Non-terminal value yielded to a block callback.
    Yield {
        /// Transaction id this belongs to.
        id: u32,
        /// Values yielded in this step.
        values: Vec<Value>,
    },
    /// Terminal error response.
    Error {
        /// Transaction id this terminates.
        id: u32,
        /// The exception value (conventionally `Value::Exception`).
        exception: Value,
    },
    /// Response to a `Yield`, carrying the block callback's return value.
    Next {
        /// Transaction id this belongs to.
        id: u32,
        /// Value fed back into the yielding method.
        value: Value,
    },
    /// Terminal non-local control transfer.
    Throw {
        /// Transaction id this terminates.
        id: u32,
        /// Opaque tag identifying the control transfer.
        tag: Value,
        /// Value carried alongside the tag.
        value: Value,
    },
    /// Orderly close of a transaction's yield loop, or (for an initiator
    /// observed outside a block callback) an implicit `Return(nil)`.
    Close {
        /// Transaction id this belongs to.
        id: u32,
    },
    /// Notification that the sender no longer holds a proxy for `name`.
    Release {
        /// Name of the (possibly already-gone) implicit binding.
        name: Name,
    },
}

impl Message {
    /// The transaction id this message is addressed to, if any.
    ///
    /// `Release` carries no transaction id — it targets a Name, not an
    /// in-flight call.
    #[must_use]
    pub const fn transaction_id(&self) -> Option<u32> {
        match *self {
            Self::Invoke { id, .. }
            | Self::Return { id, .. }
            | Self::Yield { id, .. }
            | Self::Error { id, .. }
            | Self::Next { id, .. }
            | Self::Throw { id, .. }
            | Self::Close { id } => Some(id),
            Self::Release { .. } => None,
        }
    }
}

/// Maximum permitted frame body length, guarding against a corrupt or
/// hostile length prefix causing unbounded buffering.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// The bus wire codec.
#[derive(Debug, Default)]
pub struct BusCodec {
    reference_types: Vec<String>,
}

impl BusCodec {
    /// Create a codec with no registered reference types.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Create a codec with the given per-connection reference-type
    /// registration order (`SPEC_FULL.md` §4.1, tag `0x30+`).
    #[must_use]
    pub fn with_reference_types(reference_types: Vec<String>) -> Self { Self { reference_types } }

    /// The registered reference-type names, in tag-assignment order.
    #[must_use]
    pub fn reference_types(&self) -> &[String] { &self.reference_types }
}

impl Decoder for BusCodec {
    type Error = BusError;
    type Item = Message;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, BusError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let Some(head) = src.get(..4) else { return Ok(None) };
        let mut head = head;
        let len = head.get_u32();
        if len > MAX_FRAME_LEN {
            return Err(BusError::Codec(format!("frame length {len} exceeds maximum")));
        }
        let len = len as usize;
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let body = src.split_to(len);
        let mut r = Reader::new(body.as_ref());
        decode_message(&mut r, &self.reference_types).map(Some)
    }
}

impl Encoder<Message> for BusCodec {
    type Error = BusError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), BusError> {
        let mut body = Vec::new();
        encode_message(&item, &mut body)?;
        let len = to_u32(body.len())?;
        dst.reserve(4 + body.len());
        dst.put_u32(len);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

fn to_u32(n: usize) -> Result<u32, BusError> {
    n.try_into().map_err(|_| BusError::Codec("length exceeds u32 range".to_owned()))
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self { Self { buf } }

    fn require(&self, n: usize) -> Result<(), BusError> {
        if self.buf.remaining() < n {
            return Err(BusError::Codec("truncated frame".to_owned()));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, BusError> {
        self.require(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32, BusError> {
        self.require(4)?;
        Ok(self.buf.get_u32())
    }

    fn i64(&mut self) -> Result<i64, BusError> {
        self.require(8)?;
        Ok(self.buf.get_i64())
    }

    fn f64(&mut self) -> Result<f64, BusError> {
        self.require(8)?;
        Ok(self.buf.get_f64())
    }

    fn bytes(&mut self) -> Result<Vec<u8>, BusError> {
        let len = self.u32()? as usize;
        self.require(len)?;
        let mut out = vec![0_u8; len];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    fn string(&mut self) -> Result<String, BusError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes).map_err(|e| BusError::Codec(format!("invalid utf-8: {e}")))
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), BusError> {
    buf.put_u32(to_u32(bytes.len())?);
    buf.extend_from_slice(bytes);
    Ok(())
}

fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<(), BusError> { write_bytes(buf, s.as_bytes()) }

fn encode_value(v: &Value, buf: &mut Vec<u8>) -> Result<(), BusError> {
    match v {
        Value::Nil => buf.put_u8(tag::NIL),
        Value::Bool(false) => buf.put_u8(tag::BOOL_FALSE),
        Value::Bool(true) => buf.put_u8(tag::BOOL_TRUE),
        Value::Int(n) => {
            buf.put_u8(tag::INT);
            buf.put_i64(*n);
        }
        Value::Float(f) => {
            buf.put_u8(tag::FLOAT);
            buf.put_f64(*f);
        }
        Value::Str(s) => {
            buf.put_u8(tag::STR);
            write_string(buf, s)?;
        }
        Value::Bytes(b) => {
            buf.put_u8(tag::BYTES);
            write_bytes(buf, b)?;
        }
        Value::Array(items) => {
            buf.put_u8(tag::ARRAY);
            buf.put_u32(to_u32(items.len())?);
            for item in items {
                encode_value(item, buf)?;
            }
        }
        Value::Map(pairs) => {
            buf.put_u8(tag::MAP);
            buf.put_u32(to_u32(pairs.len())?);
            for (k, val) in pairs {
                encode_value(k, buf)?;
                encode_value(val, buf)?;
            }
        }
        Value::Proxy(name) => {
            buf.put_u8(tag::PROXY_REF);
            write_string(buf, name.as_str())?;
        }
        Value::Symbol(s) => {
            buf.put_u8(tag::SYMBOL);
            write_string(buf, s)?;
        }
        Value::Exception { class, message, backtrace } => {
            buf.put_u8(tag::EXCEPTION);
            write_string(buf, class)?;
            write_string(buf, message)?;
            buf.put_u32(to_u32(backtrace.len())?);
            for line in backtrace {
                write_string(buf, line)?;
            }
        }
        Value::ClassToken(name) => {
            buf.put_u8(tag::CLASS_TOKEN);
            write_string(buf, name)?;
        }
    }
    Ok(())
}

fn decode_value(r: &mut Reader<'_>, reference_types: &[String]) -> Result<Value, BusError> {
    let t = r.u8()?;
    match t {
        tag::NIL => Ok(Value::Nil),
        tag::BOOL_FALSE => Ok(Value::Bool(false)),
        tag::BOOL_TRUE => Ok(Value::Bool(true)),
        tag::INT => Ok(Value::Int(r.i64()?)),
        tag::FLOAT => Ok(Value::Float(r.f64()?)),
        tag::STR => Ok(Value::Str(r.string()?)),
        tag::BYTES => Ok(Value::Bytes(r.bytes()?)),
        tag::ARRAY => {
            let n = r.u32()?;
            let mut items = Vec::new();
            for _ in 0..n {
                items.push(decode_value(r, reference_types)?);
            }
            Ok(Value::Array(items))
        }
        tag::MAP => {
            let n = r.u32()?;
            let mut pairs = Vec::new();
            for _ in 0..n {
                let k = decode_value(r, reference_types)?;
                let v = decode_value(r, reference_types)?;
                pairs.push((k, v));
            }
            Ok(Value::Map(pairs))
        }
        tag::PROXY_REF => Ok(Value::Proxy(Name::from(r.string()?))),
        tag::SYMBOL => Ok(Value::Symbol(r.string()?)),
        tag::EXCEPTION => {
            let class = r.string()?;
            let message = r.string()?;
            let n = r.u32()?;
            let mut backtrace = Vec::new();
            for _ in 0..n {
                backtrace.push(r.string()?);
            }
            Ok(Value::Exception { class, message, backtrace })
        }
        tag::CLASS_TOKEN => Ok(Value::ClassToken(r.string()?)),
        other if other >= tag::REFERENCE_TYPE_BASE => {
            let idx = usize::from(other - tag::REFERENCE_TYPE_BASE);
            if reference_types.get(idx).is_none() {
                return Err(BusError::Codec(format!("unknown reference-type tag {other:#x}")));
            }
            Ok(Value::Proxy(Name::from(r.string()?)))
        }
        other => Err(BusError::Codec(format!("unknown value tag {other:#x}"))),
    }
}

fn encode_message(msg: &Message, buf: &mut Vec<u8>) -> Result<(), BusError> {
    match msg {
        Message::Invoke { id, name, method, args, kwargs, has_block } => {
            buf.put_u8(tag::INVOKE);
            buf.put_u32(*id);
            write_string(buf, name.as_str())?;
            write_string(buf, method)?;
            buf.put_u32(to_u32(args.len())?);
            for a in args {
                encode_value(a, buf)?;
            }
            buf.put_u32(to_u32(kwargs.len())?);
            for (k, v) in kwargs {
                write_string(buf, k)?;
                encode_value(v, buf)?;
            }
            buf.put_u8(u8::from(*has_block));
        }
        Message::Return { id, result } => {
            buf.put_u8(tag::RETURN);
            buf.put_u32(*id);
            encode_value(result, buf)?;
        }
        Message::Yield { id, values } => {
            buf.put_u8(tag::YIELD);
            buf.put_u32(*id);
            buf.put_u32(to_u32(values.len())?);
            for v in values {
                encode_value(v, buf)?;
            }
        }
        Message::Error { id, exception } => {
            buf.put_u8(tag::ERROR);
            buf.put_u32(*id);
            encode_value(exception, buf)?;
        }
        Message::Next { id, value } => {
            buf.put_u8(tag::NEXT);
            buf.put_u32(*id);
            encode_value(value, buf)?;
        }
        Message::Throw { id, tag: t, value } => {
            buf.put_u8(tag::THROW);
            buf.put_u32(*id);
            encode_value(t, buf)?;
            encode_value(value, buf)?;
        }
        Message::Close { id } => {
            buf.put_u8(tag::CLOSE);
            buf.put_u32(*id);
        }
        Message::Release { name } => {
            buf.put_u8(tag::RELEASE);
            write_string(buf, name.as_str())?;
        }
    }
    Ok(())
}

fn decode_message(r: &mut Reader<'_>, reference_types: &[String]) -> Result<Message, BusError> {
    let t = r.u8()?;
    match t {
        tag::INVOKE => {
            let id = r.u32()?;
            let name = Name::from(r.string()?);
            let method = r.string()?;
            let argc = r.u32()?;
            let mut args = Vec::new();
            for _ in 0..argc {
                args.push(decode_value(r, reference_types)?);
            }
            let kwargc = r.u32()?;
            let mut kwargs = Vec::new();
            for _ in 0..kwargc {
                let k = r.string()?;
                let v = decode_value(r, reference_types)?;
                kwargs.push((k, v));
            }
            let has_block = r.u8()? != 0;
            Ok(Message::Invoke { id, name, method, args, kwargs, has_block })
        }
        tag::RETURN => {
            let id = r.u32()?;
            Ok(Message::Return { id, result: decode_value(r, reference_types)? })
        }
        tag::YIELD => {
            let id = r.u32()?;
            let n = r.u32()?;
            let mut values = Vec::new();
            for _ in 0..n {
                values.push(decode_value(r, reference_types)?);
            }
            Ok(Message::Yield { id, values })
        }
        tag::ERROR => {
            let id = r.u32()?;
            Ok(Message::Error { id, exception: decode_value(r, reference_types)? })
        }
        tag::NEXT => {
            let id = r.u32()?;
            Ok(Message::Next { id, value: decode_value(r, reference_types)? })
        }
        tag::THROW => {
            let id = r.u32()?;
            let t = decode_value(r, reference_types)?;
            let value = decode_value(r, reference_types)?;
            Ok(Message::Throw { id, tag: t, value })
        }
        tag::CLOSE => Ok(Message::Close { id: r.u32()? }),
        tag::RELEASE => Ok(Message::Release { name: Name::from(r.string()?) }),
        other => Err(BusError::Codec(format!("unknown message tag {other:#x}"))),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let mut codec = BusCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).expect("encode");
        let decoded = codec.decode(&mut buf).expect("decode").expect("complete frame");
        assert!(buf.is_empty(), "decoder should consume the whole frame");
        decoded
    }

    #[test]
    fn decode_returns_none_on_partial_frame() {
        let mut codec = BusCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Message::Close { id: 7 }, &mut buf).expect("encode");
        buf.truncate(buf.len() - 1);
        assert!(codec.decode(&mut buf).expect("decode").is_none());
    }

    #[rstest]
    #[case(Value::Nil)]
    #[case(Value::Bool(true))]
    #[case(Value::Int(-42))]
    #[case(Value::Float(2.5))]
    #[case(Value::Str("hello".to_owned()))]
    #[case(Value::Array(vec![Value::Int(1), Value::Int(2)]))]
    #[case(Value::Proxy(Name::from("worker-1")))]
    #[case(Value::Symbol("done".to_owned()))]
    #[case(Value::Exception { class: "RuntimeError".to_owned(), message: "boom".to_owned(), backtrace: vec!["a.rb:1".to_owned()] })]
    fn values_roundtrip_through_return(#[case] value: Value) {
        let msg = roundtrip(Message::Return { id: 1, result: value.clone() });
        match msg {
            Message::Return { result, .. } => assert_eq!(result, value),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn invoke_roundtrips_with_args_and_kwargs() {
        let msg = Message::Invoke {
            id: 3,
            name: Name::from("counter"),
            method: "increment".to_owned(),
            args: vec![Value::Int(1)],
            kwargs: vec![("by".to_owned(), Value::Int(2))],
            has_block: true,
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn release_carries_no_transaction_id() {
        let msg = Message::Release { name: Name::from("#3") };
        assert_eq!(msg.transaction_id(), None);
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut codec = BusCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn unknown_message_tag_is_a_codec_error() {
        let mut codec = BusCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0xEE);
        assert!(codec.decode(&mut buf).is_err());
    }

    proptest::proptest! {
        #[test]
        fn int_and_string_values_roundtrip_for_arbitrary_input(n: i64, s in ".*") {
            let msg = roundtrip(Message::Return { id: 0, result: Value::Int(n) });
            match msg {
                Message::Return { result: Value::Int(got), .. } => proptest::prop_assert_eq!(got, n),
                other => proptest::prop_assert!(false, "unexpected message: {other:?}"),
            }

            let msg = roundtrip(Message::Return { id: 0, result: Value::Str(s.clone()) });
            match msg {
                Message::Return { result: Value::Str(got), .. } => proptest::prop_assert_eq!(got, s),
                other => proptest::prop_assert!(false, "unexpected message: {other:?}"),
            }
        }
    }
}
