/// Codecs for the SafeTap relay protocol
use crate::{
    model::{Entry, Posted},
    util::{optional_arg, parse_arg, ResultExt},
    Error,
};
use base64::{
    engine::general_purpose::STANDARD as B64_STANDARD, read::DecoderReader, write::EncoderWriter,
};
use std::io::{Cursor, Write};
use tokio_util::{
    bytes::{BufMut, BytesMut},
    codec::{Decoder, Encoder, LinesCodec},
};

// 640k ought to be enough for anyone
const MAX_LENGTH: usize = 1024 * 640;

// Number of arguments making up one entry inside a snapshot frame
const ENTRY_ARGS: usize = 5;

/// Messages sent from client to relay
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum ClientFrame {
    Subscribe {
        reference: String,
        collection: String,
        limit: usize,
    },
    Append {
        reference: String,
        collection: String,
        posted: Posted,
    },
    Unsubscribe {
        reference: String,
    },
    Leave,
}

impl ClientFrame {
    pub fn subscribe(
        reference: impl Into<String>,
        collection: impl Into<String>,
        limit: usize,
    ) -> Self {
        Self::Subscribe {
            reference: reference.into(),
            collection: collection.into(),
            limit,
        }
    }

    pub fn append(
        reference: impl Into<String>,
        collection: impl Into<String>,
        posted: Posted,
    ) -> Self {
        Self::Append {
            reference: reference.into(),
            collection: collection.into(),
            posted,
        }
    }

    pub fn unsubscribe(reference: impl Into<String>) -> Self {
        Self::Unsubscribe {
            reference: reference.into(),
        }
    }

    pub fn leave() -> Self {
        Self::Leave
    }
}

/// Codec for client frames
#[derive(Debug)]
pub struct ClientFrameCodec {
    inner: LinesCodec,
}

impl Default for ClientFrameCodec {
    fn default() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LENGTH),
        }
    }
}

impl Decoder for ClientFrameCodec {
    type Item = ClientFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some((verb, args)) = decode_frame(src, &mut self.inner)? {
            match verb.as_str() {
                "subscribe" => {
                    let [reference, collection, limit] = destructure_args(args)?;
                    Ok(Some(ClientFrame::Subscribe {
                        reference,
                        collection,
                        limit: parse_arg(&limit)?,
                    }))
                }
                "append" => {
                    let [reference, collection, sender_id, sender_name, text, timestamp] =
                        destructure_args(args)?;
                    Ok(Some(ClientFrame::Append {
                        reference,
                        collection,
                        posted: Posted {
                            sender_id,
                            sender_name: optional_arg(sender_name),
                            text,
                            timestamp: parse_arg(&timestamp)?,
                        },
                    }))
                }
                "unsubscribe" => {
                    let [reference] = destructure_args(args)?;
                    Ok(Some(ClientFrame::Unsubscribe { reference }))
                }
                "leave" => Ok(Some(ClientFrame::Leave)),
                _ => Err(Error::InvalidFrame),
            }
        } else {
            Ok(None)
        }
    }
}

impl Encoder<ClientFrame> for ClientFrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: ClientFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        use ClientFrame::*;
        match frame {
            Subscribe {
                reference,
                collection,
                limit,
            } => {
                let limit = limit.to_string();
                encode_frame(b"subscribe", &[&reference, &collection, &limit], dst)
            }
            Append {
                reference,
                collection,
                posted,
            } => {
                let timestamp = posted.timestamp.to_string();
                let sender_name = posted.sender_name.as_deref().unwrap_or_default();
                encode_frame(
                    b"append",
                    &[
                        &reference,
                        &collection,
                        &posted.sender_id,
                        sender_name,
                        &posted.text,
                        &timestamp,
                    ],
                    dst,
                )
            }
            Unsubscribe { reference } => encode_frame(b"unsubscribe", &[&reference], dst),
            Leave => encode_frame(b"leave", &[], dst),
        }
    }
}

/// Messages sent from relay to client
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum ServerFrame {
    /// Latest entries of a subscribed collection
    Snapshot {
        reference: String,
        entries: Vec<Entry>,
    },
    /// Append stored under `id`
    Ack { reference: String, id: String },
    /// Request refused
    Nack { reference: String, reason: String },
}

impl ServerFrame {
    pub fn snapshot(reference: impl Into<String>, entries: Vec<Entry>) -> Self {
        Self::Snapshot {
            reference: reference.into(),
            entries,
        }
    }

    pub fn ack(reference: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Ack {
            reference: reference.into(),
            id: id.into(),
        }
    }

    pub fn nack(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Nack {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Snapshot of the newest `entries` that fit in one frame
    ///
    /// `entries` are oldest first. Older entries are left out until the
    /// encoded line is within the frame length limit.
    pub fn snapshot_within_limit(reference: impl Into<String>, mut entries: Vec<Entry>) -> Self {
        let reference = reference.into();
        let mut len = "snapshot".len().saturating_add(arg_len(&reference));
        let keep = entries
            .iter()
            .rev()
            .take_while(|entry| {
                len = len.saturating_add(entry_len(entry));
                len <= MAX_LENGTH
            })
            .count();
        let skip = entries.len() - keep;
        entries.drain(..skip);
        Self::Snapshot { reference, entries }
    }

    /// Reference of the request this frame answers
    pub fn reference(&self) -> &str {
        match self {
            Self::Snapshot { reference, .. }
            | Self::Ack { reference, .. }
            | Self::Nack { reference, .. } => reference,
        }
    }
}

/// Codec for server frames
#[derive(Debug)]
pub struct ServerFrameCodec {
    inner: LinesCodec,
}

impl Default for ServerFrameCodec {
    fn default() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LENGTH),
        }
    }
}

impl Decoder for ServerFrameCodec {
    type Item = ServerFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some((verb, args)) = decode_frame(src, &mut self.inner)? {
            match verb.as_str() {
                "snapshot" => {
                    let mut args = args.into_iter();
                    let reference = args.next().or_invalid_frame()?;
                    let rest: Vec<String> = args.collect();
                    if rest.len() % ENTRY_ARGS != 0 {
                        return Err(Error::InvalidFrame);
                    }
                    let entries = rest
                        .chunks_exact(ENTRY_ARGS)
                        .map(|chunk| {
                            let [id, sender_id, sender_name, text, timestamp] =
                                destructure_args(chunk.to_vec())?;
                            Ok(Entry {
                                id,
                                sender_id,
                                sender_name: optional_arg(sender_name),
                                text,
                                timestamp,
                            })
                        })
                        .collect::<Result<Vec<_>, Error>>()?;
                    Ok(Some(ServerFrame::Snapshot { reference, entries }))
                }
                "ack" => {
                    let [reference, id] = destructure_args(args)?;
                    Ok(Some(ServerFrame::Ack { reference, id }))
                }
                "nack" => {
                    let [reference, reason] = destructure_args(args)?;
                    Ok(Some(ServerFrame::Nack { reference, reason }))
                }
                _ => Err(Error::InvalidFrame),
            }
        } else {
            Ok(None)
        }
    }
}

impl Encoder<ServerFrame> for ServerFrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: ServerFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        use ServerFrame::*;
        match frame {
            Snapshot { reference, entries } => {
                let mut args = Vec::with_capacity(1 + entries.len() * ENTRY_ARGS);
                args.push(reference.as_str());
                for entry in &entries {
                    args.extend([
                        entry.id.as_str(),
                        entry.sender_id.as_str(),
                        entry.sender_name.as_deref().unwrap_or_default(),
                        entry.text.as_str(),
                        entry.timestamp.as_str(),
                    ]);
                }
                encode_frame(b"snapshot", &args, dst)
            }
            Ack { reference, id } => encode_frame(b"ack", &[&reference, &id], dst),
            Nack { reference, reason } => encode_frame(b"nack", &[&reference, &reason], dst),
        }
    }
}

// Common logic for decoding frames
fn decode_frame(
    src: &mut BytesMut,
    frame_decoder: &mut LinesCodec,
) -> Result<Option<(String, Vec<String>)>, Error> {
    if let Some(frame) = frame_decoder.decode(src)? {
        // No trimming here, a trailing empty argument is legal
        let mut split = frame.split(' ');
        let verb = split
            .next()
            .filter(|verb| !verb.is_empty())
            .map(String::from)
            .ok_or(Error::InvalidFrame)?;
        let args = split
            .map(|value| {
                let reader = DecoderReader::new(Cursor::new(value), &B64_STANDARD);
                std::io::read_to_string(reader).or_invalid_frame()
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Some((verb, args)))
    } else {
        Ok(None)
    }
}

// Common logic for encoding frames
fn encode_frame(verb: &[u8], args: &[&str], dst: &mut BytesMut) -> Result<(), Error> {
    // Reserve enough space for full encoding to avoid reallocating
    dst.reserve(
        args.iter()
            .map(|s| Ok(base64::encoded_len(s.len(), true).or_invalid_frame()? + 1))
            .sum::<Result<usize, Error>>()?
            + verb.len()
            + 1,
    );

    // Write out verb and arguments
    dst.put_slice(verb);
    for s in args {
        dst.put_u8(b' ');
        EncoderWriter::new(dst.writer(), &B64_STANDARD).write_all(s.as_bytes())?;
    }
    dst.put_u8(b'\n');
    Ok(())
}

// Encoded size of one argument including its leading space
fn arg_len(arg: &str) -> usize {
    base64::encoded_len(arg.len(), true).map_or(usize::MAX, |len| len.saturating_add(1))
}

fn entry_len(entry: &Entry) -> usize {
    [
        entry.id.as_str(),
        entry.sender_id.as_str(),
        entry.sender_name.as_deref().unwrap_or_default(),
        entry.text.as_str(),
        entry.timestamp.as_str(),
    ]
    .into_iter()
    .fold(0, |len, arg| len.saturating_add(arg_len(arg)))
}

// Rust can destructure into an array, and a Vec can be turned into an array
// with `try_into`. This lets us write ergonomic code like
// `let [a, b] = destructure_args(some_vec)?` that will return an error if there
// aren't the right number of arguments.
fn destructure_args<const N: usize>(args: Vec<String>) -> Result<[String; N], Error> {
    args.try_into().or_invalid_frame()
}

#[cfg(test)]
mod test {
    use super::{ClientFrame, ClientFrameCodec, ServerFrame, ServerFrameCodec, MAX_LENGTH};
    use crate::{Entry, Error, Posted, MAX_NAME_LEN, MAX_TEXT_LEN};
    use tokio_util::{
        bytes::BytesMut,
        codec::{Decoder, Encoder},
    };

    fn do_encode<T, E>(item: T, mut encoder: E) -> String
    where
        E: Encoder<T>,
        <E as Encoder<T>>::Error: std::fmt::Debug,
    {
        let mut output = BytesMut::new();
        encoder.encode(item, &mut output).unwrap();
        String::from_utf8(output.to_vec()).unwrap()
    }

    fn do_decode<T, D>(bytes: &str, mut decoder: D) -> T
    where
        D: Decoder<Item = T, Error = Error>,
        <D as Decoder>::Error: std::fmt::Debug,
    {
        let mut buffer = BytesMut::from(bytes);
        decoder.decode(&mut buffer).unwrap().unwrap()
    }

    #[test]
    fn test_client_codec() {
        #[rustfmt::skip]
        let tests = vec![
            (
                ClientFrame::subscribe("r1", "chat", 50),
                "subscribe cjE= Y2hhdA== NTA=\n"
            ),
            (
                ClientFrame::append("r2", "chat", Posted::new("u1", Some("Jane Smith".into()), "hi", 1000)),
                "append cjI= Y2hhdA== dTE= SmFuZSBTbWl0aA== aGk= MTAwMA==\n"
            ),
            (
                ClientFrame::append("r3", "chat", Posted::new("u1", None, "hi", 1000)),
                "append cjM= Y2hhdA== dTE=  aGk= MTAwMA==\n"
            ),
            (
                ClientFrame::unsubscribe("r1"),
                "unsubscribe cjE=\n"
            ),
            (
                ClientFrame::leave(),
                "leave\n"
            ),
        ];
        for test in tests {
            let (item, bytes) = test;
            let encoded = do_encode(item.clone(), ClientFrameCodec::default());
            assert_eq!(encoded, bytes);
            let decoded = do_decode(bytes, ClientFrameCodec::default());
            assert_eq!(decoded, item);
        }
    }

    #[test]
    fn test_server_codec() {
        #[rustfmt::skip]
        let tests = vec![
            (
                ServerFrame::snapshot("r1", vec![
                    Entry::new("m1", "u1", Some("Jane Smith".into()), "hi", "1000"),
                    Entry::new("m2", "u2", None, "yo", "2000"),
                ]),
                "snapshot cjE= bTE= dTE= SmFuZSBTbWl0aA== aGk= MTAwMA== bTI= dTI=  eW8= MjAwMA==\n"
            ),
            (
                ServerFrame::snapshot("r1", vec![]),
                "snapshot cjE=\n"
            ),
            (
                ServerFrame::ack("r2", "m3"),
                "ack cjI= bTM=\n"
            ),
            (
                ServerFrame::nack("r2", ""),
                "nack cjI= \n"
            ),
        ];
        for test in tests {
            let (item, bytes) = test;
            let encoded = do_encode(item.clone(), ServerFrameCodec::default());
            assert_eq!(encoded, bytes);
            let decoded = do_decode(bytes, ServerFrameCodec::default());
            assert_eq!(decoded, item);
        }
    }

    fn entry_at_limits(n: usize) -> Entry {
        Entry::new(
            format!("{n:036}"),
            "u".repeat(MAX_NAME_LEN),
            Some("n".repeat(MAX_NAME_LEN)),
            "x".repeat(MAX_TEXT_LEN),
            i64::MIN.to_string(),
        )
    }

    #[test]
    fn test_full_page_at_limits_fits_one_frame() {
        let entries: Vec<_> = (0..50).map(entry_at_limits).collect();
        let frame = ServerFrame::snapshot_within_limit("r1", entries.clone());
        assert_eq!(frame, ServerFrame::snapshot("r1", entries));

        let encoded = do_encode(frame.clone(), ServerFrameCodec::default());
        assert!(encoded.len() <= MAX_LENGTH + 1);
        assert_eq!(do_decode(&encoded, ServerFrameCodec::default()), frame);
    }

    #[test]
    fn test_oversized_snapshot_keeps_newest() {
        let entries: Vec<_> = (0..200).map(entry_at_limits).collect();
        let frame = ServerFrame::snapshot_within_limit("r1", entries.clone());
        let ServerFrame::Snapshot { entries: kept, .. } = &frame else {
            panic!("not a snapshot");
        };
        assert!(kept.len() > 50 && kept.len() < 200);
        assert_eq!(kept.last(), entries.last());

        let encoded = do_encode(frame.clone(), ServerFrameCodec::default());
        assert!(encoded.len() <= MAX_LENGTH + 1);
        assert_eq!(do_decode(&encoded, ServerFrameCodec::default()), frame);

        // One more entry would not have fit
        let skipped = entries.len() - kept.len() - 1;
        let one_more = ServerFrame::snapshot("r1", entries[skipped..].to_vec());
        assert!(do_encode(one_more, ServerFrameCodec::default()).len() > MAX_LENGTH + 1);
    }

    #[test]
    fn test_reference() {
        assert_eq!(ServerFrame::snapshot("r1", vec![]).reference(), "r1");
        assert_eq!(ServerFrame::ack("r2", "m1").reference(), "r2");
        assert_eq!(ServerFrame::nack("r3", "no").reference(), "r3");
    }

    #[test]
    fn test_rejects_malformed_frames() {
        for bytes in ["\n", "shout aGk=\n", "ack cjI=\n", "snapshot cjE= bTE= dTE=\n"] {
            let mut buffer = BytesMut::from(bytes);
            let result = ServerFrameCodec::default().decode(&mut buffer);
            assert!(matches!(result, Err(Error::InvalidFrame)), "{bytes:?}");
        }
        let mut buffer = BytesMut::from("subscribe cjE= Y2hhdA== bWFueQ==\n");
        let result = ClientFrameCodec::default().decode(&mut buffer);
        assert!(matches!(result, Err(Error::InvalidFrame)));
    }
}
