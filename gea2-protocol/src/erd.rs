//! ERD frame layouts.
//!
//! All ERD frames are big-endian. The protocol carries no request ID, so a
//! frame is told apart from the reply to it by its length alone:
//!
//! ```text
//! read request     count(1) | erd(2)*count
//! read reply       count(1) | {erd(2), len(1), data(len)}*count
//! write request    count(1) | {erd(2), len(1), data(len)}*count
//! write reply      count(1) | erd(2)*count      (or count(1) alone)
//! subscribe req    count(1) | {erd(2), time(1)}*count
//! subscribe reply  count(1)
//! publish request  count(1) | {erd(2), len(1), data(len)}*count
//! publish ack      (empty)
//! ```

use crate::error::ProtocolError;
use crate::message::Erd;
use crate::stream::{Endian, StreamReader, StreamWriter};
use bytes::Bytes;

/// The ERD sub-protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErdCommand {
    Read,
    Write,
    Subscribe,
    Publish,
}

impl ErdCommand {
    pub const READ: u16 = 0xF0;
    pub const WRITE: u16 = 0xF1;
    pub const SUBSCRIBE: u16 = 0xF2;
    pub const PUBLISH: u16 = 0xF5;

    pub fn from_command(command: u16) -> Option<Self> {
        match command {
            Self::READ => Some(ErdCommand::Read),
            Self::WRITE => Some(ErdCommand::Write),
            Self::SUBSCRIBE => Some(ErdCommand::Subscribe),
            Self::PUBLISH => Some(ErdCommand::Publish),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            ErdCommand::Read => Self::READ,
            ErdCommand::Write => Self::WRITE,
            ErdCommand::Subscribe => Self::SUBSCRIBE,
            ErdCommand::Publish => Self::PUBLISH,
        }
    }
}

/// One ERD with its value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErdRecord {
    pub erd: Erd,
    pub data: Bytes,
}

impl ErdRecord {
    pub fn new(erd: Erd, data: impl Into<Bytes>) -> Self {
        Self {
            erd,
            data: data.into(),
        }
    }
}

/// One item of a subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeItem {
    pub erd: Erd,
    /// Requested publication interval byte; 0 means "on change".
    pub time: u8,
}

/// An ordered list of ERDs, built from a single ERD or a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErdList(Vec<Erd>);

impl ErdList {
    pub fn as_slice(&self) -> &[Erd] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<Erd> {
        self.0
    }
}

impl From<Erd> for ErdList {
    fn from(erd: Erd) -> Self {
        Self(vec![erd])
    }
}

impl From<Vec<Erd>> for ErdList {
    fn from(erds: Vec<Erd>) -> Self {
        Self(erds)
    }
}

impl From<&[Erd]> for ErdList {
    fn from(erds: &[Erd]) -> Self {
        Self(erds.to_vec())
    }
}

impl<const N: usize> From<[Erd; N]> for ErdList {
    fn from(erds: [Erd; N]) -> Self {
        Self(erds.to_vec())
    }
}

/// An inbound ERD frame, classified as request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErdFrame {
    ReadRequest(Vec<Erd>),
    ReadReply(Vec<ErdRecord>),
    WriteRequest(Vec<ErdRecord>),
    /// `erds` is `None` for the count-only shape some devices send.
    WriteReply {
        count: u8,
        erds: Option<Vec<Erd>>,
    },
    SubscribeRequest(Vec<SubscribeItem>),
    SubscribeReply(u8),
    PublishRequest(Vec<ErdRecord>),
    PublishAck,
}

impl ErdFrame {
    /// Classifies and decodes the data of an inbound ERD frame.
    pub fn classify(command: ErdCommand, data: &[u8]) -> Result<Self, ProtocolError> {
        let code = command.code();

        if data.is_empty() {
            return match command {
                ErdCommand::Publish => Ok(ErdFrame::PublishAck),
                _ => Err(ProtocolError::malformed(code, "empty frame")),
            };
        }

        let mut reader = StreamReader::new(data, Endian::Big);
        let count = reader.read_u8();
        let ids_only = 1 + 2 * count as usize;

        match command {
            ErdCommand::Read => {
                // A zero-count read can only be a reply in which every item failed.
                if count > 0 && data.len() == ids_only {
                    Ok(ErdFrame::ReadRequest(read_ids(&mut reader, count)))
                } else {
                    Ok(ErdFrame::ReadReply(read_records(code, &mut reader, count)?))
                }
            }
            ErdCommand::Write => {
                if data.len() == 1 {
                    Ok(ErdFrame::WriteReply { count, erds: None })
                } else if data.len() == ids_only {
                    Ok(ErdFrame::WriteReply {
                        count,
                        erds: Some(read_ids(&mut reader, count)),
                    })
                } else {
                    Ok(ErdFrame::WriteRequest(read_records(
                        code,
                        &mut reader,
                        count,
                    )?))
                }
            }
            ErdCommand::Subscribe => {
                if data.len() == 1 {
                    return Ok(ErdFrame::SubscribeReply(count));
                }
                let expected = 1 + 3 * count as usize;
                if data.len() != expected {
                    return Err(ProtocolError::malformed(
                        code,
                        format!(
                            "length {} does not match {} subscribe items",
                            data.len(),
                            count
                        ),
                    ));
                }
                let items = (0..count)
                    .map(|_| SubscribeItem {
                        erd: reader.read_u16(),
                        time: reader.read_u8(),
                    })
                    .collect();
                Ok(ErdFrame::SubscribeRequest(items))
            }
            ErdCommand::Publish => Ok(ErdFrame::PublishRequest(read_records(
                code,
                &mut reader,
                count,
            )?)),
        }
    }
}

fn read_ids(reader: &mut StreamReader<'_>, count: u8) -> Vec<Erd> {
    (0..count).map(|_| reader.read_u16()).collect()
}

fn read_records(
    code: u16,
    reader: &mut StreamReader<'_>,
    count: u8,
) -> Result<Vec<ErdRecord>, ProtocolError> {
    let mut records = Vec::with_capacity(count as usize);

    for index in 0..count {
        if reader.remaining() < 3 {
            return Err(ProtocolError::malformed(
                code,
                format!("item {} header truncated", index),
            ));
        }
        let erd = reader.read_u16();
        let len = reader.read_u8() as usize;
        if reader.remaining() < len {
            return Err(ProtocolError::malformed(
                code,
                format!("ERD {:#06x} declares {} bytes, {} left", erd, len, reader.remaining()),
            ));
        }
        let data = Bytes::copy_from_slice(reader.read_bytes(len));
        records.push(ErdRecord { erd, data });
    }

    if reader.remaining() != 0 {
        return Err(ProtocolError::malformed(
            code,
            format!("{} trailing bytes after {} items", reader.remaining(), count),
        ));
    }

    Ok(records)
}

fn item_count(count: usize) -> Result<u8, ProtocolError> {
    u8::try_from(count).map_err(|_| ProtocolError::TooManyItems(count))
}

/// Encodes `count | erd*count`, used for read requests and write replies.
pub fn encode_erd_ids(erds: &[Erd]) -> Result<Bytes, ProtocolError> {
    let count = item_count(erds.len())?;
    let mut writer = StreamWriter::new(1 + 2 * erds.len(), Endian::Big);
    writer.write_u8(count);
    for erd in erds {
        writer.write_u16(*erd);
    }
    Ok(writer.freeze())
}

/// Encodes `count | {erd, len, data}*count`, used for read replies, write
/// requests and publish requests.
pub fn encode_records(records: &[ErdRecord]) -> Result<Bytes, ProtocolError> {
    let count = item_count(records.len())?;
    let mut size = 1;
    for record in records {
        if record.data.len() > u8::MAX as usize {
            return Err(ProtocolError::ValueTooLong(record.data.len()));
        }
        size += 3 + record.data.len();
    }

    let mut writer = StreamWriter::new(size, Endian::Big);
    writer.write_u8(count);
    for record in records {
        writer.write_u16(record.erd);
        writer.write_u8(record.data.len() as u8);
        writer.write_bytes(&record.data);
    }
    Ok(writer.freeze())
}

/// Encodes `count | {erd, time}*count`.
pub fn encode_subscribe_request(items: &[SubscribeItem]) -> Result<Bytes, ProtocolError> {
    let count = item_count(items.len())?;
    let mut writer = StreamWriter::new(1 + 3 * items.len(), Endian::Big);
    writer.write_u8(count);
    for item in items {
        writer.write_u16(item.erd);
        writer.write_u8(item.time);
    }
    Ok(writer.freeze())
}

pub fn encode_subscribe_reply(count: u8) -> Bytes {
    Bytes::copy_from_slice(&[count])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        for command in [
            ErdCommand::Read,
            ErdCommand::Write,
            ErdCommand::Subscribe,
            ErdCommand::Publish,
        ] {
            assert_eq!(ErdCommand::from_command(command.code()), Some(command));
        }
        assert_eq!(ErdCommand::from_command(0x01), None);
        assert_eq!(ErdCommand::from_command(0xF0F0), None);
    }

    #[test]
    fn test_erd_list_conversions() {
        assert_eq!(ErdList::from(0x4003).as_slice(), &[0x4003]);
        assert_eq!(ErdList::from([1, 2]).len(), 2);
        assert_eq!(ErdList::from(vec![3u16]).into_vec(), vec![3]);
        assert!(ErdList::default().is_empty());
    }

    #[test]
    fn test_read_request() {
        let data = encode_erd_ids(&[0x4002, 0x4003]).unwrap();
        assert_eq!(data.as_ref(), &[0x02, 0x40, 0x02, 0x40, 0x03]);

        let frame = ErdFrame::classify(ErdCommand::Read, &data).unwrap();
        assert_eq!(frame, ErdFrame::ReadRequest(vec![0x4002, 0x4003]));
    }

    #[test]
    fn test_read_reply() {
        let data = [0x01, 0x40, 0x03, 0x01, 0x82];
        let frame = ErdFrame::classify(ErdCommand::Read, &data).unwrap();
        assert_eq!(
            frame,
            ErdFrame::ReadReply(vec![ErdRecord::new(0x4003, vec![0x82])])
        );
    }

    #[test]
    fn test_read_zero_count_is_reply() {
        let frame = ErdFrame::classify(ErdCommand::Read, &[0x00]).unwrap();
        assert_eq!(frame, ErdFrame::ReadReply(vec![]));
    }

    #[test]
    fn test_read_reply_truncated() {
        let data = [0x01, 0x40, 0x03, 0x04, 0x82];
        let result = ErdFrame::classify(ErdCommand::Read, &data);
        assert!(matches!(
            result,
            Err(ProtocolError::MalformedFrame { command: 0xF0, .. })
        ));
    }

    #[test]
    fn test_read_reply_trailing_bytes() {
        let data = [0x01, 0x40, 0x03, 0x01, 0x82, 0xFF];
        let result = ErdFrame::classify(ErdCommand::Read, &data);
        assert!(matches!(result, Err(ProtocolError::MalformedFrame { .. })));
    }

    #[test]
    fn test_empty_frames() {
        assert!(ErdFrame::classify(ErdCommand::Read, &[]).is_err());
        assert!(ErdFrame::classify(ErdCommand::Write, &[]).is_err());
        assert!(ErdFrame::classify(ErdCommand::Subscribe, &[]).is_err());
        assert_eq!(
            ErdFrame::classify(ErdCommand::Publish, &[]).unwrap(),
            ErdFrame::PublishAck
        );
    }

    #[test]
    fn test_write_request() {
        let data = encode_records(&[ErdRecord::new(0x4003, vec![0x8C])]).unwrap();
        assert_eq!(data.as_ref(), &[0x01, 0x40, 0x03, 0x01, 0x8C]);

        let frame = ErdFrame::classify(ErdCommand::Write, &data).unwrap();
        assert_eq!(
            frame,
            ErdFrame::WriteRequest(vec![ErdRecord::new(0x4003, vec![0x8C])])
        );
    }

    #[test]
    fn test_write_reply_shapes() {
        let data = encode_erd_ids(&[0x4003]).unwrap();
        let frame = ErdFrame::classify(ErdCommand::Write, &data).unwrap();
        assert_eq!(
            frame,
            ErdFrame::WriteReply {
                count: 1,
                erds: Some(vec![0x4003])
            }
        );

        // Count-only reply from devices that omit the ERD list.
        let frame = ErdFrame::classify(ErdCommand::Write, &[0x01]).unwrap();
        assert_eq!(frame, ErdFrame::WriteReply { count: 1, erds: None });

        let frame = ErdFrame::classify(ErdCommand::Write, &[0x00]).unwrap();
        assert_eq!(frame, ErdFrame::WriteReply { count: 0, erds: None });
    }

    #[test]
    fn test_subscribe_request_and_reply() {
        let items = [
            SubscribeItem {
                erd: 0x4002,
                time: 0,
            },
            SubscribeItem {
                erd: 0x4003,
                time: 10,
            },
        ];
        let data = encode_subscribe_request(&items).unwrap();
        assert_eq!(data.len(), 7);

        let frame = ErdFrame::classify(ErdCommand::Subscribe, &data).unwrap();
        assert_eq!(frame, ErdFrame::SubscribeRequest(items.to_vec()));

        let reply = encode_subscribe_reply(2);
        let frame = ErdFrame::classify(ErdCommand::Subscribe, &reply).unwrap();
        assert_eq!(frame, ErdFrame::SubscribeReply(2));
    }

    #[test]
    fn test_subscribe_bad_length() {
        let result = ErdFrame::classify(ErdCommand::Subscribe, &[0x02, 0x40, 0x02, 0x00]);
        assert!(matches!(
            result,
            Err(ProtocolError::MalformedFrame { command: 0xF2, .. })
        ));
    }

    #[test]
    fn test_publish_request() {
        let records = vec![
            ErdRecord::new(0x4002, vec![0x78]),
            ErdRecord::new(0x0001, b"GEH50".to_vec()),
        ];
        let data = encode_records(&records).unwrap();
        let frame = ErdFrame::classify(ErdCommand::Publish, &data).unwrap();
        assert_eq!(frame, ErdFrame::PublishRequest(records));
    }

    #[test]
    fn test_encode_limits() {
        let erds: Vec<Erd> = (0..256).collect();
        assert!(matches!(
            encode_erd_ids(&erds),
            Err(ProtocolError::TooManyItems(256))
        ));

        let record = ErdRecord::new(0x4003, vec![0u8; 256]);
        assert!(matches!(
            encode_records(&[record]),
            Err(ProtocolError::ValueTooLong(256))
        ));
    }
}
