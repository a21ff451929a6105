use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::stream_seq::StreamSeq;

/// The first byte of every Connectless datagram
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DatagramKind {
    Hello = 0,
    Reliable = 1,
    Unreliable = 2,
    Ack = 3,
    Close = 4,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HelloHeader {
    pub protocol_version: u8,
    /// the sender's maximum datagram size, for diagnostics
    pub mtu: u32,
}

impl HelloHeader {
    pub const PROTOCOL_VERSION_1: u8 = 1;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(DatagramKind::Hello.into());
        buf.put_u8(self.protocol_version);
        buf.put_u32_varint(self.mtu);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<HelloHeader> {
        let protocol_version = buf.try_get_u8()?;
        let mtu = buf.try_get_u32_varint()?;
        Ok(HelloHeader { protocol_version, mtu })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReliableHeader {
    pub age: u8,
    pub seq: StreamSeq,
}

impl ReliableHeader {
    pub const SERIALIZED_LEN: usize = crate::config::RELIABLE_HEADER_LEN;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(DatagramKind::Reliable.into());
        buf.put_u8(self.age);
        buf.put_u64(self.seq.to_raw());
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<ReliableHeader> {
        let age = buf.try_get_u8()?;
        let seq = buf.try_get_u64()?;
        Ok(ReliableHeader { age, seq: StreamSeq::from_raw(seq) })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct UnreliableHeader {
    pub baseline: u32,
    pub counter: u32,
    pub opcode: u16,
}

impl UnreliableHeader {
    pub const SERIALIZED_LEN: usize = crate::config::UNRELIABLE_HEADER_LEN;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(DatagramKind::Unreliable.into());
        buf.put_u32(self.baseline);
        buf.put_u32(self.counter);
        buf.put_u16(self.opcode);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<UnreliableHeader> {
        let baseline = buf.try_get_u32()?;
        let counter = buf.try_get_u32()?;
        let opcode = buf.try_get_u16()?;
        Ok(UnreliableHeader { baseline, counter, opcode })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AckHeader {
    /// echo of the acknowledged transmission's age
    pub age: u8,
    pub seq: StreamSeq,
    /// the receiver's base: everything below this is acknowledged
    pub una: StreamSeq,
}

impl AckHeader {
    pub const SERIALIZED_LEN: usize = 1 + 1 + 8 + 8;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(DatagramKind::Ack.into());
        buf.put_u8(self.age);
        buf.put_u64(self.seq.to_raw());
        buf.put_u64(self.una.to_raw());
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<AckHeader> {
        let age = buf.try_get_u8()?;
        let seq = buf.try_get_u64()?;
        let una = buf.try_get_u64()?;
        Ok(AckHeader {
            age,
            seq: StreamSeq::from_raw(seq),
            una: StreamSeq::from_raw(una),
        })
    }
}

/// A parsed inbound datagram. Payloads borrow from the received buffer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Datagram<'a> {
    Hello(HelloHeader),
    Reliable(ReliableHeader, &'a [u8]),
    Unreliable(UnreliableHeader, &'a [u8]),
    Ack(AckHeader),
    Close,
}

impl<'a> Datagram<'a> {
    pub fn kind(&self) -> DatagramKind {
        match self {
            Datagram::Hello(_) => DatagramKind::Hello,
            Datagram::Reliable(..) => DatagramKind::Reliable,
            Datagram::Unreliable(..) => DatagramKind::Unreliable,
            Datagram::Ack(_) => DatagramKind::Ack,
            Datagram::Close => DatagramKind::Close,
        }
    }

    /// Parses a datagram, failing for unknown tags and truncated headers. Trailing bytes after
    ///  fixed-size datagrams are ignored.
    pub fn deser(mut buf: &'a [u8]) -> anyhow::Result<Datagram<'a>> {
        let kind = DatagramKind::try_from(buf.try_get_u8()?)?;
        let result = match kind {
            DatagramKind::Hello => Datagram::Hello(HelloHeader::deser(&mut buf)?),
            DatagramKind::Reliable => {
                let header = ReliableHeader::deser(&mut buf)?;
                Datagram::Reliable(header, buf)
            }
            DatagramKind::Unreliable => {
                let header = UnreliableHeader::deser(&mut buf)?;
                Datagram::Unreliable(header, buf)
            }
            DatagramKind::Ack => Datagram::Ack(AckHeader::deser(&mut buf)?),
            DatagramKind::Close => Datagram::Close,
        };
        Ok(result)
    }
}

pub fn ser_close(buf: &mut BytesMut) {
    buf.put_u8(DatagramKind::Close.into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_reliable_wire_format() {
        let mut buf = BytesMut::new();
        ReliableHeader { age: 2, seq: StreamSeq::from_raw(0x0102) }.ser(&mut buf);
        buf.put_slice(b"xyz");

        assert_eq!(buf.as_ref(), &[1, 2, 0, 0, 0, 0, 0, 0, 1, 2, b'x', b'y', b'z']);
        assert_eq!(Datagram::deser(&buf).unwrap(),
                   Datagram::Reliable(ReliableHeader { age: 2, seq: StreamSeq::from_raw(0x0102) }, b"xyz"));
    }

    #[test]
    fn test_unreliable_wire_format() {
        let mut buf = BytesMut::new();
        UnreliableHeader { baseline: 5, counter: 7, opcode: 0x0304 }.ser(&mut buf);
        buf.put_slice(b"a");

        assert_eq!(buf.as_ref(), &[2, 0, 0, 0, 5, 0, 0, 0, 7, 3, 4, b'a']);
        assert_eq!(buf.len(), UnreliableHeader::SERIALIZED_LEN + 1);
        assert_eq!(Datagram::deser(&buf).unwrap(),
                   Datagram::Unreliable(UnreliableHeader { baseline: 5, counter: 7, opcode: 0x0304 }, b"a"));
    }

    #[test]
    fn test_ack_wire_format() {
        let header = AckHeader { age: 1, seq: StreamSeq::from_raw(1390), una: StreamSeq::from_raw(2780) };
        let mut buf = BytesMut::new();
        header.ser(&mut buf);

        assert_eq!(buf.len(), AckHeader::SERIALIZED_LEN);
        assert_eq!(buf[0], 3);
        assert_eq!(Datagram::deser(&buf).unwrap(), Datagram::Ack(header));
    }

    #[test]
    fn test_hello_and_close() {
        let hello = HelloHeader { protocol_version: HelloHeader::PROTOCOL_VERSION_1, mtu: 1400 };
        let mut buf = BytesMut::new();
        hello.ser(&mut buf);
        assert_eq!(Datagram::deser(&buf).unwrap(), Datagram::Hello(hello));

        let mut buf = BytesMut::new();
        ser_close(&mut buf);
        assert_eq!(Datagram::deser(&buf).unwrap().kind(), DatagramKind::Close);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::unknown_tag(vec![9, 1, 2, 3])]
    #[case::truncated_reliable(vec![1, 0, 0, 0, 0])]
    #[case::truncated_unreliable(vec![2, 0, 0, 0, 1, 0, 0])]
    #[case::truncated_ack(vec![3, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0])]
    #[case::truncated_hello(vec![0])]
    fn test_malformed(#[case] raw: Vec<u8>) {
        assert!(Datagram::deser(&raw).is_err());
    }

    #[test]
    fn test_empty_reliable_payload() {
        let raw = [1u8, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(Datagram::deser(&raw).unwrap(),
                   Datagram::Reliable(ReliableHeader { age: 0, seq: StreamSeq::ZERO }, &[]));
    }
}
