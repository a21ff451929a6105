use bytes::BytesMut;

/// A transformation applied to the reliable byte stream as a whole, e.g. compression. Outbound
///  data is encoded before it is split into packets, inbound data is decoded after reassembly.
///
/// Transforms see the stream in arbitrary chunks and must keep whatever state they need across
///  calls. An error is fatal for the connection.
pub trait StreamTransform: Send {
    fn encode(&mut self, input: &[u8], out: &mut BytesMut) -> anyhow::Result<()>;

    fn decode(&mut self, input: &[u8], out: &mut BytesMut) -> anyhow::Result<()>;
}

pub struct PassThrough;
impl StreamTransform for PassThrough {
    fn encode(&mut self, input: &[u8], out: &mut BytesMut) -> anyhow::Result<()> {
        out.extend_from_slice(input);
        Ok(())
    }

    fn decode(&mut self, input: &[u8], out: &mut BytesMut) -> anyhow::Result<()> {
        out.extend_from_slice(input);
        Ok(())
    }
}
