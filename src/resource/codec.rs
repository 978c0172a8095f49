//! Broker wire framing: length-delimited frames carrying bincode payloads

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Encodes `Enc` values and decodes `Dec` values on one connection
pub struct BincodeCodec<Enc, Dec> {
    framing: LengthDelimitedCodec,
    _marker: PhantomData<fn(Enc) -> Dec>,
}

impl<Enc, Dec> BincodeCodec<Enc, Dec> {
    pub fn new() -> Self {
        Self {
            framing: LengthDelimitedCodec::new(),
            _marker: PhantomData,
        }
    }
}

impl<Enc, Dec> Default for BincodeCodec<Enc, Dec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Enc: Serialize, Dec> Encoder<Enc> for BincodeCodec<Enc, Dec> {
    type Error = io::Error;

    fn encode(&mut self, item: Enc, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = bincode::serialize(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.framing.encode(Bytes::from(bytes), dst)
    }
}

impl<Enc, Dec: DeserializeOwned> Decoder for BincodeCodec<Enc, Dec> {
    type Item = Dec;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framing.decode(src)? {
            Some(frame) => bincode::deserialize(&frame)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResourceError;

    #[test]
    fn test_partial_frame_waits_for_rest() {
        let mut encoder: BincodeCodec<ResourceError, ()> = BincodeCodec::new();
        let mut buf = BytesMut::new();
        encoder
            .encode(ResourceError::Unsatisfiable("8 cpus".into()), &mut buf)
            .unwrap();

        let mut decoder: BincodeCodec<(), ResourceError> = BincodeCodec::new();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(decoder.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        assert_eq!(
            decoder.decode(&mut partial).unwrap(),
            Some(ResourceError::Unsatisfiable("8 cpus".into()))
        );
    }

    #[test]
    fn test_garbage_is_invalid_data() {
        let mut framing = LengthDelimitedCodec::new();
        let mut buf = BytesMut::new();
        framing.encode(Bytes::from_static(&[0xff; 3]), &mut buf).unwrap();

        let mut decoder: BincodeCodec<(), ResourceError> = BincodeCodec::new();
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
