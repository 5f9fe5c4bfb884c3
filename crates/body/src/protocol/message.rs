use bytes::{Buf, Bytes};

/// An item of a body stream handed between tasks: a chunk of data or the end marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem<Data: Buf = Bytes> {
    /// A chunk of payload data
    Chunk(Data),
    /// Marks the end of the payload stream
    Eof,
}

impl<D: Buf> PayloadItem<D> {
    /// Returns true if this item represents the end of the payload stream
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, PayloadItem::Eof)
    }

    /// Returns true if this item contains chunk data
    #[inline]
    pub fn is_chunk(&self) -> bool {
        matches!(self, PayloadItem::Chunk(_))
    }

    /// Number of payload bytes carried by this item
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            PayloadItem::Chunk(data) => data.remaining(),
            PayloadItem::Eof => 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumes the PayloadItem and returns the contained data if this is a Chunk
    pub fn into_data(self) -> Option<D> {
        match self {
            PayloadItem::Chunk(data) => Some(data),
            PayloadItem::Eof => None,
        }
    }
}
