use std::{error, fmt::Debug};

use bytes::BufMut;

/// A keyed record.
///
/// The key is totally ordered and drives both the placement of the record in
/// the file chain and the names of rotated files; the value is opaque to the
/// log itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record<K, V> {
    key: K,
    value: V,
}

impl<K, V> Record<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    /// Consumes the record, returning its key and value.
    pub fn into_parts(self) -> (K, V) {
        (self.key, self.value)
    }
}

/// Key and record codec for a changelog.
///
/// The parser centralizes all key-specific behavior: the total order (via the
/// `Ord` bound on [`RecordParser::Key`]), the string encoding used in rotated
/// file names, the byte codec for record payloads, and the `max_key` sentinel
/// under which the head file is indexed.
///
/// # Contract
///
/// - `decode_key_from_string(encode_key_to_string(k)) == k` for every key
///   that will ever be appended.
/// - The string encoding collates like the key order over the expected key
///   universe, and contains neither `_` nor `.` -- both are reserved by the
///   rotated-file naming scheme.  Rotation checks this and fails with
///   [`InvalidKeyEncoding`](crate::ChangelogError::InvalidKeyEncoding) if the
///   contract is broken.
/// - `max_key()` is strictly greater than any key that will ever be appended.
pub trait RecordParser: Send + Sync + 'static {
    type Key: Ord + Clone + Debug + Send + Sync + 'static;
    type Value: Clone + Debug + Send + Sync + 'static;

    /// Error produced when decoding a key string or a record payload.
    type DecodeError: error::Error + Send + Sync + 'static;

    /// Encodes a key into the string form used in rotated file names.
    fn encode_key_to_string(&self, key: &Self::Key) -> String;

    /// Decodes a key from its file-name string form.
    fn decode_key_from_string(&self, encoded: &str) -> Result<Self::Key, Self::DecodeError>;

    /// A sentinel key strictly greater than any key that will ever be
    /// appended.  The head file is indexed under this sentinel.
    fn max_key(&self) -> Self::Key;

    /// Encodes a record into its payload byte form.
    ///
    /// Framing (length prefix, checksum) is handled by the log file layer;
    /// the parser only produces the payload bytes.
    fn encode_record<B: BufMut>(&self, record: &Record<Self::Key, Self::Value>, buffer: &mut B);

    /// Decodes a record from the payload bytes produced by `encode_record`.
    fn decode_record(&self, payload: &[u8])
        -> Result<Record<Self::Key, Self::Value>, Self::DecodeError>;
}
