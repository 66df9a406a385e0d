/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// This is the only block length we're dealing with (except for possibly the
/// last block).  It is the widely used and accepted 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// Identifies a torrent's storage within the disk core.
///
/// Ids are assigned when the torrent is registered with the disk handle and
/// are never reused for the lifetime of that handle.
pub type StorageId = usize;
