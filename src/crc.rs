use crc::Crc;

/// CRC-32 used for both the header and the payload checksums.
///
/// This is zlib's `crc32` (reflected 0x04C11DB7, init and xorout all ones),
/// which the `crc` crate ships as `CRC_32_ISO_HDLC`.
pub const PKT_CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
