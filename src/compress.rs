// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! CMS CompressedData generation and parsing.

Compression is zlib, the only algorithm RFC 3274 registers. Content
flows through the codec streams; the only materialized buffer is the
compressed image, so memory stays bounded by the smaller side of the
transform.
*/

use {
    crate::{
        asn1::{
            rfc3274::{
                CompressedData, CompressionAlgorithmIdentifier, OID_ZLIB_COMPRESSION,
            },
            rfc5652::{CmsVersion, EncapsulatedContentInfo, OID_ID_DATA},
        },
        CmsError, SecureMimeError,
    },
    bcder::{encode::Values, Mode, OctetString, Oid},
    bytes::Bytes,
    flate2::{
        write::{ZlibDecoder, ZlibEncoder},
        Compression,
    },
    std::io::{Read, Write},
};

/// Compress a content stream into a CMS CompressedData document.
///
/// The DER document is written to `writer`. Neither stream is closed.
pub fn compress(reader: &mut impl Read, writer: &mut impl Write) -> Result<(), SecureMimeError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    std::io::copy(reader, &mut encoder)?;
    let compressed = encoder.finish()?;

    let compressed_data = CompressedData {
        version: CmsVersion::V0,
        compression_algorithm: CompressionAlgorithmIdentifier {
            algorithm: Oid(Bytes::copy_from_slice(OID_ZLIB_COMPRESSION.as_ref())),
        },
        content_info: EncapsulatedContentInfo {
            content_type: Oid(Bytes::copy_from_slice(OID_ID_DATA.as_ref())),
            content: Some(OctetString::new(Bytes::from(compressed))),
        },
    };

    compressed_data
        .encode_ref()
        .write_encoded(Mode::Der, writer)
        .map_err(CmsError::Io)?;

    Ok(())
}

/// Expand a CMS CompressedData document back into its content.
///
/// The decompressed content is written to `writer`. Neither stream is
/// closed.
pub fn decompress(reader: &mut impl Read, writer: &mut impl Write) -> Result<(), SecureMimeError> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;

    let compressed_data = CompressedData::decode_ber(&data).map_err(CmsError::from)?;

    if compressed_data.compression_algorithm.algorithm != OID_ZLIB_COMPRESSION {
        return Err(SecureMimeError::NotSupported(format!(
            "compression algorithm {}",
            compressed_data.compression_algorithm.algorithm
        )));
    }

    let content = compressed_data
        .content_info
        .content
        .ok_or(CmsError::MissingContent)?;

    let mut decoder = ZlibDecoder::new(writer);
    decoder.write_all(content.to_bytes().as_ref())?;
    decoder.finish()?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(content: &[u8]) -> Vec<u8> {
        let mut blob = Vec::new();
        compress(&mut std::io::Cursor::new(content), &mut blob).unwrap();

        let mut out = Vec::new();
        decompress(&mut std::io::Cursor::new(&blob), &mut out).unwrap();

        out
    }

    #[test]
    fn simple_roundtrip() {
        assert_eq!(roundtrip(b"Hello\r\n"), b"Hello\r\n");
    }

    #[test]
    fn empty_roundtrip() {
        assert_eq!(roundtrip(b""), b"");
    }

    #[test]
    fn large_incompressible_roundtrip() {
        // 1 MiB of pseudorandom octets. The compressed image may slightly
        // exceed the input, but not meaningfully.
        let mut content = vec![0u8; 1024 * 1024];
        let mut state = 0x2545f4914f6cdd1du64;
        for byte in content.iter_mut() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *byte = state as u8;
        }

        let mut blob = Vec::new();
        compress(&mut std::io::Cursor::new(&content), &mut blob).unwrap();
        assert!(blob.len() < content.len() + content.len() / 100);

        let mut out = Vec::new();
        decompress(&mut std::io::Cursor::new(&blob), &mut out).unwrap();
        assert_eq!(out, content);
    }

    #[test]
    fn compressible_content_shrinks() {
        let content = vec![b'a'; 64 * 1024];

        let mut blob = Vec::new();
        compress(&mut std::io::Cursor::new(&content), &mut blob).unwrap();
        assert!(blob.len() < content.len() / 10);
    }
}
