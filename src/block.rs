//! §4.5 block-size derivation and the `FileSegment` on-wire framing
//! overhead it has to account for.

use crate::error::{Result, TransferError};

/// IPv4 header size (no options).
pub const IPV4_HEADER: usize = 20;
/// IPv6 fixed header size.
pub const IPV6_HEADER: usize = 40;
/// UDP header size.
pub const UDP_HEADER: usize = 8;

/// `FileSegment` framing overhead on the multicast datagram path: tag byte
/// (1) + `segment_id` varint (worst case 8 bytes) + payload-length varint
/// prefix (worst case 2 bytes for block sizes under 16 KiB, which every
/// realistic MTU-derived block size is). See `wire.rs::Message::encode`
/// for the `FileSegment` layout this mirrors.
pub const FILE_SEGMENT_FRAMING_OVERHEAD: usize = 1 + 8 + 2;

/// A payload encoder used both for the PSK challenge exchange and for
/// encoding block payloads (§2 C2). `block.rs` only needs to know how much
/// bigger the encoded form of a plaintext chunk is; `crypto.rs` supplies
/// the concrete AEAD implementation.
pub trait PayloadEncoder {
    /// Size in bytes of `encode(plaintext)` for a plaintext of length
    /// `usable_len`. Must be monotonically non-decreasing in `usable_len`.
    fn encoded_length(&self, usable_len: usize) -> usize;
}

/// Derive `block_size` from MTU and IP version (§4.5).
///
/// `raw_block = MTU - ip_header - udp_header - framing_overhead`. If an
/// encoder is configured, scan downward from `raw_block` for the largest
/// `usable_block` such that `encoder.encoded_length(usable_block) <=
/// raw_block`. Fails `ConfigInvalid` if no positive size fits.
pub fn derive_block_size(mtu: usize, ipv6: bool, encoder: Option<&dyn PayloadEncoder>) -> Result<u32> {
    let ip_header = if ipv6 { IPV6_HEADER } else { IPV4_HEADER };
    let overhead = ip_header + UDP_HEADER + FILE_SEGMENT_FRAMING_OVERHEAD;
    if mtu <= overhead {
        return Err(TransferError::ConfigInvalid(format!(
            "mtu {mtu} too small for overhead {overhead}"
        )));
    }
    let raw_block = mtu - overhead;

    let usable_block = match encoder {
        None => raw_block,
        Some(enc) => {
            let mut candidate = raw_block;
            loop {
                if candidate == 0 {
                    return Err(TransferError::ConfigInvalid(format!(
                        "no usable block size fits raw_block={raw_block} with configured encoder"
                    )));
                }
                if enc.encoded_length(candidate) <= raw_block {
                    break candidate;
                }
                candidate -= 1;
            }
        }
    };

    if usable_block == 0 {
        return Err(TransferError::ConfigInvalid("derived block size is zero".into()));
    }
    Ok(usable_block as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedOverheadEncoder {
        overhead: usize,
    }

    impl PayloadEncoder for FixedOverheadEncoder {
        fn encoded_length(&self, usable_len: usize) -> usize {
            usable_len + self.overhead
        }
    }

    #[test]
    fn no_encoder_uses_raw_block_directly() {
        let size = derive_block_size(1500, false, None).unwrap();
        assert_eq!(size as usize, 1500 - IPV4_HEADER - UDP_HEADER - FILE_SEGMENT_FRAMING_OVERHEAD);
    }

    #[test]
    fn ipv6_has_larger_header_overhead_than_ipv4() {
        let v4 = derive_block_size(1500, false, None).unwrap();
        let v6 = derive_block_size(1500, true, None).unwrap();
        assert!(v6 < v4);
        assert_eq!((v4 - v6) as usize, IPV6_HEADER - IPV4_HEADER);
    }

    #[test]
    fn encoder_overhead_shrinks_usable_block_and_fits() {
        let encoder = FixedOverheadEncoder { overhead: 16 };
        let raw_block = 1500 - IPV4_HEADER - UDP_HEADER - FILE_SEGMENT_FRAMING_OVERHEAD;
        let usable = derive_block_size(1500, false, Some(&encoder)).unwrap() as usize;
        assert!(usable < raw_block);
        assert!(encoder.encoded_length(usable) <= raw_block);
        assert!(encoder.encoded_length(usable + 1) > raw_block);
    }

    #[test]
    fn mtu_too_small_is_config_invalid() {
        let err = derive_block_size(20, false, None).unwrap_err();
        assert!(matches!(err, TransferError::ConfigInvalid(_)));
    }
}
