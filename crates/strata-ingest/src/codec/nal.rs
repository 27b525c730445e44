//! # NAL Unit Inspection
//!
//! Just enough H.264 / H.265 NAL header parsing to flag decoded video units
//! as keyframes. Elementary streams out of PS/TS are Annex B framed
//! (`00 00 01` or `00 00 00 01` start codes).

/// NAL header syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalSyntax {
    H264,
    H265,
}

/// Coarse NAL unit classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalClass {
    /// SPS / PPS / VPS.
    ParameterSet,
    /// IDR (H.264) or IRAP (H.265: BLA, IDR, CRA).
    Keyframe,
    /// Any other slice.
    Slice,
    /// SEI, AUD, filler and everything else.
    Other,
}

/// Parsed NAL header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalHeader {
    pub nal_type: u8,
    pub class: NalClass,
}

/// Parse the NAL header at the start of `nal` (start code already removed).
///
/// H.264 header is 1 byte: `forbidden(1) | nal_ref_idc(2) | nal_type(5)`.
/// H.265 header is 2 bytes: `forbidden(1) | nal_type(6) | layer_id(6) | tid(3)`.
pub fn parse_header(nal: &[u8], syntax: NalSyntax) -> Option<NalHeader> {
    match syntax {
        NalSyntax::H264 => {
            let nal_type = nal.first()? & 0x1F;
            let class = match nal_type {
                7 | 8 | 13 => NalClass::ParameterSet,
                5 => NalClass::Keyframe,
                1..=4 => NalClass::Slice,
                _ => NalClass::Other,
            };
            Some(NalHeader { nal_type, class })
        }
        NalSyntax::H265 => {
            if nal.len() < 2 {
                return None;
            }
            let nal_type = (nal[0] >> 1) & 0x3F;
            let class = match nal_type {
                32..=34 => NalClass::ParameterSet,
                16..=21 => NalClass::Keyframe,
                0..=9 => NalClass::Slice,
                _ => NalClass::Other,
            };
            Some(NalHeader { nal_type, class })
        }
    }
}

/// Iterate over the NAL headers of an Annex B buffer.
pub fn scan_annex_b(data: &[u8], syntax: NalSyntax) -> impl Iterator<Item = NalHeader> + '_ {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        while pos + 3 <= data.len() {
            if data[pos] == 0 && data[pos + 1] == 0 && data[pos + 2] == 1 {
                let start = pos + 3;
                pos = start;
                if let Some(header) = data.get(start..).and_then(|nal| parse_header(nal, syntax)) {
                    return Some(header);
                }
            } else {
                pos += 1;
            }
        }
        None
    })
}

/// Whether the buffer carries a random access point.
pub fn contains_keyframe(data: &[u8], syntax: NalSyntax) -> bool {
    scan_annex_b(data, syntax).any(|h| h.class == NalClass::Keyframe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_header_classes() {
        assert_eq!(parse_header(&[0x67], NalSyntax::H264).unwrap().class, NalClass::ParameterSet);
        assert_eq!(parse_header(&[0x68], NalSyntax::H264).unwrap().class, NalClass::ParameterSet);
        let idr = parse_header(&[0x65], NalSyntax::H264).unwrap();
        assert_eq!(idr.nal_type, 5);
        assert_eq!(idr.class, NalClass::Keyframe);
        assert_eq!(parse_header(&[0x41], NalSyntax::H264).unwrap().class, NalClass::Slice);
        assert_eq!(parse_header(&[0x06], NalSyntax::H264).unwrap().class, NalClass::Other);
        assert!(parse_header(&[], NalSyntax::H264).is_none());
    }

    #[test]
    fn h265_header_classes() {
        // type 32 (VPS) → 0x40
        assert_eq!(parse_header(&[0x40, 0x01], NalSyntax::H265).unwrap().class, NalClass::ParameterSet);
        // type 19 (IDR_W_RADL) → 0x26
        let idr = parse_header(&[0x26, 0x01], NalSyntax::H265).unwrap();
        assert_eq!(idr.nal_type, 19);
        assert_eq!(idr.class, NalClass::Keyframe);
        // type 21 (CRA) → 0x2A
        assert_eq!(parse_header(&[0x2A, 0x01], NalSyntax::H265).unwrap().class, NalClass::Keyframe);
        // type 1 (TRAIL_R) → 0x02
        assert_eq!(parse_header(&[0x02, 0x01], NalSyntax::H265).unwrap().class, NalClass::Slice);
        assert!(parse_header(&[0x42], NalSyntax::H265).is_none());
    }

    #[test]
    fn annex_b_scan_mixed_start_codes() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0xAA, // SPS
            0x00, 0x00, 0x01, 0x68, 0xBB, // PPS
            0x00, 0x00, 0x01, 0x65, 0xCC, 0xDD, // IDR
        ];
        let classes: Vec<_> = scan_annex_b(&data, NalSyntax::H264).map(|h| h.class).collect();
        assert_eq!(
            classes,
            vec![NalClass::ParameterSet, NalClass::ParameterSet, NalClass::Keyframe]
        );
        assert!(contains_keyframe(&data, NalSyntax::H264));
    }

    #[test]
    fn p_slice_is_not_keyframe() {
        let data = [0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x00];
        assert!(!contains_keyframe(&data, NalSyntax::H264));
        assert!(!contains_keyframe(&[], NalSyntax::H264));
    }
}
