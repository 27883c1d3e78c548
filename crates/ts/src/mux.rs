use crate::packet::{SYNC_BYTE, TS_PACKET_SIZE};
use crate::pes::encode_timestamp;

const TS_HEADER_LEN: usize = 4;
const MAX_PAYLOAD: usize = TS_PACKET_SIZE - TS_HEADER_LEN;

/// Wrap an elementary stream payload into a PES packet and split it into TS
/// packets on `pid`.
///
/// `continuity_counter` is the next counter to use for this PID and is
/// advanced for every packet written. The last packet is padded with
/// adaptation field stuffing.
pub fn packetize_pes(
    pid: u16,
    stream_id: u8,
    pts: Option<u64>,
    payload: &[u8],
    continuity_counter: &mut u8,
) -> Vec<u8> {
    let header_data_len = if pts.is_some() { 5 } else { 0 };
    let pes_len = 3 + header_data_len + payload.len();

    let mut pes = Vec::with_capacity(9 + header_data_len + payload.len());
    pes.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    // Lengths above 16 bits are signalled as unbounded
    let length_field = u16::try_from(pes_len).unwrap_or(0);
    pes.extend_from_slice(&length_field.to_be_bytes());
    pes.push(0x80);
    pes.push(if pts.is_some() { 0x80 } else { 0x00 });
    pes.push(header_data_len as u8);
    if let Some(pts) = pts {
        pes.extend_from_slice(&encode_timestamp(pts));
    }
    pes.extend_from_slice(payload);

    let mut out = Vec::with_capacity(pes.len().div_ceil(MAX_PAYLOAD) * TS_PACKET_SIZE);
    let mut remaining = &pes[..];
    let mut first = true;

    while !remaining.is_empty() {
        let take = remaining.len().min(MAX_PAYLOAD);
        let stuffing = MAX_PAYLOAD - take;

        out.push(SYNC_BYTE);
        let start_flag: u8 = if first { 0x40 } else { 0x00 };
        out.push(start_flag | ((pid >> 8) as u8 & 0x1F));
        out.push(pid as u8);
        let adaptation_field_control = if stuffing > 0 { 0x30 } else { 0x10 };
        out.push(adaptation_field_control | (*continuity_counter & 0x0F));

        if stuffing > 0 {
            // One byte for the length itself, the rest is flags plus 0xFF fill
            let af_len = stuffing - 1;
            out.push(af_len as u8);
            if af_len > 0 {
                out.push(0x00);
                out.extend(std::iter::repeat_n(0xFF, af_len - 1));
            }
        }

        out.extend_from_slice(&remaining[..take]);
        remaining = &remaining[take..];
        *continuity_counter = (*continuity_counter + 1) & 0x0F;
        first = false;
    }

    out
}
