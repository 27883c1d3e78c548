use crate::{Result, TsError};

/// Size of a single transport stream packet
pub const TS_PACKET_SIZE: usize = 188;

/// Every TS packet starts with this byte
pub const SYNC_BYTE: u8 = 0x47;

/// PAT PID (always 0x0000)
pub const PID_PAT: u16 = 0x0000;

/// NULL PID (always 0x1FFF)
pub const PID_NULL: u16 = 0x1FFF;

/// Borrowed view over one transport stream packet
#[derive(Debug, Clone, Copy)]
pub struct TsPacket<'a> {
    /// Transport Error Indicator
    pub transport_error_indicator: bool,
    /// Payload Unit Start Indicator
    pub payload_unit_start_indicator: bool,
    /// Packet Identifier
    pub pid: u16,
    /// Transport Scrambling Control
    pub transport_scrambling_control: u8,
    /// Adaptation Field Control
    pub adaptation_field_control: u8,
    /// Continuity Counter
    pub continuity_counter: u8,
    /// Adaptation field data, without the length byte
    pub adaptation_field: Option<&'a [u8]>,
    /// Payload data
    pub payload: Option<&'a [u8]>,
}

impl<'a> TsPacket<'a> {
    /// Parse a TS packet from exactly 188 bytes
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() != TS_PACKET_SIZE {
            return Err(TsError::InvalidPacketSize(data.len()));
        }

        if data[0] != SYNC_BYTE {
            return Err(TsError::InvalidSyncByte(data[0]));
        }

        let byte1 = data[1];
        let byte2 = data[2];
        let byte3 = data[3];

        let transport_error_indicator = (byte1 & 0x80) != 0;
        let payload_unit_start_indicator = (byte1 & 0x40) != 0;
        let pid = ((byte1 as u16 & 0x1F) << 8) | byte2 as u16;

        let transport_scrambling_control = (byte3 >> 6) & 0x03;
        let adaptation_field_control = (byte3 >> 4) & 0x03;
        let continuity_counter = byte3 & 0x0F;

        let mut offset = 4;
        let mut adaptation_field = None;

        if adaptation_field_control & 0x02 != 0 {
            let length = data[offset] as usize;
            offset += 1;
            if offset + length > TS_PACKET_SIZE {
                return Err(TsError::InvalidAdaptationField(length));
            }
            if length > 0 {
                adaptation_field = Some(&data[offset..offset + length]);
            }
            offset += length;
        }

        let payload = if adaptation_field_control & 0x01 != 0 && offset < TS_PACKET_SIZE {
            Some(&data[offset..])
        } else {
            None
        };

        Ok(TsPacket {
            transport_error_indicator,
            payload_unit_start_indicator,
            pid,
            transport_scrambling_control,
            adaptation_field_control,
            continuity_counter,
            adaptation_field,
            payload,
        })
    }

    /// Check if this packet carries payload bytes
    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// The discontinuity indicator lives in bit 7 of the adaptation field flags
    pub fn discontinuity_indicator(&self) -> bool {
        self.adaptation_field
            .and_then(|af| af.first())
            .is_some_and(|flags| flags & 0x80 != 0)
    }

    /// Check if this packet contains a random access indicator
    pub fn random_access_indicator(&self) -> bool {
        self.adaptation_field
            .and_then(|af| af.first())
            .is_some_and(|flags| flags & 0x40 != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_sync_byte() {
        let mut data = vec![0u8; 188];
        data[0] = 0x46;
        assert_eq!(
            TsPacket::parse(&data).unwrap_err(),
            TsError::InvalidSyncByte(0x46)
        );
    }

    #[test]
    fn test_invalid_size() {
        let data = vec![0x47u8; 100];
        assert_eq!(
            TsPacket::parse(&data).unwrap_err(),
            TsError::InvalidPacketSize(100)
        );
    }

    #[test]
    fn test_payload_only_packet() {
        let mut data = vec![0xAAu8; 188];
        data[0] = 0x47;
        data[1] = 0x41; // PUSI, PID high = 1
        data[2] = 0x00; // PID low
        data[3] = 0x17; // payload only, continuity = 7

        let packet = TsPacket::parse(&data).unwrap();
        assert!(packet.payload_unit_start_indicator);
        assert!(!packet.transport_error_indicator);
        assert_eq!(packet.pid, 0x100);
        assert_eq!(packet.adaptation_field_control, 1);
        assert_eq!(packet.continuity_counter, 7);
        assert!(packet.adaptation_field.is_none());
        assert_eq!(packet.payload.unwrap().len(), 184);
    }

    #[test]
    fn test_adaptation_field_with_payload() {
        let mut data = vec![0xFFu8; 188];
        data[0] = 0x47;
        data[1] = 0x01;
        data[2] = 0x00;
        data[3] = 0x30; // adaptation + payload
        data[4] = 10; // adaptation field length
        data[5] = 0xC0; // discontinuity + random access

        let packet = TsPacket::parse(&data).unwrap();
        assert!(packet.discontinuity_indicator());
        assert!(packet.random_access_indicator());
        assert_eq!(packet.adaptation_field.unwrap().len(), 10);
        assert_eq!(packet.payload.unwrap().len(), 188 - 4 - 1 - 10);
    }

    #[test]
    fn test_oversized_adaptation_field() {
        let mut data = vec![0u8; 188];
        data[0] = 0x47;
        data[3] = 0x20; // adaptation only
        data[4] = 190;
        assert_eq!(
            TsPacket::parse(&data).unwrap_err(),
            TsError::InvalidAdaptationField(190)
        );
    }
}
