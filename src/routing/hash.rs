/// Size of the slot space. Slots are `0..MAX_SLOT`.
pub const MAX_SLOT: u32 = 65536;

const CRC16_TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC16/XMODEM (poly 0x1021, init 0, no reflection).
pub fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |crc, &b| {
        (crc << 8) ^ CRC16_TABLE[(((crc >> 8) ^ b as u16) & 0x00FF) as usize]
    })
}

/// Slot a key routes to. Used only for partition selection.
pub fn slot_of(key: &[u8]) -> u32 {
    crc16(key) as u32
}
