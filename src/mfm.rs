//! MFM / FM のセル符号化
//!
//! 16セルの窓を「クロック, データ」の順に並べて扱う（ビット15がクロック）。

/// MFM A1 同期マーク（クロック欠落）
pub const MFM_SYNC_A1: u16 = 0x4489;
/// MFM C2 インデックスマーク
pub const MFM_SYNC_C2: u16 = 0x5224;

/// FM アドレスマークのクロックパターン
pub const FM_MARK_CLOCK: u8 = 0xc7;
/// FM IDアドレスマーク (FE / C7)
pub const FM_IDAM: u16 = 0xf57e;
/// FM データアドレスマーク (FB / C7)
pub const FM_DAM: u16 = 0xf56f;
/// FM 削除データアドレスマーク (F8 / C7)
pub const FM_DDAM: u16 = 0xf56a;

/// 8ビットのクロックとデータを16セルに交互配置
pub fn interleave(clock: u8, data: u8) -> u16 {
    let mut raw = 0u16;
    for bit in (0..8).rev() {
        raw = raw << 1 | (clock >> bit & 1) as u16;
        raw = raw << 1 | (data >> bit & 1) as u16;
    }
    raw
}

/// データビット（偶数位置）を取り出す
pub fn data_bits(raw: u16) -> u8 {
    let mut data = 0u8;
    for bit in (0..8).rev() {
        data = data << 1 | (raw >> (bit * 2) & 1) as u8;
    }
    data
}

/// クロックビット（奇数位置）を取り出す
pub fn clock_bits(raw: u16) -> u8 {
    data_bits(raw >> 1)
}

/// MFM符号化。`prev_bit` は直前のデータビット
pub fn mfm_encode(data: u8, prev_bit: bool) -> u16 {
    let mut raw = 0u16;
    let mut prev = prev_bit;
    for bit in (0..8).rev() {
        let d = data >> bit & 1 != 0;
        let clock = !prev && !d;
        raw = raw << 2 | (clock as u16) << 1 | d as u16;
        prev = d;
    }
    raw
}

/// FM符号化（通常データはクロック 0xFF）
pub fn fm_encode(data: u8, clock: u8) -> u16 {
    interleave(clock, data)
}

/// MFM規則違反（隣接する1）
pub fn mfm_violation(raw: u16) -> bool {
    raw & (raw >> 1) != 0
}

/// FM規則違反（クロック欠落）
pub fn fm_violation(raw: u16) -> bool {
    clock_bits(raw) != 0xff
}

/// CRC-CCITT の初期値
pub const CRC_PRESET: u16 = 0xffff;

/// CRC-CCITT（x^16 + x^12 + x^5 + 1、MSBから）に1バイト加える
pub fn crc_ccitt(crc: u16, data: u8) -> u16 {
    let mut crc = crc ^ (data as u16) << 8;
    for _ in 0..8 {
        crc = if crc & 0x8000 != 0 { crc << 1 ^ 0x1021 } else { crc << 1 };
    }
    crc
}

/// バイト列のCRC
pub fn crc_ccitt_bytes(crc: u16, data: &[u8]) -> u16 {
    data.iter().fold(crc, |crc, &b| crc_ccitt(crc, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_a1_mark() {
        // 通常のA1はクロックが立つ位置に1がある
        let normal = mfm_encode(0xa1, false);
        assert_eq!(data_bits(normal), 0xa1);
        assert_ne!(normal, MFM_SYNC_A1);
        assert_eq!(normal & !0x0020, MFM_SYNC_A1);
        assert_eq!(data_bits(MFM_SYNC_A1), 0xa1);
        assert!(!mfm_violation(MFM_SYNC_A1));
    }

    #[test]
    fn test_fm_marks() {
        assert_eq!(fm_encode(0xfe, FM_MARK_CLOCK), FM_IDAM);
        assert_eq!(fm_encode(0xfb, FM_MARK_CLOCK), FM_DAM);
        assert_eq!(fm_encode(0xf8, FM_MARK_CLOCK), FM_DDAM);
        assert!(fm_violation(FM_IDAM));
        assert!(!fm_violation(fm_encode(0x00, 0xff)));
    }

    #[test]
    fn test_mfm_clock_rules() {
        for b in 0..=255u8 {
            for prev in [false, true] {
                let raw = mfm_encode(b, prev);
                assert_eq!(data_bits(raw), b);
                assert!(!mfm_violation(raw));
            }
        }
        assert!(mfm_violation(0x0003));
    }

    #[test]
    fn test_crc_ccitt() {
        assert_eq!(crc_ccitt_bytes(CRC_PRESET, b"123456789"), 0x29b1);
        assert_eq!(crc_ccitt(CRC_PRESET, 0xa1), 0x443b);
        assert_eq!(crc_ccitt_bytes(CRC_PRESET, &[0xa1, 0xa1, 0xa1]), 0xcdb4);

        // CRCを後ろに付けると剰余は0
        let id = [0xa1, 0xa1, 0xa1, 0xfe, 0x00, 0x00, 0x01, 0x02];
        let crc = crc_ccitt_bytes(CRC_PRESET, &id);
        assert_eq!(crc, 0xca6f);
        assert_eq!(crc_ccitt_bytes(crc, &[(crc >> 8) as u8, crc as u8]), 0);
    }
}
