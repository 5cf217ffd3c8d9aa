//! GCRデコードROM（2048バイト）
//!
//! 読み取り側アドレス: `0x400 | シフトレジスタ(10bit)`
//! 書き込み側アドレス: `0x200 | (wd & 0xf0) << 1 | wrsync << 4 | (wd & 0x0f)`
//!
//! ROM出力 e とアドレス i を組み合わせてバイト／コード語を作る。
//! i のビット2とビット7は5ビット符号のビット2と一致するのでROMを通らない。

use std::borrow::Cow;
use std::fs;
use std::path::Path;

use crate::error::FdcError;

pub const GCR_ROM_SIZE: usize = 0x800;

/// 読み取り側出力: 有効なコード語
pub const GCR_VALID: u8 = 0x08;

const READ_BASE: u16 = 0x400;
const WRITE_BASE: u16 = 0x200;

/// 1コード語のビット数
pub const GCR_CODE_BITS: u32 = 10;

/// 同期パターン（10ビットすべて1）
pub const GCR_SYNC_PATTERN: u16 = 0x3ff;

/// 4ビット → 5ビット符号
pub const GCR_NIBBLE_CODES: [u8; 16] = [
    0x0a, 0x0b, 0x12, 0x13, 0x0e, 0x0f, 0x16, 0x17,
    0x09, 0x19, 0x1a, 0x1b, 0x0d, 0x1d, 0x1e, 0x15,
];

const fn nibble_of(code: u8) -> Option<u8> {
    let mut n = 0;
    while n < 16 {
        if GCR_NIBBLE_CODES[n] == code {
            return Some(n as u8);
        }
        n += 1;
    }
    None
}

/// 書き込み側ROMアドレス
#[inline]
pub const fn write_index(data: u8, wrsync: bool) -> u16 {
    WRITE_BASE | ((data as u16) & 0xf0) << 1 | (wrsync as u16) << 4 | (data as u16) & 0x0f
}

/// 読み取り側ROMアドレス
#[inline]
pub const fn read_index(shift_reg: u16) -> u16 {
    READ_BASE | (shift_reg & 0x3ff)
}

/// ROM出力とアドレスからデータバイトを組み立てる
#[inline]
pub const fn gcr_decode(e: u8, i: u16) -> u8 {
    ((e >> 6) & 1) << 7
        | (((i >> 7) & 1) as u8) << 6
        | (e & 0x33)
        | ((e >> 2) & 1) << 3
        | (i & 0x04) as u8
}

/// ROM出力とアドレスから10ビットのコード語を組み立てる
#[inline]
pub const fn gcr_encode(e: u8, i: u16) -> u16 {
    let e = e as u16;
    (e & 0xc0) << 2 | (i & 0x80) | (e & 0x3c) << 1 | (i & 0x04) | (e & 0x03)
}

const fn build_rom() -> [u8; GCR_ROM_SIZE] {
    let mut rom = [0u8; GCR_ROM_SIZE];

    // 書き込み側: e7..e4 = 上位符号の bit4,3,1,0 / e3..e0 = 下位符号の bit4,3,1,0
    let mut wd = 0usize;
    while wd < 256 {
        let hi = GCR_NIBBLE_CODES[wd >> 4];
        let lo = GCR_NIBBLE_CODES[wd & 0x0f];
        let e = (hi & 0x18) << 3 | (hi & 0x03) << 4 | (lo & 0x18) >> 1 | (lo & 0x03);
        rom[write_index(wd as u8, false) as usize] = e;
        rom[write_index(wd as u8, true) as usize] = 0xff;
        wd += 1;
    }

    // 読み取り側: 両方の5ビット符号が有効なときだけ GCR_VALID を立てる
    let mut code = 0usize;
    while code < 0x400 {
        let hi = nibble_of(((code >> 5) & 0x1f) as u8);
        let lo = nibble_of((code & 0x1f) as u8);
        if let (Some(h), Some(l)) = (hi, lo) {
            rom[READ_BASE as usize | code] =
                (l & 0x03) | (l & 0x08) >> 1 | GCR_VALID | (h & 0x03) << 4 | (h & 0x08) << 3;
        }
        code += 1;
    }
    rom
}

static BUILTIN_ROM: [u8; GCR_ROM_SIZE] = build_rom();

/// GCR ROMイメージ（内蔵テーブルまたは外部ダンプ）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcrRom {
    table: Cow<'static, [u8; GCR_ROM_SIZE]>,
}

impl Default for GcrRom {
    fn default() -> Self {
        Self::builtin()
    }
}

impl GcrRom {
    pub fn builtin() -> Self {
        GcrRom {
            table: Cow::Borrowed(&BUILTIN_ROM),
        }
    }

    /// 外部ダンプから作成
    pub fn from_bytes(data: &[u8]) -> Result<Self, FdcError> {
        let table: [u8; GCR_ROM_SIZE] = data.try_into().map_err(|_| FdcError::RomSize {
            expected: GCR_ROM_SIZE,
            actual: data.len(),
        })?;
        Ok(GcrRom {
            table: Cow::Owned(table),
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FdcError> {
        let data = fs::read(path)?;
        Self::from_bytes(&data)
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self.table, Cow::Borrowed(_))
    }

    #[inline]
    pub fn entry(&self, index: u16) -> u8 {
        self.table[index as usize & (GCR_ROM_SIZE - 1)]
    }

    /// バイトを10ビットのコード語に変換
    pub fn encode(&self, data: u8, wrsync: bool) -> u16 {
        let i = write_index(data, wrsync);
        gcr_encode(self.entry(i), i)
    }

    /// コード語をバイトに戻す。不正なコード語は `None`
    pub fn decode(&self, code: u16) -> Option<u8> {
        let i = read_index(code);
        let e = self.entry(i);
        if e & GCR_VALID == 0 {
            None
        } else {
            Some(gcr_decode(e, i))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_every_byte() {
        let rom = GcrRom::builtin();
        for b in 0..=255u8 {
            let code = rom.encode(b, false);
            assert!(code <= 0x3ff);
            assert_eq!(rom.decode(code), Some(b), "byte {:02X} code {:03X}", b, code);
        }
    }

    #[test]
    fn test_invalid_codes_are_rejected() {
        let rom = GcrRom::builtin();
        let valid = (0..0x400u16).filter(|&c| rom.decode(c).is_some()).count();
        assert_eq!(valid, 256);
        assert_eq!(rom.decode(GCR_SYNC_PATTERN), None);
        assert_eq!(rom.decode(0x000), None);
    }

    #[test]
    fn test_sync_write_needs_ff() {
        let rom = GcrRom::builtin();
        assert_eq!(rom.encode(0xff, true), GCR_SYNC_PATTERN);
        // bit6 / bit2 はROMを通らない
        assert_eq!(rom.encode(0x00, true), GCR_SYNC_PATTERN & !0x84);
    }

    #[test]
    fn test_run_length_limits() {
        let rom = GcrRom::builtin();
        for a in 0..=255u8 {
            for b in [0x00u8, 0x55, 0xa5, 0xff] {
                let stream = (rom.encode(a, false) as u32) << 10 | rom.encode(b, false) as u32;
                let mut zeros = 0;
                let mut ones = 0;
                for bit in (0..20).rev() {
                    if stream >> bit & 1 == 0 {
                        zeros += 1;
                        ones = 0;
                    } else {
                        ones += 1;
                        zeros = 0;
                    }
                    assert!(zeros <= 2, "{:02X} {:02X}", a, b);
                    assert!(ones < 10, "{:02X} {:02X}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_rom_from_bytes() {
        assert!(matches!(
            GcrRom::from_bytes(&[0u8; 100]),
            Err(FdcError::RomSize { expected: GCR_ROM_SIZE, actual: 100 })
        ));
        let copy = GcrRom::from_bytes(&BUILTIN_ROM[..]).unwrap();
        assert!(!copy.is_builtin());
        assert_eq!(copy.encode(0xa5, false), GcrRom::builtin().encode(0xa5, false));
    }
}
