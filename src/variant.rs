//! コントローラのチップ種別
//!
//! サブクラスではなく名前付き定数で表す。記録方式ごとの定数（シフト幅、バイト長、
//! 同期パターン、同期バイト周期）は `Encoding::spec()` にまとめる。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FdcError;
use crate::gcr::{GCR_CODE_BITS, GCR_SYNC_PATTERN};
use crate::mfm::{FM_DAM, FM_DDAM, FM_IDAM, MFM_SYNC_A1, MFM_SYNC_C2};
use crate::time::SimTime;

/// 記録方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    Gcr,
    Mfm,
    Fm,
}

bitflags::bitflags! {
    /// 対応する記録方式
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Encodings: u8 {
        const GCR = 0b001;
        const MFM = 0b010;
        const FM  = 0b100;
    }
}

/// 記録方式ごとの定数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingSpec {
    /// シフトレジスタ幅（セル数）
    pub width: u32,
    /// 1バイトのセル数
    pub byte_cells: u8,
    /// 同期パターン（下位 `width` ビットと比較）
    pub sync_patterns: &'static [u16],
    /// 同期が途切れたときの同期バイトカウンタ初期値
    pub sync_byte_preset: u8,
    /// 同期バイトカウンタの周期（SYN出力を持つ方式のみ）
    pub sync_byte_period: Option<u8>,
}

impl EncodingSpec {
    #[inline]
    pub fn mask(&self) -> u16 {
        ((1u32 << self.width) - 1) as u16
    }

    #[inline]
    pub fn is_sync(&self, shift_reg: u16) -> bool {
        let masked = shift_reg & self.mask();
        self.sync_patterns.iter().any(|&p| p == masked)
    }
}

const GCR_SPEC: EncodingSpec = EncodingSpec {
    width: GCR_CODE_BITS,
    byte_cells: GCR_CODE_BITS as u8,
    sync_patterns: &[GCR_SYNC_PATTERN],
    sync_byte_preset: 10,
    sync_byte_period: Some(16),
};

const MFM_SPEC: EncodingSpec = EncodingSpec {
    width: 16,
    byte_cells: 16,
    sync_patterns: &[MFM_SYNC_A1, MFM_SYNC_C2],
    sync_byte_preset: 0,
    sync_byte_period: None,
};

const FM_SPEC: EncodingSpec = EncodingSpec {
    width: 16,
    byte_cells: 16,
    sync_patterns: &[FM_IDAM, FM_DAM, FM_DDAM],
    sync_byte_preset: 0,
    sync_byte_period: None,
};

impl Encoding {
    pub const fn spec(self) -> &'static EncodingSpec {
        match self {
            Encoding::Gcr => &GCR_SPEC,
            Encoding::Mfm => &MFM_SPEC,
            Encoding::Fm => &FM_SPEC,
        }
    }

    pub fn flag(self) -> Encodings {
        match self {
            Encoding::Gcr => Encodings::GCR,
            Encoding::Mfm => Encodings::MFM,
            Encoding::Fm => Encodings::FM,
        }
    }
}

/// PLLの実装
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PllKind {
    /// 位相・周波数を連続量で追従
    Analog,
    /// WD1770系のカウンタ型
    Digital,
}

/// チップ種別の設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipVariant {
    pub name: &'static str,
    pub encodings: Encodings,
    pub default_encoding: Encoding,
    pub pll: PllKind,
    /// 公称セル周期（GCR/MFM。FMはこの2倍）
    pub cell_period: SimTime,
    /// ステップレート（マイクロ秒、コマンド下位2ビットで選択）
    pub step_times_us: [u32; 4],
    /// READ/WRITEコマンドのビット1でサイドを選ぶ
    pub side_control: bool,
    /// READコマンドのビット1でサイド照合を行う
    pub side_compare: bool,
}

const FD179X_STEP_TIMES: [u32; 4] = [6000, 12000, 20000, 30000];
const WD1772_STEP_TIMES: [u32; 4] = [2000, 3000, 5000, 6000];

/// Victor 9000（GCR、アナログPLL 2.13us）
pub const VICTOR_9000: ChipVariant = ChipVariant {
    name: "victor9000",
    encodings: Encodings::GCR,
    default_encoding: Encoding::Gcr,
    pll: PllKind::Analog,
    cell_period: SimTime::from_nsec(2130),
    step_times_us: [3000, 3000, 3000, 3000],
    side_control: false,
    side_compare: false,
};

pub const FD1771: ChipVariant = ChipVariant {
    name: "fd1771",
    encodings: Encodings::FM,
    default_encoding: Encoding::Fm,
    pll: PllKind::Analog,
    cell_period: SimTime::from_nsec(2000),
    step_times_us: FD179X_STEP_TIMES,
    side_control: false,
    side_compare: false,
};

pub const FD1793: ChipVariant = ChipVariant {
    name: "fd1793",
    encodings: Encodings::MFM.union(Encodings::FM),
    default_encoding: Encoding::Mfm,
    pll: PllKind::Analog,
    cell_period: SimTime::from_nsec(2000),
    step_times_us: FD179X_STEP_TIMES,
    side_control: false,
    side_compare: true,
};

pub const FD1797: ChipVariant = ChipVariant {
    name: "fd1797",
    encodings: Encodings::MFM.union(Encodings::FM),
    default_encoding: Encoding::Mfm,
    pll: PllKind::Analog,
    cell_period: SimTime::from_nsec(2000),
    step_times_us: FD179X_STEP_TIMES,
    side_control: true,
    side_compare: false,
};

pub const WD1770: ChipVariant = ChipVariant {
    name: "wd1770",
    encodings: Encodings::MFM.union(Encodings::FM),
    default_encoding: Encoding::Mfm,
    pll: PllKind::Digital,
    cell_period: SimTime::from_nsec(2000),
    step_times_us: FD179X_STEP_TIMES,
    side_control: false,
    side_compare: false,
};

pub const WD1772: ChipVariant = ChipVariant {
    name: "wd1772",
    encodings: Encodings::MFM.union(Encodings::FM),
    default_encoding: Encoding::Mfm,
    pll: PllKind::Digital,
    cell_period: SimTime::from_nsec(2000),
    step_times_us: WD1772_STEP_TIMES,
    side_control: false,
    side_compare: false,
};

impl ChipVariant {
    pub fn supports(&self, encoding: Encoding) -> bool {
        self.encodings.contains(encoding.flag())
    }

    pub fn check_encoding(&self, encoding: Encoding) -> Result<(), FdcError> {
        if self.supports(encoding) {
            Ok(())
        } else {
            Err(FdcError::UnsupportedEncoding {
                variant: self.name,
                encoding,
            })
        }
    }

    /// 記録方式ごとのセル周期
    pub fn cell_period_for(&self, encoding: Encoding) -> SimTime {
        match encoding {
            Encoding::Fm => self.cell_period.times(2),
            Encoding::Gcr | Encoding::Mfm => self.cell_period,
        }
    }

    /// ステップ1回の時間
    pub fn step_time(&self, rate: u8) -> SimTime {
        SimTime::from_usec(self.step_times_us[(rate & 3) as usize] as u64)
    }
}

/// 設定ファイル／コマンドラインで使う種別名
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantName {
    #[default]
    Victor9000,
    Fd1771,
    Fd1793,
    Fd1797,
    Wd1770,
    Wd1772,
}

impl VariantName {
    pub fn variant(self) -> ChipVariant {
        match self {
            VariantName::Victor9000 => VICTOR_9000,
            VariantName::Fd1771 => FD1771,
            VariantName::Fd1793 => FD1793,
            VariantName::Fd1797 => FD1797,
            VariantName::Wd1770 => WD1770,
            VariantName::Wd1772 => WD1772,
        }
    }
}

impl FromStr for VariantName {
    type Err = FdcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "victor9000" | "victor" | "v9000" => Ok(VariantName::Victor9000),
            "fd1771" => Ok(VariantName::Fd1771),
            "fd1793" => Ok(VariantName::Fd1793),
            "fd1797" => Ok(VariantName::Fd1797),
            "wd1770" => Ok(VariantName::Wd1770),
            "wd1772" => Ok(VariantName::Wd1772),
            _ => Err(FdcError::UnknownVariant(s.to_string())),
        }
    }
}

impl fmt::Display for VariantName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.variant().name)
    }
}
