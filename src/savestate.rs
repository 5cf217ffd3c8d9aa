//! セーブステート機能
//!
//! コントローラのレジスタとドライブの状態を保存・復元する。
//! ライブ状態（チェックポイント）は保存せず、復元後はIDLEから始まる。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::FdcError;
use crate::medium::FluxDisk;
use crate::time::SimTime;

/// レジスタの状態（セーブ用）
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RegisterState {
    pub status: u8,
    pub track: u8,
    pub sector: u8,
    pub data: u8,
    pub control: u8,
    pub command: u8,
    pub intrq: bool,
}

/// ドライブの状態（セーブ用）
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DriveState {
    pub cyl: usize,
    pub head: usize,
    pub motor_on: bool,
    pub rpm: u32,
    pub disk: Option<FluxDisk>,
}

/// 実行中のシーク
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeekState {
    pub target: usize,
    pub done_at: SimTime,
}

/// コントローラ全体
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FdcState {
    pub version: u32,           // セーブフォーマットのバージョン
    pub variant: String,
    pub registers: RegisterState,
    pub drives: Vec<DriveState>,
    pub seek: Option<SeekState>,
    /// 保存時のシミュレーション時刻
    pub time: SimTime,
}

impl FdcState {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, FdcError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), FdcError> {
        let json = serde_json::to_string(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
