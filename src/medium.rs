//! フロッピーメディアとドライブ
//!
//! ディスク上の磁束反転は1回転を `ANGULAR_UNITS` 等分した角度位置で保持し、
//! ドライブの回転数で時刻に換算する。

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::FdcError;
use crate::live_log::{log_motor_off, log_motor_on, log_track_change};
use crate::time::SimTime;

/// 1回転あたりの角度単位（300rpmで1単位 = 1ns）
pub const ANGULAR_UNITS: u32 = 200_000_000;

/// 書き込みバッファなどが扱う磁束反転列のメディア側インターフェース
pub trait FloppyMedium {
    /// `from` 以降（`from` を含む）で最初の磁束反転の時刻。なければ `NEVER`
    fn next_transition(&self, from: SimTime) -> SimTime;

    /// `[start, end)` の磁束を消去し、`transitions` で置き換える
    fn write_flux(&mut self, start: SimTime, end: SimTime, transitions: &[SimTime]);

    /// 回転角（0..ANGULAR_UNITS）
    fn rotational_position(&self, at: SimTime) -> u32;

    fn set_track(&mut self, track: usize);

    fn set_head(&mut self, head: usize);
}

/// メモリ上の磁束イメージ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FluxDisk {
    pub tracks: usize,
    pub heads: usize,
    /// トラック×ヘッドごとの反転位置（昇順）
    cells: Vec<Vec<u32>>,
    #[serde(default)]
    pub write_protected: bool,
    #[serde(skip)]
    pub modified: bool,
}

impl FluxDisk {
    /// 未フォーマット（反転なし）のディスク。トラック数・ヘッド数は最低1
    pub fn new(tracks: usize, heads: usize) -> Self {
        let (tracks, heads) = (tracks.max(1), heads.max(1));
        FluxDisk {
            tracks,
            heads,
            cells: vec![Vec::new(); tracks * heads],
            write_protected: false,
            modified: false,
        }
    }

    fn slot(&self, track: usize, head: usize) -> usize {
        track.min(self.tracks.saturating_sub(1)) * self.heads + head.min(self.heads.saturating_sub(1))
    }

    pub fn track(&self, track: usize, head: usize) -> &[u32] {
        &self.cells[self.slot(track, head)]
    }

    pub fn track_mut(&mut self, track: usize, head: usize) -> &mut Vec<u32> {
        let slot = self.slot(track, head);
        &mut self.cells[slot]
    }

    /// ビットセル列を書き込む（1のセル中央に反転を置く）。終了位置を返す
    pub fn write_cells<I>(&mut self, track: usize, head: usize, start: u32, cell: u32, bits: I) -> u32
    where
        I: IntoIterator<Item = bool>,
    {
        let mut pos = start as u64;
        let mut added = Vec::new();
        for bit in bits {
            if bit {
                added.push(((pos + cell as u64 / 2) % ANGULAR_UNITS as u64) as u32);
            }
            pos += cell as u64;
        }
        let end = (pos % ANGULAR_UNITS as u64) as u32;
        let wrapped = pos - start as u64 >= ANGULAR_UNITS as u64;
        let list = self.track_mut(track, head);
        if wrapped {
            list.clear();
        } else {
            list.retain(|&p| !in_range(p, start, end));
        }
        list.extend(added);
        list.sort_unstable();
        list.dedup();
        self.modified = true;
        end
    }

    /// 反転位置を一様乱数でずらす（シード固定で再現可能）
    pub fn jitter(&mut self, max_units: u32, seed: u64) {
        if max_units == 0 {
            return;
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let span = max_units as i64;
        for list in self.cells.iter_mut() {
            for p in list.iter_mut() {
                let shifted = *p as i64 + rng.gen_range(-span..=span);
                *p = shifted.rem_euclid(ANGULAR_UNITS as i64) as u32;
            }
            list.sort_unstable();
            list.dedup();
        }
    }

    /// トラック数・ヘッド数が0のイメージ（読み込み時に弾く）
    pub fn check_geometry(&self) -> Result<(), FdcError> {
        if self.tracks == 0 || self.heads == 0 {
            return Err(FdcError::DiskGeometry {
                tracks: self.tracks,
                heads: self.heads,
            });
        }
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FdcError> {
        let content = fs::read_to_string(path)?;
        let mut disk: FluxDisk = serde_json::from_str(&content)?;
        disk.check_geometry()?;
        for list in disk.cells.iter_mut() {
            list.sort_unstable();
            list.dedup();
        }
        disk.cells.resize(disk.tracks * disk.heads, Vec::new());
        Ok(disk)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), FdcError> {
        let json = serde_json::to_string(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// `[start, end)` に含まれるか（1回転で折り返す）
fn in_range(p: u32, start: u32, end: u32) -> bool {
    if start <= end {
        p >= start && p < end
    } else {
        p >= start || p < end
    }
}

/// フロッピードライブの状態
#[derive(Debug, Clone)]
pub struct FloppyDrive {
    /// ディスク
    pub disk: Option<FluxDisk>,
    /// 現在のシリンダ
    pub cyl: usize,
    /// 選択中のヘッド
    pub head: usize,
    /// 最大シリンダ数（ステッパの物理範囲）
    pub max_cyl: usize,
    pub motor_on: bool,
    /// 回転数
    pub rpm: u32,
    /// 回転の基準時刻（モーターON時）
    rev_start: SimTime,
}

impl Default for FloppyDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl FloppyDrive {
    pub fn new() -> Self {
        FloppyDrive {
            disk: None,
            cyl: 0,
            head: 0,
            max_cyl: 84,
            motor_on: false,
            rpm: 300,
            rev_start: SimTime::ZERO,
        }
    }

    pub fn insert_disk(&mut self, disk: FluxDisk) {
        self.disk = Some(disk);
    }

    pub fn eject_disk(&mut self) -> Option<FluxDisk> {
        self.disk.take()
    }

    pub fn set_motor(&mut self, on: bool, now: SimTime) {
        if on == self.motor_on {
            return;
        }
        self.motor_on = on;
        if on {
            self.rev_start = now;
            log_motor_on();
        } else {
            log_motor_off();
        }
    }

    /// ディスクが入っていて回転している
    pub fn is_ready(&self) -> bool {
        self.motor_on && self.disk.is_some()
    }

    pub fn is_write_protected(&self) -> bool {
        self.disk.as_ref().map_or(false, |d| d.write_protected)
    }

    /// トラック0センサ
    pub fn trk00(&self) -> bool {
        self.cyl == 0
    }

    /// 1回転の時間
    pub fn revolution(&self) -> SimTime {
        SimTime::from_nsec(60_000_000_000 / self.rpm.max(1) as u64)
    }

    fn cells(&self) -> Option<&[u32]> {
        self.disk.as_ref().map(|d| d.track(self.cyl, self.head))
    }

    fn time_of(&self, pos: u32, rev_ns: u64) -> u64 {
        (pos as u128 * rev_ns as u128 / ANGULAR_UNITS as u128) as u64
    }

    fn pos_of(&self, at: SimTime, rev_ns: u64) -> u32 {
        let rel = at.as_nsec().saturating_sub(self.rev_start.as_nsec()) % rev_ns;
        (rel as u128 * ANGULAR_UNITS as u128 / rev_ns as u128) as u32
    }
}

impl FloppyMedium for FloppyDrive {
    fn next_transition(&self, from: SimTime) -> SimTime {
        if !self.motor_on || from.is_never() {
            return SimTime::NEVER;
        }
        let cells = match self.cells() {
            Some(c) if !c.is_empty() => c,
            _ => return SimTime::NEVER,
        };
        let rev_ns = self.revolution().as_nsec();
        let base = self.rev_start.as_nsec();
        let rel = from.as_nsec().max(base) - base;
        let rev = rel / rev_ns;
        let offs = rel % rev_ns;
        let idx = cells.partition_point(|&p| self.time_of(p, rev_ns) < offs);
        let t = if idx < cells.len() {
            base + rev * rev_ns + self.time_of(cells[idx], rev_ns)
        } else {
            base + (rev + 1) * rev_ns + self.time_of(cells[0], rev_ns)
        };
        SimTime::from_nsec(t)
    }

    fn write_flux(&mut self, start: SimTime, end: SimTime, transitions: &[SimTime]) {
        if end < start || !self.motor_on {
            return;
        }
        let rev_ns = self.revolution().as_nsec();
        let ps = self.pos_of(start, rev_ns);
        let pe = self.pos_of(end, rev_ns);
        let whole = end.as_nsec() - start.as_nsec() >= rev_ns;
        let added: Vec<u32> = transitions.iter().map(|&t| self.pos_of(t, rev_ns)).collect();
        let (cyl, head) = (self.cyl, self.head);
        let disk = match self.disk.as_mut() {
            Some(d) if !d.write_protected => d,
            _ => return,
        };
        let list = disk.track_mut(cyl, head);
        if whole {
            list.clear();
        } else {
            list.retain(|&p| !in_range(p, ps, pe));
        }
        list.extend(added);
        list.sort_unstable();
        list.dedup();
        disk.modified = true;
    }

    fn rotational_position(&self, at: SimTime) -> u32 {
        self.pos_of(at, self.revolution().as_nsec())
    }

    fn set_track(&mut self, track: usize) {
        let track = track.min(self.max_cyl);
        if track != self.cyl {
            log_track_change(self.cyl, track);
            self.cyl = track;
        }
    }

    fn set_head(&mut self, head: usize) {
        self.head = head;
    }
}
