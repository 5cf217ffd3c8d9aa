//! コントローラのログ
//!
//! 原則:
//! 1. 毎ビットの処理ではなく「判断」と「状態遷移」を記録
//! 2. カテゴリ分離: FLOW / STATE / DECIDE / BITS
//! 3. 出力は `log` ファサード経由（env_logger で絞り込める）

use std::sync::atomic::{AtomicU32, Ordering};

use crate::time::SimTime;

bitflags::bitflags! {
    /// ログカテゴリ
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LiveLogLevel: u32 {
        /// L1: コマンド、モーター、ライブ開始／中断
        const FLOW   = 0b0001;
        /// L2: 信号の変化、ドライブ選択
        const STATE  = 0b0010;
        /// L2: チェックポイント、ロールバック
        const DECIDE = 0b0100;
        /// L3: ビット単位（短時間のみ）
        const BITS   = 0b1000;
    }
}

/// グローバルログレベル
static LOG_LEVEL: AtomicU32 = AtomicU32::new(0);

pub fn set_log_level(level: LiveLogLevel) {
    LOG_LEVEL.store(level.bits(), Ordering::Relaxed);
}

pub fn get_log_level() -> LiveLogLevel {
    LiveLogLevel::from_bits_truncate(LOG_LEVEL.load(Ordering::Relaxed))
}

#[inline]
pub fn is_enabled(flag: LiveLogLevel) -> bool {
    (LOG_LEVEL.load(Ordering::Relaxed) & flag.bits()) != 0
}

/// "flow+state" 形式の文字列を解析
pub fn parse_log_level(s: &str) -> LiveLogLevel {
    let mut level = LiveLogLevel::empty();
    for part in s.split(['+', ',']) {
        match part.trim().to_lowercase().as_str() {
            "flow" => level |= LiveLogLevel::FLOW,
            "state" => level |= LiveLogLevel::STATE,
            "decide" => level |= LiveLogLevel::DECIDE,
            "bits" => level |= LiveLogLevel::BITS,
            "all" => level = LiveLogLevel::all(),
            "" | "none" => {}
            other => log::warn!("unknown log category '{}'", other),
        }
    }
    level
}

/// 直近のバイトを保持するリング（デコードエラー時にダンプ）
pub struct ByteRing {
    buf: Vec<u8>,
    pos: usize,
    capacity: usize,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            pos: 0,
            capacity,
        }
    }

    pub fn push(&mut self, byte: u8) {
        self.buf[self.pos % self.capacity] = byte;
        self.pos += 1;
    }

    /// 最新からN個（古い順）
    pub fn last_n(&self, n: usize) -> Vec<u8> {
        let n = n.min(self.capacity).min(self.pos);
        (0..n)
            .map(|i| self.buf[(self.pos - n + i) % self.capacity])
            .collect()
    }

    pub fn clear(&mut self) {
        self.pos = 0;
    }

    pub fn dump(&self, n: usize) {
        if !is_enabled(LiveLogLevel::BITS) {
            return;
        }
        let data = self.last_n(n);
        let line: Vec<String> = data.iter().map(|b| format!("{:02X}", b)).collect();
        log::debug!(target: "fdc::bits", "last {} bytes: {}", data.len(), line.join(" "));
    }
}

impl Default for ByteRing {
    fn default() -> Self {
        Self::new(64)
    }
}

impl std::fmt::Debug for ByteRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteRing({:02X?})", self.last_n(self.capacity))
    }
}

// ============================================================
// FLOW
// ============================================================

pub fn log_motor_on() {
    if is_enabled(LiveLogLevel::FLOW) {
        log::info!(target: "fdc::flow", "motor ON");
    }
}

pub fn log_motor_off() {
    if is_enabled(LiveLogLevel::FLOW) {
        log::info!(target: "fdc::flow", "motor OFF");
    }
}

pub fn log_command(command: u8, name: &str, now: SimTime) {
    if is_enabled(LiveLogLevel::FLOW) {
        log::info!(target: "fdc::flow", "command {:02X} {} at {}", command, name, now);
    }
}

pub fn log_live_start(at: SimTime, drive: usize, side: usize, write: bool) {
    if is_enabled(LiveLogLevel::FLOW) {
        log::info!(
            target: "fdc::flow",
            "live start at {} drive={} side={} {}",
            at,
            drive,
            side,
            if write { "WRITE" } else { "READ" }
        );
    }
}

pub fn log_live_abort(at: SimTime) {
    if is_enabled(LiveLogLevel::FLOW) {
        log::info!(target: "fdc::flow", "live abort at {}", at);
    }
}

/// [FLOW] 同期が見つからないままタイムアウト
pub fn log_sync_timeout(at: SimTime, track: usize) {
    if is_enabled(LiveLogLevel::FLOW) {
        log::warn!(target: "fdc::flow", "no sync on track {} (timeout at {})", track, at);
    }
}

// ============================================================
// STATE
// ============================================================

pub fn log_track_change(from: usize, to: usize) {
    if is_enabled(LiveLogLevel::STATE) {
        log::debug!(target: "fdc::state", "track {} -> {}", from, to);
    }
}

pub fn log_drive_select(drive: usize, side: usize) {
    if is_enabled(LiveLogLevel::STATE) {
        log::debug!(target: "fdc::state", "drive {} side {} selected", drive, side);
    }
}

pub fn log_signal(name: &str, active: bool, at: SimTime) {
    if is_enabled(LiveLogLevel::STATE) {
        log::debug!(
            target: "fdc::state",
            "{} {} at {}",
            name,
            if active { "asserted" } else { "released" },
            at
        );
    }
}

pub fn log_byte(data: u8, at: SimTime) {
    if is_enabled(LiveLogLevel::STATE) {
        log::debug!(target: "fdc::state", "byte {:02X} at {}", data, at);
    }
}

pub fn log_erase(active: bool) {
    if is_enabled(LiveLogLevel::STATE) {
        log::debug!(target: "fdc::state", "erase gate {}", if active { "on" } else { "off" });
    }
}

// ============================================================
// DECIDE
// ============================================================

pub fn log_rollback(from: SimTime, to: SimTime, now: SimTime) {
    if is_enabled(LiveLogLevel::DECIDE) {
        log::debug!(target: "fdc::decide", "rollback {} -> {} (access at {})", from, to, now);
    }
}

pub fn log_checkpoint(at: SimTime) {
    if is_enabled(LiveLogLevel::DECIDE) {
        log::trace!(target: "fdc::decide", "checkpoint at {}", at);
    }
}

/// [DECIDE] 書き込みバッファ溢れ（以降の反転は捨てる）
pub fn log_write_overflow(at: SimTime) {
    if is_enabled(LiveLogLevel::DECIDE) {
        log::warn!(target: "fdc::decide", "write buffer full at {}, transition dropped", at);
    }
}

// ============================================================
// BITS
// ============================================================

pub fn log_bit(at: SimTime, bit: bool, shift_reg: u16) {
    if is_enabled(LiveLogLevel::BITS) {
        log::trace!(target: "fdc::bits", "{} bit={} shift={:04X}", at, bit as u8, shift_reg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_ring() {
        let mut ring = ByteRing::new(8);
        for i in 0..10 {
            ring.push(i as u8);
        }
        assert_eq!(ring.last_n(4), vec![6, 7, 8, 9]);
        assert_eq!(ring.last_n(20).len(), 8);
        ring.clear();
        assert!(ring.last_n(4).is_empty());
    }

    #[test]
    fn test_parse_log_level() {
        let level = parse_log_level("flow+decide");
        assert!(level.contains(LiveLogLevel::FLOW));
        assert!(level.contains(LiveLogLevel::DECIDE));
        assert!(!level.contains(LiveLogLevel::STATE));
        assert_eq!(parse_log_level("all"), LiveLogLevel::all());
        assert!(parse_log_level("").is_empty());
    }

    #[test]
    fn test_log_level() {
        set_log_level(LiveLogLevel::FLOW | LiveLogLevel::STATE);
        assert!(is_enabled(LiveLogLevel::FLOW));
        assert!(is_enabled(LiveLogLevel::STATE));
        assert!(!is_enabled(LiveLogLevel::BITS));
        assert_eq!(get_log_level(), LiveLogLevel::FLOW | LiveLogLevel::STATE);
        set_log_level(LiveLogLevel::empty());
    }
}
