//! ビットセルのクロック再生（PLL）
//!
//! 2種類のモデルを持つ:
//! - アナログ型: 位相差の65%を次の窓に反映し、同方向のずれが続くと周期も補正
//! - デジタル型: WD1770系の12ビットカウンタ。スロット毎に加算量を変えて位相・周波数を追従
//!
//! 書き込みは反転時刻を固定長バッファに溜め、`commit` でメディアに流す。
//! 状態はすべて `Copy` なので、チェックポイントは値のコピーで済む。

use crate::live_log::log_write_overflow;
use crate::medium::FloppyMedium;
use crate::time::SimTime;
use crate::variant::PllKind;

/// 書き込みバッファの容量（チェックポイント間隔に対して十分な大きさ）
pub const WRITE_BUFFER_SIZE: usize = 32;

/// 読み取り1ビットの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextBit {
    Bit(bool),
    /// 次のセルが制限時刻を越える
    NeedsMoreTime,
}

/// 書き込み1ビットの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBit {
    Written,
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WriteBuffer {
    start: SimTime,
    buf: [SimTime; WRITE_BUFFER_SIZE],
    len: usize,
}

impl WriteBuffer {
    fn new() -> Self {
        WriteBuffer {
            start: SimTime::NEVER,
            buf: [SimTime::ZERO; WRITE_BUFFER_SIZE],
            len: 0,
        }
    }

    /// 書き込みセッションが未開始なら `at` から始める
    fn open(&mut self, at: SimTime) {
        if self.start.is_never() {
            self.start = at;
            self.len = 0;
        }
    }

    fn push(&mut self, at: SimTime) {
        if self.len < WRITE_BUFFER_SIZE {
            self.buf[self.len] = at;
            self.len += 1;
        } else {
            log_write_overflow(at);
        }
    }

    /// `[start, tm)` を書き出す。`tm` ちょうどの反転は次の区間に残す
    fn commit(&mut self, medium: &mut dyn FloppyMedium, tm: SimTime) {
        if self.start.is_never() || tm <= self.start {
            return;
        }
        let n = self.buf[..self.len].partition_point(|&t| t < tm);
        medium.write_flux(self.start, tm, &self.buf[..n]);
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
        self.start = tm;
    }

    /// 残りをすべて書き出してセッションを閉じる
    fn finish(&mut self, medium: &mut dyn FloppyMedium, at: SimTime) {
        if !self.start.is_never() && (at > self.start || self.len > 0) {
            medium.write_flux(self.start, at.max(self.start), &self.buf[..self.len]);
        }
        self.start = SimTime::NEVER;
        self.len = 0;
    }
}

/// アナログ型PLL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalogPll {
    ctime: SimTime,
    period: i64,
    min_period: i64,
    max_period: i64,
    period_adjust_base: i64,
    phase_adjust: i64,
    freq_hist: i32,
}

impl AnalogPll {
    fn new(period: SimTime) -> Self {
        let mut pll = AnalogPll {
            ctime: SimTime::ZERO,
            period: 0,
            min_period: 0,
            max_period: 0,
            period_adjust_base: 0,
            phase_adjust: 0,
            freq_hist: 0,
        };
        pll.set_clock(period);
        pll
    }

    fn set_clock(&mut self, period: SimTime) {
        let p = period.as_nsec() as i64;
        self.period = p;
        self.period_adjust_base = p * 5 / 100;
        self.min_period = p * 75 / 100;
        self.max_period = p * 125 / 100;
    }

    fn reset(&mut self, at: SimTime) {
        self.ctime = at;
        self.phase_adjust = 0;
        self.freq_hist = 0;
    }

    fn next_bit(&mut self, tm: &mut SimTime, medium: &dyn FloppyMedium, limit: SimTime) -> NextBit {
        let edge = medium.next_transition(self.ctime);
        let next = self.ctime.offset(self.period + self.phase_adjust);
        if next > limit {
            return NextBit::NeedsMoreTime;
        }
        self.ctime = next;
        *tm = next;

        if edge.is_never() || edge >= next {
            // 窓内に反転なし: 0、フリーラン
            self.phase_adjust = 0;
            return NextBit::Bit(false);
        }

        // 窓の中央からのずれ
        let delta = edge.delta_from(next.offset(-self.period / 2));
        self.phase_adjust = delta * 65 / 100;

        if delta < 0 {
            self.freq_hist = if self.freq_hist < 0 { self.freq_hist - 1 } else { -1 };
        } else if delta > 0 {
            self.freq_hist = if self.freq_hist > 0 { self.freq_hist + 1 } else { 1 };
        } else {
            self.freq_hist = 0;
        }

        if self.freq_hist.abs() > 1 {
            let adjust = self.period_adjust_base * delta / self.period;
            self.period = (self.period + adjust).clamp(self.min_period, self.max_period);
        }
        NextBit::Bit(true)
    }

    fn write_next_bit(&mut self, bit: bool, tm: &mut SimTime, write: &mut WriteBuffer, limit: SimTime) -> WriteBit {
        write.open(self.ctime);
        let etime = self.ctime.offset(self.period);
        if etime > limit {
            return WriteBit::Deferred;
        }
        if bit {
            write.push(self.ctime.offset(self.period / 2));
        }
        self.ctime = etime;
        *tm = etime;
        WriteBit::Written
    }
}

const PHA: [u8; 8] = [0xf, 0x7, 0x3, 0x1, 0, 0, 0, 0];
const PHS: [u8; 8] = [0, 0, 0, 0, 0x1, 0x3, 0x7, 0xf];
const FREQA: [[u8; 8]; 4] = [
    [0xf, 0x7, 0x3, 0x1, 0, 0, 0, 0],
    [0x7, 0x3, 0x1, 0, 0, 0, 0, 0],
    [0x7, 0x3, 0x1, 0, 0, 0, 0, 0],
    [0, 0, 0, 0, 0, 0, 0, 0],
];
const FREQS: [[u8; 8]; 4] = [
    [0, 0, 0, 0, 0, 0, 0, 0],
    [0, 0, 0, 0, 0, 1, 3, 7],
    [0, 0, 0, 0, 0, 1, 3, 7],
    [0, 0, 0, 0, 1, 3, 7, 0xf],
];

const NO_TRANSITION: u16 = 0xffff;

/// デジタル型PLL（1セル = 公称16スロット）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigitalPll {
    ctime: SimTime,
    slot_period: SimTime,
    counter: u16,
    increment: u16,
    transition_time: u16,
    history: u8,
    slot: u8,
    phase_add: u8,
    phase_sub: u8,
    freq_add: u8,
    freq_sub: u8,
}

impl DigitalPll {
    fn new(cell_period: SimTime) -> Self {
        let mut pll = DigitalPll {
            ctime: SimTime::ZERO,
            slot_period: SimTime::ZERO,
            counter: 0,
            increment: 128,
            transition_time: NO_TRANSITION,
            history: 0x80,
            slot: 0,
            phase_add: 0,
            phase_sub: 0,
            freq_add: 0,
            freq_sub: 0,
        };
        pll.set_clock(cell_period);
        pll
    }

    fn set_clock(&mut self, cell_period: SimTime) {
        self.slot_period = SimTime::from_nsec(cell_period.as_nsec() / 16);
    }

    fn reset(&mut self, at: SimTime) {
        self.counter = 0;
        self.increment = 128;
        self.transition_time = NO_TRANSITION;
        self.history = 0x80;
        self.slot = 0;
        self.ctime = at;
        self.phase_add = 0;
        self.phase_sub = 0;
        self.freq_add = 0;
        self.freq_sub = 0;
    }

    #[inline]
    fn slot_end(&self) -> SimTime {
        self.ctime + self.slot_period.times(self.slot as u64 + 1)
    }

    fn next_bit(&mut self, tm: &mut SimTime, medium: &dyn FloppyMedium, limit: SimTime) -> NextBit {
        let when = medium.next_transition(self.ctime);

        loop {
            let etime = self.slot_end();
            if etime > limit {
                return NextBit::NeedsMoreTime;
            }
            if self.transition_time == NO_TRANSITION && !when.is_never() && etime >= when {
                self.transition_time = self.counter;
            }
            if self.slot < 8 {
                let mask = 1u8 << self.slot;
                if self.phase_add & mask != 0 {
                    self.counter += 226;
                } else if self.phase_sub & mask != 0 {
                    self.counter += 30;
                } else {
                    self.counter += self.increment;
                }

                if self.freq_add & mask != 0 && self.increment < 140 {
                    self.increment += 1;
                } else if self.freq_sub & mask != 0 && self.increment > 117 {
                    self.increment -= 1;
                }
            } else {
                self.counter += self.increment;
            }

            self.slot += 1;
            *tm = etime;
            if self.counter & 0x800 != 0 {
                break;
            }
        }

        let bit = self.transition_time != NO_TRANSITION;
        if bit {
            let cslot = (self.transition_time >> 8) as usize & 7;
            self.phase_add = PHA[cslot];
            self.phase_sub = PHS[cslot];
            let way = self.transition_time & 0x400 != 0;
            if self.history & 0x80 != 0 {
                self.history = if way { 0x80 } else { 0x83 };
            } else if self.history & 0x40 != 0 {
                self.history = if way { self.history & 2 } else { (self.history & 2) | 1 };
            }
            let h = (self.history & 3) as usize;
            self.freq_add = FREQA[h][cslot];
            self.freq_sub = FREQS[h][cslot];
            self.history = if way { (self.history >> 1) | 2 } else { self.history >> 1 };
        } else {
            self.phase_add = 0;
            self.phase_sub = 0;
            self.freq_add = 0;
            self.freq_sub = 0;
        }

        self.counter &= 0x7ff;
        self.ctime = *tm;
        self.transition_time = NO_TRANSITION;
        self.slot = 0;
        NextBit::Bit(bit)
    }

    fn write_next_bit(&mut self, bit: bool, tm: &mut SimTime, write: &mut WriteBuffer, limit: SimTime) -> WriteBit {
        write.open(self.ctime);
        loop {
            let etime = self.slot_end();
            if etime > limit {
                return WriteBit::Deferred;
            }
            let pre = self.counter;
            self.counter += self.increment;
            // カウンタがセル中央（0x400）を越えた瞬間に反転
            if bit && pre & 0x400 == 0 && self.counter & 0x400 != 0 {
                write.push(etime);
            }
            self.slot += 1;
            *tm = etime;
            if self.counter & 0x800 != 0 {
                break;
            }
        }
        self.counter &= 0x7ff;
        self.ctime = *tm;
        self.slot = 0;
        WriteBit::Written
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Model {
    Analog(AnalogPll),
    Digital(DigitalPll),
}

/// ドライブ1台分のPLL（読み取り窓の状態＋書き込みバッファ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pll {
    model: Model,
    write: WriteBuffer,
}

impl Pll {
    pub fn new(kind: PllKind, cell_period: SimTime) -> Self {
        let model = match kind {
            PllKind::Analog => Model::Analog(AnalogPll::new(cell_period)),
            PllKind::Digital => Model::Digital(DigitalPll::new(cell_period)),
        };
        Pll {
            model,
            write: WriteBuffer::new(),
        }
    }

    pub fn kind(&self) -> PllKind {
        match self.model {
            Model::Analog(_) => PllKind::Analog,
            Model::Digital(_) => PllKind::Digital,
        }
    }

    /// 公称セル周期を設定
    pub fn set_clock(&mut self, cell_period: SimTime) {
        match &mut self.model {
            Model::Analog(p) => p.set_clock(cell_period),
            Model::Digital(p) => p.set_clock(cell_period),
        }
    }

    /// `at` から窓を開き直す。開いている書き込みセッションは破棄される
    pub fn reset(&mut self, at: SimTime) {
        match &mut self.model {
            Model::Analog(p) => p.reset(at),
            Model::Digital(p) => p.reset(at),
        }
        self.write = WriteBuffer::new();
    }

    /// 現在の窓の開始時刻
    pub fn ctime(&self) -> SimTime {
        match &self.model {
            Model::Analog(p) => p.ctime,
            Model::Digital(p) => p.ctime,
        }
    }

    pub fn next_bit(&mut self, tm: &mut SimTime, medium: &dyn FloppyMedium, limit: SimTime) -> NextBit {
        match &mut self.model {
            Model::Analog(p) => p.next_bit(tm, medium, limit),
            Model::Digital(p) => p.next_bit(tm, medium, limit),
        }
    }

    pub fn write_next_bit(&mut self, bit: bool, tm: &mut SimTime, limit: SimTime) -> WriteBit {
        match &mut self.model {
            Model::Analog(p) => p.write_next_bit(bit, tm, &mut self.write, limit),
            Model::Digital(p) => p.write_next_bit(bit, tm, &mut self.write, limit),
        }
    }

    pub fn is_writing(&self) -> bool {
        !self.write.start.is_never()
    }

    /// 書き込みセッション開始（`at` で窓もリセット）
    pub fn start_writing(&mut self, at: SimTime) {
        debug_assert!(!self.is_writing(), "write session already open");
        self.reset(at);
        self.write.start = at;
    }

    /// `at` までをコミットしてセッションを閉じる
    pub fn stop_writing(&mut self, medium: &mut dyn FloppyMedium, at: SimTime) {
        self.write.finish(medium, at);
    }

    /// バッファ済みの反転を `at` の手前まで書き出す（同じ時刻で繰り返しても変化なし）
    pub fn commit(&mut self, medium: &mut dyn FloppyMedium, at: SimTime) {
        self.write.commit(medium, at);
    }
}
