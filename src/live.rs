//! ライブ状態機械
//!
//! PLLから1セルずつビットを受け取り、シフトレジスタ・同期検出・バイト境界・
//! GCR/MFM/FMデコードを進める。信号が変化するとその時刻を「同期点」として
//! ホストに呼び戻しを依頼し、通知は同期点の処理ステップでまとめて行う。
//!
//! 実時刻より先まで投機的に走り、過去の時刻でレジスタアクセスが来たら
//! チェックポイントへ戻して再実行する。状態とPLLはどちらも `Copy` なので
//! 再実行の結果は一度で走った場合とビット単位で一致する。

use crate::gcr::{gcr_decode, gcr_encode, read_index, write_index, GcrRom, GCR_VALID};
use crate::live_log::{
    log_bit, log_byte, log_checkpoint, log_erase, log_live_abort, log_live_start, log_rollback,
    log_signal,
};
use crate::medium::FloppyMedium;
use crate::mfm::{
    crc_ccitt, data_bits, fm_encode, fm_violation, mfm_encode, mfm_violation, CRC_PRESET, FM_MARK_CLOCK,
    MFM_SYNC_A1,
};
use crate::pll::{NextBit, Pll, WriteBit};
use crate::time::SimTime;
use crate::variant::{ChipVariant, Encoding};

/// 投機実行の先読み（セル数）
pub const DEFAULT_LOOKAHEAD_CELLS: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivePhase {
    Idle,
    Running,
    /// 信号変化の通知待ち
    RunningSyncpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

bitflags::bitflags! {
    /// 同期点で通知する変化
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Pending: u8 {
        const BYTE_READY   = 0b0001;
        const SYNC         = 0b0010;
        const SYN          = 0b0100;
        const DECODE_ERROR = 0b1000;
        const CRC_ERROR    = 0b1_0000;
    }
}

/// アドレスマークに続くフィールド（MFM/FMのCRC照合用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    None,
    /// MFM: A1の後、マークバイト待ち
    Mark,
    /// IDフィールド（C, H, R, N）
    Id,
    /// データフィールド（128 << N バイト）
    Data,
}

impl Field {
    fn for_mark(mark: u8) -> Field {
        match mark {
            0xfe => Field::Id,
            0xf8..=0xfb => Field::Data,
            _ => Field::None,
        }
    }
}

/// 開始時に取り込み、同期点でのみ変更されるパラメータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveParams {
    pub drive: usize,
    pub side: usize,
    pub direction: Direction,
    /// 書き込みデータ
    pub data: u8,
    /// 同期パターンを書く
    pub wrsync: bool,
    pub erase: bool,
    pub encoding: Encoding,
}

impl Default for LiveParams {
    fn default() -> Self {
        LiveParams {
            drive: 0,
            side: 0,
            direction: Direction::Read,
            data: 0,
            wrsync: false,
            erase: false,
            encoding: Encoding::Gcr,
        }
    }
}

/// ライブ状態（信号はすべて正論理）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveState {
    /// 最後に処理したセルの時刻
    pub tm: SimTime,
    pub phase: LivePhase,
    pub next_phase: Option<LivePhase>,
    pub shift_reg: u16,
    pub shift_reg_write: u16,
    pub bit_counter: u8,
    pub sync_bit_counter: u8,
    pub sync_byte_counter: u8,
    /// 開始後に同期パターンを見てバイト境界が確定した
    pub synced: bool,
    /// 同期パターンがシフトレジスタにある
    pub sync: bool,
    /// 同期バイトが周期に達した
    pub syn: bool,
    /// バイトレディ
    pub brdy: bool,
    pub decode_error: bool,
    /// フィールド末尾でCRCが合わなかった（次の同期まで保持）
    pub crc_error: bool,
    pub pending: Pending,
    pub rom_index: u16,
    pub rom_out: u8,
    /// 最後にそろったバイト
    pub data: u8,
    /// MFMクロック生成用の直前データビット
    pub prev_data_bit: bool,
    pub crc: u16,
    pub field: Field,
    /// フィールド内のバイト位置
    pub field_pos: u16,
    /// 最後に読んだIDのセクタ長コード
    pub size_code: u8,
    pub params: LiveParams,
}

impl LiveState {
    pub fn idle(params: LiveParams) -> Self {
        LiveState {
            tm: SimTime::NEVER,
            phase: LivePhase::Idle,
            next_phase: None,
            shift_reg: 0,
            shift_reg_write: 0,
            bit_counter: 0,
            sync_bit_counter: 0,
            sync_byte_counter: params.encoding.spec().sync_byte_preset,
            synced: false,
            sync: false,
            syn: false,
            brdy: false,
            decode_error: false,
            crc_error: false,
            pending: Pending::empty(),
            rom_index: 0,
            rom_out: 0,
            data: 0,
            prev_data_bit: false,
            crc: CRC_PRESET,
            field: Field::None,
            field_pos: 0,
            size_code: 0,
            params,
        }
    }

    /// バス側の信号レベル（負論理）
    pub fn lines(&self) -> LiveLines {
        LiveLines {
            sync_n: !self.sync,
            syn_n: !self.syn,
            brdy_n: !self.brdy,
            decode_error_n: !self.decode_error,
            crc_error_n: !self.crc_error,
        }
    }
}

/// 負論理の出力ライン（`true` = 非アクティブ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveLines {
    pub sync_n: bool,
    pub syn_n: bool,
    pub brdy_n: bool,
    pub decode_error_n: bool,
    pub crc_error_n: bool,
}

/// 通知の記録
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveEventKind {
    ByteReady(u8),
    Sync(bool),
    Syn(bool),
    DecodeError(bool),
    CrcError(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveEvent {
    pub at: SimTime,
    pub kind: LiveEventKind,
}

/// 同期点での通知先
pub trait LiveListener {
    fn byte_ready(&mut self, data: u8, at: SimTime);
    fn sync_changed(&mut self, active: bool, at: SimTime);
    fn syn_changed(&mut self, active: bool, at: SimTime);
    fn decode_error_changed(&mut self, active: bool, at: SimTime);
    fn crc_error_changed(&mut self, active: bool, at: SimTime);
}

impl LiveListener for Vec<LiveEvent> {
    fn byte_ready(&mut self, data: u8, at: SimTime) {
        self.push(LiveEvent { at, kind: LiveEventKind::ByteReady(data) });
    }

    fn sync_changed(&mut self, active: bool, at: SimTime) {
        self.push(LiveEvent { at, kind: LiveEventKind::Sync(active) });
    }

    fn syn_changed(&mut self, active: bool, at: SimTime) {
        self.push(LiveEvent { at, kind: LiveEventKind::Syn(active) });
    }

    fn decode_error_changed(&mut self, active: bool, at: SimTime) {
        self.push(LiveEvent { at, kind: LiveEventKind::DecodeError(active) });
    }

    fn crc_error_changed(&mut self, active: bool, at: SimTime) {
        self.push(LiveEvent { at, kind: LiveEventKind::CrcError(active) });
    }
}

/// ライブ状態とPLLの組
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub live: LiveState,
    pub pll: Pll,
}

/// 統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveStats {
    pub checkpoints: u64,
    pub rollbacks: u64,
    /// 再実行分も含む処理ビット数
    pub bits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Syncpoint,
    OutOfTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Idle,
    Waiting,
    OutOfTime,
}

/// ライブエンジン本体
#[derive(Debug, Clone)]
pub struct LiveEngine {
    variant: ChipVariant,
    rom: GcrRom,
    cur: LiveState,
    pll: Pll,
    checkpoint: Checkpoint,
    /// ホストに依頼している呼び戻し時刻
    timer: Option<SimTime>,
    lookahead_cells: u64,
    /// 最後に `advance_to` した時刻
    synced_at: SimTime,
    stats: LiveStats,
}

impl LiveEngine {
    pub fn new(variant: ChipVariant, rom: GcrRom) -> Self {
        let params = LiveParams {
            encoding: variant.default_encoding,
            ..LiveParams::default()
        };
        let cur = LiveState::idle(params);
        let pll = Pll::new(variant.pll, variant.cell_period_for(params.encoding));
        LiveEngine {
            variant,
            rom,
            cur,
            pll,
            checkpoint: Checkpoint { live: cur, pll },
            timer: None,
            lookahead_cells: DEFAULT_LOOKAHEAD_CELLS,
            synced_at: SimTime::ZERO,
            stats: LiveStats::default(),
        }
    }

    /// 先読みセル数（0で投機実行なし＝ポーリング）
    pub fn set_lookahead(&mut self, cells: u64) {
        self.lookahead_cells = cells;
    }

    pub fn variant(&self) -> &ChipVariant {
        &self.variant
    }

    /// 投機中を含む現在の状態
    pub fn state(&self) -> &LiveState {
        &self.cur
    }

    /// 確定済み（チェックポイント）の状態
    pub fn committed(&self) -> &LiveState {
        &self.checkpoint.live
    }

    pub fn params(&self) -> &LiveParams {
        &self.cur.params
    }

    pub fn timer(&self) -> Option<SimTime> {
        self.timer
    }

    pub fn stats(&self) -> LiveStats {
        self.stats
    }

    pub fn is_idle(&self) -> bool {
        self.cur.phase == LivePhase::Idle
    }

    fn lookahead(&self) -> SimTime {
        self.variant
            .cell_period_for(self.cur.params.encoding)
            .times(self.lookahead_cells)
    }

    /// `now` から走り始める
    pub fn start(
        &mut self,
        now: SimTime,
        params: LiveParams,
        medium: &mut dyn FloppyMedium,
        listener: &mut dyn LiveListener,
    ) {
        if !self.is_idle() {
            self.abort(now, medium, listener);
        }
        log_live_start(now, params.drive, params.side, params.direction == Direction::Write);

        self.cur = LiveState::idle(params);
        self.cur.tm = now;
        self.cur.phase = LivePhase::Running;
        self.pll.set_clock(self.variant.cell_period_for(params.encoding));
        self.pll.reset(now);
        if params.direction == Direction::Write {
            self.pll.start_writing(now);
        }
        self.synced_at = now;
        self.checkpoint(medium);
        self.run(now, SimTime::NEVER, medium, listener);
    }

    /// 部分バイトを捨ててIDLEへ。書き込み済みの反転はコミットする
    pub fn abort(&mut self, now: SimTime, medium: &mut dyn FloppyMedium, listener: &mut dyn LiveListener) {
        if !self.cur.tm.is_never() && self.cur.tm > now {
            self.rollback(now);
            self.run_to(now, now, medium, listener);
        }
        if !self.is_idle() {
            log_live_abort(now);
        }
        self.pll.stop_writing(medium, self.cur.tm);

        let params = self.cur.params;
        self.cur = LiveState::idle(params);
        self.timer = None;
        self.checkpoint = Checkpoint {
            live: self.cur,
            pll: self.pll,
        };
    }

    /// PLLの書き込みを `tm` までコミットしてから状態を保存
    pub fn checkpoint(&mut self, medium: &mut dyn FloppyMedium) {
        self.pll.commit(medium, self.cur.tm);
        self.checkpoint = Checkpoint {
            live: self.cur,
            pll: self.pll,
        };
        self.stats.checkpoints += 1;
        log_checkpoint(self.cur.tm);
    }

    fn rollback(&mut self, now: SimTime) {
        log_rollback(self.cur.tm, self.checkpoint.live.tm, now);
        self.cur = self.checkpoint.live;
        self.pll = self.checkpoint.pll;
        self.stats.rollbacks += 1;
    }

    /// 状態を `now` にそろえる（未来なら巻き戻して再実行、過去なら保留中の遷移を適用）
    fn live_sync(&mut self, now: SimTime, medium: &mut dyn FloppyMedium, listener: &mut dyn LiveListener) {
        if self.cur.tm.is_never() {
            return;
        }
        if self.cur.tm > now {
            self.rollback(now);
            self.run_to(now, now, medium, listener);
            self.pll.commit(medium, self.cur.tm);
        } else {
            self.pll.commit(medium, self.cur.tm);
            if let Some(next) = self.cur.next_phase.take() {
                self.cur.phase = next;
            }
        }
        self.checkpoint(medium);
    }

    fn live_delay(
        &mut self,
        next: LivePhase,
        now: SimTime,
        medium: &mut dyn FloppyMedium,
        listener: &mut dyn LiveListener,
    ) {
        self.cur.next_phase = Some(next);
        if self.cur.tm != now {
            self.timer = Some(self.cur.tm);
        } else {
            self.live_sync(now, medium, listener);
        }
    }

    /// `now` までのビットと同期点をすべて処理する（レジスタアクセス・タイマーの入口）
    pub fn advance_to(&mut self, now: SimTime, medium: &mut dyn FloppyMedium, listener: &mut dyn LiveListener) {
        debug_assert!(
            self.is_idle() || now >= self.synced_at,
            "time went backwards: {} < {}",
            now,
            self.synced_at
        );
        loop {
            if matches!(self.timer, Some(t) if t <= now) {
                self.timer = None;
            }
            self.live_sync(now, medium, listener);
            self.run_to(now, now, medium, listener);

            // 再実行で保留された遷移は、次の周回の live_sync（tm <= now 側）で適用される
            let due = matches!(self.timer, Some(t) if t <= now)
                || (self.cur.phase == LivePhase::RunningSyncpoint && self.cur.next_phase.is_none())
                || (self.cur.next_phase.is_some() && self.cur.tm <= now);
            if !due {
                break;
            }
        }
        self.synced_at = now;
    }

    /// パラメータ変更（直前に同じ時刻で `advance_to` していること）
    pub fn params_mut(&mut self, now: SimTime) -> &mut LiveParams {
        debug_assert!(
            self.is_idle() || self.synced_at == now,
            "live parameters changed at {} without a sync point (last sync {})",
            now,
            self.synced_at
        );
        &mut self.cur.params
    }

    /// 読み書き方向の切り替え
    pub fn set_direction(&mut self, now: SimTime, direction: Direction, medium: &mut dyn FloppyMedium) {
        if self.cur.params.direction == direction {
            return;
        }
        self.params_mut(now).direction = direction;
        if self.is_idle() {
            return;
        }
        let tm = self.cur.tm;
        match direction {
            Direction::Write => self.pll.start_writing(tm),
            Direction::Read => {
                self.pll.stop_writing(medium, tm);
                self.pll.reset(tm);
            }
        }
    }

    pub fn set_erase(&mut self, now: SimTime, erase: bool) {
        if self.cur.params.erase != erase {
            self.params_mut(now).erase = erase;
            log_erase(erase);
        }
    }

    /// 変更後の状態を確定して投機実行を再開
    pub fn resume(&mut self, now: SimTime, medium: &mut dyn FloppyMedium, listener: &mut dyn LiveListener) {
        if self.is_idle() {
            return;
        }
        // 開始直後は投機実行済み。チェックポイントは現在時刻以前に限る
        if self.cur.tm <= now {
            self.checkpoint(medium);
        }
        self.run(now, SimTime::NEVER, medium, listener);
    }

    /// `limit` まで走る。先読み幅で打ち切った場合はその時刻に呼び戻しを依頼する
    pub fn run(
        &mut self,
        now: SimTime,
        limit: SimTime,
        medium: &mut dyn FloppyMedium,
        listener: &mut dyn LiveListener,
    ) {
        let horizon = now + self.lookahead();
        let bounded = limit > horizon;
        let stop = self.run_to(now, limit.min(horizon), medium, listener);
        if bounded && stop == Stop::OutOfTime && self.lookahead_cells > 0 {
            self.timer = Some(horizon);
        }
    }

    fn run_to(
        &mut self,
        now: SimTime,
        limit: SimTime,
        medium: &mut dyn FloppyMedium,
        listener: &mut dyn LiveListener,
    ) -> Stop {
        loop {
            if self.cur.phase == LivePhase::Idle {
                return Stop::Idle;
            }
            if self.cur.next_phase.is_some() {
                return Stop::Waiting;
            }
            match self.cur.phase {
                LivePhase::RunningSyncpoint => {
                    self.notify(listener);
                    self.cur.phase = LivePhase::Running;
                    self.checkpoint(medium);
                }
                _ => {
                    if self.cur.tm > limit {
                        return Stop::OutOfTime;
                    }
                    match self.step(limit, medium) {
                        Step::Continue => {}
                        Step::OutOfTime => return Stop::OutOfTime,
                        Step::Syncpoint => {
                            self.live_delay(LivePhase::RunningSyncpoint, now, medium, listener);
                            if self.cur.next_phase.is_some() {
                                return Stop::Waiting;
                            }
                        }
                    }
                }
            }
        }
    }

    fn notify(&mut self, listener: &mut dyn LiveListener) {
        let pending = std::mem::replace(&mut self.cur.pending, Pending::empty());
        let at = self.cur.tm;
        if pending.contains(Pending::BYTE_READY) {
            log_byte(self.cur.data, at);
            listener.byte_ready(self.cur.data, at);
        }
        if pending.contains(Pending::SYNC) {
            log_signal("SYNC", self.cur.sync, at);
            listener.sync_changed(self.cur.sync, at);
        }
        if pending.contains(Pending::SYN) {
            log_signal("SYN", self.cur.syn, at);
            listener.syn_changed(self.cur.syn, at);
        }
        if pending.contains(Pending::DECODE_ERROR) {
            log_signal("DECODE_ERROR", self.cur.decode_error, at);
            listener.decode_error_changed(self.cur.decode_error, at);
        }
        if pending.contains(Pending::CRC_ERROR) {
            log_signal("CRC_ERROR", self.cur.crc_error, at);
            listener.crc_error_changed(self.cur.crc_error, at);
        }
    }

    /// 1セル分の処理
    fn step(&mut self, limit: SimTime, medium: &mut dyn FloppyMedium) -> Step {
        let params = self.cur.params;
        let spec = params.encoding.spec();
        let read = params.direction == Direction::Read;

        let bit = if read {
            match self.pll.next_bit(&mut self.cur.tm, &*medium, limit) {
                NextBit::Bit(b) => b,
                NextBit::NeedsMoreTime => return Step::OutOfTime,
            }
        } else {
            let out = self.cur.shift_reg_write >> (spec.width - 1) & 1 != 0;
            if self.pll.write_next_bit(out, &mut self.cur.tm, limit) == WriteBit::Deferred {
                return Step::OutOfTime;
            }
            false
        };
        self.stats.bits += 1;

        let mask = spec.mask();
        let shift_reg = (self.cur.shift_reg << 1 | bit as u16) & mask;
        self.cur.shift_reg = shift_reg;
        log_bit(self.cur.tm, bit, shift_reg);

        let sync = spec.is_sync(shift_reg);
        let was_sync = self.cur.sync;
        let prev_counter = self.cur.bit_counter;

        // バイト境界
        if read {
            if sync {
                self.cur.bit_counter = 0;
                self.cur.synced = true;
            } else if !was_sync && self.cur.synced {
                self.cur.bit_counter = (self.cur.bit_counter + 1) % spec.byte_cells;
            }
        } else {
            self.cur.bit_counter = (self.cur.bit_counter + 1) % spec.byte_cells;
        }

        // 同期バイトの計数
        if !sync {
            self.cur.sync_bit_counter = 0;
            self.cur.sync_byte_counter = spec.sync_byte_preset;
        } else if was_sync {
            self.cur.sync_bit_counter += 1;
            if self.cur.sync_bit_counter == spec.byte_cells {
                self.cur.sync_bit_counter = 0;
                self.cur.sync_byte_counter = self.cur.sync_byte_counter.wrapping_add(1);
                if Some(self.cur.sync_byte_counter) == spec.sync_byte_period {
                    self.cur.sync_byte_counter = 0;
                }
            }
        }
        let syn = spec
            .sync_byte_period
            .map_or(false, |p| self.cur.sync_byte_counter == p - 1);

        let brdy = self.cur.bit_counter == spec.byte_cells - 1;
        let decode_error = self.decode(read, brdy, shift_reg, &params);
        let crc_error = if read && params.encoding != Encoding::Gcr {
            self.check_crc(sync, brdy, shift_reg, prev_counter == spec.byte_cells - 2)
        } else {
            self.cur.crc_error
        };
        if !brdy {
            self.cur.shift_reg_write = (self.cur.shift_reg_write << 1) & mask;
        }

        let mut syncpoint = false;
        if brdy != self.cur.brdy {
            self.cur.brdy = brdy;
            if brdy {
                self.cur.pending |= Pending::BYTE_READY;
            }
            syncpoint = true;
        }
        if sync != self.cur.sync {
            self.cur.sync = sync;
            self.cur.pending |= Pending::SYNC;
            syncpoint = true;
        }
        if syn != self.cur.syn {
            self.cur.syn = syn;
            self.cur.pending |= Pending::SYN;
            syncpoint = true;
        }
        if decode_error != self.cur.decode_error {
            self.cur.decode_error = decode_error;
            self.cur.pending |= Pending::DECODE_ERROR;
            syncpoint = true;
        }
        if crc_error != self.cur.crc_error {
            self.cur.crc_error = crc_error;
            self.cur.pending |= Pending::CRC_ERROR;
            syncpoint = true;
        }

        if syncpoint {
            Step::Syncpoint
        } else {
            Step::Continue
        }
    }

    /// マーク以降のCRCを積算し、フィールド末尾で照合する。戻り値はCRCエラー信号。
    /// `after_mark` は直前のマークからちょうど1バイト後であること（A1の連続）
    fn check_crc(&mut self, sync: bool, brdy: bool, shift_reg: u16, after_mark: bool) -> bool {
        if sync {
            let mark = data_bits(shift_reg);
            let base = if self.cur.field == Field::Mark && after_mark {
                self.cur.crc
            } else {
                CRC_PRESET
            };
            self.cur.crc = crc_ccitt(base, mark);
            self.cur.field = match self.cur.params.encoding {
                Encoding::Fm => Field::for_mark(mark),
                _ if mark == 0xa1 => Field::Mark,
                _ => Field::None,
            };
            self.cur.field_pos = 0;
            return false;
        }
        if !brdy || self.cur.field == Field::None {
            return self.cur.crc_error;
        }

        let data = self.cur.data;
        self.cur.crc = crc_ccitt(self.cur.crc, data);
        let len = match self.cur.field {
            Field::Mark => {
                self.cur.field = Field::for_mark(data);
                return false;
            }
            Field::Id => {
                if self.cur.field_pos == 3 {
                    self.cur.size_code = data & 3;
                }
                4
            }
            _ => 128u16 << self.cur.size_code,
        };
        self.cur.field_pos += 1;
        // CRC 2バイトまで読んだら剰余を確認
        if self.cur.field_pos == len + 2 {
            self.cur.field = Field::None;
            return self.cur.crc != 0;
        }
        false
    }

    /// デコード。バイト境界では読み取りバイトを確定し、書き込みレジスタをロードする。
    /// 戻り値はデコードエラー
    fn decode(&mut self, read: bool, brdy: bool, shift_reg: u16, params: &LiveParams) -> bool {
        match params.encoding {
            Encoding::Gcr => {
                let i = if read {
                    read_index(shift_reg)
                } else {
                    write_index(params.data, params.wrsync)
                };
                let e = self.rom.entry(i);
                self.cur.rom_index = i;
                self.cur.rom_out = e;
                if brdy {
                    if read {
                        self.cur.data = gcr_decode(e, i);
                    } else {
                        self.cur.shift_reg_write = gcr_encode(e, i);
                    }
                }
                read && brdy && e & GCR_VALID == 0
            }
            Encoding::Mfm => {
                if brdy {
                    if read {
                        self.cur.data = data_bits(shift_reg);
                    } else {
                        self.cur.shift_reg_write = if params.wrsync {
                            MFM_SYNC_A1
                        } else {
                            mfm_encode(params.data, self.cur.prev_data_bit)
                        };
                        self.cur.prev_data_bit = params.wrsync || params.data & 1 != 0;
                    }
                }
                read && brdy && mfm_violation(shift_reg)
            }
            Encoding::Fm => {
                if brdy {
                    if read {
                        self.cur.data = data_bits(shift_reg);
                    } else {
                        let clock = if params.wrsync { FM_MARK_CLOCK } else { 0xff };
                        self.cur.shift_reg_write = fm_encode(params.data, clock);
                    }
                }
                read && brdy && fm_violation(shift_reg)
            }
        }
    }
}
