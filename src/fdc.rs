//! コントローラのレジスタ・フロントエンド
//!
//! レジスタアクセスのたびにライブエンジンをアクセス時刻までそろえ、
//! 変更を加えてからチェックポイントを取り、投機実行を再開する。
//!
//! レジスタ配置:
//! - 0: ステータス（読み）／コマンド（書き）
//! - 1: トラック
//! - 2: セクタ
//! - 3: データ
//! - 4: コントロール（モーター、サイド、ドライブ、FM、イレース）

use crate::config::{resolve_path, FdcConfig};
use crate::error::FdcError;
use crate::gcr::GcrRom;
use crate::live::{Direction, LiveEngine, LiveEvent, LiveEventKind, LiveListener, LiveParams, LiveState, LiveStats};
use crate::live_log::{log_command, log_drive_select, log_sync_timeout, ByteRing};
use crate::medium::{FloppyDrive, FloppyMedium, FluxDisk};
use crate::savestate::{DriveState, FdcState, RegisterState, SeekState};
use crate::time::SimTime;
use crate::variant::{ChipVariant, Encoding};

pub const REG_STATUS: u8 = 0;
pub const REG_TRACK: u8 = 1;
pub const REG_SECTOR: u8 = 2;
pub const REG_DATA: u8 = 3;
pub const REG_CONTROL: u8 = 4;

pub const CMD_RESTORE: u8 = 0x00;
pub const CMD_SEEK: u8 = 0x10;
pub const CMD_READ: u8 = 0x80;
pub const CMD_WRITE: u8 = 0xa0;
pub const CMD_FORCE_INTERRUPT: u8 = 0xd0;

/// 同期が見つからないときのタイムアウト（約5回転）
pub const DEFAULT_SYNC_TIMEOUT: SimTime = SimTime::from_msec(1000);

bitflags::bitflags! {
    /// ステータスレジスタ
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Status: u8 {
        const BUSY          = 0x01;
        const DRQ           = 0x02;
        const LOST_DATA     = 0x04;
        /// 不正なコード語またはCRC不一致。一度立つと次のコマンドまで残る
        const DECODE_ERROR  = 0x08;
        /// 同期タイムアウト、サイド照合の不一致
        const NO_SYNC       = 0x10;
        const SYNC          = 0x20;
        const WRITE_PROTECT = 0x40;
        const NOT_READY     = 0x80;
    }
}

bitflags::bitflags! {
    /// コントロールレジスタ
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Control: u8 {
        const MOTOR0 = 0x01;
        const MOTOR1 = 0x02;
        /// 読み出し専用（選択ドライブのトラック0センサ）
        const TRK00  = 0x04;
        const SIDE   = 0x10;
        const DRIVE  = 0x20;
        /// 単密度（FM）
        const FM     = 0x40;
        const ERASE  = 0x80;
    }
}

/// コマンド終了で消えるステータス
const COMMAND_STATUS: Status = Status::DRQ
    .union(Status::LOST_DATA)
    .union(Status::DECODE_ERROR)
    .union(Status::NO_SYNC)
    .union(Status::WRITE_PROTECT);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Seek {
    target: usize,
    done_at: SimTime,
}

/// レジスタとライン（ライブエンジンからの通知先）
#[derive(Debug, Default)]
struct Registers {
    status: Status,
    track: u8,
    sector: u8,
    data: u8,
    control: Control,
    command: u8,
    intrq: bool,
    /// コマンド開始後に同期を見た
    seen_sync: bool,
    ring: ByteRing,
    events: Vec<LiveEvent>,
}

impl LiveListener for Registers {
    fn byte_ready(&mut self, data: u8, at: SimTime) {
        if self.status.contains(Status::DRQ) {
            self.status |= Status::LOST_DATA;
        }
        self.status |= Status::DRQ;
        self.ring.push(data);
        self.events.push(LiveEvent {
            at,
            kind: LiveEventKind::ByteReady(data),
        });
    }

    fn sync_changed(&mut self, active: bool, at: SimTime) {
        if active {
            self.seen_sync = true;
        }
        self.events.push(LiveEvent {
            at,
            kind: LiveEventKind::Sync(active),
        });
    }

    fn syn_changed(&mut self, active: bool, at: SimTime) {
        self.events.push(LiveEvent {
            at,
            kind: LiveEventKind::Syn(active),
        });
    }

    fn decode_error_changed(&mut self, active: bool, at: SimTime) {
        if active {
            self.status |= Status::DECODE_ERROR;
            self.ring.dump(16);
        }
        self.events.push(LiveEvent {
            at,
            kind: LiveEventKind::DecodeError(active),
        });
    }

    fn crc_error_changed(&mut self, active: bool, at: SimTime) {
        if active {
            self.status |= Status::DECODE_ERROR;
            self.ring.dump(8);
        }
        self.events.push(LiveEvent {
            at,
            kind: LiveEventKind::CrcError(active),
        });
    }
}

/// フロッピーディスクコントローラ（2ドライブ）
#[derive(Debug)]
pub struct Fdc {
    engine: LiveEngine,
    regs: Registers,
    drives: [FloppyDrive; 2],
    seek: Option<Seek>,
    sync_deadline: Option<SimTime>,
    sync_timeout: SimTime,
    /// 最後のアクセス時刻
    now: SimTime,
}

impl Fdc {
    pub fn new(variant: ChipVariant, rom: GcrRom) -> Self {
        Fdc {
            engine: LiveEngine::new(variant, rom),
            regs: Registers::default(),
            drives: [FloppyDrive::new(), FloppyDrive::new()],
            seek: None,
            sync_deadline: None,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            now: SimTime::ZERO,
        }
    }

    /// 設定からコントローラを組み立てる（ROM・ディスクのパスは実行ファイル基準）
    pub fn from_config(config: &FdcConfig) -> Result<Self, FdcError> {
        let rom = match &config.gcr_rom {
            Some(path) => GcrRom::load(resolve_path(path))?,
            None => GcrRom::builtin(),
        };
        let mut fdc = Fdc::new(config.variant.variant(), rom);
        fdc.set_lookahead(config.lookahead_cells);
        fdc.set_sync_timeout(SimTime::from_usec(config.sync_timeout_us));
        for drive in fdc.drives.iter_mut() {
            drive.rpm = config.rpm;
        }
        if let Some(path) = &config.disk {
            let mut disk = FluxDisk::load(resolve_path(path))?;
            disk.jitter(config.jitter_ns, config.seed);
            fdc.insert_disk(0, disk)?;
        }
        Ok(fdc)
    }

    pub fn variant(&self) -> &ChipVariant {
        self.engine.variant()
    }

    pub fn set_lookahead(&mut self, cells: u64) {
        self.engine.set_lookahead(cells);
    }

    pub fn set_sync_timeout(&mut self, timeout: SimTime) {
        self.sync_timeout = timeout;
    }

    pub fn drive(&self, index: usize) -> Result<&FloppyDrive, FdcError> {
        self.drives.get(index).ok_or(FdcError::InvalidDrive(index))
    }

    pub fn drive_mut(&mut self, index: usize) -> Result<&mut FloppyDrive, FdcError> {
        self.drives.get_mut(index).ok_or(FdcError::InvalidDrive(index))
    }

    pub fn insert_disk(&mut self, index: usize, disk: FluxDisk) -> Result<(), FdcError> {
        disk.check_geometry()?;
        self.drive_mut(index)?.insert_disk(disk);
        Ok(())
    }

    pub fn eject_disk(&mut self, index: usize) -> Result<Option<FluxDisk>, FdcError> {
        Ok(self.drive_mut(index)?.eject_disk())
    }

    /// 割り込み要求ライン
    pub fn intrq(&self) -> bool {
        self.regs.intrq
    }

    /// データ要求ライン
    pub fn drq(&self) -> bool {
        self.regs.status.contains(Status::DRQ)
    }

    /// 通知ログを取り出す
    pub fn take_events(&mut self) -> Vec<LiveEvent> {
        std::mem::take(&mut self.regs.events)
    }

    pub fn live_state(&self) -> &LiveState {
        self.engine.state()
    }

    pub fn stats(&self) -> LiveStats {
        self.engine.stats()
    }

    /// 副作用なしのステータス
    pub fn status(&self) -> Status {
        let mut status = self.regs.status & COMMAND_STATUS;
        if !self.engine.is_idle() || self.seek.is_some() {
            status |= Status::BUSY;
        }
        if self.engine.committed().sync {
            status |= Status::SYNC;
        }
        if !self.drives[self.selected_drive()].is_ready() {
            status |= Status::NOT_READY;
        }
        status
    }

    fn selected_drive(&self) -> usize {
        self.regs.control.contains(Control::DRIVE) as usize
    }

    fn selected_side(&self) -> usize {
        self.regs.control.contains(Control::SIDE) as usize
    }

    fn encoding(&self) -> Encoding {
        let variant = self.variant();
        if self.regs.control.contains(Control::FM) && variant.supports(Encoding::Fm) {
            Encoding::Fm
        } else {
            variant.default_encoding
        }
    }

    // ============================================================
    // ライブエンジンとの同期
    // ============================================================

    fn advance(&mut self, now: SimTime) {
        debug_assert!(now >= self.now, "register access at {} before {}", now, self.now);
        self.now = now;
        let d = self.engine.params().drive;
        self.engine.advance_to(now, &mut self.drives[d], &mut self.regs);
    }

    /// `now` まで進めてタイマーを処理し、変更の前にチェックポイントを取る
    fn sync_point(&mut self, now: SimTime) {
        self.advance(now);
        self.poll_timers(now);
        let d = self.engine.params().drive;
        self.engine.checkpoint(&mut self.drives[d]);
    }

    fn resume(&mut self, now: SimTime) {
        let d = self.engine.params().drive;
        self.engine.resume(now, &mut self.drives[d], &mut self.regs);
    }

    fn abort_live(&mut self, now: SimTime) {
        let d = self.engine.params().drive;
        self.engine.abort(now, &mut self.drives[d], &mut self.regs);
        self.sync_deadline = None;
    }

    fn poll_timers(&mut self, now: SimTime) {
        if let Some(seek) = self.seek {
            if seek.done_at <= now {
                self.complete_seek(seek);
            }
        }
        if let Some(deadline) = self.sync_deadline {
            if self.regs.seen_sync {
                self.sync_deadline = None;
            } else if deadline <= now {
                log_sync_timeout(now, self.drives[self.selected_drive()].cyl);
                self.regs.status |= Status::NO_SYNC;
                self.abort_live(now);
                self.regs.intrq = true;
            }
        }
    }

    // ============================================================
    // ホスト側のスケジューリング
    // ============================================================

    /// 次に `update` を呼ぶべき時刻
    pub fn next_deadline(&self) -> Option<SimTime> {
        [
            self.engine.timer(),
            self.seek.map(|s| s.done_at),
            self.sync_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// タイマー満了時（またはポーリング）の処理
    pub fn update(&mut self, now: SimTime) {
        self.sync_point(now);
        self.resume(now);
    }

    /// `end` まで期限を順に処理する
    pub fn run_until(&mut self, end: SimTime) {
        while let Some(t) = self.next_deadline() {
            if t > end {
                break;
            }
            self.update(t.max(self.now));
        }
        self.update(end);
    }

    // ============================================================
    // レジスタアクセス
    // ============================================================

    pub fn io_read(&mut self, offset: u8, now: SimTime) -> u8 {
        self.sync_point(now);
        let value = match offset {
            REG_STATUS => {
                let status = self.status();
                self.regs.intrq = false;
                status.bits()
            }
            REG_TRACK => self.regs.track,
            REG_SECTOR => self.regs.sector,
            REG_DATA => {
                self.regs.status.remove(Status::DRQ);
                self.engine.committed().data
            }
            REG_CONTROL => {
                let mut control = self.regs.control;
                control.set(Control::TRK00, self.drives[self.selected_drive()].trk00());
                control.bits()
            }
            _ => 0xff,
        };
        self.resume(now);
        value
    }

    pub fn io_write(&mut self, offset: u8, value: u8, now: SimTime) -> Result<(), FdcError> {
        self.sync_point(now);
        let result = match offset {
            REG_STATUS => self.write_command(value, now),
            REG_TRACK => {
                self.regs.track = value;
                Ok(())
            }
            REG_SECTOR => {
                self.regs.sector = value;
                Ok(())
            }
            REG_DATA => {
                self.regs.data = value;
                self.regs.status.remove(Status::DRQ);
                if !self.engine.is_idle() {
                    self.engine.params_mut(now).data = value;
                }
                Ok(())
            }
            REG_CONTROL => self.write_control(value, now),
            _ => Ok(()),
        };
        self.resume(now);
        result
    }

    fn write_control(&mut self, value: u8, now: SimTime) -> Result<(), FdcError> {
        let control = Control::from_bits_truncate(value) - Control::TRK00;
        if control.contains(Control::FM) {
            self.variant().check_encoding(Encoding::Fm)?;
        }
        self.regs.control = control;

        self.drives[0].set_motor(control.contains(Control::MOTOR0), now);
        self.drives[1].set_motor(control.contains(Control::MOTOR1), now);
        if !control.intersects(Control::MOTOR0 | Control::MOTOR1) && !self.engine.is_idle() {
            self.abort_live(now);
        }

        self.select(now, self.selected_drive(), self.selected_side());
        self.engine.set_erase(now, control.contains(Control::ERASE));
        Ok(())
    }

    fn select(&mut self, now: SimTime, drive: usize, side: usize) {
        let params = *self.engine.params();
        if params.drive == drive && params.side == side && self.drives[drive].head == side {
            return;
        }
        log_drive_select(drive, side);
        self.drives[drive].set_head(side);
        let params = self.engine.params_mut(now);
        params.drive = drive;
        params.side = side;
    }

    fn write_command(&mut self, command: u8, now: SimTime) -> Result<(), FdcError> {
        match command >> 4 {
            0x0 => {
                log_command(command, "RESTORE", now);
                self.start_seek(command, 0, now);
            }
            0x1 => {
                log_command(command, "SEEK", now);
                self.start_seek(command, self.regs.data as usize, now);
            }
            0x8 => {
                log_command(command, "READ", now);
                self.cmd_read(command, now);
            }
            0xa => {
                log_command(command, "WRITE", now);
                self.cmd_write(command, now);
            }
            0xd => {
                log_command(command, "FORCE INTERRUPT", now);
                self.abort_live(now);
                self.seek = None;
                self.regs.status.remove(Status::DRQ);
                self.regs.intrq = true;
            }
            _ => return Err(FdcError::UnimplementedCommand(command)),
        }
        self.regs.command = command;
        Ok(())
    }

    fn begin_command(&mut self) {
        self.regs.status.remove(COMMAND_STATUS);
        self.regs.intrq = false;
        self.regs.seen_sync = false;
        self.regs.ring.clear();
    }

    fn start_seek(&mut self, command: u8, target: usize, now: SimTime) {
        if !self.engine.is_idle() {
            self.abort_live(now);
        }
        self.begin_command();
        let drive = &self.drives[self.selected_drive()];
        let target = target.min(drive.max_cyl);
        let steps = drive.cyl.abs_diff(target) as u64;
        let seek = Seek {
            target,
            done_at: now + self.variant().step_time(command & 3).times(steps),
        };
        if steps == 0 {
            self.complete_seek(seek);
        } else {
            self.seek = Some(seek);
        }
    }

    fn complete_seek(&mut self, seek: Seek) {
        self.seek = None;
        let d = self.selected_drive();
        self.drives[d].set_track(seek.target);
        self.regs.track = self.drives[d].cyl as u8;
        self.regs.intrq = true;
    }

    /// READ/WRITEのビット1によるサイド選択・照合。照合に失敗したら `false`
    fn apply_side_bits(&mut self, command: u8, now: SimTime) -> bool {
        if command & 0x02 == 0 {
            return true;
        }
        let side = (command >> 3 & 1) as usize;
        let variant = *self.variant();
        if variant.side_control {
            self.regs.control.set(Control::SIDE, side == 1);
            self.select(now, self.selected_drive(), side);
        } else if variant.side_compare && side != self.selected_side() {
            self.regs.status |= Status::NO_SYNC;
            self.regs.intrq = true;
            return false;
        }
        true
    }

    fn live_params(&self, direction: Direction, wrsync: bool) -> LiveParams {
        LiveParams {
            drive: self.selected_drive(),
            side: self.selected_side(),
            direction,
            data: self.regs.data,
            wrsync,
            erase: self.regs.control.contains(Control::ERASE),
            encoding: self.encoding(),
        }
    }

    fn start_live(&mut self, now: SimTime, params: LiveParams) {
        let d = params.drive;
        self.engine.start(now, params, &mut self.drives[d], &mut self.regs);
    }

    fn cmd_read(&mut self, command: u8, now: SimTime) {
        self.begin_command();
        if !self.apply_side_bits(command, now) {
            return;
        }
        if !self.engine.is_idle() {
            let d = self.engine.params().drive;
            self.engine.set_direction(now, Direction::Read, &mut self.drives[d]);
            self.engine.params_mut(now).wrsync = false;
        } else if self.drives[self.selected_drive()].is_ready() {
            let params = self.live_params(Direction::Read, false);
            self.start_live(now, params);
        } else {
            self.regs.intrq = true;
            return;
        }
        self.sync_deadline = Some(now + self.sync_timeout);
    }

    fn cmd_write(&mut self, command: u8, now: SimTime) {
        self.begin_command();
        if !self.apply_side_bits(command, now) {
            return;
        }
        let drive = &self.drives[self.selected_drive()];
        let (protected, ready) = (drive.is_write_protected(), drive.is_ready());
        if protected {
            self.regs.status |= Status::WRITE_PROTECT;
            self.regs.intrq = true;
            return;
        }
        let wrsync = command & 0x01 != 0;
        if !self.engine.is_idle() {
            let d = self.engine.params().drive;
            self.engine.set_direction(now, Direction::Write, &mut self.drives[d]);
            let data = self.regs.data;
            let params = self.engine.params_mut(now);
            params.wrsync = wrsync;
            params.data = data;
        } else if ready {
            let params = self.live_params(Direction::Write, wrsync);
            self.start_live(now, params);
        } else {
            self.regs.intrq = true;
            return;
        }
        self.sync_deadline = None;
    }

    // ============================================================
    // セーブステート
    // ============================================================

    /// レジスタとドライブの状態（ライブ状態は保存しない）
    pub fn save_state(&self) -> FdcState {
        FdcState {
            version: FdcState::CURRENT_VERSION,
            variant: self.variant().name.to_string(),
            registers: RegisterState {
                status: (self.regs.status & COMMAND_STATUS).bits(),
                track: self.regs.track,
                sector: self.regs.sector,
                data: self.regs.data,
                control: self.regs.control.bits(),
                command: self.regs.command,
                intrq: self.regs.intrq,
            },
            drives: self
                .drives
                .iter()
                .map(|d| DriveState {
                    cyl: d.cyl,
                    head: d.head,
                    motor_on: d.motor_on,
                    rpm: d.rpm,
                    disk: d.disk.clone(),
                })
                .collect(),
            seek: self.seek.map(|s| SeekState {
                target: s.target,
                done_at: s.done_at,
            }),
            time: self.now,
        }
    }

    /// 復元（ライブ実行は中断されIDLEから再開）
    pub fn load_state(&mut self, state: &FdcState, now: SimTime) -> Result<(), FdcError> {
        if state.version != FdcState::CURRENT_VERSION {
            return Err(FdcError::IncompatibleState {
                found: state.version,
                expected: FdcState::CURRENT_VERSION,
            });
        }
        if state.variant != self.variant().name {
            return Err(FdcError::UnknownVariant(state.variant.clone()));
        }
        for disk in state.drives.iter().filter_map(|d| d.disk.as_ref()) {
            disk.check_geometry()?;
        }
        self.sync_point(now);
        self.abort_live(now);

        let r = &state.registers;
        self.regs.status = Status::from_bits_truncate(r.status) & COMMAND_STATUS;
        self.regs.track = r.track;
        self.regs.sector = r.sector;
        self.regs.data = r.data;
        self.regs.control = Control::from_bits_truncate(r.control) - Control::TRK00;
        self.regs.command = r.command;
        self.regs.intrq = r.intrq;
        self.regs.seen_sync = false;
        self.regs.ring.clear();

        for (drive, saved) in self.drives.iter_mut().zip(&state.drives) {
            drive.cyl = saved.cyl;
            drive.head = saved.head;
            drive.rpm = saved.rpm;
            drive.disk = saved.disk.clone();
            drive.motor_on = false;
            drive.set_motor(saved.motor_on, now);
        }
        // 保存時刻からの残り時間を引き継ぐ
        self.seek = state.seek.map(|s| Seek {
            target: s.target,
            done_at: now + SimTime::from_nsec(s.done_at.as_nsec().saturating_sub(state.time.as_nsec())),
        });

        let (drive, side) = (self.selected_drive(), self.selected_side());
        self.select(now, drive, side);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::DEFAULT_LOOKAHEAD_CELLS;
    use crate::mfm::{crc_ccitt_bytes, CRC_PRESET};
    use crate::variant::{FD1793, FD1797, VICTOR_9000, WD1772};

    fn us(n: u64) -> SimTime {
        SimTime::from_usec(n)
    }

    fn gcr_bits(sync_bytes: usize, data: &[u8]) -> Vec<bool> {
        let rom = GcrRom::builtin();
        let mut bits = vec![true; sync_bytes * 10];
        for &b in data {
            let code = rom.encode(b, false);
            bits.extend((0..10).rev().map(|i| code >> i & 1 != 0));
        }
        bits
    }

    fn victor_fdc(disk: FluxDisk) -> Fdc {
        let mut fdc = Fdc::new(VICTOR_9000, GcrRom::builtin());
        fdc.insert_disk(0, disk).unwrap();
        fdc
    }

    fn bytes_after_sync(events: &[LiveEvent]) -> Vec<u8> {
        let start = events
            .iter()
            .position(|e| e.kind == LiveEventKind::Sync(true))
            .expect("no sync seen");
        events[start..]
            .iter()
            .filter_map(|e| match e.kind {
                LiveEventKind::ByteReady(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_write_then_read_back() {
        let mut fdc = victor_fdc(FluxDisk::new(80, 2));
        let mut now = SimTime::ZERO;
        fdc.io_write(REG_CONTROL, Control::MOTOR0.bits(), now).unwrap();
        fdc.io_write(REG_DATA, 0xff, now).unwrap();
        fdc.io_write(REG_STATUS, CMD_WRITE | 0x01, now).unwrap();
        assert!(fdc.status().contains(Status::BUSY));

        // DRQごとに次のバイトを渡す: 同期6バイト、0x08、0xA5、埋め草
        let mut drqs = 0;
        while drqs < 11 {
            now = now + us(1);
            assert!(now < SimTime::from_msec(1), "write stalled after {} bytes", drqs);
            fdc.update(now);
            if !fdc.drq() {
                continue;
            }
            drqs += 1;
            match drqs {
                1..=5 => fdc.io_write(REG_DATA, 0xff, now).unwrap(),
                6 => {
                    fdc.io_write(REG_STATUS, CMD_WRITE, now).unwrap();
                    fdc.io_write(REG_DATA, 0x08, now).unwrap();
                }
                7 => fdc.io_write(REG_DATA, 0xa5, now).unwrap(),
                _ => fdc.io_write(REG_DATA, 0x55, now).unwrap(),
            }
        }
        assert!(!fdc.status().contains(Status::LOST_DATA));
        fdc.io_write(REG_STATUS, CMD_FORCE_INTERRUPT, now).unwrap();
        assert!(fdc.intrq());
        assert_eq!(fdc.io_read(REG_STATUS, now) & Status::BUSY.bits(), 0);
        assert!(!fdc.intrq());
        fdc.take_events();

        // 1回転後、書き込み開始位置の少し手前から読む
        let rev = fdc.drive(0).unwrap().revolution();
        now = rev - us(100);
        fdc.run_until(now);
        fdc.io_write(REG_STATUS, CMD_READ, now).unwrap();
        let end = now + us(600);
        while now < end {
            now = now + us(1);
            fdc.update(now);
            if fdc.drq() {
                fdc.io_read(REG_DATA, now);
            }
        }
        let bytes = bytes_after_sync(&fdc.take_events());
        assert_eq!(&bytes[..2], &[0x08, 0xa5]);
        assert_eq!(&bytes[2..4], &[0x55, 0x55]);
    }

    fn two_sided_disk() -> FluxDisk {
        let mut disk = FluxDisk::new(80, 2);
        disk.write_cells(0, 0, 0, 2130, gcr_bits(8, &[0x08, 0x11, 0x22, 0x33]));
        disk.write_cells(0, 1, 0, 2130, gcr_bits(8, &[0x08, 0x99, 0xaa, 0xbb]));
        disk
    }

    fn start_reading(fdc: &mut Fdc) {
        fdc.io_write(REG_CONTROL, Control::MOTOR0.bits(), SimTime::ZERO).unwrap();
        fdc.io_write(REG_STATUS, CMD_READ, SimTime::ZERO).unwrap();
    }

    #[test]
    fn test_side_switch_rollback_matches_polling() {
        let side1 = (Control::MOTOR0 | Control::SIDE).bits();

        // 投機実行あり: 30usのアクセスで巻き戻しが起きる
        let mut a = victor_fdc(two_sided_disk());
        start_reading(&mut a);
        a.run_until(us(30));
        a.io_write(REG_CONTROL, side1, us(30)).unwrap();
        a.run_until(us(300));

        // 投機実行なし: 1usごとのポーリング
        let mut b = victor_fdc(two_sided_disk());
        b.set_lookahead(0);
        start_reading(&mut b);
        for n in 1..=300 {
            if n == 30 {
                b.io_write(REG_CONTROL, side1, us(n)).unwrap();
            } else {
                b.update(us(n));
            }
        }

        assert!(a.stats().rollbacks > 0);
        assert_eq!(b.stats().rollbacks, 0);
        let events = a.take_events();
        assert_eq!(events, b.take_events());
        assert_eq!(&bytes_after_sync(&events)[..4], &[0x08, 0x99, 0xaa, 0xbb]);
        assert_eq!(a.drive(0).unwrap().head, 1);
    }

    #[test]
    fn test_blank_disk_times_out() {
        let mut fdc = victor_fdc(FluxDisk::new(80, 2));
        fdc.set_sync_timeout(us(500));
        start_reading(&mut fdc);
        assert!(fdc.status().contains(Status::BUSY));
        assert_eq!(fdc.next_deadline().map(|t| t <= us(500)), Some(true));

        fdc.run_until(SimTime::from_msec(1));
        assert!(fdc.intrq());
        let status = Status::from_bits_truncate(fdc.io_read(REG_STATUS, SimTime::from_msec(1)));
        assert!(status.contains(Status::NO_SYNC));
        assert!(!status.contains(Status::BUSY));
        assert!(!status.contains(Status::DRQ));
        assert!(fdc.take_events().is_empty());
    }

    #[test]
    fn test_read_not_ready() {
        let mut fdc = victor_fdc(FluxDisk::new(80, 2));
        fdc.io_write(REG_STATUS, CMD_READ, SimTime::ZERO).unwrap();
        let status = fdc.status();
        assert!(status.contains(Status::NOT_READY));
        assert!(!status.contains(Status::BUSY));
        assert!(fdc.intrq());
    }

    #[test]
    fn test_lost_data_and_drq() {
        let mut disk = FluxDisk::new(80, 2);
        disk.write_cells(0, 0, 0, 2130, gcr_bits(6, &[0x08, 0x11, 0x22]));
        let mut fdc = victor_fdc(disk);
        start_reading(&mut fdc);
        fdc.run_until(us(150));
        // 最初のバイト（同期60セル＋10セル後）
        assert!(fdc.drq());
        assert_eq!(fdc.io_read(REG_DATA, us(150)), 0x08);
        assert!(!fdc.drq());
        // 読まずに2バイト流す
        fdc.run_until(us(200));
        let status = fdc.status();
        assert!(status.contains(Status::DRQ));
        assert!(status.contains(Status::LOST_DATA));
        assert!(status.contains(Status::BUSY));
    }

    #[test]
    fn test_seek_and_restore() {
        let mut fdc = victor_fdc(FluxDisk::new(80, 2));
        fdc.io_write(REG_DATA, 5, SimTime::ZERO).unwrap();
        fdc.io_write(REG_STATUS, CMD_SEEK, SimTime::ZERO).unwrap();
        assert!(fdc.status().contains(Status::BUSY));
        assert_eq!(fdc.next_deadline(), Some(SimTime::from_msec(15)));

        fdc.run_until(SimTime::from_msec(20));
        assert!(fdc.intrq());
        assert_eq!(fdc.io_read(REG_TRACK, SimTime::from_msec(20)), 5);
        assert_eq!(fdc.drive(0).unwrap().cyl, 5);
        assert_eq!(fdc.io_read(REG_CONTROL, SimTime::from_msec(20)) & Control::TRK00.bits(), 0);

        fdc.io_write(REG_STATUS, CMD_RESTORE, SimTime::from_msec(20)).unwrap();
        fdc.run_until(SimTime::from_msec(40));
        assert_eq!(fdc.drive(0).unwrap().cyl, 0);
        assert_ne!(fdc.io_read(REG_CONTROL, SimTime::from_msec(40)) & Control::TRK00.bits(), 0);
        assert!(!fdc.status().contains(Status::BUSY));
    }

    #[test]
    fn test_unimplemented_command() {
        let mut fdc = victor_fdc(FluxDisk::new(80, 2));
        assert!(matches!(
            fdc.io_write(REG_STATUS, 0x40, SimTime::ZERO),
            Err(FdcError::UnimplementedCommand(0x40))
        ));
        assert_eq!(fdc.io_read(7, SimTime::ZERO), 0xff);
    }

    #[test]
    fn test_fm_not_supported_on_gcr_only() {
        let mut fdc = victor_fdc(FluxDisk::new(80, 2));
        let result = fdc.io_write(REG_CONTROL, (Control::MOTOR0 | Control::FM).bits(), SimTime::ZERO);
        assert!(matches!(result, Err(FdcError::UnsupportedEncoding { .. })));
    }

    #[test]
    fn test_write_protected() {
        let mut disk = FluxDisk::new(80, 2);
        disk.write_protected = true;
        let mut fdc = victor_fdc(disk);
        fdc.io_write(REG_CONTROL, Control::MOTOR0.bits(), SimTime::ZERO).unwrap();
        fdc.io_write(REG_STATUS, CMD_WRITE | 0x01, SimTime::ZERO).unwrap();
        let status = fdc.status();
        assert!(status.contains(Status::WRITE_PROTECT));
        assert!(!status.contains(Status::BUSY));
        assert!(fdc.intrq());
    }

    #[test]
    fn test_side_compare_mismatch() {
        let mut fdc = Fdc::new(FD1793, GcrRom::builtin());
        fdc.insert_disk(0, FluxDisk::new(80, 2)).unwrap();
        fdc.io_write(REG_CONTROL, Control::MOTOR0.bits(), SimTime::ZERO).unwrap();
        // サイド1を要求、選択はサイド0
        fdc.io_write(REG_STATUS, CMD_READ | 0x0a, SimTime::ZERO).unwrap();
        assert!(fdc.status().contains(Status::NO_SYNC));
        assert!(!fdc.status().contains(Status::BUSY));
        assert!(fdc.intrq());

        fdc.io_write(REG_STATUS, CMD_READ | 0x02, us(10)).unwrap();
        assert!(fdc.status().contains(Status::BUSY));
        assert_eq!(fdc.live_state().params.encoding, Encoding::Mfm);
    }

    #[test]
    fn test_side_control_selects_head() {
        let mut fdc = Fdc::new(FD1797, GcrRom::builtin());
        fdc.insert_disk(0, FluxDisk::new(80, 2)).unwrap();
        fdc.io_write(REG_CONTROL, (Control::MOTOR0 | Control::FM).bits(), SimTime::ZERO).unwrap();
        fdc.io_write(REG_STATUS, CMD_READ | 0x0a, SimTime::ZERO).unwrap();
        assert_eq!(fdc.drive(0).unwrap().head, 1);
        assert_ne!(fdc.io_read(REG_CONTROL, us(1)) & Control::SIDE.bits(), 0);
        assert_eq!(fdc.live_state().params.encoding, Encoding::Fm);
        assert_eq!(fdc.live_state().params.side, 1);
    }

    #[test]
    fn test_motor_off_aborts() {
        let mut fdc = victor_fdc(two_sided_disk());
        start_reading(&mut fdc);
        fdc.run_until(us(50));
        fdc.io_write(REG_CONTROL, 0, us(50)).unwrap();
        assert!(fdc.live_state().tm.is_never());
        assert!(fdc.status().contains(Status::NOT_READY));
        assert!(!fdc.status().contains(Status::BUSY));
        assert_eq!(fdc.next_deadline(), None);
    }

    #[test]
    fn test_save_and_load_state() {
        let mut fdc = victor_fdc(two_sided_disk());
        fdc.io_write(REG_SECTOR, 7, SimTime::ZERO).unwrap();
        fdc.io_write(REG_DATA, 3, SimTime::ZERO).unwrap();
        fdc.io_write(REG_CONTROL, (Control::MOTOR0 | Control::SIDE).bits(), SimTime::ZERO)
            .unwrap();
        fdc.io_write(REG_STATUS, CMD_SEEK, SimTime::ZERO).unwrap();
        let state = fdc.save_state();

        let json = serde_json::to_string(&state).unwrap();
        let restored: FdcState = serde_json::from_str(&json).unwrap();
        let mut other = Fdc::new(VICTOR_9000, GcrRom::builtin());
        other.load_state(&restored, us(100)).unwrap();

        assert_eq!(other.io_read(REG_SECTOR, us(100)), 7);
        assert_eq!(other.drive(0).unwrap().head, 1);
        assert!(other.drive(0).unwrap().motor_on);
        let disk = other.drive(0).unwrap().disk.as_ref().unwrap();
        assert_eq!(disk.track(0, 1), fdc.drive(0).unwrap().disk.as_ref().unwrap().track(0, 1));
        // 残り9msのシーク
        assert_eq!(other.next_deadline(), Some(us(100) + SimTime::from_msec(9)));

        let mut wrong = Fdc::new(FD1793, GcrRom::builtin());
        assert!(wrong.load_state(&restored, us(100)).is_err());
    }

    #[test]
    fn test_illegal_code_sets_sticky_decode_error() {
        // 0x395: 上位5ビット 11100 はどのニブルにも対応しない
        let rom = GcrRom::builtin();
        assert_eq!(rom.decode(0x395), None);
        let mut bits = gcr_bits(6, &[0x08]);
        bits.extend((0..10).rev().map(|i| 0x395u16 >> i & 1 != 0));
        bits.extend((0..10).rev().map(|i| rom.encode(0xa5, false) >> i & 1 != 0));
        let mut disk = FluxDisk::new(80, 2);
        disk.write_cells(0, 0, 0, 2130, bits);

        let mut fdc = victor_fdc(disk);
        start_reading(&mut fdc);
        // 同期60セル＋3バイト
        let end = SimTime::from_nsec(2130 * 92);
        fdc.run_until(end);
        let events = fdc.take_events();
        let ready: Vec<SimTime> = events
            .iter()
            .filter(|e| matches!(e.kind, LiveEventKind::ByteReady(_)))
            .map(|e| e.at)
            .collect();
        assert_eq!(ready.len(), 3);
        let error_at = events
            .iter()
            .find(|e| e.kind == LiveEventKind::DecodeError(true))
            .map(|e| e.at);
        assert_eq!(error_at, Some(ready[1]));
        assert!(events.iter().any(|e| e.kind == LiveEventKind::DecodeError(false)));

        // 正しいバイトの後も残る
        assert!(fdc.status().contains(Status::DECODE_ERROR));
        fdc.io_write(REG_STATUS, CMD_READ, end).unwrap();
        assert!(!fdc.status().contains(Status::DECODE_ERROR));
    }

    #[test]
    fn test_zero_geometry_disk_rejected() {
        let disk: FluxDisk = serde_json::from_str(r#"{"tracks":0,"heads":0,"cells":[]}"#).unwrap();
        let mut fdc = Fdc::new(VICTOR_9000, GcrRom::builtin());
        assert!(matches!(
            fdc.insert_disk(0, disk.clone()),
            Err(FdcError::DiskGeometry { tracks: 0, heads: 0 })
        ));
        assert!(fdc.drive(0).unwrap().disk.is_none());

        let mut state = fdc.save_state();
        state.drives[0].disk = Some(disk);
        assert!(matches!(
            fdc.load_state(&state, SimTime::ZERO),
            Err(FdcError::DiskGeometry { .. })
        ));
    }

    /// DRQごとに1バイトずつ渡して書き込む（1usポーリング）。書き込み終了時刻を返す
    fn write_polled(fdc: &mut Fdc, stream: &[(u8, bool)]) -> SimTime {
        let mut now = SimTime::ZERO;
        let (first, first_sync) = stream[0];
        fdc.io_write(REG_DATA, first, now).unwrap();
        fdc.io_write(REG_STATUS, CMD_WRITE | first_sync as u8, now).unwrap();
        assert!(fdc.status().contains(Status::BUSY));

        let mut wrsync = first_sync;
        let mut next = 1;
        let mut filler = 0;
        while filler < 2 {
            now = now + us(1);
            assert!(now < SimTime::from_msec(5), "write stalled after {} bytes", next);
            fdc.update(now);
            if !fdc.drq() {
                continue;
            }
            match stream.get(next) {
                Some(&(byte, sync)) => {
                    if sync != wrsync {
                        fdc.io_write(REG_STATUS, CMD_WRITE | sync as u8, now).unwrap();
                        wrsync = sync;
                    }
                    fdc.io_write(REG_DATA, byte, now).unwrap();
                    next += 1;
                }
                None => {
                    fdc.io_write(REG_DATA, 0x4e, now).unwrap();
                    filler += 1;
                }
            }
        }
        assert!(!fdc.status().contains(Status::LOST_DATA));
        fdc.io_write(REG_STATUS, CMD_FORCE_INTERRUPT, now).unwrap();
        now
    }

    /// 1回転後、書き込み開始の100us手前から `span` の間読む
    fn read_polled(fdc: &mut Fdc, span: SimTime) -> Vec<LiveEvent> {
        let start = fdc.drive(0).unwrap().revolution() - us(100);
        fdc.run_until(start);
        fdc.take_events();
        fdc.io_write(REG_STATUS, CMD_READ, start).unwrap();
        let mut now = start;
        while now < start + span {
            now = now + us(1);
            fdc.update(now);
            if fdc.drq() {
                fdc.io_read(REG_DATA, now);
            }
        }
        fdc.take_events()
    }

    fn id_field(mark: u8, prefix: &[u8], id: [u8; 4]) -> Vec<u8> {
        let mut field = vec![mark];
        field.extend(id);
        let crc = crc_ccitt_bytes(CRC_PRESET, &[prefix, &field[..]].concat());
        field.extend([(crc >> 8) as u8, crc as u8]);
        field
    }

    #[test]
    fn test_wd1772_mfm_polled_write_read_back() {
        let id = id_field(0xfe, &[0xa1, 0xa1, 0xa1], [0x00, 0x00, 0x01, 0x02]);
        assert_eq!(&id[5..], &[0xca, 0x6f]);
        let mut stream = vec![(0x00, false); 12];
        stream.extend([(0xa1, true); 3]);
        stream.extend(id.iter().map(|&b| (b, false)));

        let mut traces = Vec::new();
        for cells in [0, DEFAULT_LOOKAHEAD_CELLS] {
            let mut fdc = Fdc::new(WD1772, GcrRom::builtin());
            fdc.set_lookahead(cells);
            fdc.insert_disk(0, FluxDisk::new(80, 2)).unwrap();
            fdc.io_write(REG_CONTROL, Control::MOTOR0.bits(), SimTime::ZERO).unwrap();
            write_polled(&mut fdc, &stream);
            assert!(!fdc.drive(0).unwrap().disk.as_ref().unwrap().track(0, 0).is_empty());

            let events = read_polled(&mut fdc, us(1000));
            assert_eq!(&bytes_after_sync(&events)[..7], &id[..]);
            assert!(!events.iter().any(|e| e.kind == LiveEventKind::CrcError(true)));
            traces.push(events);
        }
        assert_eq!(traces[0], traces[1]);
    }

    #[test]
    fn test_wd1772_fm_polled_write_read_back() {
        let id = id_field(0xfe, &[], [0x05, 0x00, 0x03, 0x00]);
        let mut stream = vec![(0x00, false); 6];
        stream.push((0xfe, true));
        stream.extend(id[1..].iter().map(|&b| (b, false)));

        let mut traces = Vec::new();
        for cells in [0, DEFAULT_LOOKAHEAD_CELLS] {
            let mut fdc = Fdc::new(WD1772, GcrRom::builtin());
            fdc.set_lookahead(cells);
            fdc.insert_disk(0, FluxDisk::new(80, 2)).unwrap();
            fdc.io_write(REG_CONTROL, (Control::MOTOR0 | Control::FM).bits(), SimTime::ZERO)
                .unwrap();
            write_polled(&mut fdc, &stream);

            let events = read_polled(&mut fdc, us(1500));
            // FMではマーク自体が同期パターン
            assert_eq!(&bytes_after_sync(&events)[..6], &id[1..]);
            assert!(!events.iter().any(|e| e.kind == LiveEventKind::CrcError(true)));
            traces.push(events);
        }
        assert_eq!(traces[0], traces[1]);
    }

    #[test]
    fn test_bad_id_crc_sets_decode_error() {
        let mut id = id_field(0xfe, &[0xa1, 0xa1, 0xa1], [0x00, 0x00, 0x01, 0x02]);
        id[6] ^= 0x01;
        let mut stream = vec![(0x00, false); 12];
        stream.extend([(0xa1, true); 3]);
        stream.extend(id.iter().map(|&b| (b, false)));

        let mut fdc = Fdc::new(FD1793, GcrRom::builtin());
        fdc.insert_disk(0, FluxDisk::new(80, 2)).unwrap();
        fdc.io_write(REG_CONTROL, Control::MOTOR0.bits(), SimTime::ZERO).unwrap();
        write_polled(&mut fdc, &stream);
        let events = read_polled(&mut fdc, us(1000));

        let ready: Vec<SimTime> = events
            .iter()
            .skip_while(|e| e.kind != LiveEventKind::Sync(true))
            .filter(|e| matches!(e.kind, LiveEventKind::ByteReady(_)))
            .map(|e| e.at)
            .collect();
        let error_at = events
            .iter()
            .find(|e| e.kind == LiveEventKind::CrcError(true))
            .map(|e| e.at);
        // マーク＋ID 4バイト＋CRC 2バイトの最後
        assert_eq!(error_at, Some(ready[6]));
        assert!(fdc.status().contains(Status::DECODE_ERROR));
    }
}
