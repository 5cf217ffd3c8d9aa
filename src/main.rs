//! FDC-Live - Floppy disk controller core in Rust
//!
//! コマンドラインからコントローラを動かし、1トラックに書き込んで読み戻す。
//!
//! # 使用方法
//! ```text
//! fdc-live --variant victor9000 --bytes "08 a5 5a" --log flow+state
//! fdc-live --variant wd1772 --jitter 150 --seed 3 --save-disk track.json
//! ```

use clap::Parser;

use fdc_live::config::FdcConfig;
use fdc_live::error::FdcError;
use fdc_live::fdc::{Control, Fdc, Status, CMD_FORCE_INTERRUPT, CMD_READ, CMD_SEEK, CMD_WRITE, REG_CONTROL, REG_DATA, REG_STATUS};
use fdc_live::live::LiveEventKind;
use fdc_live::live_log::{parse_log_level, set_log_level};
use fdc_live::medium::FluxDisk;
use fdc_live::time::SimTime;
use fdc_live::variant::Encoding;

/// FDC-Live - Floppy disk controller core
#[derive(Parser, Debug)]
#[command(name = "fdc-live")]
#[command(author = "FDC-Live Project")]
#[command(version = "0.1.0")]
#[command(about = "Floppy disk controller with PLL bit recovery and live decoding", long_about = None)]
struct Args {
    /// コントローラ種別 (victor9000, fd1771, fd1793, fd1797, wd1770, wd1772)
    #[arg(short, long)]
    variant: Option<String>,

    /// 設定ファイル（省略時は実行ファイルと同じディレクトリの fdc_config.json）
    #[arg(short, long)]
    config: Option<String>,

    /// ログカテゴリ: none, flow, state, decide, bits, all
    /// 複数指定可: flow+state+decide
    #[arg(long)]
    log: Option<String>,

    /// 書き込むデータ（16進、空白区切り）
    #[arg(short, long, default_value = "08 a5 5a c3")]
    bytes: String,

    /// 対象トラック
    #[arg(short, long, default_value = "0")]
    track: u8,

    /// サイド（0/1）
    #[arg(short, long, default_value = "0")]
    side: u8,

    /// 単密度（FM）で記録
    #[arg(long)]
    fm: bool,

    /// 書き込み後の磁束反転に加える揺らぎ（ns）
    #[arg(long)]
    jitter: Option<u32>,

    /// 揺らぎの乱数シード
    #[arg(long)]
    seed: Option<u64>,

    /// 投機実行の先読みセル数（0でポーリング）
    #[arg(long)]
    lookahead: Option<u64>,

    /// 磁束イメージ（JSON）をドライブ0に読み込む
    #[arg(short, long)]
    disk: Option<String>,

    /// 外部GCR ROM（2048バイト）
    #[arg(long)]
    gcr_rom: Option<String>,

    /// 結果の磁束イメージを保存
    #[arg(long)]
    save_disk: Option<String>,

    /// 現在の設定を設定ファイルに保存
    #[arg(long)]
    save_config: bool,
}

/// 16進のバイト列を解析
fn parse_bytes(s: &str) -> Vec<u8> {
    s.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .filter_map(|t| match u8::from_str_radix(t.trim_start_matches("0x"), 16) {
            Ok(b) => Some(b),
            Err(_) => {
                log::warn!("ignoring '{}' (not a hex byte)", t);
                None
            }
        })
        .collect()
}

/// 記録方式ごとの同期部（データ, 同期書き込み）
fn preamble(encoding: Encoding) -> Vec<(u8, bool)> {
    match encoding {
        Encoding::Gcr => vec![(0xff, true); 6],
        Encoding::Mfm => {
            let mut p = vec![(0x00, false); 12];
            p.extend([(0xa1, true); 3]);
            p
        }
        Encoding::Fm => {
            let mut p = vec![(0x00, false); 6];
            p.push((0xfe, true));
            p
        }
    }
}

/// 次の期限まで進める（期限がなければ1us）
fn step(fdc: &mut Fdc, now: SimTime) -> SimTime {
    let next = fdc
        .next_deadline()
        .filter(|&t| t > now)
        .unwrap_or(now + SimTime::from_usec(1))
        .min(now + SimTime::from_usec(1));
    fdc.update(next);
    next
}

/// DRQごとに1バイトずつ渡して書き込む。最後のバイトが出終わった時刻を返す
fn write_stream(fdc: &mut Fdc, mut now: SimTime, stream: &[(u8, bool)]) -> Result<SimTime, FdcError> {
    let (first, first_sync) = stream[0];
    fdc.io_write(REG_DATA, first, now)?;
    fdc.io_write(REG_STATUS, CMD_WRITE | first_sync as u8, now)?;
    if !fdc.status().contains(Status::BUSY) {
        println!("write refused: status {:02X}", fdc.status().bits());
        return Ok(now);
    }

    let mut wrsync = first_sync;
    let mut queued = 1;
    let mut flushed = 0;
    let limit = now + SimTime::from_msec(200);
    while flushed < 2 && now < limit {
        now = step(fdc, now);
        if !fdc.drq() {
            continue;
        }
        if queued < stream.len() {
            let (byte, sync) = stream[queued];
            if sync != wrsync {
                fdc.io_write(REG_STATUS, CMD_WRITE | sync as u8, now)?;
                wrsync = sync;
            }
            fdc.io_write(REG_DATA, byte, now)?;
            queued += 1;
        } else {
            // 最後のバイトのロードと送出を待つ
            fdc.io_write(REG_DATA, 0x00, now)?;
            flushed += 1;
        }
    }
    fdc.io_write(REG_STATUS, CMD_FORCE_INTERRUPT, now)?;
    Ok(now)
}

/// 同期の後に現れたバイトを `count` 個集める
fn read_back(fdc: &mut Fdc, mut now: SimTime, count: usize) -> Result<Vec<u8>, FdcError> {
    fdc.take_events();
    fdc.io_write(REG_STATUS, CMD_READ, now)?;
    let mut seen_sync = false;
    let mut bytes = Vec::new();
    let limit = now + SimTime::from_msec(250);
    while bytes.len() < count && now < limit && fdc.status().contains(Status::BUSY) {
        now = step(fdc, now);
        if fdc.drq() {
            fdc.io_read(REG_DATA, now);
        }
        for event in fdc.take_events() {
            match event.kind {
                LiveEventKind::Sync(true) => seen_sync = true,
                LiveEventKind::ByteReady(b) if seen_sync && bytes.len() < count => bytes.push(b),
                _ => {}
            }
        }
    }
    fdc.io_write(REG_STATUS, CMD_FORCE_INTERRUPT, now)?;
    Ok(bytes)
}

fn run(args: Args) -> Result<(), FdcError> {
    let mut config = match &args.config {
        Some(path) => FdcConfig::load_from(path),
        None => FdcConfig::load(),
    };
    if let Some(v) = &args.variant {
        config.variant = v.parse()?;
    }
    if let Some(log) = &args.log {
        config.log = log.clone();
    }
    if let Some(jitter) = args.jitter {
        config.jitter_ns = jitter;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(cells) = args.lookahead {
        config.lookahead_cells = cells;
    }
    if args.disk.is_some() {
        config.disk = args.disk.clone();
    }
    if args.gcr_rom.is_some() {
        config.gcr_rom = args.gcr_rom.clone();
    }
    set_log_level(parse_log_level(&config.log));
    if args.save_config {
        config.save()?;
        println!("config saved");
    }

    let mut fdc = Fdc::from_config(&config)?;
    if fdc.drive(0)?.disk.is_none() {
        fdc.insert_disk(0, FluxDisk::new(80, 2))?;
    }
    let variant = *fdc.variant();
    let encoding = if args.fm && variant.supports(Encoding::Fm) {
        Encoding::Fm
    } else {
        variant.default_encoding
    };
    println!("variant: {} ({:?}, {:?} PLL)", variant.name, encoding, variant.pll);

    // モーターON、サイド選択、シーク
    let mut control = Control::MOTOR0;
    control.set(Control::SIDE, args.side & 1 != 0);
    control.set(Control::FM, encoding == Encoding::Fm && variant.default_encoding != Encoding::Fm);
    let mut now = SimTime::ZERO;
    fdc.io_write(REG_CONTROL, control.bits(), now)?;
    fdc.io_write(REG_DATA, args.track, now)?;
    fdc.io_write(REG_STATUS, CMD_SEEK, now)?;
    while let Some(t) = fdc.next_deadline() {
        now = t.max(now);
        fdc.update(now);
    }
    println!("track {} side {} at {}", fdc.drive(0)?.cyl, args.side & 1, now);

    let data = parse_bytes(&args.bytes);
    let mut stream = preamble(encoding);
    stream.extend(data.iter().map(|&b| (b, false)));
    let write_start = now;
    now = write_stream(&mut fdc, now, &stream)?;
    println!("wrote {} bytes ({} preamble) by {}", stream.len(), stream.len() - data.len(), now);

    if config.jitter_ns > 0 {
        if let Some(disk) = fdc.drive_mut(0)?.disk.as_mut() {
            disk.jitter(config.jitter_ns, config.seed);
        }
    }

    // 1回転後、書き込み開始位置の少し手前から読む
    let rev = fdc.drive(0)?.revolution();
    now = (write_start + rev - SimTime::from_usec(100)).max(now);
    fdc.run_until(now);
    let read = read_back(&mut fdc, now, data.len())?;
    let hex: Vec<String> = read.iter().map(|b| format!("{:02X}", b)).collect();
    println!("read back: {}", hex.join(" "));
    println!("{}", if read == data { "match" } else { "MISMATCH" });

    let stats = fdc.stats();
    println!(
        "checkpoints: {}, rollbacks: {}, bits: {}",
        stats.checkpoints, stats.rollbacks, stats.bits
    );

    if let Some(path) = &args.save_disk {
        if let Some(disk) = &fdc.drive(0)?.disk {
            disk.save(path)?;
            println!("disk saved to {}", path);
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
