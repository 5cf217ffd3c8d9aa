//! エラー型
//!
//! メディア上の不正（同期なし、不正なGCRコード）はエラーではなく信号・ステータスで表す。
//! ここにあるのはホスト側の誤用と未実装経路のみ。

use thiserror::Error;

use crate::variant::Encoding;

#[derive(Debug, Error)]
pub enum FdcError {
    /// コマンドレジスタに未実装のコマンドが書かれた
    #[error("unimplemented command {0:#04x}")]
    UnimplementedCommand(u8),
    /// このチップが対応していない記録方式
    #[error("{variant} does not support {encoding:?} encoding")]
    UnsupportedEncoding {
        variant: &'static str,
        encoding: Encoding,
    },
    #[error("invalid drive number {0}")]
    InvalidDrive(usize),
    #[error("GCR ROM must be exactly {expected} bytes (got {actual})")]
    RomSize { expected: usize, actual: usize },
    #[error("save state version {found} is not supported (expected {expected})")]
    IncompatibleState { found: u32, expected: u32 },
    #[error("unknown controller variant '{0}'")]
    UnknownVariant(String),
    /// トラック数・ヘッド数が0のイメージ
    #[error("disk image has no tracks ({tracks} tracks, {heads} heads)")]
    DiskGeometry { tracks: usize, heads: usize },
    #[error("disk image: {0}")]
    Image(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
