//! 設定ファイル管理モジュール
//!
//! コントローラの設定をJSON形式で永続化

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::FdcError;
use crate::fdc::DEFAULT_SYNC_TIMEOUT;
use crate::live::DEFAULT_LOOKAHEAD_CELLS;
use crate::variant::VariantName;

/// 設定ファイルのデフォルトファイル名
const CONFIG_FILENAME: &str = "fdc_config.json";

/// 実行ファイルのディレクトリを取得
pub fn get_exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// 相対パスを実行ファイルディレクトリからの絶対パスに解決
pub fn resolve_path(relative: &str) -> PathBuf {
    let path = Path::new(relative);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        get_exe_dir().join(relative)
    }
}

/// 設定ファイルのパスを取得
pub fn get_config_path() -> PathBuf {
    get_exe_dir().join(CONFIG_FILENAME)
}

/// コントローラ設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdcConfig {
    /// チップ種別
    #[serde(default)]
    pub variant: VariantName,
    /// 同期タイムアウト（マイクロ秒）
    #[serde(default = "default_sync_timeout_us")]
    pub sync_timeout_us: u64,
    /// 投機実行の先読みセル数（0でポーリング動作）
    #[serde(default = "default_lookahead_cells")]
    pub lookahead_cells: u64,
    /// ドライブの回転数
    #[serde(default = "default_rpm")]
    pub rpm: u32,
    /// ログカテゴリ（"flow+state" 形式）
    #[serde(default)]
    pub log: String,
    /// 外部GCR ROM（2048バイト）。未指定なら内蔵テーブル
    pub gcr_rom: Option<String>,
    /// ドライブ0に入れる磁束イメージ
    pub disk: Option<String>,
    /// 磁束反転の揺らぎ（ns、0で無効）
    #[serde(default)]
    pub jitter_ns: u32,
    /// 揺らぎの乱数シード
    #[serde(default)]
    pub seed: u64,
}

fn default_sync_timeout_us() -> u64 { DEFAULT_SYNC_TIMEOUT.as_nsec() / 1000 }
fn default_lookahead_cells() -> u64 { DEFAULT_LOOKAHEAD_CELLS }
fn default_rpm() -> u32 { 300 }

impl Default for FdcConfig {
    fn default() -> Self {
        FdcConfig {
            variant: VariantName::default(),
            sync_timeout_us: default_sync_timeout_us(),
            lookahead_cells: default_lookahead_cells(),
            rpm: default_rpm(),
            log: String::new(),
            gcr_rom: None,
            disk: None,
            jitter_ns: 0,
            seed: 0,
        }
    }
}

impl FdcConfig {
    /// 設定ファイルを読み込む（実行ファイルと同じディレクトリから）
    pub fn load() -> Self {
        Self::load_from(get_config_path())
    }

    /// 指定したパスから設定を読み込む（なければデフォルト）
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("Failed to parse config {:?}: {}, using defaults", path.as_ref(), e);
                    FdcConfig::default()
                }
            },
            Err(_) => FdcConfig::default(),
        }
    }

    /// 設定ファイルを保存する（実行ファイルと同じディレクトリに）
    pub fn save(&self) -> Result<(), FdcError> {
        self.save_to(get_config_path())
    }

    /// 指定したパスに設定を保存する
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), FdcError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
