//! スキルスクリプトへの安全なテキスト編集
//!
//! ファイル全体の書き換えはコード消失につながるため、検索置換のみを
//! 許可する。old_stringは逐語一致でちょうど1回出現しなければ適用
//! されない。曖昧な編集は失敗させて人間に差し戻す方が安全。

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EditError {
    /// old_stringがファイル内に見つからない
    #[error("old_string not found in {path}")]
    NotFound { path: String },
    /// old_stringが複数回出現して一意に定まらない
    #[error("old_string occurs {count} times in {path}, must be unique")]
    NotUnique { path: String, count: usize },
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// 提案された1件の編集
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProposedEdit {
    /// 対象ファイル（スキルディレクトリからの相対パス）
    pub file: String,
    pub old_text: String,
    pub new_text: String,
}

/// 編集をファイルに適用
///
/// old_textがちょうど1回逐語一致する場合のみ置換する。
pub fn apply_edit(path: &Path, old_text: &str, new_text: &str) -> Result<(), EditError> {
    let display = path.display().to_string();

    let content = std::fs::read_to_string(path).map_err(|source| EditError::Io {
        path: display.clone(),
        source,
    })?;

    let count = content.matches(old_text).count();
    match count {
        0 => Err(EditError::NotFound { path: display }),
        1 => {
            let updated = content.replacen(old_text, new_text, 1);
            std::fs::write(path, updated).map_err(|source| EditError::Io {
                path: display,
                source,
            })
        }
        n => Err(EditError::NotUnique {
            path: display,
            count: n,
        }),
    }
}

/// 編集が適用可能かを書き込まずに検証
pub fn check_edit(path: &Path, old_text: &str) -> Result<(), EditError> {
    let display = path.display().to_string();

    let content = std::fs::read_to_string(path).map_err(|source| EditError::Io {
        path: display.clone(),
        source,
    })?;

    match content.matches(old_text).count() {
        0 => Err(EditError::NotFound { path: display }),
        1 => Ok(()),
        n => Err(EditError::NotUnique {
            path: display,
            count: n,
        }),
    }
}
