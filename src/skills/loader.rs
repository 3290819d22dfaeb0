//! スキル定義の読み込み
//!
//! SKILL.mdのYAML frontmatterと、スクリプト自身が宣言するargparseの
//! サブコマンド定義からスキルを組み立てる。ツールスキーマとスクリプトの
//! 二重管理を避けるため、アクション一覧は常にスクリプトから抽出する。

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// スキルのメタデータ（YAML frontmatter）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillMetadata {
    /// スキル名
    pub name: String,
    /// 説明
    #[serde(default)]
    pub description: String,
    /// バージョン
    #[serde(default = "default_version")]
    pub version: String,
    /// トリガーワード
    #[serde(default)]
    pub triggers: Vec<String>,
    /// 意図ヒント（埋め込みルーティング用の自然文）
    #[serde(default)]
    pub intent_hints: Vec<String>,
    /// 管理者権限が必要なアクション名
    #[serde(default)]
    pub admin_actions: Vec<String>,
    /// スクリプトが--humanによる要約出力をサポートするか
    #[serde(default)]
    pub summarize: bool,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// アクションのパラメータ定義（実行コードではなく説明メタデータ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    /// パラメータ名（--を除いたフラグ名）
    pub name: String,
    /// ヘルプテキスト
    pub help_text: String,
    /// 型ヒント（argparseのtype=から抽出、なければ"str"）
    pub type_hint: String,
}

/// スキルの単一アクション定義
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    /// アクション名（例: "turn-on"）
    pub name: String,
    /// 説明（argparseのhelp=から抽出）
    pub description: String,
    /// パラメータ一覧
    pub parameters: Vec<ParamSpec>,
}

/// スキル定義
#[derive(Debug, Clone)]
pub struct Skill {
    /// メタデータ
    pub metadata: SkillMetadata,
    /// スクリプトから抽出したアクション一覧
    pub actions: Vec<ActionSpec>,
    /// 実行スクリプトのパス（ドキュメントのみのスキルはNone）
    pub script_path: Option<PathBuf>,
    /// スキルディレクトリのパス
    pub path: PathBuf,
}

impl Skill {
    /// スキルディレクトリ（SKILL.md + scripts/）から読み込み
    pub async fn load_from_dir(skill_dir: &Path) -> Result<Self> {
        let skill_md = skill_dir.join("SKILL.md");
        let content = fs::read_to_string(&skill_md).await?;
        let metadata = Self::extract_frontmatter(&content)?;

        // scripts/内の*_api.pyを探す
        let scripts = find_api_scripts(&skill_dir.join("scripts")).await;

        // スキル名にちなんだスクリプトを優先、なければ最初のもの
        let preferred = format!("{}_api.py", metadata.name.replace('-', "_"));
        let script_path = scripts
            .iter()
            .find(|p| p.file_name().and_then(|n| n.to_str()) == Some(preferred.as_str()))
            .or_else(|| scripts.first())
            .cloned();

        // 全スクリプトからアクションを抽出
        let mut actions = Vec::new();
        for script in &scripts {
            if let Ok(source) = fs::read_to_string(script).await {
                actions.extend(extract_actions(&source));
            }
        }

        Ok(Self {
            metadata,
            actions,
            script_path,
            path: skill_dir.to_path_buf(),
        })
    }

    /// frontmatter（---で囲まれた部分）を抽出
    pub fn extract_frontmatter(content: &str) -> Result<SkillMetadata> {
        let content = content.trim();

        if !content.starts_with("---") {
            return Err(anyhow::anyhow!("Missing YAML frontmatter"));
        }

        // 2つ目の---を探す
        let rest = &content[3..];
        if let Some(end_pos) = rest.find("---") {
            let yaml_content = rest[..end_pos].trim();
            let metadata: SkillMetadata = serde_yaml::from_str(yaml_content)?;
            Ok(metadata)
        } else {
            Err(anyhow::anyhow!("Invalid frontmatter: missing closing ---"))
        }
    }

    /// トリガーワードにマッチするか確認
    pub fn matches_trigger(&self, input: &str) -> bool {
        let input_lower = input.to_lowercase();
        self.metadata
            .triggers
            .iter()
            .any(|trigger| input_lower.contains(&trigger.to_lowercase()))
    }

    /// ドキュメントのみ（実行スクリプトなし）か
    pub fn is_documentation_only(&self) -> bool {
        self.script_path.is_none()
    }

    /// アクション名からActionSpecを取得（"_"は"-"に正規化）
    pub fn find_action(&self, name: &str) -> Option<&ActionSpec> {
        let normalized = name.replace('_', "-");
        self.actions.iter().find(|a| a.name == normalized)
    }

    /// このアクションに管理者権限が必要か
    pub fn is_admin_action(&self, action: &str) -> bool {
        let normalized = action.replace('_', "-");
        self.metadata
            .admin_actions
            .iter()
            .any(|a| a == &normalized)
    }
}

/// ディレクトリ内の*_api.pyスクリプトを列挙
async fn find_api_scripts(scripts_dir: &Path) -> Vec<PathBuf> {
    let mut scripts = Vec::new();
    if let Ok(mut entries) = fs::read_dir(scripts_dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("");
            if name.ends_with("_api.py") {
                scripts.push(path);
            }
        }
    }
    scripts.sort();
    scripts
}

/// スクリプトのargparse定義からアクションを抽出
///
/// `add_parser("name", help="...")` を探し、その次のadd_parserまでの
/// 範囲にある `add_argument("--flag", help="...")` をパラメータとして拾う。
pub fn extract_actions(source: &str) -> Vec<ActionSpec> {
    let parser_re =
        Regex::new(r#"(?s)add_parser\(\s*["']([^"']+)["'].*?help\s*=\s*["']([^"']+)["']"#)
            .unwrap();
    let arg_re = Regex::new(
        r#"add_argument\(\s*["']--([\w-]+)["'][^)]*?help\s*=\s*["']([^"']+)["'][^)]*\)"#,
    )
    .unwrap();
    let type_re = Regex::new(r#"type\s*=\s*(\w+)"#).unwrap();

    // add_parserの出現位置で区切り、区間ごとにadd_argumentを走査
    let matches: Vec<_> = parser_re.captures_iter(source).collect();
    let starts: Vec<usize> = parser_re.find_iter(source).map(|m| m.start()).collect();

    let mut actions = Vec::new();
    for (i, cap) in matches.iter().enumerate() {
        let name = cap[1].to_string();
        let description = cap[2].to_string();

        let segment_start = starts[i];
        let segment_end = starts.get(i + 1).copied().unwrap_or(source.len());
        let segment = &source[segment_start..segment_end];

        let mut parameters = Vec::new();
        for arg_cap in arg_re.captures_iter(segment) {
            let full_call = arg_cap.get(0).map(|m| m.as_str()).unwrap_or("");
            let type_hint = type_re
                .captures(full_call)
                .map(|c| c[1].to_string())
                .unwrap_or_else(|| "str".to_string());
            parameters.push(ParamSpec {
                name: arg_cap[1].to_string(),
                help_text: arg_cap[2].to_string(),
                type_hint,
            });
        }

        actions.push(ActionSpec {
            name,
            description,
            parameters,
        });
    }

    actions
}
