//! スキルレジストリ - スナップショット方式のスキル管理
//!
//! 読み手は常にArc<SkillSnapshot>を受け取る。reload()はディスクから
//! 全体を作り直してから一括で差し替えるため、部分更新された状態が
//! 見えることはない。

use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::fs;

use super::loader::Skill;

/// レジストリの不変スナップショット
#[derive(Debug)]
pub struct SkillSnapshot {
    /// 登録順のスキル一覧（同点時のタイブレークに使用）
    skills: Vec<Skill>,
    /// 名前 -> skills内インデックス
    by_name: HashMap<String, usize>,
}

impl SkillSnapshot {
    /// 空のスナップショット
    pub fn empty() -> Self {
        Self {
            skills: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    fn from_skills(skills: Vec<Skill>) -> Self {
        let by_name = skills
            .iter()
            .enumerate()
            .map(|(i, s)| (s.metadata.name.clone(), i))
            .collect();
        Self { skills, by_name }
    }

    /// テスト用: スキル一覧から直接スナップショットを構築
    #[cfg(test)]
    pub fn for_tests(skills: Vec<Skill>) -> Self {
        Self::from_skills(skills)
    }

    /// 名前でスキルを取得
    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.by_name.get(name).map(|&i| &self.skills[i])
    }

    /// 登録順のスキル一覧
    pub fn list(&self) -> &[Skill] {
        &self.skills
    }

    /// スキルの登録順インデックス（タイブレーク用）
    pub fn registration_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// スキル名一覧を取得
    pub fn names(&self) -> Vec<String> {
        self.skills.iter().map(|s| s.metadata.name.clone()).collect()
    }

    /// スキル数を取得
    pub fn len(&self) -> usize {
        self.skills.len()
    }

    /// スキルが空かチェック
    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

/// スキルレジストリ
pub struct SkillRegistry {
    /// 現在のスナップショット（全体差し替えのみ）
    current: RwLock<Arc<SkillSnapshot>>,
    /// スキル探索パス
    skills_path: PathBuf,
}

impl SkillRegistry {
    /// 指定ディレクトリを探索パスとするレジストリを作成
    pub fn new(skills_path: PathBuf) -> Self {
        Self {
            current: RwLock::new(Arc::new(SkillSnapshot::empty())),
            skills_path,
        }
    }

    /// デフォルトの探索パス（~/.homelab-agent/skills/）
    pub fn default_skills_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".homelab-agent").join("skills"))
            .unwrap_or_else(|| PathBuf::from("skills"))
    }

    /// 現在のスナップショットを取得（軽量、読み手はブロックしない）
    pub fn current(&self) -> Arc<SkillSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// ディスクから全スキルを読み直し、スナップショットを差し替え
    pub async fn reload(&self) -> Result<Arc<SkillSnapshot>> {
        let skills = load_all_skills(&self.skills_path).await?;
        let snapshot = Arc::new(SkillSnapshot::from_skills(skills));

        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::clone(&snapshot);

        tracing::info!(count = snapshot.len(), "Skill registry reloaded");
        Ok(snapshot)
    }
}

/// ディレクトリ配下の全スキルを読み込み
///
/// 壊れたスキル定義はwarnを出してスキップし、リロード全体は失敗させない。
async fn load_all_skills(skills_path: &Path) -> Result<Vec<Skill>> {
    let mut skills = Vec::new();

    if !skills_path.exists() {
        tracing::warn!(path = %skills_path.display(), "Skills path does not exist");
        return Ok(skills);
    }

    // ソートして登録順を決定的にする
    let mut dirs = Vec::new();
    let mut entries = fs::read_dir(skills_path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string();
        if path.is_dir() && !name.starts_with('.') && name != "__pycache__" {
            dirs.push(path);
        }
    }
    dirs.sort();

    for skill_dir in dirs {
        if !skill_dir.join("SKILL.md").exists() {
            continue;
        }
        match Skill::load_from_dir(&skill_dir).await {
            Ok(skill) => {
                if skill.is_documentation_only() {
                    tracing::debug!(skill = %skill.metadata.name, "Skipping documentation-only skill");
                } else {
                    tracing::info!(
                        skill = %skill.metadata.name,
                        actions = skill.actions.len(),
                        "Loaded skill"
                    );
                    skills.push(skill);
                }
            }
            Err(e) => {
                tracing::warn!(dir = %skill_dir.display(), error = %e, "Failed to parse skill, skipping");
            }
        }
    }

    Ok(skills)
}
