//! 決定的な引数抽出
//!
//! HIGH tierのルーティング結果に対してのみ呼ばれる。よく知られた
//! エンティティ（部屋名、カメラ名、VM番号、時間範囲）を正規表現で
//! 抽出し、LLM呼び出しを省略する。マッチャーは固定の優先順で試行され、
//! 一度束縛されたパラメータを後続のマッチャーが上書きすることはない。

use regex::Regex;
use std::collections::HashMap;

use crate::skills::Skill;

/// 部屋名の正規化テーブル（英語 + ドイツ語エイリアス）
const ROOM_NAMES: &[(&str, &str)] = &[
    ("living room", "living_room"),
    ("wohnzimmer", "living_room"),
    ("bedroom", "bedroom"),
    ("schlafzimmer", "bedroom"),
    ("kitchen", "kitchen"),
    ("küche", "kitchen"),
    ("kueche", "kitchen"),
    ("bathroom", "bathroom"),
    ("bad", "bathroom"),
    ("hallway", "hallway"),
    ("flur", "hallway"),
    ("office", "office"),
    ("büro", "office"),
    ("buero", "office"),
    ("basement", "basement"),
    ("keller", "basement"),
    ("garage", "garage"),
    ("terrace", "terrace"),
    ("terrasse", "terrace"),
    ("balcony", "balcony"),
    ("balkon", "balcony"),
    ("garden", "garden"),
    ("garten", "garden"),
];

/// カメラ名の正規化テーブル
const CAMERA_NAMES: &[(&str, &str)] = &[
    ("driveway", "Driveway"),
    ("einfahrt", "Driveway"),
    ("garden", "Garden"),
    ("garten", "Garden"),
    ("front door", "Front Door"),
    ("haustür", "Front Door"),
    ("haustur", "Front Door"),
    ("garage", "Garage"),
    ("basement", "Basement"),
    ("keller", "Basement"),
    ("terrace", "Terrace"),
    ("terrasse", "Terrace"),
];

/// 引数抽出器
pub struct ArgExtractor;

impl ArgExtractor {
    /// メッセージから引数を決定的に抽出
    ///
    /// 返り値が空でも失敗ではない（呼び出し側がLLM分類へ降格する）。
    pub fn extract(message: &str, skill: &str, action: Option<&str>) -> HashMap<String, String> {
        let mut args = HashMap::new();
        let msg_lower = message.to_lowercase();

        match skill {
            "unifi-protect" => Self::extract_protect(&msg_lower, action, &mut args),
            "homeassistant" => Self::extract_homeassistant(&msg_lower, &mut args),
            "proxmox" => Self::extract_proxmox(message, action, &mut args),
            "pihole" => Self::extract_pihole(&msg_lower, &mut args),
            _ => {}
        }

        // 時間範囲はスキル横断（既に束縛済みなら上書きしない）
        if !args.contains_key("last") {
            if let Some(range) = Self::extract_time_range(&msg_lower) {
                args.insert("last".to_string(), range);
            }
        }

        if !args.is_empty() {
            tracing::info!(skill, ?action, ?args, "Extracted args");
        }

        args
    }

    /// 抽出結果がアクションの宣言パラメータを1つでも満たすか
    ///
    /// アクションがパラメータを宣言しているのに何も束縛できなかった
    /// 場合は、抽出を信用せずLLM分類へ降格する。
    pub fn satisfies(args: &HashMap<String, String>, skill: &Skill, action: &str) -> bool {
        match skill.find_action(action) {
            Some(spec) if !spec.parameters.is_empty() => spec
                .parameters
                .iter()
                .any(|p| args.contains_key(&p.name) || args.contains_key(&p.name.replace('-', "_"))),
            // パラメータなしのアクションは引数不要
            _ => true,
        }
    }

    fn extract_protect(msg: &str, action: Option<&str>, args: &mut HashMap<String, String>) {
        for (key, canonical) in CAMERA_NAMES {
            if msg.contains(key) {
                args.entry("camera".to_string())
                    .or_insert_with(|| canonical.to_string());
                break;
            }
        }

        if action == Some("detections") {
            let detection = if ["kennzeichen", "nummernschild", "plate", "license"]
                .iter()
                .any(|w| msg.contains(w))
            {
                Some("plate")
            } else if ["gesicht", "face"].iter().any(|w| msg.contains(w)) {
                Some("face")
            } else if ["auto", "fahrzeug", "vehicle", "car"].iter().any(|w| msg.contains(w)) {
                Some("vehicle")
            } else if ["person", "mensch", "jemand", "someone"].iter().any(|w| msg.contains(w)) {
                Some("person")
            } else {
                None
            };
            if let Some(kind) = detection {
                args.entry("type".to_string()).or_insert_with(|| kind.to_string());
            }
        }
    }

    fn extract_homeassistant(msg: &str, args: &mut HashMap<String, String>) {
        for (key, room_id) in ROOM_NAMES {
            if msg.contains(key) {
                args.entry("room".to_string()).or_insert_with(|| room_id.to_string());

                // デバイス種別が分かればentity_idまで組み立てる
                let entity = if ["light", "lamp", "licht", "lampe", "beleuchtung"]
                    .iter()
                    .any(|w| msg.contains(w))
                {
                    Some(format!("light.{}", room_id))
                } else if ["temperature", "temperatur", "temp"].iter().any(|w| msg.contains(w)) {
                    Some(format!("sensor.{}_temperature", room_id))
                } else if ["outlet", "plug", "steckdose", "schalter"].iter().any(|w| msg.contains(w)) {
                    Some(format!("switch.{}", room_id))
                } else {
                    None
                };
                if let Some(entity_id) = entity {
                    args.entry("entity-id".to_string()).or_insert(entity_id);
                }
                break;
            }
        }
    }

    fn extract_proxmox(msg: &str, action: Option<&str>, args: &mut HashMap<String, String>) {
        let vmid_re = Regex::new(r"(?i)\b(?:vm|container|lxc|ct)\s*(\d{3,4})\b").unwrap();
        if let Some(cap) = vmid_re.captures(msg) {
            args.entry("vmid".to_string()).or_insert_with(|| cap[1].to_string());
        } else if matches!(action, Some("start" | "stop" | "shutdown" | "reboot" | "status")) {
            // VMIDが必要なアクションは裸の数字も試す
            let bare_re = Regex::new(r"\b(\d{3,4})\b").unwrap();
            if let Some(cap) = bare_re.captures(msg) {
                args.entry("vmid".to_string()).or_insert_with(|| cap[1].to_string());
            }
        }
    }

    fn extract_pihole(msg: &str, args: &mut HashMap<String, String>) {
        let domain_re =
            Regex::new(r"(?i)\b([\w-]+(?:\.[\w-]+)*\.(?:com|de|org|net|io|dev|co|me))\b").unwrap();
        if let Some(cap) = domain_re.captures(msg) {
            args.entry("domain".to_string()).or_insert_with(|| cap[1].to_string());
        }
    }

    /// 時間範囲を正準形（"24h", "2d"など）で抽出
    fn extract_time_range(msg: &str) -> Option<String> {
        let patterns: [(&str, &str); 6] = [
            // "last 24h", "letzten 2 stunden"
            (r"(?i)(?:last|letzt(?:e|en|er))\s+(\d+)\s*(?:h|hours?|stunden?)", "hours"),
            (r"(?i)(?:last|letzt(?:e|en|er))\s+(\d+)\s*(?:m|min(?:utes|uten)?)", "minutes"),
            (r"(?i)(?:last|letzt(?:e|en|er))\s+(\d+)\s*(?:d|days?|tage?)", "days"),
            (r"(?i)\b(?:today|heute)\b", "today"),
            (r"(?i)\b(?:yesterday|gestern)\b", "yesterday"),
            (r"(?i)(?:last|letzt(?:e|en|er))\s+(?:hour|stunde)", "1hour"),
        ];

        for (pattern, unit) in patterns {
            let re = Regex::new(pattern).unwrap();
            if let Some(cap) = re.captures(msg) {
                let value = match unit {
                    "hours" => format!("{}h", &cap[1]),
                    "minutes" => format!("{}m", &cap[1]),
                    "days" => format!("{}d", &cap[1]),
                    "today" => "24h".to_string(),
                    "yesterday" => "48h".to_string(),
                    "1hour" => "1h".to_string(),
                    _ => continue,
                };
                return Some(value);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::loader::{ActionSpec, ParamSpec, SkillMetadata};
    use std::path::PathBuf;

    #[test]
    fn test_kitchen_light_binding() {
        let args = ArgExtractor::extract("turn on the light in the kitchen", "homeassistant", Some("turn-on"));
        assert_eq!(args.get("room").map(String::as_str), Some("kitchen"));
        assert_eq!(args.get("entity-id").map(String::as_str), Some("light.kitchen"));
    }

    #[test]
    fn test_german_alias_maps_to_same_room() {
        let args = ArgExtractor::extract("mach das licht in der küche an", "homeassistant", None);
        assert_eq!(args.get("room").map(String::as_str), Some("kitchen"));
    }

    #[test]
    fn test_camera_name_extraction() {
        let args = ArgExtractor::extract("was war an der einfahrt los?", "unifi-protect", Some("events"));
        assert_eq!(args.get("camera").map(String::as_str), Some("Driveway"));
    }

    #[test]
    fn test_detection_type_only_for_detections_action() {
        let args = ArgExtractor::extract("any person on the driveway?", "unifi-protect", Some("detections"));
        assert_eq!(args.get("type").map(String::as_str), Some("person"));

        let args = ArgExtractor::extract("any person on the driveway?", "unifi-protect", Some("events"));
        assert!(args.get("type").is_none());
    }

    #[test]
    fn test_vmid_extraction() {
        let args = ArgExtractor::extract("restart vm 103", "proxmox", Some("reboot"));
        assert_eq!(args.get("vmid").map(String::as_str), Some("103"));

        // 裸の数字はVMIDが必要なアクションでのみ
        let args = ArgExtractor::extract("start 204", "proxmox", Some("start"));
        assert_eq!(args.get("vmid").map(String::as_str), Some("204"));

        let args = ArgExtractor::extract("show me 204 things", "proxmox", Some("vms"));
        assert!(args.get("vmid").is_none());
    }

    #[test]
    fn test_time_range_canonical_forms() {
        let args = ArgExtractor::extract("events from the last 24h", "unifi-protect", Some("events"));
        assert_eq!(args.get("last").map(String::as_str), Some("24h"));

        let args = ArgExtractor::extract("was war gestern?", "unifi-protect", Some("events"));
        assert_eq!(args.get("last").map(String::as_str), Some("48h"));

        let args = ArgExtractor::extract("letzten 2 stunden", "unifi-protect", Some("events"));
        assert_eq!(args.get("last").map(String::as_str), Some("2h"));
    }

    #[test]
    fn test_domain_extraction() {
        let args = ArgExtractor::extract("block doubleclick.net please", "pihole", Some("block"));
        assert_eq!(args.get("domain").map(String::as_str), Some("doubleclick.net"));
    }

    #[test]
    fn test_first_match_wins_no_overwrite() {
        // "garden"はカメラ名テーブルで先にマッチし、後続が上書きしない
        let args = ArgExtractor::extract("show the garden and the garage", "unifi-protect", None);
        assert_eq!(args.get("camera").map(String::as_str), Some("Garden"));
    }

    #[test]
    fn test_unknown_skill_yields_only_cross_cutting_args() {
        let args = ArgExtractor::extract("something from the last 3 days", "unknown-skill", None);
        assert_eq!(args.len(), 1);
        assert_eq!(args.get("last").map(String::as_str), Some("3d"));
    }

    fn skill_with_params(params: &[&str]) -> crate::skills::Skill {
        crate::skills::Skill {
            metadata: SkillMetadata {
                name: "homeassistant".to_string(),
                description: String::new(),
                version: "1.0.0".to_string(),
                triggers: Vec::new(),
                intent_hints: Vec::new(),
                admin_actions: Vec::new(),
                summarize: false,
            },
            actions: vec![ActionSpec {
                name: "turn-on".to_string(),
                description: String::new(),
                parameters: params
                    .iter()
                    .map(|p| ParamSpec {
                        name: p.to_string(),
                        help_text: String::new(),
                        type_hint: "str".to_string(),
                    })
                    .collect(),
            }],
            script_path: None,
            path: PathBuf::new(),
        }
    }

    #[test]
    fn test_satisfies_with_bound_parameter() {
        let skill = skill_with_params(&["entity-id"]);
        let args = ArgExtractor::extract("turn on the kitchen light", "homeassistant", Some("turn-on"));
        assert!(ArgExtractor::satisfies(&args, &skill, "turn-on"));
    }

    #[test]
    fn test_unsatisfied_parameters_demote() {
        let skill = skill_with_params(&["entity-id"]);
        // 部屋もデバイスも含まれない → 束縛ゼロ → 降格
        let args = ArgExtractor::extract("turn it on", "homeassistant", Some("turn-on"));
        assert!(!ArgExtractor::satisfies(&args, &skill, "turn-on"));
    }

    #[test]
    fn test_parameterless_action_always_satisfied() {
        let skill = skill_with_params(&[]);
        let args = HashMap::new();
        assert!(ArgExtractor::satisfies(&args, &skill, "turn-on"));
    }
}
