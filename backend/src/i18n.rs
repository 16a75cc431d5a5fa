/*
Simple i18n helper for user-visible notices and validation messages.

This module provides:
- A tiny embedded translations store for KO/EN (compile-time embedded JSON).
- A simple `tr` function to lookup translations by key + optional params.

Usage:
    use crate::i18n;
    let msg = i18n::tr(None, "tracking.started", None);
    let msg_with = i18n::tr(Some("en"), "schedule.send_failed", Some(&[("err", "offline")]));

Notes:
- Placeholders in translation strings use single-brace format: `{name}`.
- Default language is `ko`. If a key is missing for the requested language,
  the fallback language will be used.
*/

use std::collections::HashMap;
use std::sync::OnceLock;

pub const DEFAULT_LANG: &str = "ko";

static TRANSLATIONS: OnceLock<HashMap<String, HashMap<String, String>>> = OnceLock::new();

const KO_JSON: &str = r#"
{
  "tracking.started": "추적 시작",
  "tracking.stopped": "추적 중단",
  "tracking.auto_stopped": "화면을 벗어나 추적을 중단했습니다",
  "tracking.already_active": "이미 추적 중입니다",
  "tracking.passphrase_required": "상대방 암호를 입력하세요",
  "tracking.subscription_lost": "상대방 위치 수신이 끊어졌습니다",
  "tracking.screen_closed": "위치 화면이 닫혔습니다. 다시 열어 주세요",
  "backend.write_failed": "서버 저장 실패: {err}",
  "location.invalid_coordinates": "좌표 값이 올바르지 않습니다",
  "schedule.missing_partner": "상대방 암호코드를 입력하세요",
  "schedule.empty_title": "일정 제목을 입력하세요",
  "schedule.missing_date": "날짜를 선택하세요",
  "schedule.invalid_date": "날짜 형식이 올바르지 않습니다 (YYYY-MM-DD)",
  "schedule.invalid_time": "시간 형식이 올바르지 않습니다 (HH:MM)",
  "schedule.past_date_time": "⚠️ 과거 날짜/시간은 등록할 수 없습니다",
  "schedule.sent": "✅ 일정이 공유되었습니다!",
  "schedule.send_failed": "❌ 전송 실패: {err}",
  "schedule.already_sending": "일정을 전송하는 중입니다",
  "my_key.not_set": "내 암호키가 아직 설정되지 않았습니다",
  "my_key.passphrase_required": "내 암호를 입력하세요"
}
"#;

const EN_JSON: &str = r#"
{
  "tracking.started": "Tracking started",
  "tracking.stopped": "Tracking stopped",
  "tracking.auto_stopped": "Tracking stopped because the screen left the foreground",
  "tracking.already_active": "Tracking is already active",
  "tracking.passphrase_required": "Enter your partner's passphrase",
  "tracking.subscription_lost": "Lost the connection to your partner's location",
  "tracking.screen_closed": "The location screen was closed; open it again",
  "backend.write_failed": "Failed to save to server: {err}",
  "location.invalid_coordinates": "Coordinates are out of range",
  "schedule.missing_partner": "Enter your partner's code",
  "schedule.empty_title": "Enter a schedule title",
  "schedule.missing_date": "Pick a date",
  "schedule.invalid_date": "Invalid date format (YYYY-MM-DD)",
  "schedule.invalid_time": "Invalid time format (HH:MM)",
  "schedule.past_date_time": "⚠️ Past dates and times cannot be scheduled",
  "schedule.sent": "✅ Schedule shared!",
  "schedule.send_failed": "❌ Failed to send: {err}",
  "schedule.already_sending": "A schedule is already being sent",
  "my_key.not_set": "Your key has not been set yet",
  "my_key.passphrase_required": "Enter your passphrase"
}
"#;

/// Initialize translations map (lazy).
fn build_translations() -> HashMap<String, HashMap<String, String>> {
    let mut out: HashMap<String, HashMap<String, String>> = HashMap::new();

    // Parse KO
    let ko_map: HashMap<String, String> = serde_json::from_str(KO_JSON).unwrap_or_else(|e| {
        panic!("failed to parse KO_JSON in i18n module: {}", e);
    });
    out.insert("ko".to_string(), ko_map);

    // Parse EN
    let en_map: HashMap<String, String> = serde_json::from_str(EN_JSON).unwrap_or_else(|e| {
        panic!("failed to parse EN_JSON in i18n module: {}", e);
    });
    out.insert("en".to_string(), en_map);

    out
}

/// Returns the global translations map (lang -> (key -> message)).
fn translations() -> &'static HashMap<String, HashMap<String, String>> {
    TRANSLATIONS.get_or_init(build_translations)
}

/// Normalize a language tag into a short, lowercase code (e.g. "ko-KR" -> "ko").
pub fn normalize_language(lang: &str) -> String {
    lang.split('-').next().unwrap_or(lang).to_lowercase()
}

/// Returns true if the given language code has translations ("ko", "en").
pub fn is_supported_language(lang: &str) -> bool {
    translations().contains_key(lang)
}

/// Translate a key using an explicit language (or default if None).
///
/// - `lang`: optional language code (`"ko"`, `"en"`). If None, DEFAULT_LANG is used.
/// - `key`: translation key (flat string, e.g. "schedule.empty_title").
/// - `params`: optional slice of (name, value) for `{name}` placeholder replacement.
///
/// If no translation is found, the default language value or the key itself is returned.
pub fn tr(lang: Option<&str>, key: &str, params: Option<&[(&str, &str)]>) -> String {
    let map = translations();

    let desired = lang.unwrap_or(DEFAULT_LANG);

    let val = map
        .get(desired)
        .and_then(|m| m.get(key))
        .cloned()
        .or_else(|| map.get(DEFAULT_LANG).and_then(|m| m.get(key)).cloned())
        .unwrap_or_else(|| key.to_string());

    if let Some(params) = params {
        let mut s = val;
        for (k, v) in params {
            s = s.replace(&format!("{{{}}}", k), v);
        }
        s
    } else {
        val
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_tables_are_valid_json() {
        let ko: HashMap<String, String> = serde_json::from_str(KO_JSON).unwrap();
        let en: HashMap<String, String> = serde_json::from_str(EN_JSON).unwrap();
        assert_eq!(ko.len(), en.len());
    }

    #[test]
    fn test_tr_basic() {
        assert_eq!(tr(Some("ko"), "tracking.started", None), "추적 시작");
        assert_eq!(tr(Some("en"), "tracking.stopped", None), "Tracking stopped");
    }

    #[test]
    fn test_tr_with_params() {
        let s = tr(None, "schedule.send_failed", Some(&[("err", "network down")]));
        assert!(s.contains("network down"));
        assert!(s.starts_with("❌"));
    }

    #[test]
    fn test_fallback_to_default() {
        // Unknown language falls back to default (ko)
        let s = tr(Some("fr"), "schedule.empty_title", None);
        assert_eq!(s, "일정 제목을 입력하세요");
    }

    #[test]
    fn missing_key_returns_key() {
        let k = "non.existent.key";
        assert_eq!(tr(None, k, None), k.to_string());
    }

    #[test]
    fn every_ko_key_has_an_en_translation() {
        let map = translations();
        let ko = map.get("ko").unwrap();
        let en = map.get("en").unwrap();
        for key in ko.keys() {
            assert!(en.contains_key(key), "missing en translation for {}", key);
        }
    }

    #[test]
    fn test_normalize_language() {
        assert_eq!(normalize_language("ko-KR"), "ko");
        assert_eq!(normalize_language("EN-us"), "en");
        assert!(is_supported_language("ko"));
        assert!(!is_supported_language("ru"));
    }
}
