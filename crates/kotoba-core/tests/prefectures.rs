//! Listing all 47 prefectures with their capitals through the JSON grammar.

use kotoba_core::{EngineConfig, GenerationSession, ScriptedSource, SessionState};
use serde_json::Value;

const PREFECTURES: [(&str, &str); 47] = [
    ("北海道", "札幌市"),
    ("青森県", "青森市"),
    ("岩手県", "盛岡市"),
    ("宮城県", "仙台市"),
    ("秋田県", "秋田市"),
    ("山形県", "山形市"),
    ("福島県", "福島市"),
    ("茨城県", "水戸市"),
    ("栃木県", "宇都宮市"),
    ("群馬県", "前橋市"),
    ("埼玉県", "さいたま市"),
    ("千葉県", "千葉市"),
    ("東京都", "新宿区"),
    ("神奈川県", "横浜市"),
    ("新潟県", "新潟市"),
    ("富山県", "富山市"),
    ("石川県", "金沢市"),
    ("福井県", "福井市"),
    ("山梨県", "甲府市"),
    ("長野県", "長野市"),
    ("岐阜県", "岐阜市"),
    ("静岡県", "静岡市"),
    ("愛知県", "名古屋市"),
    ("三重県", "津市"),
    ("滋賀県", "大津市"),
    ("京都府", "京都市"),
    ("大阪府", "大阪市"),
    ("兵庫県", "神戸市"),
    ("奈良県", "奈良市"),
    ("和歌山県", "和歌山市"),
    ("鳥取県", "鳥取市"),
    ("島根県", "松江市"),
    ("岡山県", "岡山市"),
    ("広島県", "広島市"),
    ("山口県", "山口市"),
    ("徳島県", "徳島市"),
    ("香川県", "高松市"),
    ("愛媛県", "松山市"),
    ("高知県", "高知市"),
    ("福岡県", "福岡市"),
    ("佐賀県", "佐賀市"),
    ("長崎県", "長崎市"),
    ("熊本県", "熊本市"),
    ("大分県", "大分市"),
    ("宮崎県", "宮崎市"),
    ("鹿児島県", "鹿児島市"),
    ("沖縄県", "那覇市"),
];

const PROMPT: &str = "日本の都道府県とその県庁所在地を JSON の配列で答えてください。";

fn expected_json() -> String {
    let entries: Vec<String> = PREFECTURES
        .iter()
        .map(|(p, c)| format!(r#"{{"prefecture": "{p}", "capital": "{c}"}}"#))
        .collect();
    format!("[\n{}\n]", entries.join(",\n"))
}

fn source(script: &str) -> ScriptedSource {
    // ASCII structure gets multi-byte pieces; Japanese text stays one token
    // per byte, so code points are split across steps.
    ScriptedSource::new(4096)
        .with_pieces(["[\n", "{\"", "prefecture", "capital", "\": \"", "\", \"", "\"}", ",\n", "\n]"])
        .with_text(script)
}

fn prefectures_session(script: &str) -> GenerationSession<ScriptedSource> {
    let config = EngineConfig {
        add_bos: false,
        ..EngineConfig::japanese_prefectures()
    };
    GenerationSession::initialize(source(script), config).unwrap()
}

#[test]
fn lists_all_47_prefectures_as_json() {
    let mut s = prefectures_session(&expected_json());
    let text = s.send(PROMPT).unwrap().collect_text().unwrap();
    assert_eq!(s.state(), SessionState::Idle);

    let value: Value = serde_json::from_str(&text).unwrap();
    let entries = value.as_array().unwrap();
    assert_eq!(entries.len(), 47);
    for (entry, (prefecture, capital)) in entries.iter().zip(PREFECTURES) {
        let object = entry.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(object["prefecture"], prefecture);
        assert_eq!(object["capital"], capital);
    }
}

#[test]
fn output_stays_valid_when_the_model_wanders_off() {
    // The model tries to append prose after the closing bracket; the grammar
    // only leaves end-of-generation once the array is complete.
    let script = format!("{}\n以上です。", expected_json());
    let mut s = prefectures_session(&script);
    let text = s.send(PROMPT).unwrap().collect_text().unwrap();

    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value.as_array().unwrap().len(), 47);
    assert!(text.ends_with(']'));
}

#[test]
fn a_second_listing_starts_from_a_clean_context() {
    let mut s = prefectures_session(&expected_json());
    let first = s.send(PROMPT).unwrap().collect_text().unwrap();
    let second = s.send(PROMPT).unwrap().collect_text().unwrap();
    assert_eq!(first, second);
    assert_eq!(s.transcript().len(), first.len() * 2);
}
